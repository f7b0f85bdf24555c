use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use reqwest::Client;
use slotwatch_core::{
    code::{CodeRequestFlow, CodeRequestOutcome},
    config::{ConfigError, ContactFile},
    engine::{EngineSettings, PollingEngine},
    notify::{ChannelSettings, HandshakeError, issue_challenge},
    ports::{CodeRequest, ValidationState},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cli::{CodeArgs, SearchArgs, VerifyArgs};

fn load(path: &Path) -> Result<ContactFile> {
    let file = ContactFile::load(path)
        .context("Create the contact file first or pass another one with -f")?;
    info!(path = %path.display(), "Contact file loaded");
    Ok(file)
}

fn save(file: &ContactFile, path: &Path) -> Result<(), ConfigError> {
    file.save(path)?;
    info!(path = %path.display(), "Contact file updated");
    Ok(())
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Interrupted, stopping after the current step"),
            Err(err) => error!(error = %err, "Cannot listen for Ctrl-C"),
        }
        token.cancel();
    });
}

pub(crate) async fn search(client: Client, args: SearchArgs) -> Result<()> {
    let file = load(&args.file.path)?;
    let profile = Arc::new(file.profile()?);
    let window = file.window()?;

    let dispatcher = slotwatch_notify::dispatcher(&client, file.channels());
    if dispatcher.is_empty() {
        warn!("No notification channel configured, matches are only logged");
    }

    let settings = EngineSettings::new(Duration::from_secs(args.retry_sec))
        .with_concurrency(args.concurrency);
    let engine = PollingEngine::new(
        profile,
        window,
        slotwatch_provider_its::probe(client),
        Arc::new(dispatcher),
        settings,
    );

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());
    engine.run(cancel).await.context("Slot search aborted")
}

pub(crate) async fn code(client: Client, args: CodeArgs) -> Result<()> {
    let file = load(&args.file.path)?;
    file.validate()?;

    let postal_code = file.primary_center().unwrap_or_default();
    let contact = &file.contact;
    let request = CodeRequest::parse(
        postal_code,
        &args.birth_date,
        contact.phone.as_deref().unwrap_or_default(),
        contact.email.as_deref().unwrap_or_default(),
    )?;
    let flow = CodeRequestFlow::new(request);
    info!(
        postal_code = %flow.request().postal_code,
        email = %flow.request().email,
        "Requesting registration code"
    );

    let probe = slotwatch_provider_its::probe(client);
    match flow.run(probe.as_ref()).await {
        CodeRequestOutcome::Sent => {
            info!("Registration code requested, check your mailbox");
            Ok(())
        }
        CodeRequestOutcome::Declined => bail!("The appointment service declined the code request"),
        CodeRequestOutcome::Failed(err) => Err(err).context("Code request failed"),
    }
}

pub(crate) async fn verify(client: Client, args: VerifyArgs) -> Result<()> {
    let path = &args.file.path;
    let mut file = load(path)?;

    let pending: Vec<ChannelSettings> = file
        .channels()
        .into_iter()
        .filter(|settings| settings.state != ValidationState::Validated)
        .collect();
    if pending.is_empty() {
        info!("Every configured channel is already validated");
        return Ok(());
    }

    for settings in pending {
        let kind = settings.config.kind();
        let sink = slotwatch_notify::sink(client.clone(), &settings.config);

        let challenge = match issue_challenge(sink.as_ref(), settings.config.clone()).await {
            Ok(challenge) => challenge,
            Err(err) => {
                warn!(channel = %kind, error = %err, "Channel could not be reached");
                file.set_channel(ChannelSettings {
                    config: settings.config,
                    state: ValidationState::Failed,
                });
                save(&file, path)?;
                continue;
            }
        };

        let input = prompt(&format!("Code sent via {kind} ({}): ", sink.destination())).await?;
        match challenge.confirm(&input) {
            Ok(validated) => file.set_channel(validated),
            Err(HandshakeError::Mismatch) => {
                warn!(channel = %kind, "Wrong code, enter the channel credentials again");
                file.remove_channel(kind);
            }
            Err(err) => return Err(err.into()),
        }
        save(&file, path)?;
    }

    Ok(())
}

/// Ask on stdout and read one line from stdin without blocking the runtime.
async fn prompt(question: &str) -> Result<String> {
    let question = question.to_owned();
    tokio::task::spawn_blocking(move || -> io::Result<String> {
        let mut stdout = io::stdout().lock();
        write!(stdout, "{question}")?;
        stdout.flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(line)
    })
    .await
    .context("Prompt task failed")?
    .context("Cannot read from the terminal")
}
