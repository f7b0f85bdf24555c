use anyhow::{Context, Result, anyhow};
use tracing_subscriber::EnvFilter;

/// Install the fmt subscriber; `RUST_LOG` wins over `log_level`.
pub(crate) fn init(log_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("invalid log level/filter '{log_level}'"))?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| anyhow!("telemetry error: {err}"))
}
