//! Telegram Bot API (`POST /bot<token>/sendMessage`).
//!
//! A 429 answer carries `parameters.retry_after` in its body; the sink waits
//! that long and tries again a bounded number of times.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use slotwatch_core::{
    notify::{TelegramConfig, mask},
    ports::{ChannelKind, Message, NotificationError, NotificationSink},
};

const API_BASE: &str = "https://api.telegram.org";

/// Maximum number of attempts while rate limited.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// `sendMessage` text limit in characters.
const MESSAGE_LIMIT: usize = 4096;

#[derive(Serialize)]
struct SendMessage<'msg> {
    chat_id: &'msg str,
    text: String,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    parameters: Option<ErrorParameters>,
}

#[derive(Deserialize)]
struct ErrorParameters {
    retry_after: Option<u64>,
}

/// Sends messages to one chat through a Telegram bot.
pub struct TelegramSink {
    client: Client,
    config: TelegramConfig,
    base_url: String,
}

impl TelegramSink {
    /// Create a sink talking to the public Bot API.
    #[must_use]
    pub fn new(client: Client, config: TelegramConfig) -> Self {
        Self::with_base_url(client, config, API_BASE)
    }

    /// Create a sink against a different Bot API host.
    #[must_use]
    pub fn with_base_url<U: Into<String>>(client: Client, config: TelegramConfig, base_url: U) -> Self {
        Self {
            client,
            config,
            base_url: base_url.into(),
        }
    }

    fn text(message: &Message) -> String {
        truncate(&format!("{}\n\n{}", message.title, message.body), MESSAGE_LIMIT)
    }
}

#[async_trait]
impl NotificationSink for TelegramSink {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Telegram
    }

    fn destination(&self) -> String {
        format!("chat {}", mask(&self.config.chat_id))
    }

    async fn send(&self, message: &Message) -> Result<(), NotificationError> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.config.api_token);
        let payload = SendMessage {
            chat_id: &self.config.chat_id,
            text: Self::text(message),
        };
        let mut attempts = 0;

        loop {
            attempts += 1;
            let response = self.client.post(&url).json(&payload).send().await?;
            let status = response.status();

            if status.is_success() {
                debug!(destination = %self.destination(), "Telegram message accepted");
                return Ok(());
            }

            if status != StatusCode::TOO_MANY_REQUESTS {
                return Err(crate::rejected(ChannelKind::Telegram, response).await);
            }

            let body: ErrorBody = response.json().await.unwrap_or_default();
            let retry_after = body
                .parameters
                .and_then(|parameters| parameters.retry_after)
                .map(Duration::from_secs);

            if attempts >= MAX_RATE_LIMIT_RETRIES {
                warn!(attempts, ?retry_after, "Telegram rate limit persists, giving up");
                return Err(NotificationError::RateLimited(ChannelKind::Telegram));
            }

            let wait = retry_after.unwrap_or(Duration::from_secs(1));
            debug!(?wait, attempt = attempts, "Telegram rate limited, waiting");
            tokio::time::sleep(wait).await;
        }
    }
}

fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_owned();
    }
    let suffix = "\n\n[truncated]";
    let budget = limit - suffix.len();
    let kept: String = text.chars().take(budget).collect();
    format!("{kept}{suffix}")
}
