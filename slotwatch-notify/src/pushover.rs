//! Pushover messages API.

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use slotwatch_core::{
    notify::{PushoverConfig, mask},
    ports::{ChannelKind, Message, NotificationError, NotificationSink},
};

const API_URL: &str = "https://api.pushover.net/1/messages.json";

/// Sends messages through a Pushover application.
pub struct PushoverSink {
    client: Client,
    config: PushoverConfig,
    url: String,
}

impl PushoverSink {
    /// Create a sink talking to the public Pushover API.
    #[must_use]
    pub fn new(client: Client, config: PushoverConfig) -> Self {
        Self::with_url(client, config, API_URL)
    }

    /// Create a sink posting to `url` instead of the public API.
    #[must_use]
    pub fn with_url<U: Into<String>>(client: Client, config: PushoverConfig, url: U) -> Self {
        Self {
            client,
            config,
            url: url.into(),
        }
    }
}

#[async_trait]
impl NotificationSink for PushoverSink {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Pushover
    }

    fn destination(&self) -> String {
        mask(&self.config.user_key)
    }

    async fn send(&self, message: &Message) -> Result<(), NotificationError> {
        let form = [
            ("token", self.config.app_token.as_str()),
            ("user", self.config.user_key.as_str()),
            ("title", message.title.as_str()),
            ("message", message.body.as_str()),
        ];

        let response = self.client.post(&self.url).form(&form).send().await?;
        if !response.status().is_success() {
            return Err(crate::rejected(ChannelKind::Pushover, response).await);
        }

        debug!(destination = %self.destination(), "Pushover message accepted");
        Ok(())
    }
}
