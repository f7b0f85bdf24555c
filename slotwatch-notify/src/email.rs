//! Email delivery through an HTTP mail relay.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::debug;

use slotwatch_core::{
    notify::EmailConfig,
    ports::{ChannelKind, Message, NotificationError, NotificationSink},
};

#[derive(Serialize)]
struct RelayMail<'msg> {
    to: &'msg str,
    subject: &'msg str,
    text: &'msg str,
}

/// Posts messages as JSON to a mail relay which forwards them to the recipient.
pub struct EmailSink {
    client: Client,
    config: EmailConfig,
}

impl EmailSink {
    /// Create a sink for the configured relay.
    #[must_use]
    pub fn new(client: Client, config: EmailConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl NotificationSink for EmailSink {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Email
    }

    fn destination(&self) -> String {
        self.config.recipient.clone()
    }

    async fn send(&self, message: &Message) -> Result<(), NotificationError> {
        if self.config.recipient.trim().is_empty() {
            return Err(NotificationError::InvalidConfig {
                channel: ChannelKind::Email,
                reason: "recipient is empty".to_owned(),
            });
        }

        let mail = RelayMail {
            to: &self.config.recipient,
            subject: &message.title,
            text: &message.body,
        };
        let mut req = self.client.post(&self.config.endpoint).json(&mail);
        if let Some(token) = &self.config.token {
            req = req.bearer_auth(token);
        }

        let response = req.send().await?;
        if !response.status().is_success() {
            return Err(crate::rejected(ChannelKind::Email, response).await);
        }

        debug!(recipient = %self.config.recipient, "Mail handed to relay");
        Ok(())
    }
}
