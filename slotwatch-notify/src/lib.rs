//! Notification sinks delivering slot alerts over HTTP.
//!
//! - Pushover messages API
//! - Telegram Bot API
//! - Email through a JSON mail relay

mod email;
mod pushover;
mod telegram;

pub use email::EmailSink;
pub use pushover::PushoverSink;
pub use telegram::TelegramSink;

use std::sync::Arc;

use reqwest::{Client, Response};
use slotwatch_core::{
    notify::{ChannelConfig, ChannelSettings, NotificationDispatcher, RegisteredChannel},
    ports::{ChannelKind, NotificationError, NotificationSink},
};

/// Build the sink matching `config`.
#[must_use]
pub fn sink(client: Client, config: &ChannelConfig) -> Arc<dyn NotificationSink> {
    match config {
        ChannelConfig::Email(config) => Arc::new(EmailSink::new(client, config.clone())),
        ChannelConfig::Pushover(config) => Arc::new(PushoverSink::new(client, config.clone())),
        ChannelConfig::Telegram(config) => Arc::new(TelegramSink::new(client, config.clone())),
    }
}

/// Bind configured channel settings to their sink.
#[must_use]
pub fn channel(client: Client, settings: ChannelSettings) -> RegisteredChannel {
    RegisteredChannel::new(settings.state, sink(client, &settings.config))
}

/// Dispatcher over all configured channels, in the given order.
#[must_use]
pub fn dispatcher<I>(client: &Client, settings: I) -> NotificationDispatcher
where
    I: IntoIterator<Item = ChannelSettings>,
{
    NotificationDispatcher::new(
        settings
            .into_iter()
            .map(|settings| channel(client.clone(), settings))
            .collect(),
    )
}

/// Turn a non-success response into [`NotificationError::Rejected`].
async fn rejected(channel: ChannelKind, response: Response) -> NotificationError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    NotificationError::Rejected {
        channel,
        status,
        body,
    }
}
