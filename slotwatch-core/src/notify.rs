//! Notification channel settings, the multi-channel dispatcher, and the
//! challenge handshake that validates a channel before it is trusted.

use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::ports::{ChannelKind, Message, NotificationError, NotificationSink, ValidationState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Pushover application token and user key.
pub struct PushoverConfig {
    /// Application API token.
    pub app_token: String,
    /// Receiving user or group key.
    pub user_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Telegram bot token and target chat.
pub struct TelegramConfig {
    /// Bot API token.
    pub api_token: String,
    /// Chat receiving the messages.
    pub chat_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// HTTP mail relay accepting `{to, subject, text}` JSON posts.
pub struct EmailConfig {
    /// Relay endpoint URL.
    pub endpoint: String,
    /// Recipient address.
    pub recipient: String,
    /// Optional bearer token for the relay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Credentials for one notification channel.
pub enum ChannelConfig {
    /// Email relay.
    Email(EmailConfig),
    /// Pushover.
    Pushover(PushoverConfig),
    /// Telegram bot.
    Telegram(TelegramConfig),
}

impl ChannelConfig {
    /// Channel type of these credentials.
    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        match self {
            ChannelConfig::Email(_) => ChannelKind::Email,
            ChannelConfig::Pushover(_) => ChannelKind::Pushover,
            ChannelConfig::Telegram(_) => ChannelKind::Telegram,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Channel credentials plus the handshake outcome recorded at setup time.
pub struct ChannelSettings {
    /// Credentials.
    pub config: ChannelConfig,
    /// Handshake outcome.
    pub state: ValidationState,
}

/// A sink bound into the dispatcher together with its validation state.
pub struct RegisteredChannel {
    /// Validation state from configuration time.
    pub state: ValidationState,
    /// Delivery backend.
    pub sink: Arc<dyn NotificationSink>,
}

impl RegisteredChannel {
    /// Bind a sink with the given validation state.
    #[must_use]
    pub fn new(state: ValidationState, sink: Arc<dyn NotificationSink>) -> Self {
        Self { state, sink }
    }
}

#[derive(Debug)]
/// Result of delivering one message to one channel.
pub struct DeliveryReport {
    /// Channel type.
    pub channel: ChannelKind,
    /// Masked destination.
    pub destination: String,
    /// Delivery outcome.
    pub result: Result<(), NotificationError>,
}

impl DeliveryReport {
    /// Whether the message reached the channel.
    #[must_use]
    pub fn delivered(&self) -> bool {
        self.result.is_ok()
    }
}

/// Sends messages to every registered channel independently.
pub struct NotificationDispatcher {
    channels: Vec<RegisteredChannel>,
}

impl NotificationDispatcher {
    /// Build a dispatcher from the provided channel list.
    #[must_use]
    pub fn new(channels: Vec<RegisteredChannel>) -> Self {
        Self { channels }
    }

    /// Number of registered channels, validated or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// True when no channel is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Deliver `message` to all channels concurrently.
    ///
    /// Channels that are not validated are skipped with a warning. A failure on
    /// one channel never prevents attempts on the others.
    pub async fn send(&self, message: &Message) -> Vec<DeliveryReport> {
        let attempts = self.channels.iter().map(|channel| async move {
            let kind = channel.sink.kind();
            let destination = channel.sink.destination();

            let result = if channel.state == ValidationState::Validated {
                channel.sink.send(message).await
            } else {
                warn!(
                    channel = %kind,
                    state = %channel.state,
                    "Skipping notification channel that has not been validated"
                );
                Err(NotificationError::NotValidated {
                    channel: kind,
                    state: channel.state,
                })
            };

            match &result {
                Ok(()) => info!(channel = %kind, %destination, "Notification delivered"),
                Err(NotificationError::NotValidated { .. }) => {}
                Err(err) => warn!(channel = %kind, %destination, error = %err, "Notification failed"),
            }

            DeliveryReport {
                channel: kind,
                destination,
                result,
            }
        });

        join_all(attempts).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Short numeric code the operator must echo back.
pub struct ChallengeCode(String);

impl ChallengeCode {
    /// Draw a fresh four-digit code.
    #[must_use]
    pub fn generate() -> Self {
        let code: u16 = rand::rng().random_range(1000..=9999);
        Self(code.to_string())
    }

    /// Use a fixed code.
    #[must_use]
    pub fn from_digits<S: Into<String>>(digits: S) -> Self {
        Self(digits.into())
    }

    /// Compare with operator input, ignoring surrounding whitespace.
    #[must_use]
    pub fn matches(&self, input: &str) -> bool {
        self.0 == input.trim()
    }
}

impl fmt::Display for ChallengeCode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

#[derive(thiserror::Error, Debug)]
/// Reasons a channel handshake did not validate the channel.
pub enum HandshakeError {
    /// The challenge could not be delivered.
    #[error("Could not deliver validation code: {0}")]
    Delivery(#[from] NotificationError),
    /// Operator input differed from the challenge; the configuration is discarded.
    #[error("Validation code did not match")]
    Mismatch,
}

/// Channel waiting for the operator to echo the challenge code.
#[derive(Debug)]
pub struct PendingValidation {
    config: ChannelConfig,
    code: ChallengeCode,
}

impl PendingValidation {
    /// Channel type under validation.
    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        self.config.kind()
    }

    /// Finish the handshake.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::Mismatch`] and drops the credentials when the
    /// input differs from the issued code.
    pub fn confirm(self, input: &str) -> Result<ChannelSettings, HandshakeError> {
        if self.code.matches(input) {
            info!(channel = %self.config.kind(), "Notification channel validated");
            Ok(ChannelSettings {
                config: self.config,
                state: ValidationState::Validated,
            })
        } else {
            warn!(channel = %self.config.kind(), "Validation code mismatch, discarding channel configuration");
            Err(HandshakeError::Mismatch)
        }
    }
}

/// Send a random challenge code through `sink`.
///
/// # Errors
///
/// Returns [`HandshakeError::Delivery`] when the code cannot be sent.
pub async fn issue_challenge(
    sink: &dyn NotificationSink,
    config: ChannelConfig,
) -> Result<PendingValidation, HandshakeError> {
    issue_challenge_with(sink, config, ChallengeCode::generate()).await
}

/// Send a specific challenge code through `sink`.
///
/// # Errors
///
/// Returns [`HandshakeError::Delivery`] when the code cannot be sent.
pub async fn issue_challenge_with(
    sink: &dyn NotificationSink,
    config: ChannelConfig,
    code: ChallengeCode,
) -> Result<PendingValidation, HandshakeError> {
    let message = Message::new(
        "slotwatch validation",
        format!("Your validation code is {code}"),
    );
    sink.send(&message).await?;
    info!(channel = %sink.kind(), destination = %sink.destination(), "Validation code sent");
    Ok(PendingValidation { config, code })
}

/// Mask all but the last four characters of a credential.
#[must_use]
pub fn mask(secret: &str) -> String {
    let count = secret.chars().count();
    if count <= 4 {
        return "*".repeat(count);
    }
    let visible: String = secret.chars().skip(count - 4).collect();
    format!("{}{visible}", "*".repeat(count - 4))
}
