//! Traits describing the external appointment service and notification sinks.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Error as ReqwestError;
use serde::{Deserialize, Serialize};

use crate::model::{Dose, SearchGroup, Slot};

#[derive(thiserror::Error, Debug)]
/// Failures reported by an availability probe.
pub enum ProbeError {
    /// The registration code was rejected; the group cannot be searched this run.
    #[error("Registration code rejected: {0}")]
    Auth(String),
    /// The service asked us to slow down.
    #[error("Rate limited by the appointment service")]
    RateLimited {
        /// Server-provided hint, if any.
        retry_after: Option<Duration>,
    },
    /// Network hiccup or temporary server failure.
    #[error("Transient error: {0}")]
    Transient(String),
    /// A response the probe cannot interpret; stops the run.
    #[error("Fatal error: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Discriminant of [`ProbeError`], handy for logging and counters.
pub enum ProbeErrorKind {
    /// See [`ProbeError::Auth`].
    Auth,
    /// See [`ProbeError::RateLimited`].
    RateLimited,
    /// See [`ProbeError::Transient`].
    Transient,
    /// See [`ProbeError::Fatal`].
    Fatal,
}

impl ProbeError {
    /// Discriminant without payload.
    #[must_use]
    pub fn kind(&self) -> ProbeErrorKind {
        match self {
            ProbeError::Auth(_) => ProbeErrorKind::Auth,
            ProbeError::RateLimited { .. } => ProbeErrorKind::RateLimited,
            ProbeError::Transient(_) => ProbeErrorKind::Transient,
            ProbeError::Fatal(_) => ProbeErrorKind::Fatal,
        }
    }
}

impl fmt::Display for ProbeErrorKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProbeErrorKind::Auth => "auth",
            ProbeErrorKind::RateLimited => "rate_limited",
            ProbeErrorKind::Transient => "transient",
            ProbeErrorKind::Fatal => "fatal",
        };
        write!(formatter, "{label}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Input for requesting a new registration code.
pub struct CodeRequest {
    /// Postal code of the vaccination center.
    pub postal_code: String,
    /// Birth date of the person to vaccinate.
    pub birth_date: NaiveDate,
    /// Phone number in `+49…` form; receives the SMS pin.
    pub phone: String,
    /// Email address that receives the code.
    pub email: String,
}

#[async_trait]
/// Capability querying the third-party service for open slots.
pub trait AvailabilityProbe: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Look up open slots of one dose ordinal for a search group.
    ///
    /// # Errors
    ///
    /// Returns a [`ProbeError`] describing how the lookup failed.
    async fn check_availability(&self, group: &SearchGroup, dose: Dose)
    -> Result<Vec<Slot>, ProbeError>;

    /// Ask the service to send a registration code.
    ///
    /// Returns `false` when the service declined the request.
    ///
    /// # Errors
    ///
    /// Returns a [`ProbeError`] when the request could not be completed.
    async fn request_registration_code(&self, request: &CodeRequest) -> Result<bool, ProbeError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Supported notification channel types.
pub enum ChannelKind {
    /// Email through a mail relay.
    Email,
    /// Pushover push notifications.
    Pushover,
    /// Telegram bot messages.
    Telegram,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ChannelKind::Email => "email",
            ChannelKind::Pushover => "pushover",
            ChannelKind::Telegram => "telegram",
        };
        write!(formatter, "{label}")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Outcome of the one-time challenge handshake for a channel.
pub enum ValidationState {
    /// Never confirmed by the operator.
    #[default]
    Unvalidated,
    /// Operator echoed the challenge code.
    Validated,
    /// The handshake failed.
    Failed,
}

impl fmt::Display for ValidationState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ValidationState::Unvalidated => "unvalidated",
            ValidationState::Validated => "validated",
            ValidationState::Failed => "failed",
        };
        write!(formatter, "{label}")
    }
}

#[derive(thiserror::Error, Debug)]
/// Errors raised while delivering a notification to one channel.
pub enum NotificationError {
    /// Network layer failed.
    #[error("Network error: {0}")]
    Network(#[from] ReqwestError),
    /// The channel endpoint answered with a non-success status.
    #[error("{channel} rejected the message with status {status}: {body}")]
    Rejected {
        /// Channel type.
        channel: ChannelKind,
        /// HTTP status code.
        status: u16,
        /// Response body for diagnostics.
        body: String,
    },
    /// The channel kept rate limiting us.
    #[error("{0} rate limit exceeded")]
    RateLimited(ChannelKind),
    /// Channel skipped because it has not passed validation.
    #[error("{channel} channel skipped: {state}")]
    NotValidated {
        /// Channel type.
        channel: ChannelKind,
        /// Current validation state.
        state: ValidationState,
    },
    /// Credentials are missing or malformed.
    #[error("Invalid {channel} configuration: {reason}")]
    InvalidConfig {
        /// Channel type.
        channel: ChannelKind,
        /// What is wrong.
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Text message handed to notification sinks.
pub struct Message {
    /// Short headline.
    pub title: String,
    /// Body text.
    pub body: String,
}

impl Message {
    /// Build a message from title and body.
    #[must_use]
    pub fn new<T: Into<String>, B: Into<String>>(title: T, body: B) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
        }
    }
}

#[async_trait]
/// Trait for channel-specific message delivery backends.
pub trait NotificationSink: Send + Sync {
    /// Channel type handled by this sink.
    fn kind(&self) -> ChannelKind;

    /// Human-friendly destination (masked where credentials are involved).
    fn destination(&self) -> String;

    /// Deliver one message.
    ///
    /// # Errors
    ///
    /// Returns a [`NotificationError`] when delivery fails.
    async fn send(&self, message: &Message) -> Result<(), NotificationError>;
}
