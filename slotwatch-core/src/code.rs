//! One-shot registration code request.

use chrono::NaiveDate;
use tracing::{info, warn};

use crate::model::normalize_phone;
use crate::ports::{AvailabilityProbe, CodeRequest, ProbeError};

/// Format of birth dates entered by the operator.
pub const BIRTH_DATE_FORMAT: &str = "%d.%m.%Y";

#[derive(thiserror::Error, Debug)]
/// Reasons a code request could not be built.
pub enum CodeRequestError {
    /// The birth date does not follow `DD.MM.YYYY`.
    #[error("Birth date must look like DD.MM.YYYY, got {0:?}")]
    BirthDate(String),
    /// A required field is empty.
    #[error("Missing {0} for the code request")]
    Missing(&'static str),
}

impl CodeRequest {
    /// Build a request from raw operator input.
    ///
    /// # Errors
    ///
    /// Returns a [`CodeRequestError`] for an empty field or a malformed birth date.
    pub fn parse(
        postal_code: &str,
        birth_date: &str,
        phone: &str,
        email: &str,
    ) -> Result<Self, CodeRequestError> {
        let postal_code = postal_code.trim();
        if postal_code.is_empty() {
            return Err(CodeRequestError::Missing("center postal code"));
        }
        if phone.trim().is_empty() {
            return Err(CodeRequestError::Missing("phone number"));
        }
        let email = email.trim();
        if email.is_empty() {
            return Err(CodeRequestError::Missing("email address"));
        }
        let birth_date = NaiveDate::parse_from_str(birth_date.trim(), BIRTH_DATE_FORMAT)
            .map_err(|_err| CodeRequestError::BirthDate(birth_date.to_owned()))?;

        Ok(Self {
            postal_code: postal_code.to_owned(),
            birth_date,
            phone: normalize_phone(phone),
            email: email.to_owned(),
        })
    }
}

#[derive(Debug)]
/// Final state of a code request.
pub enum CodeRequestOutcome {
    /// The service accepted the request; the code arrives by mail.
    Sent,
    /// The service answered but declined the request.
    Declined,
    /// The request failed; the error is passed through unchanged.
    Failed(ProbeError),
}

impl CodeRequestOutcome {
    /// True for [`CodeRequestOutcome::Sent`].
    #[must_use]
    pub fn is_sent(&self) -> bool {
        matches!(self, CodeRequestOutcome::Sent)
    }
}

/// Single attempt at requesting a registration code; never retried.
pub struct CodeRequestFlow {
    request: CodeRequest,
}

impl CodeRequestFlow {
    /// Prepare a flow for `request`.
    #[must_use]
    pub fn new(request: CodeRequest) -> Self {
        Self { request }
    }

    /// Request being submitted.
    #[must_use]
    pub fn request(&self) -> &CodeRequest {
        &self.request
    }

    /// Submit the request once through `probe`.
    pub async fn run(self, probe: &dyn AvailabilityProbe) -> CodeRequestOutcome {
        info!(
            probe = probe.name(),
            center = %self.request.postal_code,
            "Requesting registration code"
        );
        match probe.request_registration_code(&self.request).await {
            Ok(true) => {
                info!(email = %self.request.email, "Registration code requested, check your inbox");
                CodeRequestOutcome::Sent
            }
            Ok(false) => {
                warn!(center = %self.request.postal_code, "Appointment service declined the code request");
                CodeRequestOutcome::Declined
            }
            Err(err) => {
                warn!(kind = %err.kind(), error = %err, "Code request failed");
                CodeRequestOutcome::Failed(err)
            }
        }
    }
}
