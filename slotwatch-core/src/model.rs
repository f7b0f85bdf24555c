//! Domain data structures for search groups, contact profiles, and appointment slots.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
/// Registration code issued by the appointment service for one search group.
pub struct RegistrationCode(pub String);

impl fmt::Display for RegistrationCode {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// One or more vaccination center postal codes sharing a registration code.
pub struct SearchGroup {
    code: RegistrationCode,
    postal_codes: Vec<String>,
}

impl SearchGroup {
    /// Build a group, dropping duplicate postal codes while keeping first-seen order.
    #[must_use]
    pub fn new<C, I, P>(code: C, postal_codes: I) -> Self
    where
        C: Into<String>,
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for postal_code in postal_codes {
            let postal_code = postal_code.into().trim().to_owned();
            if !postal_code.is_empty() && !unique.contains(&postal_code) {
                unique.push(postal_code);
            }
        }
        Self {
            code: RegistrationCode(code.into().trim().to_owned()),
            postal_codes: unique,
        }
    }

    /// Registration code identifying this group for the run.
    #[must_use]
    pub fn code(&self) -> &RegistrationCode {
        &self.code
    }

    /// Postal codes in display order.
    #[must_use]
    pub fn postal_codes(&self) -> &[String] {
        &self.postal_codes
    }

    /// Order-insensitive membership check.
    #[must_use]
    pub fn contains(&self, postal_code: &str) -> bool {
        self.postal_codes.iter().any(|candidate| candidate == postal_code.trim())
    }

    /// Stable identity used for fingerprints and per-group state.
    #[must_use]
    pub fn id(&self) -> GroupId {
        GroupId(self.code.0.clone())
    }
}

impl PartialEq for SearchGroup {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
            && self.postal_codes.len() == other.postal_codes.len()
            && self.postal_codes.iter().all(|postal_code| other.contains(postal_code))
    }
}

impl Eq for SearchGroup {}

impl fmt::Display for SearchGroup {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{} ({})", self.code, self.postal_codes.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
/// Identifier of a search group within one polling run.
pub struct GroupId(pub String);

impl fmt::Display for GroupId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
/// Which vaccination appointment a slot belongs to.
pub enum Dose {
    /// First appointment.
    First,
    /// Second (follow-up) appointment.
    Second,
}

impl Dose {
    /// Probe order within one group.
    pub const ALL: [Dose; 2] = [Dose::First, Dose::Second];
}

impl fmt::Display for Dose {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Dose::First => "first dose",
            Dose::Second => "second dose",
        };
        write!(formatter, "{label}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Candidate appointment returned by an availability probe.
pub struct Slot {
    /// Group whose code found the slot.
    pub group: GroupId,
    /// Center postal code offering the slot.
    pub postal_code: String,
    /// Calendar date of the appointment.
    pub date: NaiveDate,
    /// Start time of the appointment.
    pub time: NaiveTime,
    /// Dose ordinal.
    pub dose: Dose,
}

impl Slot {
    /// Combined start timestamp.
    #[must_use]
    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(self.time)
    }

    /// Identity used to notify at most once per run.
    #[must_use]
    pub fn fingerprint(&self) -> SlotFingerprint {
        SlotFingerprint {
            group: self.group.clone(),
            date: self.date,
            time: self.time,
            dose: self.dose,
        }
    }

    /// Human-readable alert text.
    #[must_use]
    pub fn alert_message(&self) -> String {
        format!(
            "Open {} appointment on {} at {} in center {} (code {})",
            self.dose,
            self.date.format("%a %d.%m.%Y"),
            self.time.format("%H:%M"),
            self.postal_code,
            self.group
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// Derived identity of a slot: group, date, time, and dose.
pub struct SlotFingerprint {
    /// Source group.
    pub group: GroupId,
    /// Appointment date.
    pub date: NaiveDate,
    /// Appointment time.
    pub time: NaiveTime,
    /// Dose ordinal.
    pub dose: Dose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Salutation accepted by the appointment service.
pub enum Salutation {
    /// "Frau".
    Frau,
    /// "Herr".
    Herr,
    /// "Kind".
    Kind,
    /// "Divers".
    Divers,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Personal contact data of the person searching for an appointment.
pub struct Contact {
    /// Salutation, required for searching.
    pub salutation: Option<Salutation>,
    /// Given name.
    pub first_name: String,
    /// Family name.
    pub last_name: String,
    /// Street without house number.
    pub street: String,
    /// House number including additions.
    pub house_number: String,
    /// Home postal code.
    pub postal_code: String,
    /// Home town.
    pub city: String,
    /// Phone number normalized to `+49…`.
    pub phone: String,
    /// Email address receiving service mails.
    pub email: String,
}

impl Contact {
    /// Display name used in status lines.
    #[must_use]
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name).trim().to_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Immutable snapshot of everything a polling run needs to know about the user.
pub struct ContactProfile {
    /// Personal data.
    pub contact: Contact,
    /// Groups in declaration order.
    pub groups: Vec<SearchGroup>,
}

/// Normalize a German phone number to the `+49` form the service expects.
#[must_use]
pub fn normalize_phone(raw: &str) -> String {
    let trimmed: String = raw.chars().filter(|ch| !ch.is_whitespace()).collect();
    if trimmed.starts_with("+49") {
        trimmed
    } else {
        let national = trimmed.strip_prefix('0').unwrap_or(&trimmed);
        format!("+49{national}")
    }
}
