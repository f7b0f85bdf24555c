//! Persisted contact file: loading, validation, and conversion into the
//! immutable run inputs.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveTime, Weekday};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::model::{Contact, ContactProfile, Salutation, SearchGroup, normalize_phone};
use crate::notify::{ChannelConfig, ChannelSettings, EmailConfig, PushoverConfig, TelegramConfig};
use crate::ports::{ChannelKind, ValidationState};
use crate::window::{AcceptanceWindow, DoseScope};

/// Default location of the contact file, relative to the working directory.
pub const DEFAULT_CONTACT_FILE: &str = "data/kontaktdaten.json";

const DATE_FORMAT: &str = "%d.%m.%Y";
const TIME_FORMAT: &str = "%H:%M";
const WEEKDAY_NAMES: [(&str, Weekday); 7] = [
    ("Mo", Weekday::Mon),
    ("Di", Weekday::Tue),
    ("Mi", Weekday::Wed),
    ("Do", Weekday::Thu),
    ("Fr", Weekday::Fri),
    ("Sa", Weekday::Sat),
    ("So", Weekday::Sun),
];

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
/// Contact file content that cannot be used.
pub enum ValidationError {
    /// A required value is absent.
    #[error("Missing value: {0}")]
    Missing(String),
    /// A value is present but malformed.
    #[error("Invalid {field}: {reason}")]
    Invalid {
        /// Field path in the contact file.
        field: String,
        /// What is wrong with it.
        reason: String,
    },
}

impl ValidationError {
    fn invalid<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(thiserror::Error, Debug)]
/// Errors raised while reading or writing the contact file.
pub enum ConfigError {
    /// File could not be read or written.
    #[error("Cannot access {path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// File is not valid JSON for the expected shape.
    #[error("Cannot parse {path}: {source}")]
    Json {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },
    /// File parsed but holds invalid values.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Explicit pairing of a registration code with its centers.
pub struct GroupEntry {
    /// Registration code.
    pub code: String,
    /// Center postal codes.
    #[serde(rename = "plz")]
    pub postal_codes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// `kontakt` section.
pub struct ContactEntry {
    /// Salutation.
    #[serde(rename = "anrede", default, skip_serializing_if = "Option::is_none")]
    pub salutation: Option<String>,
    /// Given name.
    #[serde(rename = "vorname", default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    /// Family name.
    #[serde(rename = "nachname", default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    /// Street.
    #[serde(rename = "strasse", default, skip_serializing_if = "Option::is_none")]
    pub street: Option<String>,
    /// House number.
    #[serde(rename = "hausnummer", default, skip_serializing_if = "Option::is_none")]
    pub house_number: Option<String>,
    /// Home postal code.
    #[serde(rename = "plz", default, skip_serializing_if = "Option::is_none")]
    pub postal_code: Option<String>,
    /// Home town.
    #[serde(rename = "ort", default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    /// Phone number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Channel the appointment service itself uses.
    #[serde(rename = "notificationChannel", default, skip_serializing_if = "Option::is_none")]
    pub notification_channel: Option<String>,
    /// Email address.
    #[serde(rename = "notificationReceiver", default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// Channel credentials with their persisted handshake state.
pub struct ChannelEntry<C> {
    /// Credentials.
    #[serde(flatten)]
    pub config: C,
    /// Handshake state; absent means unvalidated.
    #[serde(default)]
    pub status: ValidationState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// `notifications` section. An empty object for a channel means "not configured".
pub struct NotificationsEntry {
    /// Pushover credentials.
    #[serde(default, deserialize_with = "empty_object_as_none", skip_serializing_if = "Option::is_none")]
    pub pushover: Option<ChannelEntry<PushoverConfig>>,
    /// Telegram credentials.
    #[serde(default, deserialize_with = "empty_object_as_none", skip_serializing_if = "Option::is_none")]
    pub telegram: Option<ChannelEntry<TelegramConfig>>,
    /// Email relay credentials.
    #[serde(default, deserialize_with = "empty_object_as_none", skip_serializing_if = "Option::is_none")]
    pub email: Option<ChannelEntry<EmailConfig>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// `zeitrahmen` section; empty means "accept any slot".
pub struct WindowEntry {
    /// `"1"`, `"2"` or `"beide"`.
    #[serde(rename = "einhalten_bei", default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Earliest date, `DD.MM.YYYY`.
    #[serde(rename = "von_datum", default, skip_serializing_if = "Option::is_none")]
    pub from_date: Option<String>,
    /// Latest date, `DD.MM.YYYY`.
    #[serde(rename = "bis_datum", default, skip_serializing_if = "Option::is_none")]
    pub to_date: Option<String>,
    /// Earliest time, `HH:MM`.
    #[serde(rename = "von_uhrzeit", default, skip_serializing_if = "Option::is_none")]
    pub from_time: Option<String>,
    /// Latest time, `HH:MM`.
    #[serde(rename = "bis_uhrzeit", default, skip_serializing_if = "Option::is_none")]
    pub to_time: Option<String>,
    /// Allowed weekdays as `Mo`..`So`.
    #[serde(rename = "wochentage", default, skip_serializing_if = "Option::is_none")]
    pub weekdays: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
/// Whole contact file as persisted on disk.
pub struct ContactFile {
    /// Center postal codes.
    #[serde(rename = "plz_impfzentren", default, skip_serializing_if = "Vec::is_empty")]
    pub center_postal_codes: Vec<String>,
    /// Registration codes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub codes: Vec<String>,
    /// Explicit code/center pairing.
    #[serde(rename = "suchgruppen", default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<GroupEntry>,
    /// Single center postal code of old file versions.
    #[serde(rename = "plz", default, skip_serializing_if = "Option::is_none")]
    pub legacy_postal_code: Option<String>,
    /// Personal data.
    #[serde(rename = "kontakt", default)]
    pub contact: ContactEntry,
    /// Notification channels.
    #[serde(default)]
    pub notifications: NotificationsEntry,
    /// Acceptance window.
    #[serde(rename = "zeitrahmen", default)]
    pub window: WindowEntry,
}

impl ContactFile {
    /// Read and parse a contact file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] or [`ConfigError::Json`] when the file cannot be used.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        Self::from_json(&raw).map_err(|source| ConfigError::Json {
            path: path.to_owned(),
            source,
        })
    }

    /// Parse contact file JSON.
    ///
    /// # Errors
    ///
    /// Returns the JSON error when the document has the wrong shape.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Write the file as pretty JSON, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] or [`ConfigError::Json`] when writing fails.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: path.to_owned(),
            source,
        };
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Json {
            path: path.to_owned(),
            source,
        })?;
        fs::write(path, json).map_err(io_error)
    }

    /// Check every present field for well-formedness.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`] found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for postal_code in self.center_postal_codes.iter().chain(self.legacy_postal_code.iter()) {
            validate_postal_code("plz_impfzentren", postal_code)?;
        }
        for code in &self.codes {
            validate_code(code)?;
        }
        for entry in &self.groups {
            validate_code(&entry.code)?;
            for postal_code in &entry.postal_codes {
                validate_postal_code("suchgruppen.plz", postal_code)?;
            }
        }
        self.validate_contact()?;
        self.window()?;
        Ok(())
    }

    fn validate_contact(&self) -> Result<(), ValidationError> {
        let contact = &self.contact;
        if let Some(salutation) = &contact.salutation {
            parse_salutation(salutation)?;
        }
        if let Some(postal_code) = &contact.postal_code {
            validate_postal_code("kontakt.plz", postal_code)?;
        }
        if let Some(phone) = &contact.phone
            && !normalize_phone(phone).chars().skip(1).all(|ch| ch.is_ascii_digit())
        {
            return Err(ValidationError::invalid("kontakt.phone", "only digits are allowed"));
        }
        if let Some(email) = &contact.email
            && !email.contains('@')
        {
            return Err(ValidationError::invalid("kontakt.notificationReceiver", "not an email address"));
        }
        Ok(())
    }

    /// Derive search groups.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] when codes and centers cannot be paired
    /// or a code appears in more than one group.
    pub fn search_groups(&self) -> Result<Vec<SearchGroup>, ValidationError> {
        let groups: Vec<SearchGroup> = if !self.groups.is_empty() {
            self.groups
                .iter()
                .map(|entry| SearchGroup::new(entry.code.as_str(), entry.postal_codes.iter().map(String::as_str)))
                .collect()
        } else {
            let centers = self.centers();
            match (self.codes.as_slice(), centers.len()) {
                ([], _) => return Err(ValidationError::Missing("codes".to_owned())),
                (_, 0) => return Err(ValidationError::Missing("plz_impfzentren".to_owned())),
                ([code], _) => vec![SearchGroup::new(code.as_str(), centers)],
                (codes, count) if codes.len() == count => codes
                    .iter()
                    .zip(centers)
                    .map(|(code, center)| SearchGroup::new(code.as_str(), [center]))
                    .collect(),
                (codes, count) => {
                    return Err(ValidationError::invalid(
                        "codes",
                        format!(
                            "{} codes cannot be paired with {count} centers; list them under suchgruppen",
                            codes.len()
                        ),
                    ));
                }
            }
        };

        let mut seen = HashSet::new();
        for group in &groups {
            validate_code(&group.code().0)?;
            if group.postal_codes().is_empty() {
                return Err(ValidationError::invalid(
                    "suchgruppen",
                    format!("group {} has no center", group.code()),
                ));
            }
            if !seen.insert(group.code().clone()) {
                return Err(ValidationError::invalid(
                    "codes",
                    format!("{} is used by more than one group", group.code()),
                ));
            }
        }
        Ok(groups)
    }

    fn centers(&self) -> Vec<&str> {
        if self.center_postal_codes.is_empty()
            && let Some(legacy) = &self.legacy_postal_code
        {
            warn!("Contact file uses the old single 'plz' field; delete it and create it again");
            return vec![legacy.as_str()];
        }
        self.center_postal_codes.iter().map(String::as_str).collect()
    }

    /// Center a registration code is requested for: the first listed center,
    /// else the first center of the first explicit search group.
    #[must_use]
    pub fn primary_center(&self) -> Option<&str> {
        self.centers().first().copied().or_else(|| {
            self.groups
                .first()
                .and_then(|group| group.postal_codes.first())
                .map(String::as_str)
        })
    }

    /// Build the immutable profile used by a polling run.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for missing or malformed fields.
    pub fn profile(&self) -> Result<ContactProfile, ValidationError> {
        self.validate()?;
        let entry = &self.contact;
        let required = |value: &Option<String>, field: &str| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_owned)
                .ok_or_else(|| ValidationError::Missing(format!("kontakt.{field}")))
        };

        let contact = Contact {
            salutation: entry.salutation.as_deref().map(parse_salutation).transpose()?,
            first_name: required(&entry.first_name, "vorname")?,
            last_name: required(&entry.last_name, "nachname")?,
            street: entry.street.clone().unwrap_or_default(),
            house_number: entry.house_number.clone().unwrap_or_default(),
            postal_code: entry.postal_code.clone().unwrap_or_default(),
            city: entry.city.clone().unwrap_or_default(),
            phone: normalize_phone(&required(&entry.phone, "phone")?),
            email: required(&entry.email, "notificationReceiver")?,
        };

        Ok(ContactProfile {
            contact,
            groups: self.search_groups()?,
        })
    }

    /// Parse the acceptance window.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] for malformed dates, times, weekdays,
    /// scope, or inverted ranges.
    pub fn window(&self) -> Result<AcceptanceWindow, ValidationError> {
        let entry = &self.window;
        let scope = match entry.scope.as_deref().map(str::trim) {
            None | Some("beide") => DoseScope::Both,
            Some("1") => DoseScope::First,
            Some("2") => DoseScope::Second,
            Some(other) => {
                return Err(ValidationError::invalid(
                    "zeitrahmen.einhalten_bei",
                    format!("expected 1, 2 or beide, got {other:?}"),
                ));
            }
        };

        let from_date = parse_optional(entry.from_date.as_deref(), "zeitrahmen.von_datum", parse_date)?;
        let to_date = parse_optional(entry.to_date.as_deref(), "zeitrahmen.bis_datum", parse_date)?;
        let from_time = parse_optional(entry.from_time.as_deref(), "zeitrahmen.von_uhrzeit", parse_time)?;
        let to_time = parse_optional(entry.to_time.as_deref(), "zeitrahmen.bis_uhrzeit", parse_time)?;

        if let (Some(from), Some(to)) = (from_date, to_date)
            && from > to
        {
            return Err(ValidationError::invalid("zeitrahmen.bis_datum", "ends before von_datum"));
        }
        if let (Some(from), Some(to)) = (from_time, to_time)
            && from > to
        {
            return Err(ValidationError::invalid("zeitrahmen.bis_uhrzeit", "ends before von_uhrzeit"));
        }

        let weekdays = match &entry.weekdays {
            None => None,
            Some(names) => {
                let days = names
                    .iter()
                    .map(String::as_str)
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(decode_weekday)
                    .collect::<Result<HashSet<_>, _>>()?;
                (!days.is_empty()).then_some(days)
            }
        };

        Ok(AcceptanceWindow {
            scope,
            from_date,
            to_date,
            from_time,
            to_time,
            weekdays,
        })
    }

    /// Configured channels with their persisted state, in a stable order.
    #[must_use]
    pub fn channels(&self) -> Vec<ChannelSettings> {
        let notifications = &self.notifications;
        let email = notifications.email.as_ref().map(|entry| ChannelSettings {
            config: ChannelConfig::Email(entry.config.clone()),
            state: entry.status,
        });
        let pushover = notifications.pushover.as_ref().map(|entry| ChannelSettings {
            config: ChannelConfig::Pushover(entry.config.clone()),
            state: entry.status,
        });
        let telegram = notifications.telegram.as_ref().map(|entry| ChannelSettings {
            config: ChannelConfig::Telegram(entry.config.clone()),
            state: entry.status,
        });
        [email, pushover, telegram].into_iter().flatten().collect()
    }

    /// Store channel settings, replacing any channel of the same kind.
    pub fn set_channel(&mut self, settings: ChannelSettings) {
        let status = settings.state;
        let notifications = &mut self.notifications;
        match settings.config {
            ChannelConfig::Email(config) => notifications.email = Some(ChannelEntry { config, status }),
            ChannelConfig::Pushover(config) => {
                notifications.pushover = Some(ChannelEntry { config, status });
            }
            ChannelConfig::Telegram(config) => {
                notifications.telegram = Some(ChannelEntry { config, status });
            }
        }
    }

    /// Drop a channel configuration so it has to be entered again.
    pub fn remove_channel(&mut self, kind: ChannelKind) {
        let notifications = &mut self.notifications;
        match kind {
            ChannelKind::Email => notifications.email = None,
            ChannelKind::Pushover => notifications.pushover = None,
            ChannelKind::Telegram => notifications.telegram = None,
        }
    }
}

fn empty_object_as_none<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Object(map)) if map.is_empty() => Ok(None),
        Some(value) => serde_json::from_value(value).map(Some).map_err(D::Error::custom),
    }
}

fn parse_optional<T>(
    raw: Option<&str>,
    field: &str,
    parse: fn(&str) -> Option<T>,
) -> Result<Option<T>, ValidationError> {
    match raw.map(str::trim).filter(|value| !value.is_empty()) {
        None => Ok(None),
        Some(value) => parse(value)
            .map(Some)
            .ok_or_else(|| ValidationError::invalid(field, format!("cannot parse {value:?}"))),
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT).ok()
}

fn parse_time(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw, TIME_FORMAT).ok()
}

fn parse_salutation(raw: &str) -> Result<Salutation, ValidationError> {
    match raw.trim() {
        "Frau" => Ok(Salutation::Frau),
        "Herr" => Ok(Salutation::Herr),
        "Kind" => Ok(Salutation::Kind),
        "Divers" => Ok(Salutation::Divers),
        other => Err(ValidationError::invalid(
            "kontakt.anrede",
            format!("expected Frau, Herr, Kind or Divers, got {other:?}"),
        )),
    }
}

fn validate_postal_code(field: &str, raw: &str) -> Result<(), ValidationError> {
    let trimmed = raw.trim();
    if trimmed.len() == 5 && trimmed.chars().all(|ch| ch.is_ascii_digit()) {
        Ok(())
    } else {
        Err(ValidationError::invalid(field, format!("{raw:?} is not a five digit postal code")))
    }
}

fn validate_code(raw: &str) -> Result<(), ValidationError> {
    let blocks: Vec<&str> = raw.trim().split('-').collect();
    let well_formed = blocks.len() == 3
        && blocks
            .iter()
            .all(|block| block.len() == 4 && block.chars().all(|ch| ch.is_ascii_alphanumeric()));
    if well_formed {
        Ok(())
    } else {
        Err(ValidationError::invalid("codes", format!("{raw:?} does not look like XXXX-XXXX-XXXX")))
    }
}

/// Parse a German weekday abbreviation (`Mo`..`So`).
///
/// # Errors
///
/// Returns a [`ValidationError`] for unknown names.
pub fn decode_weekday(raw: &str) -> Result<Weekday, ValidationError> {
    WEEKDAY_NAMES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(raw.trim()))
        .map(|(_, day)| *day)
        .ok_or_else(|| ValidationError::invalid("zeitrahmen.wochentage", format!("unknown weekday {raw:?}")))
}
