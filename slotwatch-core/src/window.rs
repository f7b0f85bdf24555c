//! Acceptance windows and the pure matcher deciding whether a slot qualifies.

use std::collections::HashSet;
use std::fmt;

use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};

use crate::model::{Dose, Slot};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Dose ordinals a window constrains.
pub enum DoseScope {
    /// Only first-dose slots are constrained.
    First,
    /// Only second-dose slots are constrained.
    Second,
    /// Both doses are constrained by the same window.
    #[default]
    Both,
}

impl DoseScope {
    /// Whether the window applies to slots of `dose`.
    #[must_use]
    pub fn applies_to(self, dose: Dose) -> bool {
        matches!(
            (self, dose),
            (DoseScope::Both, _) | (DoseScope::First, Dose::First) | (DoseScope::Second, Dose::Second)
        )
    }
}

impl fmt::Display for DoseScope {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DoseScope::First => "first dose",
            DoseScope::Second => "second dose",
            DoseScope::Both => "both doses",
        };
        write!(formatter, "{label}")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// User-defined constraints narrowing which slots are reported.
///
/// Every bound is inclusive and every unset field is vacuously satisfied. A
/// window with no constraint at all accepts any slot.
pub struct AcceptanceWindow {
    /// Doses the window applies to.
    pub scope: DoseScope,
    /// Earliest acceptable date.
    pub from_date: Option<NaiveDate>,
    /// Latest acceptable date.
    pub to_date: Option<NaiveDate>,
    /// Earliest acceptable start time.
    pub from_time: Option<NaiveTime>,
    /// Latest acceptable start time.
    pub to_time: Option<NaiveTime>,
    /// Allowed weekdays; `None` or an empty set allows all seven.
    pub weekdays: Option<HashSet<Weekday>>,
}

impl AcceptanceWindow {
    /// Window that accepts any slot at any time.
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// True when no sub-constraint is configured.
    #[must_use]
    pub fn is_unconstrained(&self) -> bool {
        self.from_date.is_none()
            && self.to_date.is_none()
            && self.from_time.is_none()
            && self.to_time.is_none()
            && self.weekdays.as_ref().is_none_or(HashSet::is_empty)
    }

    /// Evaluate `slot` against this window.
    #[must_use]
    pub fn matches(&self, slot: &Slot) -> bool {
        matches(slot, self)
    }

    fn date_allowed(&self, date: NaiveDate) -> bool {
        self.from_date.is_none_or(|from| date >= from) && self.to_date.is_none_or(|to| date <= to)
    }

    fn time_allowed(&self, time: NaiveTime) -> bool {
        self.from_time.is_none_or(|from| time >= from) && self.to_time.is_none_or(|to| time <= to)
    }

    fn weekday_allowed(&self, date: NaiveDate) -> bool {
        self.weekdays
            .as_ref()
            .filter(|days| !days.is_empty())
            .is_none_or(|days| days.contains(&date.weekday()))
    }
}

impl fmt::Display for AcceptanceWindow {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unconstrained() {
            return write!(formatter, "any slot");
        }

        let mut parts = Vec::new();
        if self.from_date.is_some() || self.to_date.is_some() {
            parts.push(format!(
                "dates {}..{}",
                self.from_date.map_or_else(String::new, |date| date.to_string()),
                self.to_date.map_or_else(String::new, |date| date.to_string())
            ));
        }
        if self.from_time.is_some() || self.to_time.is_some() {
            parts.push(format!(
                "times {}..{}",
                self.from_time.map_or_else(String::new, |time| time.format("%H:%M").to_string()),
                self.to_time.map_or_else(String::new, |time| time.format("%H:%M").to_string())
            ));
        }
        if let Some(days) = self.weekdays.as_ref().filter(|days| !days.is_empty()) {
            let mut sorted: Vec<Weekday> = days.iter().copied().collect();
            sorted.sort_by_key(Weekday::num_days_from_monday);
            let names: Vec<String> = sorted.iter().map(ToString::to_string).collect();
            parts.push(format!("weekdays {}", names.join(",")));
        }
        write!(formatter, "{} for {}", parts.join(", "), self.scope)
    }
}

/// Whether `slot` satisfies `window`.
///
/// Slots whose dose lies outside the window's scope are accepted unconstrained.
#[must_use]
pub fn matches(slot: &Slot, window: &AcceptanceWindow) -> bool {
    if window.is_unconstrained() || !window.scope.applies_to(slot.dose) {
        return true;
    }

    window.date_allowed(slot.date)
        && window.time_allowed(slot.time)
        && window.weekday_allowed(slot.date)
}
