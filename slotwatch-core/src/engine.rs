//! Long-running polling loop probing every search group, filtering slots, and
//! notifying about each qualifying slot at most once per run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, stream};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::model::{ContactProfile, Dose, GroupId, SearchGroup, Slot, SlotFingerprint};
use crate::notify::NotificationDispatcher;
use crate::ports::{AvailabilityProbe, Message, ProbeError};
use crate::window::AcceptanceWindow;

/// Pause between two cycles unless configured otherwise.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
/// Shortest pause between two cycles the engine accepts.
pub const MIN_INTERVAL: Duration = Duration::from_secs(30);

#[derive(thiserror::Error, Debug)]
/// Conditions that end a polling run.
pub enum EngineError {
    /// The probe reported an error it cannot recover from.
    #[error("Probe failed fatally for group {group} ({dose}): {source}")]
    Fatal {
        /// Group being probed.
        group: GroupId,
        /// Dose being probed.
        dose: Dose,
        /// Underlying probe error.
        #[source]
        source: ProbeError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Exponential backoff applied per group after rate limits and transient errors.
pub struct BackoffPolicy {
    /// Delay with no outstanding failure; doubled for each consecutive failure.
    pub base: Duration,
    /// Upper bound for any delay.
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            cap: Duration::from_secs(15 * 60),
        }
    }
}

impl BackoffPolicy {
    /// Delay after `failures` consecutive failures: `base * 2^failures`, capped.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 1_u32.checked_shl(failures.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Tunables of a polling run.
pub struct EngineSettings {
    interval: Duration,
    /// Backoff applied to failing groups.
    pub backoff: BackoffPolicy,
    concurrency: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            backoff: BackoffPolicy::default(),
            concurrency: 1,
        }
    }
}

impl EngineSettings {
    /// Settings with the given cycle interval, raised to [`MIN_INTERVAL`] if lower.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self::default().with_interval(interval)
    }

    /// Replace the cycle interval, raised to [`MIN_INTERVAL`] if lower.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        if interval < MIN_INTERVAL {
            warn!(
                requested_secs = interval.as_secs(),
                min_secs = MIN_INTERVAL.as_secs(),
                "Retry interval too short, using the minimum to spare the appointment service"
            );
            self.interval = MIN_INTERVAL;
        } else {
            self.interval = interval;
        }
        self
    }

    /// Number of groups probed at the same time (at least one).
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Effective cycle interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Effective concurrency.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }
}

#[derive(Debug, Clone, Default)]
struct GroupState {
    failures: u32,
    next_probe: Option<Instant>,
    disabled: bool,
    last_success: Option<Instant>,
}

#[derive(Debug, Default)]
/// Per-run mutable state; lives in memory only.
///
/// A healthy group is due one interval after its last success. A failing
/// group additionally waits its backoff delay on top of that interval.
pub struct PollState {
    notified: HashSet<SlotFingerprint>,
    groups: HashMap<GroupId, GroupState>,
    idle_reported: bool,
}

impl PollState {
    /// Whether `group` should be probed at `now`.
    #[must_use]
    pub fn is_due(&self, group: &GroupId, now: Instant) -> bool {
        self.groups.get(group).is_none_or(|entry| {
            !entry.disabled && entry.next_probe.is_none_or(|next_probe| now >= next_probe)
        })
    }

    /// Earliest time any of `groups` is due; `None` when all are disabled.
    #[must_use]
    pub fn next_due<'a, I>(&self, groups: I, now: Instant) -> Option<Instant>
    where
        I: IntoIterator<Item = &'a GroupId>,
    {
        groups
            .into_iter()
            .filter(|group| !self.is_disabled(group))
            .map(|group| {
                self.groups
                    .get(group)
                    .and_then(|entry| entry.next_probe)
                    .unwrap_or(now)
            })
            .min()
    }

    /// Whether `group` was disabled by an auth failure.
    #[must_use]
    pub fn is_disabled(&self, group: &GroupId) -> bool {
        self.groups.get(group).is_some_and(|entry| entry.disabled)
    }

    /// Disable `group` for the rest of the run; true if it was active before.
    pub fn disable(&mut self, group: &GroupId) -> bool {
        let entry = self.groups.entry(group.clone()).or_default();
        !std::mem::replace(&mut entry.disabled, true)
    }

    /// Count a failure of the probe started at `now` and schedule the retry
    /// one interval plus the backoff delay later.
    ///
    /// Returns the attempt number and the wait until the group is due again.
    pub fn record_failure(
        &mut self,
        group: &GroupId,
        settings: &EngineSettings,
        now: Instant,
        hint: Option<Duration>,
    ) -> (u32, Duration) {
        let policy = &settings.backoff;
        let entry = self.groups.entry(group.clone()).or_default();
        entry.failures = entry.failures.saturating_add(1);
        let mut delay = policy.delay_for(entry.failures);
        if let Some(hint) = hint {
            delay = delay.max(hint.min(policy.cap));
        }
        let wait = settings.interval + delay;
        entry.next_probe = Some(now + wait);
        (entry.failures, wait)
    }

    /// Reset the failure counter after a successful probe started at `now`;
    /// the group is due again one interval later.
    pub fn record_success(&mut self, group: &GroupId, settings: &EngineSettings, now: Instant) {
        let entry = self.groups.entry(group.clone()).or_default();
        entry.failures = 0;
        entry.last_success = Some(now);
        entry.next_probe = Some(now + settings.interval);
    }

    /// Consecutive failures of `group`.
    #[must_use]
    pub fn failures(&self, group: &GroupId) -> u32 {
        self.groups.get(group).map_or(0, |entry| entry.failures)
    }

    /// Delay the group would wait before its next retry.
    #[must_use]
    pub fn current_delay(&self, group: &GroupId, policy: &BackoffPolicy) -> Duration {
        policy.delay_for(self.failures(group))
    }

    /// Start of the last successful probe of `group`.
    #[must_use]
    pub fn last_success(&self, group: &GroupId) -> Option<Instant> {
        self.groups.get(group).and_then(|entry| entry.last_success)
    }

    /// Record `fingerprint` as seen; false if it was already notified.
    pub fn mark_notified(&mut self, fingerprint: SlotFingerprint) -> bool {
        self.notified.insert(fingerprint)
    }

    /// Number of distinct slots notified so far.
    #[must_use]
    pub fn notified_count(&self) -> usize {
        self.notified.len()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Counters describing one cycle.
pub struct CycleReport {
    /// Groups whose probes ran.
    pub probed: usize,
    /// Groups skipped because of backoff or auth failure.
    pub skipped: usize,
    /// Slots that passed the acceptance window.
    pub matched: usize,
    /// Slots handed to the dispatcher.
    pub notified: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct GroupOutcome {
    matched: usize,
    notified: usize,
}

/// Orchestrates probing, matching, deduplication, and notification.
pub struct PollingEngine {
    profile: Arc<ContactProfile>,
    window: AcceptanceWindow,
    probe: Arc<dyn AvailabilityProbe>,
    dispatcher: Arc<NotificationDispatcher>,
    settings: EngineSettings,
}

impl PollingEngine {
    /// Create an engine bound to a profile, window, probe, and dispatcher.
    #[must_use]
    pub fn new(
        profile: Arc<ContactProfile>,
        window: AcceptanceWindow,
        probe: Arc<dyn AvailabilityProbe>,
        dispatcher: Arc<NotificationDispatcher>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            profile,
            window,
            probe,
            dispatcher,
            settings,
        }
    }

    /// Effective settings.
    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Poll until `cancel` fires or the probe fails fatally.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Fatal`] when the probe reports an unrecoverable error.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), EngineError> {
        let state = Mutex::new(PollState::default());
        self.run_with_state(&state, cancel).await
    }

    /// Like [`PollingEngine::run`] but with caller-owned state.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Fatal`] when the probe reports an unrecoverable error.
    pub async fn run_with_state(
        &self,
        state: &Mutex<PollState>,
        cancel: CancellationToken,
    ) -> Result<(), EngineError> {
        info!(
            probe = self.probe.name(),
            contact = %self.profile.contact.display_name(),
            groups = self.profile.groups.len(),
            channels = self.dispatcher.len(),
            interval_secs = self.settings.interval.as_secs(),
            window = %self.window,
            "Starting slot search"
        );

        let mut cycle: u64 = 0;
        while !cancel.is_cancelled() {
            cycle += 1;
            let report = self.run_cycle(state, &cancel).await?;
            debug!(
                cycle,
                probed = report.probed,
                skipped = report.skipped,
                matched = report.matched,
                notified = report.notified,
                "Cycle finished"
            );
            self.report_if_idle(state);

            let now = Instant::now();
            let ids: Vec<GroupId> = self.profile.groups.iter().map(SearchGroup::id).collect();
            let wake = state
                .lock()
                .next_due(&ids, now)
                .unwrap_or(now + self.settings.interval);

            tokio::select! {
                biased;

                () = cancel.cancelled() => break,
                () = tokio::time::sleep_until(wake) => {}
            }
        }

        info!(
            cycles = cycle,
            notified = state.lock().notified_count(),
            "Slot search stopped"
        );
        Ok(())
    }

    /// Probe every due group once, in declaration order.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Fatal`] when the probe reports an unrecoverable error.
    pub async fn run_cycle(
        &self,
        state: &Mutex<PollState>,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, EngineError> {
        let now = Instant::now();
        let (due, skipped): (Vec<&SearchGroup>, Vec<&SearchGroup>) = {
            let guard = state.lock();
            self.profile
                .groups
                .iter()
                .partition(|group| guard.is_due(&group.id(), now))
        };

        let mut report = CycleReport {
            skipped: skipped.len(),
            ..CycleReport::default()
        };

        let mut outcomes = stream::iter(due)
            .map(|group| self.probe_group(group, state, cancel, now))
            .buffered(self.settings.concurrency);

        while let Some(outcome) = outcomes.next().await {
            let outcome = outcome?;
            report.probed += 1;
            report.matched += outcome.matched;
            report.notified += outcome.notified;
            if cancel.is_cancelled() {
                debug!("Cancellation requested, ending cycle early");
                break;
            }
        }

        Ok(report)
    }

    async fn probe_group(
        &self,
        group: &SearchGroup,
        state: &Mutex<PollState>,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<GroupOutcome, EngineError> {
        let id = group.id();
        let mut outcome = GroupOutcome::default();

        for dose in Dose::ALL {
            if cancel.is_cancelled() {
                break;
            }

            let result = tokio::select! {
                biased;

                () = cancel.cancelled() => break,
                result = self.probe.check_availability(group, dose) => result,
            };

            match result {
                Ok(slots) => {
                    state.lock().record_success(&id, &self.settings, started);
                    debug!(group = %group, %dose, slots = slots.len(), "Probe succeeded");
                    let (matched, notified) = self.handle_slots(&id, slots, state).await;
                    outcome.matched += matched;
                    outcome.notified += notified;
                }
                Err(err @ ProbeError::Auth(_)) => {
                    if state.lock().disable(&id) {
                        warn!(
                            group = %group,
                            %dose,
                            error = %err,
                            "Registration code rejected, group disabled for the rest of this run"
                        );
                    }
                    break;
                }
                Err(err @ (ProbeError::RateLimited { .. } | ProbeError::Transient(_))) => {
                    let hint = match &err {
                        ProbeError::RateLimited { retry_after } => *retry_after,
                        _ => None,
                    };
                    let (attempt, wait, last_success) = {
                        let mut guard = state.lock();
                        let (attempt, wait) = guard.record_failure(&id, &self.settings, started, hint);
                        (attempt, wait, guard.last_success(&id))
                    };
                    warn!(
                        group = %group,
                        %dose,
                        kind = %err.kind(),
                        attempt,
                        retry_in_secs = wait.saturating_sub(started.elapsed()).as_secs(),
                        since_success_secs = ?last_success.map(|at| at.elapsed().as_secs()),
                        error = %err,
                        "Probe failed, backing off"
                    );
                    break;
                }
                Err(err @ ProbeError::Fatal(_)) => {
                    error!(group = %group, %dose, error = %err, "Probe failed fatally");
                    return Err(EngineError::Fatal {
                        group: id,
                        dose,
                        source: err,
                    });
                }
            }
        }

        Ok(outcome)
    }

    async fn handle_slots(
        &self,
        group: &GroupId,
        slots: Vec<Slot>,
        state: &Mutex<PollState>,
    ) -> (usize, usize) {
        let matching: Vec<Slot> = slots
            .into_iter()
            .map(|mut slot| {
                slot.group = group.clone();
                slot
            })
            .filter(|slot| self.window.matches(slot))
            .collect();
        let matched = matching.len();

        // Seen before dispatch: a failed delivery is not retried next cycle.
        let fresh: Vec<Slot> = {
            let mut guard = state.lock();
            matching
                .into_iter()
                .filter(|slot| guard.mark_notified(slot.fingerprint()))
                .collect()
        };

        for slot in &fresh {
            let text = slot.alert_message();
            info!(group = %slot.group, dose = %slot.dose, at = %slot.starts_at(), center = %slot.postal_code, "Open slot found");
            let reports = self
                .dispatcher
                .send(&Message::new("Vaccination slot available", text))
                .await;
            let delivered = reports.iter().filter(|report| report.delivered()).count();
            if !reports.is_empty() && delivered == 0 {
                warn!(group = %slot.group, "Slot could not be delivered to any channel");
            }
        }

        (matched, fresh.len())
    }

    fn report_if_idle(&self, state: &Mutex<PollState>) {
        let mut guard = state.lock();
        let all_disabled = self
            .profile
            .groups
            .iter()
            .all(|group| guard.is_disabled(&group.id()));
        if all_disabled && !guard.idle_reported {
            guard.idle_reported = true;
            error!("Every search group has been disabled; check the registration codes");
        }
    }
}
