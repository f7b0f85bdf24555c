//! Integration tests for the polling engine driven by a scripted probe.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, Weekday};
use parking_lot::Mutex;
use slotwatch_core::{
    AcceptanceWindow, AvailabilityProbe, BackoffPolicy, ChannelKind, CodeRequest, Contact,
    ContactProfile, Dose, DoseScope, EngineError, EngineSettings, GroupId, Message,
    NotificationDispatcher, NotificationError, NotificationSink, PollState, PollingEngine,
    ProbeError, RegisteredChannel, SearchGroup, Slot, ValidationState,
};
use tokio_util::sync::CancellationToken;

const GROUP_A: &str = "AAAA-1111-AAAA";
const GROUP_B: &str = "BBBB-2222-BBBB";
const INTERVAL: Duration = Duration::from_secs(30);

type Script = VecDeque<Result<Vec<Slot>, ProbeError>>;

#[derive(Default)]
struct ScriptedProbe {
    scripts: Mutex<HashMap<(String, Dose), Script>>,
    calls: Mutex<Vec<(String, Dose)>>,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
}

impl ScriptedProbe {
    fn push(&self, code: &str, dose: Dose, result: Result<Vec<Slot>, ProbeError>) {
        self.scripts
            .lock()
            .entry((code.to_owned(), dose))
            .or_default()
            .push_back(result);
    }

    fn cancel_after(&self, calls: usize, token: CancellationToken) {
        *self.cancel_after.lock() = Some((calls, token));
    }

    fn calls_for(&self, code: &str) -> usize {
        self.calls.lock().iter().filter(|(called, _)| called == code).count()
    }

    fn calls(&self) -> Vec<(String, Dose)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl AvailabilityProbe for ScriptedProbe {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn check_availability(
        &self,
        group: &SearchGroup,
        dose: Dose,
    ) -> Result<Vec<Slot>, ProbeError> {
        let code = group.code().0.clone();
        let call_count = {
            let mut calls = self.calls.lock();
            calls.push((code.clone(), dose));
            calls.len()
        };
        if let Some((limit, token)) = self.cancel_after.lock().as_ref()
            && call_count >= *limit
        {
            token.cancel();
        }
        self.scripts
            .lock()
            .get_mut(&(code, dose))
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn request_registration_code(&self, _request: &CodeRequest) -> Result<bool, ProbeError> {
        Ok(true)
    }
}

struct RecordingSink {
    fail: bool,
    messages: Mutex<Vec<Message>>,
}

impl RecordingSink {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            fail,
            messages: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.messages.lock().len()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Pushover
    }

    fn destination(&self) -> String {
        "recording".to_owned()
    }

    async fn send(&self, message: &Message) -> Result<(), NotificationError> {
        self.messages.lock().push(message.clone());
        if self.fail {
            Err(NotificationError::RateLimited(ChannelKind::Pushover))
        } else {
            Ok(())
        }
    }
}

fn slot(code: &str, date: (i32, u32, u32), hour: u32, dose: Dose) -> Slot {
    Slot {
        group: GroupId(code.to_owned()),
        postal_code: "68163".to_owned(),
        date: NaiveDate::from_ymd_opt(date.0, date.1, date.2).expect("valid date"),
        time: NaiveTime::from_hms_opt(hour, 0, 0).expect("valid time"),
        dose,
    }
}

fn profile(codes: &[&str]) -> Arc<ContactProfile> {
    Arc::new(ContactProfile {
        contact: Contact {
            first_name: "Erika".to_owned(),
            last_name: "Mustermann".to_owned(),
            ..Contact::default()
        },
        groups: codes
            .iter()
            .enumerate()
            .map(|(index, code)| SearchGroup::new(*code, [format!("6816{index}")]))
            .collect(),
    })
}

fn engine(
    codes: &[&str],
    window: AcceptanceWindow,
    probe: &Arc<ScriptedProbe>,
    sink: &Arc<RecordingSink>,
) -> PollingEngine {
    engine_with(codes, window, probe, sink, EngineSettings::new(INTERVAL))
}

fn engine_with(
    codes: &[&str],
    window: AcceptanceWindow,
    probe: &Arc<ScriptedProbe>,
    sink: &Arc<RecordingSink>,
    settings: EngineSettings,
) -> PollingEngine {
    let probe: Arc<dyn AvailabilityProbe> = Arc::clone(probe) as Arc<dyn AvailabilityProbe>;
    let sink: Arc<dyn NotificationSink> = Arc::clone(sink) as Arc<dyn NotificationSink>;
    let dispatcher = NotificationDispatcher::new(vec![RegisteredChannel::new(
        ValidationState::Validated,
        sink,
    )]);
    PollingEngine::new(
        profile(codes),
        window,
        probe,
        Arc::new(dispatcher),
        settings,
    )
}

#[tokio::test(start_paused = true)]
async fn slot_seen_in_consecutive_cycles_is_notified_once() {
    let probe = Arc::new(ScriptedProbe::default());
    let sink = RecordingSink::new(false);
    let repeated = slot(GROUP_A, (2021, 6, 15), 9, Dose::First);
    for _ in 0..3 {
        probe.push(GROUP_A, Dose::First, Ok(vec![repeated.clone(), repeated.clone()]));
    }
    let engine = engine(&[GROUP_A], AcceptanceWindow::any(), &probe, &sink);
    let state = Mutex::new(PollState::default());
    let cancel = CancellationToken::new();

    let mut notified = 0;
    for _ in 0..3 {
        let report = engine.run_cycle(&state, &cancel).await.expect("cycle");
        assert_eq!(report.probed, 1);
        notified += report.notified;
        tokio::time::advance(INTERVAL).await;
    }

    assert_eq!(notified, 1);
    assert_eq!(sink.count(), 1);
    assert_eq!(state.lock().notified_count(), 1);
}

#[tokio::test]
async fn weekend_window_discards_tuesday_slot() {
    let probe = Arc::new(ScriptedProbe::default());
    let sink = RecordingSink::new(false);
    probe.push(GROUP_A, Dose::First, Ok(vec![slot(GROUP_A, (2021, 6, 15), 9, Dose::First)]));
    probe.push(GROUP_A, Dose::Second, Ok(vec![slot(GROUP_A, (2021, 7, 13), 9, Dose::Second)]));
    let window = AcceptanceWindow {
        scope: DoseScope::Both,
        weekdays: Some(HashSet::from([Weekday::Sat, Weekday::Sun])),
        ..AcceptanceWindow::default()
    };
    let engine = engine(&[GROUP_A], window, &probe, &sink);
    let state = Mutex::new(PollState::default());

    let report = engine
        .run_cycle(&state, &CancellationToken::new())
        .await
        .expect("cycle");

    assert_eq!(report.matched, 0);
    assert_eq!(sink.count(), 0);
}

#[tokio::test]
async fn first_dose_scope_leaves_second_dose_unconstrained() {
    let probe = Arc::new(ScriptedProbe::default());
    let sink = RecordingSink::new(false);
    probe.push(GROUP_A, Dose::First, Ok(vec![slot(GROUP_A, (2021, 6, 15), 9, Dose::First)]));
    probe.push(GROUP_A, Dose::Second, Ok(vec![slot(GROUP_A, (2021, 6, 15), 9, Dose::Second)]));
    let window = AcceptanceWindow {
        scope: DoseScope::First,
        from_date: NaiveDate::from_ymd_opt(2021, 6, 1),
        to_date: NaiveDate::from_ymd_opt(2021, 6, 30),
        ..AcceptanceWindow::default()
    };
    let engine = engine(&[GROUP_A], window, &probe, &sink);
    let state = Mutex::new(PollState::default());

    let report = engine
        .run_cycle(&state, &CancellationToken::new())
        .await
        .expect("cycle");

    assert_eq!(report.notified, 2, "same date and time but different doses");
    assert_eq!(sink.count(), 2);
}

#[tokio::test]
async fn groups_probe_in_declaration_order_first_dose_first() {
    let probe = Arc::new(ScriptedProbe::default());
    let sink = RecordingSink::new(false);
    let engine = engine(&[GROUP_B, GROUP_A], AcceptanceWindow::any(), &probe, &sink);
    let state = Mutex::new(PollState::default());

    engine
        .run_cycle(&state, &CancellationToken::new())
        .await
        .expect("cycle");

    assert_eq!(
        probe.calls(),
        [
            (GROUP_B.to_owned(), Dose::First),
            (GROUP_B.to_owned(), Dose::Second),
            (GROUP_A.to_owned(), Dose::First),
            (GROUP_A.to_owned(), Dose::Second),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn auth_error_disables_group_for_the_rest_of_the_run() {
    let probe = Arc::new(ScriptedProbe::default());
    let sink = RecordingSink::new(false);
    probe.push(GROUP_A, Dose::First, Err(ProbeError::Auth("invalid code".to_owned())));
    let engine = engine(&[GROUP_A, GROUP_B], AcceptanceWindow::any(), &probe, &sink);
    let cancel = CancellationToken::new();
    // Cycle 1: A once, B twice; cycles 2..=5: B twice each.
    probe.cancel_after(11, cancel.clone());

    let state = Mutex::new(PollState::default());
    engine
        .run_with_state(&state, cancel)
        .await
        .expect("run ends on cancellation");

    assert_eq!(probe.calls_for(GROUP_A), 1);
    assert_eq!(probe.calls_for(GROUP_B), 10);
    assert!(state.lock().is_disabled(&GroupId(GROUP_A.to_owned())));
}

#[tokio::test(start_paused = true)]
async fn transient_errors_back_off_and_success_resets() {
    let probe = Arc::new(ScriptedProbe::default());
    let sink = RecordingSink::new(false);
    for _ in 0..4 {
        probe.push(GROUP_A, Dose::First, Err(ProbeError::Transient("timeout".to_owned())));
    }
    let engine = engine(&[GROUP_A], AcceptanceWindow::any(), &probe, &sink);
    let policy = engine.settings().backoff;
    let group = GroupId(GROUP_A.to_owned());
    let state = Mutex::new(PollState::default());
    let cancel = CancellationToken::new();

    let mut delays = Vec::new();
    for _ in 0..4 {
        engine.run_cycle(&state, &cancel).await.expect("cycle");
        delays.push(state.lock().current_delay(&group, &policy));
        // Group is not due again until its backoff elapses.
        let report = engine.run_cycle(&state, &cancel).await.expect("cycle");
        assert_eq!(report.skipped, 1);
        tokio::time::advance(policy.cap).await;
    }
    assert!(delays.windows(2).all(|pair| pair[0] < pair[1]), "{delays:?}");
    assert_eq!(sink.count(), 0);

    engine.run_cycle(&state, &cancel).await.expect("cycle");
    assert_eq!(state.lock().failures(&group), 0);
    assert_eq!(state.lock().current_delay(&group, &policy), policy.base);
}

#[tokio::test]
async fn backoff_stops_at_cap() {
    let mut settings = EngineSettings::new(INTERVAL);
    settings.backoff = BackoffPolicy {
        base: Duration::from_secs(30),
        cap: Duration::from_secs(100),
    };
    let group = GroupId(GROUP_A.to_owned());
    let mut state = PollState::default();
    let now = tokio::time::Instant::now();
    let waits: Vec<Duration> = (0..5)
        .map(|_| state.record_failure(&group, &settings, now, None).1)
        .collect();
    assert!(waits.windows(2).all(|pair| pair[0] <= pair[1]), "{waits:?}");
    assert_eq!(waits.last(), Some(&(INTERVAL + settings.backoff.cap)));
}

#[tokio::test(start_paused = true)]
async fn rate_limited_group_sits_out_the_next_cycle() {
    let probe = Arc::new(ScriptedProbe::default());
    let sink = RecordingSink::new(false);
    probe.push(GROUP_A, Dose::First, Err(ProbeError::RateLimited { retry_after: None }));
    let settings = EngineSettings::default();
    let engine = engine_with(&[GROUP_A, GROUP_B], AcceptanceWindow::any(), &probe, &sink, settings);
    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    let stop_at = settings.interval() + Duration::from_secs(1);
    tokio::spawn(async move {
        tokio::time::sleep(stop_at).await;
        stop.cancel();
    });

    engine.run(cancel).await.expect("run ends on cancellation");

    assert_eq!(
        probe.calls(),
        [
            (GROUP_A.to_owned(), Dose::First),
            (GROUP_B.to_owned(), Dose::First),
            (GROUP_B.to_owned(), Dose::Second),
            (GROUP_B.to_owned(), Dose::First),
            (GROUP_B.to_owned(), Dose::Second),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn failing_group_is_retried_when_its_backoff_ends() {
    let probe = Arc::new(ScriptedProbe::default());
    let sink = RecordingSink::new(false);
    probe.push(GROUP_A, Dose::First, Err(ProbeError::Transient("timeout".to_owned())));
    let settings = EngineSettings::new(Duration::from_secs(90));
    let engine = engine_with(&[GROUP_A, GROUP_B], AcceptanceWindow::any(), &probe, &sink, settings);
    // A is due at 90s + 60s backoff, B at 90s and 180s.
    let retry_at = settings.interval() + settings.backoff.delay_for(1);
    assert_eq!(retry_at, Duration::from_secs(150));
    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(retry_at + Duration::from_secs(1)).await;
        stop.cancel();
    });
    let state = Mutex::new(PollState::default());

    engine
        .run_with_state(&state, cancel)
        .await
        .expect("run ends on cancellation");

    assert_eq!(
        probe.calls(),
        [
            (GROUP_A.to_owned(), Dose::First),
            (GROUP_B.to_owned(), Dose::First),
            (GROUP_B.to_owned(), Dose::Second),
            (GROUP_B.to_owned(), Dose::First),
            (GROUP_B.to_owned(), Dose::Second),
            (GROUP_A.to_owned(), Dose::First),
            (GROUP_A.to_owned(), Dose::Second),
        ]
    );
    assert_eq!(state.lock().failures(&GroupId(GROUP_A.to_owned())), 0);
}

#[tokio::test]
async fn fatal_error_ends_the_run() {
    let probe = Arc::new(ScriptedProbe::default());
    let sink = RecordingSink::new(false);
    probe.push(GROUP_B, Dose::Second, Err(ProbeError::Fatal("unexpected payload".to_owned())));
    let engine = engine(&[GROUP_A, GROUP_B], AcceptanceWindow::any(), &probe, &sink);

    let err = engine
        .run(CancellationToken::new())
        .await
        .expect_err("fatal error stops the loop");

    let EngineError::Fatal { group, dose, .. } = err;
    assert_eq!(group, GroupId(GROUP_B.to_owned()));
    assert_eq!(dose, Dose::Second);
}

#[tokio::test(start_paused = true)]
async fn failed_delivery_is_not_retried_next_cycle() {
    let probe = Arc::new(ScriptedProbe::default());
    let sink = RecordingSink::new(true);
    let found = slot(GROUP_A, (2021, 6, 19), 10, Dose::First);
    probe.push(GROUP_A, Dose::First, Ok(vec![found.clone()]));
    probe.push(GROUP_A, Dose::First, Ok(vec![found]));
    let engine = engine(&[GROUP_A], AcceptanceWindow::any(), &probe, &sink);
    let state = Mutex::new(PollState::default());
    let cancel = CancellationToken::new();

    engine.run_cycle(&state, &cancel).await.expect("cycle");
    tokio::time::advance(INTERVAL).await;
    let report = engine.run_cycle(&state, &cancel).await.expect("cycle");

    assert_eq!(report.probed, 1);
    assert_eq!(sink.count(), 1);
}

#[tokio::test]
async fn cancelled_token_stops_before_probing() {
    let probe = Arc::new(ScriptedProbe::default());
    let sink = RecordingSink::new(false);
    let engine = engine(&[GROUP_A, GROUP_B], AcceptanceWindow::any(), &probe, &sink);
    let cancel = CancellationToken::new();
    cancel.cancel();

    engine.run(cancel).await.expect("clean shutdown");

    assert!(probe.calls().is_empty());
}

#[tokio::test]
async fn cancellation_between_groups_ends_cycle_early() {
    let probe = Arc::new(ScriptedProbe::default());
    let sink = RecordingSink::new(false);
    let engine = engine(&[GROUP_A, GROUP_B], AcceptanceWindow::any(), &probe, &sink);
    let cancel = CancellationToken::new();
    probe.cancel_after(1, cancel.clone());
    let state = Mutex::new(PollState::default());

    engine.run_cycle(&state, &cancel).await.expect("cycle");

    assert_eq!(probe.calls(), [(GROUP_A.to_owned(), Dose::First)]);
}

#[tokio::test]
async fn concurrent_groups_still_notify_each_slot_once() {
    let probe = Arc::new(ScriptedProbe::default());
    let sink = RecordingSink::new(false);
    probe.push(GROUP_A, Dose::First, Ok(vec![slot(GROUP_A, (2021, 6, 19), 10, Dose::First)]));
    probe.push(GROUP_B, Dose::First, Ok(vec![slot(GROUP_B, (2021, 6, 19), 10, Dose::First)]));
    let probe_dyn: Arc<dyn AvailabilityProbe> = Arc::clone(&probe) as Arc<dyn AvailabilityProbe>;
    let sink_dyn: Arc<dyn NotificationSink> = Arc::clone(&sink) as Arc<dyn NotificationSink>;
    let engine = PollingEngine::new(
        profile(&[GROUP_A, GROUP_B]),
        AcceptanceWindow::any(),
        probe_dyn,
        Arc::new(NotificationDispatcher::new(vec![RegisteredChannel::new(
            ValidationState::Validated,
            sink_dyn,
        )])),
        EngineSettings::default().with_concurrency(4),
    );
    let state = Mutex::new(PollState::default());

    let report = engine
        .run_cycle(&state, &CancellationToken::new())
        .await
        .expect("cycle");

    assert_eq!(report.probed, 2);
    assert_eq!(report.notified, 2, "fingerprints differ by group");
    assert_eq!(sink.count(), 2);
}
