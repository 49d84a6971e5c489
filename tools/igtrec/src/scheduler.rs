use crate::batch::{BatchBuilder, BatchSlot};
use crate::clock::GameClock;
use crate::config::PlaybackConfig;
use crate::delay::{millis, sleep_cancellable, sleep_until_cancellable, smart_delay};
use crate::errors::ReplayError;
use crate::logging::append_run_log;
use crate::record::Record;
use crate::runtime::ActionSink;
use crate::types::{ChannelState, RecordKind, ReplayMode};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub fn validate_transition(from: ChannelState, to: ChannelState) -> Result<(), ReplayError> {
    use ChannelState as S;

    let allowed = match from {
        S::Idle => matches!(to, S::Running | S::Stopped),
        S::Running => matches!(to, S::Paused | S::Stopped),
        S::Paused => matches!(to, S::Running | S::Stopped),
        S::Stopped => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(ReplayError::InvalidTransition {
            from: from.as_str(),
            to: to.as_str(),
        })
    }
}

/// `Idle -> Running -> {Paused <-> Running} -> Stopped` for one channel.
#[derive(Debug)]
pub struct ChannelControl {
    kind: RecordKind,
    state: Mutex<ChannelState>,
}

impl ChannelControl {
    pub fn new(kind: RecordKind) -> Self {
        Self {
            kind,
            state: Mutex::new(ChannelState::Idle),
        }
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock().expect("channel state lock")
    }

    /// Running and not paused.
    pub fn is_active(&self) -> bool {
        self.state() == ChannelState::Running
    }

    pub fn start(&self) -> Result<(), ReplayError> {
        self.transition(ChannelState::Running)
    }

    /// Only takes effect while running. Returns whether the state changed.
    pub fn pause(&self) -> bool {
        self.transition_if(ChannelState::Running, ChannelState::Paused)
    }

    pub fn resume(&self) -> bool {
        self.transition_if(ChannelState::Paused, ChannelState::Running)
    }

    /// Terminal. Stopping twice is a no-op.
    pub fn stop(&self) {
        let mut state = self.state.lock().expect("channel state lock");
        if *state != ChannelState::Stopped {
            self.log_transition(*state, ChannelState::Stopped);
            *state = ChannelState::Stopped;
        }
    }

    fn transition(&self, next: ChannelState) -> Result<(), ReplayError> {
        let mut state = self.state.lock().expect("channel state lock");
        validate_transition(*state, next)?;
        self.log_transition(*state, next);
        *state = next;
        Ok(())
    }

    fn transition_if(&self, expected: ChannelState, next: ChannelState) -> bool {
        let mut state = self.state.lock().expect("channel state lock");
        if *state != expected {
            return false;
        }
        self.log_transition(*state, next);
        *state = next;
        true
    }

    fn log_transition(&self, from: ChannelState, to: ChannelState) {
        append_run_log(
            "debug",
            "channel.transition",
            json!({ "kind": self.kind.as_str(), "from": from.as_str(), "to": to.as_str() }),
        );
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub batch_window_secs: f64,
    pub smart_delay_threshold_ms: f64,
    pub min_delay_ms: f64,
    pub idle_poll: Duration,
    pub verbose: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            batch_window_secs: 0.5,
            smart_delay_threshold_ms: 1000.0,
            min_delay_ms: 100.0,
            idle_poll: Duration::from_millis(100),
            verbose: false,
        }
    }
}

impl SchedulerSettings {
    pub fn from_config(cfg: &PlaybackConfig, verbose: bool) -> Self {
        Self {
            batch_window_secs: cfg.batch_window_secs,
            smart_delay_threshold_ms: cfg.smart_delay_threshold_ms,
            min_delay_ms: cfg.min_delay_ms,
            idle_poll: Duration::from_millis(cfg.idle_poll_ms),
            verbose,
        }
    }
}

#[derive(Debug, Default)]
struct PlaybackCounters {
    dequeued: AtomicUsize,
    performed: AtomicUsize,
    withheld: AtomicUsize,
    failed: AtomicUsize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaybackSummary {
    pub kind: RecordKind,
    pub dequeued: usize,
    pub performed: usize,
    pub withheld: usize,
    pub failed: usize,
    pub cancelled: bool,
}

#[derive(Clone)]
pub struct PlaybackScheduler {
    kind: RecordKind,
    mode: ReplayMode,
    control: Arc<ChannelControl>,
    clock: Arc<dyn GameClock>,
    actions: Arc<dyn ActionSink>,
    settings: SchedulerSettings,
    counters: Arc<PlaybackCounters>,
}

impl PlaybackScheduler {
    pub fn new(
        kind: RecordKind,
        clock: Arc<dyn GameClock>,
        actions: Arc<dyn ActionSink>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            kind,
            mode: ReplayMode::for_kind(kind),
            control: Arc::new(ChannelControl::new(kind)),
            clock,
            actions,
            settings,
            counters: Arc::new(PlaybackCounters::default()),
        }
    }

    pub fn with_mode(mut self, mode: ReplayMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn mode(&self) -> ReplayMode {
        self.mode
    }

    pub fn control(&self) -> Arc<ChannelControl> {
        Arc::clone(&self.control)
    }

    pub fn state(&self) -> ChannelState {
        self.control.state()
    }

    pub fn pause(&self) -> bool {
        self.control.pause()
    }

    pub fn resume(&self) -> bool {
        self.control.resume()
    }

    pub fn stop(&self) {
        self.control.stop()
    }

    pub fn summary(&self, cancelled: bool) -> PlaybackSummary {
        PlaybackSummary {
            kind: self.kind,
            dequeued: self.counters.dequeued.load(Ordering::SeqCst),
            performed: self.counters.performed.load(Ordering::SeqCst),
            withheld: self.counters.withheld.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            cancelled,
        }
    }

    /// Launch the consume loop over `rx`. Starts the channel if it is idle.
    ///
    /// The loop ends when `cancel` fires, when the channel is stopped, or
    /// once `rx` is closed and drained.
    pub fn play(
        &self,
        rx: mpsc::UnboundedReceiver<Record>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<PlaybackSummary>, ReplayError> {
        if self.state() == ChannelState::Idle {
            self.control.start()?;
        } else if self.state() == ChannelState::Stopped {
            return Err(ReplayError::InvalidTransition {
                from: ChannelState::Stopped.as_str(),
                to: ChannelState::Running.as_str(),
            });
        }
        let this = self.clone();
        Ok(tokio::spawn(async move { this.run(rx, cancel).await }))
    }

    async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<Record>,
        cancel: CancellationToken,
    ) -> PlaybackSummary {
        append_run_log(
            "info",
            "playback.started",
            json!({
                "kind": self.kind.as_str(),
                "batched": self.mode == ReplayMode::Batched,
            }),
        );
        let mut batch = BatchBuilder::new(self.settings.batch_window_secs);
        let mut batch_started: Option<Instant> = None;
        let mut cancelled = false;

        loop {
            if self.state() == ChannelState::Stopped {
                break;
            }
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }
                next = tokio::time::timeout(self.settings.idle_poll, rx.recv()) => next,
            };
            let record = match next {
                // Idle poll: nothing queued yet.
                Err(_) => continue,
                Ok(None) => break,
                Ok(Some(record)) => record,
            };
            self.counters.dequeued.fetch_add(1, Ordering::SeqCst);

            if self.state() == ChannelState::Paused {
                self.withhold(&record);
                batch.reset();
                continue;
            }

            match self
                .wait_for(&record, &mut batch, &mut batch_started, &cancel)
                .await
            {
                Ok(()) => {}
                Err(err) if err.is_cancelled() => {
                    cancelled = true;
                    break;
                }
                Err(err) => append_run_log(
                    "warn",
                    "playback.delay_failed",
                    json!({ "kind": self.kind.as_str(), "error": err.to_string() }),
                ),
            }

            if self.state() != ChannelState::Running {
                self.withhold(&record);
                continue;
            }

            match self.perform(&record, &cancel).await {
                Ok(()) => {
                    self.counters.performed.fetch_add(1, Ordering::SeqCst);
                    if self.settings.verbose {
                        append_run_log(
                            "debug",
                            "playback.timing_error",
                            json!({
                                "kind": self.kind.as_str(),
                                "record": record.to_string(),
                                "error_ms": (self.clock.now() - record.igt()) * 1000.0,
                                "batch_len": (self.mode == ReplayMode::Batched)
                                    .then_some(batch.current_len()),
                            }),
                        );
                    }
                }
                Err(err) if err.is_cancelled() => {
                    self.counters.performed.fetch_add(1, Ordering::SeqCst);
                    cancelled = true;
                    break;
                }
                Err(err) => {
                    self.counters.failed.fetch_add(1, Ordering::SeqCst);
                    append_run_log(
                        "error",
                        "playback.action_failed",
                        json!({
                            "kind": self.kind.as_str(),
                            "record": record.to_string(),
                            "error": err.to_string(),
                        }),
                    );
                }
            }
        }

        self.control.stop();
        let summary = self.summary(cancelled);
        append_run_log(
            "info",
            "playback.finished",
            json!({
                "kind": self.kind.as_str(),
                "dequeued": summary.dequeued,
                "performed": summary.performed,
                "withheld": summary.withheld,
                "failed": summary.failed,
                "cancelled": cancelled,
            }),
        );
        summary
    }

    fn withhold(&self, record: &Record) {
        self.counters.withheld.fetch_add(1, Ordering::SeqCst);
        if self.settings.verbose {
            append_run_log(
                "debug",
                "playback.withheld",
                json!({ "kind": self.kind.as_str(), "igt": record.igt() }),
            );
        }
    }

    async fn wait_for(
        &self,
        record: &Record,
        batch: &mut BatchBuilder,
        batch_started: &mut Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<(), ReplayError> {
        match self.mode {
            ReplayMode::Unbatched => self.delay_against_clock(record.igt(), cancel).await,
            ReplayMode::Batched => match batch.admit(record.igt()) {
                BatchSlot::First => {
                    self.delay_against_clock(record.igt(), cancel).await?;
                    *batch_started = Some(Instant::now());
                    Ok(())
                }
                BatchSlot::Member { offset_secs } => {
                    let anchor = batch_started.unwrap_or_else(Instant::now);
                    sleep_until_cancellable(anchor + millis(offset_secs * 1000.0), cancel).await
                }
            },
        }
    }

    async fn delay_against_clock(
        &self,
        target: f64,
        cancel: &CancellationToken,
    ) -> Result<(), ReplayError> {
        let raw_ms = ((target - self.clock.now()) * 1000.0).max(0.0);
        let wait_ms = if raw_ms > self.settings.smart_delay_threshold_ms {
            smart_delay(
                self.clock.as_ref(),
                target,
                self.settings.min_delay_ms,
                cancel,
            )
            .await?
            .residual_ms
        } else {
            raw_ms
        };
        sleep_cancellable(millis(wait_ms), cancel).await
    }

    async fn perform(
        &self,
        record: &Record,
        cancel: &CancellationToken,
    ) -> Result<(), ReplayError> {
        match record {
            Record::Key(press) => {
                self.actions.key_down(&press.key)?;
                let held = sleep_cancellable(millis(press.duration_ms), cancel).await;
                // Release even when the hold was cut short.
                self.actions.key_up(&press.key)?;
                held
            }
            Record::Pointer(sample) => self.actions.move_by(sample.delta_x, sample.delta_y),
            Record::State(sample) => self.actions.write_state(sample.x, sample.y, sample.z),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::record::{KeyPress, PointerSample, StateSample};
    use crate::runtime::{FakeActionSink, FakeStateSource, ReplayedAction};

    fn clock_at(igt: f64) -> Arc<VirtualClock> {
        let clock = Arc::new(VirtualClock::new());
        clock
            .poll_once(&FakeStateSource::with_igts(&[igt]))
            .expect("poll");
        clock
    }

    fn pointer(igt: f64, dx: i32) -> Record {
        Record::Pointer(PointerSample {
            igt,
            abs_x: 0,
            abs_y: 0,
            delta_x: dx,
            delta_y: 0,
        })
    }

    fn state(igt: f64, x: f64) -> Record {
        Record::State(StateSample {
            igt,
            x,
            y: 0.0,
            z: 0.0,
        })
    }

    fn offsets_ms(start: Instant, actions: &[(Instant, ReplayedAction)]) -> Vec<u128> {
        actions
            .iter()
            .map(|(at, _)| at.duration_since(start).as_millis())
            .collect()
    }

    #[test]
    fn transition_validator_rejects_invalid_edges() {
        assert!(validate_transition(ChannelState::Idle, ChannelState::Running).is_ok());
        assert!(validate_transition(ChannelState::Paused, ChannelState::Running).is_ok());
        let err = validate_transition(ChannelState::Stopped, ChannelState::Running)
            .expect_err("stopped is terminal");
        assert_eq!(err.to_string(), "illegal transition: stopped -> running");
        assert!(validate_transition(ChannelState::Idle, ChannelState::Paused).is_err());
    }

    #[test]
    fn pause_and_resume_only_apply_while_running() {
        let control = ChannelControl::new(RecordKind::Key);
        assert!(!control.pause());
        control.start().expect("start");
        assert!(control.pause());
        assert!(!control.pause());
        assert!(control.resume());
        control.stop();
        control.stop();
        assert_eq!(control.state(), ChannelState::Stopped);
        assert!(control.start().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unbatched_records_replay_at_their_igt() {
        let clock = clock_at(0.0);
        let actions = FakeActionSink::default();
        let scheduler = PlaybackScheduler::new(
            RecordKind::Mouse,
            clock,
            Arc::new(actions.clone()),
            SchedulerSettings::default(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(pointer(0.2, 1)).expect("send");
        tx.send(pointer(0.5, 2)).expect("send");
        drop(tx);

        let start = Instant::now();
        let summary = scheduler
            .play(rx, CancellationToken::new())
            .expect("play")
            .await
            .expect("join");

        assert_eq!(summary.performed, 2);
        assert!(!summary.cancelled);
        let timed = actions.timed_actions();
        let at = offsets_ms(start, &timed);
        assert!((200..=202).contains(&at[0]), "{at:?}");
        assert!((500..=503).contains(&at[1]), "{at:?}");
        assert_eq!(timed[1].1, ReplayedAction::MoveBy(2, 0));
        assert_eq!(scheduler.state(), ChannelState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn long_gaps_go_through_the_decaying_wait() {
        let clock = clock_at(0.0);
        let actions = FakeActionSink::default();
        let scheduler = PlaybackScheduler::new(
            RecordKind::Mouse,
            clock,
            Arc::new(actions.clone()),
            SchedulerSettings::default(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(pointer(5.0, 1)).expect("send");
        drop(tx);

        let start = Instant::now();
        scheduler
            .play(rx, CancellationToken::new())
            .expect("play")
            .await
            .expect("join");
        let at = offsets_ms(start, &actions.timed_actions());
        assert!((4990..=5010).contains(&at[0]), "{at:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn batched_members_keep_recorded_spacing() {
        let clock = clock_at(0.0);
        let actions = FakeActionSink::default();
        let scheduler = PlaybackScheduler::new(
            RecordKind::State,
            clock,
            Arc::new(actions.clone()),
            SchedulerSettings::default(),
        );
        assert_eq!(scheduler.mode(), ReplayMode::Batched);
        let (tx, rx) = mpsc::unbounded_channel();
        for (igt, x) in [(1.0, 1.0), (1.1, 2.0), (1.3, 3.0)] {
            tx.send(state(igt, x)).expect("send");
        }
        drop(tx);

        let start = Instant::now();
        scheduler
            .play(rx, CancellationToken::new())
            .expect("play")
            .await
            .expect("join");
        let timed = actions.timed_actions();
        let at = offsets_ms(start, &timed);
        assert!((1000..=1002).contains(&at[0]), "{at:?}");
        assert!((1100..=1103).contains(&at[1]), "{at:?}");
        assert!((1300..=1304).contains(&at[2]), "{at:?}");
        assert_eq!(timed[2].1, ReplayedAction::WriteState(3.0, 0.0, 0.0));
    }

    #[tokio::test(start_paused = true)]
    async fn state_channel_can_run_unbatched() {
        let clock = clock_at(0.0);
        let actions = FakeActionSink::default();
        let scheduler = PlaybackScheduler::new(
            RecordKind::State,
            clock.clone(),
            Arc::new(actions.clone()),
            SchedulerSettings::default(),
        )
        .with_mode(ReplayMode::Unbatched);
        assert_eq!(scheduler.mode(), ReplayMode::Unbatched);

        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(state(0.2, 1.0)).expect("send");
        tx.send(state(0.3, 2.0)).expect("send");
        drop(tx);

        let start = Instant::now();
        let handle = scheduler.play(rx, CancellationToken::new()).expect("play");
        // The game jumps 150ms ahead. The second sample is already due by the
        // clock, so it does not wait out its recorded 100ms spacing.
        tokio::time::sleep(Duration::from_millis(100)).await;
        clock
            .poll_once(&FakeStateSource::with_igts(&[0.25]))
            .expect("poll");
        handle.await.expect("join");

        let at = offsets_ms(start, &actions.timed_actions());
        assert!((200..=202).contains(&at[0]), "{at:?}");
        assert!((200..=202).contains(&at[1]), "{at:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn key_is_held_for_its_duration() {
        let clock = clock_at(0.0);
        let actions = FakeActionSink::default();
        let scheduler = PlaybackScheduler::new(
            RecordKind::Key,
            clock,
            Arc::new(actions.clone()),
            SchedulerSettings::default(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Record::Key(KeyPress {
            igt: 0.0,
            key: "W".to_string(),
            duration_ms: 250.0,
        }))
        .expect("send");
        drop(tx);

        let start = Instant::now();
        scheduler
            .play(rx, CancellationToken::new())
            .expect("play")
            .await
            .expect("join");
        let timed = actions.timed_actions();
        assert_eq!(timed[0].1, ReplayedAction::KeyDown("W".to_string()));
        assert_eq!(timed[1].1, ReplayedAction::KeyUp("W".to_string()));
        let at = offsets_ms(start, &timed);
        assert!((250..=251).contains(&at[1]), "{at:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_hold_still_releases_the_key() {
        let clock = clock_at(0.0);
        let actions = FakeActionSink::default();
        let scheduler = PlaybackScheduler::new(
            RecordKind::Key,
            clock,
            Arc::new(actions.clone()),
            SchedulerSettings::default(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Record::Key(KeyPress {
            igt: 0.0,
            key: "Space".to_string(),
            duration_ms: 10_000.0,
        }))
        .expect("send");
        tx.send(pointer(0.1, 1)).expect("send");

        let cancel = CancellationToken::new();
        let handle = scheduler.play(rx, cancel.clone()).expect("play");
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        let summary = handle.await.expect("join");

        assert!(summary.cancelled);
        assert_eq!(
            actions.actions(),
            vec![
                ReplayedAction::KeyDown("Space".to_string()),
                ReplayedAction::KeyUp("Space".to_string())
            ]
        );
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn paused_channel_dequeues_but_withholds() {
        let clock = clock_at(0.0);
        let actions = FakeActionSink::default();
        let scheduler = PlaybackScheduler::new(
            RecordKind::Mouse,
            clock,
            Arc::new(actions.clone()),
            SchedulerSettings::default(),
        );
        scheduler.control().start().expect("start");
        assert!(scheduler.pause());

        let (tx, rx) = mpsc::unbounded_channel();
        let handle = scheduler.play(rx, CancellationToken::new()).expect("play");
        tx.send(pointer(0.0, 1)).expect("send");
        tx.send(pointer(0.0, 2)).expect("send");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(scheduler.resume());
        tx.send(pointer(0.0, 3)).expect("send");
        drop(tx);

        let summary = handle.await.expect("join");
        assert_eq!(summary.dequeued, 3);
        assert_eq!(summary.withheld, 2);
        assert_eq!(summary.performed, 1);
        assert_eq!(actions.actions(), vec![ReplayedAction::MoveBy(3, 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_action_is_logged_and_the_loop_continues() {
        let clock = clock_at(0.0);
        let actions = FakeActionSink::default();
        actions.set_fail_next(ReplayError::Action("device busy".to_string()));
        let scheduler = PlaybackScheduler::new(
            RecordKind::Mouse,
            clock,
            Arc::new(actions.clone()),
            SchedulerSettings::default(),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(pointer(0.0, 1)).expect("send");
        tx.send(pointer(0.0, 2)).expect("send");
        drop(tx);

        let summary = scheduler
            .play(rx, CancellationToken::new())
            .expect("play")
            .await
            .expect("join");
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.performed, 1);
        assert_eq!(actions.actions(), vec![ReplayedAction::MoveBy(2, 0)]);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_scheduler_cannot_play_again() {
        let scheduler = PlaybackScheduler::new(
            RecordKind::Key,
            clock_at(0.0),
            Arc::new(FakeActionSink::default()),
            SchedulerSettings::default(),
        );
        scheduler.stop();
        let (_tx, rx) = mpsc::unbounded_channel();
        assert!(matches!(
            scheduler.play(rx, CancellationToken::new()),
            Err(ReplayError::InvalidTransition { .. })
        ));
    }
}
