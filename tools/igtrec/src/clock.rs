use crate::errors::ReplayError;
use crate::logging::append_run_log;
use crate::runtime::{GameState, StateSource};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub const IGT_FIELD: &str = "IGT";

/// Last synced IGT and the wall time elapsed since it was synced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSample {
    pub igt: f64,
    pub delta: f64,
}

pub trait GameClock: Send + Sync {
    fn sample(&self) -> ClockSample;
    fn is_paused(&self) -> bool;
    fn is_connected(&self) -> bool;
    /// Receiver over the paused flag; changes are edge-triggered.
    fn paused_watch(&self) -> watch::Receiver<bool>;

    fn now(&self) -> f64 {
        let sample = self.sample();
        if self.is_paused() {
            sample.igt
        } else {
            sample.igt + sample.delta
        }
    }
}

/// Suspend until the clock reports an un-pause edge, or `cancel` fires.
pub async fn wait_until_unpaused(
    clock: &dyn GameClock,
    cancel: &CancellationToken,
) -> Result<(), ReplayError> {
    let mut paused = clock.paused_watch();
    if !*paused.borrow() {
        return Ok(());
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ReplayError::Cancelled),
        res = async { paused.wait_for(|p| !*p).await.map(|_| ()) } => {
            res.map_err(|_| ReplayError::ClockUnavailable)?;
            append_run_log("debug", "clock.unpause_observed", json!({}));
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ClockSnapshot {
    last_synced: f64,
    sampled_at: Instant,
    synced: bool,
}

/// Outcome of one poll of the state source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockPoll {
    pub igt: f64,
    pub paused: bool,
}

/// IGT estimated between coarse polls as the last synced IGT plus the wall
/// time since that sync. Two polls returning the same IGT mean the game is
/// paused, and the estimate stops advancing.
pub struct VirtualClock {
    snapshot: Mutex<ClockSnapshot>,
    connected: AtomicBool,
    paused_tx: watch::Sender<bool>,
    last_state: Mutex<Option<GameState>>,
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualClock {
    pub fn new() -> Self {
        let (paused_tx, _) = watch::channel(false);
        Self {
            snapshot: Mutex::new(ClockSnapshot {
                last_synced: 0.0,
                sampled_at: Instant::now(),
                synced: false,
            }),
            connected: AtomicBool::new(false),
            paused_tx,
            last_state: Mutex::new(None),
        }
    }

    /// Most recent full state returned by the source, if any.
    pub fn last_state(&self) -> Option<GameState> {
        self.last_state.lock().expect("clock state lock").clone()
    }

    /// Poll the source once and fold the result into the clock.
    ///
    /// A sample behind the last synced IGT is treated as a stall so the
    /// synced time never moves backwards.
    pub fn poll_once(&self, source: &dyn StateSource) -> Result<ClockPoll, ReplayError> {
        let polled = if source.connected() {
            source.poll_state()
        } else {
            None
        };
        let Some((state, igt)) =
            polled.and_then(|state| state.get(IGT_FIELD).copied().map(|igt| (state, igt)))
        else {
            self.mark_disconnected();
            return Err(ReplayError::ClockUnavailable);
        };
        if !igt.is_finite() {
            self.mark_disconnected();
            return Err(ReplayError::ClockUnavailable);
        }

        let was_connected = self.connected.swap(true, Ordering::SeqCst);
        if !was_connected {
            append_run_log("info", "clock.connected", json!({ "igt": igt }));
        }

        let poll = {
            let mut snapshot = self.snapshot.lock().expect("clock snapshot lock");
            let paused = was_connected && snapshot.synced && igt <= snapshot.last_synced;
            if igt < snapshot.last_synced && snapshot.synced {
                append_run_log(
                    "warn",
                    "clock.regressed",
                    json!({ "previous": snapshot.last_synced, "polled": igt }),
                );
            }
            let synced_to = if snapshot.synced {
                snapshot.last_synced.max(igt)
            } else {
                igt
            };
            *snapshot = ClockSnapshot {
                last_synced: synced_to,
                sampled_at: Instant::now(),
                synced: true,
            };
            ClockPoll {
                igt: synced_to,
                paused,
            }
        };
        *self.last_state.lock().expect("clock state lock") = Some(state);

        let changed = self.paused_tx.send_if_modified(|current| {
            if *current != poll.paused {
                *current = poll.paused;
                true
            } else {
                false
            }
        });
        if changed {
            let event = if poll.paused { "clock.paused" } else { "clock.unpaused" };
            append_run_log("info", event, json!({ "igt": poll.igt }));
        }
        Ok(poll)
    }

    fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            append_run_log(
                "warn",
                "clock.unavailable",
                json!({ "error": ReplayError::ClockUnavailable.to_string() }),
            );
        }
        self.snapshot.lock().expect("clock snapshot lock").synced = false;
    }

    /// Background refresh: poll at `interval` while connected, retry at
    /// `reconnect_interval` while the source is unavailable.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        source: Arc<dyn StateSource>,
        interval: Duration,
        reconnect_interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let clock = Arc::clone(self);
        tokio::spawn(async move {
            append_run_log(
                "debug",
                "clock.refresh_started",
                json!({ "interval_ms": interval.as_millis() as u64 }),
            );
            loop {
                let wait = match clock.poll_once(source.as_ref()) {
                    Ok(_) => interval,
                    Err(_) => reconnect_interval,
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            append_run_log("debug", "clock.refresh_stopped", json!({}));
        })
    }
}

impl GameClock for VirtualClock {
    fn sample(&self) -> ClockSample {
        if !self.is_connected() {
            return ClockSample {
                igt: 0.0,
                delta: 0.0,
            };
        }
        let snapshot = *self.snapshot.lock().expect("clock snapshot lock");
        ClockSample {
            igt: snapshot.last_synced,
            delta: snapshot.sampled_at.elapsed().as_secs_f64(),
        }
    }

    fn is_paused(&self) -> bool {
        *self.paused_tx.borrow()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn paused_watch(&self) -> watch::Receiver<bool> {
        self.paused_tx.subscribe()
    }
}

/// Render seconds of IGT as `mm:ss.ff`.
pub fn format_igt(seconds: f64) -> String {
    let total_hundredths = if seconds.is_finite() && seconds > 0.0 {
        (seconds * 100.0).floor() as u64
    } else {
        0
    };
    let minutes = total_hundredths / 6000;
    let secs = (total_hundredths / 100) % 60;
    let hundredths = total_hundredths % 100;
    format!("{minutes:02}:{secs:02}.{hundredths:02}")
}
