use crate::clock::{wait_until_unpaused, GameClock};
use crate::errors::ReplayError;
use crate::logging::append_run_log;
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Below this many milliseconds the wait finishes with one exact sleep.
pub const FINE_SLEEP_MS: f64 = 100.0;
const DECAY_FACTOR: f64 = 0.5;

/// Milliseconds as a `Duration`; negative and NaN clamp to zero.
pub fn millis(ms: f64) -> Duration {
    if ms.is_nan() || ms <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(ms / 1000.0).unwrap_or(Duration::MAX)
}

pub async fn sleep_cancellable(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), ReplayError> {
    if duration.is_zero() {
        return if cancel.is_cancelled() {
            Err(ReplayError::Cancelled)
        } else {
            Ok(())
        };
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ReplayError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

pub async fn sleep_until_cancellable(
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<(), ReplayError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ReplayError::Cancelled),
        _ = tokio::time::sleep_until(deadline) => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmartDelay {
    /// Final fine sleep handed back to the caller, in milliseconds.
    pub residual_ms: f64,
    pub iterations: u32,
}

/// Wait until `clock` approaches `target` by repeatedly sleeping half of the
/// remaining gap and resampling.
///
/// Returns once less than `min_delay_ms` remains, with `remaining - 1` as the
/// residual. Gaps under [`FINE_SLEEP_MS`] are slept exactly. While the clock
/// is paused no wall time is spent sleeping; the wait resumes on the
/// un-pause edge and resamples.
pub async fn smart_delay(
    clock: &dyn GameClock,
    target: f64,
    min_delay_ms: f64,
    cancel: &CancellationToken,
) -> Result<SmartDelay, ReplayError> {
    let mut iterations = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(ReplayError::Cancelled);
        }
        iterations += 1;
        let remaining = (target - clock.now()) * 1000.0;

        if remaining < min_delay_ms {
            return Ok(SmartDelay {
                residual_ms: (remaining - 1.0).max(0.0),
                iterations,
            });
        }
        if remaining < FINE_SLEEP_MS {
            sleep_cancellable(millis(remaining), cancel).await?;
            return Ok(SmartDelay {
                residual_ms: 0.0,
                iterations,
            });
        }

        if clock.is_paused() {
            append_run_log(
                "debug",
                "smart_delay.paused",
                json!({ "target": target, "remaining_ms": remaining }),
            );
            wait_until_unpaused(clock, cancel).await?;
            continue;
        }

        let segment = remaining * DECAY_FACTOR;
        append_run_log(
            "debug",
            "smart_delay.step",
            json!({
                "target": target,
                "remaining_ms": remaining,
                "sleep_ms": segment,
                "iteration": iterations,
            }),
        );
        sleep_cancellable(millis(segment), cancel).await?;
    }
}
