use crate::clock::GameClock;
use crate::errors::ReplayError;
use crate::logging::append_run_log;
use crate::record::{decode_line, Record};
use crate::types::RecordKind;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Pause between two gate checks of the same pending record.
pub const GATE_RECHECK: Duration = Duration::from_millis(1);

/// Per-kind playback queues. Kinds without a queue are skipped.
#[derive(Debug, Default)]
pub struct RecordRouter {
    queues: BTreeMap<RecordKind, mpsc::UnboundedSender<Record>>,
}

impl RecordRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the queue for `kind` and hand back its consuming end.
    pub fn channel(&mut self, kind: RecordKind) -> mpsc::UnboundedReceiver<Record> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.queues.insert(kind, tx);
        rx
    }

    pub fn routes(&self, kind: RecordKind) -> bool {
        self.queues.contains_key(&kind)
    }

    /// `Ok(false)` when the kind is not routed.
    pub fn route(&self, record: Record) -> Result<bool, ReplayError> {
        let Some(tx) = self.queues.get(&record.kind()) else {
            return Ok(false);
        };
        tx.send(record).map_err(|_| ReplayError::QueueClosed)?;
        Ok(true)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceSummary {
    pub dispatched: BTreeMap<RecordKind, usize>,
    pub unrouted: usize,
    pub malformed: usize,
    pub reached_eof: bool,
    pub cancelled: bool,
}

impl SourceSummary {
    pub fn dispatched_total(&self) -> usize {
        self.dispatched.values().sum()
    }
}

/// Sequential session reader with an admission gate. At most one record is
/// pending; it is routed to its kind's queue only once the clock has reached
/// its IGT. Reaching end of file closes every per-kind queue.
pub struct RecordSource {
    path: PathBuf,
    clock: Arc<dyn GameClock>,
    router: RecordRouter,
    on_failure: CancellationToken,
    verbose: bool,
}

impl RecordSource {
    /// Prepare to stream `path`. Fails early when the file cannot be read.
    /// A read failure while streaming cancels `on_failure`.
    pub fn open(
        path: impl AsRef<Path>,
        clock: Arc<dyn GameClock>,
        router: RecordRouter,
        on_failure: CancellationToken,
        verbose: bool,
    ) -> Result<Self, ReplayError> {
        let path = path.as_ref().to_path_buf();
        let meta = std::fs::metadata(&path).map_err(|e| {
            ReplayError::Io(format!("cannot open session file {}: {e}", path.display()))
        })?;
        if !meta.is_file() {
            return Err(ReplayError::Io(format!(
                "session path is not a file: {}",
                path.display()
            )));
        }
        Ok(Self {
            path,
            clock,
            router,
            on_failure,
            verbose,
        })
    }

    /// Start streaming. Stop by cancelling `cancel`.
    pub fn start(
        self,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<SourceSummary, ReplayError>> {
        tokio::spawn(async move {
            let on_failure = self.on_failure.clone();
            let path = self.path.display().to_string();
            let result = self.run(cancel).await;
            if let Err(err) = &result {
                append_run_log(
                    "error",
                    "source.failed",
                    json!({ "path": path, "error": err.to_string() }),
                );
                on_failure.cancel();
            }
            result
        })
    }

    async fn run(self, cancel: CancellationToken) -> Result<SourceSummary, ReplayError> {
        let file = File::open(&self.path)
            .await
            .map_err(|e| ReplayError::Io(e.to_string()))?;
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        let mut summary = SourceSummary::default();
        let mut line_no = 0usize;
        let mut pending: Option<Record> = None;

        append_run_log(
            "info",
            "source.started",
            json!({ "path": self.path.display().to_string() }),
        );

        loop {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let Some(record) = pending.take() else {
                buf.clear();
                let read = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        summary.cancelled = true;
                        break;
                    }
                    read = reader.read_until(b'\n', &mut buf) => {
                        read.map_err(|e| ReplayError::Io(e.to_string()))?
                    }
                };
                if read == 0 {
                    summary.reached_eof = true;
                    break;
                }
                line_no += 1;
                let raw = buf.strip_suffix(b"\n").unwrap_or(&buf[..]);
                let parsed = decode_line(raw, line_no).and_then(|line| {
                    if line.trim().is_empty() {
                        Ok(None)
                    } else {
                        Record::from_line(line, line_no).map(Some)
                    }
                });
                match parsed {
                    Ok(Some(record)) => pending = Some(record),
                    Ok(None) => {}
                    Err(err) => {
                        summary.malformed += 1;
                        append_run_log(
                            "warn",
                            "source.malformed_line",
                            json!({ "line": line_no, "error": err.to_string() }),
                        );
                    }
                }
                continue;
            };

            let now = self.clock.now();
            if now < record.igt() {
                pending = Some(record);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(GATE_RECHECK) => {}
                }
                continue;
            }

            let kind = record.kind();
            if self.verbose {
                append_run_log(
                    "debug",
                    "source.dispatched",
                    json!({ "kind": kind.as_str(), "igt": record.igt(), "now": now }),
                );
            }
            match self.router.route(record) {
                Ok(true) => *summary.dispatched.entry(kind).or_insert(0) += 1,
                Ok(false) => summary.unrouted += 1,
                Err(_) => {
                    // The scheduler for this kind has finished; nothing left to feed.
                    summary.unrouted += 1;
                }
            }
        }

        append_run_log(
            "info",
            "source.finished",
            json!({
                "dispatched": summary.dispatched_total(),
                "unrouted": summary.unrouted,
                "malformed": summary.malformed,
                "reached_eof": summary.reached_eof,
                "cancelled": summary.cancelled,
            }),
        );
        // Dropping the router closes every per-kind queue.
        drop(self.router);
        Ok(summary)
    }
}
