use crate::errors::ReplayError;
use crate::log_retention::enforce_total_budget;
use serde::Serialize;
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

pub const DEFAULT_DISK_BUDGET_BYTES: u64 = 20 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct JsonlLogger {
    pub path: PathBuf,
    pub max_payload_bytes: usize,
    pub budget_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEvent<'a> {
    pub level: &'a str,
    pub event_type: &'a str,
    pub payload: Value,
}

impl JsonlLogger {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_payload_bytes: 4096,
            budget_bytes: DEFAULT_DISK_BUDGET_BYTES,
        }
    }

    pub fn append(&self, event: &LogEvent<'_>) -> Result<(), ReplayError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| ReplayError::Io(e.to_string()))?;
        }
        let truncated = truncate_json(event.payload.clone(), self.max_payload_bytes);
        let line = serde_json::to_string(&LogEvent {
            level: event.level,
            event_type: event.event_type,
            payload: truncated,
        })
        .map_err(|e| ReplayError::Io(e.to_string()))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| ReplayError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .map_err(|e| ReplayError::Io(e.to_string()))?;
        file.write_all(b"\n")
            .map_err(|e| ReplayError::Io(e.to_string()))?;

        if let Some(parent) = self.path.parent() {
            let _ = enforce_total_budget(parent, self.budget_bytes, &self.path)?;
        }

        Ok(())
    }
}

struct RunLogger {
    logger: JsonlLogger,
    write_lock: Mutex<()>,
}

static RUN_LOGGER: OnceLock<Mutex<Option<Arc<RunLogger>>>> = OnceLock::new();

fn logger_slot() -> &'static Mutex<Option<Arc<RunLogger>>> {
    RUN_LOGGER.get_or_init(|| Mutex::new(None))
}

/// Install the process run log at `path`.
pub fn init_run_logger(path: impl AsRef<Path>) -> Result<(), ReplayError> {
    let path = path.as_ref().to_path_buf();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| ReplayError::Io(e.to_string()))?;
    }
    let state = Arc::new(RunLogger {
        logger: JsonlLogger::new(path),
        write_lock: Mutex::new(()),
    });
    *logger_slot().lock().expect("run logger init lock") = Some(state);
    Ok(())
}

pub fn clear_run_logger() {
    *logger_slot().lock().expect("run logger clear lock") = None;
}

pub fn append_run_log(level: &str, event_type: &str, payload: Value) {
    let guard = logger_slot().lock().expect("run logger emit lock");
    let Some(state) = guard.as_ref().map(Arc::clone) else {
        return;
    };
    drop(guard);
    let _write = state.write_lock.lock().expect("run logger write lock");
    // A failing run log must never take the session down with it.
    let _ = state.logger.append(&LogEvent {
        level,
        event_type,
        payload,
    });
}

fn truncate_json(value: Value, max_bytes: usize) -> Value {
    let rendered = serde_json::to_string(&value).unwrap_or_default();
    if rendered.len() <= max_bytes {
        return value;
    }
    let mut cut = max_bytes.saturating_sub(3);
    while cut > 0 && !rendered.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}...", &rendered[..cut]))
}

#[cfg(test)]
mod tests {
    use super::{JsonlLogger, LogEvent};
    use serde_json::json;

    #[test]
    fn logger_truncates_large_payloads_and_writes_jsonl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.jsonl");
        let mut logger = JsonlLogger::new(&path);
        logger.max_payload_bytes = 20;
        logger.budget_bytes = 1024;

        logger
            .append(&LogEvent {
                level: "info",
                event_type: "source.malformed_line",
                payload: json!({"line": "abcdefghijklmnopqrstuvwxyz"}),
            })
            .expect("append");

        let text = std::fs::read_to_string(&path).expect("read");
        assert!(text.contains("\"event_type\":\"source.malformed_line\""));
        assert!(text.contains("..."));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn small_payloads_are_written_verbatim() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("run.jsonl");
        let logger = JsonlLogger::new(&path);
        logger
            .append(&LogEvent {
                level: "debug",
                event_type: "clock.paused",
                payload: json!({"igt": 12.5}),
            })
            .expect("append");
        let text = std::fs::read_to_string(&path).expect("read");
        let value: serde_json::Value = serde_json::from_str(text.trim()).expect("json");
        assert_eq!(value["payload"]["igt"], 12.5);
        assert_eq!(value["level"], "debug");
    }
}
