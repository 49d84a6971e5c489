use crate::errors::ReplayError;
use crate::logging::append_run_log;
use crate::record::Record;
use crate::runtime::{FileSystem, ProductionFileSystem};
use serde_json::json;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const BACKUP_SUFFIX: &str = ".backup";

/// `<path>.backup`
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Move an existing file aside to its backup path, replacing any older
/// backup. Returns the backup path when a file was moved.
pub fn rotate_to_backup(path: &Path) -> Result<Option<PathBuf>, ReplayError> {
    if !path.exists() {
        return Ok(None);
    }
    let backup = backup_path(path);
    fs::rename(path, &backup).map_err(|e| ReplayError::Io(e.to_string()))?;
    Ok(Some(backup))
}

/// Copy a file to its backup path, replacing any older backup.
pub fn copy_to_backup(path: &Path) -> Result<PathBuf, ReplayError> {
    let backup = backup_path(path);
    fs::copy(path, &backup).map_err(|e| ReplayError::Io(e.to_string()))?;
    Ok(backup)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinkSummary {
    pub path: PathBuf,
    pub written: usize,
    pub backup: Option<PathBuf>,
}

/// Ordered append-only writer for a session file. Producers enqueue from any
/// thread; one writer thread drains the queue in enqueue order and flushes
/// after every line.
pub struct DurableRecordSink {
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    writer_join: Mutex<Option<thread::JoinHandle<()>>>,
    written: Arc<AtomicUsize>,
    failure: Arc<Mutex<Option<ReplayError>>>,
    path: PathBuf,
    backup: Option<PathBuf>,
}

impl DurableRecordSink {
    /// Open a fresh session file at `path`. An existing file is preserved as
    /// `<path>.backup`. A write failure cancels `on_failure`.
    pub fn open(
        path: impl AsRef<Path>,
        verbose: bool,
        on_failure: CancellationToken,
    ) -> Result<Self, ReplayError> {
        Self::open_in(&ProductionFileSystem, path, verbose, on_failure)
    }

    pub fn open_in(
        file_system: &dyn FileSystem,
        path: impl AsRef<Path>,
        verbose: bool,
        on_failure: CancellationToken,
    ) -> Result<Self, ReplayError> {
        let path = path.as_ref().to_path_buf();
        let backup = rotate_to_backup(&path)?;
        let file = file_system.create(&path)?;

        let written = Arc::new(AtomicUsize::new(0));
        let failure = Arc::new(Mutex::new(None));
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();

        let writer_join = {
            let written = Arc::clone(&written);
            let failure = Arc::clone(&failure);
            let path = path.clone();
            thread::spawn(move || {
                let mut out = BufWriter::new(file);
                while let Some(line) = rx.blocking_recv() {
                    let result = out
                        .write_all(line.as_bytes())
                        .and_then(|_| out.write_all(b"\n"))
                        .and_then(|_| out.flush());
                    if let Err(e) = result {
                        append_run_log(
                            "error",
                            "sink.write_failed",
                            json!({
                                "path": path.display().to_string(),
                                "error": e.to_string(),
                            }),
                        );
                        *failure.lock().expect("sink failure lock") =
                            Some(ReplayError::Io(e.to_string()));
                        rx.close();
                        on_failure.cancel();
                        break;
                    }
                    let count = written.fetch_add(1, Ordering::SeqCst) + 1;
                    if verbose {
                        append_run_log(
                            "debug",
                            "sink.line_written",
                            json!({ "line": line, "count": count }),
                        );
                    }
                }
            })
        };

        append_run_log(
            "info",
            "sink.opened",
            json!({
                "path": path.display().to_string(),
                "backup": backup.as_ref().map(|b| b.display().to_string()),
            }),
        );

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            writer_join: Mutex::new(Some(writer_join)),
            written,
            failure,
            path,
            backup,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }

    /// Append one line to the queue. Never blocks.
    pub fn enqueue(&self, line: String) -> Result<(), ReplayError> {
        let guard = self.tx.lock().expect("sink sender lock");
        let tx = guard.as_ref().ok_or(ReplayError::QueueClosed)?;
        tx.send(line).map_err(|_| ReplayError::QueueClosed)
    }

    pub fn enqueue_record(&self, record: &Record) -> Result<(), ReplayError> {
        self.enqueue(record.to_line()?)
    }

    /// Stop accepting input, wait for the writer to drain what is queued and
    /// surface any write failure. Blocks the calling thread.
    pub fn close(&self) -> Result<SinkSummary, ReplayError> {
        drop(self.tx.lock().expect("sink sender lock").take());
        let handle = self.writer_join.lock().expect("sink join lock").take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| ReplayError::Io("sink writer thread panicked".to_string()))?;
            append_run_log(
                "info",
                "sink.closed",
                json!({
                    "path": self.path.display().to_string(),
                    "written": self.written(),
                }),
            );
        }
        if let Some(err) = self.failure.lock().expect("sink failure lock").clone() {
            return Err(err);
        }
        Ok(SinkSummary {
            path: self.path.clone(),
            written: self.written(),
            backup: self.backup.clone(),
        })
    }
}

impl Drop for DurableRecordSink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::StateSample;
    use crate::runtime::FailingWriteFileSystem;
    use std::time::Duration;

    #[test]
    fn close_drains_everything_in_enqueue_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.jsonl");
        let sink = DurableRecordSink::open(&path, false, CancellationToken::new()).expect("open");
        for i in 0..200 {
            sink.enqueue(format!("line-{i}")).expect("enqueue");
        }
        let summary = sink.close().expect("close");
        assert_eq!(summary.written, 200);
        assert!(summary.backup.is_none());

        let text = fs::read_to_string(&path).expect("read");
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 200);
        assert_eq!(lines[0], "line-0");
        assert_eq!(lines[199], "line-199");
    }

    #[test]
    fn existing_file_is_moved_to_backup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.jsonl");
        fs::write(&path, "previous\n").expect("seed");
        fs::write(backup_path(&path), "older\n").expect("seed backup");

        let sink = DurableRecordSink::open(&path, false, CancellationToken::new()).expect("open");
        sink.enqueue_record(&Record::State(StateSample {
            igt: 1.0,
            x: 1.0,
            y: 2.0,
            z: 3.0,
        }))
        .expect("enqueue");
        let summary = sink.close().expect("close");

        assert_eq!(summary.backup, Some(backup_path(&path)));
        assert_eq!(
            fs::read_to_string(backup_path(&path)).expect("backup"),
            "previous\n"
        );
        let fresh = fs::read_to_string(&path).expect("fresh");
        assert!(fresh.starts_with("{\"IGT\":1.0,\"STATE\""));
    }

    #[test]
    fn enqueue_after_close_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sink = DurableRecordSink::open(
            dir.path().join("s.jsonl"),
            false,
            CancellationToken::new(),
        )
        .expect("open");
        sink.close().expect("close");
        assert_eq!(
            sink.enqueue("late".to_string()),
            Err(ReplayError::QueueClosed)
        );
        sink.close().expect("second close is a no-op");
    }

    #[test]
    fn a_failed_write_keeps_earlier_lines_and_cancels_the_session() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.jsonl");
        fs::write(&path, "previous\n").expect("seed");
        let on_failure = CancellationToken::new();
        let sink = DurableRecordSink::open_in(
            &FailingWriteFileSystem::new(2),
            &path,
            false,
            on_failure.clone(),
        )
        .expect("open");

        for i in 0..3 {
            sink.enqueue(format!("line-{i}")).expect("enqueue");
        }
        for _ in 0..500 {
            if on_failure.is_cancelled() {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(on_failure.is_cancelled());
        assert_eq!(
            sink.enqueue("late".to_string()),
            Err(ReplayError::QueueClosed)
        );

        assert!(matches!(sink.close(), Err(ReplayError::Io(_))));
        assert_eq!(sink.written(), 2);
        assert_eq!(
            fs::read_to_string(&path).expect("partial"),
            "line-0\nline-1\n"
        );
        assert_eq!(
            fs::read_to_string(backup_path(&path)).expect("backup"),
            "previous\n"
        );
    }

    #[test]
    fn backup_path_appends_suffix() {
        assert_eq!(
            backup_path(Path::new("rec/session.jsonl")),
            PathBuf::from("rec/session.jsonl.backup")
        );
    }
}
