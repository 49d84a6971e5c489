use crate::errors::ReplayError;
use crate::logging::append_run_log;
use crate::record::{session_lines, Record, SessionLine};
use crate::sink::copy_to_backup;
use crate::types::RecordKind;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SortSummary {
    pub kept: usize,
    pub skipped: usize,
    pub reordered: bool,
}

/// `<path>.temp`
fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".temp");
    PathBuf::from(name)
}

/// Parse, stable-sort by IGT and render the lines of a session file.
/// Malformed lines are logged and dropped; ties keep their file order.
pub fn sort_lines(bytes: impl AsRef<[u8]>) -> (Vec<String>, SortSummary) {
    let mut parsed = Vec::new();
    let mut skipped = 0;
    for (line_no, raw) in session_lines(bytes.as_ref()) {
        match raw.and_then(|raw| SessionLine::parse(raw, line_no)).and_then(|line| {
            let rendered = line.render()?;
            Ok((line.igt, rendered))
        }) {
            Ok(entry) => parsed.push(entry),
            Err(err) => {
                skipped += 1;
                append_run_log(
                    "warn",
                    "postprocess.malformed_line",
                    json!({ "line": line_no, "error": err.to_string() }),
                );
            }
        }
    }

    let reordered = parsed.windows(2).any(|w| w[0].0 > w[1].0);
    parsed.sort_by(|a, b| a.0.total_cmp(&b.0));
    let summary = SortSummary {
        kept: parsed.len(),
        skipped,
        reordered,
    };
    (parsed.into_iter().map(|(_, line)| line).collect(), summary)
}

/// Per-kind counts and IGT range of a session file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub counts: BTreeMap<RecordKind, usize>,
    pub malformed: usize,
    pub first_igt: Option<f64>,
    pub last_igt: Option<f64>,
    pub sorted: bool,
}

impl SessionStats {
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}

pub fn inspect_lines(bytes: impl AsRef<[u8]>) -> SessionStats {
    let mut stats = SessionStats {
        sorted: true,
        ..SessionStats::default()
    };
    let mut previous: Option<f64> = None;
    for (line_no, raw) in session_lines(bytes.as_ref()) {
        let record = match raw.and_then(|raw| Record::from_line(raw, line_no)) {
            Ok(record) => record,
            Err(_) => {
                stats.malformed += 1;
                continue;
            }
        };
        let igt = record.igt();
        *stats.counts.entry(record.kind()).or_insert(0) += 1;
        if previous.is_some_and(|p| igt < p) {
            stats.sorted = false;
        }
        previous = Some(igt);
        stats.first_igt = Some(stats.first_igt.map_or(igt, |f| f.min(igt)));
        stats.last_igt = Some(stats.last_igt.map_or(igt, |l| l.max(igt)));
    }
    stats
}

/// Sort the session file at `path` in place, keeping the original as
/// `<path>.backup`.
pub fn sort_session_file(path: &Path) -> Result<SortSummary, ReplayError> {
    let bytes = fs::read(path).map_err(|e| ReplayError::Io(e.to_string()))?;
    let (lines, summary) = sort_lines(&bytes);

    let temp = temp_path(path);
    {
        let mut file = fs::File::create(&temp).map_err(|e| ReplayError::Io(e.to_string()))?;
        for line in &lines {
            file.write_all(line.as_bytes())
                .and_then(|_| file.write_all(b"\n"))
                .map_err(|e| ReplayError::Io(e.to_string()))?;
        }
        file.sync_all().map_err(|e| ReplayError::Io(e.to_string()))?;
    }
    let backup = copy_to_backup(path)?;
    fs::rename(&temp, path).map_err(|e| ReplayError::Io(e.to_string()))?;

    append_run_log(
        "info",
        "postprocess.sorted",
        json!({
            "path": path.display().to_string(),
            "backup": backup.display().to_string(),
            "kept": summary.kept,
            "skipped": summary.skipped,
            "reordered": summary.reordered,
        }),
    );
    Ok(summary)
}
