//! Record model and the session-file line format.
//!
//! A session file is UTF-8 JSONL. Each line carries the virtual timestamp in
//! `IGT` and exactly one payload under `KEY`, `MOUSE` or `STATE`:
//!
//! ```text
//! {"IGT":12.5,"KEY":{"IGT":12.5,"Key":"W","Duration":180.0}}
//! {"IGT":12.52,"MOUSE":{"IGT":12.52,"MouseX":640,"MouseY":360,"DeltaX":-3,"DeltaY":1}}
//! {"IGT":12.55,"STATE":{"IGT":12.55,"X":1.0,"Y":2.0,"Z":3.0}}
//! ```
//!
//! Unknown top-level fields are kept on [`SessionLine::extra`] so a rewrite
//! (post-process sort) does not drop them.

use crate::errors::ReplayError;
use crate::types::RecordKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

// ── Records ───────────────────────────────────────────────────────────────────

/// A completed press/release pair; `igt` is the press time.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyPress {
    pub igt: f64,
    pub key: String,
    pub duration_ms: f64,
}

/// One raw pointer tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointerSample {
    pub igt: f64,
    pub abs_x: i32,
    pub abs_y: i32,
    pub delta_x: i32,
    pub delta_y: i32,
}

/// Game position sampled at the state polling cadence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateSample {
    pub igt: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Key(KeyPress),
    Pointer(PointerSample),
    State(StateSample),
}

impl Record {
    pub fn igt(&self) -> f64 {
        match self {
            Self::Key(r) => r.igt,
            Self::Pointer(r) => r.igt,
            Self::State(r) => r.igt,
        }
    }

    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Key(_) => RecordKind::Key,
            Self::Pointer(_) => RecordKind::Mouse,
            Self::State(_) => RecordKind::State,
        }
    }

    /// Parse one session-file line. `line_no` is 1-based and only used for
    /// error reporting.
    pub fn from_line(line: &str, line_no: usize) -> Result<Self, ReplayError> {
        SessionLine::parse(line, line_no)?.into_record(line_no)
    }

    pub fn to_line(&self) -> Result<String, ReplayError> {
        SessionLine::from(self).render()
    }
}

/// Decode one raw line. Bytes that are not UTF-8 make the line malformed.
pub fn decode_line(raw: &[u8], line_no: usize) -> Result<&str, ReplayError> {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    std::str::from_utf8(raw)
        .map_err(|e| ReplayError::malformed(line_no, format!("invalid UTF-8: {e}")))
}

/// Numbered, non-blank lines of a session file.
pub fn session_lines(
    bytes: &[u8],
) -> impl Iterator<Item = (usize, Result<&str, ReplayError>)> + '_ {
    bytes
        .split(|b| *b == b'\n')
        .enumerate()
        .map(|(idx, raw)| (idx + 1, decode_line(raw, idx + 1)))
        .filter(|(_, line)| !matches!(line, Ok(text) if text.trim().is_empty()))
}

impl From<KeyPress> for Record {
    fn from(value: KeyPress) -> Self {
        Self::Key(value)
    }
}

impl From<PointerSample> for Record {
    fn from(value: PointerSample) -> Self {
        Self::Pointer(value)
    }
}

impl From<StateSample> for Record {
    fn from(value: StateSample) -> Self {
        Self::State(value)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(r) => write!(f, "KEY {} for {:.1}ms @ {:.3}", r.key, r.duration_ms, r.igt),
            Self::Pointer(r) => write!(
                f,
                "MOUSE ({}, {}) d=({}, {}) @ {:.3}",
                r.abs_x, r.abs_y, r.delta_x, r.delta_y, r.igt
            ),
            Self::State(r) => write!(f, "STATE ({}, {}, {}) @ {:.3}", r.x, r.y, r.z, r.igt),
        }
    }
}

// ── Wire format ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyPayload {
    #[serde(rename = "IGT", default, skip_serializing_if = "Option::is_none")]
    pub igt: Option<f64>,
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "Duration")]
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MousePayload {
    #[serde(rename = "IGT", default, skip_serializing_if = "Option::is_none")]
    pub igt: Option<f64>,
    #[serde(rename = "MouseX")]
    pub mouse_x: i32,
    #[serde(rename = "MouseY")]
    pub mouse_y: i32,
    #[serde(rename = "DeltaX")]
    pub delta_x: i32,
    #[serde(rename = "DeltaY")]
    pub delta_y: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatePayload {
    #[serde(rename = "IGT", default, skip_serializing_if = "Option::is_none")]
    pub igt: Option<f64>,
    #[serde(rename = "X")]
    pub x: f64,
    #[serde(rename = "Y")]
    pub y: f64,
    #[serde(rename = "Z")]
    pub z: f64,
}

/// One line of a session file, before the payload has been discriminated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionLine {
    #[serde(rename = "IGT")]
    pub igt: f64,
    #[serde(rename = "KEY", default, skip_serializing_if = "Option::is_none")]
    pub key: Option<KeyPayload>,
    #[serde(rename = "MOUSE", default, skip_serializing_if = "Option::is_none")]
    pub mouse: Option<MousePayload>,
    #[serde(rename = "STATE", default, skip_serializing_if = "Option::is_none")]
    pub state: Option<StatePayload>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SessionLine {
    pub fn parse(line: &str, line_no: usize) -> Result<Self, ReplayError> {
        let parsed: SessionLine = serde_json::from_str(line.trim())
            .map_err(|e| ReplayError::malformed(line_no, e.to_string()))?;
        if !parsed.igt.is_finite() {
            return Err(ReplayError::malformed(line_no, "IGT is not finite"));
        }
        parsed.kind(line_no)?;
        Ok(parsed)
    }

    /// The single payload kind carried by this line.
    pub fn kind(&self, line_no: usize) -> Result<RecordKind, ReplayError> {
        let present = [
            (RecordKind::Key, self.key.is_some()),
            (RecordKind::Mouse, self.mouse.is_some()),
            (RecordKind::State, self.state.is_some()),
        ];
        let mut kinds = present.iter().filter(|(_, set)| *set).map(|(kind, _)| *kind);
        match (kinds.next(), kinds.next()) {
            (Some(kind), None) => Ok(kind),
            (None, _) => Err(ReplayError::malformed(
                line_no,
                "line carries no KEY, MOUSE or STATE payload",
            )),
            (Some(_), Some(_)) => Err(ReplayError::malformed(
                line_no,
                "line carries more than one payload",
            )),
        }
    }

    pub fn into_record(self, line_no: usize) -> Result<Record, ReplayError> {
        let igt = self.igt;
        match (self.key, self.mouse, self.state) {
            (Some(key), None, None) => Ok(Record::Key(KeyPress {
                igt: key.igt.unwrap_or(igt),
                key: key.key,
                duration_ms: key.duration,
            })),
            (None, Some(mouse), None) => Ok(Record::Pointer(PointerSample {
                igt: mouse.igt.unwrap_or(igt),
                abs_x: mouse.mouse_x,
                abs_y: mouse.mouse_y,
                delta_x: mouse.delta_x,
                delta_y: mouse.delta_y,
            })),
            (None, None, Some(state)) => Ok(Record::State(StateSample {
                igt: state.igt.unwrap_or(igt),
                x: state.x,
                y: state.y,
                z: state.z,
            })),
            _ => Err(ReplayError::malformed(
                line_no,
                "line must carry exactly one of KEY, MOUSE or STATE",
            )),
        }
    }

    pub fn render(&self) -> Result<String, ReplayError> {
        if !self.igt.is_finite() {
            return Err(ReplayError::Io(format!(
                "refusing to serialize non-finite IGT {}",
                self.igt
            )));
        }
        serde_json::to_string(self).map_err(|e| ReplayError::Io(e.to_string()))
    }
}

impl From<&Record> for SessionLine {
    fn from(record: &Record) -> Self {
        let mut line = SessionLine {
            igt: record.igt(),
            key: None,
            mouse: None,
            state: None,
            extra: Map::new(),
        };
        match record {
            Record::Key(r) => {
                line.key = Some(KeyPayload {
                    igt: Some(r.igt),
                    key: r.key.clone(),
                    duration: r.duration_ms,
                });
            }
            Record::Pointer(r) => {
                line.mouse = Some(MousePayload {
                    igt: Some(r.igt),
                    mouse_x: r.abs_x,
                    mouse_y: r.abs_y,
                    delta_x: r.delta_x,
                    delta_y: r.delta_y,
                });
            }
            Record::State(r) => {
                line.state = Some(StatePayload {
                    igt: Some(r.igt),
                    x: r.x,
                    y: r.y,
                    z: r.z,
                });
            }
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<Record> {
        vec![
            Record::Key(KeyPress {
                igt: 12.345_678,
                key: "LShiftKey".to_string(),
                duration_ms: 183.333_333_3,
            }),
            Record::Pointer(PointerSample {
                igt: 12.35,
                abs_x: 640,
                abs_y: 360,
                delta_x: -3,
                delta_y: 7,
            }),
            Record::State(StateSample {
                igt: 0.1,
                x: -1520.25,
                y: 88.0625,
                z: 3.000_000_1,
            }),
        ]
    }

    #[test]
    fn every_kind_round_trips_through_a_line() {
        for record in samples() {
            let line = record.to_line().expect("serialize");
            assert!(!line.contains('\n'));
            let back = Record::from_line(&line, 1).expect("parse");
            assert_eq!(back, record);
        }
    }

    #[test]
    fn line_uses_the_tagged_wire_layout() {
        let line = samples()[0].to_line().expect("serialize");
        let value: Value = serde_json::from_str(&line).expect("json");
        assert_eq!(value["IGT"], 12.345_678);
        assert_eq!(value["KEY"]["Key"], "LShiftKey");
        assert!(value.get("MOUSE").is_none());
        assert!(value.get("STATE").is_none());
    }

    #[test]
    fn unknown_fields_are_tolerated_and_kept() {
        let line = r#"{"IGT":3.5,"STATE":{"X":1.0,"Y":2.0,"Z":3.0},"Map":"welcome_center"}"#;
        let parsed = SessionLine::parse(line, 4).expect("parse");
        assert_eq!(parsed.extra.get("Map"), Some(&Value::from("welcome_center")));
        let record = parsed.clone().into_record(4).expect("record");
        assert_eq!(record.igt(), 3.5, "payload IGT falls back to the line IGT");
        let rendered = parsed.render().expect("render");
        assert!(rendered.contains("\"Map\":\"welcome_center\""));
    }

    #[test]
    fn lines_without_exactly_one_payload_are_malformed() {
        let empty = Record::from_line(r#"{"IGT":1.0}"#, 2).expect_err("no payload");
        assert!(matches!(empty, ReplayError::MalformedRecord { line: 2, .. }));

        let double = r#"{"IGT":1.0,"KEY":{"Key":"A","Duration":1.0},"STATE":{"X":0.0,"Y":0.0,"Z":0.0}}"#;
        let err = Record::from_line(double, 9).expect_err("two payloads");
        assert!(matches!(err, ReplayError::MalformedRecord { line: 9, ref reason } if reason.contains("more than one")));

        assert!(Record::from_line("not json", 1).is_err());
        assert!(Record::from_line(r#"{"KEY":{"Key":"A","Duration":1.0}}"#, 1).is_err());
    }

    #[test]
    fn session_lines_skip_blanks_and_flag_invalid_utf8() {
        let bytes = b"first\r\n\n  \n{\"Key\":\"\xff\xfe\"}\nlast";
        let lines = session_lines(bytes).collect::<Vec<_>>();

        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], (1, Ok("first")));
        assert!(matches!(
            lines[1],
            (4, Err(ReplayError::MalformedRecord { line: 4, ref reason })) if reason.contains("UTF-8")
        ));
        assert_eq!(lines[2], (5, Ok("last")));
    }
}
