use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Key,
    Mouse,
    State,
}

impl RecordKind {
    pub const ALL: [RecordKind; 3] = [Self::Key, Self::Mouse, Self::State];

    /// Field name carrying this kind's payload in a session line.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Key => "KEY",
            Self::Mouse => "MOUSE",
            Self::State => "STATE",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Key => "key",
            Self::Mouse => "mouse",
            Self::State => "state",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Idle,
    Running,
    Paused,
    Stopped,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Idle,
    Recording,
    Playing,
}

impl SessionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Recording => "recording",
            Self::Playing => "playing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    Unbatched,
    Batched,
}

impl ReplayMode {
    /// State samples cluster at the polling cadence; input events do not.
    pub fn for_kind(kind: RecordKind) -> Self {
        match kind {
            RecordKind::State => Self::Batched,
            RecordKind::Key | RecordKind::Mouse => Self::Unbatched,
        }
    }
}
