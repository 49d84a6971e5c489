use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReplayError {
    #[error("clock unavailable: state source is disconnected")]
    ClockUnavailable,
    #[error("malformed record on line {line}: {reason}")]
    MalformedRecord { line: usize, reason: String },
    #[error("queue closed")]
    QueueClosed,
    #[error("cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    ConfigParse(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("cli error: {0}")]
    Cli(String),
    #[error("illegal transition: {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },
    #[error("action error: {0}")]
    Action(String),
}

impl ReplayError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn malformed(line: usize, reason: impl Into<String>) -> Self {
        Self::MalformedRecord {
            line,
            reason: reason.into(),
        }
    }
}
