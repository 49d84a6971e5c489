use crate::errors::ReplayError;
use crate::runtime::FileSystem;
use crate::types::RecordKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub verbose: bool,
    pub output_dir: Option<PathBuf>,
    pub playback_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub clock: ClockConfig,
    pub recording: ChannelFlags,
    pub playback: PlaybackConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    pub output_dir: PathBuf,
    pub output_file: String,
    pub playback_file: Option<PathBuf>,
    pub sort_on_stop: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClockConfig {
    pub state_interval_ms: u64,
    pub max_sync_interval_ms: u64,
    pub reconnect_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelFlags {
    pub key: bool,
    pub mouse: bool,
    pub state: bool,
}

impl ChannelFlags {
    pub fn enabled(&self, kind: RecordKind) -> bool {
        match kind {
            RecordKind::Key => self.key,
            RecordKind::Mouse => self.mouse,
            RecordKind::State => self.state,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlaybackConfig {
    pub key: bool,
    pub mouse: bool,
    pub state: bool,
    pub batch_window_secs: f64,
    pub smart_delay_threshold_ms: f64,
    pub min_delay_ms: f64,
    pub idle_poll_ms: u64,
}

impl PlaybackConfig {
    pub fn channels(&self) -> ChannelFlags {
        ChannelFlags {
            key: self.key,
            mouse: self.mouse,
            state: self.state,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub verbose: bool,
    pub run_log_path: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig {
                output_dir: PathBuf::from("recordings"),
                output_file: "session.jsonl".to_string(),
                playback_file: None,
                sort_on_stop: true,
            },
            clock: ClockConfig {
                state_interval_ms: 50,
                max_sync_interval_ms: 50,
                reconnect_interval_ms: 500,
            },
            recording: ChannelFlags {
                key: true,
                mouse: true,
                state: true,
            },
            playback: PlaybackConfig {
                key: true,
                mouse: true,
                state: true,
                batch_window_secs: 0.5,
                smart_delay_threshold_ms: 1000.0,
                min_delay_ms: 100.0,
                idle_poll_ms: 100,
            },
            logging: LoggingConfig {
                verbose: false,
                run_log_path: PathBuf::from(".igtrec/logs/run.jsonl"),
            },
        }
    }
}

impl AppConfig {
    /// Clock refresh cadence: never slower than the state sampler.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(
            self.clock
                .state_interval_ms
                .min(self.clock.max_sync_interval_ms),
        )
    }

    pub fn state_interval(&self) -> Duration {
        Duration::from_millis(self.clock.state_interval_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.clock.reconnect_interval_ms)
    }

    pub fn output_path(&self) -> PathBuf {
        self.session.output_dir.join(&self.session.output_file)
    }

    /// The file replayed by a playback session; defaults to the recording
    /// output.
    pub fn playback_path(&self) -> PathBuf {
        self.session
            .playback_file
            .clone()
            .unwrap_or_else(|| self.output_path())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialAppConfig {
    session: Option<PartialSessionConfig>,
    clock: Option<PartialClockConfig>,
    recording: Option<PartialChannelFlags>,
    playback: Option<PartialPlaybackConfig>,
    logging: Option<PartialLoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialSessionConfig {
    output_dir: Option<PathBuf>,
    output_file: Option<String>,
    playback_file: Option<PathBuf>,
    sort_on_stop: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialClockConfig {
    state_interval_ms: Option<u64>,
    max_sync_interval_ms: Option<u64>,
    reconnect_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialChannelFlags {
    key: Option<bool>,
    mouse: Option<bool>,
    state: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialPlaybackConfig {
    key: Option<bool>,
    mouse: Option<bool>,
    state: Option<bool>,
    batch_window_secs: Option<f64>,
    smart_delay_threshold_ms: Option<f64>,
    min_delay_ms: Option<f64>,
    idle_poll_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct PartialLoggingConfig {
    verbose: Option<bool>,
    run_log_path: Option<PathBuf>,
}

pub fn load_config(
    overrides: &CliOverrides,
    fs: &dyn FileSystem,
) -> Result<AppConfig, ReplayError> {
    let mut cfg = AppConfig::default();

    if let Some(path) = &overrides.config_path {
        let file_contents = fs.read_to_string(path)?;
        cfg = parse_config_str(&file_contents)?;
    }

    apply_cli_overrides(&mut cfg, overrides);
    validate_config(&cfg)?;
    Ok(cfg)
}

/// Defaults with `text` merged over them. Not validated.
pub fn parse_config_str(text: &str) -> Result<AppConfig, ReplayError> {
    let partial: PartialAppConfig =
        toml::from_str(text).map_err(|e| ReplayError::ConfigParse(e.to_string()))?;
    let mut cfg = AppConfig::default();
    merge_partial_config(&mut cfg, partial);
    Ok(cfg)
}

fn merge_partial_config(cfg: &mut AppConfig, partial: PartialAppConfig) {
    if let Some(session) = partial.session {
        if let Some(value) = session.output_dir {
            cfg.session.output_dir = value;
        }
        if let Some(value) = session.output_file {
            cfg.session.output_file = value;
        }
        if let Some(value) = session.playback_file {
            cfg.session.playback_file = Some(value);
        }
        if let Some(value) = session.sort_on_stop {
            cfg.session.sort_on_stop = value;
        }
    }

    if let Some(clock) = partial.clock {
        if let Some(value) = clock.state_interval_ms {
            cfg.clock.state_interval_ms = value;
        }
        if let Some(value) = clock.max_sync_interval_ms {
            cfg.clock.max_sync_interval_ms = value;
        }
        if let Some(value) = clock.reconnect_interval_ms {
            cfg.clock.reconnect_interval_ms = value;
        }
    }

    if let Some(recording) = partial.recording {
        merge_flags(&mut cfg.recording, recording);
    }

    if let Some(playback) = partial.playback {
        let mut flags = cfg.playback.channels();
        merge_flags(
            &mut flags,
            PartialChannelFlags {
                key: playback.key,
                mouse: playback.mouse,
                state: playback.state,
            },
        );
        cfg.playback.key = flags.key;
        cfg.playback.mouse = flags.mouse;
        cfg.playback.state = flags.state;
        if let Some(value) = playback.batch_window_secs {
            cfg.playback.batch_window_secs = value;
        }
        if let Some(value) = playback.smart_delay_threshold_ms {
            cfg.playback.smart_delay_threshold_ms = value;
        }
        if let Some(value) = playback.min_delay_ms {
            cfg.playback.min_delay_ms = value;
        }
        if let Some(value) = playback.idle_poll_ms {
            cfg.playback.idle_poll_ms = value;
        }
    }

    if let Some(logging) = partial.logging {
        if let Some(value) = logging.verbose {
            cfg.logging.verbose = value;
        }
        if let Some(value) = logging.run_log_path {
            cfg.logging.run_log_path = value;
        }
    }
}

fn merge_flags(flags: &mut ChannelFlags, partial: PartialChannelFlags) {
    if let Some(value) = partial.key {
        flags.key = value;
    }
    if let Some(value) = partial.mouse {
        flags.mouse = value;
    }
    if let Some(value) = partial.state {
        flags.state = value;
    }
}

fn apply_cli_overrides(cfg: &mut AppConfig, overrides: &CliOverrides) {
    if overrides.verbose {
        cfg.logging.verbose = true;
    }
    if let Some(dir) = &overrides.output_dir {
        cfg.session.output_dir = dir.clone();
    }
    if let Some(file) = &overrides.playback_file {
        cfg.session.playback_file = Some(file.clone());
    }
}

/// The clock must refresh often enough for the gate and SmartDelay to track
/// IGT closely.
pub const MAX_SYNC_INTERVAL_CAP_MS: u64 = 50;

pub fn validate_config(cfg: &AppConfig) -> Result<(), ReplayError> {
    if cfg.session.output_file.trim().is_empty() {
        return Err(ReplayError::InvalidConfig(
            "session.output_file must not be empty".to_string(),
        ));
    }
    if Path::new(&cfg.session.output_file).file_name().is_none() {
        return Err(ReplayError::InvalidConfig(
            "session.output_file must name a file".to_string(),
        ));
    }

    for (name, value) in [
        ("clock.state_interval_ms", cfg.clock.state_interval_ms),
        ("clock.max_sync_interval_ms", cfg.clock.max_sync_interval_ms),
        ("clock.reconnect_interval_ms", cfg.clock.reconnect_interval_ms),
        ("playback.idle_poll_ms", cfg.playback.idle_poll_ms),
    ] {
        if value == 0 {
            return Err(ReplayError::InvalidConfig(format!(
                "{name} must be greater than zero"
            )));
        }
    }

    if cfg.clock.max_sync_interval_ms > MAX_SYNC_INTERVAL_CAP_MS {
        return Err(ReplayError::InvalidConfig(format!(
            "clock.max_sync_interval_ms must be at most {MAX_SYNC_INTERVAL_CAP_MS}"
        )));
    }

    if !(cfg.playback.batch_window_secs.is_finite() && cfg.playback.batch_window_secs > 0.0) {
        return Err(ReplayError::InvalidConfig(
            "playback.batch_window_secs must be a positive number".to_string(),
        ));
    }

    for (name, value) in [
        (
            "playback.smart_delay_threshold_ms",
            cfg.playback.smart_delay_threshold_ms,
        ),
        ("playback.min_delay_ms", cfg.playback.min_delay_ms),
    ] {
        if !value.is_finite() || value < 0.0 {
            return Err(ReplayError::InvalidConfig(format!(
                "{name} must not be negative"
            )));
        }
    }

    // Log retention prunes every *.jsonl beside the run log.
    let log_dir = cfg
        .logging
        .run_log_path
        .parent()
        .unwrap_or_else(|| Path::new(""));
    let session_dirs = [
        Some(cfg.session.output_dir.as_path()),
        cfg.session.playback_file.as_deref().and_then(Path::parent),
    ];
    if session_dirs.into_iter().flatten().any(|dir| dir == log_dir) {
        return Err(ReplayError::InvalidConfig(
            "logging.run_log_path must not share a directory with session files".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::FakeFileSystem;

    #[test]
    fn defaults_are_valid_and_refresh_uses_the_faster_interval() {
        let mut cfg = AppConfig::default();
        validate_config(&cfg).expect("defaults valid");
        cfg.clock.state_interval_ms = 20;
        assert_eq!(cfg.refresh_interval(), Duration::from_millis(20));
        cfg.clock.state_interval_ms = 200;
        assert_eq!(cfg.refresh_interval(), Duration::from_millis(50));
        assert_eq!(cfg.output_path(), PathBuf::from("recordings/session.jsonl"));
        assert_eq!(cfg.playback_path(), cfg.output_path());
    }

    #[test]
    fn file_values_merge_over_defaults_and_cli_wins() {
        let fs = FakeFileSystem::with_file(
            "igtrec.toml",
            r#"
[session]
output_file = "run.jsonl"

[playback]
mouse = false
batch_window_secs = 0.25

[logging]
verbose = false
"#,
        );
        let cfg = load_config(
            &CliOverrides {
                config_path: Some(PathBuf::from("igtrec.toml")),
                verbose: true,
                playback_file: Some(PathBuf::from("other.jsonl")),
                ..CliOverrides::default()
            },
            &fs,
        )
        .expect("config");

        assert_eq!(cfg.session.output_file, "run.jsonl");
        assert!(cfg.session.sort_on_stop);
        assert!(!cfg.playback.mouse);
        assert!(cfg.playback.key);
        assert_eq!(cfg.playback.batch_window_secs, 0.25);
        assert!(cfg.logging.verbose);
        assert_eq!(cfg.playback_path(), PathBuf::from("other.jsonl"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let cfg = parse_config_str("[clock]\nstate_interval_ms = 0\n").expect("parse");
        let err = validate_config(&cfg).expect_err("zero interval");
        assert!(err.to_string().contains("clock.state_interval_ms"));

        let cfg = parse_config_str("[clock]\nmax_sync_interval_ms = 500\n").expect("parse");
        let err = validate_config(&cfg).expect_err("coarse refresh");
        assert!(err.to_string().contains("at most 50"));
        let cfg = parse_config_str("[clock]\nmax_sync_interval_ms = 50\n").expect("parse");
        validate_config(&cfg).expect("cap itself is allowed");

        let cfg = parse_config_str("[playback]\nbatch_window_secs = -1.0\n").expect("parse");
        assert!(validate_config(&cfg).is_err());

        let cfg = parse_config_str("[session]\noutput_file = \"  \"\n").expect("parse");
        assert!(validate_config(&cfg).is_err());

        let cfg = parse_config_str(
            "[session]\noutput_dir = \"logs\"\n[logging]\nrun_log_path = \"logs/run.jsonl\"\n",
        )
        .expect("parse");
        let err = validate_config(&cfg).expect_err("shared directory");
        assert!(err.to_string().contains("logging.run_log_path"));

        assert!(matches!(
            parse_config_str("[clock\n"),
            Err(ReplayError::ConfigParse(_))
        ));
    }
}
