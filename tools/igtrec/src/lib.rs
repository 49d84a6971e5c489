pub mod batch;
pub mod capture;
pub mod clock;
pub mod config;
pub mod controller;
pub mod delay;
pub mod errors;
pub mod log_retention;
pub mod logging;
pub mod postprocess;
pub mod record;
pub mod runtime;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod types;

use clap::{error::ErrorKind, Parser, Subcommand};
use clock::format_igt;
use config::{load_config, AppConfig, CliOverrides};
use controller::{SessionContext, SessionController, SessionReport};
use errors::ReplayError;
use logging::{append_run_log, clear_run_logger, init_run_logger};
use postprocess::{inspect_lines, sort_session_file, SessionStats};
use runtime::{ProductionRuntime, SimulatedStateSource, StateWriteBack, TerminalActionSink};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use types::RecordKind;

#[derive(Debug, Clone, Parser)]
#[command(name = "igtrec")]
#[command(about = "Record and replay input sessions against an in-game clock")]
pub struct Cli {
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long, global = true, default_value_t = false)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Sort a session file by IGT in place, keeping a .backup copy
    Sort { file: PathBuf },
    /// Summarize a session file
    Inspect { file: PathBuf },
    /// Dry-run playback against a simulated game, printing every action
    Simulate {
        #[arg(long)]
        file: Option<PathBuf>,
        /// IGT the simulated game starts at; defaults to the first record
        #[arg(long = "start-igt")]
        start_igt: Option<f64>,
    },
}

pub fn run() -> Result<i32, ReplayError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let runtime = ProductionRuntime::new();
    run_with_runtime(&args, &runtime)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    runtime: &ProductionRuntime,
) -> Result<i32, ReplayError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(ReplayError::Cli(error.to_string())),
        },
    };

    let overrides = CliOverrides {
        config_path: cli.config.clone(),
        verbose: cli.verbose,
        playback_file: match &cli.command {
            Command::Simulate { file, .. } => file.clone(),
            _ => None,
        },
        ..CliOverrides::default()
    };
    let cfg = load_config(&overrides, runtime.file_system.as_ref())?;
    init_run_logger(&cfg.logging.run_log_path)?;
    append_run_log(
        "info",
        "cli.started",
        json!({ "command": command_name(&cli.command) }),
    );

    let result = match &cli.command {
        Command::Sort { file } => run_sort(runtime, file),
        Command::Inspect { file } => run_inspect(runtime, file),
        Command::Simulate { start_igt, .. } => run_simulate(runtime, cfg, *start_igt),
    };

    if let Err(err) = &result {
        append_run_log(
            "error",
            "cli.failed",
            json!({ "command": command_name(&cli.command), "error": err.to_string() }),
        );
    }
    clear_run_logger();
    result
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Sort { .. } => "sort",
        Command::Inspect { .. } => "inspect",
        Command::Simulate { .. } => "simulate",
    }
}

fn run_sort(runtime: &ProductionRuntime, file: &Path) -> Result<i32, ReplayError> {
    let summary = sort_session_file(file)?;
    runtime.terminal.write_line(&format!(
        "sorted {}: kept={} skipped={} reordered={}",
        file.display(),
        summary.kept,
        summary.skipped,
        summary.reordered
    ))?;
    Ok(0)
}

fn run_inspect(runtime: &ProductionRuntime, file: &Path) -> Result<i32, ReplayError> {
    let bytes = runtime.file_system.read(file)?;
    let stats = inspect_lines(&bytes);
    for line in render_stats(&stats) {
        runtime.terminal.write_line(&line)?;
    }
    Ok(0)
}

fn render_stats(stats: &SessionStats) -> Vec<String> {
    let mut lines = vec![format!("records: {}", stats.total())];
    for kind in RecordKind::ALL {
        lines.push(format!(
            "  {}: {}",
            kind.tag(),
            stats.counts.get(&kind).copied().unwrap_or(0)
        ));
    }
    match (stats.first_igt, stats.last_igt) {
        (Some(first), Some(last)) => lines.push(format!(
            "igt: {} - {}",
            format_igt(first),
            format_igt(last)
        )),
        _ => lines.push("igt: -".to_string()),
    }
    lines.push(format!("malformed: {}", stats.malformed));
    lines.push(format!("sorted: {}", stats.sorted));
    lines
}

fn run_simulate(
    runtime: &ProductionRuntime,
    cfg: AppConfig,
    start_igt: Option<f64>,
) -> Result<i32, ReplayError> {
    let path = cfg.playback_path();
    let bytes = runtime.file_system.read(&path)?;
    let start = start_igt
        .or(inspect_lines(&bytes).first_igt)
        .unwrap_or(0.0);

    let tokio_rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| ReplayError::Io(e.to_string()))?;
    let terminal = Arc::clone(&runtime.terminal);
    let file_system = Arc::clone(&runtime.file_system);
    let report = tokio_rt.block_on(async move {
        let game = Arc::new(SimulatedStateSource::new(start));
        let actions = Arc::new(StateWriteBack::new(
            Arc::new(TerminalActionSink::new(terminal)),
            game.clone(),
        ));
        let ctx = SessionContext::new(cfg, game, actions).with_file_system(file_system);
        let mut controller = SessionController::new(ctx);
        controller.start_playback()?;
        controller.wait_for_playback().await
    })?;

    runtime.terminal.write_line(&render_report(&report))?;
    Ok(0)
}

fn render_report(report: &SessionReport) -> String {
    let mut parts = vec![format!("simulated {}", report.path.display())];
    for (kind, channel) in &report.channels {
        parts.push(format!(
            "{}: dispatched={} performed={} failed={}",
            kind.tag(),
            channel.dispatched,
            channel.performed,
            channel.failed
        ));
    }
    if let Some(source) = &report.source {
        parts.push(format!("malformed={}", source.malformed));
    }
    parts.join(" | ")
}
