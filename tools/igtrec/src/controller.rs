use crate::capture::{KeyCapture, PointerCapture, StateSampler};
use crate::clock::{GameClock, VirtualClock};
use crate::config::AppConfig;
use crate::errors::ReplayError;
use crate::logging::append_run_log;
use crate::postprocess::{sort_session_file, SortSummary};
use crate::runtime::{ActionSink, FileSystem, ProductionFileSystem, StateSource};
use crate::scheduler::{ChannelControl, PlaybackScheduler, PlaybackSummary, SchedulerSettings};
use crate::sink::DurableRecordSink;
use crate::source::{RecordRouter, RecordSource, SourceSummary};
use crate::types::{RecordKind, SessionMode};
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Everything a session needs, passed explicitly.
#[derive(Clone)]
pub struct SessionContext {
    pub config: AppConfig,
    pub clock: Arc<VirtualClock>,
    pub state_source: Arc<dyn StateSource>,
    pub actions: Arc<dyn ActionSink>,
    pub file_system: Arc<dyn FileSystem>,
}

impl SessionContext {
    pub fn new(
        config: AppConfig,
        state_source: Arc<dyn StateSource>,
        actions: Arc<dyn ActionSink>,
    ) -> Self {
        Self {
            config,
            clock: Arc::new(VirtualClock::new()),
            state_source,
            actions,
            file_system: Arc::new(ProductionFileSystem),
        }
    }

    pub fn with_file_system(mut self, file_system: Arc<dyn FileSystem>) -> Self {
        self.file_system = file_system;
        self
    }

    fn verbose(&self) -> bool {
        self.config.logging.verbose
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelReport {
    pub written: usize,
    pub dispatched: usize,
    pub performed: usize,
    pub withheld: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub mode: SessionMode,
    pub path: PathBuf,
    pub channels: BTreeMap<RecordKind, ChannelReport>,
    pub lines_written: usize,
    pub sort: Option<SortSummary>,
    pub source: Option<SourceSummary>,
    pub cancelled: bool,
}

impl SessionReport {
    fn new(mode: SessionMode, path: PathBuf) -> Self {
        Self {
            mode,
            path,
            channels: BTreeMap::new(),
            lines_written: 0,
            sort: None,
            source: None,
            cancelled: false,
        }
    }
}

struct RecordingSession {
    cancel: CancellationToken,
    refresh: JoinHandle<()>,
    sink: Arc<DurableRecordSink>,
    controls: Vec<Arc<ChannelControl>>,
    keys: Option<Arc<KeyCapture>>,
    pointer: Option<Arc<PointerCapture>>,
    sampler: Option<(Arc<StateSampler>, JoinHandle<usize>)>,
}

struct PlaybackSession {
    cancel: CancellationToken,
    refresh: JoinHandle<()>,
    path: PathBuf,
    schedulers: Vec<(PlaybackScheduler, JoinHandle<PlaybackSummary>)>,
    source: JoinHandle<Result<SourceSummary, ReplayError>>,
}

enum ActiveSession {
    Recording(RecordingSession),
    Playing(PlaybackSession),
}

impl ActiveSession {
    fn mode(&self) -> SessionMode {
        match self {
            Self::Recording(_) => SessionMode::Recording,
            Self::Playing(_) => SessionMode::Playing,
        }
    }
}

/// Runs at most one session at a time. Each session owns a fresh
/// cancellation scope; the clock refresh, the sink or source, the captures
/// and the schedulers all hang off child tokens of that scope.
pub struct SessionController {
    ctx: SessionContext,
    active: Option<ActiveSession>,
}

impl SessionController {
    pub fn new(ctx: SessionContext) -> Self {
        Self { ctx, active: None }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn mode(&self) -> SessionMode {
        self.active
            .as_ref()
            .map(ActiveSession::mode)
            .unwrap_or(SessionMode::Idle)
    }

    /// Key capture of the running recording, for the keyboard hook to feed.
    pub fn key_capture(&self) -> Option<Arc<KeyCapture>> {
        match &self.active {
            Some(ActiveSession::Recording(session)) => session.keys.clone(),
            _ => None,
        }
    }

    /// Pointer capture of the running recording, for the raw input hook.
    pub fn pointer_capture(&self) -> Option<Arc<PointerCapture>> {
        match &self.active {
            Some(ActiveSession::Recording(session)) => session.pointer.clone(),
            _ => None,
        }
    }

    fn ensure_idle(&self, to: SessionMode) -> Result<(), ReplayError> {
        match &self.active {
            None => Ok(()),
            Some(active) => Err(ReplayError::InvalidTransition {
                from: active.mode().as_str(),
                to: to.as_str(),
            }),
        }
    }

    fn spawn_refresh(&self, cancel: &CancellationToken) -> JoinHandle<()> {
        let cfg = &self.ctx.config;
        self.ctx.clock.spawn_refresh(
            Arc::clone(&self.ctx.state_source),
            cfg.refresh_interval(),
            cfg.reconnect_interval(),
            cancel.child_token(),
        )
    }

    pub fn start_recording(&mut self) -> Result<(), ReplayError> {
        self.ensure_idle(SessionMode::Recording)?;
        let cfg = &self.ctx.config;
        let cancel = CancellationToken::new();
        let path = cfg.output_path();
        let sink = Arc::new(DurableRecordSink::open_in(
            self.ctx.file_system.as_ref(),
            &path,
            self.ctx.verbose(),
            cancel.clone(),
        )?);
        let clock: Arc<dyn GameClock> = self.ctx.clock.clone();

        let mut controls = Vec::new();
        let mut keys = None;
        let mut pointer = None;
        let mut sampler = None;
        for kind in RecordKind::ALL {
            if !cfg.recording.enabled(kind) {
                continue;
            }
            let control = Arc::new(ChannelControl::new(kind));
            control.start()?;
            match kind {
                RecordKind::Key => {
                    let capture = Arc::new(KeyCapture::new(
                        control.clone(),
                        clock.clone(),
                        sink.clone(),
                    ));
                    capture.attach();
                    keys = Some(capture);
                }
                RecordKind::Mouse => {
                    let capture = Arc::new(PointerCapture::new(
                        control.clone(),
                        clock.clone(),
                        sink.clone(),
                    ));
                    capture.attach();
                    pointer = Some(capture);
                }
                RecordKind::State => {
                    let capture = Arc::new(StateSampler::new(
                        control.clone(),
                        clock.clone(),
                        sink.clone(),
                        Arc::clone(&self.ctx.state_source),
                        cfg.state_interval(),
                    ));
                    capture.attach();
                    let handle = capture.spawn(cancel.child_token());
                    sampler = Some((capture, handle));
                }
            }
            controls.push(control);
        }

        let refresh = self.spawn_refresh(&cancel);
        append_run_log(
            "info",
            "session.started",
            json!({
                "mode": SessionMode::Recording.as_str(),
                "path": path.display().to_string(),
                "channels": controls.iter().map(|c| c.kind().as_str()).collect::<Vec<_>>(),
            }),
        );
        self.active = Some(ActiveSession::Recording(RecordingSession {
            cancel,
            refresh,
            sink,
            controls,
            keys,
            pointer,
            sampler,
        }));
        Ok(())
    }

    pub fn start_playback(&mut self) -> Result<(), ReplayError> {
        self.ensure_idle(SessionMode::Playing)?;
        let cfg = &self.ctx.config;
        let cancel = CancellationToken::new();
        let path = cfg.playback_path();
        let clock: Arc<dyn GameClock> = self.ctx.clock.clone();
        let settings = SchedulerSettings::from_config(&cfg.playback, self.ctx.verbose());
        let channels = cfg.playback.channels();

        let mut router = RecordRouter::new();
        let mut queues = Vec::new();
        for kind in RecordKind::ALL {
            if channels.enabled(kind) {
                queues.push((kind, router.channel(kind)));
            }
        }
        let source = RecordSource::open(
            &path,
            clock.clone(),
            router,
            cancel.clone(),
            self.ctx.verbose(),
        )?;

        let mut schedulers = Vec::new();
        for (kind, rx) in queues {
            let scheduler = PlaybackScheduler::new(
                kind,
                clock.clone(),
                Arc::clone(&self.ctx.actions),
                settings.clone(),
            );
            let handle = scheduler.play(rx, cancel.child_token())?;
            schedulers.push((scheduler, handle));
        }
        let refresh = self.spawn_refresh(&cancel);
        let source = source.start(cancel.child_token());

        append_run_log(
            "info",
            "session.started",
            json!({
                "mode": SessionMode::Playing.as_str(),
                "path": path.display().to_string(),
                "channels": schedulers.iter().map(|(s, _)| s.kind().as_str()).collect::<Vec<_>>(),
            }),
        );
        self.active = Some(ActiveSession::Playing(PlaybackSession {
            cancel,
            refresh,
            path,
            schedulers,
            source,
        }));
        Ok(())
    }

    /// Pause every active channel. Returns how many changed state.
    pub fn pause(&self) -> usize {
        self.for_each_control(|control| control.pause())
    }

    pub fn resume(&self) -> usize {
        self.for_each_control(|control| control.resume())
    }

    fn for_each_control(&self, apply: impl Fn(&ChannelControl) -> bool) -> usize {
        let controls: Vec<Arc<ChannelControl>> = match &self.active {
            Some(ActiveSession::Recording(session)) => session.controls.clone(),
            Some(ActiveSession::Playing(session)) => {
                session.schedulers.iter().map(|(s, _)| s.control()).collect()
            }
            None => Vec::new(),
        };
        controls.iter().filter(|control| apply(control)).count()
    }

    /// Await the end of the running playback without cancelling it.
    pub async fn wait_for_playback(&mut self) -> Result<SessionReport, ReplayError> {
        match self.active.take() {
            Some(ActiveSession::Playing(session)) => finish_playback(session, false).await,
            other => {
                let from = other
                    .as_ref()
                    .map(ActiveSession::mode)
                    .unwrap_or(SessionMode::Idle);
                self.active = other;
                Err(ReplayError::InvalidTransition {
                    from: from.as_str(),
                    to: "completed",
                })
            }
        }
    }

    /// Cancel the session scope and tear everything down. A recording's sink
    /// is drained and closed before this returns.
    pub async fn stop(&mut self) -> Result<SessionReport, ReplayError> {
        let sort_on_stop = self.ctx.config.session.sort_on_stop;
        match self.active.take() {
            Some(ActiveSession::Recording(session)) => {
                finish_recording(session, sort_on_stop).await
            }
            Some(ActiveSession::Playing(session)) => finish_playback(session, true).await,
            None => Err(ReplayError::InvalidTransition {
                from: SessionMode::Idle.as_str(),
                to: "stopped",
            }),
        }
    }
}

fn join_error(what: &str, err: tokio::task::JoinError) -> ReplayError {
    ReplayError::Io(format!("{what} task failed: {err}"))
}

async fn finish_recording(
    session: RecordingSession,
    sort_on_stop: bool,
) -> Result<SessionReport, ReplayError> {
    let RecordingSession {
        cancel,
        refresh,
        sink,
        controls,
        keys,
        pointer,
        sampler,
    } = session;
    let mut report = SessionReport::new(SessionMode::Recording, sink.path().to_path_buf());
    report.cancelled = cancel.is_cancelled();

    if let Some(keys) = &keys {
        keys.detach();
        report.channels.entry(RecordKind::Key).or_default().written = keys.emitted();
    }
    if let Some(pointer) = &pointer {
        pointer.detach();
        report.channels.entry(RecordKind::Mouse).or_default().written = pointer.emitted();
    }
    for control in &controls {
        control.stop();
    }
    cancel.cancel();
    if let Some((state, handle)) = sampler {
        state.detach();
        let emitted = handle.await.map_err(|e| join_error("state sampler", e))?;
        report.channels.entry(RecordKind::State).or_default().written = emitted;
    }
    refresh.await.map_err(|e| join_error("clock refresh", e))?;

    let closing = Arc::clone(&sink);
    let closed = tokio::task::spawn_blocking(move || closing.close())
        .await
        .map_err(|e| join_error("sink close", e))?;
    let summary = match closed {
        Ok(summary) => summary,
        Err(err) => {
            append_run_log(
                "error",
                "session.failed",
                json!({
                    "mode": SessionMode::Recording.as_str(),
                    "path": sink.path().display().to_string(),
                    "error": err.to_string(),
                }),
            );
            return Err(err);
        }
    };
    report.lines_written = summary.written;

    if sort_on_stop {
        let path = summary.path.clone();
        let sorted = tokio::task::spawn_blocking(move || sort_session_file(&path))
            .await
            .map_err(|e| join_error("post-process sort", e))??;
        report.sort = Some(sorted);
    }

    append_run_log(
        "info",
        "session.stopped",
        json!({
            "mode": SessionMode::Recording.as_str(),
            "lines_written": report.lines_written,
            "sorted": report.sort.is_some(),
        }),
    );
    Ok(report)
}

async fn finish_playback(
    session: PlaybackSession,
    cancel_first: bool,
) -> Result<SessionReport, ReplayError> {
    let PlaybackSession {
        cancel,
        refresh,
        path,
        schedulers,
        source,
    } = session;
    if cancel_first {
        cancel.cancel();
    }
    let mut report = SessionReport::new(SessionMode::Playing, path);

    let source_result = source.await.map_err(|e| join_error("record source", e))?;
    for (scheduler, handle) in schedulers {
        let summary = handle
            .await
            .map_err(|e| join_error(scheduler.kind().as_str(), e))?;
        scheduler.stop();
        let channel = report.channels.entry(summary.kind).or_default();
        channel.performed = summary.performed;
        channel.withheld = summary.withheld;
        channel.failed = summary.failed;
        report.cancelled |= summary.cancelled;
    }
    // The session scope also ends the clock refresh.
    cancel.cancel();
    refresh.await.map_err(|e| join_error("clock refresh", e))?;

    let source_summary = match source_result {
        Ok(summary) => summary,
        Err(err) => {
            append_run_log(
                "error",
                "session.failed",
                json!({ "mode": SessionMode::Playing.as_str(), "error": err.to_string() }),
            );
            return Err(err);
        }
    };
    for (kind, count) in &source_summary.dispatched {
        report.channels.entry(*kind).or_default().dispatched = *count;
    }
    report.cancelled |= source_summary.cancelled;
    report.source = Some(source_summary);

    append_run_log(
        "info",
        "session.stopped",
        json!({
            "mode": SessionMode::Playing.as_str(),
            "cancelled": report.cancelled,
            "channels": report.channels,
        }),
    );
    Ok(report)
}
