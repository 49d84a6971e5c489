use crate::clock::{ClockSample, GameClock, IGT_FIELD};
use crate::errors::ReplayError;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::Instant;

/// Field name -> value mapping returned by a state poll.
pub type GameState = BTreeMap<String, f64>;

pub trait StateSource: Send + Sync {
    fn poll_state(&self) -> Option<GameState>;
    fn connected(&self) -> bool;
    fn write_state(&self, x: f64, y: f64, z: f64) -> Result<(), ReplayError>;
}

pub trait ActionSink: Send + Sync {
    fn key_down(&self, key: &str) -> Result<(), ReplayError>;
    fn key_up(&self, key: &str) -> Result<(), ReplayError>;
    fn move_by(&self, dx: i32, dy: i32) -> Result<(), ReplayError>;
    fn write_state(&self, x: f64, y: f64, z: f64) -> Result<(), ReplayError>;
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, ReplayError>;
    fn read(&self, path: &Path) -> Result<Vec<u8>, ReplayError>;
    /// Create or truncate `path`, creating missing parent directories.
    fn create(&self, path: &Path) -> Result<Box<dyn Write + Send>, ReplayError>;
}

pub trait Terminal: Send + Sync {
    fn write_line(&self, line: &str) -> Result<(), ReplayError>;
}

pub struct ProductionFileSystem;

fn io_error(path: &Path, err: std::io::Error) -> ReplayError {
    ReplayError::Io(format!("{}: {err}", path.display()))
}

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, ReplayError> {
        std::fs::read_to_string(path).map_err(|e| io_error(path, e))
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, ReplayError> {
        std::fs::read(path).map_err(|e| io_error(path, e))
    }

    fn create(&self, path: &Path) -> Result<Box<dyn Write + Send>, ReplayError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
        let file = File::create(path).map_err(|e| io_error(path, e))?;
        Ok(Box::new(file))
    }
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn write_line(&self, line: &str) -> Result<(), ReplayError> {
        let mut out = std::io::stdout();
        writeln!(out, "{line}").map_err(|e| ReplayError::Io(e.to_string()))
    }
}

// ── Simulated game ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct SimulatedGame {
    base_igt: f64,
    resumed_at: Instant,
    paused: bool,
    position: (f64, f64, f64),
}

/// Stand-in for a running game: IGT advances with wall time and can be
/// paused. Used for dry-run playback.
pub struct SimulatedStateSource {
    game: Mutex<SimulatedGame>,
    connected: AtomicBool,
}

impl SimulatedStateSource {
    pub fn new(start_igt: f64) -> Self {
        Self {
            game: Mutex::new(SimulatedGame {
                base_igt: start_igt,
                resumed_at: Instant::now(),
                paused: false,
                position: (0.0, 0.0, 0.0),
            }),
            connected: AtomicBool::new(true),
        }
    }

    pub fn igt(&self) -> f64 {
        let game = *self.game.lock().expect("simulated game lock");
        if game.paused {
            game.base_igt
        } else {
            game.base_igt + game.resumed_at.elapsed().as_secs_f64()
        }
    }

    pub fn pause(&self) {
        let igt = self.igt();
        let mut game = self.game.lock().expect("simulated game lock");
        game.base_igt = igt;
        game.paused = true;
    }

    pub fn resume(&self) {
        let mut game = self.game.lock().expect("simulated game lock");
        if game.paused {
            game.paused = false;
            game.resumed_at = Instant::now();
        }
    }

    pub fn position(&self) -> (f64, f64, f64) {
        self.game.lock().expect("simulated game lock").position
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

impl StateSource for SimulatedStateSource {
    fn poll_state(&self) -> Option<GameState> {
        if !self.connected() {
            return None;
        }
        let igt = self.igt();
        let (x, y, z) = self.position();
        Some(GameState::from([
            (IGT_FIELD.to_string(), igt),
            ("X".to_string(), x),
            ("Y".to_string(), y),
            ("Z".to_string(), z),
        ]))
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn write_state(&self, x: f64, y: f64, z: f64) -> Result<(), ReplayError> {
        self.game.lock().expect("simulated game lock").position = (x, y, z);
        Ok(())
    }
}

/// Prints every replayed action as a line; the dry-run action sink.
pub struct TerminalActionSink {
    terminal: Arc<dyn Terminal>,
}

impl TerminalActionSink {
    pub fn new(terminal: Arc<dyn Terminal>) -> Self {
        Self { terminal }
    }
}

impl ActionSink for TerminalActionSink {
    fn key_down(&self, key: &str) -> Result<(), ReplayError> {
        self.terminal.write_line(&format!("key_down {key}"))
    }

    fn key_up(&self, key: &str) -> Result<(), ReplayError> {
        self.terminal.write_line(&format!("key_up {key}"))
    }

    fn move_by(&self, dx: i32, dy: i32) -> Result<(), ReplayError> {
        self.terminal.write_line(&format!("move_by {dx} {dy}"))
    }

    fn write_state(&self, x: f64, y: f64, z: f64) -> Result<(), ReplayError> {
        self.terminal
            .write_line(&format!("write_state {x:.3} {y:.3} {z:.3}"))
    }
}

/// Routes state write-back into a [`StateSource`] and everything else to
/// `inner`.
pub struct StateWriteBack {
    inner: Arc<dyn ActionSink>,
    state: Arc<dyn StateSource>,
}

impl StateWriteBack {
    pub fn new(inner: Arc<dyn ActionSink>, state: Arc<dyn StateSource>) -> Self {
        Self { inner, state }
    }
}

impl ActionSink for StateWriteBack {
    fn key_down(&self, key: &str) -> Result<(), ReplayError> {
        self.inner.key_down(key)
    }

    fn key_up(&self, key: &str) -> Result<(), ReplayError> {
        self.inner.key_up(key)
    }

    fn move_by(&self, dx: i32, dy: i32) -> Result<(), ReplayError> {
        self.inner.move_by(dx, dy)
    }

    fn write_state(&self, x: f64, y: f64, z: f64) -> Result<(), ReplayError> {
        self.inner.write_state(x, y, z)?;
        self.state.write_state(x, y, z)
    }
}

pub struct ProductionRuntime {
    pub file_system: Arc<dyn FileSystem>,
    pub terminal: Arc<dyn Terminal>,
}

impl ProductionRuntime {
    pub fn new() -> Self {
        Self {
            file_system: Arc::new(ProductionFileSystem),
            terminal: Arc::new(ProductionTerminal),
        }
    }
}

impl Default for ProductionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

// ── Test doubles ──────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeStateSource {
    polls: Mutex<VecDeque<GameState>>,
    last: Mutex<Option<GameState>>,
    disconnected: AtomicBool,
    writes: Mutex<Vec<(f64, f64, f64)>>,
}

impl FakeStateSource {
    pub fn with_igts(igts: &[f64]) -> Self {
        let source = Self::default();
        for igt in igts {
            source.push_igt(*igt);
        }
        source
    }

    pub fn push_state(&self, state: GameState) {
        self.polls.lock().expect("polls lock").push_back(state);
    }

    pub fn push_igt(&self, igt: f64) {
        self.push_state(GameState::from([
            (IGT_FIELD.to_string(), igt),
            ("X".to_string(), 0.0),
            ("Y".to_string(), 0.0),
            ("Z".to_string(), 0.0),
        ]));
    }

    pub fn set_connected(&self, connected: bool) {
        self.disconnected.store(!connected, Ordering::SeqCst);
    }

    pub fn writes(&self) -> Vec<(f64, f64, f64)> {
        self.writes.lock().expect("writes lock").clone()
    }
}

impl StateSource for FakeStateSource {
    /// Pops the next scripted state; repeats the last one once exhausted.
    fn poll_state(&self) -> Option<GameState> {
        let mut last = self.last.lock().expect("last lock");
        if let Some(next) = self.polls.lock().expect("polls lock").pop_front() {
            *last = Some(next);
        }
        last.clone()
    }

    fn connected(&self) -> bool {
        !self.disconnected.load(Ordering::SeqCst)
    }

    fn write_state(&self, x: f64, y: f64, z: f64) -> Result<(), ReplayError> {
        self.writes.lock().expect("writes lock").push((x, y, z));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplayedAction {
    KeyDown(String),
    KeyUp(String),
    MoveBy(i32, i32),
    WriteState(f64, f64, f64),
}

#[derive(Default, Clone)]
pub struct FakeActionSink {
    actions: Arc<Mutex<Vec<(Instant, ReplayedAction)>>>,
    fail_next: Arc<Mutex<Option<ReplayError>>>,
}

impl FakeActionSink {
    pub fn actions(&self) -> Vec<ReplayedAction> {
        self.actions
            .lock()
            .expect("actions lock")
            .iter()
            .map(|(_, action)| action.clone())
            .collect()
    }

    pub fn timed_actions(&self) -> Vec<(Instant, ReplayedAction)> {
        self.actions.lock().expect("actions lock").clone()
    }

    pub fn set_fail_next(&self, error: ReplayError) {
        *self.fail_next.lock().expect("fail lock") = Some(error);
    }

    fn push(&self, action: ReplayedAction) -> Result<(), ReplayError> {
        if let Some(err) = self.fail_next.lock().expect("fail lock").take() {
            return Err(err);
        }
        self.actions
            .lock()
            .expect("actions lock")
            .push((Instant::now(), action));
        Ok(())
    }
}

impl ActionSink for FakeActionSink {
    fn key_down(&self, key: &str) -> Result<(), ReplayError> {
        self.push(ReplayedAction::KeyDown(key.to_string()))
    }

    fn key_up(&self, key: &str) -> Result<(), ReplayError> {
        self.push(ReplayedAction::KeyUp(key.to_string()))
    }

    fn move_by(&self, dx: i32, dy: i32) -> Result<(), ReplayError> {
        self.push(ReplayedAction::MoveBy(dx, dy))
    }

    fn write_state(&self, x: f64, y: f64, z: f64) -> Result<(), ReplayError> {
        self.push(ReplayedAction::WriteState(x, y, z))
    }
}

/// Clock whose `now()` walks a scripted sequence, one value per call, and
/// then sticks at the last value.
pub struct ScriptedClock {
    script: Mutex<VecDeque<f64>>,
    last: Mutex<f64>,
    reads: Mutex<Vec<f64>>,
    paused_tx: watch::Sender<bool>,
}

impl ScriptedClock {
    pub fn new(script: &[f64]) -> Self {
        let (paused_tx, _) = watch::channel(false);
        Self {
            script: Mutex::new(script.iter().copied().collect()),
            last: Mutex::new(script.first().copied().unwrap_or(0.0)),
            reads: Mutex::new(Vec::new()),
            paused_tx,
        }
    }

    /// Clock advancing `step` seconds per read, starting at `start`.
    pub fn stepping(start: f64, step: f64, reads: usize) -> Self {
        let script = (0..reads).map(|i| start + step * i as f64).collect::<Vec<_>>();
        Self::new(&script)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused_tx.send_replace(paused);
    }

    /// Every value handed out by `now()`, in order.
    pub fn reads(&self) -> Vec<f64> {
        self.reads.lock().expect("reads lock").clone()
    }

    pub fn read_count(&self) -> usize {
        self.reads.lock().expect("reads lock").len()
    }
}

impl GameClock for ScriptedClock {
    fn sample(&self) -> ClockSample {
        ClockSample {
            igt: *self.last.lock().expect("last lock"),
            delta: 0.0,
        }
    }

    fn is_paused(&self) -> bool {
        *self.paused_tx.borrow()
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn paused_watch(&self) -> watch::Receiver<bool> {
        self.paused_tx.subscribe()
    }

    fn now(&self) -> f64 {
        let mut last = self.last.lock().expect("last lock");
        if let Some(next) = self.script.lock().expect("script lock").pop_front() {
            *last = next;
        }
        self.reads.lock().expect("reads lock").push(*last);
        *last
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let fs = Self::default();
        fs.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into());
        fs
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, ReplayError> {
        self.files
            .lock()
            .expect("files lock")
            .get(path)
            .cloned()
            .ok_or_else(|| ReplayError::Io(format!("missing file {}", path.display())))
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, ReplayError> {
        self.read_to_string(path).map(String::into_bytes)
    }

    fn create(&self, path: &Path) -> Result<Box<dyn Write + Send>, ReplayError> {
        self.files
            .lock()
            .expect("files lock")
            .insert(path.to_path_buf(), String::new());
        Ok(Box::new(FakeFile {
            files: Arc::clone(&self.files),
            path: path.to_path_buf(),
        }))
    }
}

struct FakeFile {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    path: PathBuf,
}

impl Write for FakeFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.files
            .lock()
            .expect("files lock")
            .entry(self.path.clone())
            .or_default()
            .push_str(&String::from_utf8_lossy(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Real files whose writes start failing once `writes_before_failure`
/// writes have gone through.
pub struct FailingWriteFileSystem {
    writes_before_failure: usize,
}

impl FailingWriteFileSystem {
    pub fn new(writes_before_failure: usize) -> Self {
        Self {
            writes_before_failure,
        }
    }
}

impl FileSystem for FailingWriteFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, ReplayError> {
        ProductionFileSystem.read_to_string(path)
    }

    fn read(&self, path: &Path) -> Result<Vec<u8>, ReplayError> {
        ProductionFileSystem.read(path)
    }

    fn create(&self, path: &Path) -> Result<Box<dyn Write + Send>, ReplayError> {
        Ok(Box::new(FailingWriter {
            inner: ProductionFileSystem.create(path)?,
            remaining: self.writes_before_failure,
        }))
    }
}

struct FailingWriter {
    inner: Box<dyn Write + Send>,
    remaining: usize,
}

impl Write for FailingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.remaining == 0 {
            return Err(std::io::Error::other("no space left on device"));
        }
        self.remaining -= 1;
        self.inner.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    writes: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn written_lines(&self) -> Vec<String> {
        self.writes.lock().expect("writes lock").clone()
    }
}

impl Terminal for FakeTerminal {
    fn write_line(&self, line: &str) -> Result<(), ReplayError> {
        self.writes
            .lock()
            .expect("writes lock")
            .push(line.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn simulated_source_pauses_and_resumes_igt() {
        let source = SimulatedStateSource::new(100.0);
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!((source.igt() - 102.0).abs() < 1e-6);

        source.pause();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!((source.igt() - 102.0).abs() < 1e-6);

        source.resume();
        tokio::time::advance(Duration::from_secs(1)).await;
        let state = source.poll_state().expect("connected");
        assert!((state[IGT_FIELD] - 103.0).abs() < 1e-6);

        source.set_connected(false);
        assert!(source.poll_state().is_none());
    }

    #[test]
    fn state_write_back_reaches_the_state_source() {
        let actions = FakeActionSink::default();
        let source = Arc::new(FakeStateSource::default());
        let sink = StateWriteBack::new(Arc::new(actions.clone()), source.clone());
        sink.write_state(1.0, 2.0, 3.0).expect("write");
        sink.move_by(4, 5).expect("move");
        assert_eq!(source.writes(), vec![(1.0, 2.0, 3.0)]);
        assert_eq!(
            actions.actions(),
            vec![
                ReplayedAction::WriteState(1.0, 2.0, 3.0),
                ReplayedAction::MoveBy(4, 5)
            ]
        );
    }

    #[test]
    fn fake_file_system_keeps_created_files_in_memory() {
        let fs = FakeFileSystem::with_file("old.jsonl", "stale");
        let mut file = fs.create(Path::new("old.jsonl")).expect("create");
        file.write_all(b"{\"IGT\":1.0}\n").expect("write");
        assert_eq!(
            fs.read(Path::new("old.jsonl")).expect("read"),
            b"{\"IGT\":1.0}\n".to_vec()
        );
        assert!(fs.read(Path::new("absent.jsonl")).is_err());
    }

    #[test]
    fn failing_writes_start_after_the_budget() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested/out.jsonl");
        let fs = FailingWriteFileSystem::new(1);
        let mut file = fs.create(&path).expect("create");
        file.write_all(b"kept\n").expect("first write");
        assert!(file.write_all(b"lost\n").is_err());
        assert_eq!(fs.read_to_string(&path).expect("read"), "kept\n");
    }

    #[test]
    fn scripted_clock_sticks_at_last_value() {
        let clock = ScriptedClock::new(&[0.0, 1.0]);
        assert_eq!(clock.now(), 0.0);
        assert_eq!(clock.now(), 1.0);
        assert_eq!(clock.now(), 1.0);
        assert_eq!(clock.reads(), vec![0.0, 1.0, 1.0]);
    }

    #[test]
    fn terminal_action_sink_prints_actions() {
        let terminal = FakeTerminal::default();
        let sink = TerminalActionSink::new(Arc::new(terminal.clone()));
        sink.key_down("W").expect("down");
        sink.move_by(-2, 3).expect("move");
        assert_eq!(terminal.written_lines(), vec!["key_down W", "move_by -2 3"]);
    }
}
