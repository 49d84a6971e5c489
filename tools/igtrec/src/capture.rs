use crate::clock::GameClock;
use crate::errors::ReplayError;
use crate::logging::append_run_log;
use crate::record::{KeyPress, PointerSample, Record, StateSample};
use crate::runtime::StateSource;
use crate::scheduler::ChannelControl;
use crate::sink::DurableRecordSink;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Attachment flag, emission gate and emitted-record counter shared by every
/// capture.
struct CaptureCore {
    control: Arc<ChannelControl>,
    clock: Arc<dyn GameClock>,
    sink: Arc<DurableRecordSink>,
    attached: AtomicBool,
    emitted: AtomicUsize,
}

impl CaptureCore {
    fn new(
        control: Arc<ChannelControl>,
        clock: Arc<dyn GameClock>,
        sink: Arc<DurableRecordSink>,
    ) -> Self {
        Self {
            control,
            clock,
            sink,
            attached: AtomicBool::new(false),
            emitted: AtomicUsize::new(0),
        }
    }

    fn attach(&self) -> bool {
        let changed = !self.attached.swap(true, Ordering::SeqCst);
        if changed {
            append_run_log(
                "debug",
                "capture.attached",
                json!({ "kind": self.control.kind().as_str() }),
            );
        }
        changed
    }

    fn detach(&self) -> bool {
        let changed = self.attached.swap(false, Ordering::SeqCst);
        if changed {
            append_run_log(
                "debug",
                "capture.detached",
                json!({ "kind": self.control.kind().as_str() }),
            );
        }
        changed
    }

    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Records need a live IGT: nothing is captured before the clock connects.
    fn capturing(&self) -> bool {
        self.is_attached()
            && self.control.is_active()
            && self.clock.is_connected()
            && !self.clock.is_paused()
    }

    fn emit(&self, record: Record) -> Result<bool, ReplayError> {
        if !self.capturing() {
            return Ok(false);
        }
        self.sink.enqueue_record(&record)?;
        self.emitted.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

/// Builds a [`KeyPress`] from each down/up pair.
pub struct KeyCapture {
    core: CaptureCore,
    held: Mutex<HashMap<String, f64>>,
}

impl KeyCapture {
    pub fn new(
        control: Arc<ChannelControl>,
        clock: Arc<dyn GameClock>,
        sink: Arc<DurableRecordSink>,
    ) -> Self {
        Self {
            core: CaptureCore::new(control, clock, sink),
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn attach(&self) -> bool {
        self.core.attach()
    }

    /// Detaching forgets every key still held.
    pub fn detach(&self) -> bool {
        self.held.lock().expect("held keys lock").clear();
        self.core.detach()
    }

    pub fn emitted(&self) -> usize {
        self.core.emitted.load(Ordering::SeqCst)
    }

    /// A repeated down for a key that is already held is ignored.
    pub fn on_key_down(&self, key: &str) {
        if !self.core.capturing() {
            return;
        }
        let igt = self.core.clock.now();
        self.held
            .lock()
            .expect("held keys lock")
            .entry(key.to_string())
            .or_insert(igt);
    }

    /// Returns whether a record was written.
    pub fn on_key_up(&self, key: &str) -> Result<bool, ReplayError> {
        if !self.core.is_attached() {
            return Ok(false);
        }
        let up = self.core.clock.now();
        let Some(down) = self.held.lock().expect("held keys lock").remove(key) else {
            return Ok(false);
        };
        self.core.emit(Record::Key(KeyPress {
            igt: down,
            key: key.to_string(),
            duration_ms: ((up - down) * 1000.0).max(0.0),
        }))
    }
}

pub struct PointerCapture {
    core: CaptureCore,
}

impl PointerCapture {
    pub fn new(
        control: Arc<ChannelControl>,
        clock: Arc<dyn GameClock>,
        sink: Arc<DurableRecordSink>,
    ) -> Self {
        Self {
            core: CaptureCore::new(control, clock, sink),
        }
    }

    pub fn attach(&self) -> bool {
        self.core.attach()
    }

    pub fn detach(&self) -> bool {
        self.core.detach()
    }

    pub fn emitted(&self) -> usize {
        self.core.emitted.load(Ordering::SeqCst)
    }

    /// One raw input tick: absolute position plus relative movement.
    pub fn on_raw_input(
        &self,
        abs_x: i32,
        abs_y: i32,
        delta_x: i32,
        delta_y: i32,
    ) -> Result<bool, ReplayError> {
        if !self.core.is_attached() {
            return Ok(false);
        }
        self.core.emit(Record::Pointer(PointerSample {
            igt: self.core.clock.now(),
            abs_x,
            abs_y,
            delta_x,
            delta_y,
        }))
    }
}

/// Samples game position at a fixed cadence.
pub struct StateSampler {
    core: CaptureCore,
    source: Arc<dyn StateSource>,
    interval: Duration,
}

impl StateSampler {
    pub fn new(
        control: Arc<ChannelControl>,
        clock: Arc<dyn GameClock>,
        sink: Arc<DurableRecordSink>,
        source: Arc<dyn StateSource>,
        interval: Duration,
    ) -> Self {
        Self {
            core: CaptureCore::new(control, clock, sink),
            source,
            interval,
        }
    }

    pub fn attach(&self) -> bool {
        self.core.attach()
    }

    pub fn detach(&self) -> bool {
        self.core.detach()
    }

    pub fn emitted(&self) -> usize {
        self.core.emitted.load(Ordering::SeqCst)
    }

    /// Take one sample. States missing `X`, `Y` or `Z` are skipped.
    pub fn sample_once(&self) -> Result<bool, ReplayError> {
        if !self.core.capturing() || !self.source.connected() {
            return Ok(false);
        }
        let Some(state) = self.source.poll_state() else {
            return Ok(false);
        };
        let (Some(x), Some(y), Some(z)) = (state.get("X"), state.get("Y"), state.get("Z")) else {
            append_run_log(
                "warn",
                "capture.state_incomplete",
                json!({ "fields": state.keys().collect::<Vec<_>>() }),
            );
            return Ok(false);
        };
        self.core.emit(Record::State(StateSample {
            igt: self.core.clock.now(),
            x: *x,
            y: *y,
            z: *z,
        }))
    }

    /// Sample every `interval` until `cancel` fires or the sink closes.
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<usize> {
        let sampler = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match sampler.sample_once() {
                    Ok(_) => {}
                    Err(ReplayError::QueueClosed) => break,
                    Err(err) => append_run_log(
                        "warn",
                        "capture.state_failed",
                        json!({ "error": err.to_string() }),
                    ),
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(sampler.interval) => {}
                }
            }
            sampler.emitted()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::runtime::{FakeStateSource, ScriptedClock};
    use crate::types::RecordKind;
    use std::fs;
    use std::path::Path;

    fn sink_at(path: &Path) -> Arc<DurableRecordSink> {
        Arc::new(DurableRecordSink::open(path, false, CancellationToken::new()).expect("sink"))
    }

    fn running(kind: RecordKind) -> Arc<ChannelControl> {
        let control = Arc::new(ChannelControl::new(kind));
        control.start().expect("start");
        control
    }

    fn records(path: &Path) -> Vec<Record> {
        fs::read_to_string(path)
            .expect("read")
            .lines()
            .enumerate()
            .map(|(i, line)| Record::from_line(line, i + 1).expect("record"))
            .collect()
    }

    #[test]
    fn key_capture_pairs_down_and_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("s.jsonl");
        let sink = sink_at(&path);
        let clock = Arc::new(ScriptedClock::new(&[1.0, 1.1, 1.25]));
        let capture = KeyCapture::new(running(RecordKind::Key), clock, sink.clone());
        assert!(capture.attach());
        assert!(!capture.attach());

        capture.on_key_down("W");
        capture.on_key_down("W");
        assert!(capture.on_key_up("W").expect("up"));
        assert!(!capture.on_key_up("W").expect("unpaired up"));
        sink.close().expect("close");

        let written = records(&path);
        assert_eq!(written.len(), 1);
        let Record::Key(press) = &written[0] else {
            panic!("expected a key record");
        };
        assert_eq!(press.igt, 1.0);
        assert!((press.duration_ms - 250.0).abs() < 1e-9);
        assert_eq!(capture.emitted(), 1);
    }

    #[test]
    fn nothing_is_emitted_while_detached_or_paused() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("s.jsonl");
        let sink = sink_at(&path);
        let clock = Arc::new(ScriptedClock::new(&[2.0]));
        let control = running(RecordKind::Mouse);
        let capture = PointerCapture::new(control.clone(), clock.clone(), sink.clone());

        assert!(!capture.on_raw_input(1, 1, 1, 1).expect("detached"));
        capture.attach();
        control.pause();
        assert!(!capture.on_raw_input(1, 1, 1, 1).expect("channel paused"));
        control.resume();
        clock.set_paused(true);
        assert!(!capture.on_raw_input(1, 1, 1, 1).expect("game paused"));
        clock.set_paused(false);
        assert!(capture.on_raw_input(640, 360, -2, 5).expect("live"));
        assert!(capture.detach());
        assert!(!capture.detach());
        assert!(!capture.on_raw_input(1, 1, 1, 1).expect("detached again"));
        sink.close().expect("close");

        assert_eq!(
            records(&path),
            vec![Record::Pointer(PointerSample {
                igt: 2.0,
                abs_x: 640,
                abs_y: 360,
                delta_x: -2,
                delta_y: 5
            })]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn state_sampler_writes_at_its_interval() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("s.jsonl");
        let sink = sink_at(&path);
        let source = Arc::new(FakeStateSource::with_igts(&[0.0]));
        let clock = Arc::new(VirtualClock::new());
        clock.poll_once(source.as_ref()).expect("poll");

        let sampler = Arc::new(StateSampler::new(
            running(RecordKind::State),
            clock,
            sink.clone(),
            source,
            Duration::from_millis(50),
        ));
        sampler.attach();
        let cancel = CancellationToken::new();
        let handle = sampler.spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(220)).await;
        cancel.cancel();
        let emitted = handle.await.expect("join");
        sink.close().expect("close");

        // Samples at 0, 50, 100, 150 and 200ms.
        assert_eq!(emitted, 5);
        let igts = records(&path).iter().map(Record::igt).collect::<Vec<_>>();
        assert_eq!(igts.len(), 5);
        assert!(igts.windows(2).all(|w| w[0] <= w[1]));
    }
}
