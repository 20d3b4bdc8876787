//! In-memory stand-ins for the session's collaborators, shared by unit tests.

use crate::audio::capture::CaptureDevice;
use crate::audio::frame::{AudioFrame, PlaybackChunk};
use crate::audio::outbound::{FrameSink, OutboundStreamer};
use crate::audio::playback::{CompletionNotifier, PlaybackDevice, PlaybackUnit, UnitId};
use crate::config::AppConfig;
use crate::devices::DeviceFactory;
use crate::error::LiveError;
use crate::transport::{Connection, DuplexTransport, EventSender, SessionSetup, TransportEvent};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

// ---- playback ----

#[derive(Default)]
struct PlaybackState {
    time: f64,
    scheduled: Vec<(UnitId, f64, f64)>,
    stops: HashMap<UnitId, u32>,
    finished: HashSet<UnitId>,
    pending: VecDeque<CompletionNotifier>,
    released: bool,
}

#[derive(Clone)]
pub struct FakePlayback {
    rate: u32,
    state: Arc<Mutex<PlaybackState>>,
}

impl FakePlayback {
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            state: Arc::new(Mutex::new(PlaybackState::default())),
        }
    }

    pub fn set_time(&self, time: f64) {
        self.state.lock().unwrap().time = time;
    }

    pub fn current(&self) -> f64 {
        self.state.lock().unwrap().time
    }

    /// (unit, start_at, duration) in scheduling order.
    pub fn scheduled(&self) -> Vec<(UnitId, f64, f64)> {
        self.state.lock().unwrap().scheduled.clone()
    }

    pub fn stop_count(&self, id: UnitId) -> u32 {
        self.state.lock().unwrap().stops.get(&id).copied().unwrap_or(0)
    }

    pub fn total_stops(&self) -> u32 {
        self.state.lock().unwrap().stops.values().sum()
    }

    /// Pretend `id` played to its end without telling anyone.
    pub fn mark_finished(&self, id: UnitId) {
        let mut state = self.state.lock().unwrap();
        state.finished.insert(id);
        state.pending.retain(|n| n.id() != id);
    }

    /// Let the oldest pending unit finish naturally and fire its notifier.
    pub fn complete_next(&self) -> Option<UnitId> {
        let notifier = {
            let mut state = self.state.lock().unwrap();
            let notifier = state.pending.pop_front()?;
            state.finished.insert(notifier.id());
            notifier
        };
        let id = notifier.id();
        notifier.notify();
        Some(id)
    }

    pub fn is_released(&self) -> bool {
        self.state.lock().unwrap().released
    }
}

struct FakeUnit {
    id: UnitId,
    state: Arc<Mutex<PlaybackState>>,
}

impl PlaybackUnit for FakeUnit {
    fn id(&self) -> UnitId {
        self.id
    }

    fn stop(&mut self) -> Result<(), LiveError> {
        let mut state = self.state.lock().unwrap();
        *state.stops.entry(self.id).or_insert(0) += 1;
        let id = self.id;
        state.pending.retain(|n| n.id() != id);
        if state.finished.contains(&id) {
            return Err(LiveError::Playback("unit already finished".into()));
        }
        state.finished.insert(id);
        Ok(())
    }
}

impl PlaybackDevice for FakePlayback {
    fn name(&self) -> String {
        "fake-playback".to_string()
    }

    fn sample_rate(&self) -> u32 {
        self.rate
    }

    fn current_time(&self) -> f64 {
        self.current()
    }

    fn schedule_buffer(
        &mut self,
        id: UnitId,
        chunk: &PlaybackChunk,
        start_at: f64,
        on_completed: CompletionNotifier,
    ) -> Result<Box<dyn PlaybackUnit>, LiveError> {
        let mut state = self.state.lock().unwrap();
        if state.released {
            return Err(LiveError::Playback("device released".into()));
        }
        state.scheduled.push((id, start_at, chunk.duration()));
        state.pending.push_back(on_completed);
        Ok(Box::new(FakeUnit {
            id,
            state: self.state.clone(),
        }))
    }

    fn release(&mut self) {
        self.state.lock().unwrap().released = true;
    }
}

// ---- capture ----

#[derive(Default)]
struct CaptureState {
    acquired: bool,
    acquire_calls: u32,
    release_calls: u32,
    fail_acquire: bool,
    streamer: Option<OutboundStreamer>,
}

#[derive(Clone, Default)]
pub struct FakeCapture {
    state: Arc<Mutex<CaptureState>>,
}

impl FakeCapture {
    pub fn failing() -> Self {
        let capture = Self::default();
        capture.state.lock().unwrap().fail_acquire = true;
        capture
    }

    pub fn fail_next_acquire(&self) {
        self.state.lock().unwrap().fail_acquire = true;
    }

    /// Simulate one capture callback.
    pub fn deliver(&self, samples: &[f32]) -> bool {
        let streamer = self.state.lock().unwrap().streamer.clone();
        match streamer {
            Some(streamer) => streamer.push_block(samples),
            None => false,
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().unwrap().streamer.is_some()
    }

    pub fn held(&self) -> bool {
        self.state.lock().unwrap().acquired
    }

    pub fn acquire_calls(&self) -> u32 {
        self.state.lock().unwrap().acquire_calls
    }

    pub fn release_calls(&self) -> u32 {
        self.state.lock().unwrap().release_calls
    }
}

impl CaptureDevice for FakeCapture {
    fn name(&self) -> String {
        "fake-capture".to_string()
    }

    fn acquire(&mut self) -> Result<(), LiveError> {
        let mut state = self.state.lock().unwrap();
        state.acquire_calls += 1;
        if state.fail_acquire {
            return Err(LiveError::DeviceUnavailable("permission denied".into()));
        }
        state.acquired = true;
        Ok(())
    }

    fn start(&mut self, streamer: OutboundStreamer) -> Result<(), LiveError> {
        let mut state = self.state.lock().unwrap();
        if !state.acquired {
            return Err(LiveError::DeviceUnavailable("not acquired".into()));
        }
        state.streamer = Some(streamer);
        Ok(())
    }

    fn release(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.release_calls += 1;
        state.acquired = false;
        state.streamer = None;
    }

    fn is_acquired(&self) -> bool {
        self.state.lock().unwrap().acquired
    }
}

// ---- devices ----

/// Hands out the shared capture device and a fresh output device per session,
/// the way real backends open a new stream on every start.
#[derive(Clone)]
pub struct FakeDevices {
    pub capture: FakeCapture,
    playbacks: Arc<Mutex<Vec<FakePlayback>>>,
}

impl FakeDevices {
    pub fn new() -> Self {
        Self::with_capture(FakeCapture::default())
    }

    pub fn with_capture(capture: FakeCapture) -> Self {
        Self {
            capture,
            playbacks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Output device of the most recent session.
    pub fn playback(&self) -> FakePlayback {
        self.playbacks
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no playback device opened yet")
    }

    /// Output device of the `index`-th session ever started.
    pub fn playback_at(&self, index: usize) -> FakePlayback {
        self.playbacks.lock().unwrap()[index].clone()
    }

    pub fn playback_count(&self) -> usize {
        self.playbacks.lock().unwrap().len()
    }
}

impl DeviceFactory for FakeDevices {
    fn capture(&self, _config: &AppConfig) -> Result<Box<dyn CaptureDevice>, LiveError> {
        Ok(Box::new(self.capture.clone()))
    }

    fn playback(&self, _config: &AppConfig) -> Result<Box<dyn PlaybackDevice>, LiveError> {
        let device = FakePlayback::new(24000);
        self.playbacks.lock().unwrap().push(device.clone());
        Ok(Box::new(device))
    }
}

// ---- transport ----

#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<AudioFrame>>,
}

impl RecordingSink {
    pub fn seqs(&self) -> Vec<u64> {
        self.frames.lock().unwrap().iter().map(|f| f.seq()).collect()
    }
}

impl FrameSink for RecordingSink {
    fn submit(&self, frame: AudioFrame) -> Result<(), LiveError> {
        self.frames.lock().unwrap().push(frame);
        Ok(())
    }
}

#[derive(Default)]
struct TransportState {
    opened: Vec<EventSender>,
    sinks: Vec<Arc<RecordingSink>>,
    close_calls: u32,
    fail_open: Option<LiveError>,
    fail_close: bool,
}

#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<TransportState>>,
}

impl FakeTransport {
    pub fn failing_open(err: LiveError) -> Self {
        let transport = Self::default();
        transport.state.lock().unwrap().fail_open = Some(err);
        transport
    }

    pub fn failing_close(&self) {
        self.state.lock().unwrap().fail_close = true;
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().unwrap().opened.len()
    }

    pub fn close_calls(&self) -> u32 {
        self.state.lock().unwrap().close_calls
    }

    /// Emit an event as the most recently opened connection.
    pub fn emit(&self, event: TransportEvent) -> bool {
        let sender = self.state.lock().unwrap().opened.last().cloned();
        sender.map_or(false, |s| s.emit(event))
    }

    /// Emit an event as the `index`-th connection ever opened.
    pub fn emit_on(&self, index: usize, event: TransportEvent) -> bool {
        let sender = self.state.lock().unwrap().opened.get(index).cloned();
        sender.map_or(false, |s| s.emit(event))
    }

    pub fn last_sink(&self) -> Arc<RecordingSink> {
        self.state.lock().unwrap().sinks.last().cloned().unwrap_or_default()
    }
}

struct FakeConnection {
    sink: Arc<RecordingSink>,
    state: Arc<Mutex<TransportState>>,
}

impl Connection for FakeConnection {
    fn frame_sink(&self) -> Arc<dyn FrameSink> {
        self.sink.clone()
    }

    fn close(&mut self) -> Result<(), LiveError> {
        let mut state = self.state.lock().unwrap();
        state.close_calls += 1;
        if state.fail_close {
            return Err(LiveError::Transport("already closing".into()));
        }
        Ok(())
    }
}

impl DuplexTransport for FakeTransport {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn open(
        &mut self,
        _setup: &SessionSetup,
        events: EventSender,
    ) -> Result<Box<dyn Connection>, LiveError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_open.clone() {
            return Err(err);
        }
        let sink = Arc::new(RecordingSink::default());
        state.opened.push(events);
        state.sinks.push(sink.clone());
        Ok(Box::new(FakeConnection {
            sink,
            state: self.state.clone(),
        }))
    }
}

// ---- controller ----

/// A running controller on fake collaborators, plus handles to drive them.
pub fn spawn_fake_live() -> (crate::audio::controller::LiveHandle, FakeTransport, FakeDevices) {
    let devices = FakeDevices::new();
    let transport = FakeTransport::default();
    let (session, inbox) =
        crate::audio::session::LiveSession::new(Box::new(devices.clone()), Box::new(transport.clone()));
    let (handle, _task) = crate::audio::controller::LiveController::spawn(session, inbox);
    (handle, transport, devices)
}
