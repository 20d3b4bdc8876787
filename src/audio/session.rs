//! # Live Session State Machine
//!
//! Owns one live voice interaction from `start` to teardown: the microphone,
//! the duplex connection, the playback scheduler (clock + in-flight units) and
//! the transcript. All of them are released together.
//!
//! ## Session Lifecycle:
//! ```text
//!            start()              onOpen
//!   Idle ─────────────▶ Connecting ──────▶ Active
//!    ▲                     │  │               │ │
//!    │ stop()              │  └── onError ──▶ Error ◀── onError
//!    └─────────────────────┴──────────────────┘ │
//!                                   onClose ───▶ Closed
//! ```
//! - **Closed** and **Error** are terminal until a fresh `start()`, which
//!   passes through `Idle` again.
//! - There is no automatic reconnect: an `Error` needs an explicit `start()`.
//!
//! ## Callbacks:
//! Every method here runs on the controller's single task, so the clock and
//! the unit set are never touched concurrently.

use crate::audio::capture::CaptureDevice;
use crate::audio::outbound::{OutboundStats, OutboundStreamer};
use crate::audio::playback::{PlaybackScheduler, PlaybackStats, UnitId};
use crate::config::AppConfig;
use crate::devices::DeviceFactory;
use crate::error::LiveError;
use crate::transport::{
    Connection, DuplexTransport, EventSender, LiveMessage, SessionSetup, TaggedEvent, TransportEvent,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Current state of the live session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// No session running
    Idle,
    /// Microphone held, connection opening
    Connecting,
    /// Audio flowing both ways
    Active,
    /// The remote side ended the session
    Closed,
    /// The session failed; the cause is kept for display
    Error(LiveError),
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
            SessionState::Error(_) => "error",
        }
    }

    /// Human-facing status line for the UI.
    pub fn label(&self) -> String {
        match self {
            SessionState::Idle => "Standby".to_string(),
            SessionState::Connecting => "Connecting...".to_string(),
            SessionState::Active => "Listening...".to_string(),
            SessionState::Closed => "Session Closed".to_string(),
            SessionState::Error(err) => format!("Error: {}", err.cause()),
        }
    }

    /// Whether a connection and microphone are currently held.
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Active)
    }

    pub fn can_start(&self) -> bool {
        !self.is_running()
    }
}

/// Who produced a transcript fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    /// The person at the microphone
    Local,
    /// The assistant
    Remote,
}

/// One transcript fragment. Purely observational.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub role: Speaker,
    pub text: String,
    pub session_id: Option<String>,
    pub at: DateTime<Utc>,
}

/// Counters for the current (or last) session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct SessionStats {
    pub outbound: OutboundStats,
    pub playback: PlaybackStats,
    pub messages_received: u64,
    pub turns_completed: u64,
}

/// Failure details exposed to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureInfo {
    pub kind: &'static str,
    pub message: String,
}

/// Point-in-time view of the session for observers and HTTP handlers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub session_id: Option<String>,
    pub state: &'static str,
    pub label: String,
    pub error: Option<FailureInfo>,
    /// The credentials need to be reselected before retrying
    pub reauthorize: bool,
    /// The microphone is acquired by this session
    pub holds_microphone: bool,
    pub holds_connection: bool,
    pub playback_clock: f64,
    pub active_units: usize,
    pub transcript_entries: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub stats: SessionStats,
}

/// Receiving ends of the session's callback channels, drained by the controller.
pub struct SessionInbox {
    pub events: mpsc::UnboundedReceiver<TaggedEvent>,
    pub completions: mpsc::UnboundedReceiver<UnitId>,
}

const TRANSCRIPT_CHANNEL_CAPACITY: usize = 256;

pub struct LiveSession {
    state: SessionState,
    session_id: Option<String>,
    started_at: Option<DateTime<Utc>>,

    devices: Box<dyn DeviceFactory>,
    transport: Box<dyn DuplexTransport>,

    // Owned resources, all released by `teardown`
    capture: Option<Box<dyn CaptureDevice>>,
    connection: Option<Box<dyn Connection>>,
    scheduler: Option<PlaybackScheduler>,
    outbound: Option<OutboundStreamer>,
    setup: Option<SessionSetup>,

    /// Bumped on every open so late events from an old connection are ignored
    epoch: u64,
    events_tx: mpsc::UnboundedSender<TaggedEvent>,
    completions_tx: mpsc::UnboundedSender<UnitId>,
    /// Unit ids keep counting across sessions; completions share one channel
    next_unit: u64,

    transcript: Vec<TranscriptEntry>,
    stats: SessionStats,

    status_tx: watch::Sender<SessionSnapshot>,
    transcript_tx: broadcast::Sender<TranscriptEntry>,
}

impl LiveSession {
    /// Create an idle session plus the inbox its collaborators report into.
    pub fn new(devices: Box<dyn DeviceFactory>, transport: Box<dyn DuplexTransport>) -> (Self, SessionInbox) {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (completions_tx, completions) = mpsc::unbounded_channel();
        let (transcript_tx, _) = broadcast::channel(TRANSCRIPT_CHANNEL_CAPACITY);
        let (status_tx, _) = watch::channel(SessionSnapshot {
            session_id: None,
            state: SessionState::Idle.as_str(),
            label: SessionState::Idle.label(),
            error: None,
            reauthorize: false,
            holds_microphone: false,
            holds_connection: false,
            playback_clock: 0.0,
            active_units: 0,
            transcript_entries: 0,
            started_at: None,
            stats: SessionStats::default(),
        });

        let session = Self {
            state: SessionState::Idle,
            session_id: None,
            started_at: None,
            devices,
            transport,
            capture: None,
            connection: None,
            scheduler: None,
            outbound: None,
            setup: None,
            epoch: 0,
            events_tx,
            completions_tx,
            next_unit: 0,
            transcript: Vec::new(),
            stats: SessionStats::default(),
            status_tx,
            transcript_tx,
        };

        (session, SessionInbox { events, completions })
    }

    /// Begin a new session: acquire the microphone, prepare playback, open the
    /// connection and move to `Connecting`.
    ///
    /// ## State Transition:
    /// Idle/Closed/Error → Idle → Connecting, or → Error on failure
    pub fn start(&mut self, config: &AppConfig) -> Result<(), LiveError> {
        if !self.state.can_start() {
            return Err(LiveError::InvalidTransition {
                action: "start",
                state: self.state.as_str(),
            });
        }

        self.state = SessionState::Idle;
        self.session_id = Some(Uuid::new_v4().to_string());
        self.started_at = Some(Utc::now());
        self.stats = SessionStats::default();

        // Microphone first: without it there is nothing to talk about
        let mut capture = match self.devices.capture(config) {
            Ok(capture) => capture,
            Err(err) => return Err(self.fail(err)),
        };
        if let Err(err) = capture.acquire() {
            capture.release();
            return Err(self.fail(err));
        }
        info!(device = %capture.name(), "Microphone acquired");
        self.capture = Some(capture);

        let playback = match self.devices.playback(config) {
            Ok(device) => device,
            Err(err) => return Err(self.fail(err)),
        };
        self.scheduler = Some(
            PlaybackScheduler::new(playback, self.completions_tx.clone()).starting_at(self.next_unit),
        );

        let setup = SessionSetup::from_config(config);
        self.epoch += 1;
        let events = EventSender::new(self.epoch, self.events_tx.clone());
        match self.transport.open(&setup, events) {
            Ok(connection) => self.connection = Some(connection),
            Err(err) => return Err(self.fail(err)),
        }
        self.setup = Some(setup);

        self.state = SessionState::Connecting;
        info!(
            session_id = ?self.session_id,
            transport = self.transport.name(),
            epoch = self.epoch,
            "Live session connecting"
        );
        self.publish();
        Ok(())
    }

    /// End the session from our side.
    ///
    /// ## State Transition:
    /// Connecting/Active → Idle; Idle stays Idle; Closed/Error are refused
    pub fn stop(&mut self) -> Result<(), LiveError> {
        match self.state {
            SessionState::Connecting | SessionState::Active => {
                self.teardown();
                self.state = SessionState::Idle;
                info!(session_id = ?self.session_id, "Live session stopped");
                self.publish();
                Ok(())
            }
            SessionState::Idle => Ok(()),
            SessionState::Closed | SessionState::Error(_) => Err(LiveError::InvalidTransition {
                action: "stop",
                state: self.state.as_str(),
            }),
        }
    }

    /// Route one transport callback.
    pub fn handle_event(&mut self, tagged: TaggedEvent) {
        if tagged.epoch != self.epoch || self.connection.is_none() {
            debug!(
                event_epoch = tagged.epoch,
                current_epoch = self.epoch,
                "Ignoring event from a stale connection"
            );
            return;
        }

        match tagged.event {
            TransportEvent::Open => self.on_open(),
            TransportEvent::Message(message) => self.on_message(message),
            TransportEvent::Error(cause) => self.on_transport_error(cause),
            TransportEvent::Close(reason) => self.on_remote_close(reason),
        }
    }

    /// A playback unit reached its natural end.
    pub fn handle_unit_completed(&mut self, id: UnitId) {
        if let Some(scheduler) = self.scheduler.as_mut() {
            if scheduler.on_unit_completed(id) {
                self.publish();
            }
        }
    }

    fn on_open(&mut self) {
        if self.state != SessionState::Connecting {
            debug!(state = self.state.as_str(), "Ignoring open outside of connecting");
            return;
        }

        let (sink, sample_rate) = match (&self.connection, &self.setup) {
            (Some(connection), Some(setup)) => (connection.frame_sink(), setup.capture_sample_rate),
            _ => return,
        };
        let streamer = OutboundStreamer::new(sink, sample_rate);

        if let Some(capture) = self.capture.as_mut() {
            if let Err(err) = capture.start(streamer.clone()) {
                self.fail(err);
                return;
            }
        }
        self.outbound = Some(streamer);

        self.state = SessionState::Active;
        info!(session_id = ?self.session_id, "Live session active");
        self.publish();
    }

    fn on_message(&mut self, message: LiveMessage) {
        if self.state != SessionState::Active {
            debug!(state = self.state.as_str(), "Ignoring message outside of active");
            return;
        }
        self.stats.messages_received += 1;

        // Transcripts are independent of audio handling
        if let Some(text) = message.input_transcript {
            self.append_transcript(Speaker::Local, text);
        }
        if let Some(text) = message.output_transcript {
            self.append_transcript(Speaker::Remote, text);
        }

        if let Some(scheduler) = self.scheduler.as_mut() {
            for payload in &message.audio {
                if let Err(err) = scheduler.schedule_payload(payload) {
                    warn!(error = %err, "Dropping inbound audio chunk");
                }
            }

            if message.interrupted {
                scheduler.interrupt();
            }
        }

        if message.turn_complete {
            self.stats.turns_completed += 1;
        }

        self.publish();
    }

    fn on_transport_error(&mut self, cause: String) {
        if !self.state.is_running() {
            return;
        }
        let err = LiveError::from_transport_cause(cause);
        self.fail(err);
    }

    fn on_remote_close(&mut self, reason: Option<String>) {
        if !self.state.is_running() {
            return;
        }
        self.teardown();
        self.state = SessionState::Closed;
        info!(session_id = ?self.session_id, reason = ?reason, "Live session closed by remote");
        self.publish();
    }

    fn append_transcript(&mut self, role: Speaker, text: String) {
        if text.is_empty() {
            return;
        }
        let entry = TranscriptEntry {
            role,
            text,
            session_id: self.session_id.clone(),
            at: Utc::now(),
        };
        // No subscribers is fine
        let _ = self.transcript_tx.send(entry.clone());
        self.transcript.push(entry);
    }

    /// Release everything and record `err` as the session's terminal state.
    fn fail(&mut self, err: LiveError) -> LiveError {
        self.teardown();
        error!(session_id = ?self.session_id, kind = err.kind(), error = %err, "Live session failed");
        self.state = SessionState::Error(err.clone());
        self.publish();
        err
    }

    /// Release microphone, connection and playback together.
    fn teardown(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            capture.release();
        }

        if let Some(mut connection) = self.connection.take() {
            // It may already be closing on its own
            if let Err(err) = connection.close() {
                debug!(error = %err, "Ignoring failure while closing connection");
            }
        }

        if let Some(streamer) = self.outbound.take() {
            self.stats.outbound = streamer.stats();
        }

        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.shutdown();
            self.stats.playback = scheduler.stats();
            self.next_unit = scheduler.next_unit_id();
        }

        self.setup = None;
    }

    fn current_stats(&self) -> SessionStats {
        let mut stats = self.stats;
        if let Some(streamer) = &self.outbound {
            stats.outbound = streamer.stats();
        }
        if let Some(scheduler) = &self.scheduler {
            stats.playback = scheduler.stats();
        }
        stats
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let error = match &self.state {
            SessionState::Error(err) => Some(FailureInfo {
                kind: err.kind(),
                message: err.cause(),
            }),
            _ => None,
        };

        SessionSnapshot {
            session_id: self.session_id.clone(),
            state: self.state.as_str(),
            label: self.state.label(),
            reauthorize: matches!(self.state, SessionState::Error(LiveError::Authorization(_))),
            error,
            holds_microphone: self.holds_microphone(),
            holds_connection: self.holds_connection(),
            playback_clock: self.playback_clock(),
            active_units: self.active_units(),
            transcript_entries: self.transcript.len(),
            started_at: self.started_at,
            stats: self.current_stats(),
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.snapshot());
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// The terminal failure, if the session is in `Error`.
    pub fn failure(&self) -> Option<&LiveError> {
        match &self.state {
            SessionState::Error(err) => Some(err),
            _ => None,
        }
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn playback_clock(&self) -> f64 {
        self.scheduler.as_ref().map_or(0.0, |s| s.playback_clock())
    }

    pub fn active_units(&self) -> usize {
        self.scheduler.as_ref().map_or(0, |s| s.active_units())
    }

    pub fn holds_microphone(&self) -> bool {
        self.capture.is_some()
    }

    pub fn holds_connection(&self) -> bool {
        self.connection.is_some()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionSnapshot> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_transcript(&self) -> broadcast::Receiver<TranscriptEntry> {
        self.transcript_tx.subscribe()
    }

    /// Sending half of the transcript feed, so handles can hand out receivers.
    pub fn transcript_feed(&self) -> broadcast::Sender<TranscriptEntry> {
        self.transcript_tx.clone()
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        if self.state.is_running() {
            self.teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec;
    use crate::audio::testing::{FakeCapture, FakeDevices, FakePlayback, FakeTransport};

    struct Harness {
        session: LiveSession,
        inbox: SessionInbox,
        capture: FakeCapture,
        devices: FakeDevices,
        transport: FakeTransport,
        config: AppConfig,
    }

    impl Harness {
        fn new() -> Self {
            Self::with(FakeDevices::new(), FakeTransport::default())
        }

        fn with(devices: FakeDevices, transport: FakeTransport) -> Self {
            let capture = devices.capture.clone();
            let (session, inbox) = LiveSession::new(Box::new(devices.clone()), Box::new(transport.clone()));
            Self {
                session,
                inbox,
                capture,
                devices,
                transport,
                config: AppConfig::default(),
            }
        }

        /// Feed every queued callback into the session, like the controller does.
        fn pump(&mut self) {
            loop {
                let mut progressed = false;
                while let Ok(event) = self.inbox.events.try_recv() {
                    self.session.handle_event(event);
                    progressed = true;
                }
                while let Ok(id) = self.inbox.completions.try_recv() {
                    self.session.handle_unit_completed(id);
                    progressed = true;
                }
                if !progressed {
                    break;
                }
            }
        }

        /// Output device of the current session.
        fn playback(&self) -> FakePlayback {
            self.devices.playback()
        }

        fn open(&mut self) {
            self.session.start(&self.config).unwrap();
            self.transport.emit(TransportEvent::Open);
            self.pump();
            assert_eq!(self.session.state(), &SessionState::Active);
        }

        fn receive(&mut self, message: LiveMessage) {
            self.transport.emit(TransportEvent::Message(message));
            self.pump();
        }
    }

    fn audio(seconds: f64) -> String {
        let samples = vec![0.25f32; (seconds * 24000.0) as usize];
        codec::encode_base64(&codec::encode_pcm16(&samples))
    }

    #[test]
    fn test_start_goes_through_connecting() {
        let mut h = Harness::new();
        let mut status = h.session.subscribe_status();

        h.session.start(&h.config).unwrap();
        assert_eq!(h.session.state(), &SessionState::Connecting);
        assert!(status.has_changed().unwrap());
        assert_eq!(status.borrow_and_update().state, "connecting");
        assert!(h.capture.held());
        assert!(!h.capture.is_streaming());
        assert_eq!(h.transport.open_count(), 1);

        h.transport.emit(TransportEvent::Open);
        h.pump();
        assert_eq!(h.session.state(), &SessionState::Active);
        assert!(h.capture.is_streaming());
        assert_eq!(status.borrow().label, "Listening...");
    }

    #[test]
    fn test_capture_blocks_reach_connection_in_order() {
        let mut h = Harness::new();
        h.open();

        for _ in 0..5 {
            assert!(h.capture.deliver(&[0.1; 4096]));
        }
        assert_eq!(h.transport.last_sink().seqs(), vec![0, 1, 2, 3, 4]);
        assert_eq!(h.session.snapshot().stats.outbound.frames_submitted, 5);
    }

    #[test]
    fn test_three_chunks_play_back_to_back() {
        let mut h = Harness::new();
        h.open();
        h.playback().set_time(1.0);

        h.receive(LiveMessage {
            audio: vec![audio(0.5), audio(0.5), audio(0.5)],
            ..Default::default()
        });

        let starts: Vec<f64> = h.playback().scheduled().iter().map(|(_, start, _)| *start).collect();
        assert_eq!(starts, vec![1.0, 1.5, 2.0]);
        assert!((h.session.playback_clock() - 2.5).abs() < 1e-9);
        assert_eq!(h.session.active_units(), 3);
    }

    #[test]
    fn test_interruption_flushes_playback() {
        let mut h = Harness::new();
        h.open();

        h.receive(LiveMessage {
            audio: vec![audio(0.5), audio(0.5), audio(0.5)],
            ..Default::default()
        });
        h.playback().set_time(0.6);

        h.receive(LiveMessage {
            interrupted: true,
            ..Default::default()
        });
        assert_eq!(h.session.active_units(), 0);
        assert_eq!(h.session.playback_clock(), 0.6);
        assert_eq!(h.playback().total_stops(), 3);
        // The session itself keeps going
        assert_eq!(h.session.state(), &SessionState::Active);

        h.receive(LiveMessage {
            audio: vec![audio(0.5)],
            ..Default::default()
        });
        let (_, start, _) = *h.playback().scheduled().last().unwrap();
        assert_eq!(start, 0.6);
        assert_eq!(h.session.snapshot().stats.playback.interruptions, 1);
    }

    #[test]
    fn test_natural_completion_is_applied() {
        let mut h = Harness::new();
        h.open();
        h.receive(LiveMessage {
            audio: vec![audio(0.1), audio(0.1)],
            ..Default::default()
        });

        h.playback().complete_next();
        h.pump();
        assert_eq!(h.session.active_units(), 1);
    }

    #[test]
    fn test_late_completion_from_previous_session_is_ignored() {
        let mut h = Harness::new();
        h.open();
        h.receive(LiveMessage {
            audio: vec![audio(0.5)],
            ..Default::default()
        });

        // Plays out, but its completion is still queued when the session stops
        let first = h.playback().complete_next().unwrap();
        h.session.stop().unwrap();

        h.session.start(&h.config).unwrap();
        h.transport.emit(TransportEvent::Open);
        h.transport.emit(TransportEvent::Message(LiveMessage {
            audio: vec![audio(0.5)],
            ..Default::default()
        }));
        h.pump();
        assert_eq!(h.devices.playback_count(), 2);
        assert_eq!(h.session.active_units(), 1);

        let (second, _, _) = h.devices.playback_at(1).scheduled()[0];
        assert_ne!(first, second);

        h.receive(LiveMessage {
            interrupted: true,
            ..Default::default()
        });
        assert_eq!(h.devices.playback_at(1).stop_count(second), 1);
        assert_eq!(h.session.active_units(), 0);
    }

    #[test]
    fn test_second_session_plays_and_interrupts() {
        let mut h = Harness::new();
        h.open();
        h.session.stop().unwrap();
        assert!(h.devices.playback_at(0).is_released());

        h.open();
        h.playback().set_time(2.0);
        h.receive(LiveMessage {
            audio: vec![audio(0.5), audio(0.5)],
            ..Default::default()
        });
        let starts: Vec<f64> = h.playback().scheduled().iter().map(|(_, start, _)| *start).collect();
        assert_eq!(starts, vec![2.0, 2.5]);

        h.receive(LiveMessage {
            interrupted: true,
            ..Default::default()
        });
        assert_eq!(h.playback().total_stops(), 2);
        assert_eq!(h.session.playback_clock(), 2.0);
        assert!(!h.playback().is_released());
    }

    #[test]
    fn test_transcripts_are_recorded_independently() {
        let mut h = Harness::new();
        let mut feed = h.session.subscribe_transcript();
        h.open();

        h.receive(LiveMessage {
            input_transcript: Some("hello there".into()),
            output_transcript: Some("hi!".into()),
            audio: vec![audio(0.1)],
            ..Default::default()
        });

        let roles: Vec<Speaker> = h.session.transcript().iter().map(|e| e.role).collect();
        assert_eq!(roles, vec![Speaker::Local, Speaker::Remote]);
        assert_eq!(feed.try_recv().unwrap().text, "hello there");
        assert_eq!(feed.try_recv().unwrap().text, "hi!");
        assert_eq!(h.session.active_units(), 1);
    }

    #[test]
    fn test_bad_chunk_does_not_end_session() {
        let mut h = Harness::new();
        h.open();

        h.receive(LiveMessage {
            audio: vec![codec::encode_base64(&[9, 9, 9]), audio(0.2)],
            ..Default::default()
        });
        assert_eq!(h.session.state(), &SessionState::Active);
        assert_eq!(h.session.active_units(), 1);
        assert_eq!(h.session.snapshot().stats.playback.decode_failures, 1);
    }

    #[test]
    fn test_stop_releases_everything() {
        let mut h = Harness::new();
        h.open();
        h.receive(LiveMessage {
            audio: vec![audio(0.5)],
            ..Default::default()
        });

        h.session.stop().unwrap();
        assert_eq!(h.session.state(), &SessionState::Idle);
        assert!(!h.session.holds_microphone());
        assert!(!h.session.holds_connection());
        assert!(!h.capture.held());
        assert_eq!(h.transport.close_calls(), 1);
        assert!(h.playback().is_released());
        assert!(!h.capture.deliver(&[0.0; 16]));
    }

    #[test]
    fn test_stop_while_connecting_ignores_close_failure() {
        let mut h = Harness::new();
        h.transport.failing_close();
        h.session.start(&h.config).unwrap();

        h.session.stop().unwrap();
        assert_eq!(h.session.state(), &SessionState::Idle);
        assert_eq!(h.capture.release_calls(), 1);
    }

    #[test]
    fn test_microphone_failure() {
        let devices = FakeDevices::with_capture(FakeCapture::failing());
        let mut h = Harness::with(devices, FakeTransport::default());

        let err = h.session.start(&h.config).unwrap_err();
        assert_eq!(err.kind(), "device_unavailable");
        assert_eq!(h.session.failure().map(|e| e.kind()), Some("device_unavailable"));
        assert_eq!(h.transport.open_count(), 0);
    }

    #[test]
    fn test_entity_not_found_while_connecting() {
        let mut h = Harness::new();
        h.session.start(&h.config).unwrap();

        h.transport
            .emit(TransportEvent::Error("Requested entity was not found.".into()));
        h.pump();

        assert!(matches!(h.session.state(), SessionState::Error(LiveError::Authorization(_))));
        assert!(!h.capture.held());
        assert!(!h.session.holds_connection());
        let snapshot = h.session.snapshot();
        assert!(snapshot.reauthorize);
        assert_eq!(snapshot.error.unwrap().kind, "authorization_error");
    }

    #[test]
    fn test_generic_transport_error_while_active() {
        let mut h = Harness::new();
        h.open();
        h.transport.emit(TransportEvent::Error("socket reset".into()));
        h.pump();

        assert!(matches!(h.session.state(), SessionState::Error(LiveError::Transport(_))));
        assert!(!h.session.snapshot().reauthorize);
        assert!(h.playback().is_released());
    }

    #[test]
    fn test_open_failure_releases_microphone() {
        let transport = FakeTransport::failing_open(LiveError::Authorization("no API key configured".into()));
        let mut h = Harness::with(FakeDevices::new(), transport);

        let err = h.session.start(&h.config).unwrap_err();
        assert_eq!(err.kind(), "authorization_error");
        assert!(!h.capture.held());
        assert!(h.playback().is_released());
    }

    #[test]
    fn test_remote_close() {
        let mut h = Harness::new();
        h.open();
        h.transport.emit(TransportEvent::Close(None));
        h.pump();

        assert_eq!(h.session.state(), &SessionState::Closed);
        assert_eq!(h.session.snapshot().label, "Session Closed");
        assert!(!h.capture.held());
    }

    #[test]
    fn test_terminal_states_need_fresh_start() {
        let mut h = Harness::new();
        h.open();
        h.transport.emit(TransportEvent::Close(Some("bye".into())));
        h.pump();

        // Late callbacks cannot revive a closed session
        h.transport.emit(TransportEvent::Open);
        h.pump();
        assert_eq!(h.session.state(), &SessionState::Closed);
        assert!(h.session.stop().is_err());

        h.session.start(&h.config).unwrap();
        assert_eq!(h.session.state(), &SessionState::Connecting);
        assert_eq!(h.capture.acquire_calls(), 2);
    }

    #[test]
    fn test_second_start_is_refused() {
        let mut h = Harness::new();
        h.open();
        let err = h.session.start(&h.config).unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");
        assert_eq!(h.transport.open_count(), 1);
    }

    #[test]
    fn test_stale_connection_events_are_ignored() {
        let mut h = Harness::new();
        h.open();
        h.session.stop().unwrap();
        h.session.start(&h.config).unwrap();

        // An error from the first connection arrives late
        h.transport.emit_on(0, TransportEvent::Error("old socket died".into()));
        h.pump();
        assert_eq!(h.session.state(), &SessionState::Connecting);

        h.transport.emit_on(1, TransportEvent::Open);
        h.pump();
        assert_eq!(h.session.state(), &SessionState::Active);
    }

    #[test]
    fn test_stop_from_idle_is_noop() {
        let mut h = Harness::new();
        assert!(h.session.stop().is_ok());
        assert_eq!(h.session.state(), &SessionState::Idle);
        assert_eq!(h.session.snapshot().label, "Standby");
    }
}
