//! # Duplex Session Transport
//!
//! The contract between the live session and whatever carries audio to the
//! remote model and back.
//!
//! ## Lifecycle:
//! 1. `open(setup, events)` returns a `Connection` immediately; the actual
//!    handshake happens in the background
//! 2. the transport reports `Open`, then any number of `Message`s, and finally
//!    either `Close` or `Error` through the `EventSender`
//! 3. `Connection::close()` ends the connection from our side; after it no
//!    further events are expected (stale ones are filtered by epoch anyway)
//!
//! ## Message payload:
//! Transport-specific wire formats are mapped onto `LiveMessage`: optional
//! input/output transcript fragments, zero or more base64 PCM16 audio payloads,
//! and the interruption and turn-complete flags.

pub mod gemini;

use crate::audio::outbound::FrameSink;
use crate::config::AppConfig;
use crate::error::LiveError;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Everything the transport needs to set up a remote session.
#[derive(Debug, Clone)]
pub struct SessionSetup {
    pub endpoint: String,
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    pub api_key: Option<String>,
    pub input_transcription: bool,
    pub output_transcription: bool,
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
}

impl SessionSetup {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            endpoint: config.live.endpoint.clone(),
            model: config.live.model.clone(),
            voice_name: config.live.voice_name.clone(),
            system_instruction: config.live.system_instruction.clone(),
            api_key: config.live.api_key.clone().filter(|k| !k.trim().is_empty()),
            input_transcription: config.live.input_transcription,
            output_transcription: config.live.output_transcription,
            capture_sample_rate: config.audio.capture_sample_rate,
            playback_sample_rate: config.audio.playback_sample_rate,
        }
    }
}

/// One message from the remote side, already stripped of wire details.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LiveMessage {
    /// What the service heard the user say
    pub input_transcript: Option<String>,
    /// What the assistant is saying
    pub output_transcript: Option<String>,
    /// Base64 PCM16 audio payloads, in arrival order
    pub audio: Vec<String>,
    /// The user barged in; in-flight playback must stop
    pub interrupted: bool,
    pub turn_complete: bool,
}

impl LiveMessage {
    pub fn is_empty(&self) -> bool {
        self.input_transcript.is_none()
            && self.output_transcript.is_none()
            && self.audio.is_empty()
            && !self.interrupted
            && !self.turn_complete
    }
}

/// Connection lifecycle callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Message(LiveMessage),
    Error(String),
    Close(Option<String>),
}

/// A transport event stamped with the connection it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedEvent {
    pub epoch: u64,
    pub event: TransportEvent,
}

/// Handle a transport uses to report events for one connection.
#[derive(Debug, Clone)]
pub struct EventSender {
    epoch: u64,
    tx: mpsc::UnboundedSender<TaggedEvent>,
}

impl EventSender {
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<TaggedEvent>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Deliver an event; returns false once the session side has gone away.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TaggedEvent {
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }
}

/// An open (or opening) duplex connection, exclusively owned by one session.
pub trait Connection: Send {
    /// Where the outbound streamer submits frames. Frames submitted before the
    /// connection reports `Open` are queued and flushed in order once it does.
    fn frame_sink(&self) -> Arc<dyn FrameSink>;

    /// Best-effort close. Idempotent.
    fn close(&mut self) -> Result<(), LiveError>;
}

/// Factory for connections.
pub trait DuplexTransport: Send {
    fn name(&self) -> &'static str;

    /// Start opening a connection. Fails synchronously only for problems that
    /// can be detected up front (missing credentials, malformed endpoint).
    fn open(
        &mut self,
        setup: &SessionSetup,
        events: EventSender,
    ) -> Result<Box<dyn Connection>, LiveError>;
}
