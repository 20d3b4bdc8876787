//! # Gemini Live Transport
//!
//! `DuplexTransport` over the Gemini Live bidirectional WebSocket
//! (`BidiGenerateContent`).
//!
//! ## Protocol:
//! 1. connect to `{endpoint}?key={api_key}`
//! 2. send the `setup` message (model, voice, system instruction, transcription)
//! 3. wait for `setupComplete`, then report `Open`
//! 4. stream `realtimeInput.mediaChunks` out and `serverContent` in
//! 5. close with a normal close frame
//!
//! The service sends JSON in both text and binary frames, so both are parsed.
//! Frames captured before `setupComplete` wait in the connection's queue and
//! are flushed in order once the session is open.

use crate::audio::frame::AudioFrame;
use crate::audio::outbound::FrameSink;
use crate::error::LiveError;
use crate::transport::{Connection, DuplexTransport, EventSender, LiveMessage, SessionSetup, TransportEvent};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

// ---- outbound wire format ----

#[derive(Debug, Serialize)]
struct SetupMessage {
    setup: SetupPayload,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupPayload {
    model: String,
    generation_config: GenerationConfig,
    system_instruction: Content,
    #[serde(skip_serializing_if = "Option::is_none")]
    input_audio_transcription: Option<EmptyConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_audio_transcription: Option<EmptyConfig>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: Vec<&'static str>,
    speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig {
    voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfig {
    prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoiceConfig {
    voice_name: String,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct EmptyConfig {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputMessage {
    realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput {
    media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunk {
    mime_type: String,
    data: String,
}

/// JSON for the first message of a session.
pub fn setup_message(setup: &SessionSetup) -> Result<String, LiveError> {
    let model = if setup.model.starts_with("models/") {
        setup.model.clone()
    } else {
        format!("models/{}", setup.model)
    };

    let message = SetupMessage {
        setup: SetupPayload {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO"],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: setup.voice_name.clone(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: setup.system_instruction.clone(),
                }],
            },
            input_audio_transcription: setup.input_transcription.then_some(EmptyConfig {}),
            output_audio_transcription: setup.output_transcription.then_some(EmptyConfig {}),
        },
    };

    serde_json::to_string(&message).map_err(|e| LiveError::Transport(format!("setup encoding failed: {}", e)))
}

/// JSON carrying one captured frame.
pub fn audio_message(frame: &AudioFrame) -> Result<String, LiveError> {
    let message = RealtimeInputMessage {
        realtime_input: RealtimeInput {
            media_chunks: vec![MediaChunk {
                mime_type: frame.mime_type(),
                data: frame.to_base64(),
            }],
        },
    };

    serde_json::to_string(&message).map_err(|e| LiveError::Send(format!("frame {} encoding failed: {}", frame.seq(), e)))
}

// ---- inbound wire format ----

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    error: Option<ServerError>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Default, Deserialize)]
struct Transcription {
    text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerError {
    message: Option<String>,
}

/// One server frame, reduced to what the session cares about.
#[derive(Debug, Default, PartialEq)]
pub struct ServerFrame {
    pub setup_complete: bool,
    pub message: LiveMessage,
    pub error: Option<String>,
}

/// Parse one JSON server frame.
pub fn parse_server_message(text: &str) -> Result<ServerFrame, LiveError> {
    let raw: ServerMessage =
        serde_json::from_str(text).map_err(|e| LiveError::Decode(format!("server message: {}", e)))?;

    let mut frame = ServerFrame {
        setup_complete: raw.setup_complete.is_some(),
        error: raw
            .error
            .map(|e| e.message.unwrap_or_else(|| "unknown server error".to_string())),
        ..Default::default()
    };

    if let Some(content) = raw.server_content {
        let message = &mut frame.message;
        message.input_transcript = content
            .input_transcription
            .and_then(|t| t.text)
            .filter(|t| !t.is_empty());
        message.output_transcript = content
            .output_transcription
            .and_then(|t| t.text)
            .filter(|t| !t.is_empty());
        message.interrupted = content.interrupted;
        message.turn_complete = content.turn_complete;

        if let Some(turn) = content.model_turn {
            message.audio = turn
                .parts
                .into_iter()
                .filter_map(|part| part.inline_data)
                .filter(|data| data.mime_type.is_empty() || data.mime_type.starts_with("audio/"))
                .map(|data| data.data)
                .collect();
        }
    }

    Ok(frame)
}

/// Map a close frame onto the event the session should see.
///
/// A normal close is a remote hang-up; anything else carries a failure cause.
pub fn close_event(frame: Option<CloseFrame<'_>>) -> TransportEvent {
    match frame {
        None => TransportEvent::Close(None),
        Some(frame) if frame.code == CloseCode::Normal => {
            let reason = frame.reason.to_string();
            TransportEvent::Close((!reason.is_empty()).then_some(reason))
        }
        Some(frame) => {
            let reason = frame.reason.to_string();
            if reason.is_empty() {
                TransportEvent::Error(format!("connection closed with code {}", u16::from(frame.code)))
            } else {
                TransportEvent::Error(reason)
            }
        }
    }
}

// ---- transport ----

/// Opens Gemini Live connections on the current tokio runtime.
#[derive(Debug, Default)]
pub struct GeminiLiveTransport;

impl GeminiLiveTransport {
    pub fn new() -> Self {
        Self
    }
}

impl DuplexTransport for GeminiLiveTransport {
    fn name(&self) -> &'static str {
        "gemini-live"
    }

    fn open(&mut self, setup: &SessionSetup, events: EventSender) -> Result<Box<dyn Connection>, LiveError> {
        let api_key = setup
            .api_key
            .clone()
            .ok_or_else(|| LiveError::Authorization("no API key configured".to_string()))?;

        if !(setup.endpoint.starts_with("wss://") || setup.endpoint.starts_with("ws://")) {
            return Err(LiveError::Transport(format!("invalid endpoint: {}", setup.endpoint)));
        }
        let url = format!("{}?key={}", setup.endpoint, api_key);
        let setup_json = setup_message(setup)?;

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| LiveError::Transport("no async runtime available".to_string()))?;

        let (frames_tx, frames_rx) = mpsc::unbounded_channel::<AudioFrame>();
        let (close_tx, close_rx) = oneshot::channel();

        info!(endpoint = %setup.endpoint, model = %setup.model, epoch = events.epoch(), "Opening Gemini Live connection");
        runtime.spawn(run_connection(url, setup_json, frames_rx, close_rx, events));

        Ok(Box::new(GeminiConnection {
            frames: Arc::new(frames_tx),
            close: Some(close_tx),
        }))
    }
}

struct GeminiConnection {
    frames: Arc<mpsc::UnboundedSender<AudioFrame>>,
    close: Option<oneshot::Sender<()>>,
}

impl Connection for GeminiConnection {
    fn frame_sink(&self) -> Arc<dyn FrameSink> {
        self.frames.clone()
    }

    fn close(&mut self) -> Result<(), LiveError> {
        match self.close.take() {
            Some(close) => close
                .send(())
                .map_err(|_| LiveError::Transport("connection already finished".to_string())),
            None => Ok(()),
        }
    }
}

async fn run_connection(
    url: String,
    setup_json: String,
    mut frames: mpsc::UnboundedReceiver<AudioFrame>,
    mut close: oneshot::Receiver<()>,
    events: EventSender,
) {
    let connected = tokio::select! {
        result = tokio_tungstenite::connect_async(url.as_str()) => result,
        _ = &mut close => {
            debug!(epoch = events.epoch(), "Connection closed before it was established");
            return;
        }
    };

    let mut ws = match connected {
        Ok((ws, _response)) => ws,
        Err(e) => {
            events.emit(TransportEvent::Error(e.to_string()));
            return;
        }
    };

    if let Err(e) = ws.send(Message::Text(setup_json)).await {
        events.emit(TransportEvent::Error(format!("failed to send setup: {}", e)));
        return;
    }

    let mut open = false;
    let mut frames_sent: u64 = 0;
    let mut samples_sent: usize = 0;

    loop {
        tokio::select! {
            _ = &mut close => {
                let _ = ws
                    .send(Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "session ended".into(),
                    })))
                    .await;
                debug!(
                    epoch = events.epoch(),
                    frames_sent,
                    samples_sent,
                    "Gemini Live connection closed locally"
                );
                return;
            }
            Some(frame) = frames.recv(), if open => {
                let json = match audio_message(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(error = %e, "Dropping outbound frame");
                        continue;
                    }
                };
                // A broken socket surfaces through the read half
                match ws.send(Message::Text(json)).await {
                    Ok(()) => {
                        frames_sent += 1;
                        samples_sent += frame.sample_count();
                    }
                    Err(e) => warn!(seq = frame.seq(), error = %e, "Dropping outbound frame after send failure"),
                }
            }
            incoming = ws.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("Ignoring non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        events.emit(close_event(frame));
                        return;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        events.emit(TransportEvent::Error(e.to_string()));
                        return;
                    }
                    None => {
                        events.emit(TransportEvent::Close(None));
                        return;
                    }
                };

                let parsed = match parse_server_message(&text) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        warn!(error = %e, "Ignoring malformed server message");
                        continue;
                    }
                };

                if let Some(cause) = parsed.error {
                    events.emit(TransportEvent::Error(cause));
                    return;
                }
                if parsed.setup_complete && !open {
                    open = true;
                    info!(epoch = events.epoch(), "Gemini Live setup complete");
                    events.emit(TransportEvent::Open);
                }
                if !parsed.message.is_empty() {
                    events.emit(TransportEvent::Message(parsed.message));
                }
            }
        }
    }
}
