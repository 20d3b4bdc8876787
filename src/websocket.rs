//! # Live Session WebSocket
//!
//! Observer channel for UIs. Clients connect to `/ws/live` and receive the
//! session's status and transcript as they change; they may also start and
//! stop the session over the same socket.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the current status is sent immediately
//! 2. **Status**: every state or playback change is pushed as `status`
//! 3. **Transcript**: every new fragment is pushed as `transcript`
//! 4. **Control**: `start` / `stop` messages drive the session
//! 5. **Heartbeat**: `ping` every 30s; silent clients are dropped after 60s
//!
//! ## Message Format:
//! - **Client → Server**: `{"type":"start"}`, `{"type":"stop"}`, `{"type":"pong","timestamp":..}`
//! - **Server → Client**: `status`, `transcript`, `error` and `ping` JSON messages
//!
//! Audio never travels over this socket; it flows between the devices and the
//! remote service directly.

use crate::audio::controller::LiveHandle;
use crate::audio::session::{SessionSnapshot, TranscriptEntry};
use crate::error::AppError;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Messages pushed to observers.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Session status (state, label, playback clock, counters)
    #[serde(rename = "status")]
    Status { session: SessionSnapshot },

    /// A new transcript fragment
    #[serde(rename = "transcript")]
    Transcript { entry: TranscriptEntry },

    #[serde(rename = "error")]
    Error {
        /// Error code
        code: String,
        /// Human-readable error message
        message: String,
    },

    /// Heartbeat/ping message
    #[serde(rename = "ping")]
    Ping { timestamp: u64 },
}

/// Messages accepted from observers.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Start a live session with the current configuration
    #[serde(rename = "start")]
    Start,

    /// Stop the running live session
    #[serde(rename = "stop")]
    Stop,

    /// Heartbeat/pong response carrying the ping's timestamp
    #[serde(rename = "pong")]
    Pong { timestamp: u64 },
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// One connected observer.
pub struct LiveWebSocket {
    app_state: web::Data<AppState>,
    live: LiveHandle,
    last_heartbeat: Instant,
}

impl LiveWebSocket {
    pub fn new(app_state: web::Data<AppState>) -> Self {
        let live = app_state.live.clone();
        Self {
            app_state,
            live,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(e) => error!(error = %e, "Failed to serialize WebSocket message"),
        }
    }

    fn send_error(ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        Self::send(
            ctx,
            &ServerMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    /// Run a session command off the actor and report failures back to it.
    fn run_command(&self, ctx: &mut ws::WebsocketContext<Self>, start: bool) {
        let state = self.app_state.clone();
        let live = self.live.clone();
        let addr = ctx.address();

        actix::spawn(async move {
            let result = if start {
                let outcome = live.start(state.get_config()).await;
                if outcome.is_ok() {
                    state.increment_sessions_started();
                }
                outcome
            } else {
                live.stop().await
            };

            // Success is visible through the status stream
            if let Err(err) = result {
                addr.do_send(CommandFailed(err));
            }
        });
    }
}

/// A start/stop request from this client failed.
#[derive(Message)]
#[rtype(result = "()")]
struct CommandFailed(AppError);

impl Actor for LiveWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Live observer connected");

        Self::send(ctx, &ServerMessage::Status { session: self.live.current() });

        // Only changes after the snapshot just sent
        ctx.add_stream(WatchStream::from_changes(self.live.subscribe_status()));
        ctx.add_stream(BroadcastStream::new(self.live.subscribe_transcript()));

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                Self::send(ctx, &ServerMessage::Ping { timestamp: now_millis() });
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        // Observers never own the session; it keeps running without them
        info!("Live observer disconnected");
    }
}

/// Status changes from the session.
impl StreamHandler<SessionSnapshot> for LiveWebSocket {
    fn handle(&mut self, session: SessionSnapshot, ctx: &mut Self::Context) {
        Self::send(ctx, &ServerMessage::Status { session });
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!("Status stream ended");
    }
}

/// Transcript fragments from the session.
impl StreamHandler<Result<TranscriptEntry, BroadcastStreamRecvError>> for LiveWebSocket {
    fn handle(&mut self, item: Result<TranscriptEntry, BroadcastStreamRecvError>, ctx: &mut Self::Context) {
        match item {
            Ok(entry) => Self::send(ctx, &ServerMessage::Transcript { entry }),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "Observer fell behind the transcript feed");
            }
        }
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!("Transcript stream ended");
    }
}

/// Handle incoming WebSocket messages.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for LiveWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Start) => self.run_command(ctx, true),
                Ok(ClientMessage::Stop) => self.run_command(ctx, false),
                Ok(ClientMessage::Pong { timestamp }) => {
                    self.last_heartbeat = Instant::now();
                    debug!(rtt_ms = now_millis().saturating_sub(timestamp), "Observer pong");
                }
                Err(err) => Self::send_error(ctx, "invalid_message", &format!("Invalid message: {}", err)),
            },
            Ok(ws::Message::Binary(_)) => {
                Self::send_error(ctx, "unsupported", "Audio is not accepted on this socket");
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl Handler<CommandFailed> for LiveWebSocket {
    type Result = ();

    fn handle(&mut self, msg: CommandFailed, ctx: &mut Self::Context) {
        let code = match &msg.0 {
            AppError::Conflict(_) => "conflict",
            AppError::Session(err) => err.kind(),
            _ => "internal_error",
        };
        Self::send_error(ctx, code, &msg.0.to_string());
    }
}

/// WebSocket endpoint handler: upgrades the request and hands the connection
/// to a `LiveWebSocket` actor.
pub async fn live_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New live observer from: {:?}", req.connection_info().peer_addr());
    ws::start(LiveWebSocket::new(app_state), &req, stream)
}
