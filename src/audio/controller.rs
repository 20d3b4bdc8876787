//! # Live Session Controller
//!
//! Runs a `LiveSession` on one tokio task. HTTP handlers and WebSocket
//! observers talk to it through a cloneable `LiveHandle`; transport events and
//! playback completions arrive on the session's inbox. A single `select!` loop
//! applies all of them one at a time, so the session never needs a lock.

use crate::audio::session::{LiveSession, SessionInbox, SessionSnapshot, TranscriptEntry};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult, LiveError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

const COMMAND_QUEUE_CAPACITY: usize = 32;

enum Command {
    Start {
        config: Box<AppConfig>,
        reply: oneshot::Sender<Result<SessionSnapshot, LiveError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<SessionSnapshot, LiveError>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Transcript {
        reply: oneshot::Sender<Vec<TranscriptEntry>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable front door to the controller task.
#[derive(Clone)]
pub struct LiveHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SessionSnapshot>,
    transcript: broadcast::Sender<TranscriptEntry>,
}

impl std::fmt::Debug for LiveHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveHandle")
            .field("state", &self.status.borrow().state)
            .finish()
    }
}

pub struct LiveController {
    session: LiveSession,
    inbox: SessionInbox,
    commands: mpsc::Receiver<Command>,
}

impl LiveController {
    /// Move `session` onto its own task and return a handle to it.
    pub fn spawn(session: LiveSession, inbox: SessionInbox) -> (LiveHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let handle = LiveHandle {
            commands: tx,
            status: session.subscribe_status(),
            transcript: session.transcript_feed(),
        };

        let controller = LiveController {
            session,
            inbox,
            commands: rx,
        };
        let task = tokio::spawn(controller.run());

        (handle, task)
    }

    async fn run(mut self) {
        info!("Live controller started");

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.apply(command) {
                            break;
                        }
                    }
                    // Every handle is gone
                    None => break,
                },
                Some(event) = self.inbox.events.recv() => {
                    self.session.handle_event(event);
                }
                Some(unit) = self.inbox.completions.recv() => {
                    self.session.handle_unit_completed(unit);
                }
            }
        }

        if self.session.state().is_running() {
            let _ = self.session.stop();
        }
        info!("Live controller stopped");
    }

    /// Returns false when the loop should end.
    fn apply(&mut self, command: Command) -> bool {
        match command {
            Command::Start { config, reply } => {
                let result = self.session.start(&config).map(|_| self.session.snapshot());
                let _ = reply.send(result);
            }
            Command::Stop { reply } => {
                let result = self.session.stop().map(|_| self.session.snapshot());
                let _ = reply.send(result);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.session.snapshot());
            }
            Command::Transcript { reply } => {
                let _ = reply.send(self.session.transcript().to_vec());
            }
            Command::Shutdown { reply } => {
                debug!("Live controller shutting down");
                if self.session.state().is_running() {
                    let _ = self.session.stop();
                }
                let _ = reply.send(());
                return false;
            }
        }
        true
    }
}

fn controller_gone() -> AppError {
    AppError::Internal("live session controller is not running".to_string())
}

impl LiveHandle {
    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> AppResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.map_err(|_| controller_gone())?;
        rx.await.map_err(|_| controller_gone())
    }

    pub async fn start(&self, config: AppConfig) -> AppResult<SessionSnapshot> {
        let result = self
            .request(|reply| Command::Start {
                config: Box::new(config),
                reply,
            })
            .await?;
        Ok(result?)
    }

    pub async fn stop(&self) -> AppResult<SessionSnapshot> {
        let result = self.request(|reply| Command::Stop { reply }).await?;
        Ok(result?)
    }

    pub async fn snapshot(&self) -> AppResult<SessionSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn transcript(&self) -> AppResult<Vec<TranscriptEntry>> {
        self.request(|reply| Command::Transcript { reply }).await
    }

    /// Stop any running session and end the controller task.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    /// Latest published snapshot, without a round trip to the task.
    pub fn current(&self) -> SessionSnapshot {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionSnapshot> {
        self.status.clone()
    }

    pub fn subscribe_transcript(&self) -> broadcast::Receiver<TranscriptEntry> {
        self.transcript.subscribe()
    }
}
