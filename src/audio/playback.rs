//! # Inbound Playback Scheduler
//!
//! Turns an arrival-ordered stream of reply chunks into continuous audio and
//! supports an immediate full stop when the remote side reports a barge-in.
//!
//! ## Algorithm, per arriving chunk:
//! 1. `start_at = max(playback_clock, device.current_time())`
//! 2. decode the payload into a buffer at the fixed playback rate
//! 3. schedule it on the device at `start_at` and track the returned unit
//! 4. `playback_clock = start_at + chunk.duration()`
//!
//! The clock is logical: it only moves by scheduled durations, so processing
//! jitter between chunks does not open gaps as long as each chunk arrives
//! before its scheduled start.
//!
//! ## Interruption:
//! Every tracked unit is stopped exactly once (errors from units that already
//! finished are ignored), the set is cleared and the clock is reset to the
//! device's current time, so the next chunk starts "now".
//!
//! ## Ownership:
//! The scheduler is mutated only from the session's single callback sequence;
//! natural completions come back as `UnitId`s on a channel and are applied via
//! `on_unit_completed` on that same sequence. No locking is involved.

use crate::audio::frame::PlaybackChunk;
use crate::error::LiveError;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Identifier of one scheduled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct UnitId(pub u64);

/// One-shot completion signal handed to the device with each buffer.
///
/// The device calls `notify` when the buffer has played to its end. A unit
/// that was stopped must not be notified.
#[derive(Debug)]
pub struct CompletionNotifier {
    id: UnitId,
    tx: mpsc::UnboundedSender<UnitId>,
}

impl CompletionNotifier {
    pub fn new(id: UnitId, tx: mpsc::UnboundedSender<UnitId>) -> Self {
        Self { id, tx }
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn notify(self) {
        // Receiver gone means the session was torn down; nothing left to update
        let _ = self.tx.send(self.id);
    }
}

/// Handle to one scheduled buffer on a playback device.
pub trait PlaybackUnit: Send {
    fn id(&self) -> UnitId;

    /// Silence the unit immediately. Fails if it already finished.
    fn stop(&mut self) -> Result<(), LiveError>;
}

/// Output side of the audio hardware (or its stand-in).
pub trait PlaybackDevice: Send {
    fn name(&self) -> String;

    fn sample_rate(&self) -> u32;

    /// Output clock in seconds; never decreases.
    fn current_time(&self) -> f64;

    /// Schedule `chunk` to begin at `start_at` seconds on the output clock.
    fn schedule_buffer(
        &mut self,
        id: UnitId,
        chunk: &PlaybackChunk,
        start_at: f64,
        on_completed: CompletionNotifier,
    ) -> Result<Box<dyn PlaybackUnit>, LiveError>;

    /// Free the device. Idempotent.
    fn release(&mut self);
}

/// Where and when a chunk was placed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScheduledPlayback {
    pub unit: UnitId,
    pub chunk_seq: u64,
    pub start_at: f64,
    pub duration: f64,
}

/// Counters for the inbound direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlaybackStats {
    pub chunks_scheduled: u64,
    pub decode_failures: u64,
    pub schedule_failures: u64,
    pub units_completed: u64,
    pub units_stopped: u64,
    pub interruptions: u64,
}

pub struct PlaybackScheduler {
    device: Box<dyn PlaybackDevice>,
    completions: mpsc::UnboundedSender<UnitId>,
    playback_clock: f64,
    active: BTreeMap<UnitId, Box<dyn PlaybackUnit>>,
    next_unit: u64,
    next_chunk: u64,
    stats: PlaybackStats,
}

impl PlaybackScheduler {
    /// Create a scheduler on top of `device`. Natural completions are reported
    /// on `completions` and must be fed back through `on_unit_completed`.
    pub fn new(device: Box<dyn PlaybackDevice>, completions: mpsc::UnboundedSender<UnitId>) -> Self {
        Self {
            device,
            completions,
            playback_clock: 0.0,
            active: BTreeMap::new(),
            next_unit: 0,
            next_chunk: 0,
            stats: PlaybackStats::default(),
        }
    }

    /// Number unit ids from `first_unit` instead of zero.
    ///
    /// Completions from an earlier scheduler may still be queued when a new
    /// one takes over, so ids must not repeat across schedulers sharing a
    /// completion channel.
    pub fn starting_at(mut self, first_unit: u64) -> Self {
        self.next_unit = first_unit;
        self
    }

    /// The id the next scheduled unit will get.
    pub fn next_unit_id(&self) -> u64 {
        self.next_unit
    }

    /// Decode a base64 PCM16 payload and schedule it.
    ///
    /// A malformed payload is counted and returned as `LiveError::Decode`; the
    /// clock and the active set are left untouched.
    pub fn schedule_payload(&mut self, payload: &str) -> Result<ScheduledPlayback, LiveError> {
        let seq = self.next_chunk;
        self.next_chunk += 1;

        let chunk = match PlaybackChunk::from_base64(seq, payload, self.device.sample_rate()) {
            Ok(chunk) if !chunk.is_empty() => chunk,
            Ok(_) => {
                self.stats.decode_failures += 1;
                return Err(LiveError::Decode(format!("chunk {} carries no samples", seq)));
            }
            Err(err) => {
                self.stats.decode_failures += 1;
                return Err(err);
            }
        };

        self.schedule_chunk(chunk)
    }

    /// Schedule an already decoded chunk back-to-back with the previous one.
    pub fn schedule_chunk(&mut self, chunk: PlaybackChunk) -> Result<ScheduledPlayback, LiveError> {
        let start_at = self.playback_clock.max(self.device.current_time());
        let duration = chunk.duration();
        let id = UnitId(self.next_unit);
        self.next_unit += 1;

        let notifier = CompletionNotifier::new(id, self.completions.clone());
        let unit = match self.device.schedule_buffer(id, &chunk, start_at, notifier) {
            Ok(unit) => unit,
            Err(err) => {
                self.stats.schedule_failures += 1;
                return Err(err);
            }
        };

        self.active.insert(id, unit);
        self.playback_clock = start_at + duration;
        self.stats.chunks_scheduled += 1;

        debug!(
            unit = id.0,
            chunk = chunk.seq(),
            start_at,
            duration,
            clock = self.playback_clock,
            "Scheduled playback chunk"
        );

        Ok(ScheduledPlayback {
            unit: id,
            chunk_seq: chunk.seq(),
            start_at,
            duration,
        })
    }

    /// A unit finished playing on its own; forget it.
    ///
    /// Unknown ids (already stopped by an interruption) are ignored.
    pub fn on_unit_completed(&mut self, id: UnitId) -> bool {
        if self.active.remove(&id).is_some() {
            self.stats.units_completed += 1;
            true
        } else {
            false
        }
    }

    /// Barge-in: silence everything in flight and restart the clock at "now".
    ///
    /// Returns how many units were stopped.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.stop_all();
        self.playback_clock = self.device.current_time();
        self.stats.interruptions += 1;
        info!(stopped, clock = self.playback_clock, "Playback interrupted");
        stopped
    }

    /// Stop everything and release the output device.
    pub fn shutdown(&mut self) {
        let stopped = self.stop_all();
        self.device.release();
        debug!(stopped, device = %self.device.name(), "Playback scheduler shut down");
    }

    fn stop_all(&mut self) -> usize {
        let units = std::mem::take(&mut self.active);
        let count = units.len();
        for (id, mut unit) in units {
            match unit.stop() {
                Ok(()) => self.stats.units_stopped += 1,
                // The unit ended between its last completion and now
                Err(err) => debug!(unit = id.0, error = %err, "Ignoring stop of finished unit"),
            }
        }
        count
    }

    pub fn playback_clock(&self) -> f64 {
        self.playback_clock
    }

    pub fn active_units(&self) -> usize {
        self.active.len()
    }

    pub fn stats(&self) -> PlaybackStats {
        self.stats
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        if !self.active.is_empty() {
            warn!(units = self.active.len(), "Playback scheduler dropped with units in flight");
            self.shutdown();
        }
    }
}
