//! # Live Audio Module
//!
//! The real-time bidirectional audio core: microphone frames go out, streamed
//! replies come back and are played gaplessly, and the whole thing is driven
//! by one session state machine.
//!
//! ## Key Components:
//! - **codec**: float samples ↔ 16-bit little-endian PCM ↔ base64 text
//! - **frame**: `AudioFrame` (outbound) and `PlaybackChunk` (inbound) values
//! - **capture**: microphone contract (acquire, deliver blocks, release)
//! - **outbound**: capture callback → non-blocking, ordered network submission
//! - **playback**: gapless scheduling of inbound chunks, barge-in flushing
//! - **session**: lifecycle state machine that owns every resource
//! - **controller**: single task that serialises commands and callbacks
//!
//! ## Audio Format Requirements:
//! - **Capture**: 16kHz, 16-bit PCM, mono, 4096-sample blocks
//! - **Playback**: 24kHz, 16-bit PCM, mono
//! - **Encoding**: little-endian signed integers, base64 on the wire

pub mod capture;
pub mod codec;
pub mod controller;
pub mod frame;
pub mod outbound;
pub mod playback;
pub mod session;

#[cfg(test)]
pub mod testing;
