//! Audio values that travel through the live session.
//!
//! - **AudioFrame**: one encoded capture block, immutable once built
//! - **PlaybackChunk**: one decoded reply buffer, consumed by exactly one playback unit

use crate::audio::codec;
use crate::error::LiveError;
use std::sync::Arc;

/// One fixed-size block of microphone audio, already encoded as PCM16.
///
/// Frames are numbered in capture order; the transport must submit them in
/// that order.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    seq: u64,
    pcm: Arc<[u8]>,
    sample_rate: u32,
}

impl AudioFrame {
    /// Encode a capture block into a frame.
    pub fn encode(seq: u64, samples: &[f32], sample_rate: u32) -> Self {
        Self {
            seq,
            pcm: codec::encode_pcm16(samples).into(),
            sample_rate,
        }
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn pcm(&self) -> &[u8] {
        &self.pcm
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn sample_count(&self) -> usize {
        self.pcm.len() / codec::PCM16_BYTES_PER_SAMPLE
    }

    /// MIME type announcing the wire format, e.g. `audio/pcm;rate=16000`.
    pub fn mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.sample_rate)
    }

    /// Text-safe payload for the transport.
    pub fn to_base64(&self) -> String {
        codec::encode_base64(&self.pcm)
    }
}

/// A decoded reply buffer at the fixed playback rate, tagged with its arrival order.
#[derive(Debug, Clone)]
pub struct PlaybackChunk {
    seq: u64,
    samples: Arc<[f32]>,
    sample_rate: u32,
}

impl PlaybackChunk {
    pub fn new(seq: u64, samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            seq,
            samples: samples.into(),
            sample_rate,
        }
    }

    /// Decode a base64 PCM16 payload received from the remote side.
    pub fn from_base64(seq: u64, payload: &str, sample_rate: u32) -> Result<Self, LiveError> {
        let samples = codec::decode_payload(payload)?;
        Ok(Self::new(seq, samples, sample_rate))
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn samples(&self) -> &Arc<[f32]> {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}
