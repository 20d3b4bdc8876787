//! Sample-accurate software mixer behind the playback backends.
//!
//! Scheduled buffers ("voices") are placed on a sample clock that advances only
//! as audio is rendered. `render` sums every voice overlapping the block,
//! clamps the result and fires completion notifiers for voices that ended.

use crate::audio::frame::PlaybackChunk;
use crate::audio::playback::{CompletionNotifier, PlaybackUnit, UnitId};
use crate::error::LiveError;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

struct Voice {
    samples: Arc<[f32]>,
    start: u64,
    notifier: Option<CompletionNotifier>,
}

impl Voice {
    fn end(&self) -> u64 {
        self.start + self.samples.len() as u64
    }
}

pub struct Mixer {
    sample_rate: u32,
    /// Samples rendered so far
    position: u64,
    voices: BTreeMap<UnitId, Voice>,
}

impl Mixer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            position: 0,
            voices: BTreeMap::new(),
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Output clock in seconds.
    pub fn current_time(&self) -> f64 {
        self.position as f64 / self.sample_rate as f64
    }

    /// Place `chunk` at `start_at` seconds. Times in the past start immediately.
    pub fn schedule(&mut self, id: UnitId, chunk: &PlaybackChunk, start_at: f64, notifier: CompletionNotifier) {
        let requested = (start_at.max(0.0) * self.sample_rate as f64).round() as u64;
        self.voices.insert(
            id,
            Voice {
                samples: chunk.samples().clone(),
                start: requested.max(self.position),
                notifier: Some(notifier),
            },
        );
    }

    /// Silence a voice. Returns false if it already finished (or never existed).
    pub fn stop(&mut self, id: UnitId) -> bool {
        self.voices.remove(&id).is_some()
    }

    pub fn active_voices(&self) -> usize {
        self.voices.len()
    }

    /// Render one mono block and advance the clock by its length.
    pub fn render(&mut self, out: &mut [f32]) {
        out.iter_mut().for_each(|s| *s = 0.0);
        let block_start = self.position;
        let block_end = block_start + out.len() as u64;

        for voice in self.voices.values() {
            let from = voice.start.max(block_start);
            let to = voice.end().min(block_end);
            for t in from..to {
                out[(t - block_start) as usize] += voice.samples[(t - voice.start) as usize];
            }
        }
        for sample in out.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
        self.position = block_end;

        let finished: Vec<UnitId> = self
            .voices
            .iter()
            .filter(|(_, v)| v.end() <= block_end)
            .map(|(id, _)| *id)
            .collect();
        for id in finished {
            if let Some(mut voice) = self.voices.remove(&id) {
                if let Some(notifier) = voice.notifier.take() {
                    notifier.notify();
                }
            }
        }
    }

    /// Render into an interleaved buffer, duplicating mono across channels.
    pub fn render_interleaved(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let mut mono = vec![0.0; out.len() / channels];
        self.render(&mut mono);
        for (frame, sample) in out.chunks_mut(channels).zip(mono.iter()) {
            frame.iter_mut().for_each(|s| *s = *sample);
        }
    }

    /// Drop every voice without notifying.
    pub fn clear(&mut self) {
        self.voices.clear();
    }
}

pub type SharedMixer = Arc<Mutex<Mixer>>;

/// A render thread that panicked mid-block leaves the mixer usable.
pub fn lock(mixer: &SharedMixer) -> MutexGuard<'_, Mixer> {
    mixer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to one voice on a shared mixer.
pub struct MixerUnit {
    id: UnitId,
    mixer: SharedMixer,
}

impl MixerUnit {
    pub fn new(id: UnitId, mixer: SharedMixer) -> Self {
        Self { id, mixer }
    }
}

impl PlaybackUnit for MixerUnit {
    fn id(&self) -> UnitId {
        self.id
    }

    fn stop(&mut self) -> Result<(), LiveError> {
        if lock(&self.mixer).stop(self.id) {
            Ok(())
        } else {
            Err(LiveError::Playback(format!("unit {} already finished", self.id.0)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn chunk(value: f32, len: usize) -> PlaybackChunk {
        PlaybackChunk::new(0, vec![value; len], 10)
    }

    #[test]
    fn test_voices_start_on_their_sample() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(10);
        mixer.schedule(UnitId(0), &chunk(0.25, 3), 0.2, CompletionNotifier::new(UnitId(0), tx));

        let mut out = [1.0; 6];
        mixer.render(&mut out);
        assert_eq!(out, [0.0, 0.0, 0.25, 0.25, 0.25, 0.0]);
        assert!((mixer.current_time() - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_overlapping_voices_are_summed_and_clamped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(10);
        mixer.schedule(UnitId(0), &chunk(0.75, 4), 0.0, CompletionNotifier::new(UnitId(0), tx.clone()));
        mixer.schedule(UnitId(1), &chunk(0.5, 4), 0.2, CompletionNotifier::new(UnitId(1), tx));

        let mut out = [0.0; 4];
        mixer.render(&mut out);
        assert_eq!(out, [0.75, 0.75, 1.0, 1.0]);
    }

    #[test]
    fn test_completion_is_notified_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(10);
        mixer.schedule(UnitId(7), &chunk(0.1, 2), 0.0, CompletionNotifier::new(UnitId(7), tx));

        let mut out = [0.0; 4];
        mixer.render(&mut out);
        mixer.render(&mut out);
        assert_eq!(rx.try_recv().unwrap(), UnitId(7));
        assert!(rx.try_recv().is_err());
        assert_eq!(mixer.active_voices(), 0);
    }

    #[test]
    fn test_stopped_unit_is_silent_and_not_notified() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mixer: SharedMixer = Arc::new(Mutex::new(Mixer::new(10)));
        lock(&mixer).schedule(UnitId(1), &chunk(0.5, 8), 0.0, CompletionNotifier::new(UnitId(1), tx));

        let mut unit = MixerUnit::new(UnitId(1), mixer.clone());
        unit.stop().unwrap();
        assert!(unit.stop().is_err());

        let mut out = [0.0; 8];
        lock(&mixer).render(&mut out);
        assert!(out.iter().all(|s| *s == 0.0));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_render_interleaved() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut mixer = Mixer::new(10);
        mixer.schedule(UnitId(0), &chunk(0.5, 2), 0.0, CompletionNotifier::new(UnitId(0), tx));

        let mut out = [0.0; 4];
        mixer.render_interleaved(&mut out, 2);
        assert_eq!(out, [0.5, 0.5, 0.5, 0.5]);
    }
}
