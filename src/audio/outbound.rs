//! # Outbound Streamer
//!
//! Bridges the push-based microphone callback to the push-based network send.
//!
//! ## Contract:
//! - Every capture block is encoded and handed to the connection's `FrameSink`
//!   exactly once, without waiting for the network.
//! - Frames are numbered and submitted in capture order (frame N+1 never
//!   before frame N).
//! - A failed submission is logged, counted and dropped. Nothing is ever
//!   raised back into the capture callback, because a stalled capture thread
//!   produces audible drops.

use crate::audio::frame::AudioFrame;
use crate::error::LiveError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Non-blocking destination for encoded frames.
///
/// Implementations must return immediately: they enqueue, they never wait for
/// the network. Called from audio threads.
pub trait FrameSink: Send + Sync {
    fn submit(&self, frame: AudioFrame) -> Result<(), LiveError>;
}

/// An unbounded tokio channel is the canonical sink: `send` never blocks and
/// preserves FIFO order.
impl FrameSink for mpsc::UnboundedSender<AudioFrame> {
    fn submit(&self, frame: AudioFrame) -> Result<(), LiveError> {
        self.send(frame)
            .map_err(|e| LiveError::Send(format!("frame {} not queued: connection gone", e.0.seq())))
    }
}

/// Counters for the outbound direction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct OutboundStats {
    pub frames_submitted: u64,
    pub send_failures: u64,
}

struct StreamerInner {
    sink: Arc<dyn FrameSink>,
    sample_rate: u32,
    next_seq: AtomicU64,
    submitted: AtomicU64,
    failed: AtomicU64,
}

/// Cheap-to-clone handle given to a capture device for the lifetime of a connection.
#[derive(Clone)]
pub struct OutboundStreamer {
    inner: Arc<StreamerInner>,
}

impl OutboundStreamer {
    pub fn new(sink: Arc<dyn FrameSink>, sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(StreamerInner {
                sink,
                sample_rate,
                next_seq: AtomicU64::new(0),
                submitted: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    /// Capture callback entry point: encode one block and submit it.
    ///
    /// Returns whether the frame was accepted by the sink. Callers are free to
    /// ignore the result.
    pub fn push_block(&self, samples: &[f32]) -> bool {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let frame = AudioFrame::encode(seq, samples, self.inner.sample_rate);

        match self.inner.sink.submit(frame) {
            Ok(()) => {
                self.inner.submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(err) => {
                let failures = self.inner.failed.fetch_add(1, Ordering::Relaxed) + 1;
                // The first failure is worth a warning, the rest are noise
                if failures == 1 {
                    warn!(frame = seq, error = %err, "Outbound frame dropped");
                } else {
                    debug!(frame = seq, failures, error = %err, "Outbound frame dropped");
                }
                false
            }
        }
    }

    pub fn stats(&self) -> OutboundStats {
        OutboundStats {
            frames_submitted: self.inner.submitted.load(Ordering::Relaxed),
            send_failures: self.inner.failed.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for OutboundStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundStreamer")
            .field("sample_rate", &self.inner.sample_rate)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<AudioFrame>>,
        fail_every: Option<u64>,
    }

    impl FrameSink for RecordingSink {
        fn submit(&self, frame: AudioFrame) -> Result<(), LiveError> {
            if let Some(n) = self.fail_every {
                if frame.seq() % n == n - 1 {
                    return Err(LiveError::Send("simulated failure".into()));
                }
            }
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    #[test]
    fn test_frames_submitted_in_capture_order() {
        let sink = Arc::new(RecordingSink::default());
        let streamer = OutboundStreamer::new(sink.clone(), 16000);

        for i in 0..50 {
            let level = i as f32 / 100.0;
            assert!(streamer.push_block(&vec![level; 4096]));
        }

        let frames = sink.frames.lock().unwrap();
        let seqs: Vec<u64> = frames.iter().map(|f| f.seq()).collect();
        assert_eq!(seqs, (0..50).collect::<Vec<_>>());
        assert!(frames.iter().all(|f| f.sample_count() == 4096));
        assert_eq!(streamer.stats().frames_submitted, 50);
        assert_eq!(streamer.stats().send_failures, 0);
    }

    #[test]
    fn test_send_failures_are_swallowed() {
        let sink = Arc::new(RecordingSink {
            fail_every: Some(3),
            ..Default::default()
        });
        let streamer = OutboundStreamer::new(sink.clone(), 16000);

        let accepted: Vec<bool> = (0..9).map(|_| streamer.push_block(&[0.1; 16])).collect();
        assert_eq!(accepted, vec![true, true, false, true, true, false, true, true, false]);

        let stats = streamer.stats();
        assert_eq!(stats.frames_submitted, 6);
        assert_eq!(stats.send_failures, 3);

        // Surviving frames keep their relative order
        let seqs: Vec<u64> = sink.frames.lock().unwrap().iter().map(|f| f.seq()).collect();
        assert_eq!(seqs, vec![0, 1, 3, 4, 6, 7]);
    }

    #[test]
    fn test_channel_sink_preserves_order_across_threads() {
        let (tx, mut rx) = mpsc::unbounded_channel::<AudioFrame>();
        let streamer = OutboundStreamer::new(Arc::new(tx), 16000);

        let capture = {
            let streamer = streamer.clone();
            std::thread::spawn(move || {
                for _ in 0..200 {
                    streamer.push_block(&[0.0; 128]);
                }
            })
        };
        capture.join().unwrap();

        let mut expected = 0;
        while let Ok(frame) = rx.try_recv() {
            assert_eq!(frame.seq(), expected);
            expected += 1;
        }
        assert_eq!(expected, 200);
    }

    #[test]
    fn test_closed_channel_counts_failure() {
        let (tx, rx) = mpsc::unbounded_channel::<AudioFrame>();
        drop(rx);
        let streamer = OutboundStreamer::new(Arc::new(tx), 16000);
        assert!(!streamer.push_block(&[0.0; 8]));
        assert_eq!(streamer.stats().send_failures, 1);
    }
}
