//! Sound card devices through cpal.
//!
//! cpal streams are not `Send`, so each stream lives on its own thread for as
//! long as the device is acquired. The thread reports whether the stream came
//! up, then parks until it is told to shut down.

use crate::audio::capture::CaptureDevice;
use crate::audio::frame::PlaybackChunk;
use crate::audio::outbound::OutboundStreamer;
use crate::audio::playback::{CompletionNotifier, PlaybackDevice, PlaybackUnit, UnitId};
use crate::devices::mixer::{self, Mixer, MixerUnit, SharedMixer};
use crate::error::LiveError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{info, warn};

/// A running stream thread and the channel that stops it.
struct StreamThread {
    stop: std_mpsc::Sender<()>,
    worker: JoinHandle<()>,
}

impl StreamThread {
    /// Run `build` on a fresh thread and keep its stream alive until `shutdown`.
    fn spawn<F>(name: &str, build: F) -> Result<Self, LiveError>
    where
        F: FnOnce() -> Result<cpal::Stream, LiveError> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let worker = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(LiveError::DeviceUnavailable(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                // Dropping the sender also counts as a stop request
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| LiveError::DeviceUnavailable(format!("cannot start {} thread: {}", name, e)))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self { stop: stop_tx, worker }),
            Ok(Err(err)) => {
                let _ = worker.join();
                Err(err)
            }
            Err(_) => {
                let _ = worker.join();
                Err(LiveError::DeviceUnavailable(format!("{} thread exited", name)))
            }
        }
    }

    fn shutdown(self) {
        let _ = self.stop.send(());
        if self.worker.join().is_err() {
            warn!("Audio stream thread panicked");
        }
    }
}

fn stream_config(channels: u16, sample_rate: u32) -> cpal::StreamConfig {
    cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

// ---- capture ----

type StreamerSlot = Arc<Mutex<Option<OutboundStreamer>>>;

pub struct CpalCapture {
    sample_rate: u32,
    block_size: usize,
    streamer: StreamerSlot,
    stream: Option<StreamThread>,
}

impl CpalCapture {
    pub fn new(sample_rate: u32, block_size: usize) -> Self {
        Self {
            sample_rate,
            block_size: block_size.max(1),
            streamer: Arc::new(Mutex::new(None)),
            stream: None,
        }
    }
}

impl CaptureDevice for CpalCapture {
    fn name(&self) -> String {
        "cpal:default-input".to_string()
    }

    fn acquire(&mut self) -> Result<(), LiveError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let sample_rate = self.sample_rate;
        let block_size = self.block_size;
        let slot = self.streamer.clone();

        let stream = StreamThread::spawn("cpal-capture", move || {
            let device = cpal::default_host()
                .default_input_device()
                .ok_or_else(|| LiveError::DeviceUnavailable("no input device available".to_string()))?;
            info!(device = %device.name().unwrap_or_else(|_| "unknown".to_string()), "Using input device");

            let mut block = Vec::with_capacity(block_size);
            device
                .build_input_stream(
                    &stream_config(1, sample_rate),
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        for &sample in data {
                            block.push(sample);
                            if block.len() == block_size {
                                // Nothing is streamed until the connection opens
                                if let Ok(slot) = slot.try_lock() {
                                    if let Some(streamer) = slot.as_ref() {
                                        streamer.push_block(&block);
                                    }
                                }
                                block.clear();
                            }
                        }
                    },
                    |err| warn!(error = %err, "Input stream error"),
                    None,
                )
                .map_err(|e| LiveError::DeviceUnavailable(e.to_string()))
        })?;

        self.stream = Some(stream);
        Ok(())
    }

    fn start(&mut self, streamer: OutboundStreamer) -> Result<(), LiveError> {
        if self.stream.is_none() {
            return Err(LiveError::DeviceUnavailable("capture not acquired".to_string()));
        }
        *self.streamer.lock().unwrap_or_else(|p| p.into_inner()) = Some(streamer);
        Ok(())
    }

    fn release(&mut self) {
        self.streamer.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(stream) = self.stream.take() {
            stream.shutdown();
        }
    }

    fn is_acquired(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.release();
    }
}

// ---- playback ----

pub struct CpalPlayback {
    mixer: SharedMixer,
    stream: Option<StreamThread>,
}

impl CpalPlayback {
    /// Open the default output device and start rendering silence.
    pub fn open(sample_rate: u32, channels: u16) -> Result<Self, LiveError> {
        let mixer: SharedMixer = Arc::new(Mutex::new(Mixer::new(sample_rate)));
        let render = mixer.clone();
        let channels = channels.max(1);

        let stream = StreamThread::spawn("cpal-playback", move || {
            let device = cpal::default_host()
                .default_output_device()
                .ok_or_else(|| LiveError::DeviceUnavailable("no output device available".to_string()))?;
            info!(device = %device.name().unwrap_or_else(|_| "unknown".to_string()), "Using output device");

            device
                .build_output_stream(
                    &stream_config(channels, sample_rate),
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        mixer::lock(&render).render_interleaved(data, channels as usize);
                    },
                    |err| warn!(error = %err, "Output stream error"),
                    None,
                )
                .map_err(|e| LiveError::DeviceUnavailable(e.to_string()))
        })?;

        Ok(Self {
            mixer,
            stream: Some(stream),
        })
    }
}

impl PlaybackDevice for CpalPlayback {
    fn name(&self) -> String {
        "cpal:default-output".to_string()
    }

    fn sample_rate(&self) -> u32 {
        mixer::lock(&self.mixer).sample_rate()
    }

    fn current_time(&self) -> f64 {
        mixer::lock(&self.mixer).current_time()
    }

    fn schedule_buffer(
        &mut self,
        id: UnitId,
        chunk: &PlaybackChunk,
        start_at: f64,
        on_completed: CompletionNotifier,
    ) -> Result<Box<dyn PlaybackUnit>, LiveError> {
        if self.stream.is_none() {
            return Err(LiveError::Playback("playback device released".to_string()));
        }
        mixer::lock(&self.mixer).schedule(id, chunk, start_at, on_completed);
        Ok(Box::new(MixerUnit::new(id, self.mixer.clone())))
    }

    fn release(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.shutdown();
        }
        mixer::lock(&self.mixer).clear();
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        self.release();
    }
}
