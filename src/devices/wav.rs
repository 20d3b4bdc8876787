//! File-backed audio devices.
//!
//! `WavCapture` plays a 16 kHz mono 16-bit WAV file into the session as if it
//! were a microphone. `WavPlayback` renders scheduled reply audio through the
//! software mixer and streams it into a WAV file, whose size fields are filled
//! in when the device is released. Together they make the service usable on machines without
//! a sound card, and reproducible in tests.

use crate::audio::capture::CaptureDevice;
use crate::audio::codec;
use crate::audio::frame::PlaybackChunk;
use crate::audio::outbound::OutboundStreamer;
use crate::audio::playback::{CompletionNotifier, PlaybackDevice, PlaybackUnit, UnitId};
use crate::devices::mixer::{self, Mixer, MixerUnit, SharedMixer};
use crate::error::LiveError;
use byteorder::{LittleEndian, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Mixer render step for file playback.
const RENDER_STEP: Duration = Duration::from_millis(20);

/// How often an unpaced render thread checks for newly scheduled audio.
const IDLE_POLL: Duration = Duration::from_millis(5);

/// Read a mono 16-bit PCM WAV file at `expected_rate` into float samples.
pub fn read_pcm16_mono(path: &Path, expected_rate: u32) -> Result<Vec<f32>, LiveError> {
    let file = File::open(path)
        .map_err(|e| LiveError::DeviceUnavailable(format!("cannot open {}: {}", path.display(), e)))?;
    let (header, data) = wav::read(&mut BufReader::new(file))
        .map_err(|e| LiveError::DeviceUnavailable(format!("cannot read {}: {}", path.display(), e)))?;

    if header.channel_count != 1 {
        return Err(LiveError::DeviceUnavailable(format!(
            "{} has {} channels, expected mono",
            path.display(),
            header.channel_count
        )));
    }
    if header.sampling_rate != expected_rate {
        return Err(LiveError::DeviceUnavailable(format!(
            "{} is {} Hz, expected {} Hz",
            path.display(),
            header.sampling_rate,
            expected_rate
        )));
    }

    match data {
        wav::BitDepth::Sixteen(samples) => Ok(samples.into_iter().map(codec::i16_to_sample).collect()),
        _ => Err(LiveError::DeviceUnavailable(format!(
            "{} is not 16-bit PCM",
            path.display()
        ))),
    }
}

/// Mono 16-bit PCM WAV file written incrementally.
///
/// The header goes out first with an empty data chunk; `finish` patches the
/// RIFF and data sizes once the sample count is known.
struct WavSink {
    writer: BufWriter<File>,
    /// Offset of the data chunk's size field
    data_size_at: u64,
    samples: u64,
}

impl WavSink {
    fn create(path: &Path, sample_rate: u32) -> std::io::Result<Self> {
        let header = wav::Header::new(wav::header::WAV_FORMAT_PCM, 1, sample_rate, 16);
        let mut writer = BufWriter::new(File::create(path)?);
        wav::write(header, &wav::BitDepth::Sixteen(Vec::new()), &mut writer)?;
        let data_size_at = writer.stream_position()? - 4;
        Ok(Self {
            writer,
            data_size_at,
            samples: 0,
        })
    }

    fn append(&mut self, block: &[f32]) -> std::io::Result<()> {
        for sample in block {
            self.writer.write_i16::<LittleEndian>(codec::sample_to_i16(*sample))?;
        }
        self.samples += block.len() as u64;
        Ok(())
    }

    /// Fill in the sizes and flush. Returns the number of samples written.
    fn finish(mut self) -> std::io::Result<u64> {
        let data_bytes = self.samples * codec::PCM16_BYTES_PER_SAMPLE as u64;
        let riff_size = self.data_size_at + 4 + data_bytes - 8;
        let too_large = |_| std::io::Error::new(std::io::ErrorKind::Other, "WAV data exceeds 4 GiB");

        self.writer.seek(SeekFrom::Start(self.data_size_at))?;
        self.writer.write_u32::<LittleEndian>(u32::try_from(data_bytes).map_err(too_large)?)?;
        self.writer.seek(SeekFrom::Start(4))?;
        self.writer.write_u32::<LittleEndian>(u32::try_from(riff_size).map_err(too_large)?)?;
        self.writer.flush()?;
        Ok(self.samples)
    }
}

type SharedSink = Arc<Mutex<Option<WavSink>>>;

/// Append rendered output; after a write error the file is abandoned.
fn append_rendered(sink: &SharedSink, block: &[f32]) {
    let mut guard = sink.lock().unwrap_or_else(|p| p.into_inner());
    if let Some(writer) = guard.as_mut() {
        if let Err(e) = writer.append(block) {
            warn!(error = %e, "Stopped writing session playback");
            *guard = None;
        }
    }
}

// ---- capture ----

pub struct WavCapture {
    path: PathBuf,
    sample_rate: u32,
    block_size: usize,
    /// Deliver blocks at the pace a microphone would
    paced: bool,
    samples: Option<Arc<[f32]>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl WavCapture {
    pub fn new(path: impl Into<PathBuf>, sample_rate: u32, block_size: usize, paced: bool) -> Self {
        Self {
            path: path.into(),
            sample_rate,
            block_size: block_size.max(1),
            paced,
            samples: None,
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl CaptureDevice for WavCapture {
    fn name(&self) -> String {
        format!("wav:{}", self.path.display())
    }

    fn acquire(&mut self) -> Result<(), LiveError> {
        let samples = read_pcm16_mono(&self.path, self.sample_rate)?;
        info!(
            path = %self.path.display(),
            seconds = samples.len() as f64 / self.sample_rate as f64,
            "WAV capture source loaded"
        );
        self.samples = Some(samples.into());
        Ok(())
    }

    fn start(&mut self, streamer: OutboundStreamer) -> Result<(), LiveError> {
        let samples = self
            .samples
            .clone()
            .ok_or_else(|| LiveError::DeviceUnavailable("capture not acquired".to_string()))?;
        if self.worker.is_some() {
            return Ok(());
        }

        self.stop.store(false, Ordering::SeqCst);
        let stop = self.stop.clone();
        let block_size = self.block_size;
        let block_time = Duration::from_secs_f64(block_size as f64 / self.sample_rate as f64);
        let paced = self.paced;

        let worker = std::thread::Builder::new()
            .name("wav-capture".to_string())
            .spawn(move || {
                let mut block = vec![0.0f32; block_size];
                let mut delivered = 0usize;
                for chunk in samples.chunks(block_size) {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    // The last block is padded with silence to the fixed size
                    block[..chunk.len()].copy_from_slice(chunk);
                    block[chunk.len()..].iter_mut().for_each(|s| *s = 0.0);
                    streamer.push_block(&block);
                    delivered += 1;
                    if paced {
                        std::thread::sleep(block_time);
                    }
                }
                debug!(blocks = delivered, "WAV capture finished");
            })
            .map_err(|e| LiveError::DeviceUnavailable(format!("cannot start capture thread: {}", e)))?;

        self.worker = Some(worker);
        Ok(())
    }

    fn release(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("WAV capture thread panicked");
            }
        }
        self.samples = None;
    }

    fn is_acquired(&self) -> bool {
        self.samples.is_some()
    }
}

impl Drop for WavCapture {
    fn drop(&mut self) {
        self.release();
    }
}

// ---- playback ----

pub struct WavPlayback {
    path: PathBuf,
    mixer: SharedMixer,
    sink: SharedSink,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    released: bool,
}

impl WavPlayback {
    /// Playback rendered by a background thread into `path`.
    ///
    /// Paced output advances the clock in real time, silence included. Unpaced
    /// output renders only while something is scheduled, as fast as it can,
    /// so the clock stands still between replies.
    pub fn new(path: impl Into<PathBuf>, sample_rate: u32, paced: bool) -> Result<Self, LiveError> {
        let mut playback = Self::manual(path, sample_rate)?;
        playback.running.store(true, Ordering::SeqCst);

        let mixer = playback.mixer.clone();
        let sink = playback.sink.clone();
        let running = playback.running.clone();
        let step = (sample_rate as f64 * RENDER_STEP.as_secs_f64()).round() as usize;

        let worker = std::thread::Builder::new()
            .name("wav-playback".to_string())
            .spawn(move || {
                let mut block = vec![0.0f32; step];
                while running.load(Ordering::SeqCst) {
                    if paced {
                        std::thread::sleep(RENDER_STEP);
                    } else if mixer::lock(&mixer).active_voices() == 0 {
                        std::thread::sleep(IDLE_POLL);
                        continue;
                    }
                    mixer::lock(&mixer).render(&mut block);
                    append_rendered(&sink, &block);
                }
            })
            .map_err(|e| LiveError::DeviceUnavailable(format!("cannot start playback thread: {}", e)))?;

        playback.worker = Some(worker);
        Ok(playback)
    }

    /// Playback whose clock only moves through `advance`.
    pub fn manual(path: impl Into<PathBuf>, sample_rate: u32) -> Result<Self, LiveError> {
        let path = path.into();
        let sink = WavSink::create(&path, sample_rate)
            .map_err(|e| LiveError::DeviceUnavailable(format!("cannot create {}: {}", path.display(), e)))?;

        Ok(Self {
            path,
            mixer: Arc::new(Mutex::new(Mixer::new(sample_rate))),
            sink: Arc::new(Mutex::new(Some(sink))),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            released: false,
        })
    }

    /// Render `seconds` of output immediately.
    pub fn advance(&self, seconds: f64) {
        let rate = mixer::lock(&self.mixer).sample_rate();
        let mut block = vec![0.0f32; (seconds * rate as f64).round() as usize];
        mixer::lock(&self.mixer).render(&mut block);
        append_rendered(&self.sink, &block);
    }
}

impl PlaybackDevice for WavPlayback {
    fn name(&self) -> String {
        format!("wav:{}", self.path.display())
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
        if self.released {
            return Err(LiveError::Playback("playback device released".to_string()));
        }
        mixer::lock(&self.mixer).schedule(id, chunk, start_at, on_completed);
        Ok(Box::new(MixerUnit::new(id, self.mixer.clone())))
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("WAV playback thread panicked");
            }
        }
        let (rate, unfinished) = {
            let mut mixer = mixer::lock(&self.mixer);
            let unfinished = mixer.active_voices();
            mixer.clear();
            (mixer.sample_rate(), unfinished)
        };
        if unfinished > 0 {
            debug!(voices = unfinished, "Dropping playback still in the mixer");
        }

        let sink = self.sink.lock().unwrap_or_else(|p| p.into_inner()).take();
        let Some(sink) = sink else { return };
        match sink.finish() {
            Ok(samples) => info!(
                path = %self.path.display(),
                seconds = samples as f64 / rate as f64,
                "Session playback written"
            ),
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to write session playback"),
        }
    }
}

impl Drop for WavPlayback {
    fn drop(&mut self) {
        self.release();
    }
}
