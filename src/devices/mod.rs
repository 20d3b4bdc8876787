//! # Audio Device Backends
//!
//! Concrete microphones and speakers for the live session.
//!
//! ## Backends:
//! - **wav** (default): a WAV file stands in for the microphone and the
//!   session's playback is rendered into a WAV file. Works everywhere.
//! - **cpal**: the system's default input and output devices. Only available
//!   when built with the `native-audio` feature.
//!
//! Every session asks the factory for fresh devices, so a released device is
//! never reused.

pub mod mixer;
#[cfg(feature = "native-audio")]
pub mod native;
pub mod wav;

use crate::audio::capture::CaptureDevice;
use crate::audio::playback::PlaybackDevice;
use crate::config::AppConfig;
use crate::error::LiveError;

/// Creates the devices for one session.
pub trait DeviceFactory: Send {
    fn capture(&self, config: &AppConfig) -> Result<Box<dyn CaptureDevice>, LiveError>;

    fn playback(&self, config: &AppConfig) -> Result<Box<dyn PlaybackDevice>, LiveError>;
}

/// Picks devices according to `devices.backend`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfiguredDevices;

impl DeviceFactory for ConfiguredDevices {
    fn capture(&self, config: &AppConfig) -> Result<Box<dyn CaptureDevice>, LiveError> {
        match config.devices.backend.as_str() {
            "wav" => Ok(Box::new(wav::WavCapture::new(
                &config.devices.input_wav,
                config.audio.capture_sample_rate,
                config.audio.block_size,
                config.devices.realtime,
            ))),
            "cpal" => native_capture(config),
            other => Err(LiveError::DeviceUnavailable(format!("unknown device backend '{}'", other))),
        }
    }

    fn playback(&self, config: &AppConfig) -> Result<Box<dyn PlaybackDevice>, LiveError> {
        match config.devices.backend.as_str() {
            "wav" => Ok(Box::new(wav::WavPlayback::new(
                &config.devices.output_wav,
                config.audio.playback_sample_rate,
                config.devices.realtime,
            )?)),
            "cpal" => native_playback(config),
            other => Err(LiveError::DeviceUnavailable(format!("unknown device backend '{}'", other))),
        }
    }
}

#[cfg(feature = "native-audio")]
fn native_capture(config: &AppConfig) -> Result<Box<dyn CaptureDevice>, LiveError> {
    Ok(Box::new(native::CpalCapture::new(
        config.audio.capture_sample_rate,
        config.audio.block_size,
    )))
}

#[cfg(feature = "native-audio")]
fn native_playback(config: &AppConfig) -> Result<Box<dyn PlaybackDevice>, LiveError> {
    Ok(Box::new(native::CpalPlayback::open(
        config.audio.playback_sample_rate,
        config.audio.channels,
    )?))
}

#[cfg(not(feature = "native-audio"))]
fn native_capture(_config: &AppConfig) -> Result<Box<dyn CaptureDevice>, LiveError> {
    Err(LiveError::DeviceUnavailable(
        "built without native audio support (enable the `native-audio` feature)".to_string(),
    ))
}

#[cfg(not(feature = "native-audio"))]
fn native_playback(_config: &AppConfig) -> Result<Box<dyn PlaybackDevice>, LiveError> {
    Err(LiveError::DeviceUnavailable(
        "built without native audio support (enable the `native-audio` feature)".to_string(),
    ))
}
