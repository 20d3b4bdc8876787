//! # Configuration Management
//!
//! Loads application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_PORT, APP_LIVE_MODEL, etc.), plus the bare
//!    `HOST`, `PORT`, `GEMINI_API_KEY` and `API_KEY` variables
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)
//!
//! ## Sections:
//! - **server**: HTTP control plane address
//! - **live**: remote live session (endpoint, model, voice, persona, credentials)
//! - **audio**: wire formats and capture block size
//! - **devices**: which capture/playback backend a session uses

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub live: LiveConfig,
    pub audio: AudioConfig,
    pub devices: DevicesConfig,
}

/// Server-specific configuration settings.
///
/// - `host = "127.0.0.1"`: only the local UI can drive the session (default)
/// - `host = "0.0.0.0"`: accept control requests from any address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Remote live session settings.
///
/// ## Fields:
/// - `endpoint`: WebSocket URL of the bidirectional generate-content service
/// - `model`: model name (without the `models/` prefix)
/// - `voice_name`: prebuilt voice used for spoken replies
/// - `system_instruction`: persona prompt sent in the setup message
/// - `api_key`: credentials; usually supplied through `GEMINI_API_KEY`
/// - `input_transcription` / `output_transcription`: ask the service to transcribe
///   what the user says and what the assistant says
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    pub endpoint: String,
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub input_transcription: bool,
    pub output_transcription: bool,
}

/// Audio format settings.
///
/// ## Wire formats:
/// - Capture: 16 kHz, 16-bit signed little-endian PCM, mono
/// - Playback: 24 kHz, 16-bit signed little-endian PCM, mono
///
/// `block_size` is the number of samples per capture callback (4096 samples is
/// 256 ms at 16 kHz).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    pub block_size: usize,
    pub channels: u16,
}

/// Capture/playback backend selection.
///
/// ## Backends:
/// - `wav`: microphone replaced by a WAV file, speaker rendered into a WAV file
/// - `cpal`: the default sound card input and output (requires the `native-audio` feature)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicesConfig {
    pub backend: String,
    pub input_wav: String,
    pub output_wav: String,
    pub realtime: bool,
}

pub const DEVICE_BACKENDS: [&str; 2] = ["wav", "cpal"];

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            live: LiveConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
                voice_name: "Zephyr".to_string(),
                system_instruction: "You are a helpful and charismatic AI assistant named Vedviarn. Keep your responses conversational and brief.".to_string(),
                api_key: None,
                input_transcription: true,
                output_transcription: true,
            },
            audio: AudioConfig {
                capture_sample_rate: 16000,
                playback_sample_rate: 24000,
                block_size: 4096,
                channels: 1,
            },
            devices: DevicesConfig {
                backend: "wav".to_string(),
                input_wav: "input.wav".to_string(),
                output_wav: "output.wav".to_string(),
                realtime: true,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER_PORT=3000`: Override server port
    /// - `APP_DEVICES_BACKEND=cpal`: Use the sound card
    /// - `GEMINI_API_KEY=...`: Credentials for the live service
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        // GEMINI_API_KEY wins over the generic API_KEY
        if let Some(key) = env::var("GEMINI_API_KEY").ok().or_else(|| env::var("API_KEY").ok()) {
            settings = settings.set_override("live.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Model name is present
    /// - Sample rates and block size are positive
    /// - Audio is mono (the wire formats only carry one channel)
    /// - The device backend is a known one
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.live.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Live model name cannot be empty"));
        }

        if self.audio.capture_sample_rate == 0 || self.audio.playback_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.block_size == 0 {
            return Err(anyhow::anyhow!("Capture block size must be greater than 0"));
        }

        if self.audio.channels != 1 {
            return Err(anyhow::anyhow!(
                "Only mono audio is supported, got {} channels",
                self.audio.channels
            ));
        }

        if !DEVICE_BACKENDS.contains(&self.devices.backend.as_str()) {
            return Err(anyhow::anyhow!(
                "Unknown device backend '{}', expected one of {:?}",
                self.devices.backend,
                DEVICE_BACKENDS
            ));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (runtime config updates).
    ///
    /// Only the provided fields change; e.g. `{"live": {"voice_name": "Puck"}}`
    /// switches the voice and leaves everything else alone. Changes apply to the
    /// next session started.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Server port {} out of range", port))?;
            }
        }

        if let Some(live) = partial_config.get("live") {
            if let Some(endpoint) = live.get("endpoint").and_then(|v| v.as_str()) {
                self.live.endpoint = endpoint.to_string();
            }
            if let Some(model) = live.get("model").and_then(|v| v.as_str()) {
                self.live.model = model.to_string();
            }
            if let Some(voice) = live.get("voice_name").and_then(|v| v.as_str()) {
                self.live.voice_name = voice.to_string();
            }
            if let Some(instruction) = live.get("system_instruction").and_then(|v| v.as_str()) {
                self.live.system_instruction = instruction.to_string();
            }
            if let Some(key) = live.get("api_key").and_then(|v| v.as_str()) {
                self.live.api_key = Some(key.to_string());
            }
            if let Some(flag) = live.get("input_transcription").and_then(|v| v.as_bool()) {
                self.live.input_transcription = flag;
            }
            if let Some(flag) = live.get("output_transcription").and_then(|v| v.as_bool()) {
                self.live.output_transcription = flag;
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(rate) = audio.get("capture_sample_rate").and_then(|v| v.as_u64()) {
                self.audio.capture_sample_rate = u32::try_from(rate)
                    .map_err(|_| anyhow::anyhow!("Capture sample rate {} out of range", rate))?;
            }
            if let Some(rate) = audio.get("playback_sample_rate").and_then(|v| v.as_u64()) {
                self.audio.playback_sample_rate = u32::try_from(rate)
                    .map_err(|_| anyhow::anyhow!("Playback sample rate {} out of range", rate))?;
            }
            if let Some(block) = audio.get("block_size").and_then(|v| v.as_u64()) {
                self.audio.block_size = usize::try_from(block)
                    .map_err(|_| anyhow::anyhow!("Block size {} out of range", block))?;
            }
            if let Some(channels) = audio.get("channels").and_then(|v| v.as_u64()) {
                self.audio.channels = u16::try_from(channels)
                    .map_err(|_| anyhow::anyhow!("Channel count {} out of range", channels))?;
            }
        }

        if let Some(devices) = partial_config.get("devices") {
            if let Some(backend) = devices.get("backend").and_then(|v| v.as_str()) {
                self.devices.backend = backend.to_string();
            }
            if let Some(path) = devices.get("input_wav").and_then(|v| v.as_str()) {
                self.devices.input_wav = path.to_string();
            }
            if let Some(path) = devices.get("output_wav").and_then(|v| v.as_str()) {
                self.devices.output_wav = path.to_string();
            }
            if let Some(realtime) = devices.get("realtime").and_then(|v| v.as_bool()) {
                self.devices.realtime = realtime;
            }
        }

        self.validate()?;
        Ok(())
    }

    /// Configuration as JSON with the API key redacted.
    pub fn redacted_json(&self) -> serde_json::Value {
        serde_json::json!({
            "server": {
                "host": self.server.host,
                "port": self.server.port
            },
            "live": {
                "endpoint": self.live.endpoint,
                "model": self.live.model,
                "voice_name": self.live.voice_name,
                "system_instruction": self.live.system_instruction,
                "api_key_configured": self.live.api_key.as_deref().map_or(false, |k| !k.is_empty()),
                "input_transcription": self.live.input_transcription,
                "output_transcription": self.live.output_transcription
            },
            "audio": {
                "capture_sample_rate": self.audio.capture_sample_rate,
                "playback_sample_rate": self.audio.playback_sample_rate,
                "block_size": self.audio.block_size,
                "channels": self.audio.channels
            },
            "devices": {
                "backend": self.devices.backend,
                "input_wav": self.devices.input_wav,
                "output_wav": self.devices.output_wav,
                "realtime": self.devices.realtime
            }
        })
    }
}
