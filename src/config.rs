//! # Configuration Management
//!
//! Settings for the daemon, the live connection and the audio pipeline, merged from:
//! - built-in defaults
//! - an optional `config.toml` next to the binary
//! - `APP_*` environment variables (`__` between nested keys)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Platform variables (HOST, PORT, API_KEY)
//! 2. Environment variables (APP_SERVER__PORT, APP_LIVE__MODEL, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

use crate::audio::capture::CaptureConfig;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, live connection,
/// audio pipeline, UI websocket) keeps each concern readable on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub live: LiveConfig,
    pub audio: AudioConfig,
    pub websocket: WebSocketConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (the usual case for a voice daemon)
/// - `host = "0.0.0.0"`: Accept connections from any IP address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,  // u16 = unsigned 16-bit integer (0-65535), perfect for port numbers
}

/// Settings for the streaming connection to the generative AI service.
///
/// ## Fields:
/// - `endpoint`: WebSocket URL of the bidirectional streaming API
/// - `model`: Model identifier sent in the session-open request
/// - `system_instruction`: Persona text sent with the session-open request
/// - `api_key`: Opaque credential appended to the connection URL
/// - `connect_timeout_secs`: How long to wait for the service to acknowledge the session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    pub endpoint: String,
    pub model: String,
    pub system_instruction: String,
    pub api_key: String,
    pub connect_timeout_secs: u64,
}

/// Audio pipeline settings.
///
/// ## Fields:
/// - `capture_sample_rate`: Microphone rate in Hz (uplink is `audio/pcm;rate=16000`)
/// - `frame_size`: Samples per captured frame
/// - `playback_sample_rate`: Speaker rate in Hz (downlink is `audio/pcm;rate=24000`)
/// - `max_frame_backlog`: Queued frames tolerated before a backpressure warning
/// - `clamp_capture`: Clamp captured samples to [-1, 1] before encoding
/// - `input_device` / `output_device`: `"default"` or part of a device name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub capture_sample_rate: u32,
    pub frame_size: usize,
    pub playback_sample_rate: u32,
    pub max_frame_backlog: usize,
    pub clamp_capture: bool,
    pub input_device: String,
    pub output_device: String,
}

/// Settings for the UI-facing websocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSocketConfig {
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    /// How many session events a slow subscriber may fall behind by
    pub event_capacity: usize,
}

/// Values that work against the public Gemini Live endpoint with a 16kHz
/// microphone and a 24kHz speaker; only the API key has to be supplied.
/// `(section, field)` pairs that `update_from_json` refuses to change
const STARTUP_ONLY_FIELDS: &[(&str, &str)] = &[
    ("server", "host"),
    ("server", "port"),
    ("audio", "capture_sample_rate"),
    ("audio", "playback_sample_rate"),
    ("audio", "input_device"),
    ("audio", "output_device"),
];

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only
                port: 8080,
            },
            live: LiveConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
                system_instruction: "You are MantraChat via voice. Be helpful.".to_string(),
                api_key: String::new(),   // Supplied through API_KEY
                connect_timeout_secs: 10,
            },
            audio: AudioConfig {
                capture_sample_rate: 16000,   // 16kHz mono uplink
                frame_size: 4096,             // ~256ms per frame at 16kHz
                playback_sample_rate: 24000,  // 24kHz mono downlink
                max_frame_backlog: 4,
                clamp_capture: false,
                input_device: "default".to_string(),
                output_device: "default".to_string(),
            },
            websocket: WebSocketConfig {
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
                event_capacity: 64,
            },
        }
    }
}

impl AudioConfig {
    /// Capture settings derived from this section.
    pub fn to_capture_config(&self) -> CaptureConfig {
        CaptureConfig {
            sample_rate: self.capture_sample_rate,
            frame_size: self.frame_size,
            max_backlog: self.max_frame_backlog,
            clamp: self.clamp_capture,
        }
    }
}

impl AppConfig {
    /// Build the configuration, later layers overriding earlier ones:
    /// defaults, `config.toml`, `APP_*` variables, then `HOST`/`PORT`/`API_KEY`.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_LIVE__MODEL=gemini-live-2.5-flash`: Override the model
    /// - `APP_AUDIO__MAX_FRAME_BACKLOG=8`: Override the backpressure bound
    /// - `API_KEY=...`: The service credential
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults - converts our Default impl to config format
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from config.toml file (if it exists)
            .add_source(config::File::with_name("config").required(false))
            // 3. Load from environment variables with APP_ prefix
            // Double underscore separates sections so keys like max_frame_backlog survive
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        // Handle special environment variables used by deployment platforms
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(api_key) = env::var("API_KEY") {
            settings = settings.set_override("live.api_key", api_key)?;
        }

        // Build the final configuration and convert it back to our AppConfig struct
        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - The live endpoint is a websocket URL and a model is named
    /// - Sample rates, frame size and backlog bound are non-zero
    /// - The websocket client timeout outlasts the heartbeat interval
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if !(self.live.endpoint.starts_with("ws://") || self.live.endpoint.starts_with("wss://")) {
            return Err(anyhow::anyhow!(
                "Live endpoint must be a ws:// or wss:// URL, got '{}'",
                self.live.endpoint
            ));
        }

        if self.live.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Live model must not be empty"));
        }

        if self.audio.capture_sample_rate == 0 || self.audio.playback_sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rates must be greater than 0"));
        }

        if self.audio.frame_size == 0 {
            return Err(anyhow::anyhow!("Audio frame size must be greater than 0"));
        }

        if self.audio.max_frame_backlog == 0 {
            return Err(anyhow::anyhow!("Max frame backlog must be greater than 0"));
        }

        if self.websocket.client_timeout_secs <= self.websocket.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Websocket client timeout must be longer than the heartbeat interval"
            ));
        }

        if self.websocket.event_capacity == 0 {
            return Err(anyhow::anyhow!("Websocket event capacity must be greater than 0"));
        }

        Ok(())  // All validation passed
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present in the JSON are changed, e.g.
    /// `{"audio": {"max_frame_backlog": 8}}`. The credential can be replaced but
    /// is never echoed back by the config endpoints.
    ///
    /// ## Startup-only fields:
    /// The bind address, device names and device sample rates are fixed once
    /// the server is running. Sending them with a different value is an
    /// error; sending them unchanged (e.g. a whole config read back from
    /// `GET /api/v1/config`) is fine.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        // Parse the JSON string into a generic value
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        let current = serde_json::to_value(&*self)?;
        for (section, field) in STARTUP_ONLY_FIELDS {
            if let Some(value) = partial_config.get(*section).and_then(|s| s.get(*field)) {
                if current[*section][*field] != *value {
                    anyhow::bail!(
                        "{}.{} is only read at startup; change it in config.toml and restart",
                        section,
                        field
                    );
                }
            }
        }

        if let Some(live) = partial_config.get("live") {
            if let Some(endpoint) = live.get("endpoint").and_then(|v| v.as_str()) {
                self.live.endpoint = endpoint.to_string();
            }
            if let Some(model) = live.get("model").and_then(|v| v.as_str()) {
                self.live.model = model.to_string();
            }
            if let Some(instruction) = live.get("system_instruction").and_then(|v| v.as_str()) {
                self.live.system_instruction = instruction.to_string();
            }
            if let Some(api_key) = live.get("api_key").and_then(|v| v.as_str()) {
                self.live.api_key = api_key.to_string();
            }
            if let Some(timeout) = live.get("connect_timeout_secs").and_then(|v| v.as_u64()) {
                self.live.connect_timeout_secs = timeout;
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(backlog) = audio.get("max_frame_backlog").and_then(|v| v.as_u64()) {
                self.audio.max_frame_backlog = usize::try_from(backlog)
                    .map_err(|_| anyhow::anyhow!("max_frame_backlog {} is out of range", backlog))?;
            }
            if let Some(frame_size) = audio.get("frame_size").and_then(|v| v.as_u64()) {
                self.audio.frame_size = usize::try_from(frame_size)
                    .map_err(|_| anyhow::anyhow!("frame_size {} is out of range", frame_size))?;
            }
            if let Some(clamp) = audio.get("clamp_capture").and_then(|v| v.as_bool()) {
                self.audio.clamp_capture = clamp;
            }
        }

        // Validate the updated configuration to ensure it's still valid
        self.validate()?;
        Ok(())
    }
}
