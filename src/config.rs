//! # Configuration Management
//!
//! Loads the gateway configuration once at startup from several sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml, optional)
//! - Environment variables (with APP_ prefix)
//! - A few well-known variables used by deployment platforms and container
//!   images (`HOST`, `PORT`, `WLK_MODEL`, `WLK_DIARIZATION`, `WLK_LANGUAGE`)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Special-case variables (`HOST`, `PORT`, `WLK_*`)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_SESSION__DRAIN_GRACE_MS`, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Why `__` as the separator:
//! Several keys contain underscores (`drain_grace_ms`), so a single `_` cannot
//! tell nesting apart from a word break.

use crate::device::DevicePreference;
use crate::engine::model::ModelSize;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// Breaking configuration into logical groups (server, engine, session)
/// mirrors the three layers of the gateway: the HTTP listener, the shared
/// transcription engine, and the per-connection session coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub session: SessionConfig,
}

/// Server-specific configuration settings.
///
/// ## Fields:
/// - `host`: IP address or hostname to bind the server to
/// - `port`: TCP port number to listen on
/// - `max_concurrent_sessions`: connections beyond this are refused with 503
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_concurrent_sessions: usize,
}

/// Transcription engine settings. These select how the shared Engine Handle
/// is built and are never changed after startup.
///
/// ## Fields:
/// - `model`: Whisper size tier ("tiny", "base", "small", "medium", "large")
/// - `diarization`: attribute lines to speakers
/// - `language`: ISO 639-1 language code passed to the decoder
/// - `device`: "auto", "cpu", "cuda" or "metal"
/// - `window_seconds`: how much audio each transcription pass covers
/// - `min_flush_seconds`: shortest tail worth transcribing at end of input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub model: String,
    pub diarization: bool,
    pub language: String,
    pub device: String,
    pub window_seconds: f64,
    pub min_flush_seconds: f64,
}

/// Per-connection session tuning.
///
/// ## Fields:
/// - `result_buffer`: capacity of the result channel between pipeline and relay.
///   When it is full, `feed` suspends (backpressure).
/// - `drain_grace_ms`: how long a cleanly ending session waits for the relay
///   to deliver the flushed results before cancelling it
/// - `heartbeat_interval_secs`: WebSocket ping interval
/// - `client_timeout_secs`: silence after which the client is considered gone
/// - `max_frame_bytes`: largest WebSocket frame accepted from a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub result_buffer: usize,
    pub drain_grace_ms: u64,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    pub max_frame_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
                max_concurrent_sessions: 16,
            },
            engine: EngineConfig {
                model: "medium".to_string(),
                diarization: true,
                language: "en".to_string(),
                device: "auto".to_string(),
                window_seconds: 5.0,
                min_flush_seconds: 0.3,
            },
            session: SessionConfig {
                result_buffer: 64,
                drain_grace_ms: 10_000,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
                max_frame_bytes: 16 * 1024 * 1024,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from all sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=9000`: Override server port
    /// - `APP_ENGINE__DEVICE=cuda`: Run the model on the first CUDA device
    /// - `WLK_MODEL=small`: Override the model size tier
    /// - `WLK_DIARIZATION=false`: Disable speaker attribution
    /// - `PORT=3000`: Special case for deployment platforms
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(model) = env::var("WLK_MODEL") {
            settings = settings.set_override("engine.model", model)?;
        }

        if let Ok(flag) = env::var("WLK_DIARIZATION") {
            settings = settings.set_override("engine.diarization", parse_flag(&flag))?;
        }

        if let Ok(language) = env::var("WLK_LANGUAGE") {
            settings = settings.set_override("engine.language", language)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        self.engine.model.parse::<ModelSize>()?;

        self.engine
            .device
            .parse::<DevicePreference>()
            .map_err(|e| anyhow::anyhow!(e))?;

        if self.engine.language.trim().is_empty() {
            return Err(anyhow::anyhow!("Engine language cannot be empty"));
        }

        if !(1.0..=30.0).contains(&self.engine.window_seconds) {
            return Err(anyhow::anyhow!(
                "Engine window must be between 1 and 30 seconds, got {}",
                self.engine.window_seconds
            ));
        }

        if self.engine.min_flush_seconds < 0.0
            || self.engine.min_flush_seconds > self.engine.window_seconds
        {
            return Err(anyhow::anyhow!(
                "Minimum flush duration must be between 0 and the window length"
            ));
        }

        if self.session.result_buffer == 0 {
            return Err(anyhow::anyhow!("Session result buffer must be greater than 0"));
        }

        if self.session.max_frame_bytes == 0 {
            return Err(anyhow::anyhow!("Maximum WebSocket frame size must be greater than 0"));
        }

        if self.session.heartbeat_interval_secs == 0
            || self.session.client_timeout_secs <= self.session.heartbeat_interval_secs
        {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than the (non-zero) heartbeat interval"
            ));
        }

        Ok(())
    }
}

impl SessionConfig {
    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

/// Interpret a boolean-ish environment value:
/// `1`, `true` and `yes` (any case) enable, everything else disables.
pub fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}
