//! # Configuration Management
//!
//! Loads the voice relay configuration from several layered sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` next to the binary
//! - Environment variables with the `APP_` prefix (nested keys use `__`)
//! - A few well-known variables that deployment platforms set directly
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `GEMINI_API_KEY` / `GOOGLE_API_KEY`, `HOST`, `PORT`
//! 2. `APP_` environment variables (`APP_SERVER__PORT=3000`, `APP_RELAY__GREETING=...`)
//! 3. `config.toml`
//! 4. Defaults
//!
//! The Gemini credential is optional at load time. A server without one still
//! starts; voice connections then receive a single error frame instead of a session.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Environment variable holding the Gemini credential.
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";
/// Fallback variable name used by Google's own tooling.
pub const API_KEY_FALLBACK_ENV: &str = "GOOGLE_API_KEY";

/// Main application configuration.
///
/// ## Sections:
/// - `server`: where the HTTP listener binds
/// - `gemini`: upstream Live API credential, model and voice
/// - `audio`: capture framing parameters shared by the relay and client
/// - `relay`: the `/ws/gemini-voice` endpoint itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub gemini: GeminiConfig,
    pub audio: AudioConfig,
    pub relay: RelayConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Upstream Gemini Live settings.
///
/// `api_key` is never echoed back by the config endpoints; they only report
/// whether one is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    /// Bidirectional streaming endpoint (the `?key=` query is appended at connect time)
    pub endpoint: String,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub system_instruction: Option<String>,
}

/// Audio framing shared by the capture pipeline and the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Target sample rate of outgoing PCM16 frames (Hz)
    pub sample_rate: u32,
    /// Samples per emitted frame
    pub frame_samples: usize,
    /// MIME tag attached to raw binary frames when forwarded upstream
    pub input_mime_type: String,
}

/// Voice relay endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub enabled: bool,
    pub path: String,
    /// Serve the relay on its own listener instead of the main HTTP port
    #[serde(default)]
    pub port: Option<u16>,
    /// Instruction the voice client sends once its capture graph is wired
    pub greeting: String,
    pub max_connections: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
    /// Capacity of the recent-sessions store behind `/api/v1/voice/sessions`
    pub recent_sessions: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            gemini: GeminiConfig {
                api_key: None,
                model: "gemini-2.0-flash-live-001".to_string(),
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                voice: None,
                system_instruction: None,
            },
            audio: AudioConfig {
                sample_rate: 16000,
                frame_samples: 1024,
                input_mime_type: "audio/pcm;rate=16000".to_string(),
            },
            relay: RelayConfig {
                enabled: true,
                path: "/ws/gemini-voice".to_string(),
                port: None,
                greeting: "Hello! Please greet the user briefly and ask how you can help.".to_string(),
                max_connections: 32,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
                recent_sessions: 64,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from all sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`
    /// - `APP_GEMINI__MODEL=gemini-2.0-flash-live-001`
    /// - `APP_RELAY__PORT=8081`
    /// - `GEMINI_API_KEY=...`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Some(key) = credential_from_env() {
            settings = settings.set_override("gemini.api_key", key)?;
        }

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.relay.port == Some(0) {
            return Err(anyhow::anyhow!("Relay port cannot be 0"));
        }

        if self.audio.sample_rate == 0 {
            return Err(anyhow::anyhow!("Audio sample rate must be greater than 0"));
        }

        if self.audio.frame_samples == 0 {
            return Err(anyhow::anyhow!("Audio frame size must be greater than 0"));
        }

        if !self.relay.path.starts_with('/') {
            return Err(anyhow::anyhow!("Relay path must start with '/'"));
        }

        if self.relay.max_connections == 0 {
            return Err(anyhow::anyhow!("Max relay connections must be greater than 0"));
        }

        if self.relay.recent_sessions == 0 {
            return Err(anyhow::anyhow!("Recent session capacity must be greater than 0"));
        }

        if self.relay.client_timeout_secs <= self.relay.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout must be longer than the heartbeat interval"
            ));
        }

        Ok(())
    }

    /// Whether a non-empty Gemini credential is configured.
    pub fn has_credential(&self) -> bool {
        self.gemini
            .api_key
            .as_deref()
            .map(|key| !key.trim().is_empty())
            .unwrap_or(false)
    }

    /// Apply a partial JSON update (used by `PUT /api/v1/config`).
    ///
    /// Only the fields present in the body change. The credential and the
    /// listener ports cannot be changed at runtime since both are consumed at
    /// startup, so they are ignored here.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(gemini) = partial_config.get("gemini") {
            if let Some(model) = gemini.get("model").and_then(|v| v.as_str()) {
                self.gemini.model = model.to_string();
            }
            if let Some(voice) = gemini.get("voice") {
                self.gemini.voice = voice.as_str().map(str::to_string);
            }
            if let Some(instruction) = gemini.get("system_instruction") {
                self.gemini.system_instruction = instruction.as_str().map(str::to_string);
            }
        }

        if let Some(relay) = partial_config.get("relay") {
            if let Some(enabled) = relay.get("enabled").and_then(|v| v.as_bool()) {
                self.relay.enabled = enabled;
            }
            if let Some(greeting) = relay.get("greeting").and_then(|v| v.as_str()) {
                self.relay.greeting = greeting.to_string();
            }
            if let Some(max) = relay.get("max_connections").and_then(|v| v.as_u64()) {
                self.relay.max_connections = max as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

fn credential_from_env() -> Option<String> {
    [API_KEY_ENV, API_KEY_FALLBACK_ENV]
        .iter()
        .filter_map(|name| env::var(name).ok())
        .find(|value| !value.trim().is_empty())
}
