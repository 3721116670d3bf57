//! # Configuration Management
//!
//! Loads the relay configuration from, in priority order (highest first):
//! 1. Well-known environment variables (`VOICE_API_KEY`, `OPENAI_API_KEY`, `HOST`, `PORT`)
//! 2. Environment variables with the `APP__` prefix (`APP__VOICE__URL`, ...)
//! 3. `config.toml` in the working directory (optional)
//! 4. Built-in defaults
//!
//! The voice service credential has no default. `validate()` rejects a configuration
//! without one, which makes startup fail before any traffic is served.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Port used when neither `PORT` nor a config file says otherwise.
pub const DEFAULT_PORT: u16 = 5050;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly phone assistant. Greet the caller, \
ask for their full name and their street address, and confirm both back to them.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub voice: VoiceConfig,
    pub extraction: ExtractionConfig,
}

/// HTTP listener settings.
///
/// ## Fields:
/// - `host`: address to bind (`0.0.0.0` so the telephony provider can reach us)
/// - `port`: TCP port
/// - `public_host`: host name advertised in the connect instruction; falls back to the
///   `Host` header of the incoming webhook request when unset
/// - `shutdown_timeout_secs`: how long in-flight connections get after a shutdown signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub public_host: Option<String>,
    pub shutdown_timeout_secs: u64,
}

/// Voice-AI streaming service settings.
///
/// Everything except `url` and `api_key` ends up in the per-call session-start
/// message, see [`crate::voice::protocol::VoiceSessionConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub url: String,
    pub api_key: String,
    pub audio_encoding: String,
    pub sample_rate: u32,
    pub voice: String,
    pub system_prompt: String,
    pub temperature: f64,
    /// Capacity of the per-call outbound audio queue
    pub outbound_queue: usize,
}

/// Post-call extraction settings. Extraction is skipped when `api_key` is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: DEFAULT_PORT,
                public_host: None,
                shutdown_timeout_secs: 10,
            },
            voice: VoiceConfig {
                url: "wss://voice.example.com/v1/stream".to_string(),
                api_key: String::new(),  // no default on purpose, must come from the environment
                audio_encoding: "mulaw".to_string(),  // what the telephony side sends
                sample_rate: 8000,
                voice: "alloy".to_string(),
                system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
                temperature: 0.8,
                outbound_queue: 256,
            },
            extraction: ExtractionConfig {
                url: "https://api.openai.com/v1/chat/completions".to_string(),
                api_key: String::new(),
                model: "gpt-4o-mini".to_string(),
                timeout_secs: 30,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `VOICE_API_KEY=sk-...`: voice service credential (required)
    /// - `OPENAI_API_KEY=sk-...`: enables post-call extraction
    /// - `PORT=8080`: listen port, the usual deployment-platform convention
    /// - `APP__VOICE__VOICE=shimmer`: any nested field, `__` separates sections
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").prefix_separator("__").separator("__"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("VOICE_API_KEY") {
            settings = settings.set_override("voice.api_key", key)?;
        }

        if let Ok(key) = env::var("OPENAI_API_KEY") {
            settings = settings.set_override("extraction.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate the loaded values.
    ///
    /// A missing voice credential is the one fatal startup error of the relay.
    pub fn validate(&self) -> Result<()> {
        if self.voice.api_key.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "VOICE_API_KEY is not set; refusing to start without a voice service credential"
            ));
        }

        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if !(self.voice.url.starts_with("ws://") || self.voice.url.starts_with("wss://")) {
            return Err(anyhow::anyhow!("Voice service URL must be a ws:// or wss:// URL, got '{}'", self.voice.url));
        }

        if self.voice.sample_rate == 0 {
            return Err(anyhow::anyhow!("Voice sample rate must be greater than 0"));
        }

        if !(0.0..=2.0).contains(&self.voice.temperature) {
            return Err(anyhow::anyhow!("Voice temperature must be between 0.0 and 2.0"));
        }

        if self.voice.outbound_queue == 0 {
            return Err(anyhow::anyhow!("Outbound audio queue must hold at least one chunk"));
        }

        Ok(())
    }

    /// Whether post-call extraction has a credential to work with.
    pub fn extraction_enabled(&self) -> bool {
        !self.extraction.api_key.trim().is_empty()
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
