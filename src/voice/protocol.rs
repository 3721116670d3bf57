//! # Voice Service Wire Protocol
//!
//! JSON text frames exchanged with the voice-AI streaming service.
//!
//! ## Outbound (relay → service):
//! 1. exactly one `{"type": "start", "config": {...}}` right after connecting
//! 2. any number of `{"type": "audio", "chunk": "<payload>"}`
//!
//! ## Inbound (service → relay):
//! - `transcript` / `assistant_response` carry `text`
//! - `audio` carries `chunk`
//! - `error` carries `message`
//! - anything else is diagnostic only

use crate::config::VoiceConfig;
use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};

/// Inbound kinds worth an info-level log line. Purely diagnostic: nothing branches on it.
pub const LOG_EVENT_TYPES: &[&str] = &[
    "error",
    "session_started",
    "session_ended",
    "speech_started",
    "speech_stopped",
    "response_done",
    "rate_limits",
];

/// Per-call session configuration sent once in the `start` message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoiceSessionConfig {
    pub audio_encoding: String,
    pub sample_rate: u32,
    pub voice: String,
    pub system_prompt: String,
    pub temperature: f64,
}

impl VoiceSessionConfig {
    pub fn from_config(config: &VoiceConfig) -> Self {
        Self {
            audio_encoding: config.audio_encoding.clone(),
            sample_rate: config.sample_rate,
            voice: config.voice.clone(),
            system_prompt: config.system_prompt.clone(),
            temperature: config.temperature,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VoiceOutbound {
    Start { config: VoiceSessionConfig },
    Audio { chunk: String },
}

impl VoiceOutbound {
    pub fn to_json(&self) -> AppResult<String> {
        serde_json::to_string(self).map_err(|e| AppError::Internal(format!("encode voice message: {}", e)))
    }
}

/// Decoded inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    Transcript { text: String },
    AssistantResponse { text: String },
    Audio { chunk: String },
    Error { message: String },
    Other { kind: String },
}

impl VoiceEvent {
    pub fn kind(&self) -> &str {
        match self {
            VoiceEvent::Transcript { .. } => "transcript",
            VoiceEvent::AssistantResponse { .. } => "assistant_response",
            VoiceEvent::Audio { .. } => "audio",
            VoiceEvent::Error { .. } => "error",
            VoiceEvent::Other { kind } => kind,
        }
    }

    pub fn is_logged(&self) -> bool {
        LOG_EVENT_TYPES.contains(&self.kind())
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    chunk: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

/// Decode one inbound text frame.
///
/// Fails on invalid JSON, a missing `type`, or an `audio` frame without a `chunk`.
/// Text events without `text` decode to an empty fragment.
pub fn decode_event(raw: &str) -> AppResult<VoiceEvent> {
    let envelope: Envelope = serde_json::from_str(raw).map_err(|e| AppError::decode(e, raw))?;

    let event = match envelope.kind.as_str() {
        "transcript" => VoiceEvent::Transcript {
            text: envelope.text.unwrap_or_default(),
        },
        "assistant_response" => VoiceEvent::AssistantResponse {
            text: envelope.text.unwrap_or_default(),
        },
        "audio" => VoiceEvent::Audio {
            chunk: envelope
                .chunk
                .ok_or_else(|| AppError::decode("audio event without chunk", raw))?,
        },
        "error" => VoiceEvent::Error {
            message: envelope
                .message
                .or_else(|| envelope.error.map(|e| e.to_string()))
                .unwrap_or_else(|| "unspecified error".to_string()),
        },
        _ => VoiceEvent::Other { kind: envelope.kind },
    };

    Ok(event)
}
