//! # Telephony Media Stream Protocol
//!
//! JSON text frames exchanged with the telephony peer over `/media-stream`.
//!
//! ## Inbound:
//! - `{"event": "start", "start": {"streamSid": "...", "customParameters": {...}}}`
//!   announces the media stream; custom parameters are the ones set in the connect markup
//! - `{"event": "media", "media": {"payload": "..."}}` carries one audio frame
//! - `connected`, `mark`, `stop`, ... are logged and ignored
//!
//! ## Outbound:
//! - `{"event": "media", "streamSid": "...", "media": {"payload": "..."}}`

use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Custom stream parameter carrying the caller address from the webhook to the stream.
pub const CALLER_PARAMETER: &str = "callerAddress";

#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    Start {
        stream_sid: String,
        caller_address: Option<String>,
    },
    Media { payload: String },
    Other { kind: String },
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(rename = "streamSid", default)]
    stream_sid: Option<String>,
    #[serde(default)]
    start: Option<StartBody>,
    #[serde(default)]
    media: Option<MediaBody>,
}

#[derive(Debug, Deserialize)]
struct StartBody {
    #[serde(rename = "streamSid", default)]
    stream_sid: Option<String>,
    #[serde(rename = "customParameters", default)]
    custom_parameters: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct MediaBody {
    payload: String,
}

/// Decode one inbound frame from the telephony peer.
///
/// The stream id of a `start` event is read from `start.streamSid`, falling back to the
/// top-level `streamSid`. A blank caller parameter counts as absent.
pub fn decode_event(raw: &str) -> AppResult<MediaEvent> {
    let envelope: Envelope = serde_json::from_str(raw).map_err(|e| AppError::decode(e, raw))?;

    let event = match envelope.event.as_str() {
        "start" => {
            let (start_sid, caller_address) = match envelope.start {
                Some(mut start) => {
                    let caller = start
                        .custom_parameters
                        .remove(CALLER_PARAMETER)
                        .and_then(|value| value.as_str().map(|s| s.trim().to_string()))
                        .filter(|s| !s.is_empty());
                    (start.stream_sid, caller)
                }
                None => (None, None),
            };
            let stream_sid = start_sid
                .or(envelope.stream_sid)
                .ok_or_else(|| AppError::decode("start event without streamSid", raw))?;
            MediaEvent::Start {
                stream_sid,
                caller_address,
            }
        }
        "media" => {
            let media = envelope
                .media
                .ok_or_else(|| AppError::decode("media event without media body", raw))?;
            MediaEvent::Media { payload: media.payload }
        }
        _ => MediaEvent::Other { kind: envelope.event },
    };

    Ok(event)
}

/// Audio frame sent back to the telephony peer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaOutbound {
    event: &'static str,
    #[serde(rename = "streamSid")]
    pub stream_sid: String,
    media: MediaPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct MediaPayload {
    payload: String,
}

impl MediaOutbound {
    pub fn new(stream_sid: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            event: "media",
            stream_sid: stream_sid.into(),
            media: MediaPayload { payload: payload.into() },
        }
    }

    pub fn to_json(&self) -> AppResult<String> {
        serde_json::to_string(self).map_err(|e| AppError::Internal(format!("encode media message: {}", e)))
    }
}
