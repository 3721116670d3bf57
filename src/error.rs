//! # Error Handling
//!
//! One error enum for the whole relay. Most variants never leave the component that
//! produced them: per-message decode failures, upstream socket trouble and extraction
//! failures are logged where they happen and the call keeps running. Only the webhook
//! handler turns an `AppError` into an HTTP response.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// A socket frame could not be decoded into a protocol event.
    /// Carries the parser message and the raw frame for logging.
    Decode { message: String, raw: String },

    /// The peer sent a second `start` event for a session that already has a stream id
    DuplicateStreamStart { call_id: String, stream_sid: String },

    /// The voice service connection failed or is not open
    Upstream(String),

    /// The post-call extraction request failed
    Extraction(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::Decode { message, .. } => write!(f, "Decode error: {}", message),
            AppError::DuplicateStreamStart { call_id, stream_sid } => write!(
                f,
                "Duplicate stream start for call {} (stream {} already set)",
                call_id, stream_sid
            ),
            AppError::Upstream(msg) => write!(f, "Voice service error: {}", msg),
            AppError::Extraction(msg) => write!(f, "Extraction error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Build a decode error that keeps the offending frame around.
    pub fn decode(err: impl fmt::Display, raw: &str) -> Self {
        AppError::Decode {
            message: err.to_string(),
            raw: raw.to_string(),
        }
    }
}

/// JSON error body:
/// ```json
/// { "error": { "type": "bad_request", "message": "...", "timestamp": "..." } }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type) = match self {
            AppError::Decode { .. } => (actix_web::http::StatusCode::BAD_REQUEST, "bad_request"),
            AppError::Upstream(_) | AppError::Extraction(_) => {
                (actix_web::http::StatusCode::BAD_GATEWAY, "upstream_error")
            }
            AppError::Internal(_) | AppError::DuplicateStreamStart { .. } => {
                (actix_web::http::StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": self.to_string(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Extraction(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
