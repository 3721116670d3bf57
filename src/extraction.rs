//! # Post-Call Extraction
//!
//! After a call ends the cleaned transcript is sent to an OpenAI-compatible
//! chat-completions endpoint that pulls out the caller's name and address. The request
//! asks for a schema-constrained JSON answer and forbids invented values. The call is
//! fire-and-forget: one attempt, failures are logged, nothing flows back into call
//! handling.

use crate::config::ExtractionConfig;
use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{error, info, warn};

const EXTRACTION_INSTRUCTION: &str = "Extract the caller's full name and street address from the \
phone call transcript below. Only use information that is literally present in the transcript. \
Never guess or invent values. If a field is not present, answer exactly \"not found\" for it.";

const NOT_FOUND: &str = "not found";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Found(String),
    NotFound,
}

impl FieldValue {
    fn from_answer(answer: &str) -> Self {
        let trimmed = answer.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(NOT_FOUND) {
            FieldValue::NotFound
        } else {
            FieldValue::Found(trimmed.to_string())
        }
    }

    pub fn as_option(&self) -> Option<&str> {
        match self {
            FieldValue::Found(value) => Some(value),
            FieldValue::NotFound => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractedFields {
    pub name: FieldValue,
    pub address: FieldValue,
}

#[derive(Debug, Deserialize)]
struct RawFields {
    name: String,
    address: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

pub struct ExtractionClient {
    http: reqwest::Client,
    config: ExtractionConfig,
}

impl ExtractionClient {
    pub fn new(config: ExtractionConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { http, config })
    }

    pub async fn extract(&self, transcript: &str) -> AppResult<ExtractedFields> {
        let body = build_request(&self.config.model, transcript);

        let response = self
            .http
            .post(&self.config.url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(AppError::Extraction(format!("HTTP {}: {}", status, detail)));
        }

        let completion: ChatCompletion = response.json().await?;
        parse_completion(completion)
    }
}

/// Chat-completions body with a strict two-field JSON schema.
fn build_request(model: &str, transcript: &str) -> serde_json::Value {
    json!({
        "model": model,
        "temperature": 0,
        "messages": [
            { "role": "system", "content": EXTRACTION_INSTRUCTION },
            { "role": "user", "content": transcript }
        ],
        "response_format": {
            "type": "json_schema",
            "json_schema": {
                "name": "caller_details",
                "strict": true,
                "schema": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "address": { "type": "string" }
                    },
                    "required": ["name", "address"],
                    "additionalProperties": false
                }
            }
        }
    })
}

fn parse_completion(completion: ChatCompletion) -> AppResult<ExtractedFields> {
    let message = completion
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message)
        .ok_or_else(|| AppError::Extraction("response has no choices".to_string()))?;

    if let Some(refusal) = message.refusal {
        return Err(AppError::Extraction(format!("model refused: {}", refusal)));
    }

    let content = message
        .content
        .ok_or_else(|| AppError::Extraction("response has no content".to_string()))?;
    parse_fields(&content)
}

fn parse_fields(content: &str) -> AppResult<ExtractedFields> {
    let raw: RawFields = serde_json::from_str(content)
        .map_err(|e| AppError::Extraction(format!("unexpected extraction payload: {}", e)))?;

    Ok(ExtractedFields {
        name: FieldValue::from_answer(&raw.name),
        address: FieldValue::from_answer(&raw.address),
    })
}

/// Run extraction for a finished call and log the outcome.
pub async fn run_post_call(client: &ExtractionClient, call_id: &str, caller: Option<&str>, transcript: &str) {
    if transcript.trim().is_empty() {
        info!(call_id = %call_id, "Empty transcript, skipping extraction");
        return;
    }

    match client.extract(transcript).await {
        Ok(fields) => info!(
            call_id = %call_id,
            caller = caller.unwrap_or("unknown"),
            name = fields.name.as_option().unwrap_or("<not found>"),
            address = fields.address.as_option().unwrap_or("<not found>"),
            "Post-call extraction finished"
        ),
        Err(AppError::Extraction(msg)) => {
            warn!(call_id = %call_id, error = %msg, "Post-call extraction failed")
        }
        Err(e) => error!(call_id = %call_id, error = %e, "Post-call extraction failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completion(content: &str) -> ChatCompletion {
        serde_json::from_value(json!({
            "choices": [{ "message": { "role": "assistant", "content": content } }]
        }))
        .unwrap()
    }

    #[test]
    fn test_request_body_is_schema_constrained() {
        let body = build_request("gpt-4o-mini", "User: my name is Ada");
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["messages"][1]["content"], "User: my name is Ada");
        assert_eq!(body["response_format"]["type"], "json_schema");

        let schema = &body["response_format"]["json_schema"]["schema"];
        assert_eq!(schema["required"], json!(["name", "address"]));
        assert_eq!(schema["additionalProperties"], false);
        assert!(body["messages"][0]["content"].as_str().unwrap().contains("Never guess"));
    }

    #[test]
    fn test_parse_found_fields() {
        let fields =
            parse_completion(completion(r#"{"name":"Ada Lovelace","address":" 12 Analytical Way "}"#)).unwrap();
        assert_eq!(fields.name, FieldValue::Found("Ada Lovelace".to_string()));
        assert_eq!(fields.address.as_option(), Some("12 Analytical Way"));
    }

    #[test]
    fn test_parse_not_found_markers() {
        let fields = parse_completion(completion(r#"{"name":"Not Found","address":""}"#)).unwrap();
        assert_eq!(fields.name, FieldValue::NotFound);
        assert_eq!(fields.address, FieldValue::NotFound);
    }

    #[test]
    fn test_parse_rejects_bad_payloads() {
        assert!(matches!(
            parse_completion(completion("Ada, 12 Analytical Way")),
            Err(AppError::Extraction(_))
        ));

        let empty: ChatCompletion = serde_json::from_value(json!({ "choices": [] })).unwrap();
        assert!(matches!(parse_completion(empty), Err(AppError::Extraction(_))));

        let refused: ChatCompletion = serde_json::from_value(json!({
            "choices": [{ "message": { "content": null, "refusal": "no" } }]
        }))
        .unwrap();
        assert!(matches!(parse_completion(refused), Err(AppError::Extraction(_))));
    }

    #[test]
    fn test_field_value_serialization() {
        let value = serde_json::to_value(FieldValue::Found("Ada".to_string())).unwrap();
        assert_eq!(value, json!({"status": "found", "value": "Ada"}));
        let value = serde_json::to_value(FieldValue::NotFound).unwrap();
        assert_eq!(value, json!({"status": "not_found"}));
    }
}
