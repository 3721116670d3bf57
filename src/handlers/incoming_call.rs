//! Call-setup webhook.
//!
//! The telephony provider calls this when a call comes in. We answer with markup telling
//! the provider to open a media stream back to `/media-stream` for that call. Nothing is
//! registered here: the session is created when the media stream connects, and the
//! caller address rides along as a custom stream parameter echoed back in `start`.

use crate::error::AppResult;
use crate::media::CALLER_PARAMETER;
use crate::state::AppState;
use crate::websocket::resolve_call_id;
use actix_web::{http::header::ContentType, web, HttpRequest, HttpResponse};
use serde::Deserialize;
use tracing::info;

/// Fields of the webhook payload we care about; the provider sends many more.
#[derive(Debug, Deserialize)]
pub struct IncomingCall {
    #[serde(rename = "CallSid")]
    pub call_sid: Option<String>,
    #[serde(rename = "From")]
    pub from: Option<String>,
}

/// POST /incoming-call (form encoded)
pub async fn incoming_call_form(
    req: HttpRequest,
    form: web::Form<IncomingCall>,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    answer_call(&req, form.into_inner(), &state)
}

/// GET /incoming-call (query string)
pub async fn incoming_call_query(
    req: HttpRequest,
    query: web::Query<IncomingCall>,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    answer_call(&req, query.into_inner(), &state)
}

fn answer_call(req: &HttpRequest, call: IncomingCall, state: &AppState) -> AppResult<HttpResponse> {
    let call_id = resolve_call_id(call.call_sid.as_deref().map(sanitize_call_id));
    let caller = call.from.map(|from| from.trim().to_string()).filter(|from| !from.is_empty());

    let host = match &state.config.server.public_host {
        Some(host) => host.clone(),
        None => req.connection_info().host().to_string(),
    };

    info!(call_id = %call_id, caller = caller.as_deref().unwrap_or("unknown"), "Incoming call");

    let stream_url = format!("wss://{}/media-stream?callSid={}", host, call_id);
    Ok(HttpResponse::Ok()
        .content_type(ContentType::xml())
        .body(connect_markup(&stream_url, caller.as_deref())))
}

/// Keep only characters that are safe inside both a query string and an XML attribute.
fn sanitize_call_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

fn connect_markup(stream_url: &str, caller: Option<&str>) -> String {
    let stream = match caller {
        Some(caller) => format!(
            "<Stream url=\"{}\"><Parameter name=\"{}\" value=\"{}\" /></Stream>",
            xml_escape(stream_url),
            CALLER_PARAMETER,
            xml_escape(caller)
        ),
        None => format!("<Stream url=\"{}\" />", xml_escape(stream_url)),
    };
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Connect>{}</Connect></Response>",
        stream
    )
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
