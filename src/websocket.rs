//! # Media Stream WebSocket Handler
//!
//! The telephony peer connects to `/media-stream?callSid=...` once the call has been
//! answered. Each connection is one actor and owns one call:
//!
//! 1. **Connection**: the call session is looked up (or created) in the registry and
//!    the voice service connection is opened in the background
//! 2. **Streaming**: `media` frames are relayed upstream while the voice connection is
//!    open and dropped otherwise; voice frames are fed back into the same actor
//! 3. **Close**: the session is torn down, the cleaned transcript goes to post-call
//!    extraction
//!
//! Frames from both sockets are handled one at a time on the actor's context, so a
//! call's state is only ever touched by one handler at a time.

use crate::call::SharedSession;
use crate::error::AppError;
use crate::extraction;
use crate::media;
use crate::state::AppState;
use crate::voice::protocol::{self as voice_protocol, VoiceOutbound};
use crate::voice::{UpstreamSignal, VoiceConnection};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct MediaStreamQuery {
    #[serde(rename = "callSid")]
    pub call_sid: Option<String>,
}

/// Call id from the connect URL, or a fresh UUID when the peer did not send one.
pub fn resolve_call_id(call_sid: Option<String>) -> String {
    call_sid
        .map(|sid| sid.trim().to_string())
        .filter(|sid| !sid.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// WebSocket actor bridging one telephony media stream to one voice service connection.
pub struct MediaStreamSocket {
    call_id: String,

    session: SharedSession,

    state: AppState,

    /// Set once the voice service connection is established; its open flag is
    /// independent of this socket
    upstream: Option<VoiceConnection>,

    torn_down: bool,
}

impl MediaStreamSocket {
    pub fn new(call_id: String, state: AppState) -> Self {
        let session = state.registry.on_create(&call_id, None);
        Self {
            call_id,
            session,
            state,
            upstream: None,
            torn_down: false,
        }
    }

    fn upstream_open(&self) -> bool {
        self.upstream.as_ref().is_some_and(|conn| conn.is_open())
    }

    /// Open the voice service connection without blocking the media stream.
    fn connect_upstream(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        self.session.lock().begin_upstream_connect();

        let connect = VoiceConnection::connect(self.call_id.clone(), self.state.config.voice.clone());
        ctx.spawn(connect.into_actor(self).map(|result, act, ctx| match result {
            Ok((conn, signals)) => {
                act.session.lock().mark_upstream_open();
                act.state.registry.attach_upstream(&act.session, conn.clone());
                act.upstream = Some(conn);
                ctx.add_stream(ReceiverStream::new(signals));
            }
            Err(e) => {
                act.state.metrics.record_upstream_failure();
                error!(call_id = %act.call_id, error = %e, "Voice service connection failed, caller audio will be dropped");
            }
        }));
    }

    /// Handle one text frame from the telephony peer.
    fn handle_media_frame(&mut self, text: &str) {
        let event = match media::decode_event(text) {
            Ok(event) => event,
            Err(e) => {
                self.log_decode_error("media stream", &e);
                return;
            }
        };

        let upstream_open = self.upstream_open();
        let outcome = self.session.lock().on_downstream_event(event, upstream_open);

        match outcome {
            Ok(Some(VoiceOutbound::Audio { chunk })) => {
                if let Some(conn) = &self.upstream {
                    if let Err(e) = conn.send_audio(chunk) {
                        debug!(call_id = %self.call_id, error = %e, "Audio chunk not forwarded");
                    }
                }
            }
            Ok(Some(VoiceOutbound::Start { .. })) | Ok(None) => {}
            Err(e @ AppError::DuplicateStreamStart { .. }) => {
                warn!(call_id = %self.call_id, "{}, ignoring", e);
            }
            Err(e) => {
                warn!(call_id = %self.call_id, error = %e, "Media stream event not handled");
            }
        }
    }

    /// Handle one text frame from the voice service.
    fn handle_voice_frame(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let event = match voice_protocol::decode_event(text) {
            Ok(event) => event,
            Err(e) => {
                self.log_decode_error("voice service", &e);
                return;
            }
        };

        let outbound = self.session.lock().on_upstream_event(event);
        if let Some(frame) = outbound {
            match frame.to_json() {
                Ok(json) => ctx.text(json),
                Err(e) => error!(call_id = %self.call_id, error = %e, "Could not encode media frame"),
            }
        }
    }

    fn log_decode_error(&self, source: &str, err: &AppError) {
        self.state.metrics.record_decode_error();
        match err {
            AppError::Decode { message, raw } => {
                warn!(call_id = %self.call_id, source, error = %message, raw = %raw, "Discarding malformed frame");
            }
            other => warn!(call_id = %self.call_id, source, error = %other, "Discarding frame"),
        }
    }

    /// The single teardown path, driven by the media stream closing.
    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        let cleaned = match self.state.registry.teardown(&self.session, self.upstream.as_ref()) {
            Some(cleaned) => cleaned,
            None => return,
        };
        self.state.metrics.record_call_completed();

        let (caller, stream_sid, counters, lines, duration) = {
            let session = self.session.lock();
            if session.transcript().is_empty() {
                debug!(call_id = %self.call_id, "No transcript captured for this call");
            }
            (
                session.caller_address().map(str::to_string),
                session.stream_sid().map(str::to_string),
                session.counters(),
                session.transcript().len(),
                chrono::Utc::now() - session.created_at,
            )
        };
        info!(
            call_id = %self.call_id,
            stream_sid = stream_sid.as_deref().unwrap_or("none"),
            duration_secs = duration.num_seconds(),
            transcript_lines = lines,
            media_forwarded = counters.media_forwarded,
            media_dropped = counters.media_dropped,
            audio_returned = counters.audio_returned,
            "Call finished"
        );
        debug!(call_id = %self.call_id, transcript = %cleaned, "Cleaned transcript");

        if let Some(extractor) = self.state.extractor.clone() {
            let call_id = self.call_id.clone();
            tokio::spawn(async move {
                extraction::run_post_call(&extractor, &call_id, caller.as_deref(), &cleaned).await;
            });
        }
    }
}

impl Actor for MediaStreamSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(call_id = %self.call_id, "Media stream connected");
        self.state.metrics.record_call_started();
        self.connect_upstream(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(call_id = %self.call_id, "Media stream closed");
        self.teardown();
    }
}

/// Frames from the telephony peer.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for MediaStreamSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => self.handle_media_frame(&text),
            Ok(ws::Message::Binary(data)) => {
                debug!(call_id = %self.call_id, bytes = data.len(), "Ignoring binary frame on media stream");
            }
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(call_id = %self.call_id, reason = ?reason, "Media stream close frame");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(call_id = %self.call_id, "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(call_id = %self.call_id, error = %err, "Media stream protocol error");
                ctx.stop();
            }
        }
    }
}

/// Signals from the voice service connection.
impl StreamHandler<UpstreamSignal> for MediaStreamSocket {
    fn handle(&mut self, signal: UpstreamSignal, ctx: &mut Self::Context) {
        match signal {
            UpstreamSignal::Frame(text) => self.handle_voice_frame(&text, ctx),
            UpstreamSignal::Closed { reason } => {
                // the call carries on; caller audio is dropped from here on
                warn!(call_id = %self.call_id, reason = %reason, "Voice service connection closed");
            }
        }
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!(call_id = %self.call_id, "Voice signal stream finished");
    }
}

/// WebSocket endpoint handler for `/media-stream`.
pub async fn media_stream(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<MediaStreamQuery>,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    if let Err(e) = ws::handshake(&req) {
        warn!(peer = ?req.connection_info().peer_addr(), error = %e, "Rejected media stream handshake");
        return Err(e.into());
    }

    let call_id = resolve_call_id(query.into_inner().call_sid);
    debug!(call_id = %call_id, "Upgrading media stream connection");

    ws::start(MediaStreamSocket::new(call_id, state.get_ref().clone()), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::test as actix_test;
    use actix_web::App;

    fn test_state() -> AppState {
        let mut config = AppConfig::default();
        config.voice.api_key = "test-key".to_string();
        AppState::new(config).unwrap()
    }

    #[test]
    fn test_resolve_call_id() {
        assert_eq!(resolve_call_id(Some("CA123".to_string())), "CA123");
        assert_eq!(resolve_call_id(Some(" CA123 ".to_string())), "CA123");

        let generated = resolve_call_id(None);
        assert!(Uuid::parse_str(&generated).is_ok());
        let blank = resolve_call_id(Some("  ".to_string()));
        assert!(Uuid::parse_str(&blank).is_ok());
        assert_ne!(generated, blank);
    }

    #[test]
    fn test_new_socket_reuses_registered_session() {
        let state = test_state();
        let registered = state.registry.on_create("CA1", Some("+15550001".to_string()));
        let socket = MediaStreamSocket::new("CA1".to_string(), state.clone());

        assert!(std::sync::Arc::ptr_eq(&registered, &socket.session));
        assert_eq!(state.registry.len(), 1);
        assert!(!socket.upstream_open());
    }

    #[test]
    fn test_teardown_is_idempotent() {
        let state = test_state();
        let mut socket = MediaStreamSocket::new("CA1".to_string(), state.clone());
        socket.handle_media_frame(r#"{"event":"start","start":{"streamSid":"SS1"}}"#);

        socket.teardown();
        socket.teardown();

        assert!(!state.registry.contains("CA1"));
        assert_eq!(state.metrics.snapshot().calls_completed, 1);
    }

    #[test]
    fn test_caller_address_arrives_with_stream_start() {
        let state = test_state();
        let mut socket = MediaStreamSocket::new("CA1".to_string(), state.clone());
        assert_eq!(socket.session.lock().caller_address(), None);

        socket.handle_media_frame(
            r#"{"event":"start","start":{"streamSid":"SS1","customParameters":{"callerAddress":"+15550001"}}}"#,
        );

        let session = state.registry.get("CA1").unwrap();
        assert_eq!(session.lock().caller_address(), Some("+15550001"));
        assert_eq!(state.registry.len(), 1);
    }

    #[test]
    fn test_media_without_upstream_is_dropped() {
        let state = test_state();
        let mut socket = MediaStreamSocket::new("CA1".to_string(), state.clone());
        socket.handle_media_frame(r#"{"event":"start","start":{"streamSid":"SS1"}}"#);
        socket.handle_media_frame(r#"{"event":"media","media":{"payload":"abc"}}"#);

        let counters = socket.session.lock().counters();
        assert_eq!(counters.media_dropped, 1);
        assert_eq!(counters.media_forwarded, 0);
        assert_eq!(socket.session.lock().stream_sid(), Some("SS1"));
    }

    #[tokio::test]
    async fn test_media_with_open_upstream_is_forwarded() {
        let state = test_state();
        let mut socket = MediaStreamSocket::new("CA1".to_string(), state.clone());
        let (conn, mut rx) = VoiceConnection::detached("CA1", 4);
        socket.session.lock().mark_upstream_open();
        socket.upstream = Some(conn);

        socket.handle_media_frame(r#"{"event":"start","start":{"streamSid":"SS1"}}"#);
        socket.handle_media_frame(r#"{"event":"media","media":{"payload":"abc"}}"#);

        match rx.recv().await {
            Some(crate::voice::client::Outbound::Audio(chunk)) => assert_eq!(chunk, "abc"),
            other => panic!("unexpected outbound message: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frames_are_counted_not_fatal() {
        let state = test_state();
        let mut socket = MediaStreamSocket::new("CA1".to_string(), state.clone());
        socket.handle_media_frame("{oops");
        socket.handle_media_frame(r#"{"event":"start","start":{"streamSid":"SS1"}}"#);

        assert_eq!(state.metrics.snapshot().decode_errors, 1);
        assert_eq!(socket.session.lock().stream_sid(), Some("SS1"));
    }

    #[actix_web::test]
    async fn test_plain_http_request_is_rejected() {
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(test_state()))
                .route("/media-stream", web::get().to(media_stream)),
        )
        .await;

        let req = actix_test::TestRequest::get().uri("/media-stream?callSid=CA1").to_request();
        let resp = actix_test::call_service(&app, req).await;
        assert!(resp.status().is_client_error());
    }
}
