//! # Call Session
//!
//! Per-call state: stream id, caller address, transcript and lifecycle phase. Event
//! dispatch is pure, it takes a decoded event and returns what (if anything) has to be
//! written to the other socket, so the relay logic is testable without live sockets.
//!
//! ## Session Lifecycle:
//! Created → UpstreamConnecting → Active → Closing → Terminated
//!
//! `Terminated` is final. Teardown is driven only by the downstream side.

use crate::call::transcript::{Speaker, Transcript};
use crate::error::{AppError, AppResult};
use crate::media::{MediaEvent, MediaOutbound};
use crate::voice::protocol::{VoiceEvent, VoiceOutbound};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Created,
    UpstreamConnecting,
    Active,
    Closing,
    Terminated,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Created => "created",
            SessionPhase::UpstreamConnecting => "upstream_connecting",
            SessionPhase::Active => "active",
            SessionPhase::Closing => "closing",
            SessionPhase::Terminated => "terminated",
        }
    }

    pub fn is_closing(&self) -> bool {
        matches!(self, SessionPhase::Closing | SessionPhase::Terminated)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayCounters {
    pub media_forwarded: u64,
    pub media_dropped: u64,
    pub audio_returned: u64,
}

#[derive(Debug)]
pub struct CallSession {
    call_id: String,
    caller_address: Option<String>,
    stream_sid: Option<String>,
    transcript: Transcript,
    phase: SessionPhase,
    counters: RelayCounters,
    pub created_at: DateTime<Utc>,
}

impl CallSession {
    pub fn new(call_id: impl Into<String>, caller_address: Option<String>) -> Self {
        Self {
            call_id: call_id.into(),
            caller_address,
            stream_sid: None,
            transcript: Transcript::new(),
            phase: SessionPhase::Created,
            counters: RelayCounters::default(),
            created_at: Utc::now(),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn caller_address(&self) -> Option<&str> {
        self.caller_address.as_deref()
    }

    /// Record the caller address if none is known yet. The first value sticks.
    pub fn set_caller_address(&mut self, address: String) -> bool {
        if self.caller_address.is_some() {
            return false;
        }
        self.caller_address = Some(address);
        true
    }

    pub fn stream_sid(&self) -> Option<&str> {
        self.stream_sid.as_deref()
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn counters(&self) -> RelayCounters {
        self.counters
    }

    pub fn begin_upstream_connect(&mut self) {
        if self.phase == SessionPhase::Created {
            self.phase = SessionPhase::UpstreamConnecting;
        }
    }

    pub fn mark_upstream_open(&mut self) {
        if matches!(self.phase, SessionPhase::Created | SessionPhase::UpstreamConnecting) {
            self.phase = SessionPhase::Active;
        }
    }

    /// Handle one event from the telephony peer.
    ///
    /// Returns the message to send upstream, if any. Media arriving while the upstream
    /// is not open is dropped, never queued. The first `start` sets the stream id and,
    /// when it carries one, the caller address. A repeated `start` is reported as
    /// [`AppError::DuplicateStreamStart`] and changes nothing.
    pub fn on_downstream_event(
        &mut self,
        event: MediaEvent,
        upstream_open: bool,
    ) -> AppResult<Option<VoiceOutbound>> {
        match event {
            MediaEvent::Start {
                stream_sid,
                caller_address,
            } => {
                if let Some(existing) = &self.stream_sid {
                    return Err(AppError::DuplicateStreamStart {
                        call_id: self.call_id.clone(),
                        stream_sid: existing.clone(),
                    });
                }
                if let Some(address) = caller_address {
                    self.set_caller_address(address);
                }
                info!(
                    call_id = %self.call_id,
                    stream_sid = %stream_sid,
                    caller = self.caller_address().unwrap_or("unknown"),
                    "Media stream started"
                );
                self.stream_sid = Some(stream_sid);
                Ok(None)
            }
            MediaEvent::Media { payload } => {
                if upstream_open && !self.phase.is_closing() {
                    self.counters.media_forwarded += 1;
                    Ok(Some(VoiceOutbound::Audio { chunk: payload }))
                } else {
                    self.counters.media_dropped += 1;
                    if self.counters.media_dropped == 1 {
                        debug!(call_id = %self.call_id, "Voice connection not open, dropping inbound audio");
                    }
                    Ok(None)
                }
            }
            MediaEvent::Other { kind } => {
                debug!(call_id = %self.call_id, event = %kind, "Ignoring media stream event");
                Ok(None)
            }
        }
    }

    /// Handle one event from the voice service.
    ///
    /// Returns the frame to send to the telephony peer, if any.
    pub fn on_upstream_event(&mut self, event: VoiceEvent) -> Option<MediaOutbound> {
        match event {
            VoiceEvent::Transcript { text } => {
                self.transcript.push(Speaker::User, &text);
                None
            }
            VoiceEvent::AssistantResponse { text } => {
                self.transcript.push(Speaker::Agent, &text);
                None
            }
            VoiceEvent::Audio { chunk } => match &self.stream_sid {
                Some(stream_sid) => {
                    self.counters.audio_returned += 1;
                    Some(MediaOutbound::new(stream_sid.clone(), chunk))
                }
                None => {
                    warn!(call_id = %self.call_id, "Voice audio arrived before the media stream started, dropping");
                    None
                }
            },
            VoiceEvent::Error { message } => {
                warn!(call_id = %self.call_id, error = %message, "Voice service reported an error");
                None
            }
            other => {
                if other.is_logged() {
                    info!(call_id = %self.call_id, event = %other.kind(), "Voice service event");
                } else {
                    debug!(call_id = %self.call_id, event = %other.kind(), "Voice service event");
                }
                None
            }
        }
    }

    /// Enter `Closing`. Returns false when the session is already closing or gone,
    /// which makes teardown run at most once.
    pub fn begin_close(&mut self) -> bool {
        if self.phase.is_closing() {
            return false;
        }
        self.phase = SessionPhase::Closing;
        true
    }

    /// Produce the cleaned transcript and enter `Terminated`.
    pub fn finish_close(&mut self) -> String {
        self.phase = SessionPhase::Terminated;
        self.transcript.cleaned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(sid: &str) -> MediaEvent {
        MediaEvent::Start {
            stream_sid: sid.to_string(),
            caller_address: None,
        }
    }

    fn media(payload: &str) -> MediaEvent {
        MediaEvent::Media { payload: payload.to_string() }
    }

    #[test]
    fn test_start_then_media_forwards_audio() {
        let mut session = CallSession::new("CA1", None);
        assert_eq!(session.on_downstream_event(start("SS1"), true).unwrap(), None);
        let out = session.on_downstream_event(media("abc"), true).unwrap();

        assert_eq!(out, Some(VoiceOutbound::Audio { chunk: "abc".to_string() }));
        assert_eq!(session.stream_sid(), Some("SS1"));
        assert_eq!(session.counters().media_forwarded, 1);
    }

    #[test]
    fn test_media_before_upstream_open_is_dropped() {
        let mut session = CallSession::new("CA1", None);
        session.begin_upstream_connect();
        assert_eq!(session.on_downstream_event(media("early"), false).unwrap(), None);
        assert_eq!(session.counters().media_dropped, 1);

        // nothing was held back for later delivery
        session.mark_upstream_open();
        let out = session.on_downstream_event(media("late"), true).unwrap();
        assert_eq!(out, Some(VoiceOutbound::Audio { chunk: "late".to_string() }));
        assert_eq!(session.counters().media_forwarded, 1);
    }

    #[test]
    fn test_duplicate_start_keeps_first_stream_id() {
        let mut session = CallSession::new("CA1", None);
        session.on_downstream_event(start("SS1"), false).unwrap();
        let err = session.on_downstream_event(start("SS2"), false).unwrap_err();

        assert!(matches!(err, AppError::DuplicateStreamStart { .. }));
        assert_eq!(session.stream_sid(), Some("SS1"));
    }

    #[test]
    fn test_start_records_caller_address_once() {
        let mut session = CallSession::new("CA1", None);
        let first = MediaEvent::Start {
            stream_sid: "SS1".to_string(),
            caller_address: Some("+15550001".to_string()),
        };
        let second = MediaEvent::Start {
            stream_sid: "SS2".to_string(),
            caller_address: Some("+15550002".to_string()),
        };

        session.on_downstream_event(first, false).unwrap();
        assert!(session.on_downstream_event(second, false).is_err());
        assert_eq!(session.caller_address(), Some("+15550001"));
    }

    #[test]
    fn test_unknown_downstream_event_is_ignored() {
        let mut session = CallSession::new("CA1", None);
        let out = session
            .on_downstream_event(MediaEvent::Other { kind: "mark".to_string() }, true)
            .unwrap();
        assert_eq!(out, None);
    }

    #[test]
    fn test_transcript_fragments_are_tagged() {
        let mut session = CallSession::new("CA1", None);
        session.on_upstream_event(VoiceEvent::Transcript { text: " hello ".to_string() });
        session.on_upstream_event(VoiceEvent::AssistantResponse { text: "Hi there".to_string() });

        let lines: Vec<String> = session.transcript().lines().iter().map(|l| l.to_string()).collect();
        assert_eq!(lines, vec!["User: hello", "Agent: Hi there"]);
    }

    #[test]
    fn test_upstream_audio_goes_downstream_with_stream_id() {
        let mut session = CallSession::new("CA1", None);
        session.on_downstream_event(start("SS1"), true).unwrap();
        let out = session.on_upstream_event(VoiceEvent::Audio { chunk: "xyz".to_string() });

        assert_eq!(out, Some(MediaOutbound::new("SS1", "xyz")));
        assert_eq!(session.counters().audio_returned, 1);
    }

    #[test]
    fn test_upstream_audio_without_stream_id_is_dropped() {
        let mut session = CallSession::new("CA1", None);
        assert_eq!(session.on_upstream_event(VoiceEvent::Audio { chunk: "xyz".to_string() }), None);
    }

    #[test]
    fn test_upstream_error_does_not_end_session() {
        let mut session = CallSession::new("CA1", None);
        session.mark_upstream_open();
        session.on_upstream_event(VoiceEvent::Error { message: "boom".to_string() });
        assert_eq!(session.phase(), SessionPhase::Active);
    }

    #[test]
    fn test_caller_address_is_set_once() {
        let mut session = CallSession::new("CA1", None);
        assert!(session.set_caller_address("+15550001".to_string()));
        assert!(!session.set_caller_address("+15550002".to_string()));
        assert_eq!(session.caller_address(), Some("+15550001"));
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut session = CallSession::new("CA1", None);
        assert_eq!(session.phase(), SessionPhase::Created);
        session.begin_upstream_connect();
        assert_eq!(session.phase(), SessionPhase::UpstreamConnecting);
        session.mark_upstream_open();
        assert_eq!(session.phase(), SessionPhase::Active);

        assert!(session.begin_close());
        assert!(!session.begin_close());
        session.on_upstream_event(VoiceEvent::Transcript { text: "bye".to_string() });
        assert_eq!(session.finish_close(), "User: bye");
        assert_eq!(session.phase(), SessionPhase::Terminated);

        // no way back out of Terminated
        session.mark_upstream_open();
        session.begin_upstream_connect();
        assert_eq!(session.phase(), SessionPhase::Terminated);
        assert!(!session.begin_close());
    }

    #[test]
    fn test_media_after_close_is_dropped() {
        let mut session = CallSession::new("CA1", None);
        session.mark_upstream_open();
        session.begin_close();
        assert_eq!(session.on_downstream_event(media("abc"), true).unwrap(), None);
    }
}
