//! # Voice Service
//!
//! Upstream side of a call: the wire protocol spoken with the voice-AI streaming
//! service and the per-call WebSocket client.

pub mod client;     // Connection handle and socket loops
pub mod protocol;   // Frame encoding/decoding

pub use client::{UpstreamSignal, VoiceConnection};
