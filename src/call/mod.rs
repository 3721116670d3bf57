//! # Call Handling
//!
//! Everything that belongs to one phone call independent of the sockets carrying it:
//! the per-call state machine, the registry of live calls, and the transcript.

pub mod registry;     // Live calls keyed by call id
pub mod session;      // Per-call state and event dispatch
pub mod transcript;   // Speaker-tagged lines and cleaning

pub use registry::{SessionRegistry, SharedSession};
