pub mod incoming_call;

pub use incoming_call::*;
