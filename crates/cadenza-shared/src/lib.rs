//! # cadenza-shared
//!
//! Types shared between the call registry server and the client call cores:
//! identifiers, the signaling wire protocol, the call error taxonomy, and the
//! model constants (timeouts, windows, thresholds) both sides must agree on.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::CallError;
