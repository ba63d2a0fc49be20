//! # cadenza-store
//!
//! Durable local session state for the call cores.  The store holds a single
//! "call I believe I am in" record that survives process restart, so a client
//! torn down mid-call can offer to rejoin.  The record is a single-slot JSON
//! file with a staleness bound checked on every load.

pub mod session;

mod error;

pub use error::StoreError;
pub use session::{PersistedSession, SessionStore};
