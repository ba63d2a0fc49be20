use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::CallId;

/// Call lifecycle errors.
///
/// The first group crosses the wire inside registry replies and is therefore
/// serializable; the second group is produced client-side only and never
/// reaches the registry.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum CallError {
    /// A live call already exists for this chat (group) or peer pair (direct).
    /// Carries the existing id so the caller can offer "join instead".
    #[error("call already active: {call_id}")]
    AlreadyActive { call_id: CallId },

    /// No such call. Treated as "the call is already over".
    #[error("call not found")]
    NotFound,

    /// The call existed but has ended.
    #[error("call already closed")]
    Closed,

    /// Dropped at the registry boundary; never retried automatically.
    #[error("rate limited")]
    RateLimited,

    /// Camera/microphone acquisition failed or was denied. Local only.
    #[error("media acquisition failed: {reason}")]
    MediaAcquisitionFailed { reason: String },

    /// Offer/answer/ICE exchange failed beyond the restart budget. Local only.
    #[error("negotiation failed: {reason}")]
    NegotiationFailed { reason: String },

    /// The relay transport reported closed/failed. Fatal for group calls.
    #[error("relay transport failed: {reason}")]
    RelayTransportFailed { reason: String },
}

impl CallError {
    /// True for errors a client should treat as "reset to idle and move on"
    /// rather than surface as a failure.
    pub fn is_call_over(&self) -> bool {
        matches!(self, CallError::NotFound | CallError::Closed)
    }
}
