use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CallError;
use crate::types::{CallId, ChatId, MediaKind, StreamId, UserId};

/// Signaling payload exchanged between call participants.
///
/// The registry relays these verbatim; only the sending and receiving call
/// cores interpret the variant contents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SignalPayload {
    /// SDP offer
    Offer { sdp: String },
    /// SDP answer
    Answer { sdp: String },
    /// ICE candidate
    IceCandidate { candidate: String },
    /// Sender is leaving the negotiation
    Leave,
    /// Sender toggled its camera feed
    VideoMode { enabled: bool },
    /// Sender announces which relay stream id carries its published media
    StreamIdentityMap { stream_id: StreamId },
}

impl SignalPayload {
    /// Stable event name, used as the rate-limiter key component.
    pub fn kind_name(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::IceCandidate { .. } => "ice-candidate",
            SignalPayload::Leave => "leave",
            SignalPayload::VideoMode { .. } => "video-mode",
            SignalPayload::StreamIdentityMap { .. } => "stream-identity-map",
        }
    }
}

/// An immutable signaling message relayed through the registry.
///
/// `to = None` marks a group-broadcast signal: the registry forwards it to
/// every participant except the sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalEnvelope {
    pub call_id: CallId,
    pub from: UserId,
    pub to: Option<UserId>,
    pub payload: SignalPayload,
}

impl SignalEnvelope {
    pub fn is_broadcast(&self) -> bool {
        self.to.is_none()
    }
}

/// Roster entry as reported to joiners and in join/leave events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantInfo {
    pub user_id: UserId,
    pub user_name: String,
}

/// Why a call ended, broadcast with `CallEnded`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    Hangup,
    Declined,
    Timeout,
    Capacity,
    RelayFailure,
}

/// Commands a client sends to the registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum ClientCommand {
    /// `call:start`
    CallStart { chat_id: ChatId, callee: UserId, media_kind: MediaKind },
    /// `call:accept`
    CallAccept { call_id: CallId },
    /// `call:decline`
    CallDecline { call_id: CallId },
    /// `call:signal` -- relay a signaling envelope
    CallSignal { envelope: SignalEnvelope },
    /// `call:leave` / `group-call:leave`
    CallLeave { call_id: CallId },
    /// `group-call:start`
    GroupCallStart { chat_id: ChatId, media_kind: MediaKind },
    /// `group-call:join`
    GroupCallJoin { call_id: CallId },
    /// `group-call:sfu-stream` -- announce own published stream id
    SfuStream { call_id: CallId, stream_id: StreamId },
}

impl ClientCommand {
    /// Stable event name, used as the rate-limiter key component.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ClientCommand::CallStart { .. } => "call:start",
            ClientCommand::CallAccept { .. } => "call:accept",
            ClientCommand::CallDecline { .. } => "call:decline",
            ClientCommand::CallSignal { .. } => "call:signal",
            ClientCommand::CallLeave { .. } => "call:leave",
            ClientCommand::GroupCallStart { .. } => "group-call:start",
            ClientCommand::GroupCallJoin { .. } => "group-call:join",
            ClientCommand::SfuStream { .. } => "group-call:sfu-stream",
        }
    }
}

/// A client frame: command plus a client-chosen sequence number echoed in the
/// reply, so several commands may be in flight on one socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientFrame {
    pub seq: u64,
    #[serde(flatten)]
    pub command: ClientCommand,
}

/// Successful command replies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "reply", rename_all = "kebab-case")]
pub enum ReplyBody {
    CallStarted { call_id: CallId },
    Joined { call_id: CallId, participants: Vec<ParticipantInfo> },
    Left { call_id: CallId, call_ended: bool },
    Ack,
}

/// Registry events fanned out to participants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// `call:incoming` (server -> callee)
    CallIncoming {
        call_id: CallId,
        chat_id: ChatId,
        initiator: ParticipantInfo,
        media_kind: MediaKind,
        created_at: DateTime<Utc>,
    },
    /// `call:participant_joined` / `group-call:participant-joined`
    ParticipantJoined { call_id: CallId, user_id: UserId, user_name: String },
    /// `call:participant_left` / `group-call:participant-left`
    ParticipantLeft { call_id: CallId, user_id: UserId, call_ended: bool },
    /// `call:ended` / `group-call:ended`
    CallEnded { call_id: CallId, reason: EndReason },
    /// Relayed signaling envelope
    Signal { envelope: SignalEnvelope },
    /// Server-relayed form of `group-call:sfu-stream`
    SfuStreamMapped { call_id: CallId, user_id: UserId, stream_id: StreamId },
}

/// A server frame: either a correlated command reply or a fan-out event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    Reply {
        seq: u64,
        result: Result<ReplyBody, CallError>,
    },
    Event {
        #[serde(flatten)]
        event: ServerEvent,
    },
}

impl ClientFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}

impl ServerFrame {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }
}
