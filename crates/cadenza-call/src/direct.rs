//! One-to-one call state machine.
//!
//! `idle -> outgoing|incoming -> active -> idle`, with decline/cancel/timeout
//! short-circuits back to idle.  The machine is sans-IO: every input returns
//! the list of [`CallAction`]s the embedder must execute, in order.  Media
//! acquisition and negotiation run as external async tasks whose completions
//! re-enter the machine; an acquisition generation counter lets the machine
//! discard completions that arrive after the call moved on.

use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use cadenza_shared::constants::{MAX_ICE_RESTARTS, RECONNECT_GRACE_MS};
use cadenza_shared::error::CallError;
use cadenza_shared::protocol::{ClientCommand, EndReason, SignalEnvelope, SignalPayload};
use cadenza_shared::types::{CallId, ChatId, ConnectionState, MediaKind, UserId};
use cadenza_store::PersistedSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectCallState {
    Idle,
    Outgoing,
    Incoming,
    Active,
}

/// Why the machine returned to idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEndCause {
    /// Local hangup or cancel.
    Hangup,
    /// Local decline of an incoming call.
    Declined,
    /// The peer sent `Leave` or the registry reported the participant gone.
    RemoteLeft,
    /// The registry ended the call.
    Registry(EndReason),
    /// Ringing expired unanswered.
    Timeout,
    /// Unrecoverable local failure.
    Error(CallError),
}

/// Instructions for the embedder, executed in list order.
#[derive(Debug, Clone, PartialEq)]
pub enum CallAction {
    /// Send a command frame to the registry.
    SendCommand(ClientCommand),
    /// Relay a signaling envelope to the peer.
    SendSignal(SignalEnvelope),
    /// Start acquiring camera/microphone as an async task tagged with this
    /// generation.
    AcquireMedia { generation: u64, media_kind: MediaKind },
    /// Hard-stop and release all acquired media tracks.
    ReleaseMedia,
    /// A completed acquisition is stale; stop its tracks immediately.
    DiscardStaleMedia { generation: u64 },
    StartRinging,
    StopRinging,
    /// Ask the native stack for an SDP offer.
    CreateOffer { ice_restart: bool },
    /// Ask the native stack for an SDP answer.
    CreateAnswer,
    ApplyRemoteOffer { sdp: String },
    ApplyRemoteAnswer { sdp: String },
    AddIceCandidate { candidate: String },
    /// The peer toggled its camera.
    RemoteVideoMode { enabled: bool },
    StartReconnectTimer { delay: Duration },
    SaveSession(PersistedSession),
    ClearSession,
    /// Terminal notification: the machine is idle again.
    Ended { cause: CallEndCause },
}

struct CallContext {
    call_id: Option<CallId>,
    chat_id: ChatId,
    peer: UserId,
    media_kind: MediaKind,
    media_ready: bool,
    peer_joined: bool,
    /// We placed the call; the initiator sends the initial offer.
    is_initiator: bool,
    /// We created the initial offer, so ICE restarts are ours to drive.
    is_offerer: bool,
    remote_description_set: bool,
    /// An offer that arrived before local media was ready.
    pending_remote_offer: Option<String>,
    /// Candidates that arrived before the remote description was set,
    /// in arrival order.
    queued_candidates: Vec<String>,
    restarts_used: u32,
    awaiting_reconnect: bool,
}

/// Sans-IO one-to-one call core.
pub struct DirectCall {
    local_user: UserId,
    state: DirectCallState,
    call: Option<CallContext>,
    media_generation: u64,
}

impl DirectCall {
    pub fn new(local_user: UserId) -> Self {
        Self { local_user, state: DirectCallState::Idle, call: None, media_generation: 0 }
    }

    pub fn state(&self) -> DirectCallState {
        self.state
    }

    pub fn call_id(&self) -> Option<CallId> {
        self.call.as_ref().and_then(|c| c.call_id)
    }

    // -- entry points -------------------------------------------------------

    /// Start calling `peer`.  Valid from `Idle` only.  Media is acquired
    /// eagerly so negotiation can start the instant the peer appears.
    pub fn start_call(
        &mut self,
        chat_id: ChatId,
        peer: UserId,
        media_kind: MediaKind,
    ) -> Vec<CallAction> {
        if self.state != DirectCallState::Idle {
            warn!(state = ?self.state, "start_call ignored outside idle");
            return vec![];
        }

        self.state = DirectCallState::Outgoing;
        self.media_generation += 1;
        self.call = Some(CallContext {
            call_id: None,
            chat_id,
            peer,
            media_kind,
            media_ready: false,
            peer_joined: false,
            is_initiator: true,
            is_offerer: false,
            remote_description_set: false,
            pending_remote_offer: None,
            queued_candidates: Vec::new(),
            restarts_used: 0,
            awaiting_reconnect: false,
        });

        info!(peer = %peer.short(), ?media_kind, "starting direct call");

        vec![
            CallAction::AcquireMedia { generation: self.media_generation, media_kind },
            CallAction::SendCommand(ClientCommand::CallStart {
                chat_id,
                callee: peer,
                media_kind,
            }),
        ]
    }

    /// `call:incoming` arrived.  Ringing starts; media is deferred until
    /// accept so no camera light turns on before consent.
    pub fn on_incoming(
        &mut self,
        call_id: CallId,
        chat_id: ChatId,
        initiator: UserId,
        media_kind: MediaKind,
    ) -> Vec<CallAction> {
        if self.state != DirectCallState::Idle {
            // Already busy; the registry's pair invariant makes this a
            // different caller. Let it ring out remotely.
            debug!(call = %call_id.short(), "ignoring incoming call while busy");
            return vec![];
        }

        self.state = DirectCallState::Incoming;
        self.call = Some(CallContext {
            call_id: Some(call_id),
            chat_id,
            peer: initiator,
            media_kind,
            media_ready: false,
            peer_joined: true,
            is_initiator: false,
            is_offerer: false,
            remote_description_set: false,
            pending_remote_offer: None,
            queued_candidates: Vec::new(),
            restarts_used: 0,
            awaiting_reconnect: false,
        });

        info!(call = %call_id.short(), from = %initiator.short(), "incoming call");
        vec![CallAction::StartRinging]
    }

    /// Accept the ringing call.
    pub fn accept(&mut self) -> Vec<CallAction> {
        if self.state != DirectCallState::Incoming {
            warn!(state = ?self.state, "accept ignored");
            return vec![];
        }
        let Some(call) = self.call.as_ref() else { return vec![] };
        let Some(call_id) = call.call_id else { return vec![] };
        let media_kind = call.media_kind;
        let chat_id = call.chat_id;

        self.state = DirectCallState::Active;
        self.media_generation += 1;

        vec![
            CallAction::StopRinging,
            CallAction::AcquireMedia { generation: self.media_generation, media_kind },
            CallAction::SendCommand(ClientCommand::CallAccept { call_id }),
            CallAction::SaveSession(PersistedSession {
                call_id,
                chat_id,
                media_kind,
                is_group: false,
                started_at: Utc::now(),
            }),
        ]
    }

    /// Decline the ringing call.  Synchronously invalidates any in-flight
    /// acquisition (there should be none) and returns to idle.
    pub fn decline(&mut self) -> Vec<CallAction> {
        if self.state != DirectCallState::Incoming {
            warn!(state = ?self.state, "decline ignored");
            return vec![];
        }
        let call_id = self.call.as_ref().and_then(|c| c.call_id);

        let mut actions = vec![CallAction::StopRinging];
        if let Some(call_id) = call_id {
            actions.push(CallAction::SendCommand(ClientCommand::CallDecline { call_id }));
        }
        actions.extend(self.teardown(CallEndCause::Declined));
        actions
    }

    /// Hang up / cancel, from `Outgoing` or `Active`.
    pub fn hangup(&mut self) -> Vec<CallAction> {
        if !matches!(self.state, DirectCallState::Outgoing | DirectCallState::Active) {
            warn!(state = ?self.state, "hangup ignored");
            return vec![];
        }

        let mut actions = Vec::new();
        if let Some(call) = self.call.as_ref() {
            if let Some(call_id) = call.call_id {
                actions.push(CallAction::SendSignal(SignalEnvelope {
                    call_id,
                    from: self.local_user,
                    to: Some(call.peer),
                    payload: SignalPayload::Leave,
                }));
                actions.push(CallAction::SendCommand(ClientCommand::CallLeave { call_id }));
            }
        }
        actions.extend(self.teardown(CallEndCause::Hangup));
        actions
    }

    /// Ringing (either direction) expired unanswered.
    pub fn on_ring_timeout(&mut self) -> Vec<CallAction> {
        match self.state {
            DirectCallState::Outgoing => {
                let mut actions = Vec::new();
                if let Some(call_id) = self.call.as_ref().and_then(|c| c.call_id) {
                    actions.push(CallAction::SendCommand(ClientCommand::CallLeave { call_id }));
                }
                actions.extend(self.teardown(CallEndCause::Timeout));
                actions
            }
            DirectCallState::Incoming => {
                let mut actions = vec![CallAction::StopRinging];
                actions.extend(self.teardown(CallEndCause::Timeout));
                actions
            }
            _ => vec![],
        }
    }

    // -- registry replies and events ----------------------------------------

    /// `call:start` succeeded.
    pub fn on_call_started(&mut self, call_id: CallId) -> Vec<CallAction> {
        if self.state != DirectCallState::Outgoing {
            return vec![];
        }
        let Some(call) = self.call.as_mut() else { return vec![] };
        call.call_id = Some(call_id);

        debug!(call = %call_id.short(), "registry assigned call id");

        vec![CallAction::SaveSession(PersistedSession {
            call_id,
            chat_id: call.chat_id,
            media_kind: call.media_kind,
            is_group: false,
            started_at: Utc::now(),
        })]
    }

    /// `call:start` failed.  `AlreadyActive` carries the live call id so the
    /// embedder can offer "join instead"; either way this attempt is over.
    pub fn on_start_failed(&mut self, error: CallError) -> Vec<CallAction> {
        if self.state != DirectCallState::Outgoing {
            return vec![];
        }
        warn!(error = %error, "call start rejected");
        self.teardown(CallEndCause::Error(error))
    }

    /// The peer joined the call (registry event).  The side that observes the
    /// join sends the offer -- once local media is ready.
    pub fn on_peer_joined(&mut self, call_id: CallId, user: UserId) -> Vec<CallAction> {
        if self.state != DirectCallState::Outgoing || self.call_id() != Some(call_id) {
            return vec![];
        }
        let Some(call) = self.call.as_mut() else { return vec![] };
        if user != call.peer {
            return vec![];
        }

        call.peer_joined = true;
        self.state = DirectCallState::Active;

        if self.call.as_ref().is_some_and(|c| c.media_ready) {
            self.begin_offer(false)
        } else {
            vec![]
        }
    }

    /// Async media acquisition finished.  Stale generations are discarded:
    /// their tracks must be stopped immediately, not attached.
    pub fn on_media_acquired(&mut self, generation: u64) -> Vec<CallAction> {
        if generation != self.media_generation || self.state == DirectCallState::Idle {
            debug!(generation, "discarding stale media acquisition");
            return vec![CallAction::DiscardStaleMedia { generation }];
        }
        let Some(call) = self.call.as_mut() else {
            return vec![CallAction::DiscardStaleMedia { generation }];
        };
        if call.media_ready {
            // Duplicate completion; its tracks were never attached.
            return vec![CallAction::DiscardStaleMedia { generation }];
        }

        call.media_ready = true;

        // Whichever negotiation step was blocked on media can now run.
        if let Some(sdp) = call.pending_remote_offer.take() {
            return self.apply_remote_offer(sdp);
        }
        if call.is_initiator
            && call.peer_joined
            && self.state == DirectCallState::Active
            && !call.is_offerer
        {
            return self.begin_offer(false);
        }
        vec![]
    }

    /// Async media acquisition failed (permission denied, device gone).
    /// Recoverable at the UI boundary: surface it and abort the transition.
    pub fn on_media_failed(&mut self, generation: u64, reason: String) -> Vec<CallAction> {
        if generation != self.media_generation || self.state == DirectCallState::Idle {
            return vec![];
        }

        let mut actions = Vec::new();
        if let Some(call_id) = self.call.as_ref().and_then(|c| c.call_id) {
            actions.push(CallAction::SendCommand(ClientCommand::CallLeave { call_id }));
        }
        actions.extend(
            self.teardown(CallEndCause::Error(CallError::MediaAcquisitionFailed { reason })),
        );
        actions
    }

    /// The native stack produced the offer we asked for.
    pub fn on_offer_created(&mut self, sdp: String) -> Vec<CallAction> {
        let Some(call) = self.call.as_ref() else { return vec![] };
        let Some(call_id) = call.call_id else { return vec![] };
        if self.state != DirectCallState::Active {
            return vec![];
        }

        vec![CallAction::SendSignal(SignalEnvelope {
            call_id,
            from: self.local_user,
            to: Some(call.peer),
            payload: SignalPayload::Offer { sdp },
        })]
    }

    /// The native stack produced the answer we asked for.
    pub fn on_answer_created(&mut self, sdp: String) -> Vec<CallAction> {
        let Some(call) = self.call.as_ref() else { return vec![] };
        let Some(call_id) = call.call_id else { return vec![] };
        if self.state != DirectCallState::Active {
            return vec![];
        }

        vec![CallAction::SendSignal(SignalEnvelope {
            call_id,
            from: self.local_user,
            to: Some(call.peer),
            payload: SignalPayload::Answer { sdp },
        })]
    }

    /// Toggle the local camera feed and tell the peer.
    pub fn set_video_enabled(&mut self, enabled: bool) -> Vec<CallAction> {
        if self.state != DirectCallState::Active {
            return vec![];
        }
        let Some(call) = self.call.as_ref() else { return vec![] };
        let Some(call_id) = call.call_id else { return vec![] };

        vec![CallAction::SendSignal(SignalEnvelope {
            call_id,
            from: self.local_user,
            to: Some(call.peer),
            payload: SignalPayload::VideoMode { enabled },
        })]
    }

    /// The native stack surfaced a local ICE candidate.
    pub fn on_local_candidate(&mut self, candidate: String) -> Vec<CallAction> {
        let Some(call) = self.call.as_ref() else { return vec![] };
        let Some(call_id) = call.call_id else { return vec![] };

        vec![CallAction::SendSignal(SignalEnvelope {
            call_id,
            from: self.local_user,
            to: Some(call.peer),
            payload: SignalPayload::IceCandidate { candidate },
        })]
    }

    /// A relayed signal arrived from the peer.
    pub fn on_signal(&mut self, envelope: SignalEnvelope) -> Vec<CallAction> {
        let Some(call) = self.call.as_mut() else { return vec![] };
        if Some(envelope.call_id) != call.call_id || envelope.from != call.peer {
            debug!(call = %envelope.call_id.short(), "ignoring signal for unknown call");
            return vec![];
        }

        match envelope.payload {
            SignalPayload::Offer { sdp } => {
                if !call.media_ready {
                    // Answering requires local tracks; hold the offer until
                    // acquisition completes.
                    call.pending_remote_offer = Some(sdp);
                    return vec![];
                }
                self.apply_remote_offer(sdp)
            }
            SignalPayload::Answer { sdp } => {
                call.remote_description_set = true;
                let mut actions = vec![CallAction::ApplyRemoteAnswer { sdp }];
                actions.extend(Self::flush_candidates(call));
                actions
            }
            SignalPayload::IceCandidate { candidate } => {
                if call.remote_description_set {
                    vec![CallAction::AddIceCandidate { candidate }]
                } else {
                    call.queued_candidates.push(candidate);
                    vec![]
                }
            }
            SignalPayload::Leave => {
                info!(peer = %call.peer.short(), "peer left the call");
                self.teardown(CallEndCause::RemoteLeft)
            }
            SignalPayload::VideoMode { enabled } => {
                vec![CallAction::RemoteVideoMode { enabled }]
            }
            SignalPayload::StreamIdentityMap { .. } => {
                // Group-call signal; meaningless on a direct call.
                vec![]
            }
        }
    }

    /// Registry broadcast: the call is over.
    pub fn on_call_ended(&mut self, call_id: CallId, reason: EndReason) -> Vec<CallAction> {
        if self.call_id() != Some(call_id) {
            return vec![];
        }
        let mut actions = Vec::new();
        if self.state == DirectCallState::Incoming {
            actions.push(CallAction::StopRinging);
        }
        actions.extend(self.teardown(CallEndCause::Registry(reason)));
        actions
    }

    /// Registry broadcast: the peer left.
    pub fn on_participant_left(&mut self, call_id: CallId, user: UserId) -> Vec<CallAction> {
        let Some(call) = self.call.as_ref() else { return vec![] };
        if Some(call_id) != call.call_id || user != call.peer {
            return vec![];
        }
        self.teardown(CallEndCause::RemoteLeft)
    }

    // -- connectivity -------------------------------------------------------

    /// Native peer-connection lifecycle changed.
    pub fn on_connection_state(&mut self, state: ConnectionState) -> Vec<CallAction> {
        if self.state != DirectCallState::Active {
            return vec![];
        }
        match state {
            ConnectionState::Connected => {
                if let Some(call) = self.call.as_mut() {
                    call.awaiting_reconnect = false;
                }
                vec![]
            }
            ConnectionState::Disconnected => {
                // Transient loss is common; give ICE a grace period before
                // forcing a restart.
                if let Some(call) = self.call.as_mut() {
                    call.awaiting_reconnect = true;
                }
                vec![CallAction::StartReconnectTimer {
                    delay: Duration::from_millis(RECONNECT_GRACE_MS),
                }]
            }
            ConnectionState::Failed => self.attempt_restart(),
            ConnectionState::New | ConnectionState::Connecting | ConnectionState::Closed => {
                vec![]
            }
        }
    }

    /// The reconnect grace period elapsed.
    pub fn on_reconnect_timer(&mut self) -> Vec<CallAction> {
        if self.state != DirectCallState::Active {
            return vec![];
        }
        if self.call.as_ref().map_or(true, |c| !c.awaiting_reconnect) {
            // Connectivity recovered while the timer ran.
            return vec![];
        }
        self.attempt_restart()
    }

    // -- internals ----------------------------------------------------------

    fn begin_offer(&mut self, ice_restart: bool) -> Vec<CallAction> {
        if let Some(call) = self.call.as_mut() {
            call.is_offerer = true;
        }
        vec![CallAction::CreateOffer { ice_restart }]
    }

    fn apply_remote_offer(&mut self, sdp: String) -> Vec<CallAction> {
        let Some(call) = self.call.as_mut() else { return vec![] };
        call.remote_description_set = true;

        let mut actions = vec![CallAction::ApplyRemoteOffer { sdp }, CallAction::CreateAnswer];
        actions.extend(Self::flush_candidates(call));
        actions
    }

    /// Queued candidates are applied exactly once, in arrival order.
    fn flush_candidates(call: &mut CallContext) -> Vec<CallAction> {
        std::mem::take(&mut call.queued_candidates)
            .into_iter()
            .map(|candidate| CallAction::AddIceCandidate { candidate })
            .collect()
    }

    /// One restart for direct calls, then give up with a reported reason.
    fn attempt_restart(&mut self) -> Vec<CallAction> {
        let Some(call) = self.call.as_mut() else { return vec![] };

        if call.restarts_used >= MAX_ICE_RESTARTS {
            let mut actions = Vec::new();
            if let Some(call_id) = call.call_id {
                actions.push(CallAction::SendCommand(ClientCommand::CallLeave { call_id }));
            }
            actions.extend(self.teardown(CallEndCause::Error(CallError::NegotiationFailed {
                reason: "connection failed after ICE restart".into(),
            })));
            return actions;
        }

        call.restarts_used += 1;
        call.awaiting_reconnect = false;
        call.remote_description_set = false;
        call.queued_candidates.clear();

        info!(attempt = call.restarts_used, "attempting ICE restart");

        if call.is_offerer {
            vec![CallAction::CreateOffer { ice_restart: true }]
        } else {
            // The offerer drives restarts; we wait for its new offer.
            vec![]
        }
    }

    /// Every path back to idle releases media, clears the session record and
    /// invalidates in-flight acquisitions.  No dangling camera, ever.
    fn teardown(&mut self, cause: CallEndCause) -> Vec<CallAction> {
        info!(?cause, "direct call ended");
        self.state = DirectCallState::Idle;
        self.call = None;
        self.media_generation += 1;

        vec![CallAction::ReleaseMedia, CallAction::ClearSession, CallAction::Ended { cause }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer_to(machine: &mut DirectCall, call_id: CallId, from: UserId, sdp: &str) -> Vec<CallAction> {
        machine.on_signal(SignalEnvelope {
            call_id,
            from,
            to: None,
            payload: SignalPayload::Offer { sdp: sdp.into() },
        })
    }

    fn candidate_to(
        machine: &mut DirectCall,
        call_id: CallId,
        from: UserId,
        candidate: &str,
    ) -> Vec<CallAction> {
        machine.on_signal(SignalEnvelope {
            call_id,
            from,
            to: None,
            payload: SignalPayload::IceCandidate { candidate: candidate.into() },
        })
    }

    #[test]
    fn outgoing_acquires_media_eagerly() {
        let me = UserId::new();
        let peer = UserId::new();
        let mut machine = DirectCall::new(me);

        let actions = machine.start_call(ChatId::new(), peer, MediaKind::Video);
        assert!(matches!(actions[0], CallAction::AcquireMedia { generation: 1, .. }));
        assert!(matches!(actions[1], CallAction::SendCommand(ClientCommand::CallStart { .. })));
        assert_eq!(machine.state(), DirectCallState::Outgoing);
    }

    #[test]
    fn incoming_defers_media_until_accept() {
        let me = UserId::new();
        let caller = UserId::new();
        let mut machine = DirectCall::new(me);

        let call_id = CallId::new();
        let actions = machine.on_incoming(call_id, ChatId::new(), caller, MediaKind::Video);
        assert_eq!(actions, vec![CallAction::StartRinging]);
        assert!(!actions.iter().any(|a| matches!(a, CallAction::AcquireMedia { .. })));

        let actions = machine.accept();
        assert!(actions.iter().any(|a| matches!(a, CallAction::AcquireMedia { .. })));
        assert!(actions
            .iter()
            .any(|a| matches!(a, CallAction::SaveSession(s) if s.call_id == call_id && !s.is_group)));
        assert_eq!(machine.state(), DirectCallState::Active);
    }

    #[test]
    fn offer_sent_when_peer_joins_and_media_ready() {
        let me = UserId::new();
        let peer = UserId::new();
        let mut machine = DirectCall::new(me);

        machine.start_call(ChatId::new(), peer, MediaKind::Audio);
        let call_id = CallId::new();
        machine.on_call_started(call_id);

        // Peer joins before media is ready: no offer yet.
        assert!(machine.on_peer_joined(call_id, peer).is_empty());
        assert_eq!(machine.state(), DirectCallState::Active);

        // Media completes: the blocked offer fires.
        let actions = machine.on_media_acquired(1);
        assert_eq!(actions, vec![CallAction::CreateOffer { ice_restart: false }]);

        // A duplicated completion must have its tracks stopped, not dropped.
        assert_eq!(
            machine.on_media_acquired(1),
            vec![CallAction::DiscardStaleMedia { generation: 1 }]
        );

        let actions = machine.on_offer_created("v=0 offer".into());
        assert!(matches!(
            &actions[0],
            CallAction::SendSignal(env)
                if env.to == Some(peer) && matches!(env.payload, SignalPayload::Offer { .. })
        ));
    }

    #[test]
    fn candidates_before_remote_description_are_buffered_in_order() {
        let me = UserId::new();
        let caller = UserId::new();
        let mut machine = DirectCall::new(me);

        let call_id = CallId::new();
        machine.on_incoming(call_id, ChatId::new(), caller, MediaKind::Audio);
        machine.accept();
        machine.on_media_acquired(1);

        // Candidates race ahead of the offer.
        assert!(candidate_to(&mut machine, call_id, caller, "cand-1").is_empty());
        assert!(candidate_to(&mut machine, call_id, caller, "cand-2").is_empty());

        let actions = offer_to(&mut machine, call_id, caller, "v=0");
        assert_eq!(
            actions,
            vec![
                CallAction::ApplyRemoteOffer { sdp: "v=0".into() },
                CallAction::CreateAnswer,
                CallAction::AddIceCandidate { candidate: "cand-1".into() },
                CallAction::AddIceCandidate { candidate: "cand-2".into() },
            ]
        );

        // Flushed exactly once: a later candidate applies directly and the
        // queue stays empty.
        let actions = candidate_to(&mut machine, call_id, caller, "cand-3");
        assert_eq!(actions, vec![CallAction::AddIceCandidate { candidate: "cand-3".into() }]);
    }

    #[test]
    fn offer_before_media_is_held_until_acquisition() {
        let me = UserId::new();
        let caller = UserId::new();
        let mut machine = DirectCall::new(me);

        let call_id = CallId::new();
        machine.on_incoming(call_id, ChatId::new(), caller, MediaKind::Video);
        machine.accept();

        // Offer and a candidate arrive while the camera prompt is open.
        assert!(offer_to(&mut machine, call_id, caller, "v=0").is_empty());
        assert!(candidate_to(&mut machine, call_id, caller, "cand-1").is_empty());

        let actions = machine.on_media_acquired(1);
        assert_eq!(
            actions,
            vec![
                CallAction::ApplyRemoteOffer { sdp: "v=0".into() },
                CallAction::CreateAnswer,
                CallAction::AddIceCandidate { candidate: "cand-1".into() },
            ]
        );
    }

    #[test]
    fn decline_discards_in_flight_media() {
        let me = UserId::new();
        let caller = UserId::new();
        let mut machine = DirectCall::new(me);

        let call_id = CallId::new();
        machine.on_incoming(call_id, ChatId::new(), caller, MediaKind::Video);
        machine.accept(); // acquisition generation 1 is now in flight

        let actions = machine.decline(); // ignored: not Incoming anymore
        assert!(actions.is_empty());

        let actions = machine.hangup();
        assert!(actions.contains(&CallAction::ReleaseMedia));
        assert!(actions.contains(&CallAction::ClearSession));

        // The acquisition completes after teardown: its tracks must stop.
        let actions = machine.on_media_acquired(1);
        assert_eq!(actions, vec![CallAction::DiscardStaleMedia { generation: 1 }]);
    }

    #[test]
    fn decline_while_ringing_never_touches_media() {
        let me = UserId::new();
        let mut machine = DirectCall::new(me);

        let call_id = CallId::new();
        machine.on_incoming(call_id, ChatId::new(), UserId::new(), MediaKind::Video);
        let actions = machine.decline();

        assert_eq!(actions[0], CallAction::StopRinging);
        assert!(actions
            .contains(&CallAction::SendCommand(ClientCommand::CallDecline { call_id })));
        assert!(actions.contains(&CallAction::ClearSession));
        assert!(!actions.iter().any(|a| matches!(a, CallAction::AcquireMedia { .. })));
        assert_eq!(machine.state(), DirectCallState::Idle);
    }

    #[test]
    fn media_failure_aborts_and_cleans_up() {
        let me = UserId::new();
        let peer = UserId::new();
        let mut machine = DirectCall::new(me);

        machine.start_call(ChatId::new(), peer, MediaKind::Video);
        machine.on_call_started(CallId::new());

        let actions = machine.on_media_failed(1, "permission denied".into());
        assert!(actions.iter().any(|a| matches!(a, CallAction::SendCommand(ClientCommand::CallLeave { .. }))));
        assert!(actions.contains(&CallAction::ClearSession));
        assert!(actions.contains(&CallAction::ReleaseMedia));
        assert_eq!(machine.state(), DirectCallState::Idle);
    }

    #[test]
    fn disconnected_waits_grace_then_restarts_once() {
        let me = UserId::new();
        let peer = UserId::new();
        let mut machine = DirectCall::new(me);

        machine.start_call(ChatId::new(), peer, MediaKind::Audio);
        let call_id = CallId::new();
        machine.on_call_started(call_id);
        machine.on_media_acquired(1);
        machine.on_peer_joined(call_id, peer); // we are the offerer

        let actions = machine.on_connection_state(ConnectionState::Disconnected);
        assert_eq!(
            actions,
            vec![CallAction::StartReconnectTimer {
                delay: Duration::from_millis(RECONNECT_GRACE_MS)
            }]
        );

        let actions = machine.on_reconnect_timer();
        assert_eq!(actions, vec![CallAction::CreateOffer { ice_restart: true }]);

        // Second failure exhausts the budget: the call ends with a reason.
        let actions = machine.on_connection_state(ConnectionState::Failed);
        assert!(actions.contains(&CallAction::SendCommand(ClientCommand::CallLeave { call_id })));
        assert!(actions.iter().any(|a| matches!(
            a,
            CallAction::Ended { cause: CallEndCause::Error(CallError::NegotiationFailed { .. }) }
        )));
        assert_eq!(machine.state(), DirectCallState::Idle);
    }

    #[test]
    fn recovery_during_grace_cancels_restart() {
        let me = UserId::new();
        let peer = UserId::new();
        let mut machine = DirectCall::new(me);

        machine.start_call(ChatId::new(), peer, MediaKind::Audio);
        let call_id = CallId::new();
        machine.on_call_started(call_id);
        machine.on_media_acquired(1);
        machine.on_peer_joined(call_id, peer);

        machine.on_connection_state(ConnectionState::Disconnected);
        machine.on_connection_state(ConnectionState::Connected);

        assert!(machine.on_reconnect_timer().is_empty());
    }

    #[test]
    fn explicit_failed_restarts_immediately() {
        let me = UserId::new();
        let peer = UserId::new();
        let mut machine = DirectCall::new(me);

        machine.start_call(ChatId::new(), peer, MediaKind::Audio);
        let call_id = CallId::new();
        machine.on_call_started(call_id);
        machine.on_media_acquired(1);
        machine.on_peer_joined(call_id, peer);

        let actions = machine.on_connection_state(ConnectionState::Failed);
        assert_eq!(actions, vec![CallAction::CreateOffer { ice_restart: true }]);
    }

    #[test]
    fn remote_leave_resets_to_idle() {
        let me = UserId::new();
        let caller = UserId::new();
        let mut machine = DirectCall::new(me);

        let call_id = CallId::new();
        machine.on_incoming(call_id, ChatId::new(), caller, MediaKind::Audio);
        machine.accept();

        let actions = machine.on_signal(SignalEnvelope {
            call_id,
            from: caller,
            to: None,
            payload: SignalPayload::Leave,
        });
        assert!(actions.contains(&CallAction::ReleaseMedia));
        assert!(actions.contains(&CallAction::ClearSession));
        assert!(actions.contains(&CallAction::Ended { cause: CallEndCause::RemoteLeft }));
        assert_eq!(machine.state(), DirectCallState::Idle);
    }

    /// Full scenario: A calls B, B accepts, offer/answer/candidates are
    /// piped between the two machines, then A hangs up.
    #[test]
    fn two_machines_negotiate_end_to_end() {
        let a = UserId::new();
        let b = UserId::new();
        let chat = ChatId::new();
        let mut alice = DirectCall::new(a);
        let mut bob = DirectCall::new(b);

        // A starts; registry assigns id 42 and rings B.
        alice.start_call(chat, b, MediaKind::Video);
        let call_id = CallId::new();
        alice.on_call_started(call_id);
        alice.on_media_acquired(1);
        bob.on_incoming(call_id, chat, a, MediaKind::Video);

        // B accepts; registry tells A the peer joined.  The callee never
        // initiates the offer.
        bob.accept();
        assert!(bob.on_media_acquired(1).is_empty());
        let actions = alice.on_peer_joined(call_id, b);
        assert_eq!(actions, vec![CallAction::CreateOffer { ice_restart: false }]);

        // A's native stack produces the offer; pipe it to B.
        let actions = alice.on_offer_created("offer-sdp".into());
        let CallAction::SendSignal(offer) = &actions[0] else { panic!("expected signal") };
        let actions = bob.on_signal(offer.clone());
        assert!(actions.contains(&CallAction::CreateAnswer));

        // B answers; pipe it back to A.
        let actions = bob.on_answer_created("answer-sdp".into());
        let CallAction::SendSignal(answer) = &actions[0] else { panic!("expected signal") };
        let actions = alice.on_signal(answer.clone());
        assert!(actions.contains(&CallAction::ApplyRemoteAnswer { sdp: "answer-sdp".into() }));

        // B turns the camera off; A observes the toggle.
        let actions = bob.set_video_enabled(false);
        let CallAction::SendSignal(toggle) = &actions[0] else { panic!("expected signal") };
        assert_eq!(
            alice.on_signal(toggle.clone()),
            vec![CallAction::RemoteVideoMode { enabled: false }]
        );

        // Candidates flow both ways, connectivity lands.
        let actions = alice.on_local_candidate("a-cand".into());
        let CallAction::SendSignal(cand) = &actions[0] else { panic!("expected signal") };
        assert_eq!(
            bob.on_signal(cand.clone()),
            vec![CallAction::AddIceCandidate { candidate: "a-cand".into() }]
        );
        alice.on_connection_state(ConnectionState::Connected);
        bob.on_connection_state(ConnectionState::Connected);

        // A hangs up; B observes the leave.
        let actions = alice.hangup();
        let leave = actions
            .iter()
            .find_map(|a| match a {
                CallAction::SendSignal(env) => Some(env.clone()),
                _ => None,
            })
            .expect("leave signal");
        let actions = bob.on_signal(leave);
        assert!(actions.contains(&CallAction::Ended { cause: CallEndCause::RemoteLeft }));

        assert_eq!(alice.state(), DirectCallState::Idle);
        assert_eq!(bob.state(), DirectCallState::Idle);
    }
}
