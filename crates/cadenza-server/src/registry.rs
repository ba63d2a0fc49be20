//! Call registry: the single source of truth for which calls exist, who is in
//! them, and which chat each call belongs to.
//!
//! All lifecycle transitions for a given call are funneled through this table
//! under one write lock, so registry operations for one call are applied in
//! arrival order and no roster is ever mutated from outside.  Fan-out goes
//! through the [`TransportHub`], which keeps the registry testable without
//! sockets.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use cadenza_shared::error::CallError;
use cadenza_shared::protocol::{
    ClientCommand, EndReason, ParticipantInfo, ReplyBody, ServerEvent, ServerFrame,
    SignalEnvelope,
};
use cadenza_shared::types::{
    CallId, CallKind, ChatId, ConnectionState, MediaKind, ParticipantRole, StreamId, UserId,
};

use crate::rate_limit::EventLimiter;
use crate::transport::TransportHub;

/// Membership record of one user in one call.
#[derive(Debug, Clone)]
pub struct Participant {
    pub user_id: UserId,
    pub user_name: String,
    pub joined_at: DateTime<Utc>,
    pub role: ParticipantRole,
    pub connection_state: ConnectionState,
}

impl Participant {
    fn info(&self) -> ParticipantInfo {
        ParticipantInfo { user_id: self.user_id, user_name: self.user_name.clone() }
    }
}

/// One live call. Never mutated after destruction; a new call gets a new id.
#[derive(Debug)]
struct ActiveCall {
    call_id: CallId,
    chat_id: ChatId,
    kind: CallKind,
    media_kind: MediaKind,
    initiator: UserId,
    created_at: DateTime<Utc>,
    /// Direct calls only: the unordered endpoint pair, kept sorted.
    pair: Option<(UserId, UserId)>,
    /// Roster in join order.
    participants: Vec<Participant>,
}

impl ActiveCall {
    fn contains(&self, user: &UserId) -> bool {
        self.participants.iter().any(|p| p.user_id == *user)
    }

    fn roster(&self) -> Vec<ParticipantInfo> {
        self.participants.iter().map(Participant::info).collect()
    }

    fn others(&self, user: &UserId) -> Vec<UserId> {
        self.participants
            .iter()
            .filter(|p| p.user_id != *user)
            .map(|p| p.user_id)
            .collect()
    }
}

fn sorted_pair(a: UserId, b: UserId) -> (UserId, UserId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// How many ended call ids are remembered so late commands can be answered
/// with `Closed` instead of `NotFound`.
const ENDED_TOMBSTONES: usize = 128;

#[derive(Default)]
struct RegistryState {
    calls: HashMap<CallId, ActiveCall>,
    /// Invariant: at most one live group call per chat.
    group_by_chat: HashMap<ChatId, CallId>,
    /// Invariant: at most one live direct call per unordered user pair.
    direct_by_pair: HashMap<(UserId, UserId), CallId>,
    /// Recently ended call ids, oldest first.
    ended: VecDeque<CallId>,
}

impl RegistryState {
    fn destroy(&mut self, call_id: &CallId) -> Option<ActiveCall> {
        let call = self.calls.remove(call_id)?;
        match call.kind {
            CallKind::Group => {
                self.group_by_chat.remove(&call.chat_id);
            }
            CallKind::Direct => {
                if let Some(pair) = call.pair {
                    self.direct_by_pair.remove(&pair);
                }
            }
        }
        if self.ended.len() == ENDED_TOMBSTONES {
            self.ended.pop_front();
        }
        self.ended.push_back(*call_id);
        Some(call)
    }

    /// Error for a call id that is not in the live table.
    fn missing(&self, call_id: &CallId) -> CallError {
        if self.ended.contains(call_id) {
            CallError::Closed
        } else {
            CallError::NotFound
        }
    }
}

/// Server-side authority over active calls and their rosters.
pub struct CallRegistry {
    state: RwLock<RegistryState>,
    hub: TransportHub,
    event_limiter: EventLimiter,
}

impl CallRegistry {
    pub fn new(hub: TransportHub, event_limiter: EventLimiter) -> Arc<Self> {
        Arc::new(Self { state: RwLock::new(RegistryState::default()), hub, event_limiter })
    }

    pub fn hub(&self) -> &TransportHub {
        &self.hub
    }

    pub fn event_limiter(&self) -> &EventLimiter {
        &self.event_limiter
    }

    /// Dispatch one admitted client command to the matching operation.
    pub async fn handle_command(
        &self,
        user: UserId,
        user_name: &str,
        command: ClientCommand,
    ) -> Result<ReplyBody, CallError> {
        match command {
            ClientCommand::CallStart { chat_id, callee, media_kind } => {
                let call_id = self
                    .start_direct(chat_id, user, user_name, callee, media_kind)
                    .await?;
                Ok(ReplyBody::CallStarted { call_id })
            }
            ClientCommand::CallAccept { call_id } | ClientCommand::GroupCallJoin { call_id } => {
                let participants = self.join(call_id, user, user_name).await?;
                Ok(ReplyBody::Joined { call_id, participants })
            }
            ClientCommand::CallDecline { call_id } => {
                self.decline(call_id, user).await?;
                Ok(ReplyBody::Ack)
            }
            ClientCommand::CallSignal { envelope } => {
                self.relay_signal(user, envelope).await?;
                Ok(ReplyBody::Ack)
            }
            ClientCommand::CallLeave { call_id } => {
                let call_ended = self.leave(call_id, user).await?;
                Ok(ReplyBody::Left { call_id, call_ended })
            }
            ClientCommand::GroupCallStart { chat_id, media_kind } => {
                let call_id = self.start_group(chat_id, user, user_name, media_kind).await?;
                Ok(ReplyBody::CallStarted { call_id })
            }
            ClientCommand::SfuStream { call_id, stream_id } => {
                self.map_stream(call_id, user, stream_id).await?;
                Ok(ReplyBody::Ack)
            }
        }
    }

    /// Start a direct call. At most one live call per unordered user pair;
    /// the existing id rides along in the error so the caller can offer
    /// "join instead".
    pub async fn start_direct(
        &self,
        chat_id: ChatId,
        initiator: UserId,
        initiator_name: &str,
        callee: UserId,
        media_kind: MediaKind,
    ) -> Result<CallId, CallError> {
        let mut state = self.state.write().await;

        let pair = sorted_pair(initiator, callee);
        if let Some(existing) = state.direct_by_pair.get(&pair) {
            return Err(CallError::AlreadyActive { call_id: *existing });
        }

        let call_id = CallId::new();
        let created_at = Utc::now();
        let call = ActiveCall {
            call_id,
            chat_id,
            kind: CallKind::Direct,
            media_kind,
            initiator,
            created_at,
            pair: Some(pair),
            participants: vec![Participant {
                user_id: initiator,
                user_name: initiator_name.to_string(),
                joined_at: created_at,
                role: ParticipantRole::Initiator,
                connection_state: ConnectionState::New,
            }],
        };
        state.direct_by_pair.insert(pair, call_id);
        state.calls.insert(call_id, call);

        info!(
            call = %call_id.short(),
            initiator = %initiator.short(),
            callee = %callee.short(),
            ?media_kind,
            "direct call started"
        );

        self.hub
            .send(
                &callee,
                ServerFrame::Event {
                    event: ServerEvent::CallIncoming {
                        call_id,
                        chat_id,
                        initiator: ParticipantInfo {
                            user_id: initiator,
                            user_name: initiator_name.to_string(),
                        },
                        media_kind,
                        created_at,
                    },
                },
            )
            .await;

        Ok(call_id)
    }

    /// Start a group call. At most one live group call per chat.
    pub async fn start_group(
        &self,
        chat_id: ChatId,
        initiator: UserId,
        initiator_name: &str,
        media_kind: MediaKind,
    ) -> Result<CallId, CallError> {
        let mut state = self.state.write().await;

        if let Some(existing) = state.group_by_chat.get(&chat_id) {
            return Err(CallError::AlreadyActive { call_id: *existing });
        }

        let call_id = CallId::new();
        let created_at = Utc::now();
        let call = ActiveCall {
            call_id,
            chat_id,
            kind: CallKind::Group,
            media_kind,
            initiator,
            created_at,
            pair: None,
            participants: vec![Participant {
                user_id: initiator,
                user_name: initiator_name.to_string(),
                joined_at: created_at,
                role: ParticipantRole::Initiator,
                connection_state: ConnectionState::New,
            }],
        };
        state.group_by_chat.insert(chat_id, call_id);
        state.calls.insert(call_id, call);

        info!(
            call = %call_id.short(),
            chat = %chat_id,
            initiator = %initiator.short(),
            ?media_kind,
            "group call started"
        );

        Ok(call_id)
    }

    /// Join a call. Broadcasts `ParticipantJoined` to prior members and
    /// returns the full roster (joiner included) so late joiners see who is
    /// already present. Idempotent for a user already in the roster.
    pub async fn join(
        &self,
        call_id: CallId,
        user: UserId,
        user_name: &str,
    ) -> Result<Vec<ParticipantInfo>, CallError> {
        let mut state = self.state.write().await;
        let missing = state.missing(&call_id);
        let call = state.calls.get_mut(&call_id).ok_or(missing)?;

        if call.contains(&user) {
            return Ok(call.roster());
        }

        let prior = call.others(&user);
        call.participants.push(Participant {
            user_id: user,
            user_name: user_name.to_string(),
            joined_at: Utc::now(),
            role: ParticipantRole::Joiner,
            connection_state: ConnectionState::New,
        });
        let roster = call.roster();

        info!(
            call = %call_id.short(),
            user = %user.short(),
            participants = roster.len(),
            "participant joined"
        );

        for member in prior {
            self.hub
                .send(
                    &member,
                    ServerFrame::Event {
                        event: ServerEvent::ParticipantJoined {
                            call_id,
                            user_id: user,
                            user_name: user_name.to_string(),
                        },
                    },
                )
                .await;
        }

        Ok(roster)
    }

    /// Leave a call. A direct call ends for both endpoints the moment either
    /// leaves -- the other side is told via `CallEnded` whether it had joined
    /// or was still ringing. A group call survives until its roster empties;
    /// until then `ParticipantLeft` is broadcast.
    pub async fn leave(&self, call_id: CallId, user: UserId) -> Result<bool, CallError> {
        let mut state = self.state.write().await;
        let missing = state.missing(&call_id);
        let call = state.calls.get_mut(&call_id).ok_or(missing)?;

        let before = call.participants.len();
        call.participants.retain(|p| p.user_id != user);
        if call.participants.len() == before {
            return Err(CallError::NotFound);
        }

        if call.kind == CallKind::Direct {
            let pair = call.pair;
            state.destroy(&call_id);
            info!(
                call = %call_id.short(),
                user = %user.short(),
                "direct call ended: endpoint left"
            );

            if let Some((a, b)) = pair {
                let other = if a == user { b } else { a };
                self.hub
                    .send(
                        &other,
                        ServerFrame::Event {
                            event: ServerEvent::CallEnded { call_id, reason: EndReason::Hangup },
                        },
                    )
                    .await;
            }
            return Ok(true);
        }

        if call.participants.is_empty() {
            state.destroy(&call_id);
            info!(call = %call_id.short(), "call destroyed: roster empty");
            return Ok(true);
        }

        let remaining = call.others(&user);
        info!(
            call = %call_id.short(),
            user = %user.short(),
            participants = remaining.len(),
            "participant left"
        );

        for member in remaining {
            self.hub
                .send(
                    &member,
                    ServerFrame::Event {
                        event: ServerEvent::ParticipantLeft {
                            call_id,
                            user_id: user,
                            call_ended: false,
                        },
                    },
                )
                .await;
        }

        Ok(false)
    }

    /// Decline an incoming direct call: the call ends for everyone with an
    /// explicit reason, whether or not the decliner ever joined.
    pub async fn decline(&self, call_id: CallId, user: UserId) -> Result<(), CallError> {
        {
            let state = self.state.read().await;
            let call = state.calls.get(&call_id).ok_or_else(|| state.missing(&call_id))?;
            if call.kind != CallKind::Direct {
                return Err(CallError::NotFound);
            }
            debug!(call = %call_id.short(), user = %user.short(), "call declined");
        }
        self.force_end(call_id, EndReason::Declined).await
    }

    /// Relay a signaling envelope without inspecting its payload.  Directed
    /// envelopes go to `to` only; broadcast envelopes go to every participant
    /// except the sender.
    pub async fn relay_signal(
        &self,
        sender: UserId,
        envelope: SignalEnvelope,
    ) -> Result<(), CallError> {
        if envelope.from != sender {
            warn!(
                user = %sender.short(),
                claimed = %envelope.from.short(),
                "dropping spoofed signal envelope"
            );
            return Err(CallError::NotFound);
        }

        let targets: Vec<UserId> = {
            let state = self.state.read().await;
            let call = state
                .calls
                .get(&envelope.call_id)
                .ok_or_else(|| state.missing(&envelope.call_id))?;
            if !call.contains(&sender) {
                return Err(CallError::NotFound);
            }
            match envelope.to {
                Some(target) => {
                    if !call.contains(&target) {
                        return Err(CallError::NotFound);
                    }
                    vec![target]
                }
                None => call.others(&sender),
            }
        };

        debug!(
            call = %envelope.call_id.short(),
            from = %sender.short(),
            kind = envelope.payload.kind_name(),
            targets = targets.len(),
            "relaying signal"
        );

        for target in targets {
            self.hub
                .send(&target, ServerFrame::Event { event: ServerEvent::Signal { envelope: envelope.clone() } })
                .await;
        }

        Ok(())
    }

    /// Broadcast a relay stream-identity mapping to the other participants.
    pub async fn map_stream(
        &self,
        call_id: CallId,
        user: UserId,
        stream_id: StreamId,
    ) -> Result<(), CallError> {
        let targets: Vec<UserId> = {
            let state = self.state.read().await;
            let call = state.calls.get(&call_id).ok_or_else(|| state.missing(&call_id))?;
            if !call.contains(&user) {
                return Err(CallError::NotFound);
            }
            call.others(&user)
        };

        debug!(
            call = %call_id.short(),
            user = %user.short(),
            stream = %stream_id,
            "broadcasting stream identity mapping"
        );

        for target in targets {
            self.hub
                .send(
                    &target,
                    ServerFrame::Event {
                        event: ServerEvent::SfuStreamMapped {
                            call_id,
                            user_id: user,
                            stream_id: stream_id.clone(),
                        },
                    },
                )
                .await;
        }

        Ok(())
    }

    /// Administrative termination: broadcast `CallEnded` to every participant
    /// and destroy the call so no one is left holding stale state.
    pub async fn force_end(&self, call_id: CallId, reason: EndReason) -> Result<(), CallError> {
        let call = {
            let mut state = self.state.write().await;
            let missing = state.missing(&call_id);
            state.destroy(&call_id).ok_or(missing)?
        };

        info!(call = %call_id.short(), ?reason, "call force-ended");

        for participant in &call.participants {
            self.hub
                .send(
                    &participant.user_id,
                    ServerFrame::Event { event: ServerEvent::CallEnded { call_id, reason } },
                )
                .await;
        }

        Ok(())
    }

    /// Remove a user from every call they are in (disconnect sweep).
    /// Returns the affected calls and whether each ended.
    pub async fn leave_all(&self, user: UserId) -> Vec<(CallId, bool)> {
        let memberships: Vec<CallId> = {
            let state = self.state.read().await;
            state
                .calls
                .values()
                .filter(|call| call.contains(&user))
                .map(|call| call.call_id)
                .collect()
        };

        let mut left = Vec::with_capacity(memberships.len());
        for call_id in memberships {
            if let Ok(call_ended) = self.leave(call_id, user).await {
                left.push((call_id, call_ended));
            }
        }
        left
    }

    pub async fn active_call_count(&self) -> usize {
        self.state.read().await.calls.len()
    }

    /// Roster lookup for diagnostics and tests.
    pub async fn roster(&self, call_id: &CallId) -> Option<Vec<ParticipantInfo>> {
        self.state.read().await.calls.get(call_id).map(|call| call.roster())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_shared::protocol::SignalPayload;
    use tokio::sync::mpsc;

    fn registry() -> Arc<CallRegistry> {
        CallRegistry::new(TransportHub::new(), EventLimiter::default())
    }

    async fn connect(registry: &CallRegistry, user: UserId) -> mpsc::Receiver<ServerFrame> {
        registry.hub().register(user).await
    }

    fn next_event(rx: &mut mpsc::Receiver<ServerFrame>) -> ServerEvent {
        match rx.try_recv().expect("expected a queued frame") {
            ServerFrame::Event { event } => event,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn group_start_is_unique_per_chat() {
        let registry = registry();
        let chat = ChatId::new();
        let alice = UserId::new();
        let bob = UserId::new();

        let call_id = registry
            .start_group(chat, alice, "alice", MediaKind::Video)
            .await
            .unwrap();

        let err = registry
            .start_group(chat, bob, "bob", MediaKind::Video)
            .await
            .unwrap_err();
        assert_eq!(err, CallError::AlreadyActive { call_id });

        // A different chat is unaffected.
        registry
            .start_group(ChatId::new(), bob, "bob", MediaKind::Audio)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn direct_start_is_unique_per_unordered_pair() {
        let registry = registry();
        let chat = ChatId::new();
        let alice = UserId::new();
        let bob = UserId::new();

        let call_id = registry
            .start_direct(chat, alice, "alice", bob, MediaKind::Audio)
            .await
            .unwrap();

        // Same pair, either direction.
        let err = registry
            .start_direct(chat, bob, "bob", alice, MediaKind::Audio)
            .await
            .unwrap_err();
        assert_eq!(err, CallError::AlreadyActive { call_id });

        // A different pair is fine.
        registry
            .start_direct(chat, alice, "alice", UserId::new(), MediaKind::Audio)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn callee_receives_incoming_event() {
        let registry = registry();
        let alice = UserId::new();
        let bob = UserId::new();
        let mut bob_rx = connect(&registry, bob).await;

        let call_id = registry
            .start_direct(ChatId::new(), alice, "alice", bob, MediaKind::Video)
            .await
            .unwrap();

        match next_event(&mut bob_rx) {
            ServerEvent::CallIncoming { call_id: id, initiator, media_kind, .. } => {
                assert_eq!(id, call_id);
                assert_eq!(initiator.user_id, alice);
                assert_eq!(media_kind, MediaKind::Video);
            }
            other => panic!("expected CallIncoming, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn roster_tracks_joins_and_leaves() {
        let registry = registry();
        let alice = UserId::new();
        let bob = UserId::new();
        let carol = UserId::new();

        let call_id = registry
            .start_group(ChatId::new(), alice, "alice", MediaKind::Audio)
            .await
            .unwrap();

        registry.join(call_id, bob, "bob").await.unwrap();
        let roster = registry.join(call_id, carol, "carol").await.unwrap();
        let ids: Vec<UserId> = roster.iter().map(|p| p.user_id).collect();
        assert_eq!(ids, vec![alice, bob, carol]);

        registry.leave(call_id, bob).await.unwrap();
        let roster = registry.roster(&call_id).await.unwrap();
        let ids: Vec<UserId> = roster.iter().map(|p| p.user_id).collect();
        assert_eq!(ids, vec![alice, carol]);
    }

    #[tokio::test]
    async fn join_is_idempotent_per_user() {
        let registry = registry();
        let alice = UserId::new();
        let bob = UserId::new();

        let call_id = registry
            .start_group(ChatId::new(), alice, "alice", MediaKind::Audio)
            .await
            .unwrap();

        registry.join(call_id, bob, "bob").await.unwrap();
        let roster = registry.join(call_id, bob, "bob").await.unwrap();
        assert_eq!(roster.len(), 2);
    }

    #[tokio::test]
    async fn join_notifies_prior_members_only() {
        let registry = registry();
        let alice = UserId::new();
        let bob = UserId::new();
        let mut alice_rx = connect(&registry, alice).await;
        let mut bob_rx = connect(&registry, bob).await;

        let call_id = registry
            .start_group(ChatId::new(), alice, "alice", MediaKind::Audio)
            .await
            .unwrap();
        registry.join(call_id, bob, "bob").await.unwrap();

        match next_event(&mut alice_rx) {
            ServerEvent::ParticipantJoined { user_id, .. } => assert_eq!(user_id, bob),
            other => panic!("expected ParticipantJoined, got {other:?}"),
        }
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn last_leave_destroys_the_call() {
        let registry = registry();
        let alice = UserId::new();
        let bob = UserId::new();

        let call_id = registry
            .start_group(ChatId::new(), alice, "alice", MediaKind::Audio)
            .await
            .unwrap();
        registry.join(call_id, bob, "bob").await.unwrap();

        assert!(!registry.leave(call_id, alice).await.unwrap());
        assert!(registry.leave(call_id, bob).await.unwrap());

        // The id is gone for good; late commands learn the call is over.
        assert_eq!(
            registry.join(call_id, alice, "alice").await.unwrap_err(),
            CallError::Closed
        );
        assert_eq!(registry.active_call_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_call_is_not_found_but_ended_call_is_closed() {
        let registry = registry();
        let alice = UserId::new();

        assert_eq!(
            registry.join(CallId::new(), alice, "alice").await.unwrap_err(),
            CallError::NotFound
        );

        let call_id = registry
            .start_group(ChatId::new(), alice, "alice", MediaKind::Audio)
            .await
            .unwrap();
        registry.force_end(call_id, EndReason::Hangup).await.unwrap();

        assert_eq!(
            registry.join(call_id, alice, "alice").await.unwrap_err(),
            CallError::Closed
        );
    }

    #[tokio::test]
    async fn direct_leave_ends_the_call_for_the_peer() {
        let registry = registry();
        let alice = UserId::new();
        let bob = UserId::new();
        let mut bob_rx = connect(&registry, bob).await;

        let call_id = registry
            .start_direct(ChatId::new(), alice, "alice", bob, MediaKind::Video)
            .await
            .unwrap();
        registry.join(call_id, bob, "bob").await.unwrap();
        while bob_rx.try_recv().is_ok() {}

        // Either endpoint leaving ends the whole call.
        assert!(registry.leave(call_id, alice).await.unwrap());
        match next_event(&mut bob_rx) {
            ServerEvent::CallEnded { call_id: id, reason } => {
                assert_eq!(id, call_id);
                assert_eq!(reason, EndReason::Hangup);
            }
            other => panic!("expected CallEnded, got {other:?}"),
        }

        // The pair slot is free again: a fresh call gets a fresh id.
        let second = registry
            .start_direct(ChatId::new(), alice, "alice", bob, MediaKind::Video)
            .await
            .unwrap();
        assert_ne!(second, call_id);
    }

    #[tokio::test]
    async fn cancel_while_ringing_notifies_the_callee() {
        let registry = registry();
        let alice = UserId::new();
        let bob = UserId::new();
        let mut bob_rx = connect(&registry, bob).await;

        let call_id = registry
            .start_direct(ChatId::new(), alice, "alice", bob, MediaKind::Audio)
            .await
            .unwrap();
        assert!(matches!(next_event(&mut bob_rx), ServerEvent::CallIncoming { .. }));

        // The caller hangs up before the callee ever joins.
        assert!(registry.leave(call_id, alice).await.unwrap());

        match next_event(&mut bob_rx) {
            ServerEvent::CallEnded { call_id: id, reason } => {
                assert_eq!(id, call_id);
                assert_eq!(reason, EndReason::Hangup);
            }
            other => panic!("expected CallEnded, got {other:?}"),
        }
        assert_eq!(registry.active_call_count().await, 0);
    }

    #[tokio::test]
    async fn destroyed_chat_can_host_a_new_call() {
        let registry = registry();
        let chat = ChatId::new();
        let alice = UserId::new();

        let first = registry
            .start_group(chat, alice, "alice", MediaKind::Audio)
            .await
            .unwrap();
        assert!(registry.leave(first, alice).await.unwrap());

        let second = registry
            .start_group(chat, alice, "alice", MediaKind::Audio)
            .await
            .unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn directed_signal_reaches_target_only() {
        let registry = registry();
        let alice = UserId::new();
        let bob = UserId::new();
        let carol = UserId::new();
        let mut bob_rx = connect(&registry, bob).await;
        let mut carol_rx = connect(&registry, carol).await;

        let call_id = registry
            .start_group(ChatId::new(), alice, "alice", MediaKind::Video)
            .await
            .unwrap();
        registry.join(call_id, bob, "bob").await.unwrap();
        registry.join(call_id, carol, "carol").await.unwrap();
        // Drain the join fan-out.
        while bob_rx.try_recv().is_ok() {}
        while carol_rx.try_recv().is_ok() {}

        let envelope = SignalEnvelope {
            call_id,
            from: alice,
            to: Some(bob),
            payload: SignalPayload::Offer { sdp: "v=0".into() },
        };
        registry.relay_signal(alice, envelope.clone()).await.unwrap();

        match next_event(&mut bob_rx) {
            ServerEvent::Signal { envelope: received } => assert_eq!(received, envelope),
            other => panic!("expected Signal, got {other:?}"),
        }
        assert!(carol_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_signal_skips_sender() {
        let registry = registry();
        let alice = UserId::new();
        let bob = UserId::new();
        let mut alice_rx = connect(&registry, alice).await;
        let mut bob_rx = connect(&registry, bob).await;

        let call_id = registry
            .start_group(ChatId::new(), alice, "alice", MediaKind::Video)
            .await
            .unwrap();
        registry.join(call_id, bob, "bob").await.unwrap();
        while alice_rx.try_recv().is_ok() {}

        let envelope = SignalEnvelope {
            call_id,
            from: alice,
            to: None,
            payload: SignalPayload::StreamIdentityMap { stream_id: StreamId("TR_1".into()) },
        };
        registry.relay_signal(alice, envelope.clone()).await.unwrap();

        match next_event(&mut bob_rx) {
            ServerEvent::Signal { envelope: received } => assert_eq!(received, envelope),
            other => panic!("expected Signal, got {other:?}"),
        }
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn spoofed_sender_is_rejected() {
        let registry = registry();
        let alice = UserId::new();
        let bob = UserId::new();

        let call_id = registry
            .start_group(ChatId::new(), alice, "alice", MediaKind::Audio)
            .await
            .unwrap();
        registry.join(call_id, bob, "bob").await.unwrap();

        let envelope = SignalEnvelope {
            call_id,
            from: alice, // bob claims to be alice
            to: None,
            payload: SignalPayload::Leave,
        };
        assert!(registry.relay_signal(bob, envelope).await.is_err());
    }

    #[tokio::test]
    async fn decline_ends_the_call_for_the_initiator() {
        let registry = registry();
        let alice = UserId::new();
        let bob = UserId::new();
        let mut alice_rx = connect(&registry, alice).await;

        let call_id = registry
            .start_direct(ChatId::new(), alice, "alice", bob, MediaKind::Audio)
            .await
            .unwrap();
        registry.decline(call_id, bob).await.unwrap();

        match next_event(&mut alice_rx) {
            ServerEvent::CallEnded { reason, .. } => assert_eq!(reason, EndReason::Declined),
            other => panic!("expected CallEnded, got {other:?}"),
        }
        assert_eq!(registry.active_call_count().await, 0);
    }

    #[tokio::test]
    async fn force_end_notifies_everyone() {
        let registry = registry();
        let alice = UserId::new();
        let bob = UserId::new();
        let mut alice_rx = connect(&registry, alice).await;
        let mut bob_rx = connect(&registry, bob).await;

        let call_id = registry
            .start_group(ChatId::new(), alice, "alice", MediaKind::Video)
            .await
            .unwrap();
        registry.join(call_id, bob, "bob").await.unwrap();
        while alice_rx.try_recv().is_ok() {}

        registry.force_end(call_id, EndReason::Capacity).await.unwrap();

        for rx in [&mut alice_rx, &mut bob_rx] {
            match next_event(rx) {
                ServerEvent::CallEnded { reason, .. } => {
                    assert_eq!(reason, EndReason::Capacity)
                }
                other => panic!("expected CallEnded, got {other:?}"),
            }
        }
        assert_eq!(registry.active_call_count().await, 0);
    }

    #[tokio::test]
    async fn stream_mapping_is_broadcast_to_others() {
        let registry = registry();
        let alice = UserId::new();
        let bob = UserId::new();
        let mut bob_rx = connect(&registry, bob).await;

        let call_id = registry
            .start_group(ChatId::new(), alice, "alice", MediaKind::Video)
            .await
            .unwrap();
        registry.join(call_id, bob, "bob").await.unwrap();

        registry
            .map_stream(call_id, alice, StreamId("TR_alice".into()))
            .await
            .unwrap();

        match next_event(&mut bob_rx) {
            ServerEvent::SfuStreamMapped { user_id, stream_id, .. } => {
                assert_eq!(user_id, alice);
                assert_eq!(stream_id, StreamId("TR_alice".into()));
            }
            other => panic!("expected SfuStreamMapped, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn leave_all_sweeps_every_membership() {
        let registry = registry();
        let alice = UserId::new();
        let bob = UserId::new();

        let solo = registry
            .start_group(ChatId::new(), alice, "alice", MediaKind::Audio)
            .await
            .unwrap();
        let shared = registry
            .start_group(ChatId::new(), bob, "bob", MediaKind::Audio)
            .await
            .unwrap();
        registry.join(shared, alice, "alice").await.unwrap();

        let mut left = registry.leave_all(alice).await;
        left.sort_by_key(|(id, _)| id.0);
        let mut expected = vec![(solo, true), (shared, false)];
        expected.sort_by_key(|(id, _)| id.0);
        assert_eq!(left, expected);

        assert_eq!(registry.active_call_count().await, 1);
    }
}
