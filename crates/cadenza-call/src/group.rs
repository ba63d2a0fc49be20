//! Group call orchestrator.
//!
//! `incoming -> connecting -> active -> ended`, with `connecting` entered
//! directly on auto-join (persisted-session rejoin) or when starting a call.
//! Like [`crate::direct::DirectCall`] this core is sans-IO: events in,
//! ordered [`GroupAction`]s out.
//!
//! The orchestrator owns the bookkeeping the registry cannot: pairing
//! relay streams with participant identities (either side may arrive first),
//! stable slot assignment, active-speaker tracking, and per-participant
//! quality-tier requests.  A relay transport failure is fatal for the whole
//! call on this client: no partial degraded mode, no reconnection.

use std::collections::HashMap;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info, warn};

use cadenza_shared::error::CallError;
use cadenza_shared::protocol::{ClientCommand, EndReason, ParticipantInfo};
use cadenza_shared::types::{CallId, ChatId, MediaKind, StreamId, UserId};
use cadenza_store::PersistedSession;

use crate::direct::CallEndCause;
use crate::quality::{QualityController, QualityLayer, QualityRequest};
use crate::speaker::SpeakerTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCallState {
    Incoming,
    Connecting,
    Active,
    Ended,
}

/// Instructions for the embedder, executed in list order.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupAction {
    SendCommand(ClientCommand),
    AcquireMedia { generation: u64, media_kind: MediaKind },
    ReleaseMedia,
    DiscardStaleMedia { generation: u64 },
    StartRinging,
    StopRinging,
    /// Fetch RTC config + relay token and drive
    /// [`crate::relay::RelaySession::connect_and_publish`].
    ConnectRelay,
    DisconnectRelay,
    /// A remote stream is now identified; attach it to its slot.
    AttachStream { user_id: UserId, stream_id: StreamId },
    DetachStream { user_id: UserId, stream_id: StreamId },
    RequestQuality { target: UserId, layer: QualityLayer },
    SaveSession(PersistedSession),
    ClearSession,
    Ended { cause: CallEndCause },
}

struct RemoteParticipant {
    user_name: String,
    slot: usize,
    attached_stream: Option<StreamId>,
}

/// Sans-IO N-party call core.
pub struct GroupCall {
    local_user: UserId,
    state: GroupCallState,
    call_id: Option<CallId>,
    chat_id: ChatId,
    media_kind: MediaKind,

    media_generation: u64,
    media_ready: bool,
    joined: bool,

    participants: HashMap<UserId, RemoteParticipant>,
    /// Slot table: assigned once, freed only when the occupant leaves.
    slots: Vec<Option<UserId>>,
    /// Streams that arrived before their identity mapping.
    pending_streams: Vec<StreamId>,
    /// Mappings that arrived before their stream.
    pending_mappings: HashMap<StreamId, UserId>,

    pinned: Option<UserId>,
    speaker: SpeakerTracker,
    quality: QualityController,
}

impl GroupCall {
    fn base(local_user: UserId, chat_id: ChatId, media_kind: MediaKind) -> Self {
        Self {
            local_user,
            state: GroupCallState::Connecting,
            call_id: None,
            chat_id,
            media_kind,
            media_generation: 0,
            media_ready: false,
            joined: false,
            participants: HashMap::new(),
            slots: Vec::new(),
            pending_streams: Vec::new(),
            pending_mappings: HashMap::new(),
            pinned: None,
            speaker: SpeakerTracker::default(),
            quality: QualityController::default(),
        }
    }

    /// Start a new group call in `chat_id`.  Enters `Connecting` directly.
    pub fn start(
        local_user: UserId,
        chat_id: ChatId,
        media_kind: MediaKind,
    ) -> (Self, Vec<GroupAction>) {
        let mut call = Self::base(local_user, chat_id, media_kind);
        call.media_generation = 1;

        info!(chat = %chat_id, ?media_kind, "starting group call");
        let actions = vec![
            GroupAction::AcquireMedia { generation: 1, media_kind },
            GroupAction::SendCommand(ClientCommand::GroupCallStart { chat_id, media_kind }),
        ];
        (call, actions)
    }

    /// A `group-call` invite arrived; ring until accepted or declined.
    pub fn incoming(
        local_user: UserId,
        call_id: CallId,
        chat_id: ChatId,
        media_kind: MediaKind,
    ) -> (Self, Vec<GroupAction>) {
        let mut call = Self::base(local_user, chat_id, media_kind);
        call.state = GroupCallState::Incoming;
        call.call_id = Some(call_id);

        info!(call = %call_id.short(), "incoming group call");
        (call, vec![GroupAction::StartRinging])
    }

    /// Rejoin a persisted session at process start, bypassing `Incoming`.
    pub fn auto_join(local_user: UserId, session: &PersistedSession) -> (Self, Vec<GroupAction>) {
        let mut call = Self::base(local_user, session.chat_id, session.media_kind);
        call.call_id = Some(session.call_id);
        call.media_generation = 1;

        info!(call = %session.call_id.short(), "auto-rejoining persisted group call");
        let actions = vec![
            GroupAction::AcquireMedia { generation: 1, media_kind: session.media_kind },
            GroupAction::SendCommand(ClientCommand::GroupCallJoin { call_id: session.call_id }),
        ];
        (call, actions)
    }

    pub fn state(&self) -> GroupCallState {
        self.state
    }

    pub fn call_id(&self) -> Option<CallId> {
        self.call_id
    }

    /// Slot index of a participant, stable for their whole membership.
    pub fn slot_of(&self, user: &UserId) -> Option<usize> {
        self.participants.get(user).map(|p| p.slot)
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Whoever is on stage: an explicit pin always beats the active speaker.
    pub fn on_stage(&self) -> Option<UserId> {
        self.pinned.or(self.speaker.current())
    }

    // -- lifecycle ------------------------------------------------------------

    /// Accept the ringing invite.  `Incoming -> Connecting`.
    pub fn accept(&mut self) -> Vec<GroupAction> {
        if self.state != GroupCallState::Incoming {
            warn!(state = ?self.state, "accept ignored");
            return vec![];
        }
        let Some(call_id) = self.call_id else { return vec![] };

        self.state = GroupCallState::Connecting;
        self.media_generation += 1;

        vec![
            GroupAction::StopRinging,
            GroupAction::AcquireMedia {
                generation: self.media_generation,
                media_kind: self.media_kind,
            },
            GroupAction::SendCommand(ClientCommand::GroupCallJoin { call_id }),
        ]
    }

    /// Decline the ringing invite.
    pub fn decline(&mut self) -> Vec<GroupAction> {
        if self.state != GroupCallState::Incoming {
            warn!(state = ?self.state, "decline ignored");
            return vec![];
        }
        let mut actions = vec![GroupAction::StopRinging];
        actions.extend(self.teardown(CallEndCause::Declined, false));
        actions
    }

    /// `group-call:start` succeeded.
    pub fn on_started(&mut self, call_id: CallId) -> Vec<GroupAction> {
        if self.state != GroupCallState::Connecting || self.call_id.is_some() {
            return vec![];
        }
        self.call_id = Some(call_id);
        self.joined = true; // the registry seats the starter immediately

        let mut actions = vec![GroupAction::SaveSession(self.session_record(call_id))];
        actions.extend(self.try_activate());
        actions
    }

    /// `group-call:start` or `group-call:join` failed.  `AlreadyActive`
    /// carries the live call id so the embedder can offer "join instead";
    /// `NotFound`/`Closed` mean the call is simply over.
    pub fn on_join_failed(&mut self, error: CallError) -> Vec<GroupAction> {
        if self.state != GroupCallState::Connecting {
            return vec![];
        }
        warn!(error = %error, "group call join rejected");
        self.teardown(CallEndCause::Error(error), false)
    }

    /// `group-call:join` succeeded; `roster` is everyone already present
    /// (ourselves included).
    pub fn on_joined(&mut self, roster: &[ParticipantInfo]) -> Vec<GroupAction> {
        if self.state != GroupCallState::Connecting || self.joined {
            return vec![];
        }
        let Some(call_id) = self.call_id else { return vec![] };
        self.joined = true;

        for member in roster {
            if member.user_id != self.local_user {
                self.seat(member.user_id, &member.user_name);
            }
        }

        info!(
            call = %call_id.short(),
            participants = self.participants.len(),
            "joined group call"
        );

        let mut actions = vec![GroupAction::SaveSession(self.session_record(call_id))];
        actions.extend(self.try_activate());
        actions
    }

    /// Async media acquisition finished.  Duplicate completions for a
    /// generation whose tracks are already attached must be stopped, not
    /// silently dropped.
    pub fn on_media_acquired(&mut self, generation: u64) -> Vec<GroupAction> {
        if generation != self.media_generation
            || self.media_ready
            || matches!(self.state, GroupCallState::Ended | GroupCallState::Incoming)
        {
            debug!(generation, "discarding stale media acquisition");
            return vec![GroupAction::DiscardStaleMedia { generation }];
        }
        self.media_ready = true;
        self.try_activate()
    }

    /// Async media acquisition failed.
    pub fn on_media_failed(&mut self, generation: u64, reason: String) -> Vec<GroupAction> {
        if generation != self.media_generation || self.state == GroupCallState::Ended {
            return vec![];
        }
        self.teardown(
            CallEndCause::Error(CallError::MediaAcquisitionFailed { reason }),
            true,
        )
    }

    /// `Connecting -> Active` once both the registry join and local media are
    /// in.  This transition is the at-most-once guard for the relay connect:
    /// it can only fire from `Connecting`.
    fn try_activate(&mut self) -> Vec<GroupAction> {
        if self.state != GroupCallState::Connecting || !self.joined || !self.media_ready {
            return vec![];
        }
        self.state = GroupCallState::Active;
        info!("group call active, connecting relay");
        vec![GroupAction::ConnectRelay]
    }

    /// Leave voluntarily.
    pub fn leave(&mut self) -> Vec<GroupAction> {
        if matches!(self.state, GroupCallState::Ended) {
            return vec![];
        }
        if self.state == GroupCallState::Incoming {
            return self.decline();
        }
        self.teardown(CallEndCause::Hangup, true)
    }

    /// Registry broadcast: the whole call ended.
    pub fn on_call_ended(&mut self, call_id: CallId, reason: EndReason) -> Vec<GroupAction> {
        if self.call_id != Some(call_id) || self.state == GroupCallState::Ended {
            return vec![];
        }
        let mut actions = Vec::new();
        if self.state == GroupCallState::Incoming {
            actions.push(GroupAction::StopRinging);
        }
        actions.extend(self.teardown(CallEndCause::Registry(reason), false));
        actions
    }

    // -- roster and slots -----------------------------------------------------

    /// Registry broadcast: someone joined.
    pub fn on_participant_joined(&mut self, user: UserId, user_name: &str) -> Vec<GroupAction> {
        if self.state == GroupCallState::Ended || user == self.local_user {
            return vec![];
        }
        if self.participants.contains_key(&user) {
            return vec![];
        }
        self.seat(user, user_name);
        debug!(user = %user.short(), slot = self.slot_of(&user), "participant seated");

        // Their stream and mapping may both have raced ahead of this event.
        let ready = self
            .pending_mappings
            .iter()
            .find(|(stream_id, owner)| {
                **owner == user && self.pending_streams.contains(stream_id)
            })
            .map(|(stream_id, _)| stream_id.clone());
        if let Some(stream_id) = ready {
            self.pending_mappings.remove(&stream_id);
            self.pending_streams.retain(|s| *s != stream_id);
            return self.attach(user, stream_id);
        }
        vec![]
    }

    /// Registry broadcast: someone left.  Their slot frees, everyone else
    /// stays exactly where they were.
    pub fn on_participant_left(
        &mut self,
        user: UserId,
        call_ended: bool,
        now: Instant,
    ) -> Vec<GroupAction> {
        if self.state == GroupCallState::Ended {
            return vec![];
        }

        let mut actions = Vec::new();
        if let Some(gone) = self.participants.remove(&user) {
            if let Some(slot) = self.slots.get_mut(gone.slot) {
                *slot = None;
            }
            if let Some(stream_id) = gone.attached_stream {
                actions.push(GroupAction::DetachStream { user_id: user, stream_id });
            }
            self.pending_mappings.retain(|_, owner| *owner != user);
            self.quality.forget(&user);
            if self.pinned == Some(user) {
                self.pinned = None;
            }
            // If they were on stage, the stage is empty until re-detected.
            self.speaker.reset_if(&user);
            actions.extend(self.restage(now));
        }

        if call_ended {
            actions.extend(self.teardown(CallEndCause::RemoteLeft, false));
        }
        actions
    }

    fn seat(&mut self, user: UserId, user_name: &str) {
        let slot = match self.slots.iter().position(Option::is_none) {
            Some(free) => {
                self.slots[free] = Some(user);
                free
            }
            None => {
                self.slots.push(Some(user));
                self.slots.len() - 1
            }
        };
        self.participants.insert(
            user,
            RemoteParticipant { user_name: user_name.to_string(), slot, attached_stream: None },
        );
    }

    // -- stream identity pairing ----------------------------------------------

    /// The relay produced our published stream id; announce it so the other
    /// participants can map it to us.
    pub fn on_published(&mut self, stream_id: StreamId) -> Vec<GroupAction> {
        if self.state != GroupCallState::Active {
            return vec![];
        }
        let Some(call_id) = self.call_id else { return vec![] };
        vec![GroupAction::SendCommand(ClientCommand::SfuStream { call_id, stream_id })]
    }

    /// An inbound relay stream appeared.  Attach if its owner is already
    /// known, otherwise hold it until the mapping arrives.
    pub fn on_stream_added(&mut self, stream_id: StreamId) -> Vec<GroupAction> {
        if self.state != GroupCallState::Active {
            return vec![];
        }
        if let Some(user) = self.pending_mappings.remove(&stream_id) {
            return self.attach(user, stream_id);
        }
        debug!(stream = %stream_id, "buffering unmapped stream");
        self.pending_streams.push(stream_id);
        vec![]
    }

    /// A stream-identity mapping arrived (server-relayed `sfu-stream`).
    /// Attach if the stream is already here, otherwise hold the mapping.
    pub fn on_stream_mapped(&mut self, user: UserId, stream_id: StreamId) -> Vec<GroupAction> {
        if self.state != GroupCallState::Active || user == self.local_user {
            return vec![];
        }
        if let Some(idx) = self.pending_streams.iter().position(|s| *s == stream_id) {
            let stream_id = self.pending_streams.remove(idx);
            return self.attach(user, stream_id);
        }
        debug!(user = %user.short(), stream = %stream_id, "buffering mapping without stream");
        self.pending_mappings.insert(stream_id, user);
        vec![]
    }

    /// The relay dropped a remote stream.
    pub fn on_stream_removed(&mut self, stream_id: StreamId) -> Vec<GroupAction> {
        self.pending_streams.retain(|s| *s != stream_id);
        self.pending_mappings.remove(&stream_id);

        for (user, participant) in &mut self.participants {
            if participant.attached_stream.as_ref() == Some(&stream_id) {
                participant.attached_stream = None;
                return vec![GroupAction::DetachStream { user_id: *user, stream_id }];
            }
        }
        vec![]
    }

    fn attach(&mut self, user: UserId, stream_id: StreamId) -> Vec<GroupAction> {
        let Some(participant) = self.participants.get_mut(&user) else {
            // Mapping for someone we have not seen join yet; re-buffer both
            // halves until the join event seats them.
            self.pending_streams.push(stream_id.clone());
            self.pending_mappings.insert(stream_id, user);
            return vec![];
        };
        participant.attached_stream = Some(stream_id.clone());
        info!(user = %user.short(), stream = %stream_id, "remote stream attached");
        vec![GroupAction::AttachStream { user_id: user, stream_id }]
    }

    // -- stage, speaker, quality ------------------------------------------------

    /// Pin a participant to the stage (or clear with `None`).  A pin always
    /// beats the active speaker.
    pub fn pin(&mut self, user: Option<UserId>, now: Instant) -> Vec<GroupAction> {
        if let Some(user) = user {
            if !self.participants.contains_key(&user) {
                return vec![];
            }
        }
        self.pinned = user;
        self.restage(now)
    }

    /// Periodic audio-level sample from the relay, keyed by stream id.
    pub fn on_audio_levels(
        &mut self,
        levels: &[(StreamId, f32)],
        now: Instant,
    ) -> Vec<GroupAction> {
        if self.state != GroupCallState::Active {
            return vec![];
        }

        let by_user: Vec<(UserId, f32)> = levels
            .iter()
            .filter_map(|(stream_id, level)| {
                self.participants
                    .iter()
                    .find(|(_, p)| p.attached_stream.as_ref() == Some(stream_id))
                    .map(|(user, _)| (*user, *level))
            })
            .collect();

        self.speaker.on_levels(&by_user, now);
        self.restage(now)
    }

    /// Re-derive desired layers from the current stage and emit whatever
    /// requests clear the debounce.
    fn restage(&mut self, now: Instant) -> Vec<GroupAction> {
        if self.state != GroupCallState::Active {
            return vec![];
        }
        let stage = self.on_stage();
        for user in self.participants.keys() {
            let layer =
                if Some(*user) == stage { QualityLayer::High } else { QualityLayer::Low };
            self.quality.desire(*user, layer);
        }
        self.quality
            .poll(now)
            .into_iter()
            .map(|QualityRequest { target, layer }| GroupAction::RequestQuality { target, layer })
            .collect()
    }

    // -- relay lifecycle ----------------------------------------------------------

    /// Any unrecoverable relay-transport error ends the entire call for this
    /// client.  No reconnection, no degraded mode: notify the registry and
    /// reset cleanly.
    pub fn on_relay_failed(&mut self, reason: String) -> Vec<GroupAction> {
        if self.state != GroupCallState::Active && self.state != GroupCallState::Connecting {
            return vec![];
        }
        warn!(reason = %reason, "relay transport failed, ending group call");
        self.teardown(
            CallEndCause::Error(CallError::RelayTransportFailed { reason }),
            true,
        )
    }

    // -- internals ---------------------------------------------------------------

    fn session_record(&self, call_id: CallId) -> PersistedSession {
        PersistedSession {
            call_id,
            chat_id: self.chat_id,
            media_kind: self.media_kind,
            is_group: true,
            started_at: Utc::now(),
        }
    }

    /// Every path to `Ended` releases media, disconnects the relay and clears
    /// the persisted session.  `notify_registry` sends the leave command for
    /// locally-initiated terminations.
    fn teardown(&mut self, cause: CallEndCause, notify_registry: bool) -> Vec<GroupAction> {
        info!(?cause, "group call ended");
        self.state = GroupCallState::Ended;
        self.media_generation += 1;
        self.participants.clear();
        self.slots.clear();
        self.pending_streams.clear();
        self.pending_mappings.clear();
        self.pinned = None;

        let mut actions = Vec::new();
        if notify_registry {
            if let Some(call_id) = self.call_id {
                actions.push(GroupAction::SendCommand(ClientCommand::CallLeave { call_id }));
            }
        }
        actions.push(GroupAction::DisconnectRelay);
        actions.push(GroupAction::ReleaseMedia);
        actions.push(GroupAction::ClearSession);
        actions.push(GroupAction::Ended { cause });
        actions
    }
}
