//! Signal transport: one WebSocket per connected client.
//!
//! Each socket is split into a reader task (decodes [`ClientFrame`]s and
//! dispatches them into the registry) and a writer task (drains the user's
//! outbound queue).  The [`TransportHub`] maps connected users to their
//! outbound queues; everything above it (registry fan-out) is
//! transport-agnostic, which is also what makes the registry testable without
//! sockets.
//!
//! Ordering: one writer task per socket drains one mpsc queue, so frames for
//! a given recipient are delivered in enqueue order.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use cadenza_shared::error::CallError;
use cadenza_shared::protocol::{ClientCommand, ClientFrame, ServerFrame};
use cadenza_shared::types::UserId;

use crate::registry::CallRegistry;

/// Outbound queue depth per connection. A client that cannot drain this many
/// frames is effectively gone; further frames are dropped.
const OUTBOUND_QUEUE: usize = 256;

/// Connected users and their outbound queues.
#[derive(Clone, Default)]
pub struct TransportHub {
    senders: Arc<RwLock<HashMap<UserId, mpsc::Sender<ServerFrame>>>>,
}

impl TransportHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user's connection. Returns the receiving half the writer
    /// task drains. A reconnect replaces the previous queue; the stale writer
    /// task sees its receiver close and exits.
    pub async fn register(&self, user: UserId) -> mpsc::Receiver<ServerFrame> {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        if self.senders.write().await.insert(user, tx).is_some() {
            debug!(user = %user.short(), "replaced existing transport registration");
        }
        rx
    }

    pub async fn unregister(&self, user: &UserId) {
        self.senders.write().await.remove(user);
    }

    /// Queue a frame for one user. Slow or vanished recipients lose frames;
    /// signaling is fire-and-forget from the registry's perspective.
    pub async fn send(&self, user: &UserId, frame: ServerFrame) {
        let senders = self.senders.read().await;
        let Some(tx) = senders.get(user) else {
            debug!(user = %user.short(), "dropping frame for disconnected user");
            return;
        };

        if tx.try_send(frame).is_err() {
            debug!(user = %user.short(), "dropping frame for slow client");
        }
    }

    pub async fn is_connected(&self, user: &UserId) -> bool {
        self.senders.read().await.contains_key(user)
    }

    pub async fn connected_count(&self) -> usize {
        self.senders.read().await.len()
    }
}

/// Drive one accepted WebSocket until it closes, then sweep the user out of
/// every call they were in.
pub async fn run_connection(
    socket: WebSocket,
    user: UserId,
    user_name: String,
    registry: Arc<CallRegistry>,
) {
    info!(user = %user.short(), name = %user_name, "signal transport connected");

    let mut outbound = registry.hub().register(user).await;
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer half: single task per socket preserves per-recipient ordering.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let json = match frame.to_json() {
                Ok(json) => json,
                Err(e) => {
                    warn!(error = %e, "failed to encode server frame");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    // Reader half: dispatch frames in arrival order.
    while let Some(msg) = ws_rx.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                debug!(user = %user.short(), error = %e, "socket error");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                let frame = match ClientFrame::from_json(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(user = %user.short(), error = %e, "unparseable client frame");
                        continue;
                    }
                };
                dispatch(&registry, user, &user_name, frame).await;
            }
            Message::Close(_) => break,
            // Pings are answered by axum automatically; binary is not part
            // of the protocol.
            _ => {}
        }
    }

    registry.hub().unregister(&user).await;
    writer.abort();

    // Disconnect sweep: the user leaves every call they were still in.
    let left = registry.leave_all(user).await;
    for (call_id, call_ended) in &left {
        debug!(
            user = %user.short(),
            call = %call_id.short(),
            call_ended,
            "left call on disconnect"
        );
    }

    info!(user = %user.short(), "signal transport disconnected");
}

/// Admit one command through the event limiter and into the registry, then
/// queue the correlated reply.
async fn dispatch(registry: &CallRegistry, user: UserId, user_name: &str, frame: ClientFrame) {
    let event = frame.command.kind_name();

    if !registry.event_limiter().take(user, event).await {
        // Fire-and-forget signals are dropped silently; command/response
        // pairs get an explicit RateLimited so the caller stops retrying.
        if matches!(frame.command, ClientCommand::CallSignal { .. }) {
            debug!(user = %user.short(), event, "rate limited signal dropped");
            return;
        }
        let reply = ServerFrame::Reply { seq: frame.seq, result: Err(CallError::RateLimited) };
        registry.hub().send(&user, reply).await;
        return;
    }

    let result = registry.handle_command(user, user_name, frame.command).await;

    let reply = ServerFrame::Reply { seq: frame.seq, result };
    registry.hub().send(&user, reply).await;
}
