//! Client-side media relay (SFU) connection.
//!
//! The relay itself is an external collaborator; the core only needs its
//! publish/subscribe contract and lifecycle events.  [`RelaySession`] wraps a
//! [`RelayClient`] implementation and guards the connect-and-publish path so
//! it happens at most once per call, no matter how many times the embedder
//! re-enters it.

use thiserror::Error;
use tracing::{info, warn};

use cadenza_shared::types::{CallId, StreamId};

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("relay connection error: {0}")]
    Connection(String),

    #[error("not connected to relay")]
    NotConnected,

    #[error("relay publish error: {0}")]
    Publish(String),
}

/// State of the relay connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    Disconnected,
    Connecting,
    Connected,
    Published,
    Failed,
    Closed,
}

/// Lifecycle and stream events emitted by the relay transport.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Connected,
    /// Our published stream was assigned this relay id.
    Published { stream_id: StreamId },
    /// A remote stream became available for subscription.
    StreamAdded { stream_id: StreamId },
    StreamRemoved { stream_id: StreamId },
    /// Periodic audio-level sample per remote stream, 0.0..=1.0.
    AudioLevels { levels: Vec<(StreamId, f32)> },
    Failed { reason: String },
    Closed,
}

/// The relay transport contract the session drives.
#[allow(async_fn_in_trait)]
pub trait RelayClient: Send {
    async fn connect(&mut self, url: &str, token: &str) -> Result<(), RelayError>;
    /// Publish the local media and return the relay-assigned stream id.
    async fn publish(&mut self) -> Result<StreamId, RelayError>;
    async fn disconnect(&mut self);
}

/// One relay connection per group call, connected and published at most once.
pub struct RelaySession<C: RelayClient> {
    call_id: CallId,
    client: C,
    phase: RelayPhase,
    published: Option<StreamId>,
}

impl<C: RelayClient> RelaySession<C> {
    pub fn new(call_id: CallId, client: C) -> Self {
        Self { call_id, client, phase: RelayPhase::Disconnected, published: None }
    }

    pub fn phase(&self) -> RelayPhase {
        self.phase
    }

    pub fn published_stream(&self) -> Option<&StreamId> {
        self.published.as_ref()
    }

    /// Connect to the relay and publish local media.  Safe to call from
    /// racing entry points: only the first call does work, every later call
    /// returns the already-published stream id.
    pub async fn connect_and_publish(
        &mut self,
        url: &str,
        token: &str,
    ) -> Result<StreamId, RelayError> {
        match self.phase {
            RelayPhase::Disconnected => {}
            RelayPhase::Published => {
                if let Some(stream_id) = &self.published {
                    return Ok(stream_id.clone());
                }
                return Err(RelayError::NotConnected);
            }
            RelayPhase::Connecting | RelayPhase::Connected => {
                // A racing caller is mid-connect; this is the re-entry the
                // guard exists for.
                warn!(call = %self.call_id.short(), "connect_and_publish re-entered");
                return Err(RelayError::NotConnected);
            }
            RelayPhase::Failed | RelayPhase::Closed => {
                return Err(RelayError::Connection("relay transport is gone".into()));
            }
        }

        self.phase = RelayPhase::Connecting;
        info!(call = %self.call_id.short(), url, "connecting to relay");

        if let Err(e) = self.client.connect(url, token).await {
            self.phase = RelayPhase::Failed;
            return Err(e);
        }
        self.phase = RelayPhase::Connected;

        let stream_id = match self.client.publish().await {
            Ok(stream_id) => stream_id,
            Err(e) => {
                self.phase = RelayPhase::Failed;
                return Err(e);
            }
        };
        self.phase = RelayPhase::Published;
        self.published = Some(stream_id.clone());

        info!(call = %self.call_id.short(), stream = %stream_id, "published local media");
        Ok(stream_id)
    }

    /// The relay reported failed/closed.  Group calls treat this as fatal.
    pub fn mark_failed(&mut self) {
        self.phase = RelayPhase::Failed;
    }

    pub async fn disconnect(&mut self) {
        if self.phase == RelayPhase::Disconnected {
            return;
        }
        info!(call = %self.call_id.short(), "disconnecting from relay");
        self.client.disconnect().await;
        self.phase = RelayPhase::Closed;
        self.published = None;
    }
}
