//! Local media ownership.
//!
//! The native capture stack is a collaborator; this module owns the
//! bookkeeping around it: which acquisition is current, and the guarantee
//! that "stop the camera" is synchronous and total.  State machines tag each
//! acquisition with a generation ([`MediaSession::begin`]); completions for
//! any other generation are stopped on the spot instead of attached, which is
//! what makes declining a call mid-prompt safe.

use tracing::{debug, info};

use cadenza_shared::types::MediaKind;

/// Handle to acquired capture tracks.  `stop` must synchronously release the
/// device (indicator lights off), not merely detach.
pub trait MediaTracks: Send {
    fn stop(&mut self);
    fn kind(&self) -> MediaKind;
}

/// At most one live acquisition, guarded by a generation counter.
#[derive(Default)]
pub struct MediaSession {
    generation: u64,
    active: Option<Box<dyn MediaTracks>>,
}

impl MediaSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new acquisition attempt.  Any previously acquired tracks are
    /// stopped first; the returned generation tags the async task.
    pub fn begin(&mut self, kind: MediaKind) -> u64 {
        self.release();
        self.generation += 1;
        debug!(generation = self.generation, ?kind, "media acquisition started");
        self.generation
    }

    /// An acquisition task completed.  Returns `true` when the tracks were
    /// attached; stale completions are stopped immediately and reported as
    /// `false`.
    pub fn complete(&mut self, generation: u64, mut tracks: Box<dyn MediaTracks>) -> bool {
        if generation != self.generation || self.active.is_some() {
            info!(generation, "stopping stale media acquisition");
            tracks.stop();
            return false;
        }
        self.active = Some(tracks);
        true
    }

    /// Invalidate any in-flight acquisition without touching attached tracks.
    /// Its completion will arrive with a stale generation and be stopped.
    pub fn invalidate_pending(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }

    /// Hard-stop and drop the attached tracks, and invalidate anything still
    /// in flight.
    pub fn release(&mut self) {
        self.generation += 1;
        if let Some(mut tracks) = self.active.take() {
            info!(kind = ?tracks.kind(), "releasing local media");
            tracks.stop();
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }
}

impl Drop for MediaSession {
    fn drop(&mut self) {
        // Component teardown is one of the abnormal paths that must still
        // turn the camera off.
        self.release();
    }
}
