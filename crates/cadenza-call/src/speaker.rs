//! Active-speaker selection from periodic audio-level samples.
//!
//! The loudest participant above a fixed threshold becomes the active
//! speaker.  Demotion on silence is delayed by a hold-down so the stage does
//! not flicker between words.  A manual pin is handled one level up (the
//! orchestrator never consults the tracker while a pin is set), but the
//! tracker keeps running so the stage is correct the moment the pin clears.

use std::time::{Duration, Instant};

use tracing::debug;

use cadenza_shared::constants::{SPEAKER_HOLD_MS, SPEAKER_THRESHOLD};
use cadenza_shared::types::UserId;

pub struct SpeakerTracker {
    threshold: f32,
    hold: Duration,
    current: Option<UserId>,
    /// Last instant the current speaker was heard above the threshold.
    last_heard: Option<Instant>,
}

impl SpeakerTracker {
    pub fn new(threshold: f32, hold: Duration) -> Self {
        Self { threshold, hold, current: None, last_heard: None }
    }

    pub fn current(&self) -> Option<UserId> {
        self.current
    }

    /// Feed one sampling round.  Returns `Some(new_value)` when the active
    /// speaker changed, `None` otherwise.
    pub fn on_levels(&mut self, levels: &[(UserId, f32)], now: Instant) -> Option<Option<UserId>> {
        let loudest = levels
            .iter()
            .filter(|(_, level)| *level >= self.threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(user, _)| *user);

        match (self.current, loudest) {
            // Someone audible: they take (or keep) the stage immediately.
            (_, Some(user)) => {
                self.last_heard = Some(now);
                if self.current != Some(user) {
                    debug!(user = %user.short(), "active speaker promoted");
                    self.current = Some(user);
                    return Some(self.current);
                }
                None
            }
            // Silence with a current speaker: demote only after the hold-down.
            (Some(_), None) => {
                let expired = self
                    .last_heard
                    .map_or(true, |at| now.duration_since(at) >= self.hold);
                if expired {
                    debug!("active speaker demoted after hold-down");
                    self.current = None;
                    self.last_heard = None;
                    return Some(None);
                }
                None
            }
            (None, None) => None,
        }
    }

    /// Drop the speaker immediately (e.g. they left the call).
    pub fn reset_if(&mut self, user: &UserId) -> bool {
        if self.current == Some(*user) {
            self.current = None;
            self.last_heard = None;
            return true;
        }
        false
    }
}

impl Default for SpeakerTracker {
    fn default() -> Self {
        Self::new(SPEAKER_THRESHOLD, Duration::from_millis(SPEAKER_HOLD_MS))
    }
}
