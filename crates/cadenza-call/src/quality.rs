//! Simulcast layer selection with per-target debouncing.
//!
//! The orchestrator declares which layer it wants for every remote
//! participant (high for whoever is on stage, low for the rest); the
//! controller turns that into the minimal request stream: a request is issued
//! only when the desired layer differs from the last issued one, and at most
//! once per debounce interval per target, so jittery speaker changes cannot
//! oscillate the relay.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use cadenza_shared::constants::QUALITY_DEBOUNCE_MS;
use cadenza_shared::types::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualityLayer {
    Low,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityRequest {
    pub target: UserId,
    pub layer: QualityLayer,
}

struct TargetState {
    desired: QualityLayer,
    issued: Option<QualityLayer>,
    last_issued_at: Option<Instant>,
}

pub struct QualityController {
    debounce: Duration,
    targets: HashMap<UserId, TargetState>,
}

impl QualityController {
    pub fn new(debounce: Duration) -> Self {
        Self { debounce, targets: HashMap::new() }
    }

    /// Declare the layer we want for `target`. Takes effect via [`poll`].
    ///
    /// [`poll`]: QualityController::poll
    pub fn desire(&mut self, target: UserId, layer: QualityLayer) {
        self.targets
            .entry(target)
            .or_insert(TargetState { desired: layer, issued: None, last_issued_at: None })
            .desired = layer;
    }

    /// Stop tracking a departed participant.
    pub fn forget(&mut self, target: &UserId) {
        self.targets.remove(target);
    }

    /// Requests due now: desired differs from issued and the target's
    /// debounce interval has elapsed.  Issuing is recorded, so calling twice
    /// returns nothing the second time.
    pub fn poll(&mut self, now: Instant) -> Vec<QualityRequest> {
        let mut due = Vec::new();
        for (target, state) in &mut self.targets {
            if state.issued == Some(state.desired) {
                continue;
            }
            let debounced = state
                .last_issued_at
                .map_or(false, |at| now.duration_since(at) < self.debounce);
            if debounced {
                continue;
            }
            state.issued = Some(state.desired);
            state.last_issued_at = Some(now);
            due.push(QualityRequest { target: *target, layer: state.desired });
        }
        due
    }
}

impl Default for QualityController {
    fn default() -> Self {
        Self::new(Duration::from_millis(QUALITY_DEBOUNCE_MS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_desire_is_issued_immediately() {
        let mut controller = QualityController::new(Duration::from_millis(100));
        let user = UserId::new();
        let t0 = Instant::now();

        controller.desire(user, QualityLayer::High);
        assert_eq!(
            controller.poll(t0),
            vec![QualityRequest { target: user, layer: QualityLayer::High }]
        );

        // Unchanged desire: nothing further.
        assert!(controller.poll(t0 + Duration::from_millis(200)).is_empty());
    }

    #[test]
    fn change_inside_debounce_window_is_deferred() {
        let mut controller = QualityController::new(Duration::from_millis(100));
        let user = UserId::new();
        let t0 = Instant::now();

        controller.desire(user, QualityLayer::High);
        controller.poll(t0);

        controller.desire(user, QualityLayer::Low);
        assert!(controller.poll(t0 + Duration::from_millis(50)).is_empty());

        assert_eq!(
            controller.poll(t0 + Duration::from_millis(120)),
            vec![QualityRequest { target: user, layer: QualityLayer::Low }]
        );
    }

    #[test]
    fn oscillation_inside_window_collapses_to_no_request() {
        let mut controller = QualityController::new(Duration::from_millis(100));
        let user = UserId::new();
        let t0 = Instant::now();

        controller.desire(user, QualityLayer::High);
        controller.poll(t0);

        // Flaps back and forth, settling on the already-issued layer.
        controller.desire(user, QualityLayer::Low);
        controller.desire(user, QualityLayer::High);

        assert!(controller.poll(t0 + Duration::from_millis(200)).is_empty());
    }

    #[test]
    fn targets_are_debounced_independently() {
        let mut controller = QualityController::new(Duration::from_millis(100));
        let a = UserId::new();
        let b = UserId::new();
        let t0 = Instant::now();

        controller.desire(a, QualityLayer::High);
        controller.poll(t0);

        controller.desire(a, QualityLayer::Low);
        controller.desire(b, QualityLayer::Low);

        // `a` is still debounced; `b` has never been issued.
        let due = controller.poll(t0 + Duration::from_millis(10));
        assert_eq!(due, vec![QualityRequest { target: b, layer: QualityLayer::Low }]);
    }

    #[test]
    fn forgotten_target_is_never_requested() {
        let mut controller = QualityController::new(Duration::from_millis(100));
        let user = UserId::new();

        controller.desire(user, QualityLayer::High);
        controller.forget(&user);
        assert!(controller.poll(Instant::now()).is_empty());
    }
}
