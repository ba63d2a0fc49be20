//! Signaling flood protection.
//!
//! Two independent limiters guard the registry boundary:
//! - [`EventLimiter`]: fixed window per `(user, event-name)` key, applied to
//!   every command a connection handler admits.
//! - [`BucketLimiter`]: generalized `(window, max)` counter keyed by an
//!   arbitrary string (remote address), applied at socket accept time.
//!
//! Rejection is immediate and silent -- the caller decides whether to log.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use cadenza_shared::types::UserId;

#[derive(Debug, Clone, Copy)]
struct WindowSlot {
    window_start: Instant,
    count: u32,
}

struct EventLimiterState {
    slots: HashMap<(UserId, &'static str), WindowSlot>,
    next_sweep: Instant,
}

/// Fixed-window counter per `(user, event-name)`.
///
/// Expired slots are swept lazily on `take`, so memory is bounded by the
/// number of distinct keys touched within one sweep interval rather than by
/// total request volume.
#[derive(Clone)]
pub struct EventLimiter {
    state: Arc<Mutex<EventLimiterState>>,
    window: Duration,
    max: u32,
    sweep_interval: Duration,
}

impl EventLimiter {
    pub fn new(window: Duration, max: u32) -> Self {
        let sweep_interval = window.max(Duration::from_secs(10));
        Self {
            state: Arc::new(Mutex::new(EventLimiterState {
                slots: HashMap::new(),
                next_sweep: Instant::now() + sweep_interval,
            })),
            window,
            max,
            sweep_interval,
        }
    }

    /// Admit or reject one event.  A rejection does not mutate the counter
    /// beyond the increment that crossed the limit.
    pub async fn take(&self, user: UserId, event: &'static str) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        if now >= state.next_sweep {
            let window = self.window;
            state
                .slots
                .retain(|_, slot| now.duration_since(slot.window_start) < window);
            state.next_sweep = now + self.sweep_interval;
        }

        let slot = state
            .slots
            .entry((user, event))
            .or_insert(WindowSlot { window_start: now, count: 0 });

        if now.duration_since(slot.window_start) >= self.window {
            slot.window_start = now;
            slot.count = 0;
        }

        if slot.count >= self.max {
            return false;
        }

        slot.count += 1;
        true
    }

    #[cfg(test)]
    async fn key_count(&self) -> usize {
        self.state.lock().await.slots.len()
    }
}

impl Default for EventLimiter {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(cadenza_shared::constants::EVENT_RATE_WINDOW_MS),
            cadenza_shared::constants::EVENT_RATE_MAX,
        )
    }
}

/// Evict expired buckets every this many `take` calls.
const BUCKET_SWEEP_EVERY: u64 = 64;

struct BucketLimiterState {
    buckets: HashMap<String, WindowSlot>,
    calls: u64,
}

/// Generalized `(window, max)` bucket keyed by an arbitrary string.
///
/// Eviction of expired buckets is opportunistic -- every Nth call rather than
/// on a timer -- trading slightly stale memory for not needing a background
/// scheduler.  A periodic `purge_stale` is still available for long-idle
/// deployments.
#[derive(Clone)]
pub struct BucketLimiter {
    state: Arc<Mutex<BucketLimiterState>>,
    window: Duration,
    max: u32,
}

impl BucketLimiter {
    pub fn new(window: Duration, max: u32) -> Self {
        Self {
            state: Arc::new(Mutex::new(BucketLimiterState {
                buckets: HashMap::new(),
                calls: 0,
            })),
            window,
            max,
        }
    }

    pub async fn take(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut state = self.state.lock().await;

        state.calls += 1;
        if state.calls % BUCKET_SWEEP_EVERY == 0 {
            let window = self.window;
            state
                .buckets
                .retain(|_, slot| now.duration_since(slot.window_start) < window);
        }

        let slot = state
            .buckets
            .entry(key.to_string())
            .or_insert(WindowSlot { window_start: now, count: 0 });

        if now.duration_since(slot.window_start) >= self.window {
            slot.window_start = now;
            slot.count = 0;
        }

        if slot.count >= self.max {
            return false;
        }

        slot.count += 1;
        true
    }

    /// Drop every bucket whose window expired at least `max_idle` ago.
    pub async fn purge_stale(&self, max_idle: Duration) {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state
            .buckets
            .retain(|_, slot| now.duration_since(slot.window_start) < self.window + max_idle);
    }

    pub async fn bucket_count(&self) -> usize {
        self.state.lock().await.buckets.len()
    }
}

impl Default for BucketLimiter {
    fn default() -> Self {
        // 20 transport-level operations per second per remote address.
        Self::new(Duration::from_secs(1), 20)
    }
}
