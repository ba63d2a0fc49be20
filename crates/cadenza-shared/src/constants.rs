/// Protocol version string advertised on the signaling socket.
pub const PROTOCOL_VERSION: &str = "/cadenza/1.0.0";

/// Application name
pub const APP_NAME: &str = "Cadenza";

/// A persisted session record older than this is discarded on load instead of
/// being auto-rejoined.
pub const SESSION_STALENESS_SECS: i64 = 2 * 60 * 60;

/// Grace period after a direct call reports `disconnected` before an ICE
/// restart is attempted.
pub const RECONNECT_GRACE_MS: u64 = 5_000;

/// Direct calls attempt at most this many ICE restarts before giving up.
pub const MAX_ICE_RESTARTS: u32 = 1;

/// Minimum interval between quality-layer requests for the same participant.
pub const QUALITY_DEBOUNCE_MS: u64 = 500;

/// Fixed window for the per-(user, event) signaling rate limiter.
pub const EVENT_RATE_WINDOW_MS: u64 = 1_000;

/// Signaling events admitted per user per event name within one window.
pub const EVENT_RATE_MAX: u32 = 30;

/// Audio level (0.0..=1.0) a participant must exceed to be promoted to
/// active speaker.
pub const SPEAKER_THRESHOLD: f32 = 0.15;

/// How long a silent active speaker keeps the slot before being demoted.
pub const SPEAKER_HOLD_MS: u64 = 2_000;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Public STUN fallback used when `/webrtc/config` is unreachable.
pub const FALLBACK_STUN_URL: &str = "stun:stun.l.google.com:19302";
