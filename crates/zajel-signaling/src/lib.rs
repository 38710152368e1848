//! # zajel-signaling
//!
//! The WebSocket-framed channel between a client and a coordinator
//! (`spec.md` §4.2): the closed set of message shapes exchanged over it,
//! and a [`client::SignalingClient`] that owns the socket, keepalive, and
//! reconnect-with-backoff.
//!
//! ## Modules
//!
//! - [`messages`] — `ClientMessage`/`ServerMessage`, the full closed set
//! - `client` — connection lifecycle, ping/pong keepalive, exponential
//!   backoff reconnect with re-registration

pub mod client;
pub mod messages;

pub use messages::{ClientMessage, ServerMessage};

/// One JSON object per WebSocket text frame; frames over this size are a
/// fatal protocol violation (`spec.md` §4.2).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Send a `ping` this often while connected (`spec.md` §4.2).
pub const KEEPALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(27);

/// Reconnect if no inbound frame arrives within this many keepalive
/// intervals (`spec.md` §4.2: "absence of any inbound for 2 intervals").
pub const KEEPALIVE_MISSED_INTERVALS: u32 = 2;

/// Reconnect backoff floor (`spec.md` §5 "Timeouts").
pub const RECONNECT_BASE_DELAY: std::time::Duration = std::time::Duration::from_secs(1);

/// Reconnect backoff ceiling (`spec.md` §5 "Timeouts").
pub const RECONNECT_MAX_DELAY: std::time::Duration = std::time::Duration::from_secs(30);

/// Signaling connection state, as observed by higher layers (`spec.md`
/// §4.2: "State transitions exposed as `{Disconnected, Connecting,
/// Connected, Failed}`").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("websocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("signaling connection is closed")]
    Closed,

    #[error("frame of {size} bytes exceeds the {max} byte ceiling")]
    FrameTooLarge { size: usize, max: usize },

    #[error("malformed signaling message: {0}")]
    Malformed(String),

    #[error("invalid pairing code: {0}")]
    InvalidPairingCode(String),

    #[error("signaling operation timed out")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, SignalingError>;

/// Exponential backoff with full jitter, floor [`RECONNECT_BASE_DELAY`],
/// ceiling [`RECONNECT_MAX_DELAY`] (`spec.md` §4.2 "Reconnection").
pub fn backoff_delay(attempt: u32) -> std::time::Duration {
    let exp = RECONNECT_BASE_DELAY.as_millis().saturating_mul(1u128 << attempt.min(8));
    let capped = exp.min(RECONNECT_MAX_DELAY.as_millis());
    let jittered = rand::Rng::gen_range(&mut rand::thread_rng(), (capped / 2).max(1)..=capped);
    std::time::Duration::from_millis(jittered as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_is_capped() {
        for attempt in 0..20 {
            let d = backoff_delay(attempt);
            assert!(d <= RECONNECT_MAX_DELAY);
            assert!(d.as_millis() >= 1);
        }
    }

    #[test]
    fn backoff_first_attempt_is_near_base() {
        let d = backoff_delay(0);
        assert!(d <= RECONNECT_BASE_DELAY);
    }
}
