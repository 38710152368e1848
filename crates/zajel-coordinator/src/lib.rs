//! # zajel-coordinator
//!
//! The untrusted-for-content rendezvous broker (`spec.md` §4.7): a
//! stateless-per-shard HTTP + WebSocket service that forwards signaling
//! between paired clients and maintains four transient, single-writer
//! registries (pairing, relay, rendezvous, chunk distribution).
//!
//! This codebase's daemon (`zajel-client`) has no server-side counterpart
//! of this shape — it is a DHT-routed peer, not a broker. This crate is
//! new, grounded in this retrieval pack's other axum + WebSocket +
//! `DashMap` signaling-relay code for its idiom (tagged-enum JSON framing
//! over one upgraded socket, a per-connection `mpsc` forwarding task,
//! shared `DashMap` registries, periodic `tokio::spawn` GC loops), while
//! every registry shape, TTL, and eviction policy follows `spec.md`
//! §3/§4.7 exactly. The wire message shapes are shared with clients via
//! [`zajel_signaling::messages`] rather than redefined here.
//!
//! ## Modules
//!
//! - [`config`] — listen address, operator Ed25519 signing key
//! - [`registries`] — the four single-writer-per-key registries + GC
//! - [`state`] — shared `AppState` the axum handlers operate on
//! - [`ws`] — the `WS /` handler: pairing, rendezvous, relay, chunk flows
//! - [`http`] — `GET /health`, `GET /servers`, `POST/DELETE /servers*`

pub mod config;
pub mod http;
pub mod registries;
pub mod state;
pub mod ws;

/// Coordinator-side errors. Kept deliberately small: most per-message
/// failures are reported back over the socket as a `ServerMessage::Error`
/// rather than surfaced as a Rust error (`spec.md` §7: "Coordinator shard
/// errors never cross shard boundaries").
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// A pairing code is already registered under a different public key
    /// (`spec.md` §4.7: "enforce uniqueness").
    #[error("pairing code already registered under a different key")]
    DuplicateCode,

    /// A referenced code/peer/chunk is not present in any registry.
    #[error("not found: {0}")]
    NotFound(String),

    /// A chunk push exceeded the 64 KiB single-chunk ceiling.
    #[error("chunk payload of {size} bytes exceeds the {max} byte ceiling")]
    ChunkTooLarge { size: usize, max: usize },

    /// Malformed or semantically impossible wire message (`spec.md` §9
    /// "reject with `ProtocolViolation`").
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

/// Current unix time in seconds.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs()
}
