//! # zajel-types
//!
//! Shared domain types used across the Zajel workspace: identity and peer
//! records (`spec.md` §3), the coordinator's registry value types, and the
//! client's event envelope (§4.3).

pub mod events;
pub mod identity;
pub mod network;

/// A peer's stable identifier as used in session derivation and logging:
/// the lowercase-hex fingerprint of their public key.
pub type PeerId = String;

/// A file transfer identifier (`spec.md` §4.6).
pub type FileId = String;

/// A raw 32-byte hash or public key.
pub type Hash = [u8; 32];

/// Width in bytes of a SHA-256 fingerprint.
pub const FINGERPRINT_LEN: usize = 32;
