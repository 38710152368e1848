//! # zajel-crypto
//!
//! Cryptographic primitives for the Zajel peer-to-peer messenger.
//!
//! The cryptographic suite is fixed: X25519 for key agreement, HKDF-SHA256
//! for session derivation, ChaCha20-Poly1305 for authenticated encryption,
//! SHA-256 for fingerprints and rendezvous derivation, and Ed25519 for the
//! coordinator's signed bootstrap list. No algorithm negotiation.
//!
//! ## Modules
//!
//! - [`sha256`] — domain-separated SHA-256 hashing and fingerprints
//! - [`x25519`] — X25519 key agreement (RFC 7748)
//! - [`chacha20`] — ChaCha20-Poly1305 AEAD encryption (RFC 8439)
//! - [`ed25519`] — Ed25519 signing and verification (RFC 8032)
//! - [`ecies`] — ECIES seal/open for dead-drop payloads
//! - [`session`] — per-peer session key derivation, AEAD framing, replay window

pub mod chacha20;
pub mod ecies;
pub mod ed25519;
pub mod session;
pub mod sha256;
pub mod x25519;

/// Error types for cryptographic operations.
///
/// `DecryptionFailed` is intentionally the single code surfaced for every
/// kind of decryption failure (bad tag, replay, wrong key) so the network
/// side cannot distinguish which sub-check failed.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// `pk_peer` was not exactly 32 bytes, or failed base64 decoding.
    #[error("invalid key")]
    InvalidKey,

    /// A session's send counter reached 2^32 - 1.
    #[error("send counter exhausted")]
    CounterExhausted,

    /// The replay window rejected a sequence number.
    #[error("replay detected")]
    ReplayDetected,

    /// The in-band handshake public key did not match the one bound at
    /// `establish_session`.
    #[error("handshake public key mismatch")]
    HandshakeMismatch,

    /// AEAD authentication failed. Deliberately opaque: see module docs.
    #[error("decryption failed")]
    DecryptionFailed,

    /// Ed25519 signature verification failed.
    #[error("signature verification failed")]
    SignatureVerification,

    /// Malformed input that is neither a key-length nor a decryption
    /// problem (e.g. an ECIES ciphertext shorter than its header).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
