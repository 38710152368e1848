//! Domain-separated SHA-256 hashing for the Zajel protocol.
//!
//! SHA-256 serves every hashing purpose in Zajel: key fingerprints (§3),
//! meeting-point derivation (§4.4), file-chunk integrity (§4.6), and the
//! HKDF input hashing that underlies `session`. Cross-purpose collisions
//! are prevented by prefixing a registered domain string before hashing,
//! mirroring a HMAC-style domain separation rather than relying on a
//! single flat hash of unrelated fields.
//!
//! ## Context strings
//!
//! Every domain-separated derivation in this crate uses one of the
//! constants in [`contexts`]. Using an unregistered context string is a
//! protocol violation.

/// Registered domain-separation context strings.
pub mod contexts {
    /// Daily meeting-point derivation (`spec.md` §4.4).
    pub const MEETING_POINT_DAILY: &str = "zajel_mp_daily_v1";
    /// Hourly (live-match) meeting-point derivation (`spec.md` §4.4).
    pub const MEETING_POINT_HOURLY: &str = "zajel_mp_hourly_v1";
    /// Session key derivation info prefix (`spec.md` §3); the peer id is
    /// appended by the caller.
    pub const SESSION_KEY_INFO_PREFIX: &str = "zajel_session_";
    /// ECIES encryption-key derivation for dead-drop sealing.
    pub const ECIES_ENCRYPTION_KEY: &str = "zajel_ecies_encryption_key";
    /// ECIES nonce derivation for dead-drop sealing.
    pub const ECIES_NONCE: &str = "zajel_ecies_nonce";

    /// All registered context strings, used for validation in tests.
    pub const ALL_CONTEXTS: &[&str] = &[
        MEETING_POINT_DAILY,
        MEETING_POINT_HOURLY,
        SESSION_KEY_INFO_PREFIX,
        ECIES_ENCRYPTION_KEY,
        ECIES_NONCE,
    ];
}

use sha2::{Digest, Sha256};

/// Plain SHA-256 hash of the input.
pub fn hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash several fields as if concatenated, without an allocation per call
/// site having to do the concatenation itself.
pub fn hash_concat(fields: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update(field);
    }
    hasher.finalize().into()
}

/// `fingerprint(pk) = SHA256(pk)` (`spec.md` §3), rendered grouped in
/// 4-hex-character blocks for out-of-band comparison.
pub fn fingerprint(pk: &[u8; 32]) -> [u8; 32] {
    hash(pk)
}

/// Render a fingerprint as lowercase hex grouped into 4-character blocks
/// separated by spaces, e.g. `a1b2 c3d4 ...`.
pub fn format_fingerprint(fp: &[u8; 32]) -> String {
    let hex = hex::encode(fp);
    hex.as_bytes()
        .chunks(4)
        .map(|chunk| std::str::from_utf8(chunk).expect("hex is ascii"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Verify that a context string is one of the registered constants.
pub fn is_registered_context(context: &str) -> bool {
    contexts::ALL_CONTEXTS.contains(&context)
}
