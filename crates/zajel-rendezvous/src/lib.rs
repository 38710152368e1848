//! # zajel-rendezvous
//!
//! Meeting-point derivation and dead-drop sealing for peer-to-peer
//! discovery without a third party ever learning who is looking for whom
//! (`spec.md` §3, §4.4).
//!
//! Two peers who each know the other's public key can independently derive
//! the same sequence of opaque meeting points without exchanging anything
//! beyond the initial out-of-band pairing code. The coordinator only ever
//! sees random-looking 32-byte points; it cannot invert them back to a key
//! pair.
//!
//! ## Modules
//!
//! - [`pairing_code`] — pairing code generation, normalization, and URI
//!   encoding (`zajel://pair/<CODE>`, `zajel-link://...`)
//! - [`rendezvous`] — the client-side rendezvous flow state machine

pub mod pairing_code;
pub mod rendezvous;

use serde::{Deserialize, Serialize};
use zajel_crypto::sha256::{self, contexts};
use zajel_crypto::x25519::X25519PublicKey;
use zajel_crypto::{ecies, CryptoError};

/// Seconds in a day, used for `day_index` derivation.
pub const SECONDS_PER_DAY: u64 = 86_400;

/// Seconds in an hour, used for `hour_index` derivation.
pub const SECONDS_PER_HOUR: u64 = 3_600;

/// How many adjacent days a daily meeting point stays valid for, to absorb
/// clock skew between peers (`spec.md` §3): `{today - 1, today, today + 1}`.
pub const DAILY_TOLERANCE_DAYS: i64 = 1;

/// TTL for a daily meeting-point registration / dead drop at the
/// coordinator.
pub const DEAD_DROP_TTL_HOURS: u64 = 48;

/// TTL for an hourly meeting-point (live-match) registration.
pub const HOURLY_TTL_HOURS: u64 = 3;

/// Error types for rendezvous operations.
#[derive(Debug, thiserror::Error)]
pub enum RendezvousError {
    /// A public key was not exactly 32 bytes.
    #[error("invalid public key")]
    InvalidKey,

    /// A dead drop could not be decrypted — either it wasn't addressed to
    /// us, or it has been tampered with. Silently dropped by callers, per
    /// `spec.md` §4.4.
    #[error("dead drop could not be opened")]
    DeadDropUnreadable,

    /// The dead drop payload decrypted but failed to parse.
    #[error("malformed dead drop payload: {0}")]
    Malformed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A pairing code failed validation (`spec.md` §3).
    #[error("invalid pairing code: {0}")]
    InvalidPairingCode(String),

    /// Cryptographic error from `zajel-crypto`.
    #[error("cryptographic error: {0}")]
    Crypto(#[from] CryptoError),
}

pub type Result<T> = std::result::Result<T, RendezvousError>;

/// Canonically order two public keys so both peers derive the same
/// meeting points regardless of who is "self" and who is "peer"
/// (`spec.md` §3/§8: `daily_point` symmetry).
fn canonical_order<'a>(a: &'a [u8; 32], b: &'a [u8; 32]) -> (&'a [u8; 32], &'a [u8; 32]) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// A derived meeting point: either a daily dead-drop address or an hourly
/// live-match token.
pub struct MeetingPoint;

impl MeetingPoint {
    /// `daily_point(day) = SHA256("zajel_mp_daily_v1" || canonical(pk_a, pk_b) || day_index)`
    pub fn daily_point(pk_a: &[u8; 32], pk_b: &[u8; 32], day_index: u64) -> [u8; 32] {
        let (lo, hi) = canonical_order(pk_a, pk_b);
        sha256::hash_concat(&[
            contexts::MEETING_POINT_DAILY.as_bytes(),
            lo,
            hi,
            &day_index.to_be_bytes(),
        ])
    }

    /// `hourly_token(hour) = SHA256("zajel_mp_hourly_v1" || canonical(pk_a, pk_b) || hour_index)`
    pub fn hourly_token(pk_a: &[u8; 32], pk_b: &[u8; 32], hour_index: u64) -> [u8; 32] {
        let (lo, hi) = canonical_order(pk_a, pk_b);
        sha256::hash_concat(&[
            contexts::MEETING_POINT_HOURLY.as_bytes(),
            lo,
            hi,
            &hour_index.to_be_bytes(),
        ])
    }

    /// The set of daily points to publish/check right now, per the 3-day
    /// tolerance window `{today - 1, today, today + 1}`.
    pub fn daily_window(pk_a: &[u8; 32], pk_b: &[u8; 32], unix_seconds: u64) -> Vec<[u8; 32]> {
        let today = (unix_seconds / SECONDS_PER_DAY) as i64;
        ((today - DAILY_TOLERANCE_DAYS)..=(today + DAILY_TOLERANCE_DAYS))
            .filter(|&day| day >= 0)
            .map(|day| Self::daily_point(pk_a, pk_b, day as u64))
            .collect()
    }

    pub fn day_index(unix_seconds: u64) -> u64 {
        unix_seconds / SECONDS_PER_DAY
    }

    pub fn hour_index(unix_seconds: u64) -> u64 {
        unix_seconds / SECONDS_PER_HOUR
    }
}

/// A sealed dead-drop payload: an ECIES ciphertext addressed to a specific
/// peer's public key, published at that peer's daily meeting point.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SealedDeadDrop {
    pub point: [u8; 32],
    pub eph_pk: [u8; 32],
    pub ciphertext_and_tag: Vec<u8>,
    pub sealed_at: u64,
}

/// The cleartext a dead drop carries: enough for the retriever to open a
/// signaling connection and begin pairing (`spec.md` §4.4: "current pairing
/// code + server URL, sealed to `pk_peer`").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadDropPayload {
    pub sender_public_key: [u8; 32],
    pub sender_pairing_code: String,
    pub signaling_hint: Option<String>,
}

/// Seal a dead-drop payload to `recipient_pk`, for publication at
/// `daily_point(self_pk, recipient_pk, today)`.
pub fn seal_dead_drop(
    recipient_pk: &[u8; 32],
    sender_pk: &[u8; 32],
    sender_pairing_code: String,
    signaling_hint: Option<String>,
    now: u64,
) -> Result<SealedDeadDrop> {
    let payload = DeadDropPayload {
        sender_public_key: *sender_pk,
        sender_pairing_code,
        signaling_hint,
    };
    let plaintext = serde_json::to_vec(&payload).map_err(|e| RendezvousError::Serialization(e.to_string()))?;

    let recipient = X25519PublicKey::from_bytes(*recipient_pk);
    let ct = ecies::encrypt(&recipient, &plaintext)?;

    let point = MeetingPoint::daily_point(sender_pk, recipient_pk, MeetingPoint::day_index(now));

    Ok(SealedDeadDrop {
        point,
        eph_pk: ct.eph_pk,
        ciphertext_and_tag: ct.ciphertext_and_tag,
        sealed_at: now,
    })
}

/// Attempt to open a dead drop with our own secret key. Returns
/// `Err(RendezvousError::DeadDropUnreadable)` if it wasn't addressed to us
/// — callers must treat this as a silent drop, not an error to surface
/// (`spec.md` §4.4).
pub fn open_dead_drop(
    drop: &SealedDeadDrop,
    self_secret: &zajel_crypto::x25519::X25519StaticSecret,
) -> Result<DeadDropPayload> {
    let ciphertext = ecies::EciesCiphertext {
        eph_pk: drop.eph_pk,
        ciphertext_and_tag: drop.ciphertext_and_tag.clone(),
    };
    let plaintext = ecies::decrypt(self_secret, &ciphertext).map_err(|_| RendezvousError::DeadDropUnreadable)?;
    serde_json::from_slice(&plaintext).map_err(|e| RendezvousError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use zajel_crypto::x25519::X25519StaticSecret;

    #[test]
    fn daily_point_is_symmetric() {
        let a = [0x01u8; 32];
        let b = [0x02u8; 32];
        assert_eq!(MeetingPoint::daily_point(&a, &b, 100), MeetingPoint::daily_point(&b, &a, 100));
    }

    #[test]
    fn hourly_token_is_symmetric() {
        let a = [0x01u8; 32];
        let b = [0x02u8; 32];
        assert_eq!(MeetingPoint::hourly_token(&a, &b, 5), MeetingPoint::hourly_token(&b, &a, 5));
    }

    #[test]
    fn daily_point_differs_by_day() {
        let a = [0x01u8; 32];
        let b = [0x02u8; 32];
        assert_ne!(MeetingPoint::daily_point(&a, &b, 100), MeetingPoint::daily_point(&a, &b, 101));
    }

    #[test]
    fn daily_window_has_three_entries_for_non_edge_days() {
        let a = [0x01u8; 32];
        let b = [0x02u8; 32];
        let unix_seconds = 10 * SECONDS_PER_DAY + 100;
        let window = MeetingPoint::daily_window(&a, &b, unix_seconds);
        assert_eq!(window.len(), 3);
    }

    #[test]
    fn dead_drop_roundtrip() {
        let sender_sk = X25519StaticSecret::random();
        let sender_pk = sender_sk.public_key().to_bytes();
        let recipient_sk = X25519StaticSecret::random();
        let recipient_pk = recipient_sk.public_key().to_bytes();

        let drop = seal_dead_drop(
            &recipient_pk,
            &sender_pk,
            "A2B3C4".to_string(),
            Some("wss://example".into()),
            1_000,
        )
        .expect("seal");
        let opened = open_dead_drop(&drop, &recipient_sk).expect("open");
        assert_eq!(opened.sender_public_key, sender_pk);
        assert_eq!(opened.sender_pairing_code, "A2B3C4");
        assert_eq!(opened.signaling_hint.as_deref(), Some("wss://example"));
    }

    #[test]
    fn dead_drop_unreadable_by_wrong_recipient() {
        let sender_sk = X25519StaticSecret::random();
        let sender_pk = sender_sk.public_key().to_bytes();
        let recipient_sk = X25519StaticSecret::random();
        let recipient_pk = recipient_sk.public_key().to_bytes();
        let wrong_sk = X25519StaticSecret::random();

        let drop = seal_dead_drop(&recipient_pk, &sender_pk, "A2B3C4".to_string(), None, 1_000).expect("seal");
        assert!(matches!(
            open_dead_drop(&drop, &wrong_sk),
            Err(RendezvousError::DeadDropUnreadable)
        ));
    }
}
