//! Per-peer session establishment, AEAD framing, and replay protection.
//!
//! `spec.md` §3/§4.1: one [`Session`] is created per peer via
//! [`Session::establish`], then used to encrypt/decrypt every message on
//! that peer's data channel. Text and binary traffic keep independent send
//! counters and independent replay windows — a replayed text frame does not
//! consume the binary window's state and vice versa.

use hkdf::Hkdf;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::chacha20;
use crate::sha256::contexts;
use crate::x25519::{X25519PublicKey, X25519StaticSecret};
use crate::{CryptoError, Result};

/// Width of the replay-window sliding bitmap (`spec.md` §3).
pub const REPLAY_WINDOW_BITS: u32 = 64;

/// A sequence counter is fatal once it would reach this value.
pub const MAX_SEQ: u32 = u32::MAX - 1;

/// Which logical channel a frame belongs to. Text and binary traffic are
/// kept on separate counters/windows so one cannot starve or desync the
/// other.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Channel {
    Text,
    Binary,
}

/// RFC-4303-style sliding replay window: a 64-bit bitmap trailing
/// `highest_seq`. Bit `i` set means `highest_seq - i` has been seen.
#[derive(Debug, Clone)]
struct ReplayWindow {
    highest_seq: Option<u32>,
    bitmap: u64,
}

impl ReplayWindow {
    fn new() -> Self {
        Self {
            highest_seq: None,
            bitmap: 0,
        }
    }

    /// Check and record `seq`. Returns `Ok(())` if this is the first time
    /// `seq` has been seen and it is accepted into the window, `Err` if it
    /// is a replay or falls outside the trailing window.
    fn check_and_update(&mut self, seq: u32) -> Result<()> {
        if seq == 0 {
            return Err(CryptoError::ReplayDetected);
        }
        match self.highest_seq {
            None => {
                self.highest_seq = Some(seq);
                self.bitmap = 1;
                Ok(())
            }
            Some(highest) => {
                if seq > highest {
                    let shift = seq - highest;
                    if shift >= REPLAY_WINDOW_BITS as u32 {
                        self.bitmap = 1;
                    } else {
                        self.bitmap = (self.bitmap << shift) | 1;
                    }
                    self.highest_seq = Some(seq);
                    Ok(())
                } else {
                    let diff = highest - seq;
                    if diff >= REPLAY_WINDOW_BITS as u32 {
                        return Err(CryptoError::ReplayDetected);
                    }
                    let bit = 1u64 << diff;
                    if self.bitmap & bit != 0 {
                        return Err(CryptoError::ReplayDetected);
                    }
                    self.bitmap |= bit;
                    Ok(())
                }
            }
        }
    }
}

#[derive(Zeroize)]
#[zeroize(drop)]
struct SessionKey([u8; 32]);

/// An established end-to-end session with a single peer.
///
/// Holds the derived symmetric key, the peer's bound public key (for
/// [`Session::verify_peer_key`] TOFU checks), and independent send
/// counters / replay windows per [`Channel`].
pub struct Session {
    key: SessionKey,
    peer_public_key: [u8; 32],
    send_counters: std::collections::HashMap<u8, u32>,
    replay_windows: std::collections::HashMap<u8, ReplayWindow>,
}

fn channel_tag(channel: Channel) -> u8 {
    match channel {
        Channel::Text => 0,
        Channel::Binary => 1,
    }
}

impl Session {
    /// Derive a session key with a peer.
    ///
    /// `session_key = HKDF-Expand(HKDF-Extract(ECDH(sk_self, pk_peer)), info="zajel_session_"||peer_id, L=32)`
    ///
    /// `peer_id` is the stable string identifier the caller uses for this
    /// peer (e.g. their fingerprint hex), not raw key bytes.
    pub fn establish(self_secret: &X25519StaticSecret, peer_public_key: &[u8; 32], peer_id: &str) -> Result<Self> {
        let peer_pk = X25519PublicKey::from_bytes(*peer_public_key);
        let shared = self_secret.diffie_hellman(&peer_pk);

        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut info = Vec::with_capacity(contexts::SESSION_KEY_INFO_PREFIX.len() + peer_id.len());
        info.extend_from_slice(contexts::SESSION_KEY_INFO_PREFIX.as_bytes());
        info.extend_from_slice(peer_id.as_bytes());

        let mut okm = [0u8; 32];
        hk.expand(&info, &mut okm)
            .map_err(|_| CryptoError::InvalidKey)?;

        Ok(Self {
            key: SessionKey(okm),
            peer_public_key: *peer_public_key,
            send_counters: std::collections::HashMap::new(),
            replay_windows: std::collections::HashMap::new(),
        })
    }

    /// Constant-time comparison of a received public key against the one
    /// this session was established with. A mismatch is fatal to the
    /// session (TOFU key-rotation / MITM detection, `spec.md` §4.1).
    pub fn verify_peer_key(&self, received: &[u8; 32]) -> Result<()> {
        if self.peer_public_key.ct_eq(received).into() {
            Ok(())
        } else {
            Err(CryptoError::HandshakeMismatch)
        }
    }

    /// Encrypt `plaintext` for `channel`, returning a wire frame
    /// `nonce(12) || ChaCha20-Poly1305(key, nonce, seq(4 BE) || plaintext)`.
    ///
    /// Increments that channel's send counter. Fails with
    /// [`CryptoError::CounterExhausted`] once the counter would reach
    /// [`MAX_SEQ`].
    pub fn encrypt(&mut self, channel: Channel, plaintext: &[u8]) -> Result<Vec<u8>> {
        let tag = channel_tag(channel);
        // Counters start at 1: seq == 0 is never a valid frame (`spec.md` §3).
        let counter = self.send_counters.entry(tag).or_insert(1);
        if *counter >= MAX_SEQ {
            return Err(CryptoError::CounterExhausted);
        }
        let seq = *counter;
        *counter += 1;

        let mut nonce = [0u8; chacha20::NONCE_SIZE];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut nonce);

        let mut framed = Vec::with_capacity(4 + plaintext.len());
        framed.extend_from_slice(&seq.to_be_bytes());
        framed.extend_from_slice(plaintext);

        let ciphertext = chacha20::encrypt_no_aad(&self.key.0, &nonce, &framed)?;

        let mut frame = Vec::with_capacity(nonce.len() + ciphertext.len());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    /// Decrypt a wire frame produced by [`Session::encrypt`] on `channel`.
    ///
    /// Every failure mode — bad AEAD tag, malformed frame, replay — maps to
    /// [`CryptoError::DecryptionFailed`] or [`CryptoError::ReplayDetected`];
    /// callers must not be able to distinguish a forged tag from a short
    /// frame.
    pub fn decrypt(&mut self, channel: Channel, frame: &[u8]) -> Result<Vec<u8>> {
        if frame.len() < chacha20::NONCE_SIZE + chacha20::TAG_SIZE + 4 {
            return Err(CryptoError::DecryptionFailed);
        }
        let (nonce_bytes, ciphertext) = frame.split_at(chacha20::NONCE_SIZE);
        let mut nonce = [0u8; chacha20::NONCE_SIZE];
        nonce.copy_from_slice(nonce_bytes);

        let framed = chacha20::decrypt_no_aad(&self.key.0, &nonce, ciphertext)?;
        if framed.len() < 4 {
            return Err(CryptoError::DecryptionFailed);
        }
        let (seq_bytes, plaintext) = framed.split_at(4);
        let seq = u32::from_be_bytes(seq_bytes.try_into().expect("4 bytes"));

        let tag = channel_tag(channel);
        let window = self.replay_windows.entry(tag).or_insert_with(ReplayWindow::new);
        window.check_and_update(seq)?;

        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_sessions() -> (Session, Session) {
        let alice_sk = X25519StaticSecret::random();
        let bob_sk = X25519StaticSecret::random();
        let alice_pk = alice_sk.public_key().to_bytes();
        let bob_pk = bob_sk.public_key().to_bytes();

        let alice_session = Session::establish(&alice_sk, &bob_pk, "bob").expect("establish");
        let bob_session = Session::establish(&bob_sk, &alice_pk, "alice").expect("establish");
        (alice_session, bob_session)
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let (mut alice, mut bob) = paired_sessions();
        let frame = alice.encrypt(Channel::Text, b"hello bob").expect("encrypt");
        let plaintext = bob.decrypt(Channel::Text, &frame).expect("decrypt");
        assert_eq!(plaintext, b"hello bob");
    }

    #[test]
    fn nonces_are_unique_across_messages() {
        let (mut alice, _bob) = paired_sessions();
        let f1 = alice.encrypt(Channel::Text, b"a").expect("encrypt");
        let f2 = alice.encrypt(Channel::Text, b"a").expect("encrypt");
        assert_ne!(&f1[..chacha20::NONCE_SIZE], &f2[..chacha20::NONCE_SIZE]);
    }

    #[test]
    fn send_counter_is_strictly_monotonic() {
        let (mut alice, mut bob) = paired_sessions();
        for i in 0..5 {
            let frame = alice.encrypt(Channel::Text, format!("msg {i}").as_bytes()).expect("encrypt");
            bob.decrypt(Channel::Text, &frame).expect("decrypt");
        }
    }

    #[test]
    fn replayed_frame_is_rejected() {
        let (mut alice, mut bob) = paired_sessions();
        let frame = alice.encrypt(Channel::Text, b"once").expect("encrypt");
        bob.decrypt(Channel::Text, &frame).expect("first decrypt succeeds");
        assert!(matches!(
            bob.decrypt(Channel::Text, &frame),
            Err(CryptoError::ReplayDetected)
        ));
    }

    #[test]
    fn text_and_binary_channels_have_independent_windows() {
        let (mut alice, mut bob) = paired_sessions();
        let text_frame = alice.encrypt(Channel::Text, b"t").expect("encrypt");
        let bin_frame = alice.encrypt(Channel::Binary, b"b").expect("encrypt");
        bob.decrypt(Channel::Text, &text_frame).expect("decrypt text");
        bob.decrypt(Channel::Binary, &bin_frame).expect("decrypt binary");
        assert!(bob.decrypt(Channel::Text, &text_frame).is_err());
        assert!(bob.decrypt(Channel::Binary, &bin_frame).is_err());
    }

    #[test]
    fn out_of_order_within_window_is_accepted() {
        let (mut alice, mut bob) = paired_sessions();
        let frames: Vec<_> = (0..4)
            .map(|i| alice.encrypt(Channel::Text, format!("{i}").as_bytes()).expect("encrypt"))
            .collect();
        bob.decrypt(Channel::Text, &frames[3]).expect("decrypt seq 3");
        bob.decrypt(Channel::Text, &frames[1]).expect("decrypt seq 1 (reordered)");
        bob.decrypt(Channel::Text, &frames[2]).expect("decrypt seq 2 (reordered)");
        assert!(bob.decrypt(Channel::Text, &frames[1]).is_err());
    }

    #[test]
    fn frame_older_than_window_is_rejected() {
        let mut window = ReplayWindow::new();
        window.check_and_update(100).expect("seed window");
        assert!(window.check_and_update(100 - REPLAY_WINDOW_BITS).is_err());
    }

    #[test]
    fn tampered_ciphertext_fails_closed() {
        let (mut alice, mut bob) = paired_sessions();
        let mut frame = alice.encrypt(Channel::Text, b"hi").expect("encrypt");
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(
            bob.decrypt(Channel::Text, &frame),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn verify_peer_key_detects_mismatch() {
        let (alice, _bob) = paired_sessions();
        let wrong = [0x42u8; 32];
        assert!(alice.verify_peer_key(&wrong).is_err());
    }

    #[test]
    fn verify_peer_key_accepts_bound_key() {
        let alice_sk = X25519StaticSecret::random();
        let bob_sk = X25519StaticSecret::random();
        let bob_pk = bob_sk.public_key().to_bytes();
        let session = Session::establish(&alice_sk, &bob_pk, "bob").expect("establish");
        assert!(session.verify_peer_key(&bob_pk).is_ok());
    }
}
