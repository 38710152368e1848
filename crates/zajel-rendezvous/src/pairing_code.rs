//! Pairing codes: short, human-typeable, out-of-band identifiers that map
//! to a coordinator registration (`spec.md` §3, §6).
//!
//! Codes are drawn from a Crockford-like alphabet with ambiguous glyphs
//! (`I`, `O`, `0`, `1`) excluded, so a code read aloud or copied from a
//! photo doesn't silently fail to match.

use rand::RngCore;

use crate::{RendezvousError, Result};

/// Crockford-like alphabet: 24 letters (no `I`/`O`) + 8 digits (no `0`/`1`).
pub const ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Pairing codes are always this many characters.
pub const CODE_LEN: usize = 6;

/// A validated, normalized (upper-case) pairing code.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PairingCode(String);

impl PairingCode {
    /// Generate a random pairing code by uniform rejection sampling over
    /// [`ALPHABET`].
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut out = String::with_capacity(CODE_LEN);
        // 256 % 32 == 0, so every byte is usable without rejection, but we
        // sample generically in case the alphabet ever changes length.
        let threshold = 256 - (256 % ALPHABET.len());
        while out.len() < CODE_LEN {
            let mut byte = [0u8; 1];
            rng.fill_bytes(&mut byte);
            let b = byte[0] as usize;
            if b >= threshold {
                continue;
            }
            out.push(ALPHABET[b % ALPHABET.len()] as char);
        }
        Self(out)
    }

    /// Parse and validate user-supplied input: trims whitespace,
    /// upper-cases, and rejects anything not exactly [`CODE_LEN`]
    /// characters from [`ALPHABET`].
    pub fn parse(input: &str) -> Result<Self> {
        let normalized: String = input.trim().chars().flat_map(|c| c.to_uppercase()).collect();
        if normalized.chars().count() != CODE_LEN {
            return Err(RendezvousError::InvalidPairingCode(format!(
                "expected {CODE_LEN} characters, got {}",
                normalized.chars().count()
            )));
        }
        if !normalized.bytes().all(|b| ALPHABET.contains(&b)) {
            return Err(RendezvousError::InvalidPairingCode(
                "contains characters outside the pairing-code alphabet".into(),
            ));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Encode as a `zajel://pair/<CODE>` URI.
    pub fn to_uri(&self) -> String {
        format!("zajel://pair/{}", self.0)
    }

    /// Decode a `zajel://pair/<CODE>` URI, validating the code portion.
    pub fn from_uri(uri: &str) -> Result<Self> {
        let code = uri
            .strip_prefix("zajel://pair/")
            .ok_or_else(|| RendezvousError::InvalidPairingCode("not a zajel pairing URI".into()))?;
        Self::parse(code)
    }
}

impl std::fmt::Display for PairingCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
