//! Identity and peer structures (`spec.md` §3).

use serde::{Deserialize, Serialize};

/// A Zajel identity: an X25519 key pair plus its derived fingerprint and
/// six-character pairing code. The secret half never leaves
/// `zajel-crypto`/platform secure storage; this struct is the
/// public-facing shape persisted and displayed to the user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Identity {
    pub public_key: [u8; 32],
    pub fingerprint: [u8; 32],
    pub pairing_code: String,
    pub created_at: u64,
}

/// A peer's connection lifecycle (`spec.md` §3).
///
/// `disconnected -> discovering -> connecting -> handshaking -> connected
/// -> (disconnected | failed)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Discovering,
    Connecting,
    Handshaking,
    Connected,
    Failed,
}

impl ConnectionState {
    /// Whether `next` is a legal transition from `self`, per §3's state
    /// diagram. `Failed` and `Disconnected` are always reachable (every
    /// active state can abort).
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (_, Disconnected) | (_, Failed) => true,
            (Disconnected, Discovering) => true,
            (Discovering, Connecting) => true,
            (Connecting, Handshaking) => true,
            (Handshaking, Connected) => true,
            _ => false,
        }
    }
}

/// A known peer (`spec.md` §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Peer {
    pub public_key: [u8; 32],
    pub peer_id: String,
    pub connection_state: ConnectionState,
    pub last_seen: u64,
    pub display_name: Option<String>,
    pub alias: Option<String>,
    pub trusted_since: Option<u64>,
    pub is_blocked: bool,
}

impl Peer {
    pub fn new(public_key: [u8; 32], peer_id: String, now: u64) -> Self {
        Self {
            public_key,
            peer_id,
            connection_state: ConnectionState::Disconnected,
            last_seen: now,
            display_name: None,
            alias: None,
            trusted_since: None,
            is_blocked: false,
        }
    }
}

/// A peer's public key changed from what was previously bound (TOFU
/// violation). Carries enough context for the client to surface a
/// re-verification prompt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyChanged {
    pub peer_id: String,
    pub old_public_key: [u8; 32],
    pub new_public_key: [u8; 32],
    pub detected_at: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_forward_path_is_linear() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Discovering));
        assert!(Discovering.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Handshaking));
        assert!(Handshaking.can_transition_to(Connected));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Discovering));
    }

    #[test]
    fn any_state_can_abort() {
        use ConnectionState::*;
        for state in [Disconnected, Discovering, Connecting, Handshaking, Connected] {
            assert!(state.can_transition_to(Failed));
            assert!(state.can_transition_to(Disconnected));
        }
    }
}
