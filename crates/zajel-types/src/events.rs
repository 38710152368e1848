//! Event envelope for the connection manager's observable streams
//! (`spec.md` §4.3: `peers_changed`, `messages`, `file_events`,
//! `pair_requests`, `key_change_events`).

use serde::{Deserialize, Serialize};

/// Envelope for every event emitted on the client's internal event bus.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub timestamp: u64,
    pub payload: serde_json::Value,
}

/// The five observable streams of `spec.md` §4.3, plus the connection
/// lifecycle events each stream actually carries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// `peers_changed`: a peer was added, removed, or changed state.
    PeerAdded,
    PeerRemoved,
    PeerStateChanged,

    /// `messages`: a decrypted text/binary payload arrived from a peer.
    MessageReceived,

    /// `file_events`: file transfer progress (`spec.md` §4.6).
    FileTransferStarted,
    FileTransferProgress,
    FileTransferComplete,
    FileTransferFailed,
    FileTransferCancelled,

    /// `pair_requests`: an incoming pairing request awaiting accept/reject.
    PairRequestReceived,
    PairRequestAccepted,
    PairRequestRejected,
    PairRequestTimedOut,

    /// `key_change_events`: TOFU key-rotation detected (`spec.md` §4.1).
    KeyChanged,

    /// Signaling connection lifecycle (`spec.md` §4.2).
    SignalingConnected,
    SignalingDisconnected,
    SignalingReconnecting,
}
