//! The closed set of WebSocket message shapes (`spec.md` §4.2). Keys and
//! binary payloads are base64-encoded strings on the wire, matching
//! `zajel-transport`'s in-band handshake; opaque SDP/ICE payloads are
//! passed through as [`serde_json::Value`] — the signaling server must
//! never parse them (`spec.md` §4.7).

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::{Result, SignalingError};

fn encode_key(key: &[u8; 32]) -> String {
    base64::engine::general_purpose::STANDARD.encode(key)
}

fn decode_key(encoded: &str) -> Result<[u8; 32]> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| SignalingError::Malformed(format!("invalid base64 key: {e}")))?;
    bytes
        .try_into()
        .map_err(|v: Vec<u8>| SignalingError::Malformed(format!("key is {} bytes, expected 32", v.len())))
}

/// A public key as it appears on the wire (base64), with the parsed
/// form available via [`WireKey::decode`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WireKey(pub String);

impl WireKey {
    pub fn encode(key: &[u8; 32]) -> Self {
        Self(encode_key(key))
    }

    pub fn decode(&self) -> Result<[u8; 32]> {
        decode_key(&self.0)
    }
}

/// A chunk payload or dead-drop blob as it appears on the wire (base64).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WireBytes(pub String);

impl WireBytes {
    pub fn encode(bytes: &[u8]) -> Self {
        Self(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn decode(&self) -> Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.0)
            .map_err(|e| SignalingError::Malformed(format!("invalid base64 payload: {e}")))
    }
}

/// One announced chunk in a `chunk_announce` message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkAnnouncement {
    pub id: String,
    #[serde(rename = "routingHash")]
    pub routing_hash: String,
}

/// A dead-drop registration attached to `register_rendezvous`: the
/// meeting point it is stored at plus the sealed blob.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeadDropRegistration {
    pub point: String,
    #[serde(rename = "sealed")]
    pub sealed: WireBytes,
}

/// Messages a client sends to the coordinator (`spec.md` §4.2 "Outbound
/// message shapes").
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Register {
        #[serde(rename = "pairingCode")]
        pairing_code: String,
        #[serde(rename = "publicKey")]
        public_key: WireKey,
        /// Present only for connections that also offer themselves as a
        /// relay; the coordinator's relay registry is keyed off this
        /// rather than a separate message (`spec.md` §4.7: "register
        /// optionally carries capacity").
        #[serde(skip_serializing_if = "Option::is_none")]
        capacity: Option<u32>,
    },
    PairRequest {
        #[serde(rename = "targetCode")]
        target_code: String,
    },
    PairResponse {
        #[serde(rename = "targetCode")]
        target_code: String,
        accepted: bool,
    },
    Offer {
        target: String,
        payload: serde_json::Value,
    },
    Answer {
        target: String,
        payload: serde_json::Value,
    },
    IceCandidate {
        target: String,
        payload: serde_json::Value,
    },
    LinkRequest {
        target: String,
        payload: serde_json::Value,
    },
    LinkResponse {
        target: String,
        payload: serde_json::Value,
    },
    RegisterRendezvous {
        daily: Vec<String>,
        hourly: Vec<String>,
        #[serde(rename = "deadDrop", skip_serializing_if = "Option::is_none")]
        dead_drop: Option<Vec<DeadDropRegistration>>,
    },
    GetRelays,
    UpdateLoad {
        load: u32,
    },
    Heartbeat,
    Ping,
    ChunkAnnounce {
        chunks: Vec<ChunkAnnouncement>,
    },
    ChunkRequest {
        id: String,
    },
    ChunkPush {
        id: String,
        bytes: WireBytes,
    },
}

/// Messages the coordinator sends to a client (`spec.md` §4.2 "Inbound
/// shapes", plus the rendezvous-delivery messages described in §4.4/§4.7).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Registered,
    PairIncoming {
        #[serde(rename = "fromCode")]
        from_code: String,
        #[serde(rename = "fromPublicKey")]
        from_public_key: WireKey,
        #[serde(rename = "expiresIn", skip_serializing_if = "Option::is_none")]
        expires_in: Option<u64>,
    },
    PairMatched {
        #[serde(rename = "peerCode")]
        peer_code: String,
        #[serde(rename = "peerPublicKey")]
        peer_public_key: WireKey,
        #[serde(rename = "isInitiator")]
        is_initiator: bool,
    },
    PairRejected,
    PairTimeout,
    PairError {
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Offer {
        from: String,
        payload: serde_json::Value,
    },
    Answer {
        from: String,
        payload: serde_json::Value,
    },
    IceCandidate {
        from: String,
        payload: serde_json::Value,
    },
    LinkRequest {
        from: String,
        payload: serde_json::Value,
    },
    LinkResponse {
        from: String,
        payload: serde_json::Value,
    },
    RendezvousDeaddrop {
        point: String,
        sealed: WireBytes,
    },
    RendezvousLiveMatch {
        point: String,
        #[serde(rename = "peerCode")]
        peer_code: String,
    },
    ChunkData {
        id: String,
        bytes: WireBytes,
    },
    ChunkPull {
        id: String,
    },
    ChunkAvailable {
        id: String,
    },
    ChunkNotFound {
        id: String,
    },
    Relays {
        relays: Vec<zajel_types::network::RelayEntry>,
    },
    PeerJoined {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    PeerLeft {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
    Pong,
    Error {
        message: String,
    },
}

impl ClientMessage {
    /// Serialize to the single-JSON-object wire form, enforcing the 1 MiB
    /// frame ceiling (`spec.md` §4.2).
    pub fn to_frame(&self) -> Result<String> {
        let text = serde_json::to_string(self).map_err(|e| SignalingError::Malformed(e.to_string()))?;
        if text.len() > crate::MAX_FRAME_SIZE {
            return Err(SignalingError::FrameTooLarge {
                size: text.len(),
                max: crate::MAX_FRAME_SIZE,
            });
        }
        Ok(text)
    }
}

impl ServerMessage {
    /// Parse an inbound text frame, rejecting anything over the 1 MiB
    /// ceiling before even attempting to deserialize it.
    pub fn from_frame(text: &str) -> Result<Self> {
        if text.len() > crate::MAX_FRAME_SIZE {
            return Err(SignalingError::FrameTooLarge {
                size: text.len(),
                max: crate::MAX_FRAME_SIZE,
            });
        }
        serde_json::from_str(text).map_err(|e| SignalingError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_roundtrips_with_tag() {
        let msg = ClientMessage::Register {
            pairing_code: "AB23CD".to_string(),
            public_key: WireKey::encode(&[0x11u8; 32]),
            capacity: None,
        };
        let frame = msg.to_frame().expect("serialize");
        assert!(frame.contains("\"type\":\"register\""));
        assert!(frame.contains("\"pairingCode\""));
    }

    #[test]
    fn pair_matched_roundtrips() {
        let msg = ServerMessage::PairMatched {
            peer_code: "ZZ99ZZ".to_string(),
            peer_public_key: WireKey::encode(&[0x22u8; 32]),
            is_initiator: true,
        };
        let frame = serde_json::to_string(&msg).expect("serialize");
        let parsed = ServerMessage::from_frame(&frame).expect("parse");
        match parsed {
            ServerMessage::PairMatched { peer_code, is_initiator, peer_public_key } => {
                assert_eq!(peer_code, "ZZ99ZZ");
                assert!(is_initiator);
                assert_eq!(peer_public_key.decode().expect("decode"), [0x22u8; 32]);
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn oversize_frame_is_rejected_on_decode() {
        let huge = "x".repeat(crate::MAX_FRAME_SIZE + 1);
        let framed = format!("{{\"type\":\"pong\",\"pad\":\"{huge}\"}}");
        let err = ServerMessage::from_frame(&framed).unwrap_err();
        assert!(matches!(err, SignalingError::FrameTooLarge { .. }));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let text = r#"{"type":"pong","unexpectedField":"value"}"#;
        let parsed = ServerMessage::from_frame(text).expect("parse despite unknown field");
        assert!(matches!(parsed, ServerMessage::Pong));
    }

    #[test]
    fn malformed_message_is_rejected() {
        let err = ServerMessage::from_frame("not json").unwrap_err();
        assert!(matches!(err, SignalingError::Malformed(_)));
    }

    #[test]
    fn wire_key_decode_rejects_wrong_length() {
        let bad = WireKey(base64::engine::general_purpose::STANDARD.encode(b"too short"));
        assert!(bad.decode().is_err());
    }
}
