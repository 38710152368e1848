//! In-band identity handshake on the `messages` stream (`spec.md` §4.5).
//!
//! QUIC's TLS layer deliberately authenticates nothing (see
//! [`crate::quic::SkipServerVerification`]); the first messages exchanged
//! once both sides' `messages` stream is open carry each side's long-term
//! public key, which is then checked against the key the connection
//! manager already learned via signaling.

use base64::Engine;
use quinn::{RecvStream, SendStream};
use serde::{Deserialize, Serialize};

use crate::quic::{QuicNode, MAX_FRAME_SIZE};
use crate::{Result, TransportError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum HandshakeMessage {
    Handshake {
        #[serde(rename = "publicKey")]
        public_key: String,
    },
}

/// Run the two-way handshake: send our public key, receive theirs, and
/// check it against `expected_peer_public_key` (the key learned during
/// pairing/signaling). On mismatch, returns
/// [`TransportError::HandshakeMismatch`] — callers must close the
/// transport, mark the peer `failed`, and emit `KeyChanged`.
pub async fn run(
    send: &mut SendStream,
    recv: &mut RecvStream,
    self_public_key: &[u8; 32],
    expected_peer_public_key: &[u8; 32],
) -> Result<()> {
    let outbound = HandshakeMessage::Handshake {
        public_key: base64::engine::general_purpose::STANDARD.encode(self_public_key),
    };
    let bytes = serde_json::to_vec(&outbound).map_err(|e| TransportError::Serialization(e.to_string()))?;
    QuicNode::send_message(send, &bytes).await?;

    let received = QuicNode::recv_message(recv, MAX_FRAME_SIZE).await?;
    let HandshakeMessage::Handshake { public_key } =
        serde_json::from_slice(&received).map_err(|e| TransportError::Deserialization(e.to_string()))?;

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(&public_key)
        .map_err(|e| TransportError::ProtocolViolation(format!("handshake public key not valid base64: {e}")))?;

    if decoded.as_slice() != expected_peer_public_key.as_slice() {
        return Err(TransportError::HandshakeMismatch);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_message_roundtrips_through_json() {
        let msg = HandshakeMessage::Handshake {
            public_key: base64::engine::general_purpose::STANDARD.encode([0x42u8; 32]),
        };
        let bytes = serde_json::to_vec(&msg).expect("serialize");
        let parsed: HandshakeMessage = serde_json::from_slice(&bytes).expect("deserialize");
        let HandshakeMessage::Handshake { public_key } = parsed;
        assert_eq!(
            base64::engine::general_purpose::STANDARD.decode(&public_key).expect("decode"),
            [0x42u8; 32]
        );
    }

    #[test]
    fn handshake_wire_shape_is_tagged_json() {
        let msg = HandshakeMessage::Handshake {
            public_key: "deadbeef".to_string(),
        };
        let json = serde_json::to_string(&msg).expect("serialize");
        assert!(json.contains("\"type\":\"handshake\""));
        assert!(json.contains("\"publicKey\":\"deadbeef\""));
    }
}
