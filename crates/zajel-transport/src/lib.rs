//! # zajel-transport
//!
//! Peer-to-peer transport: QUIC/TLS 1.3 connections carrying two logical
//! streams per peer (`messages`, `files`), the in-band identity handshake,
//! and send-side backpressure (`spec.md` §4.5).
//!
//! ## Architecture
//!
//! ```text
//! Application
//!     |
//!     v
//! handshake.rs   -- in-band public-key exchange, gates AEAD traffic
//!     |
//!     v
//! backpressure.rs -- high/low watermark pause on the files stream
//!     |
//!     v
//! QuicNode (quic.rs) -- QUIC/TLS 1.3, two bidirectional streams per peer
//!     |
//!     v
//! UDP socket
//! ```
//!
//! TLS authenticates nothing here; the handshake module performs the
//! actual peer-identity check once streams are open, mirroring a WebRTC
//! data channel's "ordered, unauthenticated transport plus in-band
//! verification" model.

pub mod backpressure;
pub mod handshake;
pub mod quic;

/// Error types for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Protocol violation (oversize frame, out-of-order handshake, etc.).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Invalid or malformed packet.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// The in-band handshake public key did not match the one learned via
    /// signaling (`spec.md` §4.5 step 2).
    #[error("handshake key mismatch")]
    HandshakeMismatch,

    /// Cryptographic operation failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// TLS/certificate error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// QUIC connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// I/O error (socket, stream read/write).
    #[error("I/O error: {0}")]
    Io(String),

    /// Internal error (should not occur in normal operation).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TransportError::Serialization("test".to_string());
        assert_eq!(err.to_string(), "serialization error: test");
    }

    #[test]
    fn test_error_variants() {
        let _e1 = TransportError::Serialization("s".into());
        let _e2 = TransportError::Deserialization("d".into());
        let _e3 = TransportError::ProtocolViolation("p".into());
        let _e4 = TransportError::InvalidPacket("i".into());
        let _e5 = TransportError::HandshakeMismatch;
        let _e6 = TransportError::Crypto("c".into());
        let _e7 = TransportError::Tls("t".into());
        let _e8 = TransportError::Connection("conn".into());
        let _e9 = TransportError::Io("io".into());
        let _e10 = TransportError::Internal("int".into());
    }
}
