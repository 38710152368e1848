//! # zajel-filetransfer
//!
//! Reliable chunked file transfer between two paired peers (`spec.md`
//! §4.6): 16 KiB chunking with per-chunk SHA-256 verification, a
//! sliding-window ack/retry protocol, backpressure-aware sending, and
//! idle-timeout sweeping.
//!
//! ## Modules
//!
//! - [`chunking`] — splitting a file into 16 KiB chunks, per-chunk
//!   hashing, reassembly by index
//! - [`transfer`] — the sender and receiver state machines, protocol
//!   messages, and the idle-sweep timer
//!
//! ## Key parameters
//!
//! | Parameter | Value |
//! |---|---|
//! | Chunk size | 16 KiB |
//! | Max chunks in flight (sender window) | 16 |
//! | Max retries per chunk | 5 |
//! | Per-chunk ack timeout | 30 s |
//! | Transfer idle timeout | 60 s |
//! | Idle sweep interval | 5 s |
//! | Default max file size | 100 MiB |

pub mod chunking;
pub mod transfer;

/// Plaintext chunk size (`spec.md` §3).
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Sliding-window limit on un-acked chunks in flight (`spec.md` §4.6 step 2).
pub const MAX_CHUNKS_IN_FLIGHT: usize = 16;

/// A chunk is failed after this many send attempts (`spec.md` §4.6 step 5).
pub const MAX_RETRIES_PER_CHUNK: u32 = 5;

/// Per-chunk ack timer (`spec.md` §4.6 step 3, §5).
pub const CHUNK_ACK_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// A transfer with no activity for this long is failed (`spec.md` §4.6 "Idle & timeout").
pub const TRANSFER_IDLE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// How often the idle sweep runs (`spec.md` §4.6 "Idle & timeout").
pub const IDLE_CHECK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

/// Default ceiling on total file size; the receiver rejects anything
/// larger at `file_start` (`spec.md` §4.6 step 1).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Error types for file transfer operations.
#[derive(Debug, thiserror::Error)]
pub enum FileTransferError {
    /// A chunk is missing during reassembly.
    #[error("missing chunk {index} of {total}")]
    MissingChunk { index: u32, total: u32 },

    /// A chunk's plaintext hash did not match any authoritative source
    /// (`file_start.chunkHashes` or the in-message `hash`).
    #[error("chunk {index} hash mismatch")]
    ChunkHashMismatch { index: u32 },

    /// Neither `file_start.chunkHashes` nor an in-message `hash` was
    /// supplied for a chunk; rejection is required (`spec.md` §4.6
    /// invariants).
    #[error("chunk {index} has no authoritative hash to verify against")]
    NoAuthoritativeHash { index: u32 },

    /// The whole-file SHA-256 did not match the announced `fileHash`.
    #[error("whole-file hash mismatch")]
    FileHashMismatch,

    /// `file_start.totalSize` exceeds the receiver's configured ceiling.
    #[error("file too large: {size} bytes exceeds maximum of {max} bytes")]
    FileTooLarge { size: u64, max: u64 },

    /// `file_start` fields are internally inconsistent (e.g. `totalChunks
    /// = 0` with `totalSize > 0`).
    #[error("invalid transfer parameters: {0}")]
    InvalidParameters(String),

    /// A chunk was acked/retried/requested for a `file_id` with no active
    /// context.
    #[error("no active transfer for file {0}")]
    UnknownTransfer(String),

    /// A chunk exceeded `MAX_RETRIES_PER_CHUNK` without a successful ack.
    #[error("chunk {index} exceeded {max_retries} retries")]
    RetriesExhausted { index: u32, max_retries: u32 },

    /// The transfer was idle longer than `TRANSFER_IDLE_TIMEOUT`.
    #[error("transfer timed out")]
    Timeout,

    /// The transfer was cancelled by either side.
    #[error("transfer cancelled: {0}")]
    Cancelled(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Cryptographic error from `zajel-crypto` (AEAD decrypt of a chunk
    /// payload failed).
    #[error("crypto error: {0}")]
    Crypto(#[from] zajel_crypto::CryptoError),
}

pub type Result<T> = std::result::Result<T, FileTransferError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(CHUNK_SIZE, 16 * 1024);
        assert_eq!(MAX_CHUNKS_IN_FLIGHT, 16);
        assert_eq!(MAX_RETRIES_PER_CHUNK, 5);
        assert_eq!(DEFAULT_MAX_FILE_SIZE, 100 * 1024 * 1024);
    }

    #[test]
    fn test_error_display() {
        let err = FileTransferError::MissingChunk { index: 2, total: 5 };
        assert!(err.to_string().contains("2"));
        assert!(err.to_string().contains("5"));
    }
}
