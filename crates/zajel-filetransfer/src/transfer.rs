//! Sender and receiver state machines for reliable chunked file transfer
//! (`spec.md` §4.6).
//!
//! Both machines are pure: driving them with an incoming [`TransferMessage`]
//! or a timer tick returns the messages the caller must send and the
//! [`TransferEvent`]s the caller should surface to the application. Neither
//! machine owns a socket or a timer of its own — the connection manager
//! (`zajel-client`) is responsible for delivering messages, polling
//! [`SenderTransfer::sweep`]/[`ReceiverTransfer`] idle checks on a ticker,
//! and running chunk payloads through a [`ChunkCipher`].

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chunking::{self, PlainChunk};
use crate::{
    FileTransferError, Result, CHUNK_ACK_TIMEOUT, MAX_CHUNKS_IN_FLIGHT, MAX_RETRIES_PER_CHUNK, TRANSFER_IDLE_TIMEOUT,
};

/// Encrypts/decrypts one 16 KiB plaintext chunk payload. Implemented for
/// [`zajel_crypto::session::Session`] below; the connection manager wires
/// a peer's established session in here so this crate never has to know
/// about transport or handshake state.
pub trait ChunkCipher {
    fn encrypt_chunk(&mut self, plaintext: &[u8]) -> zajel_crypto::Result<Vec<u8>>;
    fn decrypt_chunk(&mut self, frame: &[u8]) -> zajel_crypto::Result<Vec<u8>>;
}

impl ChunkCipher for zajel_crypto::session::Session {
    fn encrypt_chunk(&mut self, plaintext: &[u8]) -> zajel_crypto::Result<Vec<u8>> {
        self.encrypt(zajel_crypto::session::Channel::Binary, plaintext)
    }

    fn decrypt_chunk(&mut self, frame: &[u8]) -> zajel_crypto::Result<Vec<u8>> {
        self.decrypt(zajel_crypto::session::Channel::Binary, frame)
    }
}

/// `transfer_cancel.reason` (`spec.md` §4.6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    UserCancelled,
    Error,
    Timeout,
}

/// `chunk_ack.status` (`spec.md` §4.6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkAckStatus {
    Received,
    Failed,
}

/// `file_complete_ack.status` (`spec.md` §4.6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompleteStatus {
    Success,
    Failed,
}

/// `file_start_ack.reason` for a rejected transfer (`spec.md` §4.6 step 1).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    TooLarge,
    InvalidParameters,
}

/// The closed set of wire messages on the `files` channel (`spec.md`
/// §4.6). Each chunk's `data` is the base64-opaque (here: raw bytes —
/// base64 framing is a transport/JSON-encoding concern, not this crate's)
/// AEAD ciphertext of one plaintext chunk.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferMessage {
    FileStart {
        #[serde(rename = "fileId")]
        file_id: String,
        #[serde(rename = "fileName")]
        file_name: String,
        #[serde(rename = "totalSize")]
        total_size: u64,
        #[serde(rename = "totalChunks")]
        total_chunks: u32,
        #[serde(rename = "chunkHashes", skip_serializing_if = "Option::is_none")]
        chunk_hashes: Option<Vec<[u8; 32]>>,
    },
    FileStartAck {
        #[serde(rename = "fileId")]
        file_id: String,
        accepted: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<RejectReason>,
    },
    FileChunk {
        #[serde(rename = "fileId")]
        file_id: String,
        #[serde(rename = "chunkIndex")]
        chunk_index: u32,
        data: Vec<u8>,
        #[serde(skip_serializing_if = "Option::is_none")]
        hash: Option<[u8; 32]>,
    },
    ChunkAck {
        #[serde(rename = "fileId")]
        file_id: String,
        #[serde(rename = "chunkIndex")]
        chunk_index: u32,
        status: ChunkAckStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        hash: Option<[u8; 32]>,
    },
    ChunkRetry {
        #[serde(rename = "fileId")]
        file_id: String,
        #[serde(rename = "chunkIndices")]
        chunk_indices: Vec<u32>,
    },
    FileComplete {
        #[serde(rename = "fileId")]
        file_id: String,
        #[serde(rename = "fileHash", skip_serializing_if = "Option::is_none")]
        file_hash: Option<[u8; 32]>,
    },
    FileCompleteAck {
        #[serde(rename = "fileId")]
        file_id: String,
        status: CompleteStatus,
        #[serde(rename = "missingChunks", skip_serializing_if = "Option::is_none")]
        missing_chunks: Option<Vec<u32>>,
        #[serde(rename = "fileHash", skip_serializing_if = "Option::is_none")]
        file_hash: Option<[u8; 32]>,
    },
    TransferCancel {
        #[serde(rename = "fileId")]
        file_id: String,
        reason: CancelReason,
    },
}

/// Events the caller should surface to the application (`spec.md` §4.3
/// `file_events` stream).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferEvent {
    Progress { bytes_transferred: u64, total_size: u64 },
    Complete,
    Failed { reason: String },
    Cancelled { reason: CancelReason },
}

/// Sender-side transfer state (`spec.md` §3 "Transfer state").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SenderState {
    Pending,
    AwaitingStartAck,
    Transferring,
    AwaitingCompleteAck,
    Complete,
    Failed,
    Cancelled,
}

struct SenderChunk {
    payload: Vec<u8>,
    hash: [u8; 32],
    sent_at: Option<Instant>,
    retries: u32,
    acked: bool,
}

/// Drives one outbound file transfer.
pub struct SenderTransfer {
    pub file_id: String,
    pub file_name: String,
    pub total_size: u64,
    pub state: SenderState,
    pub last_activity: Instant,
    chunks: Vec<SenderChunk>,
    plain_hashes: Vec<[u8; 32]>,
    whole_file_hash: [u8; 32],
}

impl SenderTransfer {
    /// Chunk and pre-encrypt `data`, returning a transfer in state
    /// `Pending`. Call [`SenderTransfer::start`] to get the `file_start`
    /// message to send.
    pub fn new(file_name: impl Into<String>, data: &[u8], cipher: &mut impl ChunkCipher) -> zajel_crypto::Result<Self> {
        let plain_chunks: Vec<PlainChunk> = chunking::split(data);
        let plain_hashes = chunking::chunk_hashes(&plain_chunks);

        let mut chunks = Vec::with_capacity(plain_chunks.len());
        for chunk in &plain_chunks {
            let payload = cipher.encrypt_chunk(&chunk.data)?;
            chunks.push(SenderChunk {
                payload,
                hash: chunk.hash,
                sent_at: None,
                retries: 0,
                acked: false,
            });
        }

        Ok(Self {
            file_id: Uuid::new_v4().to_string(),
            file_name: file_name.into(),
            total_size: data.len() as u64,
            state: SenderState::Pending,
            last_activity: Instant::now(),
            chunks,
            plain_hashes,
            whole_file_hash: chunking::whole_file_hash(data),
        })
    }

    pub fn total_chunks(&self) -> u32 {
        self.chunks.len() as u32
    }

    /// Step 1: announce the transfer. Transitions to `AwaitingStartAck`.
    pub fn start(&mut self) -> TransferMessage {
        self.state = SenderState::AwaitingStartAck;
        self.last_activity = Instant::now();
        TransferMessage::FileStart {
            file_id: self.file_id.clone(),
            file_name: self.file_name.clone(),
            total_size: self.total_size,
            total_chunks: self.total_chunks(),
            chunk_hashes: Some(self.plain_hashes.clone()),
        }
    }

    /// Step 2: the receiver answered `file_start`. On acceptance,
    /// transitions to `Transferring` and returns the first window of
    /// chunks to send; on rejection, transitions to `Failed`.
    pub fn on_start_ack(&mut self, accepted: bool) -> Vec<TransferMessage> {
        self.last_activity = Instant::now();
        if !accepted {
            self.state = SenderState::Failed;
            return Vec::new();
        }
        self.state = SenderState::Transferring;
        self.fill_window(Instant::now())
    }

    /// Fill the sliding window (`MAX_CHUNKS_IN_FLIGHT`) with any un-sent or
    /// due-for-retry chunks, marking them sent and arming their ack timer.
    fn fill_window(&mut self, now: Instant) -> Vec<TransferMessage> {
        if self.state != SenderState::Transferring {
            return Vec::new();
        }
        let in_flight = self.chunks.iter().filter(|c| !c.acked && c.sent_at.is_some()).count();
        let mut slots = MAX_CHUNKS_IN_FLIGHT.saturating_sub(in_flight);
        let mut out = Vec::new();

        for (index, chunk) in self.chunks.iter_mut().enumerate() {
            if slots == 0 {
                break;
            }
            if chunk.acked || chunk.sent_at.is_some() {
                continue;
            }
            chunk.sent_at = Some(now);
            out.push(TransferMessage::FileChunk {
                file_id: self.file_id.clone(),
                chunk_index: index as u32,
                data: chunk.payload.clone(),
                hash: Some(chunk.hash),
            });
            slots -= 1;
        }
        out
    }

    /// Step 4/5: a `chunk_ack` arrived. On success, marks the chunk acked
    /// and refills the window; possibly returns `file_complete` if this
    /// was the last outstanding chunk. On failure (or a hash mismatch the
    /// receiver reported), clears the pending slot and resends
    /// immediately, counting the attempt.
    pub fn on_chunk_ack(&mut self, chunk_index: u32, status: ChunkAckStatus) -> Result<Vec<TransferMessage>> {
        self.last_activity = Instant::now();
        let chunk = self
            .chunks
            .get_mut(chunk_index as usize)
            .ok_or(FileTransferError::InvalidParameters(format!("unknown chunk index {chunk_index}")))?;

        match status {
            ChunkAckStatus::Received => {
                chunk.acked = true;
            }
            ChunkAckStatus::Failed => {
                chunk.sent_at = None;
                chunk.retries += 1;
                if chunk.retries > MAX_RETRIES_PER_CHUNK {
                    self.state = SenderState::Failed;
                    return Err(FileTransferError::RetriesExhausted {
                        index: chunk_index,
                        max_retries: MAX_RETRIES_PER_CHUNK,
                    });
                }
            }
        }

        let mut out = self.fill_window(Instant::now());
        if self.all_acked() {
            out.push(self.complete_message());
        }
        Ok(out)
    }

    fn all_acked(&self) -> bool {
        self.state == SenderState::Transferring && self.chunks.iter().all(|c| c.acked)
    }

    fn complete_message(&mut self) -> TransferMessage {
        self.state = SenderState::AwaitingCompleteAck;
        TransferMessage::FileComplete {
            file_id: self.file_id.clone(),
            file_hash: Some(self.whole_file_hash),
        }
    }

    /// Step 7: the receiver's `file_complete_ack` arrived. On success,
    /// transitions to `Complete`. On `missingChunks`, resets those chunks
    /// to un-acked/un-sent and resumes `Transferring`, returning the
    /// re-sent chunks.
    pub fn on_complete_ack(
        &mut self,
        status: CompleteStatus,
        missing_chunks: Option<Vec<u32>>,
    ) -> Result<Vec<TransferMessage>> {
        self.last_activity = Instant::now();
        match status {
            CompleteStatus::Success => {
                self.state = SenderState::Complete;
                Ok(Vec::new())
            }
            CompleteStatus::Failed => {
                self.state = SenderState::Transferring;
                for index in missing_chunks.unwrap_or_default() {
                    if let Some(chunk) = self.chunks.get_mut(index as usize) {
                        chunk.acked = false;
                        chunk.sent_at = None;
                    }
                }
                Ok(self.fill_window(Instant::now()))
            }
        }
    }

    /// Per-chunk ack-timer sweep (`spec.md` §4.6 step 5): any in-flight
    /// chunk whose ack timer has expired is resent, counting the attempt.
    /// Fails the transfer once any chunk exceeds `MAX_RETRIES_PER_CHUNK`.
    pub fn sweep(&mut self, now: Instant) -> Result<Vec<TransferMessage>> {
        if self.state != SenderState::Transferring {
            return Ok(Vec::new());
        }
        let mut expired = Vec::new();
        for (index, chunk) in self.chunks.iter_mut().enumerate() {
            if chunk.acked {
                continue;
            }
            if let Some(sent_at) = chunk.sent_at {
                if now.duration_since(sent_at) >= CHUNK_ACK_TIMEOUT {
                    chunk.sent_at = None;
                    chunk.retries += 1;
                    if chunk.retries > MAX_RETRIES_PER_CHUNK {
                        self.state = SenderState::Failed;
                        return Err(FileTransferError::RetriesExhausted {
                            index: index as u32,
                            max_retries: MAX_RETRIES_PER_CHUNK,
                        });
                    }
                    expired.push(index);
                }
            }
        }
        if expired.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.fill_window(now))
    }

    /// Whether this transfer has been idle longer than
    /// `TRANSFER_IDLE_TIMEOUT` and is not already terminal.
    pub fn is_idle(&self, now: Instant) -> bool {
        !self.is_terminal() && now.duration_since(self.last_activity) >= TRANSFER_IDLE_TIMEOUT
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, SenderState::Complete | SenderState::Failed | SenderState::Cancelled)
    }

    pub fn cancel(&mut self, reason: CancelReason) -> TransferMessage {
        self.state = SenderState::Cancelled;
        TransferMessage::TransferCancel {
            file_id: self.file_id.clone(),
            reason,
        }
    }

    pub fn bytes_acked(&self) -> u64 {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.acked)
            .map(|(i, _)| chunk_len(i, self.chunks.len(), self.total_size))
            .sum()
    }
}

fn chunk_len(index: usize, total_chunks: usize, total_size: u64) -> u64 {
    let full = crate::CHUNK_SIZE as u64;
    if index + 1 == total_chunks {
        total_size - full * index as u64
    } else {
        full
    }
}

/// Receiver-side transfer state (`spec.md` §3 "Transfer state": receiver
/// only ever occupies `receiving -> complete | failed | cancelled`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiverState {
    Receiving,
    Complete,
    Failed,
    Cancelled,
}

/// Drives one inbound file transfer.
pub struct ReceiverTransfer {
    pub file_id: String,
    pub file_name: String,
    pub total_size: u64,
    pub total_chunks: u32,
    pub state: ReceiverState,
    pub last_activity: Instant,
    expected_hashes: Option<Vec<[u8; 32]>>,
    received: BTreeMap<u32, Vec<u8>>,
}

/// Strip path separators, `..`, control bytes and NUL from a received
/// file name, then truncate to a conservative cross-platform length
/// ceiling (`spec.md` §4.6 step 1).
pub fn sanitize_file_name(name: &str) -> String {
    const MAX_LEN: usize = 255;
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | '\0') && !c.is_control())
        .collect();
    let cleaned = cleaned.replace("..", "");
    let trimmed = cleaned.trim();
    let sanitized = if trimmed.is_empty() { "unnamed_file".to_string() } else { trimmed.to_string() };
    sanitized.chars().take(MAX_LEN).collect()
}

impl ReceiverTransfer {
    /// Step 1: validate an incoming `file_start`. Returns the new
    /// transfer (state `Receiving`) paired with the `file_start_ack` to
    /// send, or `None` with a rejecting ack if validation fails.
    pub fn on_file_start(
        file_id: String,
        file_name: String,
        total_size: u64,
        total_chunks: u32,
        chunk_hashes: Option<Vec<[u8; 32]>>,
        max_file_size: u64,
    ) -> (Option<Self>, TransferMessage) {
        if total_size > max_file_size {
            return (
                None,
                TransferMessage::FileStartAck {
                    file_id,
                    accepted: false,
                    reason: Some(RejectReason::TooLarge),
                },
            );
        }
        if (total_chunks == 0) != (total_size == 0) {
            return (
                None,
                TransferMessage::FileStartAck {
                    file_id,
                    accepted: false,
                    reason: Some(RejectReason::InvalidParameters),
                },
            );
        }

        let transfer = Self {
            file_id: file_id.clone(),
            file_name: sanitize_file_name(&file_name),
            total_size,
            total_chunks,
            state: ReceiverState::Receiving,
            last_activity: Instant::now(),
            expected_hashes: chunk_hashes,
            received: BTreeMap::new(),
        };

        (
            Some(transfer),
            TransferMessage::FileStartAck {
                file_id,
                accepted: true,
                reason: None,
            },
        )
    }

    /// Step 2: a `file_chunk` arrived. Decrypts, verifies against the
    /// authoritative hash (from `file_start.chunkHashes` or the
    /// in-message `hash`; rejects if neither was supplied), and stores
    /// the plaintext on success.
    pub fn on_chunk(
        &mut self,
        chunk_index: u32,
        ciphertext: &[u8],
        in_message_hash: Option<[u8; 32]>,
        cipher: &mut impl ChunkCipher,
    ) -> TransferMessage {
        self.last_activity = Instant::now();

        let authoritative = self
            .expected_hashes
            .as_ref()
            .and_then(|hashes| hashes.get(chunk_index as usize).copied())
            .or(in_message_hash);

        let Some(expected) = authoritative else {
            return self.chunk_ack(chunk_index, ChunkAckStatus::Failed, None);
        };

        let plaintext = match cipher.decrypt_chunk(ciphertext) {
            Ok(p) => p,
            Err(_) => return self.chunk_ack(chunk_index, ChunkAckStatus::Failed, None),
        };

        let actual = zajel_crypto::sha256::hash(&plaintext);
        if actual != expected {
            return self.chunk_ack(chunk_index, ChunkAckStatus::Failed, Some(actual));
        }

        self.received.insert(chunk_index, plaintext);
        self.chunk_ack(chunk_index, ChunkAckStatus::Received, Some(actual))
    }

    fn chunk_ack(&self, chunk_index: u32, status: ChunkAckStatus, hash: Option<[u8; 32]>) -> TransferMessage {
        TransferMessage::ChunkAck {
            file_id: self.file_id.clone(),
            chunk_index,
            status,
            hash,
        }
    }

    /// Step 3: a `file_complete` arrived. If any chunks are missing,
    /// replies `failed` with the gaps and also returns a `chunk_retry`
    /// request; otherwise assembles, verifies the whole-file hash if
    /// supplied, and replies `success`.
    pub fn on_complete(&mut self, file_hash: Option<[u8; 32]>) -> (Vec<TransferMessage>, Option<Vec<u8>>) {
        self.last_activity = Instant::now();
        let missing = chunking::missing_indices(self.total_chunks, &self.received);
        if !missing.is_empty() {
            return (
                vec![
                    TransferMessage::FileCompleteAck {
                        file_id: self.file_id.clone(),
                        status: CompleteStatus::Failed,
                        missing_chunks: Some(missing.clone()),
                        file_hash: None,
                    },
                    TransferMessage::ChunkRetry {
                        file_id: self.file_id.clone(),
                        chunk_indices: missing,
                    },
                ],
                None,
            );
        }

        let hashes = self.expected_hashes.clone().unwrap_or_default();
        let assembled = match chunking::assemble(self.total_chunks, self.total_size, &hashes, &self.received) {
            Ok(bytes) => bytes,
            Err(_) => {
                self.state = ReceiverState::Failed;
                return (
                    vec![TransferMessage::FileCompleteAck {
                        file_id: self.file_id.clone(),
                        status: CompleteStatus::Failed,
                        missing_chunks: None,
                        file_hash: None,
                    }],
                    None,
                );
            }
        };

        if let Some(expected) = file_hash {
            let actual = chunking::whole_file_hash(&assembled);
            if actual != expected {
                self.state = ReceiverState::Failed;
                return (
                    vec![TransferMessage::FileCompleteAck {
                        file_id: self.file_id.clone(),
                        status: CompleteStatus::Failed,
                        missing_chunks: None,
                        file_hash: Some(actual),
                    }],
                    None,
                );
            }
        }

        self.state = ReceiverState::Complete;
        (
            vec![TransferMessage::FileCompleteAck {
                file_id: self.file_id.clone(),
                status: CompleteStatus::Success,
                missing_chunks: None,
                file_hash: Some(chunking::whole_file_hash(&assembled)),
            }],
            Some(assembled),
        )
    }

    pub fn is_idle(&self, now: Instant) -> bool {
        !self.is_terminal() && now.duration_since(self.last_activity) >= TRANSFER_IDLE_TIMEOUT
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, ReceiverState::Complete | ReceiverState::Failed | ReceiverState::Cancelled)
    }

    pub fn cancel(&mut self, reason: CancelReason) -> TransferMessage {
        self.state = ReceiverState::Cancelled;
        TransferMessage::TransferCancel {
            file_id: self.file_id.clone(),
            reason,
        }
    }

    pub fn bytes_received(&self) -> u64 {
        self.received.values().map(|v| v.len() as u64).sum()
    }
}

/// How long between idle sweeps (`spec.md` §4.6 "Idle & timeout"):
/// re-exported for callers scheduling the ticker.
pub const fn idle_check_interval() -> Duration {
    crate::IDLE_CHECK_INTERVAL
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestCipher;
    impl ChunkCipher for TestCipher {
        fn encrypt_chunk(&mut self, plaintext: &[u8]) -> zajel_crypto::Result<Vec<u8>> {
            Ok(plaintext.to_vec())
        }
        fn decrypt_chunk(&mut self, frame: &[u8]) -> zajel_crypto::Result<Vec<u8>> {
            Ok(frame.to_vec())
        }
    }

    fn paired_sessions() -> (zajel_crypto::session::Session, zajel_crypto::session::Session) {
        use zajel_crypto::x25519::X25519StaticSecret;
        let a = X25519StaticSecret::random();
        let b = X25519StaticSecret::random();
        let a_pk = a.public_key().to_bytes();
        let b_pk = b.public_key().to_bytes();
        (
            zajel_crypto::session::Session::establish(&a, &b_pk, "b").expect("establish"),
            zajel_crypto::session::Session::establish(&b, &a_pk, "a").expect("establish"),
        )
    }

    #[test]
    fn full_transfer_happy_path() {
        let mut cipher = TestCipher;
        let data = vec![0xABu8; crate::CHUNK_SIZE * 3];
        let mut sender = SenderTransfer::new("report.pdf", &data, &mut cipher).expect("new sender");

        let start = sender.start();
        let TransferMessage::FileStart { file_id, total_size, total_chunks, chunk_hashes, .. } = start.clone() else {
            panic!("expected file_start")
        };

        let (mut receiver_opt, ack) = ReceiverTransfer::on_file_start(
            file_id,
            "report.pdf".to_string(),
            total_size,
            total_chunks,
            chunk_hashes,
            crate::DEFAULT_MAX_FILE_SIZE,
        );
        let TransferMessage::FileStartAck { accepted, .. } = ack else { panic!("expected ack") };
        assert!(accepted);
        let receiver = receiver_opt.as_mut().expect("accepted");

        let first_batch = sender.on_start_ack(true);
        assert_eq!(first_batch.len(), 3);

        for msg in first_batch {
            let TransferMessage::FileChunk { chunk_index, data, hash, .. } = msg else { panic!() };
            let ack = receiver.on_chunk(chunk_index, &data, hash, &mut cipher);
            let TransferMessage::ChunkAck { chunk_index, status, .. } = ack else { panic!() };
            assert_eq!(status, ChunkAckStatus::Received);
            let more = sender.on_chunk_ack(chunk_index, ChunkAckStatus::Received).expect("ack ok");
            for m in more {
                if let TransferMessage::FileComplete { file_hash, .. } = m {
                    let (acks, assembled) = receiver.on_complete(file_hash);
                    assert!(assembled.is_some());
                    for a in acks {
                        if let TransferMessage::FileCompleteAck { status, .. } = a {
                            assert_eq!(status, CompleteStatus::Success);
                            sender.on_complete_ack(status, None).expect("complete ack");
                        }
                    }
                }
            }
        }

        assert_eq!(sender.state, SenderState::Complete);
        assert_eq!(receiver.state, ReceiverState::Complete);
        assert_eq!(receiver.bytes_received(), data.len() as u64);
    }

    #[test]
    fn sender_retransmits_on_ack_timeout() {
        let mut cipher = TestCipher;
        let data = vec![0x11u8; crate::CHUNK_SIZE];
        let mut sender = SenderTransfer::new("f", &data, &mut cipher).expect("new");
        sender.start();
        let sent = sender.on_start_ack(true);
        assert_eq!(sent.len(), 1);

        let far_future = Instant::now() + CHUNK_ACK_TIMEOUT + Duration::from_secs(1);
        let resent = sender.sweep(far_future).expect("sweep");
        assert_eq!(resent.len(), 1);
        assert!(matches!(resent[0], TransferMessage::FileChunk { chunk_index: 0, .. }));
    }

    #[test]
    fn sender_fails_after_max_retries() {
        let mut cipher = TestCipher;
        let data = vec![0x22u8; crate::CHUNK_SIZE];
        let mut sender = SenderTransfer::new("f", &data, &mut cipher).expect("new");
        sender.start();
        sender.on_start_ack(true);

        let mut now = Instant::now();
        for _ in 0..MAX_RETRIES_PER_CHUNK {
            now += CHUNK_ACK_TIMEOUT + Duration::from_millis(1);
            sender.sweep(now).expect("sweep ok while under budget");
        }
        now += CHUNK_ACK_TIMEOUT + Duration::from_millis(1);
        let err = sender.sweep(now).unwrap_err();
        assert!(matches!(err, FileTransferError::RetriesExhausted { index: 0, .. }));
        assert_eq!(sender.state, SenderState::Failed);
    }

    #[test]
    fn receiver_rejects_oversized_file() {
        let (_, ack) = ReceiverTransfer::on_file_start(
            "f".into(),
            "big.bin".into(),
            200 * 1024 * 1024,
            100,
            None,
            crate::DEFAULT_MAX_FILE_SIZE,
        );
        let TransferMessage::FileStartAck { accepted, reason, .. } = ack else { panic!() };
        assert!(!accepted);
        assert_eq!(reason, Some(RejectReason::TooLarge));
    }

    #[test]
    fn receiver_rejects_inconsistent_parameters() {
        let (opt, ack) = ReceiverTransfer::on_file_start("f".into(), "x".into(), 100, 0, None, crate::DEFAULT_MAX_FILE_SIZE);
        assert!(opt.is_none());
        let TransferMessage::FileStartAck { accepted, reason, .. } = ack else { panic!() };
        assert!(!accepted);
        assert_eq!(reason, Some(RejectReason::InvalidParameters));
    }

    #[test]
    fn receiver_rejects_chunk_with_no_authoritative_hash() {
        let (opt, _) = ReceiverTransfer::on_file_start(
            "f".into(),
            "x.bin".into(),
            10,
            1,
            None,
            crate::DEFAULT_MAX_FILE_SIZE,
        );
        let mut receiver = opt.expect("accepted");
        let mut cipher = TestCipher;
        let ack = receiver.on_chunk(0, b"ciphertext", None, &mut cipher);
        let TransferMessage::ChunkAck { status, .. } = ack else { panic!() };
        assert_eq!(status, ChunkAckStatus::Failed);
    }

    #[test]
    fn receiver_rejects_tampered_chunk() {
        let expected_hash = zajel_crypto::sha256::hash(b"correct data");
        let (opt, _) =
            ReceiverTransfer::on_file_start("f".into(), "x.bin".into(), 12, 1, Some(vec![expected_hash]), crate::DEFAULT_MAX_FILE_SIZE);
        let mut receiver = opt.expect("accepted");
        let mut cipher = TestCipher;
        let ack = receiver.on_chunk(0, b"wrong data!!", None, &mut cipher);
        let TransferMessage::ChunkAck { status, .. } = ack else { panic!() };
        assert_eq!(status, ChunkAckStatus::Failed);
    }

    #[test]
    fn on_complete_with_gap_requests_retry() {
        let (opt, _) =
            ReceiverTransfer::on_file_start("f".into(), "x.bin".into(), crate::CHUNK_SIZE as u64 * 2, 2, None, crate::DEFAULT_MAX_FILE_SIZE);
        let mut receiver = opt.expect("accepted");
        receiver.received.insert(0, vec![0u8; crate::CHUNK_SIZE]);
        // chunk 1 never arrived
        let (msgs, assembled) = receiver.on_complete(None);
        assert!(assembled.is_none());
        assert!(matches!(msgs[0], TransferMessage::FileCompleteAck { status: CompleteStatus::Failed, .. }));
        assert!(matches!(msgs[1], TransferMessage::ChunkRetry { .. }));
    }

    #[test]
    fn sanitize_strips_traversal_and_separators() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "etcpasswd");
        assert_eq!(sanitize_file_name("a/b\\c"), "abc");
        assert_eq!(sanitize_file_name(""), "unnamed_file");
    }

    #[test]
    fn cipher_roundtrips_through_real_session() {
        let (mut a, mut b) = paired_sessions();
        let frame = a.encrypt_chunk(b"plaintext chunk").expect("encrypt");
        let plain = b.decrypt_chunk(&frame).expect("decrypt");
        assert_eq!(plain, b"plaintext chunk");
    }

    #[test]
    fn idle_transfer_detected() {
        let mut cipher = TestCipher;
        let sender = SenderTransfer::new("f", b"x", &mut cipher).expect("new");
        assert!(!sender.is_idle(Instant::now()));
        assert!(sender.is_idle(Instant::now() + TRANSFER_IDLE_TIMEOUT + Duration::from_secs(1)));
    }

    #[test]
    fn cancel_transitions_to_cancelled() {
        let mut cipher = TestCipher;
        let mut sender = SenderTransfer::new("f", b"x", &mut cipher).expect("new");
        let msg = sender.cancel(CancelReason::UserCancelled);
        assert!(matches!(msg, TransferMessage::TransferCancel { reason: CancelReason::UserCancelled, .. }));
        assert_eq!(sender.state, SenderState::Cancelled);
        assert!(sender.is_terminal());
    }
}
