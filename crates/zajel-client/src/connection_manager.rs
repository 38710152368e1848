//! The per-peer connection state machine (`spec.md` §4.3): turns
//! coordinator pairing events into established QUIC sessions, and owns
//! the per-peer text and file-transfer traffic once connected.
//!
//! Grounded on `ochra-daemon/src/main.rs`'s single-struct, one-event-loop
//! process shape: one `ConnectionManager` owns everything a running
//! client needs (signaling handle, QUIC node, peer table, db handle,
//! event bus) behind an `Arc`, cloned cheaply into every background task.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use quinn::Connection;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tracing::{debug, info, warn};

use zajel_crypto::session::{Channel, Session};
use zajel_crypto::sha256;
use zajel_crypto::x25519::X25519StaticSecret;
use zajel_filetransfer::transfer::{
    self, CompleteStatus, ReceiverTransfer, SenderTransfer, TransferMessage,
};
use zajel_rendezvous::pairing_code::PairingCode;
use zajel_rendezvous::rendezvous::{RendezvousEffect, RendezvousEngine};
use zajel_signaling::client::SignalingHandle;
use zajel_signaling::messages::{ClientMessage, ServerMessage, WireBytes, WireKey};
use zajel_transport::backpressure::Backpressure;
use zajel_transport::handshake;
use zajel_transport::quic::{PeerStreams, QuicNode, MAX_FRAME_SIZE};
use zajel_types::events::EventType;
use zajel_types::identity::{ConnectionState as PeerState, Peer};

use crate::events::EventBus;

/// Outbound text messages queued for a peer that isn't connected yet are
/// dropped oldest-first past this bound (`spec.md` §4.3).
const PENDING_QUEUE_CAP: usize = 256;

/// How often the rendezvous engine is ticked to refresh its registrations.
const RENDEZVOUS_TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(300);

pub type PeerId = String;
pub type FileId = String;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
    #[error("peer {0} is not connected")]
    NotConnected(String),
    #[error("invalid pairing code: {0}")]
    InvalidPairingCode(String),
    #[error("io error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, ConnectionError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Initiator,
    Answerer,
}

enum OutboundFile {
    Send { file_name: String, data: Vec<u8>, reply: oneshot::Sender<FileId> },
}

struct PeerContext {
    peer_code: String,
    public_key: [u8; 32],
    state: PeerState,
    pending_text: VecDeque<Vec<u8>>,
    outbound_text: Option<mpsc::UnboundedSender<Vec<u8>>>,
    outbound_file: Option<mpsc::UnboundedSender<OutboundFile>>,
}

impl PeerContext {
    fn new(peer_code: String, public_key: [u8; 32]) -> Self {
        Self {
            peer_code,
            public_key,
            state: PeerState::Connecting,
            pending_text: VecDeque::new(),
            outbound_text: None,
            outbound_file: None,
        }
    }
}

struct Inner {
    self_secret: X25519StaticSecret,
    self_public_key: [u8; 32],
    quic: Arc<QuicNode>,
    signaling: SignalingHandle,
    events: EventBus,
    db: Arc<AsyncMutex<rusqlite::Connection>>,
    downloads_dir: PathBuf,
    max_file_size: u64,
    rendezvous: AsyncMutex<RendezvousEngine>,
    peers: AsyncMutex<HashMap<PeerId, PeerContext>>,
    code_to_peer: AsyncMutex<HashMap<String, PeerId>>,
    pending_addrs: AsyncMutex<HashMap<SocketAddr, PeerId>>,
}

/// Owns every active and pending peer connection. Cheap to clone; every
/// background task holds one.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Connect to a coordinator, register, and start the background
    /// tasks that drain inbound signaling messages and incoming QUIC
    /// connections.
    #[allow(clippy::too_many_arguments)]
    pub fn connect(
        server_url: impl Into<String>,
        self_secret: X25519StaticSecret,
        self_code: PairingCode,
        quic: Arc<QuicNode>,
        events: EventBus,
        db: Arc<AsyncMutex<rusqlite::Connection>>,
        downloads_dir: PathBuf,
        max_file_size: u64,
    ) -> Self {
        let self_public_key = self_secret.public_key().to_bytes();
        let (signaling, mut inbound) = zajel_signaling::client::connect(server_url);

        let rendezvous = RendezvousEngine::new(self_public_key, self_secret.clone(), self_code.clone());

        let manager = Self {
            inner: Arc::new(Inner {
                self_secret,
                self_public_key,
                quic,
                signaling: signaling.clone(),
                events,
                db,
                downloads_dir,
                max_file_size,
                rendezvous: AsyncMutex::new(rendezvous),
                peers: AsyncMutex::new(HashMap::new()),
                code_to_peer: AsyncMutex::new(HashMap::new()),
                pending_addrs: AsyncMutex::new(HashMap::new()),
            }),
        };

        let _ = signaling.send(ClientMessage::Register {
            pairing_code: self_code.as_str().to_string(),
            public_key: WireKey::encode(&self_public_key),
            capacity: None,
        });

        let inbound_manager = manager.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                inbound_manager.handle_server_message(message).await;
            }
        });

        let accept_manager = manager.clone();
        tokio::spawn(async move { accept_manager.accept_loop().await });

        let rendezvous_manager = manager.clone();
        tokio::spawn(async move { rendezvous_manager.rendezvous_loop().await });

        manager
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Ask the coordinator to pair us with `target_code` (`spec.md` §4.4
    /// "initiate a pairing attempt").
    pub fn connect_to_peer(&self, target_code: &str) -> Result<()> {
        let code =
            PairingCode::parse(target_code).map_err(|e| ConnectionError::InvalidPairingCode(e.to_string()))?;
        self.inner
            .signaling
            .send(ClientMessage::PairRequest { target_code: code.as_str().to_string() })
            .map_err(|_| ConnectionError::NotConnected("signaling".to_string()))
    }

    /// Accept or reject an incoming pairing request.
    pub fn respond_to_pair(&self, target_code: &str, accept: bool) -> Result<()> {
        self.inner
            .signaling
            .send(ClientMessage::PairResponse { target_code: target_code.to_string(), accepted: accept })
            .map_err(|_| ConnectionError::NotConnected("signaling".to_string()))
    }

    /// Send a text payload to a peer. Queued (with oldest-drop overflow)
    /// if the peer isn't connected yet.
    pub async fn send_text(&self, peer_id: &str, bytes: Vec<u8>) -> Result<()> {
        let mut peers = self.inner.peers.lock().await;
        let ctx = peers.get_mut(peer_id).ok_or_else(|| ConnectionError::UnknownPeer(peer_id.to_string()))?;

        if ctx.state == PeerState::Connected {
            if let Some(tx) = &ctx.outbound_text {
                let _ = tx.send(bytes);
                return Ok(());
            }
        }

        if ctx.pending_text.len() >= PENDING_QUEUE_CAP {
            warn!(peer_id, "pending text queue full, dropping oldest message");
            ctx.pending_text.pop_front();
        }
        ctx.pending_text.push_back(bytes);
        Ok(())
    }

    /// Send a file to an already-connected peer, returning the file id
    /// the caller can correlate against `file_events`.
    pub async fn send_file(&self, peer_id: &str, path: PathBuf) -> Result<FileId> {
        let data = tokio::fs::read(&path).await.map_err(|e| ConnectionError::Io(e.to_string()))?;
        let file_name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_else(|| "file".to_string());

        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let peers = self.inner.peers.lock().await;
            let ctx = peers.get(peer_id).ok_or_else(|| ConnectionError::UnknownPeer(peer_id.to_string()))?;
            if ctx.state != PeerState::Connected {
                return Err(ConnectionError::NotConnected(peer_id.to_string()));
            }
            let tx = ctx.outbound_file.as_ref().ok_or_else(|| ConnectionError::NotConnected(peer_id.to_string()))?;
            tx.send(OutboundFile::Send { file_name, data, reply: reply_tx })
                .map_err(|_| ConnectionError::NotConnected(peer_id.to_string()))?;
        }
        reply_rx.await.map_err(|_| ConnectionError::NotConnected(peer_id.to_string()))
    }

    async fn handle_server_message(&self, message: ServerMessage) {
        match message {
            ServerMessage::Registered => info!("registered with coordinator"),
            ServerMessage::PairIncoming { from_code, from_public_key, expires_in } => {
                self.inner.events.emit(
                    EventType::PairRequestReceived,
                    serde_json::json!({
                        "from_code": from_code,
                        "from_public_key": from_public_key.0,
                        "expires_in": expires_in,
                    }),
                );
            }
            ServerMessage::PairMatched { peer_code, peer_public_key, is_initiator } => {
                self.on_pair_matched(peer_code, peer_public_key, is_initiator).await;
            }
            ServerMessage::PairRejected => {
                self.inner.events.emit(EventType::PairRequestRejected, serde_json::json!({}));
            }
            ServerMessage::PairTimeout => {
                self.inner.events.emit(EventType::PairRequestTimedOut, serde_json::json!({}));
            }
            ServerMessage::PairError { message } => {
                warn!(?message, "pairing error from coordinator");
            }
            ServerMessage::Offer { from, payload } => self.on_offer(from, payload).await,
            ServerMessage::Answer { from, payload } => self.on_answer(from, payload).await,
            ServerMessage::IceCandidate { from, .. } => {
                debug!(from, "ignoring ice_candidate: direct QUIC dialing carries its own address in offer/answer");
            }
            ServerMessage::LinkRequest { .. } | ServerMessage::LinkResponse { .. } => {
                debug!("channel-link messages have no handler in this client");
            }
            ServerMessage::RendezvousDeaddrop { point: _, sealed } => {
                self.on_dead_drop(&sealed).await;
            }
            ServerMessage::RendezvousLiveMatch { point, peer_code } => {
                self.on_live_match(&point, &peer_code).await;
            }
            ServerMessage::ChunkData { .. }
            | ServerMessage::ChunkPull { .. }
            | ServerMessage::ChunkAvailable { .. }
            | ServerMessage::ChunkNotFound { .. } => {
                debug!("coordinator chunk-distribution messages are not consumed; transfers run peer-to-peer");
            }
            ServerMessage::PeerJoined { peer_id } | ServerMessage::PeerLeft { peer_id } => {
                debug!(peer_id, "coordinator presence notice");
            }
            ServerMessage::Pong => {}
            ServerMessage::Error { message } => warn!(message, "coordinator error"),
        }
    }

    async fn on_pair_matched(&self, peer_code: String, peer_public_key: WireKey, is_initiator: bool) {
        let pk = match peer_public_key.decode() {
            Ok(pk) => pk,
            Err(e) => {
                warn!(error = %e, "pair_matched carried an invalid public key");
                return;
            }
        };
        let peer_id = fingerprint_hex(&pk);

        if let Some(existing) = self.lookup_trusted(&peer_id).await {
            if existing.public_key != pk {
                self.emit_key_changed(&peer_id, &existing.public_key, &pk).await;
                return;
            }
        }

        {
            let mut peers = self.inner.peers.lock().await;
            peers.insert(peer_id.clone(), PeerContext::new(peer_code.clone(), pk));
        }
        self.inner.code_to_peer.lock().await.insert(peer_code.clone(), peer_id.clone());
        self.inner.rendezvous.lock().await.watch_peer(pk);

        self.inner.events.emit(
            EventType::PeerStateChanged,
            serde_json::json!({"peer_id": peer_id, "state": "connecting"}),
        );

        if is_initiator {
            let payload = transport_payload(self.inner.quic.local_addr(), &self.inner.self_public_key);
            let _ = self.inner.signaling.send(ClientMessage::Offer { target: peer_code, payload });
        }
    }

    async fn on_offer(&self, from_code: String, payload: serde_json::Value) {
        let Some(peer_id) = self.inner.code_to_peer.lock().await.get(&from_code).cloned() else {
            debug!(from_code, "offer for an unknown pairing code");
            return;
        };
        let Some((addr, pk)) = parse_transport_payload(&payload) else {
            warn!(from_code, "malformed offer payload");
            return;
        };
        if !self.peer_key_matches(&peer_id, &pk).await {
            warn!(peer_id, "offer public key does not match the one learned at pairing");
            self.mark_failed(&peer_id).await;
            return;
        }

        self.inner.pending_addrs.lock().await.insert(addr, peer_id.clone());

        let answer = transport_payload(self.inner.quic.local_addr(), &self.inner.self_public_key);
        let _ = self.inner.signaling.send(ClientMessage::Answer { target: from_code, payload: answer });
    }

    async fn on_answer(&self, from_code: String, payload: serde_json::Value) {
        let Some(peer_id) = self.inner.code_to_peer.lock().await.get(&from_code).cloned() else {
            debug!(from_code, "answer for an unknown pairing code");
            return;
        };
        let Some((addr, pk)) = parse_transport_payload(&payload) else {
            warn!(from_code, "malformed answer payload");
            return;
        };
        if !self.peer_key_matches(&peer_id, &pk).await {
            warn!(peer_id, "answer public key does not match the one learned at pairing");
            self.mark_failed(&peer_id).await;
            return;
        }

        let connection = match self.inner.quic.connect(addr, "zajel-node").await {
            Ok(c) => c,
            Err(e) => {
                warn!(peer_id, error = %e, "failed to dial peer");
                self.mark_failed(&peer_id).await;
                return;
            }
        };
        let streams = match QuicNode::open_channels(&connection).await {
            Ok(s) => s,
            Err(e) => {
                warn!(peer_id, error = %e, "failed to open channels");
                self.mark_failed(&peer_id).await;
                return;
            }
        };
        self.complete_handshake(peer_id, streams).await;
    }

    async fn on_dead_drop(&self, sealed: &WireBytes) {
        let payload = sealed.decode();
        let Ok(ciphertext) = payload else {
            debug!("dead drop payload was not valid base64, dropping silently");
            return;
        };
        let drop = zajel_rendezvous::SealedDeadDrop {
            point: [0u8; 32],
            eph_pk: [0u8; 32],
            ciphertext_and_tag: ciphertext,
            sealed_at: 0,
        };
        let effect = self.inner.rendezvous.lock().await.on_dead_drop(&drop);
        if let Some(RendezvousEffect::PairRequest { code, .. }) = effect {
            let _ = self.connect_to_peer(code.as_str());
        }
    }

    async fn on_live_match(&self, _point: &str, peer_code: &str) {
        let Ok(code) = PairingCode::parse(peer_code) else {
            return;
        };
        let effect = self.inner.rendezvous.lock().await.on_live_match(&code);
        if let Some(RendezvousEffect::PairRequest { code, .. }) = effect {
            let _ = self.connect_to_peer(code.as_str());
        }
    }

    async fn accept_loop(&self) {
        loop {
            let Some(incoming) = self.inner.quic.accept().await else {
                debug!("QUIC endpoint closed, stopping accept loop");
                return;
            };
            let manager = self.clone();
            tokio::spawn(async move {
                let connection = match incoming.await {
                    Ok(c) => c,
                    Err(e) => {
                        debug!(error = %e, "incoming QUIC handshake failed");
                        return;
                    }
                };
                let remote = connection.remote_address();
                let peer_id = manager.inner.pending_addrs.lock().await.remove(&remote);
                let Some(peer_id) = peer_id else {
                    debug!(%remote, "dropping unsolicited QUIC connection");
                    return;
                };
                let streams = match QuicNode::accept_channels(&connection).await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(peer_id, error = %e, "failed to accept channels");
                        manager.mark_failed(&peer_id).await;
                        return;
                    }
                };
                manager.complete_handshake(peer_id, streams).await;
            });
        }
    }

    async fn rendezvous_loop(&self) {
        let mut ticker = tokio::time::interval(RENDEZVOUS_TICK_INTERVAL);
        loop {
            ticker.tick().await;
            let now = now_secs();
            let effects = self.inner.rendezvous.lock().await.tick(now, None);
            let Ok(effects) = effects else {
                continue;
            };
            for effect in effects {
                match effect {
                    RendezvousEffect::RegisterDaily { meeting_point: _, dead_drop, .. } => {
                        let sealed = serde_json::to_vec(&dead_drop).unwrap_or_default();
                        let _ = self.inner.signaling.send(ClientMessage::RegisterRendezvous {
                            daily: vec![],
                            hourly: vec![],
                            dead_drop: Some(vec![zajel_signaling::messages::DeadDropRegistration {
                                point: hex::encode(dead_drop.point),
                                sealed: zajel_signaling::messages::WireBytes::encode(&sealed),
                            }]),
                        });
                    }
                    RendezvousEffect::RegisterHourly { meeting_point, .. } => {
                        let _ = self.inner.signaling.send(ClientMessage::RegisterRendezvous {
                            daily: vec![],
                            hourly: vec![hex::encode(meeting_point)],
                            dead_drop: None,
                        });
                    }
                    RendezvousEffect::PairRequest { code, .. } => {
                        let _ = self.connect_to_peer(code.as_str());
                    }
                }
            }
        }
    }

    async fn complete_handshake(&self, peer_id: PeerId, mut streams: PeerStreams) {
        let (expected_pk, peer_code) = {
            let peers = self.inner.peers.lock().await;
            match peers.get(&peer_id) {
                Some(ctx) => (ctx.public_key, ctx.peer_code.clone()),
                None => {
                    debug!(peer_id, "handshake completed for a peer that is no longer tracked");
                    return;
                }
            }
        };

        if let Err(e) =
            handshake::run(&mut streams.messages.0, &mut streams.messages.1, &self.inner.self_public_key, &expected_pk)
                .await
        {
            warn!(peer_id, error = %e, "in-band handshake failed");
            self.mark_failed(&peer_id).await;
            return;
        }

        let session = match Session::establish(&self.inner.self_secret, &expected_pk, &peer_id) {
            Ok(s) => s,
            Err(e) => {
                warn!(peer_id, error = %e, "session establishment failed");
                self.mark_failed(&peer_id).await;
                return;
            }
        };

        self.persist_trusted_peer(&peer_id, expected_pk).await;
        self.finalize_connected(peer_id, peer_code, session, streams).await;
    }

    async fn finalize_connected(&self, peer_id: PeerId, peer_code: String, session: Session, streams: PeerStreams) {
        let session = Arc::new(AsyncMutex::new(session));
        let (text_tx, text_rx) = mpsc::unbounded_channel();
        let (file_tx, file_rx) = mpsc::unbounded_channel();

        let queued = {
            let mut peers = self.inner.peers.lock().await;
            let Some(ctx) = peers.get_mut(&peer_id) else {
                return;
            };
            ctx.state = PeerState::Connected;
            ctx.outbound_text = Some(text_tx.clone());
            ctx.outbound_file = Some(file_tx);
            std::mem::take(&mut ctx.pending_text)
        };
        for message in queued {
            let _ = text_tx.send(message);
        }

        self.inner.events.emit(
            EventType::PeerAdded,
            serde_json::json!({"peer_id": peer_id, "peer_code": peer_code}),
        );

        let manager = self.clone();
        let peer_id_for_messages = peer_id.clone();
        let session_for_messages = session.clone();
        let (messages_send, messages_recv) = streams.messages;
        tokio::spawn(async move {
            run_message_channel(manager, peer_id_for_messages, session_for_messages, messages_send, messages_recv, text_rx)
                .await;
        });

        let manager = self.clone();
        let (files_send, files_recv) = streams.files;
        tokio::spawn(async move {
            run_file_channel(manager, peer_id, session, files_send, files_recv, file_rx).await;
        });
    }

    async fn peer_key_matches(&self, peer_id: &str, pk: &[u8; 32]) -> bool {
        let peers = self.inner.peers.lock().await;
        peers.get(peer_id).map(|ctx| ctx.public_key == *pk).unwrap_or(false)
    }

    async fn lookup_trusted(&self, peer_id: &str) -> Option<Peer> {
        let conn = self.inner.db.lock().await;
        zajel_db::get_trusted_peer(&conn, peer_id).ok().flatten()
    }

    async fn persist_trusted_peer(&self, peer_id: &str, public_key: [u8; 32]) {
        let now = now_secs();
        let mut peer = Peer::new(public_key, peer_id.to_string(), now);
        peer.trusted_since = Some(now);
        let conn = self.inner.db.lock().await;
        if let Err(e) = zajel_db::upsert_trusted_peer(&conn, &peer) {
            warn!(peer_id, error = %e, "failed to persist trusted peer");
        }
    }

    async fn mark_failed(&self, peer_id: &str) {
        {
            let mut peers = self.inner.peers.lock().await;
            if let Some(ctx) = peers.get_mut(peer_id) {
                ctx.state = PeerState::Failed;
                ctx.outbound_text = None;
                ctx.outbound_file = None;
            }
        }
        self.inner.events.emit(EventType::PeerStateChanged, serde_json::json!({"peer_id": peer_id, "state": "failed"}));
    }

    async fn emit_key_changed(&self, peer_id: &str, old_pk: &[u8; 32], new_pk: &[u8; 32]) {
        self.inner.events.emit(
            EventType::KeyChanged,
            serde_json::json!({
                "peer_id": peer_id,
                "old_public_key": hex::encode(old_pk),
                "new_public_key": hex::encode(new_pk),
                "detected_at": now_secs(),
            }),
        );
    }

    fn emit_file_event(&self, event_type: EventType, peer_id: &str, file_id: &str, total_size: u64, transferred: u64) {
        self.inner.events.emit(
            event_type,
            serde_json::json!({
                "peer_id": peer_id,
                "file_id": file_id,
                "total_size": total_size,
                "bytes_transferred": transferred,
            }),
        );
    }

    async fn persist_completed_transfer(
        &self,
        peer_id: &str,
        file_id: &str,
        file_name: &str,
        total_size: u64,
        direction: zajel_db::TransferDirection,
        file_hash: Option<[u8; 32]>,
    ) {
        let now = now_secs();
        let record = zajel_db::TransferRecord {
            file_id: file_id.to_string(),
            peer_id: peer_id.to_string(),
            file_name: file_name.to_string(),
            total_size,
            direction,
            final_state: "complete".to_string(),
            file_hash,
            started_at: now,
            finished_at: now,
        };
        let conn = self.inner.db.lock().await;
        if let Err(e) = zajel_db::record_transfer(&conn, &record) {
            warn!(peer_id, file_id, error = %e, "failed to record completed transfer");
        }
    }

    async fn dispatch_transfer_message(
        &self,
        peer_id: &str,
        message: TransferMessage,
        senders: &mut HashMap<String, SenderTransfer>,
        receivers: &mut HashMap<String, ReceiverTransfer>,
        session: &Arc<AsyncMutex<Session>>,
    ) -> Vec<TransferMessage> {
        match message {
            TransferMessage::FileStart { file_id, file_name, total_size, total_chunks, chunk_hashes } => {
                let (transfer, ack) =
                    ReceiverTransfer::on_file_start(file_id.clone(), file_name, total_size, total_chunks, chunk_hashes, self.inner.max_file_size);
                if let Some(transfer) = transfer {
                    self.emit_file_event(EventType::FileTransferStarted, peer_id, &file_id, total_size, 0);
                    receivers.insert(file_id, transfer);
                }
                vec![ack]
            }
            TransferMessage::FileStartAck { file_id, accepted, .. } => {
                senders.get_mut(&file_id).map(|sender| sender.on_start_ack(accepted)).unwrap_or_default()
            }
            TransferMessage::FileChunk { file_id, chunk_index, data, hash } => {
                let Some(receiver) = receivers.get_mut(&file_id) else {
                    return Vec::new();
                };
                let ack = {
                    let mut s = session.lock().await;
                    receiver.on_chunk(chunk_index, &data, hash, &mut *s)
                };
                self.emit_file_event(
                    EventType::FileTransferProgress,
                    peer_id,
                    &file_id,
                    receiver.total_size,
                    receiver.bytes_received(),
                );
                vec![ack]
            }
            TransferMessage::ChunkAck { file_id, chunk_index, status, .. } => {
                let Some(sender) = senders.get_mut(&file_id) else {
                    return Vec::new();
                };
                match sender.on_chunk_ack(chunk_index, status) {
                    Ok(msgs) => {
                        self.emit_file_event(EventType::FileTransferProgress, peer_id, &file_id, sender.total_size, sender.bytes_acked());
                        msgs
                    }
                    Err(e) => {
                        warn!(peer_id, file_id, error = %e, "sender transfer failed");
                        self.emit_file_event(EventType::FileTransferFailed, peer_id, &file_id, sender.total_size, sender.bytes_acked());
                        Vec::new()
                    }
                }
            }
            TransferMessage::ChunkRetry { file_id, .. } => {
                debug!(peer_id, file_id, "chunk_retry received; un-acked chunks are resent by the sweep timer");
                Vec::new()
            }
            TransferMessage::FileComplete { file_id, file_hash } => {
                let Some(receiver) = receivers.get_mut(&file_id) else {
                    return Vec::new();
                };
                let (acks, assembled) = receiver.on_complete(file_hash);
                if let Some(bytes) = assembled {
                    self.store_received_file(peer_id, &file_id, &receiver.file_name, &bytes).await;
                    self.persist_completed_transfer(
                        peer_id,
                        &file_id,
                        &receiver.file_name,
                        receiver.total_size,
                        zajel_db::TransferDirection::Receive,
                        file_hash,
                    )
                    .await;
                    self.emit_file_event(EventType::FileTransferComplete, peer_id, &file_id, receiver.total_size, receiver.total_size);
                }
                acks
            }
            TransferMessage::FileCompleteAck { file_id, status, missing_chunks, file_hash } => {
                let Some(sender) = senders.get_mut(&file_id) else {
                    return Vec::new();
                };
                let (file_name, total_size) = (sender.file_name.clone(), sender.total_size);
                match sender.on_complete_ack(status, missing_chunks) {
                    Ok(msgs) => {
                        if status == CompleteStatus::Success {
                            self.persist_completed_transfer(
                                peer_id,
                                &file_id,
                                &file_name,
                                total_size,
                                zajel_db::TransferDirection::Send,
                                file_hash,
                            )
                            .await;
                            self.emit_file_event(EventType::FileTransferComplete, peer_id, &file_id, total_size, total_size);
                        }
                        msgs
                    }
                    Err(e) => {
                        warn!(peer_id, file_id, error = %e, "handling file_complete_ack failed");
                        Vec::new()
                    }
                }
            }
            TransferMessage::TransferCancel { file_id, reason } => {
                senders.remove(&file_id);
                receivers.remove(&file_id);
                self.inner.events.emit(
                    EventType::FileTransferCancelled,
                    serde_json::json!({"peer_id": peer_id, "file_id": file_id, "reason": format!("{reason:?}")}),
                );
                Vec::new()
            }
        }
    }

    async fn store_received_file(&self, peer_id: &str, file_id: &str, file_name: &str, bytes: &[u8]) {
        let dir = self.inner.downloads_dir.join(peer_id);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            warn!(peer_id, file_id, error = %e, "failed to create downloads directory");
            return;
        }
        if let Err(e) = tokio::fs::write(dir.join(file_name), bytes).await {
            warn!(peer_id, file_id, error = %e, "failed to write received file");
        }
    }
}

async fn run_message_channel(
    manager: ConnectionManager,
    peer_id: PeerId,
    session: Arc<AsyncMutex<Session>>,
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    loop {
        tokio::select! {
            queued = outbound.recv() => {
                let Some(plaintext) = queued else { break };
                let frame = session.lock().await.encrypt(Channel::Text, &plaintext);
                match frame {
                    Ok(frame) => {
                        if QuicNode::send_message(&mut send, &frame).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(peer_id, error = %e, "failed to encrypt outbound text, dropping"),
                }
            }
            incoming = QuicNode::recv_message(&mut recv, MAX_FRAME_SIZE) => {
                let frame = match incoming {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(peer_id, error = %e, "messages stream closed");
                        manager.mark_failed(&peer_id).await;
                        break;
                    }
                };
                let plaintext = session.lock().await.decrypt(Channel::Text, &frame);
                match plaintext {
                    Ok(bytes) => {
                        manager.inner.events.emit(
                            EventType::MessageReceived,
                            serde_json::json!({"peer_id": peer_id, "bytes": hex::encode(&bytes)}),
                        );
                    }
                    Err(zajel_crypto::CryptoError::ReplayDetected) => {
                        warn!(peer_id, "replayed text frame dropped");
                    }
                    Err(e) => {
                        warn!(peer_id, error = %e, "text decryption failed, tearing down peer");
                        manager.mark_failed(&peer_id).await;
                        break;
                    }
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_file_channel(
    manager: ConnectionManager,
    peer_id: PeerId,
    session: Arc<AsyncMutex<Session>>,
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    mut outbound: mpsc::UnboundedReceiver<OutboundFile>,
) {
    let mut senders: HashMap<String, SenderTransfer> = HashMap::new();
    let mut receivers: HashMap<String, ReceiverTransfer> = HashMap::new();
    let mut sweep = tokio::time::interval(transfer::idle_check_interval());
    let backpressure = Backpressure::new();

    loop {
        tokio::select! {
            queued = outbound.recv() => {
                let Some(OutboundFile::Send { file_name, data, reply }) = queued else { break };
                let created = {
                    let mut s = session.lock().await;
                    SenderTransfer::new(file_name, &data, &mut *s)
                };
                match created {
                    Ok(mut sender) => {
                        let file_id = sender.file_id.clone();
                        let total_size = sender.total_size;
                        let start = sender.start();
                        let _ = reply.send(file_id.clone());
                        manager.emit_file_event(EventType::FileTransferStarted, &peer_id, &file_id, total_size, 0);
                        if send_transfer_message(&mut send, &start, &backpressure).await.is_err() {
                            break;
                        }
                        senders.insert(file_id, sender);
                    }
                    Err(e) => {
                        warn!(peer_id, error = %e, "failed to prepare outbound file");
                        let _ = reply.send(String::new());
                    }
                }
            }

            incoming = QuicNode::recv_message(&mut recv, MAX_FRAME_SIZE) => {
                let frame = match incoming {
                    Ok(frame) => frame,
                    Err(e) => {
                        debug!(peer_id, error = %e, "files stream closed");
                        break;
                    }
                };
                let message: TransferMessage = match serde_json::from_slice(&frame) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(peer_id, error = %e, "malformed transfer message, dropping");
                        continue;
                    }
                };
                let outgoing = manager
                    .dispatch_transfer_message(&peer_id, message, &mut senders, &mut receivers, &session)
                    .await;
                let mut closed = false;
                for reply in &outgoing {
                    if send_transfer_message(&mut send, reply, &backpressure).await.is_err() {
                        closed = true;
                        break;
                    }
                }
                if closed {
                    break;
                }
            }

            _ = sweep.tick() => {
                let now = Instant::now();
                for (file_id, sender) in senders.iter_mut() {
                    match sender.sweep(now) {
                        Ok(msgs) => {
                            for msg in msgs {
                                let _ = send_transfer_message(&mut send, &msg, &backpressure).await;
                            }
                        }
                        Err(e) => {
                            warn!(peer_id, file_id, error = %e, "sender transfer timed out");
                            manager.emit_file_event(EventType::FileTransferFailed, &peer_id, file_id, sender.total_size, sender.bytes_acked());
                        }
                    }
                }
                senders.retain(|_, t| !(t.is_terminal() || t.is_idle(now)));
                receivers.retain(|_, t| !(t.is_terminal() || t.is_idle(now)));
            }
        }
    }
}

/// Honors send-side backpressure on the `files` stream before writing
/// (`spec.md` §4.6 step 2: "honor transport backpressure before each
/// send"), reporting the byte count queued and drained around the actual
/// write so `Backpressure::wait_for_capacity` has something to gate on.
async fn send_transfer_message(
    send: &mut quinn::SendStream,
    message: &TransferMessage,
    backpressure: &Backpressure,
) -> std::result::Result<(), ()> {
    let bytes = serde_json::to_vec(message).map_err(|_| ())?;
    backpressure.wait_for_capacity().await;
    backpressure.report_queued(bytes.len());
    let result = QuicNode::send_message(send, &bytes).await.map_err(|_| ());
    backpressure.report_drained(bytes.len());
    result
}

fn transport_payload(addr: SocketAddr, public_key: &[u8; 32]) -> serde_json::Value {
    serde_json::json!({
        "addr": addr.to_string(),
        "publicKey": base64_encode(public_key),
    })
}

fn parse_transport_payload(payload: &serde_json::Value) -> Option<(SocketAddr, [u8; 32])> {
    let addr: SocketAddr = payload.get("addr")?.as_str()?.parse().ok()?;
    let pk_b64 = payload.get("publicKey")?.as_str()?;
    let pk_bytes = base64_decode(pk_b64)?;
    let pk: [u8; 32] = pk_bytes.try_into().ok()?;
    Some((addr, pk))
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn base64_decode(s: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(s).ok()
}

fn fingerprint_hex(pk: &[u8; 32]) -> String {
    hex::encode(sha256::fingerprint(pk))
}

fn now_secs() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use zajel_types::identity::ConnectionState;

    #[test]
    fn transport_payload_roundtrips() {
        let addr: SocketAddr = "127.0.0.1:4433".parse().expect("addr");
        let pk = [0x11u8; 32];
        let payload = transport_payload(addr, &pk);
        let (parsed_addr, parsed_pk) = parse_transport_payload(&payload).expect("parse");
        assert_eq!(parsed_addr, addr);
        assert_eq!(parsed_pk, pk);
    }

    #[test]
    fn parse_transport_payload_rejects_malformed_input() {
        assert!(parse_transport_payload(&serde_json::json!({"addr": "not an address"})).is_none());
        assert!(parse_transport_payload(&serde_json::json!({})).is_none());
    }

    #[test]
    fn peer_context_starts_connecting_with_empty_queue() {
        let ctx = PeerContext::new("A2B3C4".to_string(), [0u8; 32]);
        assert_eq!(ctx.state, ConnectionState::Connecting);
        assert!(ctx.pending_text.is_empty());
    }

    #[test]
    fn pending_queue_drops_oldest_past_cap() {
        let mut ctx = PeerContext::new("A2B3C4".to_string(), [0u8; 32]);
        for i in 0..(PENDING_QUEUE_CAP + 10) {
            if ctx.pending_text.len() >= PENDING_QUEUE_CAP {
                ctx.pending_text.pop_front();
            }
            ctx.pending_text.push_back(vec![i as u8]);
        }
        assert_eq!(ctx.pending_text.len(), PENDING_QUEUE_CAP);
        assert_eq!(ctx.pending_text.front(), Some(&vec![10u8]));
    }

    #[test]
    fn fingerprint_hex_is_deterministic() {
        let pk = [0x42u8; 32];
        assert_eq!(fingerprint_hex(&pk), fingerprint_hex(&pk));
    }
}
