//! The `WS /` handler (`spec.md` §4.2/§4.7): one axum `WebSocketUpgrade`
//! per client, a per-connection `mpsc` forwarding task, and the pairing/
//! rendezvous/relay/chunk dispatch against [`AppState`]'s registries.
//!
//! Grounded on `other_examples/0bac1094_..._rendezvous.rs.rs`'s
//! split-socket + `mpsc`-forward-task + `ClientMessage` match idiom,
//! retargeted from session/peer join-leave to this spec's pairing-code
//! registry and rendezvous/chunk distribution. `AppState` is passed by
//! value everywhere here (cheap: every field is an `Arc`), matching the
//! owned state axum's `State<S>` extractor already hands a handler.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use zajel_signaling::messages::{ChunkAnnouncement, ClientMessage, DeadDropRegistration, ServerMessage, WireBytes, WireKey};
use zajel_types::network::RelayEntry as WireRelayEntry;

use crate::registries::ChunkLookup;
use crate::state::AppState;
use crate::{now_secs, CoordinatorError};

/// Outbound channel depth per connection; a slow client's socket backs up
/// here before the coordinator starts dropping (`spec.md` §9: "best-effort
/// delivery").
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

pub async fn handle_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let connection_id = Uuid::new_v4().to_string();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CHANNEL_CAPACITY);

    state.connections.insert(connection_id.clone(), tx);

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "failed to serialize outbound message");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut registered_code: Option<String> = None;

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(f) => f,
            Err(e) => {
                debug!(connection_id, error = %e, "websocket error, closing");
                break;
            }
        };
        match frame {
            Message::Text(text) => {
                if text.len() > zajel_signaling::MAX_FRAME_SIZE {
                    warn!(connection_id, size = text.len(), "oversize frame, closing connection");
                    break;
                }
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => {
                        if let ClientMessage::Register { ref pairing_code, .. } = message {
                            registered_code = Some(pairing_code.clone());
                        }
                        handle_client_message(state.clone(), &connection_id, message).await;
                    }
                    Err(e) => {
                        debug!(connection_id, error = %e, "discarding malformed message");
                    }
                }
            }
            Message::Close(_) => {
                debug!(connection_id, "client closed websocket");
                break;
            }
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    debug!(connection_id, code = ?registered_code, "connection disconnected, clearing registries");
    state.remove_connection(&connection_id);
    send_task.abort();
}

async fn handle_client_message(state: AppState, connection_id: &str, message: ClientMessage) {
    match message {
        ClientMessage::Register { pairing_code, public_key, capacity } => {
            handle_register(&state, connection_id, pairing_code, public_key, capacity);
        }
        ClientMessage::PairRequest { target_code } => {
            handle_pair_request(state, connection_id, target_code);
        }
        ClientMessage::PairResponse { target_code, accepted } => {
            handle_pair_response(&state, connection_id, target_code, accepted);
        }
        ClientMessage::Offer { target, payload } => {
            let from = connection_code(&state, connection_id);
            forward_signaling(&state, &target, ServerMessage::Offer { from, payload });
        }
        ClientMessage::Answer { target, payload } => {
            let from = connection_code(&state, connection_id);
            forward_signaling(&state, &target, ServerMessage::Answer { from, payload });
        }
        ClientMessage::IceCandidate { target, payload } => {
            let from = connection_code(&state, connection_id);
            forward_signaling(&state, &target, ServerMessage::IceCandidate { from, payload });
        }
        ClientMessage::LinkRequest { target, payload } => {
            let from = connection_code(&state, connection_id);
            forward_signaling(&state, &target, ServerMessage::LinkRequest { from, payload });
        }
        ClientMessage::LinkResponse { target, payload } => {
            let from = connection_code(&state, connection_id);
            forward_signaling(&state, &target, ServerMessage::LinkResponse { from, payload });
        }
        ClientMessage::RegisterRendezvous { daily, hourly, dead_drop } => {
            handle_register_rendezvous(&state, connection_id, daily, hourly, dead_drop);
        }
        ClientMessage::GetRelays => handle_get_relays(&state, connection_id),
        ClientMessage::UpdateLoad { load } => state.relays.update_load(connection_id, load, now_secs()),
        ClientMessage::Heartbeat => {}
        ClientMessage::Ping => {
            state.connections.send(connection_id, ServerMessage::Pong);
        }
        ClientMessage::ChunkAnnounce { chunks } => handle_chunk_announce(&state, connection_id, chunks),
        ClientMessage::ChunkRequest { id } => handle_chunk_request(&state, connection_id, id),
        ClientMessage::ChunkPush { id, bytes } => handle_chunk_push(&state, id, bytes),
    }
}

/// The server never learns a client's pairing code except via
/// `register`, so `from` on a forwarded message is whatever code this
/// connection last registered under — the pairing index is the source
/// of truth (`spec.md` §4.7: "the server is a pure forwarder").
fn connection_code(state: &AppState, connection_id: &str) -> String {
    state.pairing.lookup_by_connection(connection_id).map(|r| r.0).unwrap_or_default()
}

fn handle_register(state: &AppState, connection_id: &str, pairing_code: String, public_key: WireKey, capacity: Option<u32>) {
    let Ok(pk) = public_key.decode() else {
        state.connections.send(connection_id, ServerMessage::Error { message: "invalid publicKey".into() });
        return;
    };
    let normalized = pairing_code.trim().to_uppercase();
    let now = now_secs();
    match state.pairing.register(&normalized, connection_id, pk, now) {
        Ok(()) => {
            if let Some(capacity) = capacity {
                state.relays.register(connection_id, String::new(), pk, capacity, now);
            }
            state.connections.send(connection_id, ServerMessage::Registered);
            info!(connection_id, code = %normalized, "client registered");
        }
        Err(CoordinatorError::DuplicateCode) => {
            state.connections.send(connection_id, ServerMessage::PairError { message: Some("pairing code already in use".into()) });
        }
        Err(e) => {
            warn!(connection_id, error = %e, "register failed");
        }
    }
}

/// Forward `pair_incoming` to the target, arming a timeout task that
/// fires `pair_timeout` unless the request resolves first (`spec.md`
/// §4.7: "start a per-request timer").
fn handle_pair_request(state: AppState, connection_id: &str, target_code: String) {
    let Some(from) = state.pairing.lookup_by_connection(connection_id) else {
        state.connections.send(connection_id, ServerMessage::PairError { message: Some("register before pairing".into()) });
        return;
    };
    let Some(target) = state.pairing.lookup(&target_code) else {
        state.connections.send(connection_id, ServerMessage::PairError { message: Some("target code not found".into()) });
        return;
    };

    let handle = state.pending_pairs.insert(&target_code, &from.0, connection_id);
    state.connections.send(
        &target.connection_id,
        ServerMessage::PairIncoming {
            from_code: from.0.clone(),
            from_public_key: WireKey::encode(&from.1),
            expires_in: Some(crate::registries::PAIR_REQUEST_TIMEOUT_SECS),
        },
    );

    let target_code_for_timeout = target_code;
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_secs(crate::registries::PAIR_REQUEST_TIMEOUT_SECS)).await;
        if let Some(from_connection_id) = state.pending_pairs.expire(&target_code_for_timeout, handle) {
            state.connections.send(&from_connection_id, ServerMessage::PairTimeout);
        }
    });
}

/// Resolve a pending pair request. Initiator is the lexicographically
/// higher code (`spec.md` §4.3 "Tie-breaks"), matching `PairingCode`'s
/// derived `Ord`.
fn handle_pair_response(state: &AppState, connection_id: &str, target_code: String, accepted: bool) {
    let Some((from_connection_id, from_code)) = state.pending_pairs.resolve(&target_code) else {
        return;
    };
    if !accepted {
        state.connections.send(&from_connection_id, ServerMessage::PairRejected);
        return;
    }

    let Some(responder) = state.pairing.lookup(&target_code) else {
        state.connections.send(&from_connection_id, ServerMessage::PairError { message: Some("target vanished".into()) });
        return;
    };
    let Some(requester) = state.pairing.lookup(&from_code) else {
        state.connections.send(connection_id, ServerMessage::PairError { message: Some("requester vanished".into()) });
        return;
    };

    let initiator_is_requester = from_code > target_code;

    state.connections.send(
        &from_connection_id,
        ServerMessage::PairMatched {
            peer_code: target_code.clone(),
            peer_public_key: WireKey::encode(&responder.public_key),
            is_initiator: initiator_is_requester,
        },
    );
    state.connections.send(
        &responder.connection_id,
        ServerMessage::PairMatched {
            peer_code: from_code,
            peer_public_key: WireKey::encode(&requester.public_key),
            is_initiator: !initiator_is_requester,
        },
    );
}

fn forward_signaling(state: &AppState, target_code: &str, message: ServerMessage) {
    let Some(target) = state.pairing.lookup(target_code) else {
        debug!(target_code, "signaling target not registered, dropping");
        return;
    };
    state.connections.send(&target.connection_id, message);
}

/// Daily registrations return every other peer's currently live entry at
/// the same point as `rendezvous_deaddrop` before appending (`spec.md`
/// §4.7); hourly registrations trigger `rendezvous_live_match` on the
/// second registrant at a token.
fn handle_register_rendezvous(
    state: &AppState,
    connection_id: &str,
    daily: Vec<String>,
    hourly: Vec<String>,
    dead_drop: Option<Vec<DeadDropRegistration>>,
) {
    let Some((pairing_code, public_key)) = state.pairing.lookup_by_connection(connection_id) else {
        return;
    };
    let now = now_secs();

    let dead_drop_by_point: std::collections::HashMap<String, Vec<u8>> = dead_drop
        .into_iter()
        .flatten()
        .filter_map(|reg| reg.sealed.decode().ok().map(|bytes| (reg.point, bytes)))
        .collect();

    for point in &daily {
        let sealed = dead_drop_by_point.get(point).cloned();
        let others = state.rendezvous.register_daily(point, connection_id, public_key, pairing_code.clone(), sealed, now);
        for other in others {
            if let Some(blob) = other.dead_drop {
                state.connections.send(
                    connection_id,
                    ServerMessage::RendezvousDeaddrop { point: point.clone(), sealed: WireBytes::encode(&blob) },
                );
            }
        }
    }

    for point in &hourly {
        if let Some(other) = state.rendezvous.register_hourly(point, connection_id, public_key, pairing_code.clone(), now) {
            state.connections.send(
                connection_id,
                ServerMessage::RendezvousLiveMatch { point: point.clone(), peer_code: other.pairing_code.clone() },
            );
            state.connections.send(
                &other.connection_id,
                ServerMessage::RendezvousLiveMatch { point: point.clone(), peer_code: pairing_code.clone() },
            );
        }
    }
}

fn handle_get_relays(state: &AppState, connection_id: &str) {
    let relays = state
        .relays
        .get_relays(connection_id)
        .into_iter()
        .enumerate()
        .map(|(i, entry)| WireRelayEntry {
            server_id: format!("relay-{i}"),
            endpoint: entry.endpoint,
            load_fraction: entry.load as f32 / entry.capacity.max(1) as f32,
            registered_at: entry.last_seen,
            last_seen: entry.last_seen,
        })
        .collect();
    state.connections.send(connection_id, ServerMessage::Relays { relays });
}

fn handle_chunk_announce(state: &AppState, connection_id: &str, chunks: Vec<ChunkAnnouncement>) {
    let now = now_secs();
    for chunk in chunks {
        if state.chunks.announce(&chunk.id, connection_id, now) {
            state.connections.send(connection_id, ServerMessage::ChunkPull { id: chunk.id });
        }
    }
}

fn handle_chunk_request(state: &AppState, connection_id: &str, id: String) {
    match state.chunks.request(&id, connection_id, now_secs()) {
        ChunkLookup::CacheHit(bytes) => {
            state.connections.send(connection_id, ServerMessage::ChunkData { id, bytes: WireBytes::encode(&bytes) });
        }
        ChunkLookup::PullFrom(source_connection_id) => {
            state.connections.send(&source_connection_id, ServerMessage::ChunkPull { id });
        }
        ChunkLookup::NotFound => {
            state.connections.send(connection_id, ServerMessage::ChunkNotFound { id });
        }
    }
}

fn handle_chunk_push(state: &AppState, id: String, bytes: WireBytes) {
    let Ok(decoded) = bytes.decode() else {
        return;
    };
    match state.chunks.push(&id, decoded.clone(), now_secs()) {
        Ok(requesters) => {
            for requester in requesters {
                state.connections.send(&requester, ServerMessage::ChunkData { id: id.clone(), bytes: WireBytes::encode(&decoded) });
            }
        }
        Err(e) => warn!(chunk_id = %id, error = %e, "dropping oversize chunk push"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_code_is_empty_before_registration() {
        let state = AppState::new(zajel_crypto::ed25519::SigningKey::generate());
        assert_eq!(connection_code(&state, "conn-unregistered"), "");
    }

    #[tokio::test]
    async fn register_then_pair_request_delivers_pair_incoming() {
        let state = AppState::new(zajel_crypto::ed25519::SigningKey::generate());
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        state.connections.insert("conn-a".to_string(), tx_a);
        state.connections.insert("conn-b".to_string(), tx_b);

        handle_register(&state, "conn-a", "AAAAAA".into(), WireKey::encode(&[1u8; 32]), None);
        handle_register(&state, "conn-b", "BBBBBB".into(), WireKey::encode(&[2u8; 32]), None);
        assert!(matches!(rx_a.try_recv(), Ok(ServerMessage::Registered)));
        assert!(matches!(rx_b.try_recv(), Ok(ServerMessage::Registered)));

        handle_pair_request(state.clone(), "conn-a", "BBBBBB".into());
        match rx_b.try_recv() {
            Ok(ServerMessage::PairIncoming { from_code, .. }) => assert_eq!(from_code, "AAAAAA"),
            other => panic!("expected PairIncoming, got {other:?}"),
        }
    }
}
