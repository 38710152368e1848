//! Plain HTTP surface alongside the WebSocket endpoint: health checks and
//! the signed bootstrap server list (`spec.md` §4.7, §4.8), plus
//! federated-coordinator registration used to build that list.
//!
//! Router composition follows `examples/burakkonte-sinyalist/backend/src/main.rs`'s
//! `Router::new().route(...).with_state(state)` idiom.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use zajel_types::network::{ServerListEntry, SignedServerList};

use crate::state::{AppState, FederatedServer};
use crate::now_secs;

#[derive(Serialize)]
pub struct HealthResponse {
    ok: bool,
    ts: u64,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true, ts: now_secs() })
}

/// Signed bootstrap list (`spec.md` §4.8). The signed byte sequence is
/// `serde_json(servers) || ts.to_be_bytes()`, matching
/// `zajel-client::discovery::signed_message` exactly so the client's
/// verification succeeds.
pub async fn get_servers(State(state): State<AppState>) -> Json<SignedServerList> {
    let servers: Vec<ServerListEntry> = state
        .federated_servers
        .list()
        .into_iter()
        .map(|s| ServerListEntry {
            server_id: s.server_id,
            endpoint: s.endpoint,
            public_key: s.public_key,
            region: s.region,
            registered_at: s.registered_at,
            last_seen: s.last_seen,
        })
        .collect();
    let ts = now_secs();
    let signature = state.operator_signing_key.sign(&signed_message(&servers, ts)).to_bytes();
    Json(SignedServerList { servers, ts, signature })
}

/// Byte sequence signed over the server list, mirroring
/// `zajel-client::discovery::signed_message` so the coordinator's
/// signature verifies client-side.
fn signed_message(servers: &[ServerListEntry], ts: u64) -> Vec<u8> {
    let mut bytes = serde_json::to_vec(servers).unwrap_or_default();
    bytes.extend_from_slice(&ts.to_be_bytes());
    bytes
}

#[derive(Deserialize)]
pub struct RegisterServerRequest {
    server_id: String,
    endpoint: String,
    public_key: zajel_signaling::messages::WireKey,
    region: Option<String>,
}

pub async fn register_server(
    State(state): State<AppState>,
    Json(req): Json<RegisterServerRequest>,
) -> Result<StatusCode, StatusCode> {
    let public_key = req.public_key.decode().map_err(|_| StatusCode::BAD_REQUEST)?;
    let now = now_secs();
    state.federated_servers.upsert(FederatedServer {
        server_id: req.server_id,
        endpoint: req.endpoint,
        public_key,
        region: req.region,
        registered_at: now,
        last_seen: now,
    });
    Ok(StatusCode::CREATED)
}

#[derive(Deserialize)]
pub struct HeartbeatRequest {
    server_id: String,
}

pub async fn heartbeat_server(
    State(state): State<AppState>,
    Json(req): Json<HeartbeatRequest>,
) -> StatusCode {
    if state.federated_servers.heartbeat(&req.server_id, now_secs()) {
        StatusCode::OK
    } else {
        StatusCode::NOT_FOUND
    }
}

pub async fn remove_server(State(state): State<AppState>, Path(server_id): Path<String>) -> StatusCode {
    state.federated_servers.remove(&server_id);
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_message_appends_big_endian_timestamp() {
        let servers: Vec<ServerListEntry> = Vec::new();
        let bytes = signed_message(&servers, 0x0102030405060708);
        assert_eq!(&bytes[bytes.len() - 8..], &0x0102030405060708u64.to_be_bytes());
    }
}
