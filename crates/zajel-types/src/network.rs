//! Coordinator registry value types (`spec.md` §3 "Coordinator registries").
//!
//! These are the values stored in the coordinator's pairing/relay/
//! rendezvous/chunk registries, shared between `zajel-coordinator` (which
//! writes them) and `zajel-client` (which deserializes `get_relays`
//! responses and rendezvous notifications referencing them).

use serde::{Deserialize, Serialize};

/// An entry in the pairing index: one pending pairing code registration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PairingEntry {
    pub pairing_code: String,
    pub public_key: [u8; 32],
    pub connection_id: String,
    pub registered_at: u64,
}

/// A relay server as returned by `get_relays`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RelayEntry {
    pub server_id: String,
    pub endpoint: String,
    pub load_fraction: f32,
    pub registered_at: u64,
    pub last_seen: u64,
}

/// An entry in the rendezvous registry: a connection waiting at a given
/// meeting point or hourly token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RendezvousEntry {
    pub point: [u8; 32],
    pub connection_id: String,
    pub public_key: [u8; 32],
    pub dead_drop: Option<Vec<u8>>,
    pub registered_at: u64,
}

/// A known source for a file chunk, as tracked by the coordinator's chunk
/// index (`spec.md` §4.7).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkSource {
    pub file_id: String,
    pub chunk_id: String,
    pub routing_hash: String,
    pub connection_id: String,
    pub registered_at: u64,
}

/// A cached chunk payload, bounded to 1000 entries / 64 KiB each
/// (`spec.md` §3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CachedChunk {
    pub chunk_id: String,
    pub bytes: Vec<u8>,
    pub cached_at: u64,
}

/// The signed bootstrap server list (`spec.md` §4.7/§4.8).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerListEntry {
    pub server_id: String,
    pub endpoint: String,
    pub public_key: [u8; 32],
    pub region: Option<String>,
    pub registered_at: u64,
    pub last_seen: u64,
}

/// `GET /servers` response envelope, signed by the coordinator operator's
/// Ed25519 key over `server_list_bytes || ts`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedServerList {
    pub servers: Vec<ServerListEntry>,
    pub ts: u64,
    pub signature: [u8; 64],
}
