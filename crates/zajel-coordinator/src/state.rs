//! Shared application state threaded through every axum handler
//! (`examples/burakkonte-sinyalist/backend/src/main.rs`'s `AppState`
//! pattern: one `Arc`-cloneable struct holding every `DashMap` registry).

use std::sync::Arc;

use dashmap::DashMap;
use zajel_crypto::ed25519::SigningKey;

use crate::registries::{ChunkIndex, Connections, PairingIndex, PendingPairRequests, RelayRegistry, RendezvousRegistry};

/// One federated coordinator advertised via `GET /servers`
/// (`spec.md` §4.7/§4.8). Distinct from [`RelayRegistry`]: this tracks
/// *other coordinator shards*, refreshed by their own heartbeat, not
/// individual client relay offers.
#[derive(Clone, Debug)]
pub struct FederatedServer {
    pub server_id: String,
    pub endpoint: String,
    pub public_key: [u8; 32],
    pub region: Option<String>,
    pub registered_at: u64,
    pub last_seen: u64,
}

/// TTL after which a federated server is dropped if no heartbeat arrives
/// (`spec.md` §4.8: entries older than the bootstrap entry-freshness
/// window are filtered client-side; the coordinator itself sweeps on the
/// same cadence so the signed list never grows unbounded).
pub const FEDERATED_SERVER_TTL_SECS: u64 = 5 * 60;

#[derive(Default)]
pub struct FederatedServers {
    by_id: DashMap<String, FederatedServer>,
}

impl FederatedServers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, server: FederatedServer) {
        self.by_id.insert(server.server_id.clone(), server);
    }

    pub fn heartbeat(&self, server_id: &str, now: u64) -> bool {
        if let Some(mut entry) = self.by_id.get_mut(server_id) {
            entry.last_seen = now;
            true
        } else {
            false
        }
    }

    pub fn remove(&self, server_id: &str) {
        self.by_id.remove(server_id);
    }

    pub fn sweep(&self, now: u64) {
        self.by_id.retain(|_, v| v.last_seen + FEDERATED_SERVER_TTL_SECS > now);
    }

    pub fn list(&self) -> Vec<FederatedServer> {
        self.by_id.iter().map(|e| e.value().clone()).collect()
    }
}

/// Everything an axum handler needs, bundled into one `Arc`-shared
/// struct and cloned cheaply per request.
#[derive(Clone)]
pub struct AppState {
    pub connections: Connections,
    pub pairing: Arc<PairingIndex>,
    pub pending_pairs: Arc<PendingPairRequests>,
    pub relays: Arc<RelayRegistry>,
    pub rendezvous: Arc<RendezvousRegistry>,
    pub chunks: Arc<ChunkIndex>,
    pub federated_servers: Arc<FederatedServers>,
    /// Signs `GET /servers` responses (`spec.md` §4.7/§4.8). Wrapped in
    /// `Arc` rather than cloned per-request since `SigningKey` zeroizes
    /// its bytes on drop.
    pub operator_signing_key: Arc<SigningKey>,
}

impl AppState {
    pub fn new(operator_signing_key: SigningKey) -> Self {
        Self {
            connections: Connections::new(),
            pairing: Arc::new(PairingIndex::new()),
            pending_pairs: Arc::new(PendingPairRequests::new()),
            relays: Arc::new(RelayRegistry::new()),
            rendezvous: Arc::new(RendezvousRegistry::new()),
            chunks: Arc::new(ChunkIndex::new()),
            federated_servers: Arc::new(FederatedServers::new()),
            operator_signing_key: Arc::new(operator_signing_key),
        }
    }

    /// Clear every registry of a disconnected connection's state
    /// (`spec.md` §8: "after `peer_disconnect` the peer appears in no
    /// registry").
    pub fn remove_connection(&self, connection_id: &str) {
        self.connections.remove(connection_id);
        self.pairing.remove_connection(connection_id);
        self.pending_pairs.remove_connection(connection_id);
        self.relays.remove_connection(connection_id);
        self.rendezvous.remove_connection(connection_id);
        self.chunks.remove_connection(connection_id);
    }

    /// Runs the full periodic GC sweep (`spec.md` §4.7).
    pub fn sweep(&self, now: u64) {
        self.rendezvous.sweep(now);
        self.chunks.sweep(now);
        self.federated_servers.sweep(now);
    }
}
