//! The four process-wide, single-writer-per-key registries (`spec.md`
//! §3 "Coordinator registries", §4.7), plus the connection table they're
//! all indexed against. Each is a [`DashMap`] rather than one lock over
//! the whole table — concurrent mutations to different keys never block
//! each other, matching this corpus's `DashMap`-per-registry idiom
//! (`other_examples/..._rendezvous.rs.rs`).
//!
//! Every registry exposes its own `remove_connection`, called from one
//! place (`ws.rs`'s disconnect path) so a peer leaving always clears
//! every table it could appear in (`spec.md` §8: "after `peer_disconnect`
//! ... the peer appears in no registry").

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use zajel_signaling::messages::ServerMessage;

use crate::{CoordinatorError, Result};

/// Source TTL in the chunk index (`spec.md` §3).
pub const CHUNK_SOURCE_TTL_SECS: u64 = 60 * 60;
/// Cached-chunk TTL (`spec.md` §3).
pub const CHUNK_CACHE_TTL_SECS: u64 = 30 * 60;
/// Pending chunk request TTL (`spec.md` §3).
pub const CHUNK_PENDING_TTL_SECS: u64 = 5 * 60;
/// Maximum number of distinct chunks the coordinator will cache payloads
/// for at once, LRU-evicted (`spec.md` §3).
pub const CHUNK_CACHE_CAPACITY: usize = 1000;
/// Maximum single cached chunk payload (`spec.md` §3/§4.7).
pub const MAX_CHUNK_PAYLOAD: usize = 64 * 1024;

/// Daily meeting-point TTL (`spec.md` §3).
pub const RENDEZVOUS_DAILY_TTL_SECS: u64 = 48 * 60 * 60;
/// Hourly meeting-point TTL (`spec.md` §3).
pub const RENDEZVOUS_HOURLY_TTL_SECS: u64 = 3 * 60 * 60;

/// How long a pairing request stays pending before `pair_timeout`
/// (`spec.md` §4.7, §5).
pub const PAIR_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Below this load/capacity fraction a relay is offered by `get_relays`
/// (`spec.md` §4.7).
pub const RELAY_CAPACITY_THRESHOLD: f32 = 0.5;

/// The per-connection outbound channel, keyed by an opaque connection id
/// (one per upgraded WebSocket). Every registry stores only this id, not
/// the sender itself, so registries never need to know about sockets
/// (`spec.md` §9 "Cyclic references").
#[derive(Clone, Default)]
pub struct Connections {
    senders: Arc<DashMap<String, mpsc::Sender<ServerMessage>>>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, connection_id: String, sender: mpsc::Sender<ServerMessage>) {
        self.senders.insert(connection_id, sender);
    }

    pub fn remove(&self, connection_id: &str) {
        self.senders.remove(connection_id);
    }

    /// Best-effort delivery; a full or closed channel is dropped with a
    /// warning rather than surfaced, matching the coordinator's role as a
    /// pure forwarder with no retry obligations.
    pub fn send(&self, connection_id: &str, message: ServerMessage) -> bool {
        match self.senders.get(connection_id) {
            Some(sender) => match sender.try_send(message) {
                Ok(()) => true,
                Err(_) => {
                    warn!(connection_id, "dropping message, outbound channel full or closed");
                    false
                }
            },
            None => false,
        }
    }
}

/// One active pairing-code registration (`spec.md` §3 "Pairing index").
#[derive(Clone, Debug)]
pub struct PairingRegistration {
    pub connection_id: String,
    pub public_key: [u8; 32],
    pub registered_at: u64,
}

#[derive(Default)]
pub struct PairingIndex {
    by_code: DashMap<String, PairingRegistration>,
    /// Reverse index so the handler can find a connection's own code
    /// without scanning `by_code` (`ws.rs` needs this on every forwarded
    /// message to stamp a `from` code).
    by_connection: DashMap<String, String>,
}

impl PairingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `code` for `connection_id`/`public_key`. Re-registering
    /// the same code with the same key is idempotent (reconnect case);
    /// re-registering with a *different* key is refused (`spec.md`
    /// §4.7: "enforce uniqueness (refuse duplicate with a distinct
    /// `pk`)").
    pub fn register(&self, code: &str, connection_id: &str, public_key: [u8; 32], now: u64) -> Result<()> {
        if let Some(existing) = self.by_code.get(code) {
            if existing.public_key != public_key && existing.connection_id != connection_id {
                return Err(CoordinatorError::DuplicateCode);
            }
        }
        self.by_code.insert(
            code.to_string(),
            PairingRegistration { connection_id: connection_id.to_string(), public_key, registered_at: now },
        );
        self.by_connection.insert(connection_id.to_string(), code.to_string());
        Ok(())
    }

    pub fn lookup(&self, code: &str) -> Option<PairingRegistration> {
        self.by_code.get(code).map(|e| e.clone())
    }

    /// The pairing code and key a connection last registered under, if
    /// any.
    pub fn lookup_by_connection(&self, connection_id: &str) -> Option<(String, [u8; 32])> {
        let code = self.by_connection.get(connection_id)?.clone();
        self.by_code.get(&code).map(|e| (code, e.public_key))
    }

    pub fn remove_connection(&self, connection_id: &str) {
        self.by_code.retain(|_, v| v.connection_id != connection_id);
        self.by_connection.remove(connection_id);
    }
}

/// A `pair_request` awaiting a response, with a monotonically
/// increasing id so a stale timer firing after the request has already
/// resolved (accepted, rejected, or superseded) is a no-op.
#[derive(Clone, Debug)]
struct PendingPairRequest {
    request_id: u64,
    from_code: String,
    from_connection_id: String,
}

#[derive(Default)]
pub struct PendingPairRequests {
    by_target_code: DashMap<String, PendingPairRequest>,
    next_id: std::sync::atomic::AtomicU64,
}

/// An opaque handle identifying one pending pair request, used to detect
/// whether a fired timeout timer is still current.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PairRequestHandle(u64);

impl PendingPairRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `from_code -> target_code` as pending, returning a handle
    /// a timeout task can later present to [`Self::expire`].
    pub fn insert(&self, target_code: &str, from_code: &str, from_connection_id: &str) -> PairRequestHandle {
        let request_id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.by_target_code.insert(
            target_code.to_string(),
            PendingPairRequest {
                request_id,
                from_code: from_code.to_string(),
                from_connection_id: from_connection_id.to_string(),
            },
        );
        PairRequestHandle(request_id)
    }

    /// Resolve (accept or reject) a pending request, returning the
    /// original requester's connection id and code if this was still the
    /// live request for `target_code`.
    pub fn resolve(&self, target_code: &str) -> Option<(String, String)> {
        self.by_target_code.remove(target_code).map(|(_, req)| (req.from_connection_id, req.from_code))
    }

    /// Called by the timeout task: removes and returns the requester's
    /// connection id only if `handle` is still the live request for
    /// `target_code` (i.e. it hasn't since been resolved or superseded).
    pub fn expire(&self, target_code: &str, handle: PairRequestHandle) -> Option<String> {
        let still_live = self.by_target_code.get(target_code).map(|r| r.request_id) == Some(handle.0);
        if !still_live {
            return None;
        }
        self.by_target_code.remove(target_code).map(|(_, req)| req.from_connection_id)
    }

    pub fn remove_connection(&self, connection_id: &str) {
        self.by_target_code.retain(|_, v| v.from_connection_id != connection_id);
    }
}

/// One relay server's advertised capacity and observed load (`spec.md`
/// §3 "Relay registry").
#[derive(Clone, Debug)]
pub struct RelayEntry {
    pub endpoint: String,
    pub public_key: [u8; 32],
    pub capacity: u32,
    pub load: u32,
    pub last_seen: u64,
}

#[derive(Default)]
pub struct RelayRegistry {
    by_connection: DashMap<String, RelayEntry>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection_id: &str, endpoint: String, public_key: [u8; 32], capacity: u32, now: u64) {
        self.by_connection.insert(
            connection_id.to_string(),
            RelayEntry { endpoint, public_key, capacity: capacity.max(1), load: 0, last_seen: now },
        );
    }

    pub fn update_load(&self, connection_id: &str, load: u32, now: u64) {
        if let Some(mut entry) = self.by_connection.get_mut(connection_id) {
            entry.load = load;
            entry.last_seen = now;
        }
    }

    /// Fisher-Yates-shuffled subset of peers currently below the 50%
    /// capacity threshold, excluding `exclude_connection_id` itself
    /// (`spec.md` §4.7).
    pub fn get_relays(&self, exclude_connection_id: &str) -> Vec<RelayEntry> {
        use rand::seq::SliceRandom;
        let mut candidates: Vec<RelayEntry> = self
            .by_connection
            .iter()
            .filter(|e| e.key() != exclude_connection_id)
            .filter(|e| (e.load as f32) < (e.capacity as f32) * RELAY_CAPACITY_THRESHOLD)
            .map(|e| e.value().clone())
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates
    }

    pub fn remove_connection(&self, connection_id: &str) {
        self.by_connection.remove(connection_id);
    }
}

/// One peer's registration at a meeting point (`spec.md` §3 "Rendezvous
/// registry").
#[derive(Clone, Debug)]
pub struct RendezvousEntry {
    pub connection_id: String,
    pub public_key: [u8; 32],
    pub pairing_code: String,
    pub dead_drop: Option<Vec<u8>>,
    pub registered_at: u64,
    pub expires_at: u64,
}

#[derive(Default)]
pub struct RendezvousRegistry {
    daily: DashMap<String, Vec<RendezvousEntry>>,
    hourly: DashMap<String, Vec<RendezvousEntry>>,
}

impl RendezvousRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a daily dead-drop at `point`, returning every *other*
    /// peer's currently live entry at the same point so the caller can
    /// forward them as `rendezvous_deaddrop` immediately (`spec.md`
    /// §4.7: "before appending, return all currently live entries for
    /// the same point from other peers").
    pub fn register_daily(
        &self,
        point: &str,
        connection_id: &str,
        public_key: [u8; 32],
        pairing_code: String,
        dead_drop: Option<Vec<u8>>,
        now: u64,
    ) -> Vec<RendezvousEntry> {
        let mut entries = self.daily.entry(point.to_string()).or_default();
        entries.retain(|e| e.expires_at > now);
        let others: Vec<RendezvousEntry> =
            entries.iter().filter(|e| e.connection_id != connection_id).cloned().collect();
        entries.retain(|e| e.connection_id != connection_id);
        entries.push(RendezvousEntry {
            connection_id: connection_id.to_string(),
            public_key,
            pairing_code,
            dead_drop,
            registered_at: now,
            expires_at: now + RENDEZVOUS_DAILY_TTL_SECS,
        });
        others
    }

    /// Register an hourly live-match token at `point`. Returns the other
    /// peer's entry if one was already live at this token (`spec.md`
    /// §4.7: "whenever a new peer registers at an existing token, both
    /// peers receive `rendezvous_live_match`").
    pub fn register_hourly(
        &self,
        point: &str,
        connection_id: &str,
        public_key: [u8; 32],
        pairing_code: String,
        now: u64,
    ) -> Option<RendezvousEntry> {
        let mut entries = self.hourly.entry(point.to_string()).or_default();
        entries.retain(|e| e.expires_at > now);
        let other = entries.iter().find(|e| e.connection_id != connection_id).cloned();
        entries.retain(|e| e.connection_id != connection_id);
        entries.push(RendezvousEntry {
            connection_id: connection_id.to_string(),
            public_key,
            pairing_code,
            dead_drop: None,
            registered_at: now,
            expires_at: now + RENDEZVOUS_HOURLY_TTL_SECS,
        });
        other
    }

    /// Lazy GC on touch, plus the periodic alarm calls this too
    /// (`spec.md` §4.7: "GC'd lazily on touch and by periodic alarm").
    pub fn sweep(&self, now: u64) {
        self.daily.retain(|_, entries| {
            entries.retain(|e| e.expires_at > now);
            !entries.is_empty()
        });
        self.hourly.retain(|_, entries| {
            entries.retain(|e| e.expires_at > now);
            !entries.is_empty()
        });
    }

    pub fn remove_connection(&self, connection_id: &str) {
        for mut entries in self.daily.iter_mut() {
            entries.retain(|e| e.connection_id != connection_id);
        }
        for mut entries in self.hourly.iter_mut() {
            entries.retain(|e| e.connection_id != connection_id);
        }
    }
}

/// A cached chunk payload (`spec.md` §3 "Chunk index").
#[derive(Clone, Debug)]
struct CacheRecord {
    bytes: Vec<u8>,
    cached_at: u64,
    access_count: u64,
}

#[derive(Default)]
struct ChunkEntry {
    sources: DashMap<String, u64>,
    cache: Option<CacheRecord>,
    pending: DashMap<String, u64>,
}

/// Outcome of a `chunk_request` lookup (`spec.md` §4.7).
pub enum ChunkLookup {
    /// Served directly from the coordinator's cache.
    CacheHit(Vec<u8>),
    /// No cached copy; pull from this source and register the requester
    /// as pending.
    PullFrom(String),
    /// No cache, no sources.
    NotFound,
}

#[derive(Default)]
pub struct ChunkIndex {
    entries: DashMap<String, ChunkEntry>,
}

impl ChunkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `connection_id` as a source for `chunk_id`. Returns `true`
    /// if there are pending requesters waiting on this chunk, so the
    /// caller can issue a `chunk_pull` to the announcer immediately
    /// (`spec.md` §4.7).
    pub fn announce(&self, chunk_id: &str, connection_id: &str, now: u64) -> bool {
        let mut entry = self.entries.entry(chunk_id.to_string()).or_default();
        entry.sources.insert(connection_id.to_string(), now + CHUNK_SOURCE_TTL_SECS);
        !entry.pending.is_empty()
    }

    pub fn request(&self, chunk_id: &str, requester_connection_id: &str, now: u64) -> ChunkLookup {
        let mut entry = self.entries.entry(chunk_id.to_string()).or_default();

        if let Some(cache) = entry.cache.as_mut() {
            if cache.cached_at + CHUNK_CACHE_TTL_SECS > now {
                cache.access_count += 1;
                return ChunkLookup::CacheHit(cache.bytes.clone());
            }
            entry.cache = None;
        }

        entry.sources.retain(|_, &mut expires_at| expires_at > now);
        let source = entry.sources.iter().next().map(|e| e.key().clone());
        match source {
            Some(source_connection_id) => {
                entry.pending.insert(requester_connection_id.to_string(), now);
                ChunkLookup::PullFrom(source_connection_id)
            }
            None => ChunkLookup::NotFound,
        }
    }

    /// Store a pushed chunk payload and return every requester currently
    /// pending on it, clearing the pending set (`spec.md` §8: "the
    /// pending set for that chunk is empty").
    pub fn push(&self, chunk_id: &str, bytes: Vec<u8>, now: u64) -> Result<Vec<String>> {
        if bytes.len() > MAX_CHUNK_PAYLOAD {
            return Err(CoordinatorError::ChunkTooLarge { size: bytes.len(), max: MAX_CHUNK_PAYLOAD });
        }

        self.evict_if_full(chunk_id, now);

        let mut entry = self.entries.entry(chunk_id.to_string()).or_default();
        entry.cache = Some(CacheRecord { bytes, cached_at: now, access_count: 0 });

        let requesters: Vec<String> = entry.pending.iter().map(|e| e.key().clone()).collect();
        entry.pending.clear();
        Ok(requesters)
    }

    /// LRU eviction: if the cache is at capacity and `chunk_id` doesn't
    /// already have a cached entry, drop the least-recently-cached
    /// payload to make room (`spec.md` §3: "bounded to 1000 entries, LRU
    /// eviction").
    fn evict_if_full(&self, chunk_id: &str, now: u64) {
        let already_cached = self.entries.get(chunk_id).map(|e| e.cache.is_some()).unwrap_or(false);
        if already_cached {
            return;
        }
        let cached_count = self.entries.iter().filter(|e| e.cache.is_some()).count();
        if cached_count < CHUNK_CACHE_CAPACITY {
            return;
        }
        let oldest = self
            .entries
            .iter()
            .filter_map(|e| e.value().cache.as_ref().map(|c| (e.key().clone(), c.cached_at)))
            .min_by_key(|(_, cached_at)| *cached_at);
        if let Some((oldest_id, _)) = oldest {
            if let Some(mut entry) = self.entries.get_mut(&oldest_id) {
                debug!(chunk_id = %oldest_id, now, "evicting LRU cached chunk");
                entry.cache = None;
            }
        }
    }

    /// Periodic sweep (`spec.md` §4.7: "one alarm every 5 minutes sweeps
    /// ... chunk expirations"): expired sources and pending requests are
    /// dropped; expired cache entries are cleared; empty entries are
    /// removed entirely.
    pub fn sweep(&self, now: u64) {
        self.entries.retain(|_, entry| {
            entry.sources.retain(|_, &mut expires_at| expires_at > now);
            entry.pending.retain(|_, &mut requested_at| requested_at + CHUNK_PENDING_TTL_SECS > now);
            if let Some(cache) = &entry.cache {
                if cache.cached_at + CHUNK_CACHE_TTL_SECS <= now {
                    entry.cache = None;
                }
            }
            !entry.sources.is_empty() || !entry.pending.is_empty() || entry.cache.is_some()
        });
    }

    pub fn remove_connection(&self, connection_id: &str) {
        for mut entry in self.entries.iter_mut() {
            entry.sources.remove(connection_id);
            entry.pending.remove(connection_id);
        }
    }
}
