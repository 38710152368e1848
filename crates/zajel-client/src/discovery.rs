//! Server discovery (`spec.md` §4.8): fetch the signed bootstrap list
//! from a configured URL, verify it, filter by freshness, and select a
//! relay to connect to. Refreshed periodically in the background.
//!
//! Grounded on `ochra-dht/src/bootstrap.rs`'s retry/backoff/tracing
//! idiom, retargeted from a multi-seed DHT ping to a single signed HTTP
//! fetch against a coordinator's `GET /servers`.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use zajel_crypto::ed25519::{Signature, VerifyingKey};
use zajel_types::network::{ServerListEntry, SignedServerList};

/// Server response must have been signed within this window of "now"
/// (`spec.md` §4.7: "within, e.g., 5 min").
const SIGNATURE_FRESHNESS: Duration = Duration::from_secs(5 * 60);

/// Entries whose own `lastSeen` is older than this are discarded
/// (`spec.md` §4.8).
const ENTRY_FRESHNESS: Duration = Duration::from_secs(2 * 60);

/// How many of the freshest surviving entries to randomize over.
const SELECTION_POOL: usize = 3;

/// Default periodic refresh interval (`spec.md` §4.8).
pub const DEFAULT_REFRESH: Duration = Duration::from_secs(60);

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("bootstrap fetch failed: {0}")]
    Fetch(String),
    #[error("bootstrap response malformed: {0}")]
    Malformed(String),
    #[error("bootstrap signature verification failed")]
    InvalidSignature,
    #[error("bootstrap response is stale (ts outside freshness window)")]
    Stale,
    #[error("no fresh servers available")]
    NoServers,
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;

/// Client for the signed bootstrap list: fetch, verify, cache, select.
pub struct Discovery {
    http: reqwest::Client,
    bootstrap_url: String,
    verifying_key: VerifyingKey,
    preferred_region: Option<String>,
    cache: RwLock<Vec<ServerListEntry>>,
}

impl Discovery {
    pub fn new(bootstrap_url: String, verifying_key: VerifyingKey, preferred_region: Option<String>) -> Arc<Self> {
        let http = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Arc::new(Self { http, bootstrap_url, verifying_key, preferred_region, cache: RwLock::new(Vec::new()) })
    }

    /// Fetch, verify, and cache the bootstrap list. On any failure the
    /// previously cached entries are left unchanged and returned
    /// (`spec.md` §4.8: "on fetch error, return cached entries
    /// unchanged").
    pub async fn refresh(&self, now: u64) -> Vec<ServerListEntry> {
        match self.fetch_and_verify(now).await {
            Ok(servers) => {
                info!(count = servers.len(), "bootstrap list refreshed");
                *self.cache.write().await = servers.clone();
                servers
            }
            Err(e) => {
                warn!(error = %e, "bootstrap refresh failed, using cached entries");
                self.cache.read().await.clone()
            }
        }
    }

    async fn fetch_and_verify(&self, now: u64) -> Result<Vec<ServerListEntry>> {
        let response = self
            .http
            .get(&self.bootstrap_url)
            .send()
            .await
            .map_err(|e| DiscoveryError::Fetch(e.to_string()))?
            .error_for_status()
            .map_err(|e| DiscoveryError::Fetch(e.to_string()))?;

        let list: SignedServerList =
            response.json().await.map_err(|e| DiscoveryError::Malformed(e.to_string()))?;

        verify_signature(&self.verifying_key, &list)?;

        let age = now.abs_diff(list.ts);
        if age > SIGNATURE_FRESHNESS.as_secs() {
            return Err(DiscoveryError::Stale);
        }

        let fresh: Vec<ServerListEntry> = list
            .servers
            .into_iter()
            .filter(|entry| now.saturating_sub(entry.last_seen) <= ENTRY_FRESHNESS.as_secs())
            .collect();

        debug!(surviving = fresh.len(), "bootstrap entries passed freshness filter");
        Ok(fresh)
    }

    /// Pick one relay from the current cache (`spec.md` §4.8): filter by
    /// preferred region if set and non-empty after filtering, take the
    /// `SELECTION_POOL` freshest, pick uniformly at random.
    pub async fn select(&self) -> Result<ServerListEntry> {
        let cached = self.cache.read().await;
        select_from(&cached, self.preferred_region.as_deref()).ok_or(DiscoveryError::NoServers)
    }
}

fn verify_signature(verifying_key: &VerifyingKey, list: &SignedServerList) -> Result<()> {
    let message = signed_message(&list.servers, list.ts);
    let signature = Signature::from_bytes(&list.signature);
    verifying_key.verify(&message, &signature).map_err(|_| DiscoveryError::InvalidSignature)
}

/// The exact byte string the operator's Ed25519 key signs: the
/// canonical JSON encoding of the server list followed by the 8-byte
/// big-endian timestamp (`spec.md` §4.7: `server_list_bytes || ts`).
pub fn signed_message(servers: &[ServerListEntry], ts: u64) -> Vec<u8> {
    let mut message = serde_json::to_vec(servers).unwrap_or_default();
    message.extend_from_slice(&ts.to_be_bytes());
    message
}

fn select_from(entries: &[ServerListEntry], preferred_region: Option<&str>) -> Option<ServerListEntry> {
    let regional: Vec<&ServerListEntry> = match preferred_region {
        Some(region) => entries.iter().filter(|e| e.region.as_deref() == Some(region)).collect(),
        None => Vec::new(),
    };
    let pool: Vec<&ServerListEntry> = if regional.is_empty() { entries.iter().collect() } else { regional };

    let mut sorted = pool;
    sorted.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
    sorted.truncate(SELECTION_POOL);

    sorted.choose(&mut rand::thread_rng()).map(|e| (*e).clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use zajel_crypto::ed25519::KeyPair;

    fn entry(id: &str, region: Option<&str>, last_seen: u64) -> ServerListEntry {
        ServerListEntry {
            server_id: id.to_string(),
            endpoint: format!("https://{id}.example"),
            public_key: [0u8; 32],
            region: region.map(|r| r.to_string()),
            registered_at: 0,
            last_seen,
        }
    }

    #[test]
    fn signature_roundtrips() {
        let keypair = KeyPair::generate();
        let servers = vec![entry("a", None, 100)];
        let message = signed_message(&servers, 1_000);
        let signature = keypair.signing_key.sign(&message);
        assert!(keypair.verifying_key.verify(&message, &signature).is_ok());
    }

    #[test]
    fn tampered_entry_fails_verification() {
        let keypair = KeyPair::generate();
        let servers = vec![entry("a", None, 100)];
        let message = signed_message(&servers, 1_000);
        let signature = keypair.signing_key.sign(&message);

        let tampered = vec![entry("b", None, 100)];
        let tampered_message = signed_message(&tampered, 1_000);
        assert!(keypair.verifying_key.verify(&tampered_message, &signature).is_err());
    }

    #[test]
    fn select_prefers_region_when_available() {
        let entries = vec![entry("a", Some("eu"), 300), entry("b", Some("us"), 400), entry("c", Some("eu"), 200)];
        for _ in 0..20 {
            let picked = select_from(&entries, Some("eu")).expect("selection");
            assert_eq!(picked.region.as_deref(), Some("eu"));
        }
    }

    #[test]
    fn select_falls_back_when_region_has_no_matches() {
        let entries = vec![entry("a", Some("us"), 300)];
        let picked = select_from(&entries, Some("eu")).expect("selection");
        assert_eq!(picked.server_id, "a");
    }

    #[test]
    fn select_returns_none_when_empty() {
        assert!(select_from(&[], None).is_none());
    }

    #[test]
    fn select_only_considers_freshest_pool() {
        let entries = vec![
            entry("old1", None, 10),
            entry("old2", None, 20),
            entry("new1", None, 300),
            entry("new2", None, 400),
        ];
        // With SELECTION_POOL = 3, the freshest pool out of these four is
        // {new2, new1, old2} — "old1" is the only entry ever excluded.
        for _ in 0..20 {
            let picked = select_from(&entries, None).expect("selection");
            assert_ne!(picked.server_id, "old1");
        }
    }
}
