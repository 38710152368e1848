//! zajel-client: the Zajel peer-to-peer messenger client daemon.
//!
//! Single OS process running a Tokio runtime. Loads or generates the
//! identity key pair, opens the local database, starts the QUIC
//! transport and signaling connection, and drives the connection
//! manager until shutdown.

mod config;
mod connection_manager;
mod discovery;
mod events;

use std::sync::Arc;

use tracing::{info, warn};

use zajel_crypto::ed25519::VerifyingKey;
use zajel_crypto::sha256;
use zajel_crypto::x25519::X25519StaticSecret;
use zajel_db::StoredIdentity;
use zajel_rendezvous::pairing_code::PairingCode;
use zajel_transport::quic::{QuicConfig, QuicNode};

use crate::config::ClientConfig;
use crate::connection_manager::ConnectionManager;
use crate::discovery::Discovery;
use crate::events::EventBus;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ClientConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.advanced.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("zajel-client starting");

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;

    // 1. Open database and load or generate the identity.
    let db_path = data_dir.join("zajel.db");
    let conn = zajel_db::open(&db_path)?;
    let (self_secret, pairing_code) = load_or_create_identity(&conn)?;
    let self_public_key = self_secret.public_key().to_bytes();
    info!(
        fingerprint = %sha256::format_fingerprint(&sha256::fingerprint(&self_public_key)),
        pairing_code = %pairing_code,
        "identity ready"
    );
    let db = Arc::new(tokio::sync::Mutex::new(conn));

    // 2. Event bus for the five observable streams (`spec.md` §4.3).
    let events = EventBus::default();

    // 3. Discover a coordinator, unless a fixed URL is configured for
    //    tests (`spec.md` §6 "E2E-test flag").
    let signaling_url = if let Some(url) = config.network.signaling_url_override.clone() {
        url
    } else if config.network.bootstrap_verifying_key.is_empty() {
        warn!("no bootstrap verifying key configured, skipping discovery");
        config.network.bootstrap_url.clone()
    } else {
        let key_bytes = hex::decode(&config.network.bootstrap_verifying_key)
            .ok()
            .and_then(|b| <[u8; 32]>::try_from(b).ok());
        match key_bytes.and_then(|b| VerifyingKey::from_bytes(&b).ok()) {
            Some(verifying_key) => {
                let discovery = Discovery::new(
                    config.network.bootstrap_url.clone(),
                    verifying_key,
                    config.network.preferred_region.clone(),
                );
                let now = now_secs();
                discovery.refresh(now).await;
                match discovery.select().await {
                    Ok(entry) => entry.endpoint,
                    Err(e) => {
                        warn!(error = %e, "server discovery failed, falling back to bootstrap URL");
                        config.network.bootstrap_url.clone()
                    }
                }
            }
            None => {
                warn!("bootstrap verifying key is malformed, skipping discovery");
                config.network.bootstrap_url.clone()
            }
        }
    };

    // 4. Start the QUIC transport.
    let quic_config = QuicConfig { bind_addr: ([0, 0, 0, 0], config.network.listen_port).into(), ..Default::default() };
    let quic = Arc::new(QuicNode::new(quic_config)?);

    // 5. Build the connection manager: owns signaling, transport, the
    //    peer table, and the file-transfer engine.
    let downloads_dir = data_dir.join("downloads");
    std::fs::create_dir_all(&downloads_dir)?;

    let manager = ConnectionManager::connect(
        signaling_url,
        self_secret,
        pairing_code,
        quic,
        events.clone(),
        db,
        downloads_dir,
        config.storage.max_file_size,
    );

    info!("zajel-client running");

    // 6. Run until Ctrl-C; cancellation tears down every per-peer task
    //    (`spec.md` §5 "Peer disconnect cancels every per-peer
    //    operation").
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping");
    drop(manager);

    Ok(())
}

/// Load the persisted identity, or generate and persist a new one on
/// first run (`spec.md` §4.1 `initialize()`).
fn load_or_create_identity(conn: &rusqlite::Connection) -> anyhow::Result<(X25519StaticSecret, PairingCode)> {
    if let Some(stored) = zajel_db::load_identity(conn)? {
        let secret = X25519StaticSecret::from_bytes(stored.secret_key);
        let code = PairingCode::parse(&stored.pairing_code)?;
        return Ok((secret, code));
    }

    let secret = X25519StaticSecret::random();
    let public_key = secret.public_key().to_bytes();
    let pairing_code = PairingCode::generate();
    let now = now_secs();

    zajel_db::save_identity(
        conn,
        &StoredIdentity {
            public_key,
            secret_key: secret.to_bytes(),
            pairing_code: pairing_code.as_str().to_string(),
            created_at: now,
        },
    )?;

    info!("generated new identity on first run");
    Ok((secret, pairing_code))
}

fn now_secs() -> u64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs()
}
