//! zajel-coordinator: the rendezvous broker binary (`spec.md` §4.7).
//!
//! Wires [`CoordinatorConfig`], [`AppState`], and the axum router
//! together, mirroring `zajel-client`'s bootstrap sequence and
//! `examples/burakkonte-sinyalist/backend/src/main.rs`'s
//! `Router` + `ServiceBuilder` + graceful-shutdown idiom.

use std::time::Duration;

use axum::routing::{delete, get, post};
use axum::Router;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use zajel_coordinator::config::CoordinatorConfig;
use zajel_coordinator::state::AppState;
use zajel_coordinator::{http, now_secs, ws};
use zajel_crypto::ed25519::SigningKey;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CoordinatorConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("zajel-coordinator starting");

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;

    let signing_key = load_or_create_signing_key(&config, &data_dir)?;
    let state = AppState::new(signing_key);

    let app = Router::new()
        .route("/health", get(http::health))
        .route("/servers", get(http::get_servers).post(http::register_server))
        .route("/servers/heartbeat", post(http::heartbeat_server))
        .route("/servers/:server_id", delete(http::remove_server))
        .route("/", get(ws::handle_upgrade))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive()))
        .with_state(state.clone());

    spawn_gc_tasks(state.clone(), &config);

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, "zajel-coordinator listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received, stopping");
        })
        .await?;

    Ok(())
}

/// Periodic registry sweep (`spec.md` §4.7: "one alarm every 5 minutes")
/// and the separately-cadenced federated-server sweep.
fn spawn_gc_tasks(state: AppState, config: &CoordinatorConfig) {
    let gc_state = state.clone();
    let gc_interval = Duration::from_secs(config.gc_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(gc_interval);
        loop {
            ticker.tick().await;
            gc_state.sweep(now_secs());
        }
    });

    let sweep_interval = Duration::from_secs(config.server_sweep_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            state.federated_servers.sweep(now_secs());
        }
    });
}

/// Load the operator's Ed25519 signing key from config, generating and
/// persisting a fresh one on first run (`spec.md` §4.7/§4.8).
fn load_or_create_signing_key(config: &CoordinatorConfig, data_dir: &std::path::Path) -> anyhow::Result<SigningKey> {
    if !config.operator_signing_key.is_empty() {
        let bytes = hex::decode(&config.operator_signing_key)?;
        let array: [u8; 32] = bytes.try_into().map_err(|_| anyhow::anyhow!("operator signing key must be 32 bytes"))?;
        return Ok(SigningKey::from_bytes(&array));
    }

    let key_path = data_dir.join("operator.key");
    if key_path.exists() {
        let hex_str = std::fs::read_to_string(&key_path)?;
        let bytes = hex::decode(hex_str.trim())?;
        let array: [u8; 32] = bytes.try_into().map_err(|_| anyhow::anyhow!("stored operator key must be 32 bytes"))?;
        return Ok(SigningKey::from_bytes(&array));
    }

    let key = SigningKey::generate();
    std::fs::write(&key_path, hex::encode(key.to_bytes()))?;
    info!(path = %key_path.display(), "generated new operator signing key");
    Ok(key)
}
