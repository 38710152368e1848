//! Coordinator configuration, mirroring `zajel-client`'s TOML + env
//! convention (`crates/zajel-client/src/config.rs`) rather than
//! inventing a new one.

use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Complete coordinator configuration. Loaded from `$data_dir/coordinator.toml`
/// with every field overridable by an environment variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Hex-encoded Ed25519 signing key used to sign `GET /servers`
    /// responses (`spec.md` §4.7/§4.8). Generated on first run and
    /// persisted if empty.
    #[serde(default)]
    pub operator_signing_key: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// How often the registry GC sweep runs (`spec.md` §4.7: "one alarm
    /// every 5 minutes").
    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: u64,
    /// How often stale federated bootstrap-server entries are swept
    /// (`spec.md` §4.7/§4.8).
    #[serde(default = "default_server_sweep_interval_secs")]
    pub server_sweep_interval_secs: u64,
    #[serde(default)]
    pub data_dir: String,
}

fn default_listen_addr() -> SocketAddr {
    ([0, 0, 0, 0], 8787).into()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_gc_interval_secs() -> u64 {
    5 * 60
}

fn default_server_sweep_interval_secs() -> u64 {
    60
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            operator_signing_key: String::new(),
            log_level: default_log_level(),
            gc_interval_secs: default_gc_interval_secs(),
            server_sweep_interval_secs: default_server_sweep_interval_secs(),
            data_dir: String::new(),
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from `$data_dir/coordinator.toml`, applying
    /// environment-variable overrides on top. Falls back to defaults if
    /// no config file exists.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();
        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str(&content)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("ZAJEL_COORDINATOR_LISTEN_ADDR") {
            if let Ok(parsed) = addr.parse() {
                self.listen_addr = parsed;
            }
        }
        if let Ok(key) = std::env::var("ZAJEL_COORDINATOR_SIGNING_KEY") {
            self.operator_signing_key = key;
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        if self.data_dir.is_empty() {
            Self::default_data_dir()
        } else {
            PathBuf::from(&self.data_dir)
        }
    }

    fn config_path() -> PathBuf {
        Self::default_data_dir().join("coordinator.toml")
    }

    /// Platform-specific default data directory, overridable by
    /// `ZAJEL_DATA_DIR` (`spec.md` §6).
    fn default_data_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("ZAJEL_DATA_DIR") {
            return PathBuf::from(dir);
        }
        std::env::var("HOME")
            .map(|h| PathBuf::from(h).join(".zajel-coordinator"))
            .unwrap_or_else(|_| PathBuf::from("/tmp/zajel-coordinator"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.listen_addr.port(), 8787);
        assert_eq!(config.gc_interval_secs, 300);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = CoordinatorConfig::default();
        let toml_str = toml::to_string(&config).expect("serialize");
        let parsed: CoordinatorConfig = toml::from_str(&toml_str).expect("parse");
        assert_eq!(parsed.listen_addr, config.listen_addr);
    }
}
