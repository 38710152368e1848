//! Client configuration (`spec.md` §6 "Environment variables / config").

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Complete client configuration. Loaded from `$data_dir/config.toml`
/// with every field overridable by an environment variable, and falls
/// back to defaults entirely when no file exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub advanced: AdvancedConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            storage: StorageConfig::default(),
            advanced: AdvancedConfig::default(),
        }
    }
}

/// Network settings: where to find a coordinator and how to reach peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// `GET /servers` bootstrap URL (`spec.md` §4.8).
    #[serde(default = "default_bootstrap_url")]
    pub bootstrap_url: String,
    /// Overrides the signaling `wss://` URL a discovered server would
    /// otherwise select, for pointing at a fixed coordinator in tests.
    #[serde(default)]
    pub signaling_url_override: Option<String>,
    /// STUN servers for local candidate gathering; configured
    /// externally, unused by the coordinator (`spec.md` §4.5).
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    /// Ed25519 verifying key for the bootstrap server list signature,
    /// pinned in the client binary (`spec.md` §4.8), hex-encoded here.
    #[serde(default = "default_bootstrap_verifying_key")]
    pub bootstrap_verifying_key: String,
    /// Preferred relay region for server selection (`spec.md` §4.8).
    #[serde(default)]
    pub preferred_region: Option<String>,
    /// How often to refresh the bootstrap list (`spec.md` §4.8: default
    /// 60 s).
    #[serde(default = "default_discovery_refresh_secs")]
    pub discovery_refresh_secs: u64,
    /// 0 = OS-assigned ephemeral UDP port for the QUIC endpoint.
    #[serde(default)]
    pub listen_port: u16,
}

/// Storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data directory. Empty = platform default.
    #[serde(default)]
    pub data_dir: String,
    /// File transfer acceptance ceiling (`spec.md` §4.6: default
    /// 100 MiB).
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
}

/// Advanced / test-only settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_file: String,
    /// Set under integration tests to skip real bootstrap discovery and
    /// connect directly to a fixed coordinator (`spec.md` §6).
    #[serde(default)]
    pub e2e_test_mode: bool,
}

fn default_bootstrap_url() -> String {
    "https://bootstrap.zajel.example/servers".to_string()
}

fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}

fn default_bootstrap_verifying_key() -> String {
    String::new()
}

fn default_discovery_refresh_secs() -> u64 {
    60
}

fn default_max_file_size() -> u64 {
    100 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bootstrap_url: default_bootstrap_url(),
            signaling_url_override: None,
            stun_servers: default_stun_servers(),
            bootstrap_verifying_key: default_bootstrap_verifying_key(),
            preferred_region: None,
            discovery_refresh_secs: default_discovery_refresh_secs(),
            listen_port: 0,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { data_dir: String::new(), max_file_size: default_max_file_size() }
    }
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self { log_level: default_log_level(), log_file: String::new(), e2e_test_mode: false }
    }
}

impl NetworkConfig {
    pub fn discovery_refresh(&self) -> Duration {
        Duration::from_secs(self.discovery_refresh_secs)
    }
}

impl ClientConfig {
    /// Load configuration from `$data_dir/config.toml`, applying
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
        if let Ok(url) = std::env::var("ZAJEL_BOOTSTRAP_URL") {
            self.network.bootstrap_url = url;
        }
        if let Ok(url) = std::env::var("ZAJEL_SIGNALING_URL") {
            self.network.signaling_url_override = Some(url);
        }
        if let Ok(stun) = std::env::var("ZAJEL_STUN_SERVERS") {
            self.network.stun_servers = stun.split(',').map(|s| s.trim().to_string()).collect();
        }
        if std::env::var("ZAJEL_E2E_TEST").is_ok() {
            self.advanced.e2e_test_mode = true;
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        if self.storage.data_dir.is_empty() {
            Self::default_data_dir()
        } else {
            PathBuf::from(&self.storage.data_dir)
        }
    }

    fn config_path() -> PathBuf {
        Self::default_data_dir().join("config.toml")
    }

    /// Platform-specific default data directory, overridable by
    /// `ZAJEL_DATA_DIR` (`spec.md` §6).
    fn default_data_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("ZAJEL_DATA_DIR") {
            return PathBuf::from(dir);
        }
        #[cfg(target_os = "macos")]
        {
            dirs_fallback("Library/Application Support/Zajel")
        }
        #[cfg(target_os = "linux")]
        {
            dirs_fallback(".zajel")
        }
        #[cfg(target_os = "windows")]
        {
            dirs_fallback("Zajel")
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            dirs_fallback(".zajel")
        }
    }
}

fn dirs_fallback(subpath: &str) -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(subpath))
        .unwrap_or_else(|_| PathBuf::from("/tmp/zajel"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = ClientConfig::default();
        assert_eq!(config.network.listen_port, 0);
        assert_eq!(config.network.discovery_refresh_secs, 60);
        assert_eq!(config.storage.max_file_size, 100 * 1024 * 1024);
        assert!(!config.advanced.e2e_test_mode);
    }

    #[test]
    fn config_round_trips_through_toml() {
        let config = ClientConfig::default();
        let toml_str = toml::to_string(&config).expect("serialize");
        let parsed: ClientConfig = toml::from_str(&toml_str).expect("parse");
        assert_eq!(parsed.network.bootstrap_url, config.network.bootstrap_url);
    }

    #[test]
    fn env_override_replaces_bootstrap_url() {
        // SAFETY-equivalent: tests run single-threaded per process here
        // is not guaranteed, so this only asserts the override function
        // itself rather than mutating global env state.
        let mut config = ClientConfig::default();
        std::env::set_var("ZAJEL_BOOTSTRAP_URL", "https://example.test/servers");
        config.apply_env_overrides();
        std::env::remove_var("ZAJEL_BOOTSTRAP_URL");
        assert_eq!(config.network.bootstrap_url, "https://example.test/servers");
    }
}
