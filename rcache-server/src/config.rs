//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RCACHE_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Replication policy configuration.
    pub replication: ReplicationConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("RCACHE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.replication.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum concurrent client sessions.
    pub max_connections: usize,
    /// Seconds a persistent session may sit idle before it is stopped.
    pub idle_timeout_secs: u64,
    /// Seconds a partially-read header/payload may stall.
    pub receive_timeout_secs: u64,
    /// Seconds a partially-written reply may stall.
    pub send_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], rcache_protocol::DEFAULT_PORT)),
            max_connections: 1000,
            idle_timeout_secs: 300,
            receive_timeout_secs: 30,
            send_timeout_secs: 30,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("RCACHE_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(max) = std::env::var("RCACHE_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }

        if let Ok(timeout) = std::env::var("RCACHE_IDLE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.idle_timeout_secs = secs;
            }
        }

        if let Ok(timeout) = std::env::var("RCACHE_RECEIVE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.receive_timeout_secs = secs;
            }
        }

        if let Ok(timeout) = std::env::var("RCACHE_SEND_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.send_timeout_secs = secs;
            }
        }
    }

    /// Returns the idle timeout as a Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Returns the receive timeout as a Duration.
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_secs(self.receive_timeout_secs)
    }

    /// Returns the send timeout as a Duration.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }
}

/// Replication policy configuration.
///
/// These knobs mirror the operational parameters of the master process:
/// connection persistence, the baseline and database consistency checks,
/// cache-update staleness detection, and historical-mode capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Whether this server expects persistent client connections.
    pub persistent_connections: bool,
    /// Whether the client's build baseline must match the server's.
    pub check_baseline: bool,
    /// Disables the database-identity check entirely.
    pub ignore_database_mismatch: bool,
    /// Maximum age of the cache-refresh heartbeat before requests are
    /// refused (0 disables the check).
    pub cache_update_detection_interval_secs: u64,
    /// Whether this master serves historical ("as of") data.
    pub historical_enabled: bool,
    /// Host identity used by the self-request guard. Defaults to the
    /// listener address when unset.
    pub advertised_host: Option<IpAddr>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            persistent_connections: true,
            check_baseline: true,
            ignore_database_mismatch: false,
            cache_update_detection_interval_secs: 0,
            historical_enabled: false,
            advertised_host: None,
        }
    }
}

impl ReplicationConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RCACHE_PERSISTENT") {
            self.persistent_connections = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("RCACHE_CHECK_BASELINE") {
            self.check_baseline = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("RCACHE_IGNORE_DATABASE_MISMATCH") {
            self.ignore_database_mismatch = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("RCACHE_CACHE_UPDATE_INTERVAL") {
            if let Ok(secs) = v.parse() {
                self.cache_update_detection_interval_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("RCACHE_HISTORICAL") {
            self.historical_enabled = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("RCACHE_ADVERTISED_HOST") {
            if let Ok(addr) = v.parse() {
                self.advertised_host = Some(addr);
            }
        }
    }

    /// Returns the cache-update detection interval, or None when disabled.
    pub fn cache_update_detection_interval(&self) -> Option<Duration> {
        if self.cache_update_detection_interval_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.cache_update_detection_interval_secs))
        }
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable the metrics HTTP server.
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: "0.0.0.0:9090".parse().unwrap(),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("RCACHE_METRICS_ENABLED") {
            self.enabled = parse_bool(&v);
        }
        if let Ok(addr) = std::env::var("RCACHE_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

fn parse_bool(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
