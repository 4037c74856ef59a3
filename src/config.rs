//! Broker Configuration
//!
//! Defaults, environment variable overrides (`CREST_*`), and an optional
//! JSON config file carrying the app list and TLS material paths.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::app::App;
use crate::error::{BrokerError, Result};

/// TLS listener settings. When `local_cert` and `local_pk` are both set the
/// WebSocket listener terminates TLS itself; otherwise it speaks plain TCP
/// (typically behind a terminating proxy).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SslConfig {
    /// Path to the PEM certificate chain.
    #[serde(default)]
    pub local_cert: Option<String>,
    /// Path to the PEM private key.
    #[serde(default)]
    pub local_pk: Option<String>,
    /// Key passphrase. Encrypted keys are not supported; a set passphrase is
    /// rejected at startup with instructions to decrypt the key.
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Require and verify client certificates.
    #[serde(default)]
    pub verify_peer: bool,
    /// Accept self-signed client certificates when verifying peers.
    #[serde(default)]
    pub allow_self_signed: bool,
}

impl SslConfig {
    pub fn enabled(&self) -> bool {
        self.local_cert.is_some() && self.local_pk.is_some()
    }
}

/// Statistics sink settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsConfig {
    /// Collect and persist per-app statistics.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between snapshot flushes.
    #[serde(default = "default_statistics_interval")]
    pub interval_seconds: u64,
    /// Days of aggregated rows to retain.
    #[serde(default = "default_statistics_retention")]
    pub retention_days: u64,
    /// SQLite database path for aggregated rows.
    #[serde(default = "default_statistics_path")]
    pub database_path: PathBuf,
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        StatisticsConfig {
            enabled: true,
            interval_seconds: default_statistics_interval(),
            retention_days: default_statistics_retention(),
            database_path: default_statistics_path(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_statistics_interval() -> u64 {
    60
}

fn default_statistics_retention() -> u64 {
    30
}

fn default_statistics_path() -> PathBuf {
    PathBuf::from("./data/statistics.db")
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    6001
}

fn default_max_request_size_kb() -> usize {
    2048
}

fn default_broadcast_socket_enabled() -> bool {
    true
}

fn default_broadcast_socket_path() -> PathBuf {
    PathBuf::from("/tmp/crest-broadcast.sock")
}

fn default_restart_marker_path() -> PathBuf {
    PathBuf::from("./data/restart.db")
}

fn default_http_addr() -> String {
    "127.0.0.1:6002".to_string()
}

/// Broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// WebSocket listener host.
    #[serde(default = "default_host")]
    pub host: String,
    /// WebSocket listener port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// TLS settings for the WebSocket listener.
    #[serde(default)]
    pub ssl: SslConfig,
    /// Registered apps.
    #[serde(default)]
    pub apps: Vec<App>,
    /// Enable the local Unix-socket broadcast listener.
    #[serde(default = "default_broadcast_socket_enabled")]
    pub broadcast_socket_enabled: bool,
    /// Unix-socket path for the broadcast listener.
    #[serde(default = "default_broadcast_socket_path")]
    pub broadcast_socket_path: PathBuf,
    /// Maximum inbound WebSocket message size in kilobytes.
    #[serde(default = "default_max_request_size_kb")]
    pub max_request_size_kb: usize,
    /// Statistics sink settings.
    #[serde(default)]
    pub statistics: StatisticsConfig,
    /// SQLite database holding the shared restart marker.
    #[serde(default = "default_restart_marker_path")]
    pub restart_marker_path: PathBuf,
    /// HTTP listener for the signed API and /metrics.
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    /// Treat signal-triggered shutdown as a drain instead of a hard stop.
    #[serde(default)]
    pub soft_shutdown: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            host: default_host(),
            port: default_port(),
            ssl: SslConfig::default(),
            apps: Vec::new(),
            broadcast_socket_enabled: default_broadcast_socket_enabled(),
            broadcast_socket_path: default_broadcast_socket_path(),
            max_request_size_kb: default_max_request_size_kb(),
            statistics: StatisticsConfig::default(),
            restart_marker_path: default_restart_marker_path(),
            http_addr: default_http_addr(),
            soft_shutdown: false,
        }
    }
}

impl BrokerConfig {
    /// Loads configuration from a JSON file, then applies environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            BrokerError::Config(format!(
                "cannot read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let mut config: BrokerConfig = serde_json::from_str(&raw)
            .map_err(|e| BrokerError::Config(format!("invalid config file: {}", e)))?;
        config.apply_env();
        Ok(config)
    }

    /// Loads configuration from environment variables over defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(val) = std::env::var("CREST_HOST") {
            self.host = val;
        }
        if let Ok(val) = std::env::var("CREST_PORT") {
            if let Ok(parsed) = val.parse() {
                self.port = parsed;
            }
        }
        if let Ok(val) = std::env::var("CREST_BROADCAST_SOCKET") {
            self.broadcast_socket_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("CREST_BROADCAST_SOCKET_ENABLED") {
            self.broadcast_socket_enabled = val == "true" || val == "1";
        }
        if let Ok(val) = std::env::var("CREST_MAX_REQUEST_SIZE_KB") {
            if let Ok(parsed) = val.parse() {
                self.max_request_size_kb = parsed;
            }
        }
        if let Ok(val) = std::env::var("CREST_STATISTICS_INTERVAL") {
            if let Ok(parsed) = val.parse() {
                self.statistics.interval_seconds = parsed;
            }
        }
        if let Ok(val) = std::env::var("CREST_RESTART_MARKER") {
            self.restart_marker_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("CREST_HTTP_ADDR") {
            self.http_addr = val;
        }
    }

    /// Validates settings that can only fail at startup.
    pub fn validate(&self) -> Result<()> {
        if self.ssl.passphrase.is_some() && self.ssl.enabled() {
            return Err(BrokerError::Config(
                "encrypted private keys are not supported; decrypt ssl.local_pk and unset ssl.passphrase"
                    .to_string(),
            ));
        }
        self.listen_addr()?;
        Ok(())
    }

    /// The WebSocket listener address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port).parse().map_err(|_| {
            BrokerError::Config(format!("invalid listen address {}:{}", self.host, self.port))
        })
    }

    /// Maximum inbound message size in bytes.
    pub fn max_request_size(&self) -> usize {
        self.max_request_size_kb * 1024
    }

    /// Interval between statistics flushes.
    pub fn statistics_interval(&self) -> Duration {
        Duration::from_secs(self.statistics.interval_seconds.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();

        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 6001);
        assert_eq!(config.max_request_size_kb, 2048);
        assert!(config.broadcast_socket_enabled);
        assert_eq!(
            config.broadcast_socket_path,
            PathBuf::from("/tmp/crest-broadcast.sock")
        );
        assert_eq!(config.statistics.interval_seconds, 60);
        assert_eq!(config.statistics.retention_days, 30);
        assert!(!config.ssl.enabled());
    }

    #[test]
    fn test_listen_addr() {
        let config = BrokerConfig::default();
        let addr = config.listen_addr().unwrap();
        assert_eq!(addr.port(), 6001);
    }

    #[test]
    fn test_max_request_size_bytes() {
        let mut config = BrokerConfig::default();
        config.max_request_size_kb = 2;
        assert_eq!(config.max_request_size(), 2048);
    }

    #[test]
    fn test_config_file_parses_apps() {
        let json = r#"{
            "port": 7100,
            "apps": [{
                "id": "1",
                "key": "app-key",
                "secret": "app-secret",
                "name": "demo",
                "capacity": 50,
                "client_messages_enabled": true,
                "statistics_enabled": false,
                "allowed_origins": ["test.origin.com"]
            }]
        }"#;
        let config: BrokerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.port, 7100);
        assert_eq!(config.apps.len(), 1);
        assert_eq!(config.apps[0].key, "app-key");
        assert_eq!(config.apps[0].capacity, Some(50));
        assert_eq!(config.apps[0].allowed_origins, vec!["test.origin.com"]);
    }

    #[test]
    fn test_passphrase_rejected() {
        let mut config = BrokerConfig::default();
        config.ssl.local_cert = Some("cert.pem".into());
        config.ssl.local_pk = Some("key.pem".into());
        config.ssl.passphrase = Some("secret".into());
        assert!(config.validate().is_err());
    }
}
