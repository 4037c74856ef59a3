//! App Registry
//!
//! Apps are the broker's tenants: a key/secret pair plus admission policy.
//! Loaded from config at startup and treated as immutable for the lifetime
//! of any connection bound to them. Registries are swappable so a
//! database-backed lookup can replace the in-memory list.

use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};

/// A registered app and its admission policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub id: String,
    pub key: String,
    pub secret: String,
    #[serde(default)]
    pub name: String,
    /// Maximum concurrent connections; `None` means unlimited.
    #[serde(default)]
    pub capacity: Option<usize>,
    #[serde(default = "default_true")]
    pub client_messages_enabled: bool,
    #[serde(default = "default_true")]
    pub statistics_enabled: bool,
    /// Allowed Origin hosts; empty means any origin is accepted.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_true() -> bool {
    true
}

impl App {
    /// Checks an Origin header value against the allowed origins.
    ///
    /// An empty allowlist accepts anything, including absent origins.
    /// Entries match the origin host exactly or as a `*.example.com` suffix.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.allowed_origins.is_empty() {
            return true;
        }
        let host = match origin.and_then(parse_origin_host) {
            Some(host) => host,
            None => return false,
        };
        self.allowed_origins
            .iter()
            .any(|allowed| host_matches(allowed, &host))
    }
}

/// Parses the host out of an Origin header value
/// (e.g. `https://app.example.com` -> `app.example.com`).
pub(crate) fn parse_origin_host(origin: &str) -> Option<String> {
    let rest = origin
        .strip_prefix("https://")
        .or_else(|| origin.strip_prefix("http://"))
        .or_else(|| origin.strip_prefix("wss://"))
        .or_else(|| origin.strip_prefix("ws://"))?;
    let host = rest.split('/').next()?;
    if host.is_empty() {
        return None;
    }
    Some(host.to_lowercase())
}

/// Checks an origin host against an allowlist entry (exact or `*.` suffix).
pub(crate) fn host_matches(allowed: &str, origin_host: &str) -> bool {
    let allowed = allowed.trim().to_lowercase();
    if let Some(suffix) = allowed.strip_prefix('*') {
        origin_host.ends_with(suffix.trim_start_matches('.'))
    } else {
        allowed == origin_host
    }
}

/// Lookup interface for apps. Backends may be remote, so every operation is
/// async; admission applies its own upper bound on lookup latency.
#[async_trait]
pub trait AppRegistry: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Option<App>;
    async fn find_by_key(&self, key: &str) -> Option<App>;
    async fn find_by_secret(&self, secret: &str) -> Option<App>;
    async fn all(&self) -> Vec<App>;
    async fn create(&self, app: App) -> Result<()>;
}

/// In-memory registry backed by the config app list.
pub struct MemoryAppRegistry {
    apps: RwLock<Vec<App>>,
}

impl MemoryAppRegistry {
    pub fn new(apps: Vec<App>) -> Self {
        MemoryAppRegistry {
            apps: RwLock::new(apps),
        }
    }
}

#[async_trait]
impl AppRegistry for MemoryAppRegistry {
    async fn find_by_id(&self, id: &str) -> Option<App> {
        let apps = self.apps.read().unwrap();
        apps.iter().find(|a| a.id == id).cloned()
    }

    async fn find_by_key(&self, key: &str) -> Option<App> {
        let apps = self.apps.read().unwrap();
        apps.iter().find(|a| a.key == key).cloned()
    }

    async fn find_by_secret(&self, secret: &str) -> Option<App> {
        let apps = self.apps.read().unwrap();
        apps.iter().find(|a| a.secret == secret).cloned()
    }

    async fn all(&self) -> Vec<App> {
        self.apps.read().unwrap().clone()
    }

    async fn create(&self, app: App) -> Result<()> {
        let mut apps = self.apps.write().unwrap();
        if apps.iter().any(|a| a.key == app.key) {
            return Err(BrokerError::Config(format!(
                "app key `{}` already registered",
                app.key
            )));
        }
        apps.push(app);
        Ok(())
    }
}
