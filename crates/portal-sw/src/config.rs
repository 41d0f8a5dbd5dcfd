//! Worker configuration.
//!
//! Deployments change `cache_version` whenever the precache list or the static
//! assets change; that is the only thing that evicts old caches.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use portal_common::{PortalError, RetryConfig};
use portal_net::UrlPattern;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::cache::CacheStorage;
use crate::error::CacheError;
use crate::sqlite::SqliteBackend;

/// Offline worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Current cache generation; every other cache is stale.
    pub cache_version: String,

    /// Application origin; also the registration scope.
    pub origin: Url,

    /// Paths that must be cached before the worker may activate.
    pub precache: Vec<String>,

    /// Same-origin URLs matching any of these are served network-first.
    pub data_service: Vec<UrlPattern>,

    /// Request headers that take part in the cache key.
    pub key_headers: Vec<String>,

    /// Deadline for every network call, in seconds.
    pub network_timeout_secs: u64,

    /// Attempts per precache entry during install
    pub precache_attempts: u32,

    /// Push notification appearance
    pub notification: NotificationConfig,

    /// Where caches live
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Notification title
    pub title: String,

    /// Body used when a push carries no payload
    pub default_body: String,

    /// Icon path
    pub icon: String,

    /// Badge path
    pub badge: String,

    /// Vibration pattern in milliseconds
    pub vibrate: Vec<u32>,
}

/// Cache store backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Lost on exit.
    Memory,
    /// SQLite database file.
    Sqlite { path: PathBuf },
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_version: "portal-cache-v1".to_string(),
            origin: Url::parse("http://localhost:3000/").expect("static origin is valid"),
            precache: [
                "/",
                "/index.html",
                "/manifest.json",
                "/favicon.ico",
                "/logo192.png",
                "/logo512.png",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            data_service: vec![UrlPattern::contains("supabase.co")],
            key_headers: Vec::new(),
            network_timeout_secs: 15,
            precache_attempts: 1,
            notification: NotificationConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            title: "Student Portal".to_string(),
            default_body: "You have a new update".to_string(),
            icon: "/logo192.png".to_string(),
            badge: "/favicon.ico".to_string(),
            vibrate: vec![200, 100, 200],
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("portal")
                .join("offline-cache.sqlite3"),
        }
    }
}

impl WorkerConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, PortalError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| PortalError::config_with_source("invalid worker config", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self, PortalError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), PortalError> {
        if self.cache_version.trim().is_empty() {
            return Err(PortalError::config("cache_version must not be empty"));
        }
        if !matches!(self.origin.scheme(), "http" | "https") || self.origin.host_str().is_none() {
            return Err(PortalError::config(format!(
                "origin must be an http(s) URL with a host, got {}",
                self.origin
            )));
        }
        if let Some(bad) = self.precache.iter().find(|p| !p.starts_with('/')) {
            return Err(PortalError::config(format!(
                "precache entries must be absolute paths, got {bad:?}"
            )));
        }
        if self.network_timeout_secs == 0 {
            return Err(PortalError::config("network_timeout_secs must be positive"));
        }
        Ok(())
    }

    /// Application root; scope of the registration and target of
    /// notification clicks.
    pub fn root_url(&self) -> Url {
        let mut root = self.origin.clone();
        root.set_path("/");
        root.set_query(None);
        root.set_fragment(None);
        root
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    pub fn precache_retry(&self) -> RetryConfig {
        RetryConfig::attempts(self.precache_attempts)
    }
}

impl StorageConfig {
    /// Open the configured store.
    pub fn open(&self) -> Result<CacheStorage, CacheError> {
        match self {
            StorageConfig::Memory => Ok(CacheStorage::memory()),
            StorageConfig::Sqlite { path } => {
                Ok(CacheStorage::new(Arc::new(SqliteBackend::open(path)?)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_version, "portal-cache-v1");
        assert_eq!(config.precache[0], "/");
        assert_eq!(config.notification.vibrate, vec![200, 100, 200]);
        assert_eq!(config.network_timeout(), Duration::from_secs(15));
        assert_eq!(config.precache_retry().max_attempts, 1);
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config = WorkerConfig::from_json(
            r#"{
                "cache_version": "v2",
                "origin": "https://portal.example/app/?x=1",
                "precache": ["/", "/manifest.json"],
                "data_service": [{"type": "prefix", "pattern": "https://portal.example/rest/"}],
                "storage": {"backend": "memory"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.cache_version, "v2");
        assert_eq!(config.precache.len(), 2);
        assert_eq!(config.storage, StorageConfig::Memory);
        assert_eq!(config.notification.title, "Student Portal");
        assert_eq!(config.root_url().as_str(), "https://portal.example/");
    }

    #[test]
    fn test_validation_errors() {
        assert!(WorkerConfig::from_json(r#"{"cache_version": " "}"#).is_err());
        assert!(WorkerConfig::from_json(r#"{"origin": "file:///tmp/portal"}"#).is_err());
        assert!(WorkerConfig::from_json(r#"{"precache": ["index.html"]}"#).is_err());
        assert!(WorkerConfig::from_json(r#"{"network_timeout_secs": 0}"#).is_err());
        assert!(WorkerConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = WorkerConfig::load(Path::new("/nonexistent/portal/worker.json")).unwrap_err();
        assert_eq!(err.category(), "io");
    }

    #[test]
    fn test_sqlite_storage_opens_under_path() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageConfig::Sqlite {
            path: dir.path().join("caches").join("db.sqlite3"),
        };
        assert!(storage.open().is_ok());
        assert!(dir.path().join("caches").join("db.sqlite3").exists());
    }
}
