//! Error types for the worker and its cache store.

use portal_common::PortalError;
use thiserror::Error;

/// Errors raised by a [`CacheBackend`](crate::cache::CacheBackend).
///
/// The fetch strategies log and swallow these; only installation turns them
/// into a hard failure.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cache not found: {0}")]
    NotFound(String),

    #[error("Only GET requests can be cached, got {0}")]
    UnsupportedMethod(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("Install failed for {version}: {reason}")]
    InstallFailed { version: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(#[from] PortalError),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Not found: {0}")]
    NotFound(String),
}
