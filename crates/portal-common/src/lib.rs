//! # Portal Common
//!
//! Shared building blocks for the portal offline worker crates.
//!
//! ## Features
//!
//! - A unified error type with categories for log fields
//! - Logging configuration and setup
//! - Retry and timeout utilities

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig};

/// Unified error type shared by the portal crates.
#[derive(Error, Debug)]
pub enum PortalError {
    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

impl PortalError {
    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Create a config error with source.
    pub fn config_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            PortalError::Config { .. } => "config",
            PortalError::Io(_) => "io",
            PortalError::Timeout(_) => "timeout",
        }
    }
}

/// Result type alias for portal operations.
pub type Result<T> = std::result::Result<T, PortalError>;
