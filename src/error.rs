//! Error types for the favicon cache.
//!
//! Cache operations themselves never fail: misses and internal faults degrade
//! to `None`. These errors surface from configuration handling and from the
//! scaling seam, where the cache logs them before falling back to a miss.

use std::path::PathBuf;

use thiserror::Error;

/// Result type for favicon cache setup and configuration.
pub type Result<T> = std::result::Result<T, FaviconCacheError>;

/// Errors raised while configuring or constructing a cache.
#[derive(Debug, Error)]
pub enum FaviconCacheError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Failed to parse config file {path:?}: {source}")]
    ConfigParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Configuration could not be serialized
    #[error("Failed to serialize config: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl FaviconCacheError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }
}

/// Errors produced by a [`Scaler`](crate::scaling::Scaler).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScaleError {
    /// Source bitmap has no pixels
    #[error("Cannot scale an empty {width}x{height} bitmap")]
    EmptySource { width: u32, height: u32 },

    /// Requested edge length is zero
    #[error("Target edge must be non-zero")]
    ZeroTarget,

    /// Backend-specific failure
    #[error("Scaling failed: {message}")]
    Backend { message: String },
}
