use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{FaviconCacheError, Result};
use crate::scaling::ScaleFilter;

pub mod defaults;
pub mod duration_serde;

use defaults::*;

/// Cache tuning loaded from a TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Byte budget for decoded bitmaps
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: usize,
    /// Primaries larger than this edge are downscaled on insertion
    #[serde(default = "default_max_cached_edge_px")]
    pub max_cached_edge_px: u32,
    /// How long a failed load suppresses retries (e.g. "20m")
    #[serde(
        default = "default_failure_retry_window",
        with = "duration_serde::duration"
    )]
    pub failure_retry_window: Duration,
    #[serde(default = "default_slots_per_key")]
    pub slots_per_key: usize,
    #[serde(default)]
    pub scale_filter: ScaleFilter,
}

fn default_capacity_bytes() -> usize {
    DEFAULT_CAPACITY_BYTES
}
fn default_max_cached_edge_px() -> u32 {
    DEFAULT_MAX_CACHED_EDGE_PX
}
fn default_failure_retry_window() -> Duration {
    FAILURE_RETRY_WINDOW
}
fn default_slots_per_key() -> usize {
    DEFAULT_SLOTS_PER_KEY
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: default_capacity_bytes(),
            max_cached_edge_px: default_max_cached_edge_px(),
            failure_retry_window: default_failure_retry_window(),
            slots_per_key: default_slots_per_key(),
            scale_filter: ScaleFilter::default(),
        }
    }
}

impl CacheConfig {
    /// Read the config file, or write a default one if it does not exist.
    pub fn load_from_file(config_file: impl AsRef<Path>) -> Result<Self> {
        let config_file = config_file.as_ref();
        if config_file.exists() {
            let contents = std::fs::read_to_string(config_file)?;
            let config: Self =
                toml::from_str(&contents).map_err(|source| FaviconCacheError::ConfigParse {
                    path: config_file.to_path_buf(),
                    source,
                })?;
            debug!("Loaded config file: {}", config_file.display());
            Ok(config)
        } else {
            let default_config = Self::default();
            let contents = toml::to_string_pretty(&default_config)?;
            std::fs::write(config_file, contents)?;
            info!("Created default config file: {}", config_file.display());
            Ok(default_config)
        }
    }

    /// Apply `FAVICON_CACHE_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides resolved through `lookup`, keyed by environment
    /// variable name.
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup(ENV_CAPACITY_BYTES) {
            self.capacity_bytes = parse_override(ENV_CAPACITY_BYTES, &value)?;
            info!("Capacity overridden by {}: {} bytes", ENV_CAPACITY_BYTES, self.capacity_bytes);
        }
        if let Some(value) = lookup(ENV_MAX_EDGE_PX) {
            self.max_cached_edge_px = parse_override(ENV_MAX_EDGE_PX, &value)?;
            info!("Max edge overridden by {}: {}px", ENV_MAX_EDGE_PX, self.max_cached_edge_px);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity_bytes == 0 {
            return Err(FaviconCacheError::configuration(
                "capacity_bytes must be greater than zero",
            ));
        }
        if self.max_cached_edge_px == 0 {
            return Err(FaviconCacheError::configuration(
                "max_cached_edge_px must be greater than zero",
            ));
        }
        Ok(())
    }
}

fn parse_override<T: FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| {
        FaviconCacheError::configuration(format!("Invalid value '{value}' for {name}: {e}"))
    })
}
