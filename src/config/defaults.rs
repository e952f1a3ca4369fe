/// Configuration default values
///
/// This module contains all the default values for cache configuration,
/// making them easily changeable in one central location.
use std::time::Duration;

// Capacity defaults
pub const DEFAULT_CAPACITY_BYTES: usize = 512 * 1024;
pub const DEFAULT_MAX_CACHED_EDGE_PX: u32 = 128;

// Per-key container defaults
// Pre-allocation hint only; containers grow past it.
pub const DEFAULT_SLOTS_PER_KEY: usize = 4;

// Failure record defaults
pub const FAILURE_RETRY_WINDOW: Duration = Duration::from_secs(20 * 60);

// Environment overrides
pub const ENV_CAPACITY_BYTES: &str = "FAVICON_CACHE_CAPACITY_BYTES";
pub const ENV_MAX_EDGE_PX: &str = "FAVICON_CACHE_MAX_EDGE_PX";
