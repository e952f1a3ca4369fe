//! Concurrent, size-bounded in-memory favicon cache.
//!
//! Icons are keyed by URL. Each key holds one or more *primary* bitmaps
//! decoded from the fetched resource, plus *secondary* bitmaps rescaled from
//! the nearest primary on demand. Memory is bounded by a byte budget enforced
//! with least-recently-used eviction; an evicted primary leaves a tombstone so
//! the cache still knows a bitmap of that size existed and must be reloaded.
//!
//! ```no_run
//! use favicon_cache::FaviconCache;
//! use image::DynamicImage;
//!
//! let cache = FaviconCache::new(512 * 1024, 128);
//! cache.put_primary("https://example.com/favicon.ico", DynamicImage::new_rgba8(32, 32));
//!
//! let icon = cache.get_best_fit("https://example.com/favicon.ico", 16);
//! assert_eq!(icon.map(|bitmap| bitmap.width()), Some(16));
//! ```

pub mod cache;
pub mod color;
pub mod config;
pub mod container;
pub mod element;
pub mod error;
pub mod lock;
pub mod scaling;

pub use cache::{CacheStats, FaviconCache, FaviconCacheBuilder};
pub use color::Color;
pub use config::CacheConfig;
pub use container::KeyContainer;
pub use element::{Bitmap, CacheElement, ElementId};
pub use error::{FaviconCacheError, Result, ScaleError};
pub use lock::MrswLock;
pub use scaling::{ImageScaler, ScaleFilter, ScalePlan, Scaler};
