//! The favicon cache: key table, LRU queue, size accounting and scaling.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use image::DynamicImage;
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::color::Color;
use crate::config::CacheConfig;
use crate::config::defaults::{
    DEFAULT_CAPACITY_BYTES, DEFAULT_MAX_CACHED_EDGE_PX, DEFAULT_SLOTS_PER_KEY,
    FAILURE_RETRY_WINDOW,
};
use crate::container::KeyContainer;
use crate::element::{Bitmap, ElementId};
use crate::lock::MrswLock;
use crate::scaling::{ImageScaler, ScalePlan, Scaler};

type Table = HashMap<Arc<str>, KeyContainer>;

/// LRU queue entry: locates an element through its container's key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ElementRef {
    key: Arc<str>,
    id: ElementId,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    synthesized: AtomicU64,
    discarded_syntheses: AtomicU64,
    evictions: AtomicU64,
    failure_lookups: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time view of cache occupancy and activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub keys: usize,
    pub elements: usize,
    pub primaries: usize,
    pub tombstones: usize,
    pub current_size_bytes: usize,
    pub capacity_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub synthesized: u64,
    /// Bitmaps scaled for a lookup but not stored because the key's container
    /// was replaced or removed meanwhile.
    pub discarded_syntheses: u64,
    pub evictions: u64,
    pub failure_lookups: u64,
}

/// Concurrent, size-bounded cache of favicon bitmaps keyed by icon URL.
///
/// Lookups run as read transactions and may overlap. Inserting, synthesizing a
/// secondary bitmap, expiring a failure record and culling run as write
/// transactions. The LRU queue has its own mutex so a lookup can mark an
/// element most-recently-used without write access. The lock order is always
/// table first, then LRU queue.
#[derive(Debug)]
pub struct FaviconCache {
    state: MrswLock<Table>,
    lru: Mutex<LruCache<ElementRef, ()>>,
    current_size_bytes: AtomicUsize,
    capacity_bytes: usize,
    max_cached_edge_px: u32,
    failure_retry_window: Duration,
    slots_per_key: usize,
    scaler: Arc<dyn Scaler>,
    counters: Counters,
}

impl FaviconCache {
    pub fn new(capacity_bytes: usize, max_cached_edge_px: u32) -> Self {
        Self::builder()
            .capacity_bytes(capacity_bytes)
            .max_cached_edge_px(max_cached_edge_px)
            .build()
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::builder()
            .capacity_bytes(config.capacity_bytes)
            .max_cached_edge_px(config.max_cached_edge_px)
            .failure_retry_window(config.failure_retry_window)
            .slots_per_key(config.slots_per_key)
            .scaler(ImageScaler::new(config.scale_filter))
            .build()
    }

    pub fn builder() -> FaviconCacheBuilder {
        FaviconCacheBuilder::default()
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    pub fn max_cached_edge_px(&self) -> u32 {
        self.max_cached_edge_px
    }

    /// Bytes currently held by valid elements. Read without locking, so the
    /// value may be momentarily stale.
    pub fn current_size_bytes(&self) -> usize {
        self.current_size_bytes.load(Ordering::Relaxed)
    }

    /// Number of keys, failure records included.
    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().is_empty()
    }

    /// Run `inspect` against the container for `key` under a read transaction.
    ///
    /// `inspect` must not call back into this cache: the lock is not
    /// reentrant and a queued writer would deadlock the nested read.
    pub fn with_container<R>(&self, key: &str, inspect: impl FnOnce(&KeyContainer) -> R) -> Option<R> {
        self.state.read().get(key).map(inspect)
    }

    /// Store a single decoded bitmap as the only primary for `key`.
    ///
    /// Empty bitmaps are ignored.
    pub fn put_primary(&self, key: &str, bitmap: DynamicImage) {
        if bitmap.width() == 0 || bitmap.height() == 0 {
            debug!(key, "Ignoring empty primary favicon");
            return;
        }
        let mut container = KeyContainer::with_capacity(self.slots_per_key);
        container.add_primary(Arc::new(bitmap));
        self.replace_container(key, container);
        self.cull();
    }

    /// Store a full set of decoded bitmaps as the primaries for `key`.
    ///
    /// Placeholder (zero-area) bitmaps are dropped and bitmaps wider or taller
    /// than the maximum cached edge are downscaled to it. The previous
    /// container for `key` is replaced even if nothing survives.
    pub fn put_primaries(&self, key: &str, bitmaps: impl IntoIterator<Item = DynamicImage>) {
        let mut container = KeyContainer::with_capacity(self.slots_per_key);
        for bitmap in bitmaps {
            if bitmap.width() == 0 || bitmap.height() == 0 {
                trace!(key, "Skipping placeholder favicon");
                continue;
            }
            let bitmap = if bitmap.width() > self.max_cached_edge_px
                || bitmap.height() > self.max_cached_edge_px
            {
                match self.scaler.scale(&bitmap, self.max_cached_edge_px) {
                    Ok(scaled) => {
                        debug!(
                            key,
                            width = bitmap.width(),
                            height = bitmap.height(),
                            edge = self.max_cached_edge_px,
                            "Downscaled oversize primary favicon"
                        );
                        scaled
                    }
                    Err(e) => {
                        warn!(key, "Dropping oversize primary favicon: {}", e);
                        continue;
                    }
                }
            } else {
                bitmap
            };
            container.add_primary(Arc::new(bitmap));
        }
        self.replace_container(key, container);
        self.cull();
    }

    /// Record that loading the favicon for `key` failed just now.
    pub fn put_failure(&self, key: &str) {
        debug!(key, "Recording favicon load failure");
        self.replace_container(key, KeyContainer::failed());
    }

    /// Whether `key` has a failure record inside the retry window.
    ///
    /// A failure record past the window is removed and reported as not failed.
    pub fn is_failed(&self, key: &str) -> bool {
        let table = self.state.read();
        let Some(container) = table.get(key) else {
            return false;
        };
        if !container.has_failed() {
            return false;
        }
        Counters::bump(&self.counters.failure_lookups);
        if container.is_failure_current(self.failure_retry_window) {
            return true;
        }

        // Another writer may have replaced or removed the record meanwhile.
        let mut table = table.upgrade();
        let (failed, current) = table.get(key).map_or((false, false), |container| {
            (
                container.has_failed(),
                container.is_failure_current(self.failure_retry_window),
            )
        });
        if current {
            return true;
        }
        if failed {
            if let Some((stored_key, expired)) = table.remove_entry(key) {
                self.unlink(&stored_key, &expired);
                debug!(key, "Expired favicon failure record");
            }
        }
        false
    }

    /// Dominant color of the icon for `key`, white if the key is unknown.
    pub fn get_dominant_color(&self, key: &str) -> Color {
        self.state
            .read()
            .get(key)
            .map(KeyContainer::ensure_dominant_color)
            .unwrap_or(Color::WHITE)
    }

    /// Drop every key and element.
    pub fn evict_all(&self) {
        let mut table = self.state.write();
        let mut lru = self.lru.lock();
        let keys = table.len();
        table.clear();
        lru.clear();
        self.current_size_bytes.store(0, Ordering::Relaxed);
        info!("Evicted all favicons ({} keys)", keys);
    }

    /// Bitmap for `key` closest to `target_size`.
    ///
    /// An exact cached match is returned directly. Otherwise the nearest
    /// primary, preferring larger ones, is rescaled to `target_size` and cached
    /// as a secondary. Upscaling is capped at twice the primary's edge, so a
    /// far larger request yields a smaller bitmap. `None` means the caller
    /// must reload the icon.
    pub fn get_best_fit(&self, key: &str, target_size: u32) -> Option<Bitmap> {
        if target_size == 0 {
            return None;
        }

        let table = self.state.read();
        let Some((stored_key, container)) = table.get_key_value(key) else {
            trace!(key, target_size, "Favicon miss: unknown key");
            Counters::bump(&self.counters.misses);
            return None;
        };

        if let Some(element) = container.exact_match(target_size) {
            trace!(key, target_size, "Favicon hit");
            self.touch(stored_key, element.id());
            Counters::bump(&self.counters.hits);
            return element.payload().cloned();
        }

        // Failure records and emptied primary sets have nothing to scale.
        if container.has_failed() || container.is_empty() {
            trace!(key, target_size, failed = container.has_failed(), "Favicon miss: no bitmaps");
            Counters::bump(&self.counters.misses);
            return None;
        }

        let from_index = container
            .next_highest_index(target_size)
            .unwrap_or(container.len());
        let Some(primary) = container.next_primary(from_index) else {
            trace!(key, target_size, "Favicon miss: no usable primary");
            Counters::bump(&self.counters.misses);
            return None;
        };

        let plan = ScalePlan::for_sizes(primary.image_size(), target_size);
        let edge = plan.edge();
        if plan.is_approximate() {
            if let Some(element) = container.exact_match(edge) {
                trace!(key, target_size, edge, "Favicon hit on best-effort secondary");
                self.touch(stored_key, element.id());
                Counters::bump(&self.counters.hits);
                return element.payload().cloned();
            }
        }

        let source = primary.payload()?;
        let scaled = match self.scaler.scale(source, edge) {
            Ok(scaled) => Arc::new(scaled),
            Err(e) => {
                warn!(key, target_size, "Scaling failed: {}", e);
                Counters::bump(&self.counters.misses);
                return None;
            }
        };
        let generation = container.generation();
        let stored_key = Arc::clone(stored_key);

        let mut table = table.upgrade();
        let Some(container) = table.get_mut(&*stored_key) else {
            debug!(key, "Favicon container removed during synthesis");
            Counters::bump(&self.counters.discarded_syntheses);
            return Some(scaled);
        };
        if container.generation() != generation {
            debug!(key, "Favicon container replaced during synthesis");
            Counters::bump(&self.counters.discarded_syntheses);
            return Some(scaled);
        }
        if let Some(element) = container.exact_match(edge) {
            self.touch(&stored_key, element.id());
            Counters::bump(&self.counters.hits);
            return element.payload().cloned();
        }

        let element = container.add_secondary(Arc::clone(&scaled), edge);
        let (id, footprint) = (element.id(), element.size_of());
        if plan.is_approximate() {
            container.reset_dominant_color();
        }
        self.lru.lock().put(
            ElementRef {
                key: Arc::clone(&stored_key),
                id,
            },
            (),
        );
        self.current_size_bytes.fetch_add(footprint, Ordering::Relaxed);
        Counters::bump(&self.counters.synthesized);
        debug!(key, target_size, edge, footprint, "Synthesized secondary favicon");
        drop(table);

        self.cull();
        Some(scaled)
    }

    pub fn stats(&self) -> CacheStats {
        let table = self.state.read();
        let mut stats = CacheStats {
            keys: table.len(),
            current_size_bytes: self.current_size_bytes(),
            capacity_bytes: self.capacity_bytes,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            synthesized: self.counters.synthesized.load(Ordering::Relaxed),
            discarded_syntheses: self.counters.discarded_syntheses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            failure_lookups: self.counters.failure_lookups.load(Ordering::Relaxed),
            ..CacheStats::default()
        };
        for container in table.values() {
            stats.elements += container.len();
            stats.primaries += container.primary_count();
            stats.tombstones += container.tombstone_count();
        }
        stats
    }

    fn touch(&self, key: &Arc<str>, id: ElementId) {
        self.lru.lock().promote(&ElementRef {
            key: Arc::clone(key),
            id,
        });
    }

    /// Swap in `container` for `key`, moving its elements into the LRU queue
    /// and size accounting and unlinking whatever it replaces.
    fn replace_container(&self, key: &str, container: KeyContainer) {
        let key: Arc<str> = Arc::from(key);
        let added = container.size_of();

        let mut table = self.state.write();
        if let Some((previous_key, previous)) = table.remove_entry(&*key) {
            self.unlink(&previous_key, &previous);
        }
        {
            let mut lru = self.lru.lock();
            for element in container.live_elements() {
                lru.put(
                    ElementRef {
                        key: Arc::clone(&key),
                        id: element.id(),
                    },
                    (),
                );
            }
        }
        self.current_size_bytes.fetch_add(added, Ordering::Relaxed);
        debug!(
            key = &*key,
            elements = container.len(),
            bytes = added,
            "Stored favicon container"
        );
        table.insert(key, container);
    }

    /// Remove a detached container's elements from the LRU queue and size
    /// accounting. Callers hold the write transaction.
    fn unlink(&self, key: &Arc<str>, container: &KeyContainer) {
        let mut lru = self.lru.lock();
        for element in container.live_elements() {
            lru.pop(&ElementRef {
                key: Arc::clone(key),
                id: element.id(),
            });
        }
        self.current_size_bytes
            .fetch_sub(container.size_of(), Ordering::Relaxed);
    }

    /// Evict least-recently-used elements until the cache fits its capacity.
    fn cull(&self) {
        if self.current_size_bytes() <= self.capacity_bytes {
            return;
        }

        let mut table = self.state.write();
        let mut lru = self.lru.lock();
        let mut evicted = 0usize;
        let mut freed_total = 0usize;
        while self.current_size_bytes() > self.capacity_bytes {
            let Some((element_ref, ())) = lru.pop_lru() else {
                warn!(
                    current = self.current_size_bytes(),
                    capacity = self.capacity_bytes,
                    "Favicon cache over capacity with an empty LRU queue"
                );
                break;
            };
            let Some(freed) = table
                .get_mut(&*element_ref.key)
                .and_then(|container| container.evict(element_ref.id))
            else {
                warn!(key = &*element_ref.key, "LRU entry without a cached element");
                continue;
            };
            self.current_size_bytes.fetch_sub(freed, Ordering::Relaxed);
            Counters::bump(&self.counters.evictions);
            evicted += 1;
            freed_total += freed;
        }
        debug!(
            evicted,
            freed = freed_total,
            current = self.current_size_bytes(),
            "Culled favicon cache"
        );
    }
}

impl Default for FaviconCache {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Configures a [`FaviconCache`].
#[derive(Debug, Clone)]
pub struct FaviconCacheBuilder {
    capacity_bytes: usize,
    max_cached_edge_px: u32,
    failure_retry_window: Duration,
    slots_per_key: usize,
    scaler: Option<Arc<dyn Scaler>>,
}

impl Default for FaviconCacheBuilder {
    fn default() -> Self {
        Self {
            capacity_bytes: DEFAULT_CAPACITY_BYTES,
            max_cached_edge_px: DEFAULT_MAX_CACHED_EDGE_PX,
            failure_retry_window: FAILURE_RETRY_WINDOW,
            slots_per_key: DEFAULT_SLOTS_PER_KEY,
            scaler: None,
        }
    }
}

impl FaviconCacheBuilder {
    pub fn capacity_bytes(mut self, capacity_bytes: usize) -> Self {
        self.capacity_bytes = capacity_bytes;
        self
    }

    pub fn max_cached_edge_px(mut self, max_cached_edge_px: u32) -> Self {
        self.max_cached_edge_px = max_cached_edge_px;
        self
    }

    pub fn failure_retry_window(mut self, window: Duration) -> Self {
        self.failure_retry_window = window;
        self
    }

    /// Pre-allocated element slots per key. A hint, not a limit.
    pub fn slots_per_key(mut self, slots: usize) -> Self {
        self.slots_per_key = slots;
        self
    }

    pub fn scaler(mut self, scaler: impl Scaler + 'static) -> Self {
        self.scaler = Some(Arc::new(scaler));
        self
    }

    pub fn build(self) -> FaviconCache {
        let scaler = self
            .scaler
            .unwrap_or_else(|| Arc::new(ImageScaler::default()));
        info!(
            "Favicon cache created: capacity {} bytes, max edge {}px, retry window {}",
            self.capacity_bytes,
            self.max_cached_edge_px,
            humantime::format_duration(self.failure_retry_window)
        );
        FaviconCache {
            state: MrswLock::new(HashMap::new()),
            lru: Mutex::new(LruCache::unbounded()),
            current_size_bytes: AtomicUsize::new(0),
            capacity_bytes: self.capacity_bytes,
            max_cached_edge_px: self.max_cached_edge_px,
            failure_retry_window: self.failure_retry_window,
            slots_per_key: self.slots_per_key,
            scaler,
            counters: Counters::default(),
        }
    }
}
