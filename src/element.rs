//! A single cached favicon bitmap and its size/validity metadata.

use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use image::DynamicImage;

/// Shared handle to a decoded bitmap.
pub type Bitmap = Arc<DynamicImage>;

/// Stable identity of an element, unique for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(u64);

impl ElementId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

/// What eviction did to an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    /// Primary element: payload dropped, existence record kept.
    Tombstoned { freed: usize },
    /// Secondary element: must be removed from its container.
    Unlinked { freed: usize },
}

impl Eviction {
    pub fn freed(self) -> usize {
        match self {
            Self::Tombstoned { freed } | Self::Unlinked { freed } => freed,
        }
    }
}

/// One bitmap payload held by a [`KeyContainer`](crate::container::KeyContainer).
#[derive(Debug, Clone)]
pub struct CacheElement {
    id: ElementId,
    payload: Option<Bitmap>,
    is_primary: bool,
    /// Edge length used as the sort and lookup key.
    image_size: u32,
    invalidated: bool,
}

impl CacheElement {
    /// Wrap a directly decoded bitmap, keyed by its native width.
    pub fn primary(bitmap: Bitmap) -> Self {
        let image_size = bitmap.width();
        Self::new(bitmap, true, image_size)
    }

    /// Wrap a rescaled bitmap, keyed by the size it was produced for.
    pub fn secondary(bitmap: Bitmap, image_size: u32) -> Self {
        Self::new(bitmap, false, image_size)
    }

    fn new(bitmap: Bitmap, is_primary: bool, image_size: u32) -> Self {
        Self {
            id: ElementId::next(),
            payload: Some(bitmap),
            is_primary,
            image_size,
            invalidated: false,
        }
    }

    pub fn id(&self) -> ElementId {
        self.id
    }

    pub fn payload(&self) -> Option<&Bitmap> {
        self.payload.as_ref()
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    /// Memory footprint of the payload in bytes, 0 once invalidated.
    pub fn size_of(&self) -> usize {
        match (&self.payload, self.invalidated) {
            (Some(bitmap), false) => bitmap_footprint(bitmap),
            _ => 0,
        }
    }

    /// Sort key: invalidated elements rank below every valid one and tie with
    /// each other; valid elements rank by edge length.
    fn rank(&self) -> (bool, u32) {
        if self.invalidated {
            (false, 0)
        } else {
            (true, self.image_size)
        }
    }

    /// Total order used for sorted insertion and binary search.
    pub fn compare(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }

    /// Compare against a valid element of `size` without constructing one.
    pub fn compare_to_size(&self, size: u32) -> Ordering {
        self.rank().cmp(&(true, size))
    }

    /// Apply eviction. Primaries become tombstones in place; secondaries are
    /// left untouched for the container to remove.
    pub fn on_evicted(&mut self) -> Eviction {
        let freed = self.size_of();
        if self.is_primary {
            self.invalidated = true;
            self.payload = None;
            Eviction::Tombstoned { freed }
        } else {
            Eviction::Unlinked { freed }
        }
    }
}

/// Bytes held by a decoded bitmap.
pub fn bitmap_footprint(bitmap: &DynamicImage) -> usize {
    bitmap.width() as usize * bitmap.height() as usize * usize::from(bitmap.color().bytes_per_pixel())
}
