//! Per-icon container: the size-ordered sub-index of one key's bitmaps.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use tracing::error;

use crate::color::{Color, dominant_color};
use crate::element::{Bitmap, CacheElement, ElementId, Eviction};

/// All cached bitmaps for one icon identifier.
///
/// Elements stay sorted by [`CacheElement::compare`]: tombstones first, then
/// valid elements by ascending edge length.
#[derive(Debug)]
pub struct KeyContainer {
    elements: Vec<CacheElement>,
    has_failed: bool,
    failure_timestamp: Option<Instant>,
    dominant_color: OnceLock<Color>,
    /// Identifies this container instance across replacements of its key.
    generation: u64,
}

fn next_generation() -> u64 {
    static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);
    NEXT_GENERATION.fetch_add(1, AtomicOrdering::Relaxed)
}

impl KeyContainer {
    /// Empty container with room for `slots` elements.
    pub fn with_capacity(slots: usize) -> Self {
        Self {
            elements: Vec::with_capacity(slots),
            has_failed: false,
            failure_timestamp: None,
            dominant_color: OnceLock::new(),
            generation: next_generation(),
        }
    }

    /// Empty container recording a failed load at the current instant.
    pub fn failed() -> Self {
        Self {
            has_failed: true,
            failure_timestamp: Some(Instant::now()),
            ..Self::with_capacity(0)
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn elements(&self) -> &[CacheElement] {
        &self.elements
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn has_failed(&self) -> bool {
        self.has_failed
    }

    /// Time since the failure was recorded, if this is a failure record.
    pub fn failure_age(&self) -> Option<Duration> {
        self.failure_timestamp.map(|stamp| stamp.elapsed())
    }

    /// Whether this failure record is still inside the retry window.
    pub fn is_failure_current(&self, retry_window: Duration) -> bool {
        self.has_failed && self.failure_age().is_some_and(|age| age < retry_window)
    }

    pub fn add_primary(&mut self, bitmap: Bitmap) -> &CacheElement {
        let index = self.insert_sorted(CacheElement::primary(bitmap));
        &self.elements[index]
    }

    pub fn add_secondary(&mut self, bitmap: Bitmap, image_size: u32) -> &CacheElement {
        let index = self.insert_sorted(CacheElement::secondary(bitmap, image_size));
        &self.elements[index]
    }

    /// Insert at the binary-search position: the index of an equal element if
    /// one is found, else the insertion point.
    fn insert_sorted(&mut self, element: CacheElement) -> usize {
        let index = match self
            .elements
            .binary_search_by(|candidate| candidate.compare(&element))
        {
            Ok(index) | Err(index) => index,
        };
        self.elements.insert(index, element);
        index
    }

    /// Index of the smallest element with edge >= `target_size`, or `None`
    /// when the target exceeds every element.
    pub fn next_highest_index(&self, target_size: u32) -> Option<usize> {
        let index = match self
            .elements
            .binary_search_by(|candidate| candidate.compare_to_size(target_size))
        {
            Ok(index) | Err(index) => index,
        };
        (index < self.elements.len()).then_some(index)
    }

    /// Valid element stored under exactly `image_size`.
    pub fn exact_match(&self, image_size: u32) -> Option<&CacheElement> {
        self.elements
            .binary_search_by(|candidate| candidate.compare_to_size(image_size))
            .ok()
            .map(|index| &self.elements[index])
    }

    /// Nearest primary to `from_index`, preferring larger ones.
    ///
    /// The forward scan stops at the first primary it meets. If that primary
    /// is a tombstone the result is `None` even if a smaller valid primary
    /// exists: the best source is known to be gone and must be reloaded.
    /// Only when no primary lies at or after `from_index` does the scan walk
    /// backwards, again returning `None` if the first primary found is a
    /// tombstone.
    pub fn next_primary(&self, from_index: usize) -> Option<&CacheElement> {
        let from_index = from_index.min(self.elements.len());

        if let Some(element) = self.elements[from_index..]
            .iter()
            .find(|element| element.is_primary())
        {
            return (!element.is_invalidated()).then_some(element);
        }

        if let Some(element) = self.elements[..from_index]
            .iter()
            .rev()
            .find(|element| element.is_primary())
        {
            return (!element.is_invalidated()).then_some(element);
        }

        error!(
            elements = self.elements.len(),
            failed = self.has_failed,
            "Favicon container holds no primary at all"
        );
        None
    }

    pub fn get(&self, id: ElementId) -> Option<&CacheElement> {
        self.elements.iter().find(|element| element.id() == id)
    }

    /// Evict one element: primaries are kept as tombstones (re-sorted to the
    /// front), secondaries are removed. Returns the bytes freed.
    pub fn evict(&mut self, id: ElementId) -> Option<usize> {
        let index = self.elements.iter().position(|element| element.id() == id)?;
        let mut element = self.elements.remove(index);
        let eviction = element.on_evicted();
        if let Eviction::Tombstoned { .. } = eviction {
            self.insert_sorted(element);
        }
        Some(eviction.freed())
    }

    /// Elements still holding a payload.
    pub fn live_elements(&self) -> impl Iterator<Item = &CacheElement> {
        self.elements
            .iter()
            .filter(|element| !element.is_invalidated())
    }

    pub fn primary_count(&self) -> usize {
        self.live_elements()
            .filter(|element| element.is_primary())
            .count()
    }

    pub fn tombstone_count(&self) -> usize {
        self.elements
            .iter()
            .filter(|element| element.is_invalidated())
            .count()
    }

    /// Bytes held by this container's payloads.
    pub fn size_of(&self) -> usize {
        self.elements.iter().map(CacheElement::size_of).sum()
    }

    /// Memoized dominant color of the first valid element, white if none.
    pub fn ensure_dominant_color(&self) -> Color {
        *self.dominant_color.get_or_init(|| {
            self.live_elements()
                .find_map(CacheElement::payload)
                .map(|bitmap| dominant_color(bitmap))
                .unwrap_or(Color::WHITE)
        })
    }

    /// Forget the memoized color; the next lookup computes it again.
    pub fn reset_dominant_color(&mut self) {
        self.dominant_color = OnceLock::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, Rgba, RgbaImage};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn rgba(edge: u32) -> Bitmap {
        Arc::new(DynamicImage::new_rgba8(edge, edge))
    }

    fn solid(edge: u32, pixel: [u8; 4]) -> Bitmap {
        Arc::new(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            edge,
            edge,
            Rgba(pixel),
        )))
    }

    fn sizes(container: &KeyContainer) -> Vec<(u32, bool, bool)> {
        container
            .elements()
            .iter()
            .map(|e| (e.image_size(), e.is_primary(), e.is_invalidated()))
            .collect()
    }

    fn assert_sorted(container: &KeyContainer) {
        for pair in container.elements().windows(2) {
            assert_ne!(
                pair[0].compare(&pair[1]),
                std::cmp::Ordering::Greater,
                "elements out of order: {:?}",
                sizes(container)
            );
        }
    }

    #[test]
    fn test_add_keeps_elements_sorted() {
        let mut container = KeyContainer::with_capacity(4);
        container.add_primary(rgba(64));
        container.add_primary(rgba(16));
        container.add_secondary(rgba(32), 32);
        container.add_primary(rgba(128));

        assert_eq!(
            sizes(&container),
            vec![
                (16, true, false),
                (32, false, false),
                (64, true, false),
                (128, true, false)
            ]
        );
    }

    #[test]
    fn test_next_highest_index() {
        let mut container = KeyContainer::with_capacity(4);
        container.add_primary(rgba(16));
        container.add_primary(rgba(32));
        container.add_primary(rgba(64));

        assert_eq!(container.next_highest_index(1), Some(0));
        assert_eq!(container.next_highest_index(16), Some(0));
        assert_eq!(container.next_highest_index(17), Some(1));
        assert_eq!(container.next_highest_index(64), Some(2));
        assert_eq!(container.next_highest_index(65), None);
    }

    #[test]
    fn test_next_highest_index_skips_tombstones() {
        let mut container = KeyContainer::with_capacity(4);
        let id = container.add_primary(rgba(64)).id();
        container.add_primary(rgba(16));
        container.evict(id);

        assert_eq!(sizes(&container), vec![(64, true, true), (16, true, false)]);
        assert_eq!(container.next_highest_index(8), Some(1));
        assert_eq!(container.next_highest_index(64), None);
    }

    #[test]
    fn test_exact_match_ignores_tombstones() {
        let mut container = KeyContainer::with_capacity(4);
        let id = container.add_primary(rgba(32)).id();
        assert!(container.exact_match(32).is_some());

        container.evict(id);
        assert!(container.exact_match(32).is_none());
        assert!(container.exact_match(0).is_none());
    }

    #[test]
    fn test_next_primary_prefers_forward() {
        let mut container = KeyContainer::with_capacity(4);
        container.add_primary(rgba(16));
        container.add_secondary(rgba(24), 24);
        container.add_primary(rgba(64));

        let from = container.next_highest_index(20).unwrap();
        assert_eq!(container.next_primary(from).unwrap().image_size(), 64);
    }

    #[test]
    fn test_next_primary_falls_back_to_backward_scan() {
        let mut container = KeyContainer::with_capacity(4);
        container.add_primary(rgba(16));
        container.add_secondary(rgba(48), 48);

        let from = container.next_highest_index(32).unwrap();
        assert_eq!(container.next_primary(from).unwrap().image_size(), 16);
        // Past-the-end start is a pure backward scan.
        assert_eq!(
            container.next_primary(container.len()).unwrap().image_size(),
            16
        );
    }

    #[test]
    fn test_next_primary_stops_at_forward_tombstone() {
        let mut container = KeyContainer::with_capacity(4);
        let id = container.add_primary(rgba(64)).id();
        container.add_primary(rgba(128));
        container.evict(id);
        assert_eq!(sizes(&container), vec![(64, true, true), (128, true, false)]);

        // The tombstone is the first primary met going forward, so the valid
        // 128 further on is never considered.
        assert!(container.next_primary(0).is_none());
        assert_eq!(container.next_primary(1).unwrap().image_size(), 128);
    }

    #[test]
    fn test_next_primary_backward_tombstone_yields_none() {
        let mut container = KeyContainer::with_capacity(4);
        let id = container.add_primary(rgba(64)).id();
        container.add_secondary(rgba(32), 32);
        container.evict(id);

        assert!(container.next_primary(container.len()).is_none());
    }

    #[test]
    fn test_next_primary_without_primaries() {
        let mut container = KeyContainer::with_capacity(2);
        container.add_secondary(rgba(8), 8);
        assert!(container.next_primary(0).is_none());
        assert!(KeyContainer::failed().next_primary(0).is_none());
    }

    #[test]
    fn test_evict_secondary_removes_it() {
        let mut container = KeyContainer::with_capacity(4);
        container.add_primary(rgba(64));
        let id = container.add_secondary(rgba(32), 32).id();

        assert_eq!(container.evict(id), Some(32 * 32 * 4));
        assert_eq!(sizes(&container), vec![(64, true, false)]);
        assert!(container.get(id).is_none());
        assert_eq!(container.evict(id), None);
    }

    #[test]
    fn test_evict_primary_keeps_tombstone() {
        let mut container = KeyContainer::with_capacity(4);
        let id = container.add_primary(rgba(64)).id();

        assert_eq!(container.evict(id), Some(64 * 64 * 4));
        assert_eq!(container.tombstone_count(), 1);
        assert_eq!(container.primary_count(), 0);
        assert_eq!(container.size_of(), 0);
        assert!(container.get(id).is_some_and(CacheElement::is_invalidated));
    }

    #[test]
    fn test_dominant_color_memoized() {
        let mut container = KeyContainer::with_capacity(2);
        container.add_primary(solid(8, [255, 0, 0, 255]));
        assert_eq!(container.ensure_dominant_color(), Color::from_rgb(255, 0, 0));

        // A smaller blue element now sorts first, but the memo stands.
        container.add_primary(solid(4, [0, 0, 255, 255]));
        assert_eq!(container.ensure_dominant_color(), Color::from_rgb(255, 0, 0));
        container.reset_dominant_color();
        assert_eq!(container.ensure_dominant_color(), Color::from_rgb(0, 0, 255));
    }

    #[test]
    fn test_dominant_color_defaults_to_white() {
        assert_eq!(KeyContainer::failed().ensure_dominant_color(), Color::WHITE);
    }

    #[test]
    fn test_failure_window() {
        let failed = KeyContainer::failed();
        assert!(failed.has_failed());
        assert!(failed.is_failure_current(Duration::from_secs(60)));
        assert!(!failed.is_failure_current(Duration::ZERO));

        let healthy = KeyContainer::with_capacity(1);
        assert!(!healthy.is_failure_current(Duration::from_secs(60)));
        assert!(healthy.failure_age().is_none());
    }

    #[test]
    fn test_generations_are_distinct() {
        assert_ne!(
            KeyContainer::with_capacity(0).generation(),
            KeyContainer::with_capacity(0).generation()
        );
    }

    #[derive(Debug, Clone)]
    enum Op {
        Primary(u32),
        Secondary(u32),
        Evict(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u32..64).prop_map(Op::Primary),
            (1u32..64).prop_map(Op::Secondary),
            (0usize..16).prop_map(Op::Evict),
        ]
    }

    proptest! {
        #[test]
        fn prop_elements_stay_sorted(ops in prop::collection::vec(op_strategy(), 1..40)) {
            let mut container = KeyContainer::with_capacity(4);
            for op in ops {
                match op {
                    Op::Primary(edge) => { container.add_primary(rgba(edge)); }
                    Op::Secondary(edge) => { container.add_secondary(rgba(1), edge); }
                    Op::Evict(slot) => {
                        if !container.is_empty() {
                            let id = container.elements()[slot % container.len()].id();
                            container.evict(id);
                        }
                    }
                }
                assert_sorted(&container);
                let tombstones = container.tombstone_count();
                prop_assert!(container.elements()[..tombstones].iter().all(CacheElement::is_invalidated));
            }
        }
    }
}
