//! Decoded-image cache with capacity and memory-pressure eviction.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use image::DynamicImage;

use super::animated::AnimatedImage;
use super::lru::LruMap;
use crate::memory::MemoryProbe;
use crate::source::ByteSource;

/// A decoded result: a still bitmap or an animated frame sequence.
///
/// Payloads are handed out as cheap clones; the pixel data stays shared and
/// owned by the cache until evicted.
#[derive(Clone)]
pub enum ImagePayload {
    /// A single decoded bitmap.
    Static(Arc<DynamicImage>),
    /// A decoded animation.
    Animated(Arc<AnimatedImage>),
}

impl ImagePayload {
    /// Dimensions of the decoded payload in pixels.
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            ImagePayload::Static(image) => (image.width(), image.height()),
            ImagePayload::Animated(animation) => (animation.width(), animation.height()),
        }
    }

    /// The still bitmap, if this payload is static.
    pub fn as_static(&self) -> Option<&Arc<DynamicImage>> {
        match self {
            ImagePayload::Static(image) => Some(image),
            ImagePayload::Animated(_) => None,
        }
    }

    /// The animation, if this payload is animated.
    pub fn as_animated(&self) -> Option<&Arc<AnimatedImage>> {
        match self {
            ImagePayload::Static(_) => None,
            ImagePayload::Animated(animation) => Some(animation),
        }
    }

    /// Estimated bytes of decoded pixel data.
    pub(crate) fn byte_estimate(&self) -> u64 {
        match self {
            ImagePayload::Static(image) => image.as_bytes().len() as u64,
            ImagePayload::Animated(animation) => animation.byte_estimate(),
        }
    }
}

/// Cache record: the payload plus the original (pre-downsample) dimensions
/// and the source it was decoded from.
pub(crate) struct ImageCacheEntry {
    pub payload: ImagePayload,
    pub original_width: u32,
    pub original_height: u32,
    #[allow(dead_code)]
    pub source: Arc<dyn ByteSource>,
}

/// LRU cache bounded by entry count and by an injected memory probe.
///
/// Not synchronized itself: the image loader guards it with the same lock as
/// its decode queue, so eviction stays atomic with respect to lookups.
pub(crate) struct ImageCache {
    entries: LruMap<String, ImageCacheEntry>,
    capacity: usize,
    pressure_threshold: f64,
    probe: Arc<dyn MemoryProbe>,
    payload_bytes: Arc<AtomicU64>,
}

impl ImageCache {
    /// `payload_bytes` is the shared counter of estimated decoded bytes; the
    /// cache keeps it current so a probe reading the same counter closes the
    /// pressure loop.
    pub fn new(
        capacity: usize,
        pressure_threshold: f64,
        probe: Arc<dyn MemoryProbe>,
        payload_bytes: Arc<AtomicU64>,
    ) -> Self {
        Self {
            entries: LruMap::new(),
            capacity: capacity.max(1),
            pressure_threshold,
            probe,
            payload_bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Insert a freshly decoded entry, then enforce the capacity bound and
    /// evaluate the pressure predicate.
    ///
    /// Pressure releases one least-recently-accessed entry per insertion;
    /// the capacity bound is enforced fully.
    pub fn insert(&mut self, id: String, entry: ImageCacheEntry) {
        self.payload_bytes
            .fetch_add(entry.payload.byte_estimate(), Ordering::Relaxed);
        if let Some(previous) = self.entries.insert(id, entry) {
            self.payload_bytes
                .fetch_sub(previous.payload.byte_estimate(), Ordering::Relaxed);
        }

        while self.entries.len() > self.capacity && self.evict_one().is_some() {}
        if !self.entries.is_empty() && self.under_pressure() {
            self.evict_one();
        }
    }

    /// Look up an entry, refreshing its recency.
    pub fn get(&mut self, id: &String) -> Option<&ImageCacheEntry> {
        self.entries.get(id)
    }

    /// Evict least-recently-accessed entries until at least `min_bytes` of
    /// estimated payload have been released. Returns the bytes released.
    pub fn evict_bytes(&mut self, min_bytes: u64) -> u64 {
        let mut released = 0;
        while !self.entries.is_empty() {
            match self.evict_one() {
                Some(bytes) => {
                    released += bytes;
                    if released > min_bytes {
                        break;
                    }
                }
                None => break,
            }
        }
        released
    }

    fn evict_one(&mut self) -> Option<u64> {
        let (id, entry) = self.entries.pop_lru()?;
        let bytes = entry.payload.byte_estimate();
        self.payload_bytes.fetch_sub(bytes, Ordering::Relaxed);
        tracing::debug!("evicted cache entry {id} ({bytes} bytes)");
        Some(bytes)
    }

    fn under_pressure(&self) -> bool {
        let used = self.probe.used_bytes() as f64;
        let limit = self.probe.limit_bytes() as f64;
        used / limit > self.pressure_threshold
    }
}
