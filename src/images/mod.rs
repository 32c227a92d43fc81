//! Image decoding and caching.
//!
//! [`ImageLoader`] turns ready byte sources into decoded images at a
//! memory-conscious resolution. Decoding is strictly serial on one worker
//! task, results land in an LRU cache that reacts to memory pressure, and
//! overlapping requests for the same image share a single decode.

mod animated;
mod cache;
mod loader;
mod lru;

pub use animated::AnimatedImage;
pub use cache::ImagePayload;
pub use loader::{ImageListener, ImageLoader, ImageSpec};
