//! # Magpie 🐦
//!
//! Async image downloading, decoding, and caching pipeline for UI toolkits.
//!
//! ## Overview
//!
//! Magpie takes a content identifier (a URL or a local file), fetches the raw
//! bytes, decodes them into a displayable bitmap or animation at a
//! memory-conscious resolution, and caches the result for reuse by many
//! simultaneous view-bound consumers. What to render and when stays with the
//! consumer; magpie only moves and decodes the bytes.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Consumers                            │
//! │   views/drawables that request images and redraw on load    │
//! └─────────────────────────────────────────────────────────────┘
//!                │                              │
//!                ▼                              ▼
//! ┌─────────────────────────┐     ┌─────────────────────────────┐
//! │     DownloadQueue       │     │        ImageLoader          │
//! │                         │     │                             │
//! │ • Worker pool           │     │ • One serial decode worker  │
//! │ • Request coalescing    │     │ • Power-of-two downsample   │
//! │ • Atomic publication    │     │ • Retry under pressure      │
//! └─────────────────────────┘     │ • LRU cache + memory probe  │
//!                │                └─────────────────────────────┘
//!                └────────► RemoteSource ──────────┘
//!                     (ready once the file lands)
//! ```
//!
//! ## Modules
//!
//! - [`config`] — Pipeline tunables with serde/toml defaults
//! - [`download`] — Coalescing download queue and atomic fetch
//! - [`images`] — Decode worker, downsampling, pressure-evicted cache
//! - [`memory`] — Injected memory-pressure probes
//! - [`source`] — Byte-source capability (file- or download-backed)
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use magpie::{Config, DownloadQueue, ImageLoader, RemoteSource};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     let queue = DownloadQueue::new(&config);
//!     let loader = ImageLoader::new(&config);
//!
//!     // Becomes ready once the download queue publishes the file.
//!     let source = RemoteSource::fetch(&queue, "https://example.com/cover.png", None)?;
//!     loader.request_image(
//!         "cover.png",
//!         Arc::new(source),
//!         320,
//!         240,
//!         false,
//!         |spec| println!("loaded {}x{}", spec.original_width, spec.original_height),
//!         false,
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ## Behavior worth knowing
//!
//! - **Coalescing** — concurrent requests for the same work share one fetch
//!   or one decode; every listener still fires exactly once.
//! - **Most-recent-first decode** — the image the user is looking at right
//!   now decodes before the backlog from a fast scroll.
//! - **No cancellation** — an abandoned request simply never hears back, and
//!   a decode that keeps failing is dropped after its retry budget without a
//!   callback. Treat a silent listener as a possible outcome.

#![doc(html_root_url = "https://docs.rs/magpie/0.1.0")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::missing_fields_in_debug)]

pub mod config;
pub mod download;
pub mod error;
pub mod images;
pub mod memory;
pub mod source;

// Re-export main types for convenience
pub use config::Config;
pub use download::{DownloadListener, DownloadQueue, Priority};
pub use error::{Error, Result};
pub use images::{AnimatedImage, ImageListener, ImageLoader, ImagePayload, ImageSpec};
pub use memory::{ByteBudgetProbe, MemoryProbe, NoPressureProbe};
pub use source::{ByteSource, FileSource, RemoteSource};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
