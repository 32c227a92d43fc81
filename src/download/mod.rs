//! Download scheduling and fetching.
//!
//! [`DownloadQueue`] accepts (url, destination, listener) requests,
//! deduplicates concurrent requests for the same pair, and serves them with
//! a fixed pool of worker tasks. Downloaded files are published atomically:
//! bytes stream into a `.download` sibling that is renamed onto the
//! destination only once complete and verified.

mod fetch;
mod queue;

#[cfg(test)]
pub(crate) mod testserver;

pub use queue::{DownloadListener, DownloadQueue, Priority};
