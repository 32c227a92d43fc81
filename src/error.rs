//! Error types for the pipeline's public surface.
//!
//! Runtime failures (network errors, bad image data) never cross the
//! component boundary as errors — they are logged and handled by the retry
//! and fan-out policies. Only malformed arguments surface synchronously.

use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by pipeline entry points.
#[derive(Debug, Error)]
pub enum Error {
    /// A download was scheduled with an empty URL.
    #[error("download url must not be empty")]
    EmptyUrl,

    /// A file source was created for a path that does not exist.
    #[error("file does not exist: {0}")]
    MissingFile(PathBuf),

    /// The component has been shut down and accepts no new work.
    #[error("component is shut down")]
    ShutDown,
}

/// Convenience alias for pipeline results.
pub type Result<T> = std::result::Result<T, Error>;
