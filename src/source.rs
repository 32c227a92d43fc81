//! Byte sources feeding the image loader.
//!
//! A [`ByteSource`] is the minimal capability the decode loop needs: open a
//! byte stream, and say whether opening would succeed right now. A local file
//! is always ready; a source backed by an in-flight download becomes ready
//! once the download queue publishes the file.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::download::{DownloadQueue, Priority};
use crate::error::{Error, Result};

/// Provider of raw image bytes.
pub trait ByteSource: Send + Sync {
    /// Open a fresh stream over the full content.
    ///
    /// The decode loop may open a source more than once (bounds probe, then
    /// pixel decode), so each call must yield the content from the start.
    fn open(&self) -> io::Result<Box<dyn Read + Send>>;

    /// Whether [`open`](ByteSource::open) can be expected to succeed now.
    ///
    /// Non-ready sources are skipped by the decode loop without being
    /// dropped from its queue.
    fn ready(&self) -> bool;
}

/// Source reading from a file that already exists on disk.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    /// Create a source for `path`. The file must already exist.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Err(Error::MissingFile(path));
        }
        Ok(Self { path })
    }

    /// The file backing this source.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteSource for FileSource {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        let file = File::open(&self.path)?;
        Ok(Box::new(file))
    }

    fn ready(&self) -> bool {
        true
    }
}

/// Source backed by a download that may not have finished yet.
///
/// Starts out not ready. Once the download queue's completion listener calls
/// [`complete`](RemoteSource::complete) the source is rewired to the
/// downloaded file and behaves like a [`FileSource`].
#[derive(Clone)]
pub struct RemoteSource {
    path: Arc<Mutex<Option<PathBuf>>>,
}

impl Default for RemoteSource {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteSource {
    /// Create a source with no backing file yet.
    #[must_use]
    pub fn new() -> Self {
        Self {
            path: Arc::new(Mutex::new(None)),
        }
    }

    /// Schedule `url` on `queue` and return a source that becomes ready when
    /// the download completes.
    pub fn fetch(queue: &DownloadQueue, url: &str, destination: Option<PathBuf>) -> Result<Self> {
        let source = Self::new();
        let rewire = source.clone();
        queue.schedule_with(
            url,
            destination,
            move |_url, file| rewire.complete(file.to_path_buf()),
            Priority::Tail,
        )?;
        Ok(source)
    }

    /// Rewire the source to the downloaded file.
    pub fn complete(&self, path: PathBuf) {
        *self.path.lock().unwrap() = Some(path);
    }
}

impl ByteSource for RemoteSource {
    fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        let guard = self.path.lock().unwrap();
        match guard.as_ref() {
            Some(path) => {
                let file = File::open(path)?;
                Ok(Box::new(file))
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "download has not completed",
            )),
        }
    }

    fn ready(&self) -> bool {
        self.path.lock().unwrap().is_some()
    }
}
