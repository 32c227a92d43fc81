//! Download scheduling: coalescing, priority, and a fetch worker pool.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use super::fetch;
use crate::config::Config;
use crate::error::{Error, Result};

/// Callback invoked once when a scheduled download has been published.
/// Never invoked for a failed fetch; re-scheduling is the caller's decision.
pub type DownloadListener = Box<dyn FnOnce(&str, &Path) + Send>;

/// Where a newly scheduled download lands in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Behind everything already scheduled.
    Tail,
    /// Ahead of everything pending; also promotes an entry that is already
    /// queued but not yet picked up by a worker.
    Front,
}

struct DownloadEntry {
    url: String,
    destination: Option<PathBuf>,
    listeners: Vec<DownloadListener>,
}

struct InProgress {
    destination: Option<PathBuf>,
    /// Listeners attached while the fetch was already running; merged into
    /// the fan-out on success.
    late_listeners: Vec<DownloadListener>,
}

struct QueueState {
    pending: VecDeque<DownloadEntry>,
    in_progress: HashMap<String, InProgress>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// Delivers bytes from URLs into files through a fixed pool of workers,
/// coalescing concurrent requests for the same (url, destination) pair into
/// a single fetch with fan-out notification.
pub struct DownloadQueue {
    shared: Arc<Shared>,
}

impl DownloadQueue {
    /// Create a queue and spawn its workers; must be called within a tokio
    /// runtime.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                in_progress: HashMap::new(),
                shutdown: false,
            }),
            notify: Notify::new(),
        });

        let client = fetch::build_client(config);
        for worker in 0..config.download_workers {
            tokio::spawn(worker_task(
                worker,
                Arc::clone(&shared),
                client.clone(),
                config.max_redirects,
            ));
        }

        Self { shared }
    }

    /// Schedule a download to a queue-allocated temp file.
    pub fn schedule(
        &self,
        url: &str,
        on_complete: impl FnOnce(&str, &Path) + Send + 'static,
    ) -> Result<()> {
        self.schedule_with(url, None, on_complete, Priority::Tail)
    }

    /// Schedule a download to a specific destination file.
    pub fn schedule_to(
        &self,
        url: &str,
        destination: PathBuf,
        on_complete: impl FnOnce(&str, &Path) + Send + 'static,
    ) -> Result<()> {
        self.schedule_with(url, Some(destination), on_complete, Priority::Tail)
    }

    /// Schedule a download with explicit destination and placement.
    ///
    /// If an equal (url, destination) pair is already pending or being
    /// fetched, `on_complete` is attached to the existing work instead of
    /// scheduling a second fetch. [`Priority::Front`] moves a still-pending
    /// entry to the head of the queue.
    pub fn schedule_with(
        &self,
        url: &str,
        destination: Option<PathBuf>,
        on_complete: impl FnOnce(&str, &Path) + Send + 'static,
        priority: Priority,
    ) -> Result<()> {
        if url.is_empty() {
            return Err(Error::EmptyUrl);
        }

        {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutdown {
                return Err(Error::ShutDown);
            }

            if let Some(in_progress) = state.in_progress.get_mut(url)
                && in_progress.destination == destination
            {
                in_progress.late_listeners.push(Box::new(on_complete));
                return Ok(());
            }

            if let Some(index) = state
                .pending
                .iter()
                .position(|entry| entry.url == url && entry.destination == destination)
            {
                state.pending[index].listeners.push(Box::new(on_complete));
                if priority == Priority::Front && index > 0 {
                    let entry = state.pending.remove(index).unwrap();
                    state.pending.push_front(entry);
                }
            } else {
                let entry = DownloadEntry {
                    url: url.to_string(),
                    destination,
                    listeners: vec![Box::new(on_complete)],
                };
                match priority {
                    Priority::Front => state.pending.push_front(entry),
                    Priority::Tail => state.pending.push_back(entry),
                }
            }
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Stop all workers. Pending downloads are abandoned; in-flight fetches
    /// finish but their workers exit afterwards.
    pub fn shutdown(&self) {
        self.shared.state.lock().unwrap().shutdown = true;
        self.shared.notify.notify_waiters();
    }

    #[cfg(test)]
    fn pending_urls(&self) -> Vec<String> {
        self.shared
            .state
            .lock()
            .unwrap()
            .pending
            .iter()
            .map(|entry| entry.url.clone())
            .collect()
    }
}

async fn worker_task(
    worker: usize,
    shared: Arc<Shared>,
    client: reqwest::Client,
    max_redirects: usize,
) {
    tracing::debug!("download worker {worker} started");
    loop {
        let entry = loop {
            {
                let mut state = shared.state.lock().unwrap();
                if state.shutdown {
                    tracing::debug!("download worker {worker} shutting down");
                    return;
                }
                if let Some(entry) = state.pending.pop_front() {
                    state.in_progress.insert(
                        entry.url.clone(),
                        InProgress {
                            destination: entry.destination.clone(),
                            late_listeners: Vec::new(),
                        },
                    );
                    break entry;
                }
            }
            shared.notify.notified().await;
        };

        let DownloadEntry {
            url,
            destination,
            mut listeners,
        } = entry;

        let destination = match destination {
            Some(path) => path,
            None => match temp_destination() {
                Ok(path) => path,
                Err(err) => {
                    tracing::warn!("could not allocate temp destination for {url}: {err}");
                    shared.state.lock().unwrap().in_progress.remove(&url);
                    continue;
                }
            },
        };

        match fetch::fetch_to_file(&client, &url, &destination, max_redirects).await {
            Ok(()) => {
                if let Some(in_progress) = shared.state.lock().unwrap().in_progress.remove(&url) {
                    listeners.extend(in_progress.late_listeners);
                }
                tracing::debug!("worker {worker} downloaded {url} to {}", destination.display());
                for listener in listeners {
                    let fired = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                        listener(&url, &destination);
                    }));
                    if fired.is_err() {
                        tracing::error!("download listener panicked for {url}");
                    }
                }
            }
            Err(err) => {
                // no fan-out on failure; a retry needs a fresh schedule call
                tracing::warn!("download failed for {url}: {err:#}");
                shared.state.lock().unwrap().in_progress.remove(&url);
            }
        }
    }
}

/// Allocate a persistent temp file to download into when the caller did not
/// name a destination.
fn temp_destination() -> std::io::Result<PathBuf> {
    let file = tempfile::Builder::new()
        .prefix("magpie-")
        .suffix(".bin")
        .tempfile()?;
    let (_, path) = file.keep().map_err(|err| err.error)?;
    Ok(path)
}
