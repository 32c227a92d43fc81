//! Decode scheduling: one worker, most-recent-first, retry under pressure.

use std::collections::VecDeque;
use std::io::{Cursor, Read};
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::imageops::FilterType;
use image::{ImageError, ImageReader};
use tokio::sync::Notify;

use super::animated::AnimatedImage;
use super::cache::{ImageCache, ImageCacheEntry, ImagePayload};
use crate::config::Config;
use crate::memory::{ByteBudgetProbe, MemoryProbe};
use crate::source::ByteSource;

/// How often the decode worker re-checks source readiness while idle.
/// A source can become ready (download finished) without a new request
/// arriving, so waiting on the notifier alone is not enough.
const READY_POLL: Duration = Duration::from_millis(100);

/// Callback invoked once when an image finishes loading (or, for
/// dimension-only requests, once dimensions are known).
pub type ImageListener = Box<dyn FnOnce(&ImageSpec) + Send>;

/// Everything known about a requested image, whether or not it is decoded.
///
/// Returned as a snapshot from [`ImageLoader::request_image`] and handed to
/// listeners on completion, with `original_width`/`original_height` resolved.
#[derive(Debug, Clone)]
pub struct ImageSpec {
    /// Cache key the image was requested under.
    pub id: String,
    /// Requested width; 0 means unconstrained.
    pub required_width: u32,
    /// Requested height; 0 means unconstrained.
    pub required_height: u32,
    /// Width of the undownsampled image; 0 until resolved.
    pub original_width: u32,
    /// Height of the undownsampled image; 0 until resolved.
    pub original_height: u32,
    /// Whether the request decodes an animation instead of a still image.
    pub animated: bool,
    /// Whether only dimensions are wanted, with no pixel decode.
    pub decode_only: bool,
    retries: u32,
}

/// A pending request: the public spec plus its source and listeners.
struct QueuedSpec {
    spec: ImageSpec,
    source: Arc<dyn ByteSource>,
    listeners: Vec<ImageListener>,
}

struct LoaderState {
    /// Front of the deque decodes first; requests are pushed to the front,
    /// so the most recently requested image wins.
    pending: VecDeque<QueuedSpec>,
    in_progress: Option<ImageSpec>,
    cache: ImageCache,
    shutdown: bool,
}

struct Shared {
    state: Mutex<LoaderState>,
    notify: Notify,
    probe: Arc<dyn MemoryProbe>,
    retry_ceiling: u32,
    sample_cap: u32,
}

/// Turns ready byte sources into cached, memory-bounded decoded images.
///
/// Decoding runs on a single dedicated worker task, deliberately serial:
/// concurrent decodes would spike peak memory unpredictably, and the pressure
/// check is only meaningful when evaluated between decodes.
pub struct ImageLoader {
    shared: Arc<Shared>,
}

impl ImageLoader {
    /// Create a loader whose memory probe tracks the cache's own decoded
    /// bytes against `config.decode_memory_budget`.
    ///
    /// Spawns the decode worker; must be called within a tokio runtime.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let counter = Arc::new(AtomicU64::new(0));
        let probe: Arc<dyn MemoryProbe> = Arc::new(ByteBudgetProbe::new(
            Arc::clone(&counter),
            config.decode_memory_budget,
        ));
        Self::build(config, probe, counter)
    }

    /// Create a loader with an injected memory probe.
    #[must_use]
    pub fn with_probe(config: &Config, probe: Arc<dyn MemoryProbe>) -> Self {
        Self::build(config, probe, Arc::new(AtomicU64::new(0)))
    }

    fn build(config: &Config, probe: Arc<dyn MemoryProbe>, counter: Arc<AtomicU64>) -> Self {
        let cache = ImageCache::new(
            config.cache_capacity,
            config.memory_threshold,
            Arc::clone(&probe),
            counter,
        );
        let shared = Arc::new(Shared {
            state: Mutex::new(LoaderState {
                pending: VecDeque::new(),
                in_progress: None,
                cache,
                shutdown: false,
            }),
            notify: Notify::new(),
            probe,
            retry_ceiling: config.decode_retries,
            sample_cap: config.sample_size_cap,
        });

        tokio::spawn(decode_task(Arc::clone(&shared)));

        Self { shared }
    }

    /// Request an image, most-recently-requested-first.
    ///
    /// If a request for `id` is already queued, `listener` is attached to it
    /// (and a previously dimension-only request is upgraded to a full
    /// decode); either way the request moves to the front of the queue.
    ///
    /// The listener fires at most once, on success or on dimension-only
    /// completion. A request whose decode keeps failing is eventually dropped
    /// without notice, so callers must not rely on the listener firing.
    pub fn request_image(
        &self,
        id: impl Into<String>,
        source: Arc<dyn ByteSource>,
        required_width: u32,
        required_height: u32,
        animated: bool,
        listener: impl FnOnce(&ImageSpec) + Send + 'static,
        decode_only: bool,
    ) -> ImageSpec {
        let id = id.into();
        if !decode_only && (required_width == 0 || required_height == 0) {
            tracing::error!("full decode requested without required dimensions: {id}");
        }

        let snapshot;
        {
            let mut state = self.shared.state.lock().unwrap();

            let mut queued = match state.pending.iter().position(|q| q.spec.id == id) {
                Some(index) => {
                    let mut queued = state.pending.remove(index).unwrap();
                    queued.listeners.push(Box::new(listener));
                    if !decode_only {
                        // one full-decode request upgrades the whole merge
                        queued.spec.decode_only = false;
                    }
                    queued
                }
                None => QueuedSpec {
                    spec: ImageSpec {
                        id: id.clone(),
                        required_width,
                        required_height,
                        original_width: 0,
                        original_height: 0,
                        animated,
                        decode_only,
                        retries: 0,
                    },
                    source,
                    listeners: vec![Box::new(listener)],
                },
            };

            if let Some(entry) = state.cache.get(&id) {
                queued.spec.original_width = entry.original_width;
                queued.spec.original_height = entry.original_height;
            }

            snapshot = queued.spec.clone();
            state.pending.push_front(queued);
        }
        self.shared.notify.notify_one();
        snapshot
    }

    /// Resolve only the image's native dimensions; no pixels are decoded and
    /// nothing is cached.
    pub fn request_dimensions(
        &self,
        id: impl Into<String>,
        source: Arc<dyn ByteSource>,
        listener: impl FnOnce(&ImageSpec) + Send + 'static,
    ) -> ImageSpec {
        self.request_image(id, source, 0, 0, false, listener, true)
    }

    /// Request an animated image decode.
    pub fn request_animated(
        &self,
        id: impl Into<String>,
        source: Arc<dyn ByteSource>,
        listener: impl FnOnce(&ImageSpec) + Send + 'static,
    ) -> ImageSpec {
        self.request_image(id, source, 0, 0, true, listener, false)
    }

    /// Decoded payload for `id` if cached. `None` means "still loading", not
    /// failure. Refreshes the entry's recency.
    pub fn image_from_cache(&self, id: &str) -> Option<ImagePayload> {
        let mut state = self.shared.state.lock().unwrap();
        state
            .cache
            .get(&id.to_string())
            .map(|entry| entry.payload.clone())
    }

    /// Original width for `id` if cached, 0 otherwise.
    pub fn original_width(&self, id: &str) -> u32 {
        let mut state = self.shared.state.lock().unwrap();
        state
            .cache
            .get(&id.to_string())
            .map_or(0, |entry| entry.original_width)
    }

    /// Original height for `id` if cached, 0 otherwise.
    pub fn original_height(&self, id: &str) -> u32 {
        let mut state = self.shared.state.lock().unwrap();
        state
            .cache
            .get(&id.to_string())
            .map_or(0, |entry| entry.original_height)
    }

    /// Snapshot of a queued or in-progress request for `id`, if any.
    pub fn scheduled(&self, id: &str) -> Option<ImageSpec> {
        let state = self.shared.state.lock().unwrap();
        if let Some(spec) = state.in_progress.as_ref()
            && spec.id == id
        {
            return Some(spec.clone());
        }
        state
            .pending
            .iter()
            .find(|q| q.spec.id == id)
            .map(|q| q.spec.clone())
    }

    /// Number of decoded entries currently cached.
    pub fn cache_len(&self) -> usize {
        self.shared.state.lock().unwrap().cache.len()
    }

    /// Stop the decode worker. Pending requests are abandoned.
    pub fn shutdown(&self) {
        self.shared.state.lock().unwrap().shutdown = true;
        self.shared.notify.notify_waiters();
    }
}

/// Outcome of one decode attempt, computed without the state lock held.
enum Decoded {
    Payload(ImagePayload),
    DimensionsOnly,
    Failed {
        /// Bytes to evict before retrying; nonzero only for
        /// allocation-limit failures.
        relief_bytes: u64,
    },
}

/// The dedicated decode worker.
async fn decode_task(shared: Arc<Shared>) {
    tracing::debug!("image decode worker started");
    loop {
        // Take the first pending request whose source is ready. Non-ready
        // sources stay queued, so a slow download never starves the rest.
        let mut queued = loop {
            {
                let mut state = shared.state.lock().unwrap();
                if state.shutdown {
                    tracing::debug!("image decode worker shutting down");
                    return;
                }
                if let Some(index) = state.pending.iter().position(|q| q.source.ready()) {
                    let queued = state.pending.remove(index).unwrap();
                    state.in_progress = Some(queued.spec.clone());
                    break queued;
                }
            }
            let _ = tokio::time::timeout(READY_POLL, shared.notify.notified()).await;
        };

        let outcome = decode_spec(&shared, &mut queued);

        let mut state = shared.state.lock().unwrap();
        match outcome {
            Decoded::Payload(payload) => {
                state.cache.insert(
                    queued.spec.id.clone(),
                    ImageCacheEntry {
                        payload,
                        original_width: queued.spec.original_width,
                        original_height: queued.spec.original_height,
                        source: Arc::clone(&queued.source),
                    },
                );
                state.in_progress = None;
                drop(state);
                fan_out(&queued.spec, queued.listeners);
            }
            Decoded::DimensionsOnly => {
                state.in_progress = None;
                drop(state);
                fan_out(&queued.spec, queued.listeners);
            }
            Decoded::Failed { relief_bytes } => {
                if relief_bytes > 0 {
                    let released = state.cache.evict_bytes(relief_bytes);
                    tracing::debug!(
                        "evicted {released} of {relief_bytes} bytes to relieve decode pressure for {}",
                        queued.spec.id
                    );
                }
                if queued.spec.retries < shared.retry_ceiling {
                    queued.spec.retries += 1;
                    state.pending.push_front(queued);
                    state.in_progress = None;
                    drop(state);
                    shared.notify.notify_one();
                } else {
                    state.in_progress = None;
                    tracing::warn!("decode retries exhausted, dropping {}", queued.spec.id);
                }
            }
        }
    }
}

/// Notify every listener exactly once, consuming the list.
fn fan_out(spec: &ImageSpec, listeners: Vec<ImageListener>) {
    for listener in listeners {
        listener(spec);
    }
}

fn decode_spec(shared: &Shared, queued: &mut QueuedSpec) -> Decoded {
    let spec = &mut queued.spec;

    let bytes = match read_source(queued.source.as_ref()) {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!("could not read image source {}: {err}", spec.id);
            return Decoded::Failed { relief_bytes: 0 };
        }
    };

    if spec.animated {
        return match AnimatedImage::decode(&bytes) {
            Ok(animation) => {
                spec.original_width = animation.width();
                spec.original_height = animation.height();
                tracing::debug!(
                    "decoded animation {} {}x{} ({} frames)",
                    spec.id,
                    animation.width(),
                    animation.height(),
                    animation.frame_count()
                );
                Decoded::Payload(ImagePayload::Animated(Arc::new(animation)))
            }
            Err(err) => {
                tracing::warn!("animation decode failed for {}: {err}", spec.id);
                Decoded::Failed {
                    relief_bytes: relief_estimate(&err, 0, 0, 1),
                }
            }
        };
    }

    // Probe dimensions first; no pixel buffer is allocated for this pass.
    let (original_width, original_height) = match probe_dimensions(&bytes) {
        Ok(dimensions) => dimensions,
        Err(err) => {
            tracing::warn!("could not read image dimensions for {}: {err}", spec.id);
            return Decoded::Failed { relief_bytes: 0 };
        }
    };
    spec.original_width = original_width;
    spec.original_height = original_height;

    if spec.decode_only {
        spec.decode_only = false;
        return Decoded::DimensionsOnly;
    }

    // Required dimensions capped at the original: upscaling never helps.
    let required_width = if spec.required_width > 0 {
        spec.required_width.min(original_width)
    } else {
        original_width
    };
    let required_height = if spec.required_height > 0 {
        spec.required_height.min(original_height)
    } else {
        original_height
    };
    let sample = sample_size(original_width, required_width, shared.sample_cap).min(sample_size(
        original_height,
        required_height,
        shared.sample_cap,
    ));

    match decode_static(&bytes, shared.probe.as_ref()) {
        Ok(image) => {
            let image = if sample > 1 {
                image.resize_exact(
                    (original_width / sample).max(1),
                    (original_height / sample).max(1),
                    FilterType::Triangle,
                )
            } else {
                image
            };
            tracing::debug!(
                "decoded {} original {original_width}x{original_height} sample {sample}",
                spec.id
            );
            Decoded::Payload(ImagePayload::Static(Arc::new(image)))
        }
        Err(err) => {
            tracing::warn!("image decode failed for {}: {err}", spec.id);
            Decoded::Failed {
                relief_bytes: relief_estimate(&err, original_width, original_height, sample),
            }
        }
    }
}

/// Drain a source into memory. Sources are re-openable, but decoding needs
/// seekable bytes, so one read feeds both the bounds probe and the decode.
fn read_source(source: &dyn ByteSource) -> std::io::Result<Vec<u8>> {
    let mut stream = source.open()?;
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes)?;
    Ok(bytes)
}

fn probe_dimensions(bytes: &[u8]) -> image::ImageResult<(u32, u32)> {
    let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    reader.into_dimensions()
}

fn decode_static(
    bytes: &[u8],
    probe: &dyn MemoryProbe,
) -> image::ImageResult<image::DynamicImage> {
    let mut reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
    let mut limits = image::Limits::no_limits();
    if probe.limit_bytes() != u64::MAX {
        limits.max_alloc = Some(probe.limit_bytes().saturating_sub(probe.used_bytes()));
    }
    reader.limits(limits);
    reader.decode()
}

/// Bytes worth evicting before a retry. Only allocation-limit failures are
/// memory-related; other decode errors retry without touching the cache.
fn relief_estimate(err: &ImageError, width: u32, height: u32, sample: u32) -> u64 {
    match err {
        ImageError::Limits(_) => {
            let bytes = 4 * u64::from(width) * u64::from(height) / u64::from(sample.max(1));
            bytes.max(1)
        }
        _ => 0,
    }
}

/// Largest power-of-two downscale factor keeping `original / sample` at or
/// above `min_required`, capped.
///
/// Power-of-two only: the decoder rounds intermediate factors down to the
/// nearest power of two anyway, so honoring them would over-shrink.
fn sample_size(original: u32, min_required: u32, cap: u32) -> u32 {
    let mut sample = 1;
    while original / (sample * 2) > min_required {
        sample *= 2;
        if sample >= cap {
            break;
        }
    }
    sample
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{FileSource, RemoteSource};
    use image::codecs::gif::GifEncoder;
    use image::{Delay, DynamicImage, Frame, RgbaImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use tempfile::tempdir;

    #[test]
    fn sample_size_is_largest_power_of_two_meeting_requirement() {
        assert_eq!(sample_size(1000, 300, 32), 2);
        assert_eq!(sample_size(1000, 1000, 32), 1);
        assert_eq!(sample_size(1000, 100, 32), 8);
        assert_eq!(sample_size(100, 100, 32), 1);
    }

    #[test]
    fn sample_size_respects_cap() {
        assert_eq!(sample_size(1_000_000, 1, 32), 32);
        assert_eq!(sample_size(1_000_000, 1, 8), 8);
    }

    /// Source that always yields bytes no decoder accepts.
    struct GarbageSource {
        opens: AtomicUsize,
    }

    impl ByteSource for GarbageSource {
        fn open(&self) -> std::io::Result<Box<dyn Read + Send>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(Cursor::new(b"not an image at all".to_vec())))
        }

        fn ready(&self) -> bool {
            true
        }
    }

    fn test_config() -> Config {
        Config::default()
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..300 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 3s");
    }

    fn write_png(dir: &std::path::Path, width: u32, height: u32) -> std::path::PathBuf {
        let path = dir.join(format!("{width}x{height}.png"));
        DynamicImage::new_rgb8(width, height).save(&path).unwrap();
        path
    }

    #[tokio::test]
    async fn decodes_and_caches_with_downsampling() {
        let dir = tempdir().unwrap();
        let path = write_png(dir.path(), 64, 48);
        let loader = ImageLoader::new(&test_config());
        let source = Arc::new(FileSource::new(&path).unwrap());

        let (tx, rx) = mpsc::channel();
        loader.request_image(
            "pic",
            source,
            16,
            12,
            false,
            move |spec| {
                tx.send(spec.clone()).unwrap();
            },
            false,
        );

        wait_until(|| loader.image_from_cache("pic").is_some()).await;
        let spec = rx.try_recv().unwrap();
        assert_eq!(spec.original_width, 64);
        assert_eq!(spec.original_height, 48);

        assert_eq!(loader.original_width("pic"), 64);
        assert_eq!(loader.original_height("pic"), 48);
        let payload = loader.image_from_cache("pic").unwrap();
        // 64/2=32 > 16 but 64/4=16 is not, so the sample factor is 2
        assert_eq!(payload.dimensions(), (32, 24));
        loader.shutdown();
    }

    #[tokio::test]
    async fn dimension_only_requests_do_not_populate_the_cache() {
        let dir = tempdir().unwrap();
        let path = write_png(dir.path(), 40, 30);
        let loader = ImageLoader::new(&test_config());
        let source = Arc::new(FileSource::new(&path).unwrap());

        let (tx, rx) = mpsc::channel();
        loader.request_dimensions("dims", source, move |spec| {
            tx.send((spec.original_width, spec.original_height)).unwrap();
        });

        let mut received = None;
        wait_until(|| {
            if let Ok(dims) = rx.try_recv() {
                received = Some(dims);
            }
            received.is_some()
        })
        .await;

        assert_eq!(received, Some((40, 30)));
        assert!(loader.image_from_cache("dims").is_none());
        assert_eq!(loader.original_width("dims"), 0);
        assert_eq!(loader.cache_len(), 0);
        loader.shutdown();
    }

    #[tokio::test]
    async fn failing_decode_is_retried_then_dropped_silently() {
        let loader = ImageLoader::new(&test_config());
        let source = Arc::new(GarbageSource {
            opens: AtomicUsize::new(0),
        });
        let opens = Arc::clone(&source);

        let (tx, rx) = mpsc::channel::<()>();
        loader.request_image(
            "bad",
            source,
            10,
            10,
            false,
            move |_| {
                tx.send(()).unwrap();
            },
            false,
        );

        // initial attempt plus the full retry budget
        let expected = 1 + test_config().decode_retries as usize;
        wait_until(|| opens.opens.load(Ordering::SeqCst) >= expected).await;
        wait_until(|| loader.scheduled("bad").is_none()).await;

        assert_eq!(opens.opens.load(Ordering::SeqCst), expected);
        assert!(rx.try_recv().is_err());
        loader.shutdown();
    }

    #[tokio::test]
    async fn merged_requests_share_one_decode_and_upgrade_decode_only() {
        let dir = tempdir().unwrap();
        let path = write_png(dir.path(), 20, 20);
        let loader = ImageLoader::new(&test_config());

        // Not ready yet: requests pile up and merge while the source waits.
        let source = Arc::new(RemoteSource::new());

        let (tx1, rx1) = mpsc::channel();
        let (tx2, rx2) = mpsc::channel();
        loader.request_dimensions("shared", Arc::clone(&source) as Arc<dyn ByteSource>, {
            move |spec| tx1.send(spec.original_width).unwrap()
        });
        loader.request_image(
            "shared",
            Arc::clone(&source) as Arc<dyn ByteSource>,
            10,
            10,
            false,
            move |spec| tx2.send(spec.original_width).unwrap(),
            false,
        );

        let merged = loader.scheduled("shared").unwrap();
        assert!(!merged.decode_only);

        source.complete(path);

        wait_until(|| loader.image_from_cache("shared").is_some()).await;
        wait_until(|| loader.scheduled("shared").is_none()).await;
        assert_eq!(rx1.try_recv().unwrap(), 20);
        assert_eq!(rx2.try_recv().unwrap(), 20);
        loader.shutdown();
    }

    #[tokio::test]
    async fn most_recent_request_decodes_first() {
        let dir = tempdir().unwrap();
        let first = write_png(dir.path(), 8, 8);
        let second = write_png(dir.path(), 9, 9);
        let loader = ImageLoader::new(&test_config());

        let source_a = Arc::new(RemoteSource::new());
        let source_b = Arc::new(RemoteSource::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        for (id, source) in [("a", &source_a), ("b", &source_b)] {
            let order = Arc::clone(&order);
            loader.request_image(
                id,
                Arc::clone(source) as Arc<dyn ByteSource>,
                8,
                8,
                false,
                move |spec| order.lock().unwrap().push(spec.id.clone()),
                false,
            );
        }

        // Release both at once; the queue holds [b, a], so b decodes first.
        source_a.complete(first);
        source_b.complete(second);

        wait_until(|| order.lock().unwrap().len() == 2).await;
        assert_eq!(*order.lock().unwrap(), vec!["b".to_string(), "a".to_string()]);
        loader.shutdown();
    }

    #[tokio::test]
    async fn animated_request_caches_frame_sequence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("anim.gif");
        {
            let file = std::fs::File::create(&path).unwrap();
            let mut encoder = GifEncoder::new(file);
            for _ in 0..2 {
                let buffer = RgbaImage::from_pixel(6, 5, image::Rgba([0, 128, 0, 255]));
                encoder
                    .encode_frame(Frame::from_parts(
                        buffer,
                        0,
                        0,
                        Delay::from_numer_denom_ms(50, 1),
                    ))
                    .unwrap();
            }
        }

        let loader = ImageLoader::new(&test_config());
        let source = Arc::new(FileSource::new(&path).unwrap());
        let (tx, rx) = mpsc::channel();
        loader.request_animated("anim", source, move |spec| {
            tx.send((spec.original_width, spec.original_height)).unwrap();
        });

        wait_until(|| loader.image_from_cache("anim").is_some()).await;
        assert_eq!(rx.try_recv().unwrap(), (6, 5));

        let payload = loader.image_from_cache("anim").unwrap();
        let animation = payload.as_animated().unwrap();
        assert_eq!(animation.frame_count(), 2);
        loader.shutdown();
    }
}
