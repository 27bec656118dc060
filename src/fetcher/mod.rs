//! Asynchronous, connection-multiplexed media fetcher.
//!
//! A dedicated reactor thread multiplexes many concurrent downloads over a
//! small pool of reusable connections. Requests are fire-and-forget and
//! deduplicated per content hash; completions land in a pending list drained
//! by the consumer, which publishes decoded images into the `thumbnails` and
//! `images` maps.

pub mod decode;

use std::collections::{HashMap, HashSet};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::{debug, warn};

use crate::cache::{MediaCache, MediaKind};
use crate::domain::Md5Hash;
use decode::{missing_placeholder, DecodedImage, MediaDecoder};

/// Number of reusable connection handles the reactor multiplexes over.
pub const CONNECTION_POOL_SIZE: usize = 3;

#[derive(Error, Debug)]
pub enum FetchError {
    /// The origin no longer has the file; a placeholder is substituted.
    #[error("media not found")]
    NotFound,
    #[error("media transport error: {0}")]
    Transport(String),
}

/// Seam between the fetcher and the HTTP stack. The transport streams the
/// body into the decoder chunk by chunk; tests substitute canned bytes and
/// count calls.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn fetch(&self, url: &str, sink: &mut MediaDecoder) -> Result<(), FetchError>;
}

pub struct HttpMediaTransport {
    client: reqwest::Client,
}

impl HttpMediaTransport {
    pub fn new(pool_size: usize) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .pool_max_idle_per_host(pool_size)
            .user_agent(concat!("eddy/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("Failed to build media HTTP client");
        Self { client }
    }
}

#[async_trait]
impl MediaTransport for HttpMediaTransport {
    async fn fetch(&self, url: &str, sink: &mut MediaDecoder) -> Result<(), FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound);
        }
        if let Err(e) = response.error_for_status_ref() {
            return Err(FetchError::Transport(e.to_string()));
        }
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| FetchError::Transport(e.to_string()))?;
            sink.push(&chunk);
        }
        Ok(())
    }
}

/// How a completed request was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// Downloaded from the origin and stored in the cache.
    Fetched,
    /// Served from the disk cache (or already resident in memory).
    FromCache,
    /// Origin returned 404; the placeholder image was substituted.
    Missing,
    /// Download or decode failed; no image available.
    Failed,
}

/// One drained completion, as seen by the consumer.
#[derive(Debug, Clone)]
pub struct MediaUpdate {
    pub hash: Md5Hash,
    pub kind: MediaKind,
    pub status: FetchStatus,
}

struct CompletedFetch {
    hash: Md5Hash,
    kind: MediaKind,
    status: FetchStatus,
    image: Option<Arc<DecodedImage>>,
}

struct FetchRequest {
    hash: Md5Hash,
    url: String,
    kind: MediaKind,
}

struct FetcherShared {
    thumbnails: Mutex<HashMap<Md5Hash, Arc<DecodedImage>>>,
    images: Mutex<HashMap<Md5Hash, Arc<DecodedImage>>>,
    /// Hashes with a fetch admitted but not yet drained by the consumer.
    in_flight: Mutex<HashSet<Md5Hash>>,
    /// Completions awaiting the consumer's drain.
    completed: Mutex<Vec<CompletedFetch>>,
    wake_tx: std_mpsc::Sender<()>,
}

impl FetcherShared {
    fn deliver(
        &self,
        hash: Md5Hash,
        kind: MediaKind,
        status: FetchStatus,
        image: Option<Arc<DecodedImage>>,
    ) {
        self.completed
            .lock()
            .expect("completed list lock poisoned")
            .push(CompletedFetch {
                hash,
                kind,
                status,
                image,
            });
        let _ = self.wake_tx.send(());
    }

    fn resident(&self, hash: Md5Hash, kind: MediaKind) -> Option<Arc<DecodedImage>> {
        let map = match kind {
            MediaKind::Thumbnail => &self.thumbnails,
            MediaKind::Image => &self.images,
        };
        map.lock().expect("image map lock poisoned").get(&hash).cloned()
    }
}

pub struct MediaFetcher {
    shared: Arc<FetcherShared>,
    admit_tx: Mutex<Option<mpsc::UnboundedSender<FetchRequest>>>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl MediaFetcher {
    /// Spawn the fetch reactor. The returned receiver is the wake signal the
    /// consumer blocks on before calling [`MediaFetcher::drain_completed`].
    pub fn new(cache: Arc<MediaCache>, pool_size: usize) -> (Self, std_mpsc::Receiver<()>) {
        Self::with_transport(cache, pool_size, Arc::new(HttpMediaTransport::new(pool_size)))
    }

    pub fn with_transport(
        cache: Arc<MediaCache>,
        pool_size: usize,
        transport: Arc<dyn MediaTransport>,
    ) -> (Self, std_mpsc::Receiver<()>) {
        let (wake_tx, wake_rx) = std_mpsc::channel();
        let shared = Arc::new(FetcherShared {
            thumbnails: Mutex::new(HashMap::new()),
            images: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            completed: Mutex::new(Vec::new()),
            wake_tx,
        });

        let (admit_tx, admit_rx) = mpsc::unbounded_channel();
        let reactor = Reactor {
            cache,
            transport,
            shared: Arc::clone(&shared),
            admit_rx,
            pool_size,
        };
        let worker = std::thread::Builder::new()
            .name("eddy-fetch".into())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("Failed to build fetch runtime");
                rt.block_on(reactor.run());
            })
            .expect("Failed to spawn fetch reactor thread");

        (
            Self {
                shared,
                admit_tx: Mutex::new(Some(admit_tx)),
                worker: Mutex::new(Some(worker)),
            },
            wake_rx,
        )
    }

    /// Ask for a piece of media, fire-and-forget.
    ///
    /// Requests for a hash already resident or already in flight are no-ops;
    /// the resident case signals completion immediately from current state.
    /// At most one network fetch per hash is ever in flight.
    pub fn request(&self, hash: Md5Hash, url: impl Into<String>, kind: MediaKind) {
        if let Some(image) = self.shared.resident(hash, kind) {
            self.shared
                .deliver(hash, kind, FetchStatus::FromCache, Some(image));
            return;
        }
        {
            let mut in_flight = self
                .shared
                .in_flight
                .lock()
                .expect("in-flight set lock poisoned");
            if !in_flight.insert(hash) {
                return;
            }
        }
        let sent = {
            let admit = self.admit_tx.lock().expect("admit queue lock poisoned");
            admit
                .as_ref()
                .map(|tx| {
                    tx.send(FetchRequest {
                        hash,
                        url: url.into(),
                        kind,
                    })
                    .is_ok()
                })
                .unwrap_or(false)
        };
        if !sent {
            warn!("fetch reactor is gone; dropping request");
            self.shared
                .in_flight
                .lock()
                .expect("in-flight set lock poisoned")
                .remove(&hash);
        }
    }

    /// Drain pending completions: publish decoded images into the readable
    /// maps, clear the in-flight marks, and report what changed. Called by
    /// the consumer after a wake signal.
    pub fn drain_completed(&self) -> Vec<MediaUpdate> {
        let completed: Vec<CompletedFetch> = std::mem::take(
            &mut *self
                .shared
                .completed
                .lock()
                .expect("completed list lock poisoned"),
        );
        let mut updates = Vec::with_capacity(completed.len());
        for done in completed {
            if let Some(image) = done.image {
                let map = match done.kind {
                    MediaKind::Thumbnail => &self.shared.thumbnails,
                    MediaKind::Image => &self.shared.images,
                };
                map.lock()
                    .expect("image map lock poisoned")
                    .insert(done.hash, image);
            }
            self.shared
                .in_flight
                .lock()
                .expect("in-flight set lock poisoned")
                .remove(&done.hash);
            updates.push(MediaUpdate {
                hash: done.hash,
                kind: done.kind,
                status: done.status,
            });
        }
        updates
    }

    pub fn thumbnail(&self, hash: Md5Hash) -> Option<Arc<DecodedImage>> {
        self.shared.resident(hash, MediaKind::Thumbnail)
    }

    pub fn image(&self, hash: Md5Hash) -> Option<Arc<DecodedImage>> {
        self.shared.resident(hash, MediaKind::Image)
    }

    /// Stop the reactor. Downloads already admitted to a connection are
    /// abandoned, not drained.
    pub fn shutdown(&self) {
        self.admit_tx
            .lock()
            .expect("admit queue lock poisoned")
            .take();
        if let Some(worker) = self.worker.lock().expect("worker lock poisoned").take() {
            let _ = worker.join();
        }
    }
}

impl Drop for MediaFetcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Reactor {
    cache: Arc<MediaCache>,
    transport: Arc<dyn MediaTransport>,
    shared: Arc<FetcherShared>,
    admit_rx: mpsc::UnboundedReceiver<FetchRequest>,
    pool_size: usize,
}

impl Reactor {
    async fn run(mut self) {
        let pool = Arc::new(Semaphore::new(self.pool_size));
        while let Some(request) = self.admit_rx.recv().await {
            let pool = Arc::clone(&pool);
            let cache = Arc::clone(&self.cache);
            let transport = Arc::clone(&self.transport);
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                let _handle = pool.acquire_owned().await.expect("connection pool closed");
                handle_request(&cache, transport.as_ref(), &shared, request).await;
            });
        }
        debug!("fetch reactor stopped");
    }
}

async fn handle_request(
    cache: &MediaCache,
    transport: &dyn MediaTransport,
    shared: &FetcherShared,
    request: FetchRequest,
) {
    // Cache first; any failure here silently falls through to the network.
    if let Some(image) = try_cache(cache, request.hash, request.kind).await {
        shared.deliver(
            request.hash,
            request.kind,
            FetchStatus::FromCache,
            Some(Arc::new(image)),
        );
        return;
    }

    let mut decoder = MediaDecoder::new();
    match transport.fetch(&request.url, &mut decoder).await {
        Ok(()) => match decoder.finish() {
            Ok((image, raw)) => {
                match request.kind {
                    MediaKind::Thumbnail => cache.write_thumb_async(request.hash, raw),
                    MediaKind::Image => {
                        cache.write_image_async(request.hash, ext_from_url(&request.url), raw)
                    }
                }
                shared.deliver(
                    request.hash,
                    request.kind,
                    FetchStatus::Fetched,
                    Some(Arc::new(image)),
                );
            }
            Err(e) => {
                warn!(url = %request.url, "media decode failed: {e}");
                shared.deliver(request.hash, request.kind, FetchStatus::Failed, None);
            }
        },
        Err(FetchError::NotFound) => {
            debug!(url = %request.url, "media gone from origin, substituting placeholder");
            shared.deliver(
                request.hash,
                request.kind,
                FetchStatus::Missing,
                Some(Arc::new(missing_placeholder())),
            );
        }
        Err(FetchError::Transport(e)) => {
            warn!(url = %request.url, "media fetch failed: {e}");
            shared.deliver(request.hash, request.kind, FetchStatus::Failed, None);
        }
    }
}

/// Ask the disk cache for the media and decode it; `None` on any miss or
/// defect, which sends the caller to the network instead.
async fn try_cache(cache: &MediaCache, hash: Md5Hash, kind: MediaKind) -> Option<DecodedImage> {
    let present = match kind {
        MediaKind::Thumbnail => cache.has_thumb(hash),
        MediaKind::Image => cache.has_image(hash),
    };
    if !present {
        return None;
    }

    let (tx, rx) = oneshot::channel();
    let callback = Box::new(move |decoder: Option<MediaDecoder>| {
        let _ = tx.send(decoder);
    });
    match kind {
        MediaKind::Thumbnail => cache.get_thumb_async(hash, callback),
        MediaKind::Image => cache.get_image_async(hash, callback),
    }

    let decoder = rx.await.ok().flatten()?;
    match decoder.finish() {
        Ok((image, _raw)) => Some(image),
        Err(e) => {
            warn!(%hash, "cached media failed to decode, re-fetching: {e}");
            None
        }
    }
}

fn ext_from_url(url: &str) -> String {
    let tail = url.rsplit('/').next().unwrap_or(url);
    match tail.rfind('.') {
        Some(idx) => tail[idx..].to_string(),
        None => ".bin".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn png_bytes() -> Vec<u8> {
        let img = image::RgbaImage::from_pixel(2, 2, image::Rgba([9, 9, 9, 255]));
        let mut out = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgba8(img)
            .write_to(&mut out, image::ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    /// Serves one canned body for every URL, counting physical fetches.
    struct CannedTransport {
        calls: AtomicUsize,
        delay: Duration,
        outcome: Result<Vec<u8>, ()>,
    }

    impl CannedTransport {
        fn ok(bytes: Vec<u8>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(0),
                outcome: Ok(bytes),
            }
        }

        fn not_found() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(0),
                outcome: Err(()),
            }
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl MediaTransport for CannedTransport {
        async fn fetch(&self, _url: &str, sink: &mut MediaDecoder) -> Result<(), FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            match &self.outcome {
                Ok(bytes) => {
                    for chunk in bytes.chunks(16) {
                        sink.push(chunk);
                    }
                    Ok(())
                }
                Err(()) => Err(FetchError::NotFound),
            }
        }
    }

    struct Rig {
        fetcher: MediaFetcher,
        cache: Arc<MediaCache>,
        wake_rx: std_mpsc::Receiver<()>,
        transport: Arc<CannedTransport>,
        // Dropped last so shutdown flushes land inside the temp dir.
        _dir: tempfile::TempDir,
    }

    fn rig(transport: CannedTransport) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MediaCache::open(dir.path(), crate::cache::FLUSH_PERIOD).unwrap());
        let transport = Arc::new(transport);
        let (fetcher, wake_rx) = MediaFetcher::with_transport(
            Arc::clone(&cache),
            CONNECTION_POOL_SIZE,
            Arc::clone(&transport) as Arc<dyn MediaTransport>,
        );
        Rig {
            fetcher,
            cache,
            wake_rx,
            transport,
            _dir: dir,
        }
    }

    fn await_updates(rig: &Rig, want: usize) -> Vec<MediaUpdate> {
        let mut updates = Vec::new();
        while updates.len() < want {
            rig.wake_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("timed out waiting for fetch completion");
            updates.extend(rig.fetcher.drain_completed());
        }
        updates
    }

    #[test]
    fn fetch_decodes_and_stores_in_cache() {
        let rig = rig(CannedTransport::ok(png_bytes()));
        let hash = Md5Hash::of(b"a");

        rig.fetcher
            .request(hash, "http://i.example.org/g/1.png", MediaKind::Image);
        let updates = await_updates(&rig, 1);

        assert_eq!(updates[0].status, FetchStatus::Fetched);
        assert_eq!(rig.fetcher.image(hash).unwrap().width, 2);

        // The raw side copy was handed to the cache.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !rig.cache.has_image(hash) {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(rig.cache.record(hash).unwrap().ext, ".png");
    }

    #[test]
    fn concurrent_requests_for_one_hash_fetch_once() {
        let rig = rig(CannedTransport::ok(png_bytes()).slow(Duration::from_millis(100)));
        let hash = Md5Hash::of(b"b");

        for _ in 0..5 {
            rig.fetcher
                .request(hash, "http://i.example.org/g/2.png", MediaKind::Thumbnail);
        }
        let updates = await_updates(&rig, 1);

        assert_eq!(updates.len(), 1);
        assert_eq!(rig.transport.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn resident_hash_completes_without_network() {
        let rig = rig(CannedTransport::ok(png_bytes()));
        let hash = Md5Hash::of(b"c");

        rig.fetcher
            .request(hash, "http://i.example.org/g/3.png", MediaKind::Thumbnail);
        await_updates(&rig, 1);
        assert_eq!(rig.transport.calls.load(Ordering::SeqCst), 1);

        rig.fetcher
            .request(hash, "http://i.example.org/g/3.png", MediaKind::Thumbnail);
        let updates = await_updates(&rig, 1);
        assert_eq!(updates[0].status, FetchStatus::FromCache);
        assert_eq!(rig.transport.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cached_thumbnail_never_hits_the_network() {
        let rig = rig(CannedTransport::ok(png_bytes()));
        let hash = Md5Hash::of(b"d");

        rig.cache.write_thumb_async(hash, png_bytes());
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !rig.cache.has_thumb(hash) {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }

        rig.fetcher
            .request(hash, "http://i.example.org/g/4.png", MediaKind::Thumbnail);
        let updates = await_updates(&rig, 1);

        assert_eq!(updates[0].status, FetchStatus::FromCache);
        assert_eq!(rig.transport.calls.load(Ordering::SeqCst), 0);
        assert!(rig.fetcher.thumbnail(hash).is_some());
    }

    #[test]
    fn corrupt_cached_bytes_fall_back_to_network() {
        let rig = rig(CannedTransport::ok(png_bytes()));
        let hash = Md5Hash::of(b"e");

        rig.cache.write_thumb_async(hash, b"not an image".to_vec());
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !rig.cache.has_thumb(hash) {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(10));
        }

        rig.fetcher
            .request(hash, "http://i.example.org/g/5.png", MediaKind::Thumbnail);
        let updates = await_updates(&rig, 1);

        assert_eq!(updates[0].status, FetchStatus::Fetched);
        assert_eq!(rig.transport.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn missing_media_substitutes_placeholder() {
        let rig = rig(CannedTransport::not_found());
        let hash = Md5Hash::of(b"f");

        rig.fetcher
            .request(hash, "http://i.example.org/g/6.png", MediaKind::Thumbnail);
        let updates = await_updates(&rig, 1);

        assert_eq!(updates[0].status, FetchStatus::Missing);
        let placeholder = rig.fetcher.thumbnail(hash).unwrap();
        assert_eq!(placeholder.width, missing_placeholder().width);
    }

    #[test]
    fn garbage_body_reports_failure_without_image() {
        let rig = rig(CannedTransport::ok(b"not an image at all".to_vec()));
        let hash = Md5Hash::of(b"g");

        rig.fetcher
            .request(hash, "http://i.example.org/g/7.png", MediaKind::Image);
        let updates = await_updates(&rig, 1);

        assert_eq!(updates[0].status, FetchStatus::Failed);
        assert!(rig.fetcher.image(hash).is_none());
    }

    #[test]
    fn try_cache_miss_short_circuits_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(MediaCache::open(dir.path(), crate::cache::FLUSH_PERIOD).unwrap());
        let result = tokio_test::block_on(try_cache(
            &cache,
            Md5Hash::of(b"absent"),
            MediaKind::Thumbnail,
        ));
        assert!(result.is_none());
    }

    #[test]
    fn ext_is_derived_from_the_url() {
        assert_eq!(ext_from_url("http://x/y/123.webm"), ".webm");
        assert_eq!(ext_from_url("http://x/y/123"), ".bin");
    }
}
