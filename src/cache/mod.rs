//! Persistent, content-addressed media cache.
//!
//! Media bytes live on disk under a two-character shard directory derived
//! from the content hash; the in-memory index of [`MediaRecord`]s is
//! periodically flushed to a versioned binary snapshot and reloaded (and
//! merged) at startup. All disk I/O happens on a dedicated reactor thread;
//! callers only enqueue work and, for reads, receive a callback.

pub mod record;
pub mod snapshot;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::domain::{Md5Hash, Post};
use crate::fetcher::decode::MediaDecoder;
use record::MediaRecord;
use snapshot::SnapshotError;

/// Which of the two stored representations of a piece of media is meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Thumbnail,
    Image,
}

/// Default period between snapshot flushes.
pub const FLUSH_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Aggregate view of the index for status displays.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub records: usize,
    pub thumbs: usize,
    pub images: usize,
    pub image_bytes: u64,
}

const PRIMARY_SNAPSHOT: &str = "index.snap";
/// Written by external tooling (offline history merges), only ever read here.
const MERGE_SNAPSHOT: &str = "index.merge.snap";

type ReadCallback = Box<dyn FnOnce(Option<MediaDecoder>) + Send + 'static>;

struct WriteJob {
    hash: Md5Hash,
    kind: MediaKind,
    /// Extension for the full image; ignored for thumbnails.
    ext: String,
    bytes: Vec<u8>,
}

struct ReadJob {
    hash: Md5Hash,
    kind: MediaKind,
    callback: ReadCallback,
}

enum Control {
    Flush(std_mpsc::Sender<()>),
    Shutdown(std_mpsc::Sender<()>),
}

pub struct MediaCache {
    root: PathBuf,
    index: Arc<Mutex<HashMap<Md5Hash, MediaRecord>>>,
    write_tx: mpsc::UnboundedSender<WriteJob>,
    read_tx: mpsc::UnboundedSender<ReadJob>,
    control_tx: mpsc::UnboundedSender<Control>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl MediaCache {
    /// Open the cache at `root`, loading and merging every snapshot present.
    ///
    /// A structurally defective snapshot is fatal: the file is trusted local
    /// state and corruption must not be papered over.
    pub fn open(root: impl Into<PathBuf>, flush_period: Duration) -> Result<Self, SnapshotError> {
        let root = root.into();
        let mut index = HashMap::new();
        for name in [PRIMARY_SNAPSHOT, MERGE_SNAPSHOT] {
            let path = root.join(name);
            if let Some(records) = snapshot::load(&path)? {
                info!(path = %path.display(), records = records.len(), "loaded cache snapshot");
                for record in records {
                    match index.entry(record.hash) {
                        std::collections::hash_map::Entry::Occupied(mut e) => {
                            let existing: &mut MediaRecord = e.get_mut();
                            existing.merge(&record);
                        }
                        std::collections::hash_map::Entry::Vacant(e) => {
                            e.insert(record);
                        }
                    }
                }
            }
        }

        let index = Arc::new(Mutex::new(index));
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let reactor = Reactor {
            root: root.clone(),
            index: Arc::clone(&index),
            write_rx,
            read_rx,
            control_rx,
            flush_period,
        };
        let worker = std::thread::Builder::new()
            .name("eddy-cache".into())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("Failed to build cache runtime");
                rt.block_on(reactor.run());
            })
            .expect("Failed to spawn cache reactor thread");

        Ok(Self {
            root,
            index,
            write_tx,
            read_tx,
            control_tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn has_thumb(&self, hash: Md5Hash) -> bool {
        self.lock_index()
            .get(&hash)
            .is_some_and(|r| r.has_thumb)
    }

    pub fn has_image(&self, hash: Md5Hash) -> bool {
        self.lock_index()
            .get(&hash)
            .is_some_and(|r| r.has_image)
    }

    pub fn record(&self, hash: Md5Hash) -> Option<MediaRecord> {
        self.lock_index().get(&hash).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock_index().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_index().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.lock_index();
        let mut stats = CacheStats {
            records: index.len(),
            ..CacheStats::default()
        };
        for record in index.values() {
            if record.has_thumb {
                stats.thumbs += 1;
            }
            if record.has_image {
                stats.images += 1;
                stats.image_bytes += record.size;
            }
        }
        stats
    }

    /// Accumulate metadata from a post whose media this cache tracks (or
    /// should start tracking).
    pub fn note_post(&self, board: &str, post: &Post) {
        let Some(media) = post.media.as_ref() else {
            return;
        };
        let mut index = self.lock_index();
        let record = index
            .entry(media.hash)
            .or_insert_with(|| MediaRecord::new(media.hash, media.size, media.ext.clone()));
        record.note_post(board, post);
    }

    pub fn write_thumb_async(&self, hash: Md5Hash, bytes: Vec<u8>) {
        self.enqueue_write(WriteJob {
            hash,
            kind: MediaKind::Thumbnail,
            ext: String::new(),
            bytes,
        });
    }

    pub fn write_image_async(&self, hash: Md5Hash, ext: impl Into<String>, bytes: Vec<u8>) {
        self.enqueue_write(WriteJob {
            hash,
            kind: MediaKind::Image,
            ext: ext.into(),
            bytes,
        });
    }

    /// Enqueue a thumbnail read. The callback is invoked exactly once, with
    /// `None` meaning "not available, re-fetch" — never an error.
    pub fn get_thumb_async(&self, hash: Md5Hash, callback: ReadCallback) {
        self.enqueue_read(hash, MediaKind::Thumbnail, callback);
    }

    pub fn get_image_async(&self, hash: Md5Hash, callback: ReadCallback) {
        self.enqueue_read(hash, MediaKind::Image, callback);
    }

    /// Write the index snapshot now and wait for it to hit disk.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = std_mpsc::channel();
        if self.control_tx.send(Control::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    /// Flush and stop the reactor thread. Idempotent.
    pub fn shutdown(&self) {
        let (ack_tx, ack_rx) = std_mpsc::channel();
        if self.control_tx.send(Control::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
        if let Some(worker) = self.lock_worker().take() {
            let _ = worker.join();
        }
    }

    fn enqueue_write(&self, job: WriteJob) {
        if self.write_tx.send(job).is_err() {
            warn!("cache reactor is gone; dropping write");
        }
    }

    fn enqueue_read(&self, hash: Md5Hash, kind: MediaKind, callback: ReadCallback) {
        if self
            .read_tx
            .send(ReadJob {
                hash,
                kind,
                callback,
            })
            .is_err()
        {
            warn!("cache reactor is gone; answering read with None");
        }
    }

    fn lock_index(&self) -> std::sync::MutexGuard<'_, HashMap<Md5Hash, MediaRecord>> {
        self.index.lock().expect("cache index lock poisoned")
    }

    fn lock_worker(
        &self,
    ) -> std::sync::MutexGuard<'_, Option<std::thread::JoinHandle<()>>> {
        self.worker.lock().expect("cache worker lock poisoned")
    }
}

impl Drop for MediaCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Path of the full image file for a record: `<shard>/<hex><ext>`.
fn image_path(root: &Path, hash: Md5Hash, ext: &str) -> PathBuf {
    root.join(hash.shard()).join(format!("{}{}", hash.to_hex(), ext))
}

/// Path of the thumbnail: `<shard>/<hex>s.jpg`, mirroring the origin's
/// naming so the extension never collides with a full `.jpg` image.
fn thumb_path(root: &Path, hash: Md5Hash) -> PathBuf {
    root.join(hash.shard()).join(format!("{}s.jpg", hash.to_hex()))
}

struct Reactor {
    root: PathBuf,
    index: Arc<Mutex<HashMap<Md5Hash, MediaRecord>>>,
    write_rx: mpsc::UnboundedReceiver<WriteJob>,
    read_rx: mpsc::UnboundedReceiver<ReadJob>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    flush_period: Duration,
}

impl Reactor {
    async fn run(mut self) {
        let mut flush_timer = tokio::time::interval(self.flush_period);
        flush_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        flush_timer.tick().await; // Skip the first immediate tick

        loop {
            tokio::select! {
                job = self.write_rx.recv() => match job {
                    Some(job) => self.handle_write(job).await,
                    None => break,
                },
                job = self.read_rx.recv() => match job {
                    Some(job) => self.handle_read(job).await,
                    None => break,
                },
                _ = flush_timer.tick() => self.flush_index(),
                control = self.control_rx.recv() => match control {
                    Some(Control::Flush(ack)) => {
                        self.flush_index();
                        let _ = ack.send(());
                    }
                    Some(Control::Shutdown(ack)) => {
                        self.flush_index();
                        let _ = ack.send(());
                        break;
                    }
                    None => break,
                },
            }
        }
        debug!("cache reactor stopped");
    }

    async fn handle_write(&self, job: WriteJob) {
        let path = match job.kind {
            MediaKind::Thumbnail => thumb_path(&self.root, job.hash),
            MediaKind::Image => image_path(&self.root, job.hash, &job.ext),
        };
        if let Some(parent) = path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                error!(path = %parent.display(), "failed to create shard dir: {e}");
                return;
            }
        }
        if let Err(e) = tokio::fs::write(&path, &job.bytes).await {
            error!(path = %path.display(), "failed to write media: {e}");
            return;
        }

        let mut index = self.index.lock().expect("cache index lock poisoned");
        let record = index.entry(job.hash).or_insert_with(|| {
            MediaRecord::new(job.hash, job.bytes.len() as u64, job.ext.clone())
        });
        match job.kind {
            MediaKind::Thumbnail => record.has_thumb = true,
            MediaKind::Image => {
                record.has_image = true;
                if record.ext.is_empty() {
                    record.ext = job.ext;
                }
            }
        }
    }

    async fn handle_read(&self, job: ReadJob) {
        let path = {
            let index = self.index.lock().expect("cache index lock poisoned");
            match (job.kind, index.get(&job.hash)) {
                (MediaKind::Thumbnail, Some(r)) if r.has_thumb => {
                    Some(thumb_path(&self.root, job.hash))
                }
                (MediaKind::Image, Some(r)) if r.has_image => {
                    Some(image_path(&self.root, job.hash, &r.ext))
                }
                _ => None,
            }
        };
        let Some(path) = path else {
            (job.callback)(None);
            return;
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => (job.callback)(Some(MediaDecoder::with_bytes(bytes))),
            Err(e) => {
                warn!(path = %path.display(), "cache read failed, caller will re-fetch: {e}");
                (job.callback)(None);
            }
        }
    }

    fn flush_index(&self) {
        let records: Vec<MediaRecord> = {
            let index = self.index.lock().expect("cache index lock poisoned");
            index.values().cloned().collect()
        };
        let path = self.root.join(PRIMARY_SNAPSHOT);
        match snapshot::write_atomic(&path, records.iter()) {
            Ok(()) => debug!(records = records.len(), "flushed cache snapshot"),
            Err(e) => error!(path = %path.display(), "snapshot flush failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for cache");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn open(dir: &Path) -> MediaCache {
        MediaCache::open(dir, FLUSH_PERIOD).unwrap()
    }

    #[test]
    fn write_sets_presence_and_lands_in_shard_dir() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path());
        let hash = Md5Hash::of(b"payload");

        cache.write_image_async(hash, ".png", b"payload".to_vec());
        wait_until(|| cache.has_image(hash));

        assert!(!cache.has_thumb(hash));
        let expected = dir
            .path()
            .join(hash.shard())
            .join(format!("{}.png", hash.to_hex()));
        assert_eq!(std::fs::read(expected).unwrap(), b"payload");
    }

    #[test]
    fn read_returns_decoder_with_written_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path());
        let hash = Md5Hash::of(b"thumb");

        cache.write_thumb_async(hash, b"thumb-bytes".to_vec());
        wait_until(|| cache.has_thumb(hash));

        let (tx, rx) = std_mpsc::channel();
        cache.get_thumb_async(
            hash,
            Box::new(move |decoder| {
                tx.send(decoder.map(|d| d.bytes().to_vec())).unwrap();
            }),
        );
        let bytes = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(bytes.as_deref(), Some(&b"thumb-bytes"[..]));
    }

    #[test]
    fn read_of_absent_media_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path());

        let (tx, rx) = std_mpsc::channel();
        cache.get_image_async(
            Md5Hash::of(b"never written"),
            Box::new(move |decoder| {
                tx.send(decoder.is_none()).unwrap();
            }),
        );
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn flush_and_reopen_preserves_index() {
        let dir = tempfile::tempdir().unwrap();
        let hash = Md5Hash::of(b"persisted");
        {
            let cache = open(dir.path());
            cache.write_image_async(hash, ".gif", b"persisted".to_vec());
            wait_until(|| cache.has_image(hash));
            cache.shutdown(); // flushes
        }
        let reopened = open(dir.path());
        assert!(reopened.has_image(hash));
        assert_eq!(reopened.record(hash).unwrap().ext, ".gif");
    }

    #[test]
    fn reload_merges_rather_than_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let hash = Md5Hash::of(b"merged");

        // A foreign merge snapshot with disjoint metadata for the same hash.
        let mut foreign = MediaRecord::new(hash, 10, ".png");
        foreign.boards.insert("tv".into());
        foreign.has_image = true;
        snapshot::write_atomic(&dir.path().join(MERGE_SNAPSHOT), [&foreign].into_iter()).unwrap();

        // A primary snapshot from a previous run.
        let mut own = MediaRecord::new(hash, 10, ".png");
        own.boards.insert("g".into());
        own.has_thumb = true;
        snapshot::write_atomic(&dir.path().join(PRIMARY_SNAPSHOT), [&own].into_iter()).unwrap();

        let cache = open(dir.path());
        let record = cache.record(hash).unwrap();
        assert!(record.boards.contains("g") && record.boards.contains("tv"));
        assert!(record.has_thumb && record.has_image);
    }

    #[test]
    fn corrupt_snapshot_is_fatal_at_open() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PRIMARY_SNAPSHOT), b"\x01\x00\x00\x00garbage").unwrap();
        assert!(MediaCache::open(dir.path(), FLUSH_PERIOD).is_err());
    }

    #[test]
    fn note_post_accumulates_metadata() {
        use chrono::TimeZone;

        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path());
        let hash = Md5Hash::of(b"noted");
        let post = Post {
            id: 1,
            time: chrono::Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            author: "Anonymous".into(),
            subject: None,
            comment: None,
            sticky: false,
            closed: false,
            deleted: false,
            media: Some(crate::domain::MediaInfo {
                renamed: "123".into(),
                original_name: "cat.png".into(),
                ext: ".png".into(),
                size: 99,
                width: 1,
                height: 1,
                thumb_width: 1,
                thumb_height: 1,
                spoiler: true,
                hash,
            }),
        };

        cache.note_post("g", &post);
        let record = cache.record(hash).unwrap();
        assert!(record.boards.contains("g"));
        assert!(record.filenames.contains("cat.png"));
        assert!(record.dates.contains(&1_700_000_000));
        assert_eq!(record.spoiler_count, 1);
        assert!(!record.has_thumb && !record.has_image);
    }
}
