//! Polling manager: keeps monitored threads and board catalogs fresh.
//!
//! Two independent poller threads share one rate-limited API client behind a
//! mutex. The thread poller adapts each thread's interval to its activity;
//! the catalog poller refreshes every monitored board on each trigger.
//! Consumers learn about changes through a wake event per category plus
//! pull-based "what changed" queues.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::client::{ApiClient, ApiError};
use crate::domain::{BoardCatalog, Thread, ThreadKey};

/// Interval a thread starts at and snaps back to whenever it shows activity.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(10);
/// Upper bound a quiet thread's interval may grow to.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Largest single random increment added after a quiet poll.
pub const MAX_BACKOFF_STEP: Duration = Duration::from_secs(13);
/// How often boards' catalogs are refreshed without a manual trigger.
pub const CATALOG_POLL_PERIOD: Duration = Duration::from_secs(30);

/// How often the thread poller wakes to look for due threads.
const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct PollPolicy {
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub backoff_step: Duration,
    pub catalog_period: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            min_interval: MIN_POLL_INTERVAL,
            max_interval: MAX_POLL_INTERVAL,
            backoff_step: MAX_BACKOFF_STEP,
            catalog_period: CATALOG_POLL_PERIOD,
        }
    }
}

/// Wake signal telling the consumer that a pull queue has something for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerEvent {
    ThreadsUpdated,
    CatalogsUpdated,
}

enum PollCommand {
    Poll,
    Shutdown,
}

struct SharedState {
    client: Mutex<ApiClient>,
    threads: Mutex<BTreeMap<ThreadKey, Thread>>,
    catalog_boards: Mutex<BTreeSet<String>>,
    catalogs: Mutex<HashMap<String, BoardCatalog>>,
    updated_threads: Mutex<VecDeque<ThreadKey>>,
    updated_boards: Mutex<VecDeque<String>>,
    events_tx: std_mpsc::Sender<PollerEvent>,
    policy: PollPolicy,
}

impl SharedState {
    fn report_thread_updated(&self, key: ThreadKey) {
        let mut queue = self
            .updated_threads
            .lock()
            .expect("updated-threads queue lock poisoned");
        if !queue.contains(&key) {
            queue.push_back(key);
        }
        drop(queue);
        let _ = self.events_tx.send(PollerEvent::ThreadsUpdated);
    }

    fn report_board_updated(&self, board: String) {
        let mut queue = self
            .updated_boards
            .lock()
            .expect("updated-boards queue lock poisoned");
        if !queue.contains(&board) {
            queue.push_back(board);
        }
        drop(queue);
        let _ = self.events_tx.send(PollerEvent::CatalogsUpdated);
    }
}

pub struct PollingManager {
    api_base: String,
    shared: Arc<SharedState>,
    thread_ctl: std_mpsc::Sender<PollCommand>,
    catalog_ctl: std_mpsc::Sender<PollCommand>,
    workers: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl PollingManager {
    /// Spawn both pollers. The returned receiver carries the per-category
    /// update-available events.
    pub fn new(client: ApiClient, policy: PollPolicy) -> (Self, std_mpsc::Receiver<PollerEvent>) {
        let api_base = client.api_base().to_string();
        let (events_tx, events_rx) = std_mpsc::channel();
        let shared = Arc::new(SharedState {
            client: Mutex::new(client),
            threads: Mutex::new(BTreeMap::new()),
            catalog_boards: Mutex::new(BTreeSet::new()),
            catalogs: Mutex::new(HashMap::new()),
            updated_threads: Mutex::new(VecDeque::new()),
            updated_boards: Mutex::new(VecDeque::new()),
            events_tx,
            policy,
        });

        let (thread_ctl, thread_ctl_rx) = std_mpsc::channel();
        let (catalog_ctl, catalog_ctl_rx) = std_mpsc::channel();

        let thread_shared = Arc::clone(&shared);
        let thread_worker = std::thread::Builder::new()
            .name("eddy-thread-poll".into())
            .spawn(move || thread_poller(thread_shared, thread_ctl_rx))
            .expect("Failed to spawn thread poller");

        let catalog_shared = Arc::clone(&shared);
        let catalog_worker = std::thread::Builder::new()
            .name("eddy-catalog-poll".into())
            .spawn(move || catalog_poller(catalog_shared, catalog_ctl_rx))
            .expect("Failed to spawn catalog poller");

        (
            Self {
                api_base,
                shared,
                thread_ctl,
                catalog_ctl,
                workers: Mutex::new(vec![thread_worker, catalog_worker]),
            },
            events_rx,
        )
    }

    /// Start monitoring a thread. No-op if it is already monitored.
    pub fn add_thread(&self, board: &str, id: u64) {
        let thread = Thread::new(board, id, &self.api_base, self.shared.policy.min_interval);
        let key = thread.key();
        let mut threads = self.lock_threads();
        threads.entry(key.clone()).or_insert(thread);
        debug!(%key, "monitoring thread");
    }

    pub fn remove_thread(&self, key: &ThreadKey) {
        self.lock_threads().remove(key);
    }

    pub fn add_catalog_board(&self, board: &str) {
        self.shared
            .catalog_boards
            .lock()
            .expect("catalog board set lock poisoned")
            .insert(board.to_string());
    }

    pub fn remove_catalog_board(&self, board: &str) {
        self.shared
            .catalog_boards
            .lock()
            .expect("catalog board set lock poisoned")
            .remove(board);
        self.shared
            .catalogs
            .lock()
            .expect("catalog map lock poisoned")
            .remove(board);
    }

    /// Trigger a thread poll cycle now instead of waiting for the tick.
    pub fn update_threads(&self) {
        let _ = self.thread_ctl.send(PollCommand::Poll);
    }

    /// Trigger a catalog poll cycle now instead of waiting for the period.
    pub fn update_catalogs(&self) {
        let _ = self.catalog_ctl.send(PollCommand::Poll);
    }

    /// Next thread with unseen changes, if any.
    pub fn pop_updated_thread(&self) -> Option<ThreadKey> {
        self.shared
            .updated_threads
            .lock()
            .expect("updated-threads queue lock poisoned")
            .pop_front()
    }

    /// Next board whose catalog changed, if any.
    pub fn pop_updated_catalog_board(&self) -> Option<String> {
        self.shared
            .updated_boards
            .lock()
            .expect("updated-boards queue lock poisoned")
            .pop_front()
    }

    /// Immutable copy of a monitored thread for the consumer.
    pub fn thread_snapshot(&self, key: &ThreadKey) -> Option<Thread> {
        self.lock_threads().get(key).cloned()
    }

    pub fn monitored_threads(&self) -> Vec<ThreadKey> {
        self.lock_threads().keys().cloned().collect()
    }

    pub fn catalog_snapshot(&self, board: &str) -> Option<BoardCatalog> {
        self.shared
            .catalogs
            .lock()
            .expect("catalog map lock poisoned")
            .get(board)
            .cloned()
    }

    /// Stop both pollers. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.thread_ctl.send(PollCommand::Shutdown);
        let _ = self.catalog_ctl.send(PollCommand::Shutdown);
        let mut workers = self.workers.lock().expect("worker list lock poisoned");
        for worker in workers.drain(..) {
            let _ = worker.join();
        }
    }

    fn lock_threads(&self) -> std::sync::MutexGuard<'_, BTreeMap<ThreadKey, Thread>> {
        self.shared
            .threads
            .lock()
            .expect("thread map lock poisoned")
    }
}

impl Drop for PollingManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn thread_poller(shared: Arc<SharedState>, ctl_rx: std_mpsc::Receiver<PollCommand>) {
    loop {
        match ctl_rx.recv_timeout(TICK) {
            Ok(PollCommand::Poll) | Err(std_mpsc::RecvTimeoutError::Timeout) => {
                poll_due_threads(&shared);
            }
            Ok(PollCommand::Shutdown) | Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("thread poller stopped");
}

fn poll_due_threads(shared: &SharedState) {
    let now = Utc::now();
    let due: Vec<Thread> = {
        let threads = shared.threads.lock().expect("thread map lock poisoned");
        threads
            .values()
            .filter(|t| !t.gone && t.is_due(now))
            .cloned()
            .collect()
    };

    for snapshot in due {
        let key = snapshot.key();
        // The client's own Busy guard stays unreachable as long as every
        // fetch goes through this mutex.
        let result = {
            let client = shared.client.lock().expect("api client lock poisoned");
            client.fetch_thread(&snapshot)
        };

        match result {
            Ok(posts) => {
                let mut threads = shared.threads.lock().expect("thread map lock poisoned");
                // Unsubscribed while the fetch was out.
                let Some(thread) = threads.get_mut(&key) else {
                    continue;
                };
                thread.last_checked_at = Some(Utc::now());
                let changed = thread.absorb(posts);
                if changed > 0 {
                    thread.interval = shared.policy.min_interval;
                    debug!(%key, changed, "thread has new posts");
                    drop(threads);
                    shared.report_thread_updated(key);
                } else {
                    thread.interval = grow_interval(
                        thread.interval,
                        shared.policy.backoff_step,
                        shared.policy.max_interval,
                    );
                }
            }
            Err(ApiError::NotFound) => {
                let removed = {
                    let mut threads =
                        shared.threads.lock().expect("thread map lock poisoned");
                    threads.remove(&key)
                };
                if removed.is_some() {
                    info!(%key, "thread is gone (404), dropping from watch");
                    shared.report_thread_updated(key);
                }
            }
            Err(ApiError::Busy) => {
                error!(%key, "api client busy during thread poll; locking bug");
            }
            Err(ApiError::Transport(e)) => {
                warn!(%key, "thread poll failed, will retry next cycle: {e}");
                let mut threads = shared.threads.lock().expect("thread map lock poisoned");
                if let Some(thread) = threads.get_mut(&key) {
                    // Interval untouched; just push the next attempt out one
                    // cycle instead of hot-looping on the error.
                    thread.last_checked_at = Some(Utc::now());
                }
            }
        }
    }
}

/// Quiet poll: grow by a bounded random increment, capped at the maximum.
fn grow_interval(current: Duration, step: Duration, max: Duration) -> Duration {
    let jitter = rand::rng().random_range(0..=step.as_secs());
    (current + Duration::from_secs(jitter)).min(max)
}

fn catalog_poller(shared: Arc<SharedState>, ctl_rx: std_mpsc::Receiver<PollCommand>) {
    loop {
        match ctl_rx.recv_timeout(shared.policy.catalog_period) {
            Ok(PollCommand::Poll) | Err(std_mpsc::RecvTimeoutError::Timeout) => {
                poll_catalogs(&shared);
            }
            Ok(PollCommand::Shutdown) | Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("catalog poller stopped");
}

fn poll_catalogs(shared: &SharedState) {
    let boards: Vec<String> = {
        let set = shared
            .catalog_boards
            .lock()
            .expect("catalog board set lock poisoned");
        set.iter().cloned().collect()
    };

    for board in boards {
        let result = {
            let client = shared.client.lock().expect("api client lock poisoned");
            client.fetch_catalog(&board)
        };
        match result {
            Ok(summaries) => {
                let catalog = BoardCatalog::new(board.clone(), summaries);
                shared
                    .catalogs
                    .lock()
                    .expect("catalog map lock poisoned")
                    .insert(board.clone(), catalog);
                shared.report_board_updated(board);
            }
            Err(ApiError::NotFound) => {
                warn!(board, "catalog endpoint reports board gone");
            }
            Err(ApiError::Busy) => {
                error!(board, "api client busy during catalog poll; locking bug");
            }
            Err(ApiError::Transport(e)) => {
                warn!(board, "catalog poll failed, will retry next cycle: {e}");
            }
        }
    }
}
