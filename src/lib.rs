//! # eddy
//!
//! A headless imageboard thread watcher: polls a board API for new posts in
//! monitored threads and board catalogs, and fetches and caches the media
//! those posts reference.
//!
//! ## Architecture
//!
//! ```text
//! Polling Manager → API Client → Posts/Summaries → consumer
//! consumer → Media Fetcher → Disk Cache ⇄ network
//! ```
//!
//! Four long-lived reactor threads do the work: a thread poller and a
//! catalog poller (sharing one rate-limited, blocking API client behind a
//! mutex), the media-fetch reactor (a small pool of reusable connections
//! multiplexing many downloads), and the disk-cache reactor (async read and
//! write queues plus a periodic index flush). The consumer thread only ever
//! enqueues work and drains completion queues; it never blocks on network
//! or disk I/O.
//!
//! ## Modules
//!
//! - [`app`]: Application context and error types
//! - [`cli`]: Command-line interface definitions
//! - [`config`]: TOML configuration loading
//! - [`domain`]: Core domain models (Post, Thread, ThreadSummary, Md5Hash)
//! - [`client`]: Blocking, rate-limited board-API client
//! - [`fetcher`]: Connection-multiplexed media fetcher
//! - [`cache`]: Content-addressed disk cache with snapshot persistence
//! - [`poller`]: Adaptive thread and catalog polling

pub mod app;

/// Content-addressed media cache.
///
/// Bytes land under `<shard>/<hash>`; the index of [`cache::record::MediaRecord`]s
/// is flushed to a versioned binary snapshot every five minutes and merged
/// back together at startup.
pub mod cache;

/// Command-line interface using clap.
pub mod cli;

/// Blocking board-API client with a global one-request-per-second limit and
/// typed NotFound/Busy/Transport failures.
pub mod client;

/// Configuration management.
///
/// Loads `~/.config/eddy/config.toml`, creating a commented default on
/// first run.
pub mod config;

/// Core domain models: plain immutable value types.
pub mod domain;

/// Asynchronous media fetcher: per-hash deduplicated downloads over a small
/// connection pool, streaming into an incremental decoder, falling back to
/// the network when cached bytes are corrupt.
pub mod fetcher;

/// Polling manager: two poller threads with adaptive per-thread intervals.
pub mod poller;
