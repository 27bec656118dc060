use std::sync::{mpsc, Arc};

use crate::app::error::Result;
use crate::cache::MediaCache;
use crate::client::ApiClient;
use crate::config::Config;
use crate::fetcher::MediaFetcher;
use crate::poller::{PollerEvent, PollingManager};

/// Wires together all services with explicit ownership: the context is built
/// once at startup and everything else borrows from it. There are no
/// globals; tests build contexts against temp directories and fakes.
pub struct AppContext {
    pub config: Config,
    pub cache: Arc<MediaCache>,
    pub fetcher: MediaFetcher,
    /// Wake signal: media completions are ready to drain.
    pub media_events: mpsc::Receiver<()>,
    pub poller: PollingManager,
    /// Wake signal: a pull queue has updated thread/board ids.
    pub poller_events: mpsc::Receiver<PollerEvent>,
}

impl AppContext {
    pub fn new(config: Config) -> Result<Self> {
        let cache_dir = config.cache_dir()?;
        let cache = Arc::new(MediaCache::open(cache_dir, config.flush_period())?);

        let (fetcher, media_events) =
            MediaFetcher::new(Arc::clone(&cache), config.media_connections);

        let client = ApiClient::new(config.api_base_url.clone());
        let (poller, poller_events) = PollingManager::new(client, config.poll_policy());

        Ok(Self {
            config,
            cache,
            fetcher,
            media_events,
            poller,
            poller_events,
        })
    }

    /// Stop every reactor in dependency order; the cache goes last so its
    /// final flush sees all writes the fetcher managed to enqueue.
    pub fn shutdown(&self) {
        self.poller.shutdown();
        self.fetcher.shutdown();
        self.cache.shutdown();
    }
}
