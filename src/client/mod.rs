//! Blocking board-API client.
//!
//! One client instance issues single fetches of a thread's posts or a board's
//! catalog. A global minimum spacing between physical requests is enforced by
//! sleeping the caller; the instance is deliberately non-reentrant.

pub mod wire;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::domain::{Post, Thread, ThreadSummary};

/// Minimum spacing between any two physical requests, regardless of endpoint.
///
/// The original client applied `< 1s` on the thread path but `== 0` on the
/// catalog path, which made the catalog path effectively unthrottled; this
/// implementation applies the one-second rule uniformly.
pub const MIN_REQUEST_GAP: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ApiError {
    /// The board or thread is gone (HTTP 404). Terminal for a thread.
    #[error("not found")]
    NotFound,
    /// Another fetch is already in progress on this client instance.
    /// Callers are expected to serialize access; hitting this is a bug.
    #[error("client busy: a fetch is already in progress")]
    Busy,
    /// Any other network or protocol failure. Logged and retried next cycle.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Minimal response surface the client needs from a transport.
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Seam between the client and the HTTP stack, so tests can substitute a
/// canned, call-counting transport.
pub trait HttpTransport: Send {
    fn get(&self, url: &str, if_modified_since: Option<&str>) -> Result<HttpResponse, ApiError>;
}

pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .gzip(true)
            .user_agent(concat!("eddy/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("Failed to build HTTP client");
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport for ReqwestTransport {
    fn get(&self, url: &str, if_modified_since: Option<&str>) -> Result<HttpResponse, ApiError> {
        use reqwest::header::IF_MODIFIED_SINCE;

        let mut request = self.client.get(url);
        if let Some(since) = if_modified_since {
            request = request.header(IF_MODIFIED_SINCE, since);
        }
        let response = request
            .send()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .map_err(|e| ApiError::Transport(e.to_string()))?
            .to_vec();
        Ok(HttpResponse { status, body })
    }
}

/// Blocking, rate-limited API client.
pub struct ApiClient {
    transport: Box<dyn HttpTransport>,
    api_base: String,
    last_request: Mutex<Option<Instant>>,
    busy: AtomicBool,
}

/// Clears the busy flag when a fetch finishes, success or failure.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ApiClient {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self::with_transport(api_base, Box::new(ReqwestTransport::new()))
    }

    pub fn with_transport(api_base: impl Into<String>, transport: Box<dyn HttpTransport>) -> Self {
        Self {
            transport,
            api_base: api_base.into(),
            last_request: Mutex::new(None),
            busy: AtomicBool::new(false),
        }
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Fetch the posts of a thread, conditionally.
    ///
    /// Sends the thread's newest-post time plus one second as an
    /// `If-Modified-Since` watermark; 304 and empty bodies are the valid
    /// "no changes" outcome.
    pub fn fetch_thread(&self, thread: &Thread) -> Result<Vec<Post>, ApiError> {
        let _guard = self.claim()?;
        self.throttle();

        let since = thread
            .last_post_at
            .map(|t| t + chrono::Duration::seconds(1))
            .map(http_date);
        let response = self.transport.get(&thread.url, since.as_deref())?;

        match response.status {
            404 => Err(ApiError::NotFound),
            304 => Ok(Vec::new()),
            200..=299 => {
                if response.body.is_empty() {
                    return Ok(Vec::new());
                }
                // The wire format is trusted local-to-server contract; a
                // malformed envelope is unrecoverable.
                let envelope: wire::ThreadEnvelope = serde_json::from_slice(&response.body)
                    .unwrap_or_else(|e| {
                        panic!("malformed thread envelope from {}: {e}", thread.url)
                    });
                debug!(url = %thread.url, posts = envelope.posts.len(), "fetched thread");
                Ok(envelope.posts.into_iter().map(Post::from).collect())
            }
            status => Err(ApiError::Transport(format!(
                "HTTP {status} for {}",
                thread.url
            ))),
        }
    }

    /// Fetch a board's catalog: the summaries of all active threads.
    pub fn fetch_catalog(&self, board: &str) -> Result<Vec<ThreadSummary>, ApiError> {
        let _guard = self.claim()?;
        self.throttle();

        let url = format!("{}/{}/threads.json", self.api_base, board);
        let response = self.transport.get(&url, None)?;

        match response.status {
            404 => Err(ApiError::NotFound),
            304 => Ok(Vec::new()),
            200..=299 => {
                if response.body.is_empty() {
                    return Ok(Vec::new());
                }
                let envelope: wire::CatalogEnvelope = serde_json::from_slice(&response.body)
                    .unwrap_or_else(|e| panic!("malformed catalog envelope from {url}: {e}"));
                debug!(url = %url, threads = envelope.threads.len(), "fetched catalog");
                Ok(envelope
                    .threads
                    .into_iter()
                    .map(|(id, summary)| summary.into_summary(id))
                    .collect())
            }
            status => Err(ApiError::Transport(format!("HTTP {status} for {url}"))),
        }
    }

    fn claim(&self) -> Result<BusyGuard<'_>, ApiError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Acquire)
            .is_err()
        {
            return Err(ApiError::Busy);
        }
        Ok(BusyGuard(&self.busy))
    }

    /// Sleep the caller until at least [`MIN_REQUEST_GAP`] has elapsed since
    /// the previous physical request, then advance the watermark.
    fn throttle(&self) {
        let mut last = self
            .last_request
            .lock()
            .expect("rate-limiter lock poisoned");
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < MIN_REQUEST_GAP {
                std::thread::sleep(MIN_REQUEST_GAP - elapsed);
            }
        }
        *last = Some(Instant::now());
    }
}

/// Format a timestamp as an HTTP date for `If-Modified-Since`.
fn http_date(t: DateTime<Utc>) -> String {
    t.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    struct CannedTransport {
        calls: Arc<AtomicUsize>,
        status: u16,
        body: &'static str,
        last_header: Mutex<Option<String>>,
    }

    impl CannedTransport {
        fn new(status: u16, body: &'static str) -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                status,
                body,
                last_header: Mutex::new(None),
            }
        }
    }

    impl HttpTransport for &'static CannedTransport {
        fn get(
            &self,
            _url: &str,
            if_modified_since: Option<&str>,
        ) -> Result<HttpResponse, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_header.lock().unwrap() = if_modified_since.map(String::from);
            Ok(HttpResponse {
                status: self.status,
                body: self.body.as_bytes().to_vec(),
            })
        }
    }

    fn leak(t: CannedTransport) -> &'static CannedTransport {
        Box::leak(Box::new(t))
    }

    fn thread() -> Thread {
        Thread::new("g", 1000, "https://a.example.org", StdDuration::from_secs(10))
    }

    const THREAD_BODY: &str = r#"{"posts":[
        {"no":1000,"time":1700000000,"name":"Anonymous","com":"first"},
        {"no":1001,"time":1700000060,"name":"Anonymous",
         "filename":"cat","ext":".jpg","tim":1700000060123,
         "fsize":4096,"w":800,"h":600,"tn_w":250,"tn_h":187,
         "md5":"mwSnJAH7IF2zM4VWIAadFA=="}
    ]}"#;

    #[test]
    fn fetch_thread_parses_posts_and_media() {
        let transport = leak(CannedTransport::new(200, THREAD_BODY));
        let client = ApiClient::with_transport("https://a.example.org", Box::new(transport));
        let posts = client.fetch_thread(&thread()).unwrap();
        assert_eq!(posts.len(), 2);
        assert_eq!(posts[0].id, 1000);
        assert!(posts[0].media.is_none());
        let media = posts[1].media.as_ref().unwrap();
        assert_eq!(media.renamed, "1700000060123");
        assert_eq!(media.ext, ".jpg");
        assert_eq!(media.size, 4096);
    }

    #[test]
    fn fetch_thread_maps_404_to_not_found() {
        let transport = leak(CannedTransport::new(404, ""));
        let client = ApiClient::with_transport("https://a.example.org", Box::new(transport));
        assert!(matches!(
            client.fetch_thread(&thread()),
            Err(ApiError::NotFound)
        ));
    }

    #[test]
    fn fetch_thread_treats_304_and_empty_as_no_changes() {
        let transport = leak(CannedTransport::new(304, ""));
        let client = ApiClient::with_transport("https://a.example.org", Box::new(transport));
        assert!(client.fetch_thread(&thread()).unwrap().is_empty());

        let transport = leak(CannedTransport::new(200, ""));
        let client = ApiClient::with_transport("https://a.example.org", Box::new(transport));
        assert!(client.fetch_thread(&thread()).unwrap().is_empty());
    }

    #[test]
    fn fetch_thread_sends_watermark_plus_one_second() {
        use chrono::TimeZone;

        let transport = leak(CannedTransport::new(304, ""));
        let client = ApiClient::with_transport("https://a.example.org", Box::new(transport));

        let mut t = thread();
        t.last_post_at = Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap());
        client.fetch_thread(&t).unwrap();

        let header = transport.last_header.lock().unwrap().clone().unwrap();
        // 1700000000 is Tue, 14 Nov 2023 22:13:20 GMT; watermark adds 1s.
        assert_eq!(header, "Tue, 14 Nov 2023 22:13:21 GMT");
    }

    #[test]
    fn fetch_catalog_parses_summary_map() {
        let body = r#"{"threads":{
            "1000":{"last_modified":1700000100,"replies":12,"images":3,"sub":"daily"},
            "2000":{"last_modified":1700000200,"replies":5,"images":1}
        }}"#;
        let transport = leak(CannedTransport::new(200, body));
        let client = ApiClient::with_transport("https://a.example.org", Box::new(transport));
        let mut summaries = client.fetch_catalog("g").unwrap();
        summaries.sort_by_key(|s| s.id);
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].id, 1000);
        assert_eq!(summaries[0].replies, 12);
        assert_eq!(summaries[0].subject.as_deref(), Some("daily"));
        assert_eq!(summaries[1].id, 2000);
    }

    #[test]
    fn second_rapid_request_blocks_for_the_gap() {
        let transport = leak(CannedTransport::new(304, ""));
        let client = ApiClient::with_transport("https://a.example.org", Box::new(transport));

        let t = thread();
        let start = Instant::now();
        client.fetch_thread(&t).unwrap();
        client.fetch_thread(&t).unwrap();
        let elapsed = start.elapsed();

        assert!(
            elapsed >= MIN_REQUEST_GAP,
            "expected the second call to block until the 1s gap elapsed, took {elapsed:?}"
        );
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn rate_limit_applies_across_endpoints() {
        let transport = leak(CannedTransport::new(304, ""));
        let client = ApiClient::with_transport("https://a.example.org", Box::new(transport));

        let start = Instant::now();
        client.fetch_catalog("g").unwrap();
        client.fetch_thread(&thread()).unwrap();
        assert!(start.elapsed() >= MIN_REQUEST_GAP);
    }
}
