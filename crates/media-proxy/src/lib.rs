//! Media retrieval proxy: fetches remote media bytes with a bounded retry
//! schedule and serves repeat requests from a time-boxed in-memory cache.
//!
//! Callers always receive a typed result; upstream failures degrade to
//! [`MediaFetchError`] values the presentation layer can turn into a
//! placeholder instead of crashing.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use chat_core::RetryPolicy;
use thiserror::Error;
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default cadence for the background sweep task.
pub const DEFAULT_SWEEP_PERIOD: Duration = Duration::from_secs(60 * 60);

/// Typed failure returned to callers when a fetch cannot be satisfied.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaFetchError {
    /// The upstream did not answer within the fetch timeout. Not retried.
    #[error("upstream fetch timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    /// The upstream answered with a non-success status.
    #[error("upstream returned status {status}")]
    Upstream { status: u16 },
    /// The upstream body is not a servable media type.
    #[error("content type '{content_type}' is not servable media")]
    NotMedia { content_type: String },
    /// The upstream returned an empty body.
    #[error("upstream returned an empty body")]
    Empty,
    /// Transport-level failure that survived the retry budget.
    #[error("transport failure: {message}")]
    Transport { message: String },
}

/// Transport-level failure reported by a [`MediaTransport`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("media transport failure: {0}")]
pub struct TransportError(pub String);

/// Raw upstream response before cache/typing decisions.
#[derive(Debug, Clone)]
pub struct MediaResponse {
    /// HTTP status code.
    pub status: u16,
    /// `Content-Type` header value, when the upstream sent one.
    pub content_type: Option<String>,
    /// Response body.
    pub bytes: Bytes,
}

/// Seam between the proxy cache and the network.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    async fn get(&self, url: &str) -> Result<MediaResponse, TransportError>;
}

/// reqwest-backed transport used outside tests.
#[derive(Debug)]
pub struct ReqwestMediaTransport {
    client: reqwest::Client,
}

impl ReqwestMediaTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| TransportError(err.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MediaTransport for ReqwestMediaTransport {
    async fn get(&self, url: &str) -> Result<MediaResponse, TransportError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| TransportError(err.to_string()))?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(ToOwned::to_owned);
        let bytes = response
            .bytes()
            .await
            .map_err(|err| TransportError(err.to_string()))?;

        Ok(MediaResponse {
            status,
            content_type,
            bytes,
        })
    }
}

/// One cached media payload, keyed by resolved URL.
#[derive(Debug, Clone)]
pub struct CachedMedia {
    /// Raw media bytes.
    pub bytes: Bytes,
    /// Normalized content type.
    pub content_type: String,
    /// Fetch completion time, used for TTL expiry.
    pub fetched_at: Instant,
}

/// Tuning values for the proxy cache.
#[derive(Debug, Clone, Copy)]
pub struct MediaProxyConfig {
    /// Hard bound on one upstream round trip. Hitting it fails fast.
    pub fetch_timeout: Duration,
    /// Age past which a cache entry must no longer be served.
    pub ttl: Duration,
    /// Retry budget for transport errors and 5xx responses.
    pub max_retries: u32,
    /// Backoff schedule between retry attempts.
    pub retry: RetryPolicy,
}

impl Default for MediaProxyConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            ttl: DEFAULT_TTL,
            max_retries: DEFAULT_MAX_RETRIES,
            retry: RetryPolicy::default(),
        }
    }
}

enum RetryCause {
    Upstream(u16),
    Transport(TransportError),
}

/// Process-scoped media cache with TTL expiry and bounded-retry fetch.
///
/// The key space is global; concurrent fetches for the same URL race and the
/// last writer wins, which is harmless because entries are content-addressed
/// by URL.
#[derive(Debug)]
pub struct MediaProxyCache<T: MediaTransport> {
    transport: T,
    config: MediaProxyConfig,
    entries: RwLock<HashMap<String, CachedMedia>>,
}

impl<T: MediaTransport> MediaProxyCache<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, MediaProxyConfig::default())
    }

    pub fn with_config(transport: T, config: MediaProxyConfig) -> Self {
        Self {
            transport,
            config,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch media bytes for `url`, serving a fresh cache entry when present.
    ///
    /// `force_refresh` skips the cache lookup but still overwrites the entry
    /// on success.
    pub async fn fetch(
        &self,
        url: &str,
        force_refresh: bool,
    ) -> Result<CachedMedia, MediaFetchError> {
        if !force_refresh && let Some(hit) = self.lookup_fresh(url) {
            trace!(url, "media cache hit");
            return Ok(hit);
        }

        self.fetch_upstream(url).await
    }

    /// Remove all expired entries. Returns the number of evictions.
    ///
    /// Advisory housekeeping: expiry is also enforced at read time, so a
    /// missed sweep never serves stale bytes.
    pub fn sweep(&self) -> usize {
        let ttl = self.config.ttl;
        let mut entries = self.write_entries();
        let before = entries.len();
        entries.retain(|_, entry| entry.fetched_at.elapsed() < ttl);
        before - entries.len()
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.read_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_entries().is_empty()
    }

    fn lookup_fresh(&self, url: &str) -> Option<CachedMedia> {
        let entries = self.read_entries();
        let entry = entries.get(url)?;
        if entry.fetched_at.elapsed() < self.config.ttl {
            Some(entry.clone())
        } else {
            None
        }
    }

    async fn fetch_upstream(&self, url: &str) -> Result<CachedMedia, MediaFetchError> {
        let mut attempt: u32 = 0;
        loop {
            let outcome =
                tokio::time::timeout(self.config.fetch_timeout, self.transport.get(url)).await;

            let cause = match outcome {
                // Timeout fails fast; a slow upstream is not worth hammering.
                Err(_) => {
                    warn!(url, "media fetch timed out");
                    return Err(MediaFetchError::Timeout {
                        timeout_ms: self.config.fetch_timeout.as_millis() as u64,
                    });
                }
                Ok(Ok(response)) => {
                    if (200..300).contains(&response.status) {
                        return self.finalize(url, response);
                    }
                    if !(500..600).contains(&response.status) {
                        // 4xx family is deterministic; retrying cannot help.
                        return Err(MediaFetchError::Upstream {
                            status: response.status,
                        });
                    }
                    RetryCause::Upstream(response.status)
                }
                Ok(Err(err)) => RetryCause::Transport(err),
            };

            if attempt >= self.config.max_retries {
                return Err(match cause {
                    RetryCause::Upstream(status) => MediaFetchError::Upstream { status },
                    RetryCause::Transport(err) => MediaFetchError::Transport {
                        message: err.to_string(),
                    },
                });
            }

            let delay = self.config.retry.delay_for_attempt(attempt);
            attempt += 1;
            debug!(
                url,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying media fetch"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn finalize(&self, url: &str, response: MediaResponse) -> Result<CachedMedia, MediaFetchError> {
        if response.bytes.is_empty() {
            return Err(MediaFetchError::Empty);
        }

        let content_type = response
            .content_type
            .as_deref()
            .map(normalize_content_type)
            .filter(|value| !value.is_empty())
            .or_else(|| sniff_content_type(&response.bytes).map(ToOwned::to_owned))
            .unwrap_or_else(|| "unknown".to_owned());

        if !is_media_content_type(&content_type) {
            return Err(MediaFetchError::NotMedia { content_type });
        }

        let media = CachedMedia {
            bytes: response.bytes,
            content_type,
            fetched_at: Instant::now(),
        };
        self.write_entries().insert(url.to_owned(), media.clone());
        trace!(url, size = media.bytes.len(), "media cached");
        Ok(media)
    }

    fn read_entries(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, CachedMedia>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_entries(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, CachedMedia>> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Running background sweep task.
#[derive(Debug)]
pub struct SweeperTask {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SweeperTask {
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Spawn the hourly (by default) sweep loop for a shared cache.
pub fn spawn_sweeper<T>(cache: Arc<MediaProxyCache<T>>, period: Duration) -> SweeperTask
where
    T: MediaTransport + 'static,
{
    let cancel = CancellationToken::new();
    let child = cancel.child_token();
    let task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(period.max(Duration::from_secs(1)));
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = child.cancelled() => break,
                _ = interval.tick() => {}
            }
            let removed = cache.sweep();
            if removed > 0 {
                debug!(removed, "media cache sweep evicted expired entries");
            }
        }
    });

    SweeperTask { cancel, task }
}

fn normalize_content_type(raw: &str) -> String {
    raw.split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn is_media_content_type(content_type: &str) -> bool {
    content_type.starts_with("image/")
        || content_type.starts_with("video/")
        || content_type.starts_with("audio/")
        || content_type == "application/octet-stream"
}

fn sniff_content_type(bytes: &[u8]) -> Option<&'static str> {
    if bytes.len() >= 8 && bytes[0..8] == [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A] {
        return Some("image/png");
    }
    if bytes.len() >= 3 && bytes[0..3] == [0xFF, 0xD8, 0xFF] {
        return Some("image/jpeg");
    }
    if bytes.len() >= 6 && (&bytes[0..6] == b"GIF87a" || &bytes[0..6] == b"GIF89a") {
        return Some("image/gif");
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::VecDeque,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    fn ok_response(content_type: &str, body: &[u8]) -> MediaResponse {
        MediaResponse {
            status: 200,
            content_type: Some(content_type.to_owned()),
            bytes: Bytes::copy_from_slice(body),
        }
    }

    fn status_response(status: u16) -> MediaResponse {
        MediaResponse {
            status,
            content_type: None,
            bytes: Bytes::from_static(b"err"),
        }
    }

    #[derive(Default)]
    struct ScriptedTransport {
        responses: Mutex<VecDeque<Result<MediaResponse, TransportError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedTransport {
        fn with_responses(
            responses: impl IntoIterator<Item = Result<MediaResponse, TransportError>>,
        ) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().collect()),
                calls: AtomicUsize::new(0),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MediaTransport for ScriptedTransport {
        async fn get(&self, _url: &str) -> Result<MediaResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .expect("responses lock")
                .pop_front()
                .unwrap_or_else(|| Err(TransportError("unscripted request".to_owned())))
        }
    }

    /// Transport that never answers; lets the timeout fire under paused time.
    struct StalledTransport {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MediaTransport for StalledTransport {
        async fn get(&self, _url: &str) -> Result<MediaResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Err(TransportError("unreachable".to_owned()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_5xx_with_backoff_then_succeeds() {
        let transport = ScriptedTransport::with_responses([
            Ok(status_response(503)),
            Ok(status_response(503)),
            Ok(ok_response("image/jpeg", b"jpeg-bytes")),
        ]);
        let cache = MediaProxyCache::new(transport);

        let started = Instant::now();
        let media = cache
            .fetch("https://cdn.example.com/a.jpg", false)
            .await
            .expect("third attempt should succeed");

        assert_eq!(media.content_type, "image/jpeg");
        assert_eq!(cache.transport.call_count(), 3);
        // Backoff schedule: 1 s after the first failure, 2 s after the second.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_retry_budget_on_persistent_5xx() {
        let transport = ScriptedTransport::with_responses([
            Ok(status_response(503)),
            Ok(status_response(503)),
            Ok(status_response(503)),
        ]);
        let cache = MediaProxyCache::new(transport);

        let err = cache
            .fetch("https://cdn.example.com/a.jpg", false)
            .await
            .expect_err("retries must run out");

        assert_eq!(err, MediaFetchError::Upstream { status: 503 });
        assert_eq!(cache.transport.call_count(), 3);
    }

    #[tokio::test]
    async fn does_not_retry_4xx() {
        let transport = ScriptedTransport::with_responses([Ok(status_response(404))]);
        let cache = MediaProxyCache::new(transport);

        let err = cache
            .fetch("https://cdn.example.com/gone.jpg", false)
            .await
            .expect_err("404 must fail");

        assert_eq!(err, MediaFetchError::Upstream { status: 404 });
        assert_eq!(cache.transport.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transport_errors_then_succeeds() {
        let transport = ScriptedTransport::with_responses([
            Err(TransportError("connection reset".to_owned())),
            Ok(ok_response("video/mp4", b"mp4-bytes")),
        ]);
        let cache = MediaProxyCache::new(transport);

        let media = cache
            .fetch("https://cdn.example.com/b.mp4", false)
            .await
            .expect("second attempt should succeed");

        assert_eq!(media.content_type, "video/mp4");
        assert_eq!(cache.transport.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_fast_without_retry() {
        let cache = MediaProxyCache::new(StalledTransport {
            calls: AtomicUsize::new(0),
        });

        let err = cache
            .fetch("https://cdn.example.com/slow.jpg", false)
            .await
            .expect_err("stalled upstream must time out");

        assert_eq!(err, MediaFetchError::Timeout { timeout_ms: 10_000 });
        assert_eq!(cache.transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn serves_cache_hits_until_ttl_expires() {
        let transport = ScriptedTransport::with_responses([
            Ok(ok_response("image/png", &PNG_MAGIC)),
            Ok(ok_response("image/png", &PNG_MAGIC)),
        ]);
        let cache = MediaProxyCache::new(transport);
        let url = "https://cdn.example.com/pic.png";

        cache.fetch(url, false).await.expect("first fetch");

        // One millisecond short of the TTL: still a cache hit.
        tokio::time::advance(DEFAULT_TTL - Duration::from_millis(1)).await;
        cache.fetch(url, false).await.expect("cache hit");
        assert_eq!(cache.transport.call_count(), 1);

        // Past the TTL: entry is treated as absent and refetched.
        tokio::time::advance(Duration::from_millis(2)).await;
        cache.fetch(url, false).await.expect("refetch");
        assert_eq!(cache.transport.call_count(), 2);
    }

    #[tokio::test]
    async fn force_refresh_bypasses_a_fresh_entry() {
        let transport = ScriptedTransport::with_responses([
            Ok(ok_response("image/png", &PNG_MAGIC)),
            Ok(ok_response("image/png", &PNG_MAGIC)),
        ]);
        let cache = MediaProxyCache::new(transport);
        let url = "https://cdn.example.com/pic.png";

        cache.fetch(url, false).await.expect("first fetch");
        cache.fetch(url, true).await.expect("forced refetch");

        assert_eq!(cache.transport.call_count(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn empty_body_is_a_typed_failure() {
        let transport = ScriptedTransport::with_responses([Ok(ok_response("image/png", b""))]);
        let cache = MediaProxyCache::new(transport);

        let err = cache
            .fetch("https://cdn.example.com/empty.png", false)
            .await
            .expect_err("empty body must fail");
        assert_eq!(err, MediaFetchError::Empty);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn non_media_content_type_is_rejected() {
        let transport = ScriptedTransport::with_responses([Ok(ok_response(
            "text/html; charset=utf-8",
            b"<html>login</html>",
        ))]);
        let cache = MediaProxyCache::new(transport);

        let err = cache
            .fetch("https://cdn.example.com/wall.jpg", false)
            .await
            .expect_err("html body must be rejected");
        assert_eq!(
            err,
            MediaFetchError::NotMedia {
                content_type: "text/html".to_owned()
            }
        );
    }

    #[tokio::test]
    async fn sniffs_content_type_when_header_is_missing() {
        let transport = ScriptedTransport::with_responses([Ok(MediaResponse {
            status: 200,
            content_type: None,
            bytes: Bytes::copy_from_slice(&PNG_MAGIC),
        })]);
        let cache = MediaProxyCache::new(transport);

        let media = cache
            .fetch("https://cdn.example.com/headerless", false)
            .await
            .expect("sniffed png should be accepted");
        assert_eq!(media.content_type, "image/png");
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired_entries() {
        let transport = ScriptedTransport::with_responses([
            Ok(ok_response("image/png", &PNG_MAGIC)),
            Ok(ok_response("image/jpeg", b"\xFF\xD8\xFFjpeg")),
        ]);
        let cache = MediaProxyCache::new(transport);

        cache
            .fetch("https://cdn.example.com/old.png", false)
            .await
            .expect("first fetch");
        tokio::time::advance(DEFAULT_TTL - Duration::from_secs(60)).await;
        cache
            .fetch("https://cdn.example.com/new.jpg", false)
            .await
            .expect("second fetch");

        // Push the first entry past its TTL, the second stays fresh.
        tokio::time::advance(Duration::from_secs(120)).await;
        let removed = cache.sweep();

        assert_eq!(removed, 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_task_runs_on_cadence_and_stops_on_cancel() {
        let transport =
            ScriptedTransport::with_responses([Ok(ok_response("image/png", &PNG_MAGIC))]);
        let cache = Arc::new(MediaProxyCache::new(transport));
        cache
            .fetch("https://cdn.example.com/pic.png", false)
            .await
            .expect("fetch");

        let sweeper = spawn_sweeper(cache.clone(), DEFAULT_SWEEP_PERIOD);

        tokio::time::advance(DEFAULT_TTL + DEFAULT_SWEEP_PERIOD).await;
        tokio::task::yield_now().await;
        assert_eq!(cache.len(), 0);

        sweeper.stop().await;
    }
}
