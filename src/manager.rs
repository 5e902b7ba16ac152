//! Orchestration of cache, downloader, and decode behind one call.
//!
//! [`Manager::request`] resolves a URL to a decoded image: cache lookup
//! first, then a coalesced download, then an optional transform, then a
//! store back into both cache tiers. Every request returns a single
//! handle that cancels whichever stage is active. URLs that fail
//! permanently enter an in-memory blacklist consulted before every
//! download.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use image::DynamicImage;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::cache::{CacheSource, ImageCache, ImageCacheConfig, QueryToken};
use crate::codec;
use crate::downloader::{
    DownloadCompleted, DownloadOutcome, DownloadProgress, DownloadToken, Downloader,
    DownloaderConfig,
};
use crate::error::{ImageError, Result};
use crate::executor::Deliverer;
use crate::fetcher::{Fetcher, HttpFetcher};
use crate::key::{CacheKey, KeyFilter};
use crate::options::{DownloadOptions, RequestOptions};

/// Decides whether a cache miss is allowed to hit the network.
pub type DownloadGate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Transforms a downloaded image before it is cached and delivered.
/// Returning the input unchanged (same `Arc`) keeps the raw bytes
/// eligible for verbatim disk persistence.
pub type ImageTransformer = Arc<dyn Fn(Arc<DynamicImage>, &str) -> Arc<DynamicImage> + Send + Sync>;

/// Completion callback of a manager request.
pub type RequestCompleted = Arc<dyn Fn(ImageResponse) + Send + Sync>;

/// Payload delivered to a request completion callback.
#[derive(Clone)]
pub struct ImageResponse {
    /// The resolved image, when one is available.
    pub image: Option<Arc<DynamicImage>>,
    /// The raw downloaded bytes, present on successful network fetches.
    pub data: Option<Bytes>,
    /// The terminal error, if the request failed.
    pub error: Option<ImageError>,
    /// Which cache tier satisfied the request; `None` for the network.
    pub source: CacheSource,
    /// False only for intermediate deliveries (progressive downloads
    /// and the cached value preceding a refresh).
    pub finished: bool,
    /// The requested URL.
    pub url: String,
}

impl std::fmt::Debug for ImageResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageResponse")
            .field(
                "image",
                &self.image.as_ref().map(|i| (i.width(), i.height())),
            )
            .field("data_len", &self.data.as_ref().map(Bytes::len))
            .field("error", &self.error)
            .field("source", &self.source)
            .field("finished", &self.finished)
            .field("url", &self.url)
            .finish()
    }
}

/// Configuration for a [`Manager`].
#[derive(Default)]
pub struct ManagerConfig {
    /// Cache settings.
    pub cache: ImageCacheConfig,
    /// Downloader settings.
    pub downloader: DownloaderConfig,
    /// Maps URLs to cache keys; defaults to the URL string itself.
    pub cache_key_filter: Option<KeyFilter>,
    /// Consulted on cache misses before scheduling a download.
    pub download_gate: Option<DownloadGate>,
    /// Applied to downloaded images before caching and delivery.
    pub transformer: Option<ImageTransformer>,
}

impl std::fmt::Debug for ManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerConfig")
            .field("cache", &self.cache)
            .field("downloader", &self.downloader)
            .field("cache_key_filter", &self.cache_key_filter.is_some())
            .field("download_gate", &self.download_gate.is_some())
            .field("transformer", &self.transformer.is_some())
            .finish()
    }
}

struct HandleInner {
    cancelled: AtomicBool,
    query: Mutex<Option<QueryToken>>,
    download: Mutex<Option<DownloadToken>>,
}

/// Composite cancellation handle for one request.
///
/// Cancelling first cancels the outstanding cache query, then removes
/// this request's waiter from the download job; the job itself aborts
/// only when no waiters remain. After `cancel` returns, no progress or
/// completion callback fires for this request. Idempotent.
#[derive(Clone)]
pub struct RequestHandle {
    inner: Arc<HandleInner>,
}

impl RequestHandle {
    fn new() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                cancelled: AtomicBool::new(false),
                query: Mutex::new(None),
                download: Mutex::new(None),
            }),
        }
    }

    /// Cancels whichever stage of the request is active.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        if let Some(query) = self.inner.query.lock().take() {
            query.cancel();
        }
        if let Some(download) = self.inner.download.lock().take() {
            download.cancel();
        }
    }

    /// Returns whether the request has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    fn set_query(&self, token: QueryToken) {
        if self.is_cancelled() {
            token.cancel();
        } else {
            *self.inner.query.lock() = Some(token);
        }
    }

    fn set_download(&self, token: DownloadToken) {
        if self.is_cancelled() {
            token.cancel();
        } else {
            *self.inner.download.lock() = Some(token);
        }
    }
}

struct ManagerShared {
    cache: Arc<ImageCache>,
    downloader: Arc<Downloader>,
    deliverer: Deliverer,
    failed_urls: Mutex<HashSet<String>>,
    handles: Mutex<Vec<Weak<HandleInner>>>,
    key_filter: Option<KeyFilter>,
    download_gate: Option<DownloadGate>,
    transformer: Option<ImageTransformer>,
}

/// End-to-end image fetcher: cache, downloader, and blacklist composed
/// behind a single cancellable request.
pub struct Manager {
    shared: Arc<ManagerShared>,
}

impl Manager {
    /// Creates a manager over the default HTTP transport.
    ///
    /// # Errors
    /// Returns an error when the cache directory cannot be created.
    pub async fn new(config: ManagerConfig) -> Result<Self> {
        Self::with_fetcher(config, Arc::new(HttpFetcher::new())).await
    }

    /// Creates a manager over a custom transport.
    ///
    /// # Errors
    /// Returns an error when the cache directory cannot be created.
    pub async fn with_fetcher(config: ManagerConfig, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        let deliverer = Deliverer::new();
        let cache = Arc::new(ImageCache::build(config.cache, deliverer.clone()).await?);
        let downloader = Arc::new(Downloader::build(fetcher, config.downloader, deliverer.clone()));

        Ok(Self {
            shared: Arc::new(ManagerShared {
                cache,
                downloader,
                deliverer,
                failed_urls: Mutex::new(HashSet::new()),
                handles: Mutex::new(Vec::new()),
                key_filter: config.cache_key_filter,
                download_gate: config.download_gate,
                transformer: config.transformer,
            }),
        })
    }

    /// Creates a manager over independently constructed components.
    /// Deliveries from the two components are each ordered, but not
    /// ordered against one another.
    #[must_use]
    pub fn from_parts(cache: Arc<ImageCache>, downloader: Arc<Downloader>) -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                cache,
                downloader,
                deliverer: Deliverer::new(),
                failed_urls: Mutex::new(HashSet::new()),
                handles: Mutex::new(Vec::new()),
                key_filter: None,
                download_gate: None,
                transformer: None,
            }),
        }
    }

    /// The cache this manager reads and writes.
    #[must_use]
    pub fn cache(&self) -> &Arc<ImageCache> {
        &self.shared.cache
    }

    /// The downloader this manager schedules on.
    #[must_use]
    pub fn downloader(&self) -> &Arc<Downloader> {
        &self.shared.downloader
    }

    /// The cache key identifying `url`.
    #[must_use]
    pub fn cache_key_for_url(&self, url: &str) -> CacheKey {
        self.shared
            .key_filter
            .as_ref()
            .map_or_else(|| CacheKey::from_url(url), |filter| filter(url))
    }

    /// Resolves `url` to a decoded image: cache, then network, then
    /// store-back. Callbacks run on the delivery queue; the returned
    /// handle cancels the request at any stage.
    pub fn request(
        &self,
        url: &str,
        options: RequestOptions,
        progress: Option<DownloadProgress>,
        completed: Option<RequestCompleted>,
    ) -> RequestHandle {
        let handle = RequestHandle::new();
        self.register(&handle);

        if url.is_empty() || reqwest::Url::parse(url).is_err() {
            self.deliver_failure(
                &handle,
                completed,
                url,
                ImageError::invalid_url(if url.is_empty() { "empty URL" } else { url }),
            );
            return handle;
        }

        if self.shared.failed_urls.lock().contains(url)
            && !options.contains(RequestOptions::RETRY_FAILED)
        {
            trace!(url, "request rejected by blacklist");
            self.deliver_failure(&handle, completed, url, ImageError::Blacklisted);
            return handle;
        }

        let key = self.cache_key_for_url(url);
        let refresh = options.contains(RequestOptions::REFRESH_CACHED);
        let shared = self.shared.clone();
        let query_handle = handle.clone();
        let url = url.to_string();

        let closure_key = key.clone();
        let token = self.shared.cache.query(&key, move |image, source| {
            let key = closure_key;
            // Runs on the delivery queue.
            if query_handle.is_cancelled() {
                return;
            }

            if let Some(image) = image {
                if !refresh {
                    if let Some(completed) = completed {
                        completed(ImageResponse {
                            image: Some(image),
                            data: None,
                            error: None,
                            source,
                            finished: true,
                            url,
                        });
                    }
                    return;
                }

                // Refresh: the cached value goes out first, then the
                // network decides whether a fresh one follows.
                if let Some(completed) = &completed {
                    completed(ImageResponse {
                        image: Some(image),
                        data: None,
                        error: None,
                        source,
                        finished: false,
                        url: url.clone(),
                    });
                }
                start_download(
                    &shared,
                    &query_handle,
                    &key,
                    &url,
                    options,
                    true,
                    progress,
                    completed,
                );
            } else {
                start_download(
                    &shared,
                    &query_handle,
                    &key,
                    &url,
                    options,
                    false,
                    progress,
                    completed,
                );
            }
        });
        handle.set_query(token);
        handle
    }

    fn deliver_failure(
        &self,
        handle: &RequestHandle,
        completed: Option<RequestCompleted>,
        url: &str,
        error: ImageError,
    ) {
        let Some(completed) = completed else { return };
        let handle = handle.clone();
        let url = url.to_string();
        self.shared.deliverer.deliver(move || {
            if !handle.is_cancelled() {
                completed(ImageResponse {
                    image: None,
                    data: None,
                    error: Some(error),
                    source: CacheSource::None,
                    finished: true,
                    url,
                });
            }
        });
    }

    fn register(&self, handle: &RequestHandle) {
        let mut handles = self.shared.handles.lock();
        handles.retain(|weak| weak.strong_count() > 0);
        handles.push(Arc::downgrade(&handle.inner));
    }

    /// Cancels every outstanding request.
    pub fn cancel_all(&self) {
        let drained: Vec<_> = std::mem::take(&mut *self.shared.handles.lock());
        for weak in drained {
            if let Some(inner) = weak.upgrade() {
                RequestHandle { inner }.cancel();
            }
        }
    }

    /// Whether any download job is live.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.downloader.active_job_count() > 0
    }

    /// Stores an image in both cache tiers under the key for `url`.
    pub fn save_image_to_cache(&self, image: Arc<DynamicImage>, url: &str) {
        if url.is_empty() {
            return;
        }
        let key = self.cache_key_for_url(url);
        self.shared.cache.store(&key, image);
    }

    /// Whether `url` is cached in either tier. Blocking.
    #[must_use]
    pub fn cached_image_exists(&self, url: &str) -> bool {
        let key = self.cache_key_for_url(url);
        self.shared.cache.image_in_memory(&key).is_some() || self.shared.cache.exists_on_disk(&key)
    }

    /// Whether `url` is cached on disk. Blocking.
    #[must_use]
    pub fn disk_image_exists(&self, url: &str) -> bool {
        let key = self.cache_key_for_url(url);
        self.shared.cache.exists_on_disk(&key)
    }

    /// Asynchronous [`Self::cached_image_exists`], delivered on the
    /// delivery queue.
    pub fn cached_image_exists_async<F>(&self, url: &str, completed: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let key = self.cache_key_for_url(url);
        if self.shared.cache.image_in_memory(&key).is_some() {
            self.shared.deliverer.deliver(move || completed(true));
            return;
        }
        self.shared.cache.exists_on_disk_async(&key, completed);
    }

    /// Asynchronous [`Self::disk_image_exists`], delivered on the
    /// delivery queue.
    pub fn disk_image_exists_async<F>(&self, url: &str, completed: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let key = self.cache_key_for_url(url);
        self.shared.cache.exists_on_disk_async(&key, completed);
    }
}

#[allow(clippy::too_many_arguments)]
fn start_download(
    shared: &Arc<ManagerShared>,
    handle: &RequestHandle,
    key: &CacheKey,
    url: &str,
    options: RequestOptions,
    had_cached: bool,
    progress: Option<DownloadProgress>,
    completed: Option<RequestCompleted>,
) {
    if let Some(gate) = &shared.download_gate
        && !gate(url)
    {
        trace!(url, "download vetoed");
        if !had_cached && let Some(completed) = &completed {
            completed(ImageResponse {
                image: None,
                data: None,
                error: None,
                source: CacheSource::None,
                finished: true,
                url: url.to_string(),
            });
        }
        return;
    }

    let mut download_options = options.download_options();
    if had_cached {
        // The refetch may legitimately come out of the transport's HTTP
        // cache; a cache-served response means the cached image stands.
        download_options |=
            DownloadOptions::USE_HTTP_CACHE | DownloadOptions::IGNORE_CACHED_RESPONSE;
    }

    let on_download = {
        let shared = shared.clone();
        let handle = handle.clone();
        let key = key.clone();
        let url = url.to_string();
        let downloaded: DownloadCompleted = Arc::new(move |outcome: DownloadOutcome| {
            on_download_outcome(
                &shared,
                &handle,
                &key,
                &url,
                options,
                had_cached,
                &completed,
                outcome,
            );
        });
        downloaded
    };

    let token = shared
        .downloader
        .download(url, download_options, progress, Some(on_download));
    handle.set_download(token);
}

#[allow(clippy::too_many_arguments)]
fn on_download_outcome(
    shared: &Arc<ManagerShared>,
    handle: &RequestHandle,
    key: &CacheKey,
    url: &str,
    options: RequestOptions,
    had_cached: bool,
    completed: &Option<RequestCompleted>,
    outcome: DownloadOutcome,
) {
    // Runs on the delivery queue.
    if handle.is_cancelled() {
        return;
    }

    if let Some(error) = outcome.error {
        if error.is_permanent() && !options.contains(RequestOptions::RETRY_FAILED) {
            debug!(url, error = %error, "blacklisting URL after permanent failure");
            shared.failed_urls.lock().insert(url.to_string());
        }
        // A failed refresh leaves the already-delivered cached value
        // standing; no error callback follows it.
        if !had_cached && let Some(completed) = completed {
            completed(ImageResponse {
                image: None,
                data: None,
                error: Some(error),
                source: CacheSource::None,
                finished: true,
                url: url.to_string(),
            });
        }
        return;
    }

    if !outcome.finished {
        if let Some(completed) = completed {
            completed(ImageResponse {
                image: outcome.image,
                data: None,
                error: None,
                source: CacheSource::None,
                finished: false,
                url: url.to_string(),
            });
        }
        return;
    }

    let Some(image) = outcome.image else {
        // Cache-served response suppressed by the downloader.
        if !had_cached && let Some(completed) = completed {
            completed(ImageResponse {
                image: None,
                data: None,
                error: None,
                source: CacheSource::None,
                finished: true,
                url: url.to_string(),
            });
        }
        return;
    };

    shared.failed_urls.lock().remove(url);
    finish_success(
        shared.clone(),
        handle.clone(),
        key.clone(),
        url.to_string(),
        options,
        image,
        outcome.data,
        completed.clone(),
    );
}

#[allow(clippy::too_many_arguments)]
fn finish_success(
    shared: Arc<ManagerShared>,
    handle: RequestHandle,
    key: CacheKey,
    url: String,
    options: RequestOptions,
    image: Arc<DynamicImage>,
    data: Option<Bytes>,
    completed: Option<RequestCompleted>,
) {
    let to_disk = !options.contains(RequestOptions::CACHE_MEMORY_ONLY);
    let animated = data.as_deref().is_some_and(codec::is_animated);
    let transformer = shared
        .transformer
        .clone()
        .filter(|_| !animated || options.contains(RequestOptions::TRANSFORM_ANIMATED_IMAGE));

    let Some(transformer) = transformer else {
        shared
            .cache
            .store_with_options(&key, image.clone(), data.clone(), to_disk, false);
        if let Some(completed) = completed {
            completed(ImageResponse {
                image: Some(image),
                data,
                error: None,
                source: CacheSource::None,
                finished: true,
                url,
            });
        }
        return;
    };

    // Transforms are CPU work; run them off the delivery queue and
    // re-enter it for the final callback.
    tokio::spawn(async move {
        let result = tokio::task::spawn_blocking({
            let image = image.clone();
            let url = url.clone();
            move || transformer(image, &url)
        })
        .await;

        let transformed = match result {
            Ok(transformed) => transformed,
            Err(e) => {
                warn!(url, error = %e, "transformer panicked, using original image");
                image.clone()
            }
        };
        let changed = !Arc::ptr_eq(&transformed, &image);

        shared
            .cache
            .store_with_options(&key, transformed.clone(), data.clone(), to_disk, changed);

        if let Some(completed) = completed {
            shared.deliverer.deliver(move || {
                if !handle.is_cancelled() {
                    completed(ImageResponse {
                        image: Some(transformed),
                        data,
                        error: None,
                        source: CacheSource::None,
                        finished: true,
                        url,
                    });
                }
            });
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::testing::png_bytes;
    use crate::fetcher::testing::{StubFetcher, wait_until};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::{Semaphore, oneshot};

    const URL: &str = "https://example.com/image.png";

    async fn manager_in(dir: &TempDir) -> (Manager, Arc<StubFetcher>) {
        manager_with_config(dir, ManagerConfig::default()).await
    }

    async fn manager_with_config(
        dir: &TempDir,
        mut config: ManagerConfig,
    ) -> (Manager, Arc<StubFetcher>) {
        let stub = StubFetcher::new();
        config.cache = ImageCacheConfig::new("t").with_disk_directory(dir.path());
        let manager = Manager::with_fetcher(config, stub.clone())
            .await
            .expect("manager builds in temp dir");
        (manager, stub)
    }

    fn collector() -> (Arc<Mutex<Vec<ImageResponse>>>, RequestCompleted) {
        let responses = Arc::new(Mutex::new(Vec::new()));
        let sink = responses.clone();
        let completed: RequestCompleted = Arc::new(move |response| {
            sink.lock().push(response);
        });
        (responses, completed)
    }

    async fn query(manager: &Manager, url: &str) -> (Option<Arc<DynamicImage>>, CacheSource) {
        let (tx, rx) = oneshot::channel();
        let key = manager.cache_key_for_url(url);
        manager.cache().query(&key, move |image, source| {
            let _ = tx.send((image, source));
        });
        rx.await.expect("query delivers")
    }

    #[tokio::test]
    async fn request_downloads_decodes_and_caches() {
        let dir = TempDir::new().unwrap();
        let (manager, stub) = manager_in(&dir).await;
        stub.ok(URL, png_bytes(4, 4));
        let (responses, completed) = collector();

        let _handle = manager.request(URL, RequestOptions::empty(), None, Some(completed));
        wait_until(|| !responses.lock().is_empty()).await;

        {
            let responses = responses.lock();
            assert_eq!(responses.len(), 1);
            let response = &responses[0];
            assert!(response.finished);
            assert!(response.error.is_none());
            assert_eq!(response.source, CacheSource::None);
            assert_eq!(response.image.as_ref().map(|i| i.width()), Some(4));
            assert_eq!(response.data.as_deref(), Some(png_bytes(4, 4).as_ref()));
            assert_eq!(response.url, URL);
        }

        // A second lookup is served from memory without a new fetch.
        let (image, source) = query(&manager, URL).await;
        assert!(image.is_some());
        assert_eq!(source, CacheSource::Memory);
        assert_eq!(stub.request_count(URL), 1);
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_transport() {
        let dir = TempDir::new().unwrap();
        let (manager, stub) = manager_in(&dir).await;
        stub.ok(URL, png_bytes(2, 2));
        let gate = Arc::new(Semaphore::new(0));
        stub.set_gate(gate.clone());

        let (first, first_cb) = collector();
        let (second, second_cb) = collector();
        let _h1 = manager.request(URL, RequestOptions::empty(), None, Some(first_cb));
        let _h2 = manager.request(URL, RequestOptions::empty(), None, Some(second_cb));

        gate.add_permits(2);
        wait_until(|| !first.lock().is_empty() && !second.lock().is_empty()).await;

        assert_eq!(stub.request_count(URL), 1);
        let first = first.lock();
        let second = second.lock();
        let dims = |r: &ImageResponse| r.image.as_ref().map(|i| (i.width(), i.height()));
        assert_eq!(dims(&first[0]), Some((2, 2)));
        assert_eq!(dims(&first[0]), dims(&second[0]));
    }

    #[tokio::test]
    async fn cancelled_request_aborts_and_stays_retryable() {
        let dir = TempDir::new().unwrap();
        let (manager, stub) = manager_in(&dir).await;
        let aborted = stub.hang(URL);
        let (responses, completed) = collector();

        let handle = manager.request(URL, RequestOptions::empty(), None, Some(completed));
        wait_until(|| stub.request_count(URL) == 1).await;

        handle.cancel();
        assert!(handle.is_cancelled());
        handle.cancel(); // idempotent
        wait_until(|| aborted.load(Ordering::SeqCst)).await;
        wait_until(|| !manager.is_running()).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(responses.lock().is_empty());

        // The URL was not blacklisted: a fresh request succeeds.
        stub.ok(URL, png_bytes(1, 1));
        let (retried, retried_cb) = collector();
        let _handle = manager.request(URL, RequestOptions::empty(), None, Some(retried_cb));
        wait_until(|| !retried.lock().is_empty()).await;
        assert!(retried.lock()[0].error.is_none());
    }

    #[tokio::test]
    async fn permanent_failures_blacklist_the_url() {
        let dir = TempDir::new().unwrap();
        let (manager, stub) = manager_in(&dir).await;
        stub.status(URL, 404);

        let (responses, completed) = collector();
        let _handle = manager.request(URL, RequestOptions::empty(), None, Some(completed));
        wait_until(|| !responses.lock().is_empty()).await;
        assert!(matches!(
            responses.lock()[0].error,
            Some(ImageError::HttpStatus { status: 404 })
        ));

        // The second request never reaches the transport.
        let (rejected, rejected_cb) = collector();
        let _handle = manager.request(URL, RequestOptions::empty(), None, Some(rejected_cb));
        wait_until(|| !rejected.lock().is_empty()).await;
        assert!(matches!(
            rejected.lock()[0].error,
            Some(ImageError::Blacklisted)
        ));
        assert_eq!(stub.request_count(URL), 1);

        // RETRY_FAILED bypasses the blacklist, and success clears it.
        stub.ok(URL, png_bytes(1, 1));
        let (retried, retried_cb) = collector();
        let _handle = manager.request(URL, RequestOptions::RETRY_FAILED, None, Some(retried_cb));
        wait_until(|| !retried.lock().is_empty()).await;
        assert!(retried.lock()[0].error.is_none());
        assert_eq!(stub.request_count(URL), 2);
    }

    #[tokio::test]
    async fn transient_failures_do_not_blacklist() {
        let dir = TempDir::new().unwrap();
        let (manager, stub) = manager_in(&dir).await;
        stub.fail(URL, ImageError::transient("timed out"));

        let (responses, completed) = collector();
        let _handle = manager.request(URL, RequestOptions::empty(), None, Some(completed));
        wait_until(|| !responses.lock().is_empty()).await;

        stub.ok(URL, png_bytes(1, 1));
        let (retried, retried_cb) = collector();
        let _handle = manager.request(URL, RequestOptions::empty(), None, Some(retried_cb));
        wait_until(|| !retried.lock().is_empty()).await;
        assert!(retried.lock()[0].error.is_none());
        assert_eq!(stub.request_count(URL), 2);
    }

    #[tokio::test]
    async fn refresh_cached_delivers_cached_then_fresh() {
        let dir = TempDir::new().unwrap();
        let (manager, stub) = manager_in(&dir).await;

        // Pre-populate with a 2x2 image, then serve a 4x4 from the net.
        manager.save_image_to_cache(Arc::new(DynamicImage::new_rgb8(2, 2)), URL);
        stub.ok(URL, png_bytes(4, 4));

        let (responses, completed) = collector();
        let _handle = manager.request(URL, RequestOptions::REFRESH_CACHED, None, Some(completed));
        wait_until(|| responses.lock().len() == 2).await;

        {
            let responses = responses.lock();
            assert!(!responses[0].finished);
            assert_eq!(responses[0].source, CacheSource::Memory);
            assert_eq!(responses[0].image.as_ref().map(|i| i.width()), Some(2));

            assert!(responses[1].finished);
            assert_eq!(responses[1].source, CacheSource::None);
            assert_eq!(responses[1].image.as_ref().map(|i| i.width()), Some(4));
        }

        let (image, source) = query(&manager, URL).await;
        assert_eq!(source, CacheSource::Memory);
        assert_eq!(image.map(|i| i.width()), Some(4));
    }

    #[tokio::test]
    async fn refresh_served_from_http_cache_stands_pat() {
        let dir = TempDir::new().unwrap();
        let (manager, stub) = manager_in(&dir).await;
        manager.save_image_to_cache(Arc::new(DynamicImage::new_rgb8(2, 2)), URL);
        stub.from_cache(URL, png_bytes(4, 4));

        let (responses, completed) = collector();
        let _handle = manager.request(URL, RequestOptions::REFRESH_CACHED, None, Some(completed));
        wait_until(|| !responses.lock().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Only the cached delivery; the cache-served refetch is silent.
        let responses = responses.lock();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].image.as_ref().map(|i| i.width()), Some(2));
    }

    #[tokio::test]
    async fn refresh_failure_keeps_the_cached_value_silently() {
        let dir = TempDir::new().unwrap();
        let (manager, stub) = manager_in(&dir).await;
        manager.save_image_to_cache(Arc::new(DynamicImage::new_rgb8(2, 2)), URL);
        stub.status(URL, 500);

        let (responses, completed) = collector();
        let _handle = manager.request(URL, RequestOptions::REFRESH_CACHED, None, Some(completed));
        wait_until(|| !responses.lock().is_empty()).await;
        wait_until(|| stub.request_count(URL) == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let responses = responses.lock();
        assert_eq!(responses.len(), 1);
        assert!(responses[0].error.is_none());
    }

    #[tokio::test]
    async fn invalid_url_completes_immediately() {
        let dir = TempDir::new().unwrap();
        let (manager, stub) = manager_in(&dir).await;

        for url in ["", "not a url"] {
            let (responses, completed) = collector();
            let _handle = manager.request(url, RequestOptions::empty(), None, Some(completed));
            wait_until(|| !responses.lock().is_empty()).await;
            assert!(matches!(
                responses.lock()[0].error,
                Some(ImageError::InvalidUrl { .. })
            ));
        }
        assert!(stub.requests().is_empty());
    }

    #[tokio::test]
    async fn download_gate_vetoes_without_error() {
        let dir = TempDir::new().unwrap();
        let (manager, stub) = manager_with_config(
            &dir,
            ManagerConfig {
                download_gate: Some(Arc::new(|_| false)),
                ..ManagerConfig::default()
            },
        )
        .await;

        let (responses, completed) = collector();
        let _handle = manager.request(URL, RequestOptions::empty(), None, Some(completed));
        wait_until(|| !responses.lock().is_empty()).await;

        let responses = responses.lock();
        assert!(responses[0].finished);
        assert!(responses[0].image.is_none());
        assert!(responses[0].error.is_none());
        assert!(stub.requests().is_empty());
    }

    #[tokio::test]
    async fn transformer_reshapes_and_reencodes() {
        let dir = TempDir::new().unwrap();
        let (manager, stub) = manager_with_config(
            &dir,
            ManagerConfig {
                transformer: Some(Arc::new(|image, _| {
                    Arc::new(image.thumbnail_exact(1, 1))
                })),
                ..ManagerConfig::default()
            },
        )
        .await;
        stub.ok(URL, png_bytes(8, 8));

        let (responses, completed) = collector();
        let _handle = manager.request(URL, RequestOptions::empty(), None, Some(completed));
        wait_until(|| !responses.lock().is_empty()).await;

        assert_eq!(
            responses.lock()[0].image.as_ref().map(|i| i.width()),
            Some(1)
        );

        // The transformed image is what both tiers hold.
        let key = manager.cache_key_for_url(URL);
        assert_eq!(
            manager.cache().image_in_memory(&key).map(|i| i.width()),
            Some(1)
        );
        let (tx, rx) = oneshot::channel();
        manager.cache().exists_on_disk_async(&key, move |exists| {
            let _ = tx.send(exists);
        });
        assert!(rx.await.unwrap());
        let on_disk = crate::codec::decode_blocking(
            &std::fs::read(manager.cache().default_cache_path_for_key(&key)).unwrap(),
            false,
        )
        .unwrap();
        assert_eq!(on_disk.width(), 1);
    }

    #[tokio::test]
    async fn identity_transform_persists_raw_bytes() {
        let dir = TempDir::new().unwrap();
        let (manager, stub) = manager_with_config(
            &dir,
            ManagerConfig {
                transformer: Some(Arc::new(|image, _| image)),
                ..ManagerConfig::default()
            },
        )
        .await;
        let raw = png_bytes(3, 3);
        stub.ok(URL, raw.clone());

        let (responses, completed) = collector();
        let _handle = manager.request(URL, RequestOptions::empty(), None, Some(completed));
        wait_until(|| !responses.lock().is_empty()).await;

        let key = manager.cache_key_for_url(URL);
        let (tx, rx) = oneshot::channel();
        manager.cache().exists_on_disk_async(&key, move |exists| {
            let _ = tx.send(exists);
        });
        assert!(rx.await.unwrap());
        let on_disk = std::fs::read(manager.cache().default_cache_path_for_key(&key)).unwrap();
        assert_eq!(on_disk, raw.as_ref());
    }

    #[tokio::test]
    async fn memory_only_requests_skip_the_disk() {
        let dir = TempDir::new().unwrap();
        let (manager, stub) = manager_in(&dir).await;
        stub.ok(URL, png_bytes(2, 2));

        let (responses, completed) = collector();
        let _handle = manager.request(URL, RequestOptions::CACHE_MEMORY_ONLY, None, Some(completed));
        wait_until(|| !responses.lock().is_empty()).await;

        let key = manager.cache_key_for_url(URL);
        assert!(manager.cache().image_in_memory(&key).is_some());

        let (tx, rx) = oneshot::channel();
        manager.disk_image_exists_async(URL, move |exists| {
            let _ = tx.send(exists);
        });
        assert!(!rx.await.unwrap());
    }

    #[tokio::test]
    async fn progressive_requests_forward_partials() {
        let dir = TempDir::new().unwrap();
        let (manager, stub) = manager_in(&dir).await;
        stub.ok_chunks(URL, vec![png_bytes(3, 3), bytes::Bytes::new()]);

        let (responses, completed) = collector();
        let _handle = manager.request(
            URL,
            RequestOptions::PROGRESSIVE_DOWNLOAD,
            None,
            Some(completed),
        );
        wait_until(|| responses.lock().last().is_some_and(|r| r.finished)).await;

        let responses = responses.lock();
        assert!(responses.iter().any(|r| !r.finished));
        assert_eq!(responses.iter().filter(|r| r.finished).count(), 1);
    }

    #[tokio::test]
    async fn cache_key_filter_collapses_urls() {
        let dir = TempDir::new().unwrap();
        let (manager, stub) = manager_with_config(
            &dir,
            ManagerConfig {
                cache_key_filter: Some(Arc::new(|url| {
                    CacheKey::new(url.split('?').next().unwrap_or(url))
                })),
                ..ManagerConfig::default()
            },
        )
        .await;
        let signed = "https://example.com/image.png?signature=abc";
        stub.ok(signed, png_bytes(2, 2));

        let (responses, completed) = collector();
        let _handle = manager.request(signed, RequestOptions::empty(), None, Some(completed));
        wait_until(|| !responses.lock().is_empty()).await;

        assert_eq!(manager.cache_key_for_url(signed).as_str(), URL);
        assert!(manager.cached_image_exists(URL));

        let (tx, rx) = oneshot::channel();
        manager.cached_image_exists_async("https://example.com/image.png?signature=xyz", move |e| {
            let _ = tx.send(e);
        });
        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn cancel_all_silences_every_request() {
        let dir = TempDir::new().unwrap();
        let (manager, stub) = manager_in(&dir).await;
        let first_aborted = stub.hang("https://e.com/1");
        let second_aborted = stub.hang("https://e.com/2");

        let (responses, completed) = collector();
        let _h1 = manager.request("https://e.com/1", RequestOptions::empty(), None, Some(completed.clone()));
        let _h2 = manager.request("https://e.com/2", RequestOptions::empty(), None, Some(completed));
        wait_until(|| stub.requests().len() == 2).await;
        assert!(manager.is_running());

        manager.cancel_all();
        wait_until(|| first_aborted.load(Ordering::SeqCst)).await;
        wait_until(|| second_aborted.load(Ordering::SeqCst)).await;
        wait_until(|| !manager.is_running()).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(responses.lock().is_empty());
    }

    #[tokio::test]
    async fn existence_checks_cover_both_tiers() {
        let dir = TempDir::new().unwrap();
        let (manager, _stub) = manager_in(&dir).await;

        assert!(!manager.cached_image_exists(URL));
        assert!(!manager.disk_image_exists(URL));

        manager.save_image_to_cache(Arc::new(DynamicImage::new_rgb8(2, 2)), URL);
        assert!(manager.cached_image_exists(URL));

        let (tx, rx) = oneshot::channel();
        manager.disk_image_exists_async(URL, move |exists| {
            let _ = tx.send(exists);
        });
        assert!(rx.await.unwrap());
        assert!(manager.disk_image_exists(URL));

        // Disk-only presence still counts as cached.
        manager.cache().clear_memory();
        assert!(manager.cached_image_exists(URL));
    }
}
