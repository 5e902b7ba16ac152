//! Transport port and its default HTTP implementation.
//!
//! The downloader talks to the network exclusively through [`Fetcher`],
//! so transports are injectable: the default [`HttpFetcher`] speaks HTTP
//! via reqwest, tests script byte streams, and platform integrations can
//! add capabilities such as background-execution grants.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use parking_lot::Mutex;
use reqwest::Client;
use tokio::sync::watch;

use crate::error::{ImageError, Result};

/// Basic-auth credentials supplied on authentication challenges.
#[derive(Clone)]
pub struct Credentials {
    /// The account name.
    pub username: String,
    /// The account password.
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// A fully prepared transport request for one image URL.
#[derive(Debug)]
pub struct FetchRequest {
    /// The image URL.
    pub url: String,
    /// Header fields to send, later entries overriding earlier ones.
    pub headers: Vec<(String, String)>,
    /// Transport timeout covering connect through end of body.
    pub timeout: Duration,
    /// Allow the transport's local HTTP cache; without it the request
    /// asks for a full reload.
    pub use_http_cache: bool,
    /// Attach and store cookies.
    pub handle_cookies: bool,
    /// Accept untrusted TLS certificates.
    pub allow_invalid_certs: bool,
    /// Basic-auth credentials, when configured on the downloader.
    pub credentials: Option<Credentials>,
}

/// A transport response: status plus a streaming body.
pub struct FetchResponse {
    /// HTTP status code.
    pub status: u16,
    /// Total body length when the transport knows it up front.
    pub expected_len: Option<u64>,
    /// True when the response was served from the transport's local
    /// HTTP cache rather than the network.
    pub from_cache: bool,
    /// The body, delivered as a stream of chunks. Dropping the stream
    /// aborts the underlying transfer.
    pub body: BoxStream<'static, Result<Bytes>>,
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchResponse")
            .field("status", &self.status)
            .field("expected_len", &self.expected_len)
            .field("from_cache", &self.from_cache)
            .finish_non_exhaustive()
    }
}

/// A background-execution grant issued by a platform-aware transport.
///
/// Revocation is observed at chunk boundaries; a revoked grant cancels
/// the job it was issued for.
#[derive(Debug, Clone)]
pub struct BackgroundGrant {
    revoked: watch::Receiver<bool>,
}

impl BackgroundGrant {
    /// Creates a grant and the handle that can revoke it.
    #[must_use]
    pub fn channel() -> (BackgroundRevoker, Self) {
        let (tx, rx) = watch::channel(false);
        (BackgroundRevoker { tx }, Self { revoked: rx })
    }

    /// Returns whether the platform has revoked the grant.
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        *self.revoked.borrow()
    }

    /// Resolves once the grant is revoked.
    pub async fn revoked(&self) {
        let mut rx = self.revoked.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Revoker dropped without revoking: the grant stands for
                // the life of the job.
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Revocation side of a [`BackgroundGrant`].
#[derive(Debug)]
pub struct BackgroundRevoker {
    tx: watch::Sender<bool>,
}

impl BackgroundRevoker {
    /// Revokes the grant. Jobs holding it cancel at the next chunk.
    pub fn revoke(&self) {
        self.tx.send_replace(true);
    }
}

/// Port for the HTTP transport.
///
/// Implementations must be thread-safe; one fetcher serves every
/// concurrent download job.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Performs the request and returns the streaming response.
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse>;

    /// Requests a background-execution grant for a job, when the
    /// platform supports one. The default transport has no such
    /// capability and returns `None`, making the option a no-op.
    fn begin_background_task(&self) -> Option<BackgroundGrant> {
        None
    }
}

/// Client-level switches that force a separate reqwest client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ClientKey {
    cookies: bool,
    invalid_certs: bool,
}

/// The default transport, backed by reqwest.
///
/// Cookie handling and certificate laxity are client-level switches in
/// reqwest, so one client is built lazily per switch combination and
/// reused for subsequent requests.
pub struct HttpFetcher {
    clients: Mutex<HashMap<ClientKey, Client>>,
}

impl HttpFetcher {
    /// Creates the fetcher. Clients are built on first use.
    #[must_use]
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, key: ClientKey) -> Result<Client> {
        if let Some(client) = self.clients.lock().get(&key) {
            return Ok(client.clone());
        }
        let client = Client::builder()
            .cookie_store(key.cookies)
            .danger_accept_invalid_certs(key.invalid_certs)
            .build()
            .map_err(|e| ImageError::network(format!("failed to build HTTP client: {e}")))?;
        self.clients.lock().insert(key, client.clone());
        Ok(client)
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

fn map_request_error(error: &reqwest::Error) -> ImageError {
    if error.is_timeout() {
        ImageError::transient(format!("request timed out: {error}"))
    } else if error.is_connect() {
        ImageError::transient(format!("connection failed: {error}"))
    } else {
        ImageError::network(error.to_string())
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| ImageError::invalid_url(format!("{}: {e}", request.url)))?;

        let client = self.client_for(ClientKey {
            cookies: request.handle_cookies,
            invalid_certs: request.allow_invalid_certs,
        })?;

        let mut builder = client.get(url).timeout(request.timeout);
        if !request.use_http_cache {
            builder = builder
                .header(reqwest::header::CACHE_CONTROL, "no-cache")
                .header(reqwest::header::PRAGMA, "no-cache");
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(credentials) = &request.credentials {
            builder = builder.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response = builder.send().await.map_err(|e| map_request_error(&e))?;

        let status = response.status().as_u16();
        let expected_len = response.content_length();
        let body = response
            .bytes_stream()
            .map_err(|e| ImageError::transient(format!("body stream failed: {e}")))
            .boxed();

        Ok(FetchResponse {
            status,
            expected_len,
            // reqwest keeps no local HTTP cache, so responses are never
            // cache-served; caching transports report this themselves.
            from_cache: false,
            body,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted transport for downloader and manager tests.

    use std::pin::Pin;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::task::{Context, Poll};

    use futures_util::Stream;
    use futures_util::stream;
    use tokio::sync::Semaphore;

    use super::*;

    #[derive(Clone)]
    struct StubRoute {
        status: u16,
        chunks: Vec<Bytes>,
        from_cache: bool,
        error: Option<ImageError>,
        hang_body: bool,
        aborted: Arc<AtomicBool>,
    }

    /// Body stream that records whether it was dropped mid-transfer.
    struct TrackedBody {
        inner: BoxStream<'static, Result<Bytes>>,
        finished: bool,
        aborted: Arc<AtomicBool>,
    }

    impl Stream for TrackedBody {
        type Item = Result<Bytes>;

        fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            let this = self.get_mut();
            let poll = this.inner.poll_next_unpin(cx);
            if matches!(poll, Poll::Ready(None)) {
                this.finished = true;
            }
            poll
        }
    }

    impl Drop for TrackedBody {
        fn drop(&mut self) {
            if !self.finished {
                self.aborted.store(true, Ordering::SeqCst);
            }
        }
    }

    /// A [`Fetcher`] serving scripted responses and logging every request.
    pub(crate) struct StubFetcher {
        routes: Mutex<HashMap<String, StubRoute>>,
        log: Mutex<Vec<String>>,
        headers: Mutex<Vec<(String, String)>>,
        gate: Mutex<Option<Arc<Semaphore>>>,
        background: Mutex<Option<BackgroundGrant>>,
    }

    impl StubFetcher {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self {
                routes: Mutex::new(HashMap::new()),
                log: Mutex::new(Vec::new()),
                headers: Mutex::new(Vec::new()),
                gate: Mutex::new(None),
                background: Mutex::new(None),
            })
        }

        fn route() -> StubRoute {
            StubRoute {
                status: 200,
                chunks: Vec::new(),
                from_cache: false,
                error: None,
                hang_body: false,
                aborted: Arc::new(AtomicBool::new(false)),
            }
        }

        /// Serves `data` as a single-chunk 200 response.
        pub(crate) fn ok(&self, url: &str, data: Bytes) {
            let mut route = Self::route();
            route.chunks = vec![data];
            self.routes.lock().insert(url.to_string(), route);
        }

        /// Serves a multi-chunk 200 response.
        pub(crate) fn ok_chunks(&self, url: &str, chunks: Vec<Bytes>) {
            let mut route = Self::route();
            route.chunks = chunks;
            self.routes.lock().insert(url.to_string(), route);
        }

        /// Serves an empty response with the given status.
        pub(crate) fn status(&self, url: &str, status: u16) {
            let mut route = Self::route();
            route.status = status;
            self.routes.lock().insert(url.to_string(), route);
        }

        /// Fails the request outright with `error`.
        pub(crate) fn fail(&self, url: &str, error: ImageError) {
            let mut route = Self::route();
            route.error = Some(error);
            self.routes.lock().insert(url.to_string(), route);
        }

        /// Serves `data` flagged as coming from the local HTTP cache.
        pub(crate) fn from_cache(&self, url: &str, data: Bytes) {
            let mut route = Self::route();
            route.chunks = vec![data];
            route.from_cache = true;
            self.routes.lock().insert(url.to_string(), route);
        }

        /// Serves a body that never completes. Returns a flag that flips
        /// when the body is dropped before completion.
        pub(crate) fn hang(&self, url: &str) -> Arc<AtomicBool> {
            let mut route = Self::route();
            route.hang_body = true;
            let aborted = route.aborted.clone();
            self.routes.lock().insert(url.to_string(), route);
            aborted
        }

        /// Gates every fetch on a semaphore permit, letting tests stage
        /// job starts one release at a time.
        pub(crate) fn set_gate(&self, gate: Arc<Semaphore>) {
            *self.gate.lock() = Some(gate);
        }

        /// Makes `begin_background_task` hand out the given grant.
        pub(crate) fn set_background_grant(&self, grant: BackgroundGrant) {
            *self.background.lock() = Some(grant);
        }

        /// URLs in the order `fetch` was invoked.
        pub(crate) fn requests(&self) -> Vec<String> {
            self.log.lock().clone()
        }

        /// Number of fetches issued for `url`.
        pub(crate) fn request_count(&self, url: &str) -> usize {
            self.log.lock().iter().filter(|u| u.as_str() == url).count()
        }

        /// Headers of the most recent request.
        pub(crate) fn last_headers(&self) -> Vec<(String, String)> {
            self.headers.lock().clone()
        }
    }

    #[async_trait]
    impl Fetcher for StubFetcher {
        async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
            self.log.lock().push(request.url.clone());
            *self.headers.lock() = request.headers.clone();

            let gate = self.gate.lock().clone();
            if let Some(gate) = gate {
                let permit = gate
                    .acquire_owned()
                    .await
                    .map_err(|_| ImageError::network("stub gate closed"))?;
                permit.forget();
            }

            let route = self
                .routes
                .lock()
                .get(&request.url)
                .cloned()
                .ok_or_else(|| ImageError::network(format!("no stub route for {}", request.url)))?;

            if let Some(error) = route.error {
                return Err(error);
            }

            let expected_len = Some(route.chunks.iter().map(|c| c.len() as u64).sum());
            let chunks = stream::iter(route.chunks.into_iter().map(Ok));
            let inner: BoxStream<'static, Result<Bytes>> = if route.hang_body {
                chunks.chain(stream::pending()).boxed()
            } else {
                chunks.boxed()
            };
            let body = TrackedBody {
                inner,
                finished: false,
                aborted: route.aborted,
            }
            .boxed();

            Ok(FetchResponse {
                status: route.status,
                expected_len,
                from_cache: route.from_cache,
                body,
            })
        }

        fn begin_background_task(&self) -> Option<BackgroundGrant> {
            self.background.lock().clone()
        }
    }

    /// Polls `condition` until it holds or the deadline passes.
    pub(crate) async fn wait_until(condition: impl Fn() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(
                std::time::Instant::now() < deadline,
                "condition not reached within deadline"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
