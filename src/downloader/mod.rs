//! Concurrent image downloader with per-URL request coalescing.
//!
//! Each URL has at most one live job; concurrent requests for it attach
//! as waiters and share the single transport operation. Jobs discharge
//! through a bounded-concurrency queue with priority lanes and a
//! runtime-selectable FIFO/LIFO order.

pub mod events;
mod job;
mod queue;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::codec;
use crate::error::{ImageError, Result};
use crate::executor::Deliverer;
use crate::fetcher::{BackgroundGrant, Credentials, FetchRequest, Fetcher};
use crate::options::{DownloadOptions, ExecutionOrder};

use events::{DownloadEvent, EventHub};
use job::DownloadJob;
use queue::{JobQueue, JobRunner};

pub use job::{DownloadCompleted, DownloadOutcome, DownloadProgress};

/// Rewrites the headers of an outgoing request: `(url, prepared
/// headers) -> final headers`. Overrides both the defaults and the
/// downloader-level header map.
pub type HeadersFilter =
    Arc<dyn Fn(&str, &[(String, String)]) -> Vec<(String, String)> + Send + Sync>;

/// Default soft cap on concurrently running downloads.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 6;

/// Default per-job transport timeout.
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(15);

/// Configuration for a [`Downloader`].
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Soft cap on concurrently running downloads.
    pub max_concurrent_downloads: usize,
    /// Transport timeout applied to every job.
    pub download_timeout: Duration,
    /// Initial discharge order; switchable at runtime.
    pub execution_order: ExecutionOrder,
    /// Whether downloaded images are forced through full pixel
    /// materialization before delivery.
    pub decompress_images: bool,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
            execution_order: ExecutionOrder::Fifo,
            decompress_images: true,
        }
    }
}

/// Cancellation token for one waiter on a download.
///
/// Cancelling removes only this waiter; the job itself is cancelled,
/// and its transport aborted, when the last waiter leaves.
pub struct DownloadToken {
    inner: Option<TokenInner>,
}

struct TokenInner {
    job: Arc<DownloadJob>,
    waiter_id: u64,
    cancelled: Arc<std::sync::atomic::AtomicBool>,
    jobs: Weak<Mutex<HashMap<String, Arc<DownloadJob>>>>,
}

impl DownloadToken {
    fn inert() -> Self {
        Self { inner: None }
    }

    fn live(
        job: Arc<DownloadJob>,
        handle: job::WaiterHandle,
        jobs: Weak<Mutex<HashMap<String, Arc<DownloadJob>>>>,
    ) -> Self {
        Self {
            inner: Some(TokenInner {
                job,
                waiter_id: handle.id,
                cancelled: handle.cancelled,
                jobs,
            }),
        }
    }

    /// Cancels this waiter. Idempotent; a no-op once the job is
    /// delivering terminal callbacks.
    pub fn cancel(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        if inner.job.remove_waiter(inner.waiter_id) == job::WaiterRemoval::RemovedLast {
            debug!(url = inner.job.url(), "last waiter left, cancelling job");
            inner.job.cancel();
            if let Some(jobs) = inner.jobs.upgrade() {
                let mut map = jobs.lock();
                if map
                    .get(inner.job.url())
                    .is_some_and(|current| Arc::ptr_eq(current, &inner.job))
                {
                    map.remove(inner.job.url());
                }
            }
        }
    }

    /// Returns whether this waiter has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner
            .as_ref()
            .is_none_or(|inner| inner.cancelled.load(Ordering::SeqCst))
    }
}

struct JobContext {
    fetcher: Arc<dyn Fetcher>,
    jobs: Arc<Mutex<HashMap<String, Arc<DownloadJob>>>>,
    deliverer: Deliverer,
    events: EventHub,
    headers: RwLock<HashMap<String, String>>,
    headers_filter: RwLock<Option<HeadersFilter>>,
    credentials: RwLock<Option<Credentials>>,
    timeout: Duration,
    decompress: bool,
    active: AtomicUsize,
}

/// Asynchronous image downloader.
pub struct Downloader {
    ctx: Arc<JobContext>,
    queue: JobQueue,
    order: Mutex<ExecutionOrder>,
    config: DownloaderConfig,
}

impl Downloader {
    /// Creates a downloader over the given transport with default
    /// settings. Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(fetcher: Arc<dyn Fetcher>) -> Self {
        Self::with_config(fetcher, DownloaderConfig::default())
    }

    /// Creates a downloader from an explicit configuration.
    #[must_use]
    pub fn with_config(fetcher: Arc<dyn Fetcher>, config: DownloaderConfig) -> Self {
        Self::build(fetcher, config, Deliverer::new())
    }

    pub(crate) fn build(
        fetcher: Arc<dyn Fetcher>,
        config: DownloaderConfig,
        deliverer: Deliverer,
    ) -> Self {
        let ctx = Arc::new(JobContext {
            fetcher,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            deliverer,
            events: EventHub::new(),
            headers: RwLock::new(HashMap::new()),
            headers_filter: RwLock::new(None),
            credentials: RwLock::new(None),
            timeout: config.download_timeout,
            decompress: config.decompress_images,
            active: AtomicUsize::new(0),
        });

        let runner_ctx = ctx.clone();
        let runner: JobRunner = Arc::new(move |job| {
            let ctx = runner_ctx.clone();
            Box::pin(run_job(ctx, job))
        });
        let queue = JobQueue::new(config.max_concurrent_downloads, config.execution_order, runner);

        Self {
            ctx,
            queue,
            order: Mutex::new(config.execution_order),
            config,
        }
    }

    /// Downloads `url`, coalescing with any in-flight job for it.
    ///
    /// A live job gains `(progress, completed)` as a new waiter and
    /// nothing new is scheduled; otherwise a job is created and queued.
    /// The returned token unregisters this waiter only.
    pub fn download(
        &self,
        url: &str,
        options: DownloadOptions,
        progress: Option<DownloadProgress>,
        completed: Option<DownloadCompleted>,
    ) -> DownloadToken {
        if url.is_empty() {
            if let Some(completed) = completed {
                self.ctx.deliverer.deliver(move || {
                    completed(DownloadOutcome {
                        image: None,
                        data: None,
                        error: Some(ImageError::invalid_url("empty URL")),
                        finished: true,
                    });
                });
            }
            return DownloadToken::inert();
        }

        let mut jobs = self.ctx.jobs.lock();
        if let Some(job) = jobs.get(url)
            && let Some(handle) = job.add_waiter(progress.clone(), completed.clone())
        {
            trace!(url, "joined in-flight download");
            return DownloadToken::live(job.clone(), handle, Arc::downgrade(&self.ctx.jobs));
        }

        let job = DownloadJob::new(url, options);
        let Some(handle) = job.add_waiter(progress, completed) else {
            // Unreachable: a fresh job always accepts waiters.
            return DownloadToken::inert();
        };
        jobs.insert(url.to_string(), job.clone());
        drop(jobs);

        debug!(url, ?options, "download queued");
        self.queue.submit(job.clone());
        DownloadToken::live(job, handle, Arc::downgrade(&self.ctx.jobs))
    }

    /// Sets a downloader-level header field sent with every request.
    /// `None` removes the field.
    pub fn set_header(&self, field: &str, value: Option<&str>) {
        let mut headers = self.ctx.headers.write();
        match value {
            Some(value) => {
                headers.insert(field.to_string(), value.to_string());
            }
            None => {
                headers.remove(field);
            }
        }
    }

    /// Returns the downloader-level value for a header field.
    #[must_use]
    pub fn header(&self, field: &str) -> Option<String> {
        self.ctx.headers.read().get(field).cloned()
    }

    /// Installs a filter that rewrites every request's headers.
    pub fn set_headers_filter(&self, filter: Option<HeadersFilter>) {
        *self.ctx.headers_filter.write() = filter;
    }

    /// Sets Basic-auth credentials supplied on authentication
    /// challenges.
    pub fn set_credentials(&self, credentials: Option<Credentials>) {
        *self.ctx.credentials.write() = credentials;
    }

    /// Pauses or resumes queue discharge. Running jobs continue.
    pub fn set_suspended(&self, suspended: bool) {
        self.queue.set_suspended(suspended);
    }

    /// Switches the discharge order for jobs not yet started.
    pub fn set_execution_order(&self, order: ExecutionOrder) {
        *self.order.lock() = order;
        self.queue.set_order(order);
    }

    /// The current discharge order.
    #[must_use]
    pub fn execution_order(&self) -> ExecutionOrder {
        *self.order.lock()
    }

    /// Number of jobs currently executing on workers.
    #[must_use]
    pub fn current_download_count(&self) -> usize {
        self.ctx.active.load(Ordering::SeqCst)
    }

    /// Number of live jobs, queued or running.
    #[must_use]
    pub fn active_job_count(&self) -> usize {
        self.ctx.jobs.lock().len()
    }

    /// The configured concurrency cap.
    #[must_use]
    pub fn max_concurrent_downloads(&self) -> usize {
        self.config.max_concurrent_downloads
    }

    /// The configured per-job transport timeout.
    #[must_use]
    pub fn download_timeout(&self) -> Duration {
        self.config.download_timeout
    }

    /// The hub publishing download lifecycle events.
    #[must_use]
    pub fn events(&self) -> EventHub {
        self.ctx.events.clone()
    }
}

fn build_request(ctx: &JobContext, job: &DownloadJob) -> FetchRequest {
    let mut headers = vec![("Accept".to_string(), "image/*;q=0.8".to_string())];
    for (field, value) in ctx.headers.read().iter() {
        headers.push((field.clone(), value.clone()));
    }
    if let Some(filter) = ctx.headers_filter.read().clone() {
        headers = filter(job.url(), &headers);
    }

    let options = job.options();
    FetchRequest {
        url: job.url().to_string(),
        headers,
        timeout: ctx.timeout,
        use_http_cache: options.contains(DownloadOptions::USE_HTTP_CACHE),
        handle_cookies: options.contains(DownloadOptions::HANDLE_COOKIES),
        allow_invalid_certs: options.contains(DownloadOptions::ALLOW_INVALID_SSL_CERTIFICATES),
        credentials: ctx.credentials.read().clone(),
    }
}

fn remove_job(ctx: &JobContext, job: &Arc<DownloadJob>) {
    let mut jobs = ctx.jobs.lock();
    if jobs
        .get(job.url())
        .is_some_and(|current| Arc::ptr_eq(current, job))
    {
        jobs.remove(job.url());
    }
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // The job outlives its run; a closed channel cannot happen
            // while this future is polled.
            std::future::pending::<()>().await;
        }
    }
}

enum Fetched {
    Image {
        image: Arc<image::DynamicImage>,
        data: Bytes,
    },
    /// Served from the transport's HTTP cache while the job asked for
    /// cache-served responses to be suppressed.
    CacheServed,
}

async fn run_job(ctx: Arc<JobContext>, job: Arc<DownloadJob>) {
    if !job.begin_running() {
        remove_job(&ctx, &job);
        return;
    }

    let url = job.url().to_string();
    ctx.active.fetch_add(1, Ordering::SeqCst);
    ctx.events.publish(DownloadEvent::Started { url: url.clone() });

    let result = execute(&ctx, &job).await;

    ctx.active.fetch_sub(1, Ordering::SeqCst);
    ctx.events.publish(DownloadEvent::Stopped { url: url.clone() });

    match result {
        Err(ImageError::Cancelled) => {
            trace!(url, "job cancelled, no callbacks");
            remove_job(&ctx, &job);
        }
        Err(error) => {
            debug!(url, error = %error, "download failed");
            finish(
                &ctx,
                &job,
                DownloadOutcome {
                    image: None,
                    data: None,
                    error: Some(error),
                    finished: true,
                },
            );
        }
        Ok(Fetched::CacheServed) => {
            finish(
                &ctx,
                &job,
                DownloadOutcome {
                    image: None,
                    data: None,
                    error: None,
                    finished: true,
                },
            );
        }
        Ok(Fetched::Image { image, data }) => {
            ctx.events.publish(DownloadEvent::Finished { url });
            finish(
                &ctx,
                &job,
                DownloadOutcome {
                    image: Some(image),
                    data: Some(data),
                    error: None,
                    finished: true,
                },
            );
        }
    }
}

async fn execute(ctx: &Arc<JobContext>, job: &Arc<DownloadJob>) -> Result<Fetched> {
    let options = job.options();
    let grant = if options.contains(DownloadOptions::CONTINUE_IN_BACKGROUND) {
        ctx.fetcher.begin_background_task()
    } else {
        None
    };

    let request = build_request(ctx, job);
    let mut cancel = job.subscribe_cancel();

    let response = tokio::select! {
        () = wait_cancelled(&mut cancel) => return Err(ImageError::Cancelled),
        response = ctx.fetcher.fetch(request) => response?,
    };

    ctx.events.publish(DownloadEvent::ReceivedResponse {
        url: job.url().to_string(),
        status: response.status,
    });

    if !(200..300).contains(&response.status) {
        return Err(ImageError::HttpStatus {
            status: response.status,
        });
    }

    if response.from_cache && options.contains(DownloadOptions::IGNORE_CACHED_RESPONSE) {
        return Ok(Fetched::CacheServed);
    }

    job.set_expected(response.expected_len);
    let mut body = response.body;
    let mut buf: Vec<u8> = Vec::new();

    loop {
        let chunk = tokio::select! {
            () = wait_cancelled(&mut cancel) => return Err(ImageError::Cancelled),
            () = revoked(grant.as_ref()) => {
                job.cancel();
                return Err(ImageError::Cancelled);
            }
            chunk = body.next() => chunk,
        };
        let Some(chunk) = chunk else { break };
        let chunk = chunk?;

        if job.is_cancelled() {
            return Err(ImageError::Cancelled);
        }

        buf.extend_from_slice(&chunk);
        job.record_bytes(buf.len() as u64);
        deliver_progress(ctx, job);

        if options.contains(DownloadOptions::PROGRESSIVE_DOWNLOAD) {
            deliver_partial(ctx, job, &buf).await;
        }
    }
    drop(body);

    if job.is_cancelled() {
        return Err(ImageError::Cancelled);
    }
    if buf.is_empty() {
        return Err(ImageError::decode("empty image data"));
    }

    let data = Bytes::from(buf);
    let image = codec::decode(data.clone(), ctx.decompress).await?;

    // Last observation point before terminal delivery.
    if job.is_cancelled() {
        return Err(ImageError::Cancelled);
    }
    Ok(Fetched::Image { image, data })
}

async fn revoked(grant: Option<&BackgroundGrant>) {
    match grant {
        Some(grant) => grant.revoked().await,
        None => std::future::pending().await,
    }
}

fn deliver_progress(ctx: &JobContext, job: &DownloadJob) {
    let (callbacks, received, expected) = job.progress_snapshot();
    for (progress, cancelled) in callbacks {
        ctx.deliverer.deliver(move || {
            if !cancelled.load(Ordering::SeqCst) {
                progress(received, expected);
            }
        });
    }
}

/// Attempts a decode of the accumulated prefix; a decodable prefix is
/// delivered to every waiter with `finished = false`.
async fn deliver_partial(ctx: &JobContext, job: &DownloadJob, buf: &[u8]) {
    let data = Bytes::copy_from_slice(buf);
    let decompress = ctx.decompress;
    let decoded =
        tokio::task::spawn_blocking(move || codec::decode_blocking(&data, decompress)).await;
    let Ok(Ok(image)) = decoded else {
        return;
    };

    let image = Arc::new(image);
    for (completed, cancelled) in job.completed_snapshot() {
        let outcome = DownloadOutcome {
            image: Some(image.clone()),
            data: None,
            error: None,
            finished: false,
        };
        ctx.deliverer.deliver(move || {
            if !cancelled.load(Ordering::SeqCst) {
                completed(outcome);
            }
        });
    }
}

fn finish(ctx: &JobContext, job: &Arc<DownloadJob>, outcome: DownloadOutcome) {
    let waiters = job.begin_finishing();
    remove_job(ctx, job);

    for waiter in waiters {
        let Some(completed) = waiter.completed else {
            continue;
        };
        let cancelled = waiter.cancelled;
        let outcome = outcome.clone();
        ctx.deliverer.deliver(move || {
            if !cancelled.load(Ordering::SeqCst) {
                completed(outcome);
            }
        });
    }
    job.finish();
}
