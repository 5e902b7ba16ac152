//! Option bitsets controlling download and request behavior.

use bitflags::bitflags;

bitflags! {
    /// Options for a single downloader job.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DownloadOptions: u32 {
        /// Enqueue the job in the low-priority lane.
        const LOW_PRIORITY = 1 << 0;
        /// Attempt partial decodes as bytes arrive and deliver
        /// intermediate images with `finished = false`.
        const PROGRESSIVE_DOWNLOAD = 1 << 1;
        /// Allow the transport's local HTTP cache. Without this flag the
        /// request asks for a full reload, bypassing any local cache.
        const USE_HTTP_CACHE = 1 << 2;
        /// If the response was served from the transport's local cache,
        /// deliver `None` image and data instead of the cached payload.
        /// Meaningful only together with `USE_HTTP_CACHE`.
        const IGNORE_CACHED_RESPONSE = 1 << 3;
        /// Ask the transport for a background-execution grant so the
        /// download survives the app moving to the background. A no-op
        /// when the transport has no such capability.
        const CONTINUE_IN_BACKGROUND = 1 << 4;
        /// Attach and store cookies for the request.
        const HANDLE_COOKIES = 1 << 5;
        /// Accept untrusted TLS certificates. For test servers only.
        const ALLOW_INVALID_SSL_CERTIFICATES = 1 << 6;
        /// Enqueue the job in the high-priority lane.
        const HIGH_PRIORITY = 1 << 7;
    }
}

bitflags! {
    /// Options for a manager request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RequestOptions: u32 {
        /// Retry a URL that previously failed permanently. Without this
        /// flag, blacklisted URLs complete immediately with an error.
        const RETRY_FAILED = 1 << 0;
        /// Download in the low-priority lane.
        const LOW_PRIORITY = 1 << 1;
        /// Cache the result in memory only, skipping the disk write.
        const CACHE_MEMORY_ONLY = 1 << 2;
        /// Deliver intermediate images while the download progresses.
        const PROGRESSIVE_DOWNLOAD = 1 << 3;
        /// Deliver the cached image, then refetch and deliver the fresh
        /// one. For URLs whose content may change behind a stable key.
        const REFRESH_CACHED = 1 << 4;
        /// Keep downloading when the app moves to the background.
        const CONTINUE_IN_BACKGROUND = 1 << 5;
        /// Attach and store cookies for the request.
        const HANDLE_COOKIES = 1 << 6;
        /// Accept untrusted TLS certificates. For test servers only.
        const ALLOW_INVALID_SSL_CERTIFICATES = 1 << 7;
        /// Download in the high-priority lane.
        const HIGH_PRIORITY = 1 << 8;
        /// Delay placeholder display until the download completes.
        /// Honored by UI integrations; no effect in the core pipeline.
        const DELAY_PLACEHOLDER = 1 << 9;
        /// Apply the manager's transformer to animated images too.
        /// Without it, animated payloads bypass the transformer.
        const TRANSFORM_ANIMATED_IMAGE = 1 << 10;
        /// Suppress automatic image assignment after fetch completes.
        /// Honored by UI integrations; no effect in the core pipeline.
        const AVOID_AUTO_SET_IMAGE = 1 << 11;
    }
}

impl RequestOptions {
    /// Translates request options into their downloader equivalents.
    #[must_use]
    pub fn download_options(self) -> DownloadOptions {
        let mut options = DownloadOptions::empty();
        if self.contains(Self::LOW_PRIORITY) {
            options |= DownloadOptions::LOW_PRIORITY;
        }
        if self.contains(Self::PROGRESSIVE_DOWNLOAD) {
            options |= DownloadOptions::PROGRESSIVE_DOWNLOAD;
        }
        if self.contains(Self::CONTINUE_IN_BACKGROUND) {
            options |= DownloadOptions::CONTINUE_IN_BACKGROUND;
        }
        if self.contains(Self::HANDLE_COOKIES) {
            options |= DownloadOptions::HANDLE_COOKIES;
        }
        if self.contains(Self::ALLOW_INVALID_SSL_CERTIFICATES) {
            options |= DownloadOptions::ALLOW_INVALID_SSL_CERTIFICATES;
        }
        if self.contains(Self::HIGH_PRIORITY) {
            options |= DownloadOptions::HIGH_PRIORITY;
        }
        options
    }
}

/// Priority lane a download job is queued into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadPriority {
    /// Tail-biased lane, discharged after all others.
    Low,
    /// The default lane.
    #[default]
    Normal,
    /// Head-biased lane, discharged before all others.
    High,
}

impl DownloadPriority {
    /// Derives the lane from option bits. `HIGH_PRIORITY` wins over
    /// `LOW_PRIORITY` when both are set.
    #[must_use]
    pub fn from_options(options: DownloadOptions) -> Self {
        if options.contains(DownloadOptions::HIGH_PRIORITY) {
            Self::High
        } else if options.contains(DownloadOptions::LOW_PRIORITY) {
            Self::Low
        } else {
            Self::Normal
        }
    }
}

/// Discharge order for queued download jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionOrder {
    /// Jobs start in submission order.
    #[default]
    Fifo,
    /// The most recently submitted job starts next, per priority lane.
    Lifo,
}
