//! Asynchronous web image fetching with a two-tier cache.
//!
//! This crate resolves image URLs to decoded images through three
//! composable pieces:
//!
//! - [`ImageCache`] — a cost-bounded memory map over an age- and
//!   size-purged disk directory, with read-only overlay paths.
//! - [`Downloader`] — a bounded-concurrency download queue that
//!   coalesces concurrent requests for one URL into a single transport
//!   operation, with progressive delivery and FIFO/LIFO discharge.
//! - [`Manager`] — the end-to-end contract: cache lookup, coalesced
//!   download, decode, optional transform, store-back, and a failure
//!   blacklist, all behind one cancellable handle per request.
//!
//! The HTTP transport is a port ([`Fetcher`]); the bundled
//! [`HttpFetcher`] speaks HTTP via reqwest and custom transports are
//! injectable for tests and platform integrations.
//!
//! ```no_run
//! use std::sync::Arc;
//! use oxipix::{Manager, ManagerConfig, RequestCompleted, RequestOptions};
//!
//! # async fn run() -> oxipix::Result<()> {
//! let manager = Manager::new(ManagerConfig::default()).await?;
//!
//! let completed: RequestCompleted = Arc::new(|response| {
//!     if let Some(image) = response.image {
//!         println!("{}x{} via {:?}", image.width(), image.height(), response.source);
//!     }
//! });
//! let _handle = manager.request(
//!     "https://example.com/logo.png",
//!     RequestOptions::empty(),
//!     None,
//!     Some(completed),
//! );
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Two-tier (memory + disk) image cache.
pub mod cache;
pub(crate) mod codec;
/// Coalescing, bounded-concurrency image downloader.
pub mod downloader;
/// Error taxonomy.
pub mod error;
pub(crate) mod executor;
/// Transport port and the default HTTP implementation.
pub mod fetcher;
/// Cache key derivation.
pub mod key;
/// The cache-then-network orchestrator.
pub mod manager;
/// Download and request option bitsets.
pub mod options;

pub use cache::{CacheSource, ImageCache, ImageCacheConfig, QueryToken};
pub use downloader::events::{DownloadEvent, EventHub};
pub use downloader::{
    DownloadCompleted, DownloadOutcome, DownloadProgress, DownloadToken, Downloader,
    DownloaderConfig, HeadersFilter,
};
pub use error::{ImageError, Result};
pub use fetcher::{
    BackgroundGrant, BackgroundRevoker, Credentials, FetchRequest, FetchResponse, Fetcher,
    HttpFetcher,
};
pub use key::{CacheKey, KeyFilter};
pub use manager::{
    DownloadGate, ImageResponse, ImageTransformer, Manager, ManagerConfig, RequestCompleted,
    RequestHandle,
};
pub use options::{DownloadOptions, DownloadPriority, ExecutionOrder, RequestOptions};

/// Current version of the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
