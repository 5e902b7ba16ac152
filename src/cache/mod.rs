//! Two-tier image cache: a cost-bounded memory map over a purgeable
//! disk directory.
//!
//! Memory lookups are synchronous. Everything that touches the disk is
//! serialized on a dedicated I/O queue and reports back through the
//! delivery queue, so callers never block and per-key disk operations
//! observe submission order.

mod disk;
mod memory;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use image::DynamicImage;
use tokio::fs;
use tracing::{debug, warn};

use crate::codec;
use crate::error::{ImageError, Result};
use crate::executor::{Deliverer, SerialExecutor};
use crate::key::CacheKey;

use disk::DiskStore;
use memory::MemoryStore;

/// Directory prefix of the namespaced disk cache. The value matches the
/// SDWebImage on-disk layout so existing cache directories are reused.
pub const DISK_CACHE_PREFIX: &str = "com.hackemist.SDWebImageCache.";

/// Default maximum age of a disk entry: one week.
pub const DEFAULT_MAX_CACHE_AGE: Duration = Duration::from_secs(60 * 60 * 24 * 7);

/// Which tier satisfied a lookup. `None` means the image had to come
/// from the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CacheSource {
    /// Not cached; fetched from the network.
    #[default]
    None,
    /// Served from the disk tier.
    Disk,
    /// Served from the memory tier.
    Memory,
}

/// Configuration for an [`ImageCache`].
#[derive(Debug, Clone)]
pub struct ImageCacheConfig {
    /// Namespace isolating this cache's entries from other caches.
    pub namespace: String,
    /// Root for the disk tier. Defaults to the platform caches
    /// directory. The namespaced cache directory is created inside it.
    pub disk_directory: Option<PathBuf>,
    /// Memory bound on total entry cost (pixels). Zero means unbounded.
    pub max_memory_cost: u64,
    /// Memory bound on entry count. Zero means unbounded.
    pub max_memory_count: usize,
    /// Disk entries older than this are deleted by [`ImageCache::clean_disk`].
    pub max_cache_age: Duration,
    /// Disk size bound in bytes enforced by [`ImageCache::clean_disk`].
    /// Zero means unbounded.
    pub max_cache_size: u64,
    /// Whether images are cached in memory at all.
    pub cache_images_in_memory: bool,
    /// Whether decoded images are forced through full pixel
    /// materialization before caching, trading memory for fast first
    /// render.
    pub decompress_images: bool,
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            disk_directory: None,
            max_memory_cost: 0,
            max_memory_count: 0,
            max_cache_age: DEFAULT_MAX_CACHE_AGE,
            max_cache_size: 0,
            cache_images_in_memory: true,
            decompress_images: true,
        }
    }
}

impl ImageCacheConfig {
    /// Creates a configuration for the given namespace.
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Self::default()
        }
    }

    /// Sets the disk root directory.
    #[must_use]
    pub fn with_disk_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.disk_directory = Some(dir.into());
        self
    }

    /// Sets the memory cost bound.
    #[must_use]
    pub fn with_max_memory_cost(mut self, cost: u64) -> Self {
        self.max_memory_cost = cost;
        self
    }

    /// Sets the memory entry-count bound.
    #[must_use]
    pub fn with_max_memory_count(mut self, count: usize) -> Self {
        self.max_memory_count = count;
        self
    }

    /// Sets the disk age bound.
    #[must_use]
    pub fn with_max_cache_age(mut self, age: Duration) -> Self {
        self.max_cache_age = age;
        self
    }

    /// Sets the disk size bound.
    #[must_use]
    pub fn with_max_cache_size(mut self, size: u64) -> Self {
        self.max_cache_size = size;
        self
    }

    /// Disables the memory tier entirely.
    #[must_use]
    pub fn without_memory_cache(mut self) -> Self {
        self.cache_images_in_memory = false;
        self
    }

    /// Disables forced pixel materialization.
    #[must_use]
    pub fn without_decompression(mut self) -> Self {
        self.decompress_images = false;
        self
    }
}

/// Cancellation token for an in-flight [`ImageCache::query`].
///
/// Cancelling prevents delivery and skips any decode not yet started.
/// Idempotent.
#[derive(Debug, Clone)]
pub struct QueryToken {
    cancelled: Arc<AtomicBool>,
}

impl QueryToken {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cancels the query.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns whether the query was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A keyed two-tier image store.
pub struct ImageCache {
    memory: Arc<MemoryStore>,
    disk: Arc<DiskStore>,
    io: SerialExecutor,
    deliverer: Deliverer,
    memory_enabled: bool,
    decompress: bool,
}

impl ImageCache {
    /// Creates a cache for `namespace` with default settings.
    ///
    /// # Errors
    /// Returns an error when the cache directory cannot be created.
    pub async fn new(namespace: &str) -> Result<Self> {
        Self::with_config(ImageCacheConfig::new(namespace)).await
    }

    /// Creates a cache from an explicit configuration.
    ///
    /// # Errors
    /// Returns an error when the cache directory cannot be created.
    pub async fn with_config(config: ImageCacheConfig) -> Result<Self> {
        Self::build(config, Deliverer::new()).await
    }

    pub(crate) async fn build(config: ImageCacheConfig, deliverer: Deliverer) -> Result<Self> {
        let dir = Self::disk_cache_dir(&config.namespace, config.disk_directory.as_deref());
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| ImageError::io(format!("failed to create cache dir: {e}")))?;
        debug!(dir = %dir.display(), "image cache ready");

        Ok(Self {
            memory: Arc::new(MemoryStore::new(
                config.max_memory_cost,
                config.max_memory_count,
            )),
            disk: Arc::new(DiskStore::new(dir, config.max_cache_age, config.max_cache_size)),
            io: SerialExecutor::new("disk-io"),
            deliverer,
            memory_enabled: config.cache_images_in_memory,
            decompress: config.decompress_images,
        })
    }

    fn disk_cache_dir(namespace: &str, root: Option<&Path>) -> PathBuf {
        let root = root.map_or_else(
            || {
                directories::BaseDirs::new()
                    .map_or_else(std::env::temp_dir, |dirs| dirs.cache_dir().to_path_buf())
            },
            Path::to_path_buf,
        );
        root.join(format!("{DISK_CACHE_PREFIX}{namespace}"))
    }

    /// The default on-disk directory for `namespace`.
    #[must_use]
    pub fn default_disk_cache_dir(namespace: &str) -> PathBuf {
        Self::disk_cache_dir(namespace, None)
    }

    /// The on-disk path `key` maps to inside this cache.
    #[must_use]
    pub fn default_cache_path_for_key(&self, key: &CacheKey) -> PathBuf {
        self.disk.path_for(key)
    }

    /// The on-disk path `key` would map to inside an arbitrary root.
    #[must_use]
    pub fn cache_path_for_key(dir: &Path, key: &CacheKey) -> PathBuf {
        DiskStore::path_in(dir, key)
    }

    /// Adds a read-only directory searched on disk misses, after the
    /// primary directory and any previously added overlay. Overlays are
    /// never written to and never purged.
    pub fn add_read_only_path(&self, path: impl Into<PathBuf>) {
        self.disk.add_overlay(path.into());
    }

    /// Stores an image in memory and on disk, re-encoding it for the
    /// disk tier.
    pub fn store(&self, key: &CacheKey, image: Arc<DynamicImage>) {
        self.store_with_options(key, image, None, true, true);
    }

    /// Stores an image, with full control over the disk write.
    ///
    /// With `data` present and `recalculate_from_image` false, the raw
    /// bytes persist verbatim, preserving the original encoding. With
    /// `data` absent or `recalculate_from_image` true, the image is
    /// re-encoded to PNG. The disk write is scheduled on the I/O queue
    /// and never blocks the caller; disk failures are logged and
    /// swallowed.
    pub fn store_with_options(
        &self,
        key: &CacheKey,
        image: Arc<DynamicImage>,
        data: Option<Bytes>,
        to_disk: bool,
        recalculate_from_image: bool,
    ) {
        if self.memory_enabled {
            self.memory
                .insert(key.clone(), image.clone(), codec::pixel_cost(&image));
        }
        if !to_disk {
            return;
        }

        let disk = self.disk.clone();
        let key = key.clone();
        self.io.submit(async move {
            let payload = if recalculate_from_image || data.is_none() {
                match codec::encode_png(image).await {
                    Ok(encoded) => Some(encoded),
                    Err(e) => {
                        warn!(key = %key, error = %e, "failed to encode image for disk");
                        None
                    }
                }
            } else {
                data
            };

            if let Some(payload) = payload
                && let Err(e) = disk.write(&key, &payload).await
            {
                warn!(key = %key, error = %e, "disk store failed");
            }
        });
    }

    /// Stores an image in memory only, with an explicit cost overriding
    /// the default pixel count.
    pub fn store_with_cost(&self, key: &CacheKey, image: Arc<DynamicImage>, cost: u64) {
        if self.memory_enabled {
            self.memory.insert(key.clone(), image, cost);
        }
    }

    /// Looks up `key` in both tiers and delivers the result on the
    /// delivery queue.
    ///
    /// Memory is checked synchronously; a hit delivers immediately. On a
    /// miss the disk tier is consulted on the I/O queue, the entry is
    /// decoded off-thread, promoted into memory, and delivered. The
    /// returned token cancels delivery at any point.
    pub fn query<F>(&self, key: &CacheKey, completed: F) -> QueryToken
    where
        F: FnOnce(Option<Arc<DynamicImage>>, CacheSource) + Send + 'static,
    {
        let token = QueryToken::new();

        if self.memory_enabled
            && let Some(image) = self.memory.get(key)
        {
            let guard = token.clone();
            self.deliverer.deliver(move || {
                if !guard.is_cancelled() {
                    completed(Some(image), CacheSource::Memory);
                }
            });
            return token;
        }

        let disk = self.disk.clone();
        let memory = self.memory.clone();
        let deliverer = self.deliverer.clone();
        let memory_enabled = self.memory_enabled;
        let decompress = self.decompress;
        let key = key.clone();
        let guard = token.clone();

        self.io.submit(async move {
            if guard.is_cancelled() {
                return;
            }

            let Some(data) = disk.read(&key).await else {
                deliverer.deliver(move || {
                    if !guard.is_cancelled() {
                        completed(None, CacheSource::None);
                    }
                });
                return;
            };

            // Cancellation between the read and the decode skips the
            // decode entirely.
            if guard.is_cancelled() {
                return;
            }

            match codec::decode(data, decompress).await {
                Ok(image) => {
                    if memory_enabled {
                        memory.insert(key.clone(), image.clone(), codec::pixel_cost(&image));
                    }
                    deliverer.deliver(move || {
                        if !guard.is_cancelled() {
                            completed(Some(image), CacheSource::Disk);
                        }
                    });
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "failed to decode disk cache entry");
                    deliverer.deliver(move || {
                        if !guard.is_cancelled() {
                            completed(None, CacheSource::None);
                        }
                    });
                }
            }
        });

        token
    }

    /// Synchronous, non-mutating memory lookup.
    #[must_use]
    pub fn image_in_memory(&self, key: &CacheKey) -> Option<Arc<DynamicImage>> {
        if !self.memory_enabled {
            return None;
        }
        self.memory.peek(key)
    }

    /// Synchronous disk lookup for callers willing to block. Searches
    /// the primary directory, then overlays in insertion order, and
    /// promotes a hit into the memory tier.
    #[must_use]
    pub fn image_on_disk(&self, key: &CacheKey) -> Option<Arc<DynamicImage>> {
        let data = self.disk.read_sync(key)?;
        match codec::decode_blocking(&data, self.decompress) {
            Ok(image) => {
                let image = Arc::new(image);
                if self.memory_enabled {
                    self.memory
                        .insert(key.clone(), image.clone(), codec::pixel_cost(&image));
                }
                Some(image)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "failed to decode disk cache entry");
                None
            }
        }
    }

    /// Removes `key` from memory immediately, and from disk on the I/O
    /// queue when `from_disk` is set.
    pub fn remove(&self, key: &CacheKey, from_disk: bool) {
        self.memory.remove(key);
        if from_disk {
            let disk = self.disk.clone();
            let key = key.clone();
            self.io.submit(async move {
                disk.remove(&key).await;
            });
        }
    }

    /// [`Self::remove`] with a completion callback on the delivery queue.
    pub fn remove_with_completion<F>(&self, key: &CacheKey, from_disk: bool, on_done: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.memory.remove(key);
        if from_disk {
            let disk = self.disk.clone();
            let deliverer = self.deliverer.clone();
            let key = key.clone();
            self.io.submit(async move {
                disk.remove(&key).await;
                deliverer.deliver(on_done);
            });
        } else {
            self.deliverer.deliver(on_done);
        }
    }

    /// Drops every memory entry.
    pub fn clear_memory(&self) {
        self.memory.clear();
    }

    /// Reaction to a platform memory-pressure signal: the entire memory
    /// tier is discarded.
    pub fn handle_memory_warning(&self) {
        debug!("memory warning, dropping memory cache");
        self.clear_memory();
    }

    /// Deletes the primary disk directory and recreates it empty.
    /// Overlays are untouched. Returns immediately.
    pub fn clear_disk(&self) {
        let disk = self.disk.clone();
        self.io.submit(async move {
            disk.clear().await;
        });
    }

    /// [`Self::clear_disk`] with a completion callback on the delivery
    /// queue.
    pub fn clear_disk_with_completion<F>(&self, on_done: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let disk = self.disk.clone();
        let deliverer = self.deliverer.clone();
        self.io.submit(async move {
            disk.clear().await;
            deliverer.deliver(on_done);
        });
    }

    /// Purges expired disk entries, then shrinks the directory to half
    /// the size bound when it overflows. Returns immediately.
    pub fn clean_disk(&self) {
        let disk = self.disk.clone();
        self.io.submit(async move {
            disk.clean().await;
        });
    }

    /// [`Self::clean_disk`] with a completion callback on the delivery
    /// queue.
    pub fn clean_disk_with_completion<F>(&self, on_done: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let disk = self.disk.clone();
        let deliverer = self.deliverer.clone();
        self.io.submit(async move {
            disk.clean().await;
            deliverer.deliver(on_done);
        });
    }

    /// Total size in bytes of the primary disk directory, blocking.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.disk.size_sync()
    }

    /// Number of entries in the primary disk directory, blocking.
    #[must_use]
    pub fn count(&self) -> usize {
        self.disk.count_sync()
    }

    /// Computes the disk file count and total size on the I/O queue and
    /// delivers both on the delivery queue.
    pub fn calculate_size<F>(&self, completed: F)
    where
        F: FnOnce(usize, u64) + Send + 'static,
    {
        let disk = self.disk.clone();
        let deliverer = self.deliverer.clone();
        self.io.submit(async move {
            let (count, size) = disk.calculate().await;
            deliverer.deliver(move || completed(count, size));
        });
    }

    /// Synchronous disk existence check, searching overlays too.
    #[must_use]
    pub fn exists_on_disk(&self, key: &CacheKey) -> bool {
        self.disk.exists_sync(key)
    }

    /// Asynchronous disk existence check, ordered after pending disk
    /// writes, delivered on the delivery queue.
    pub fn exists_on_disk_async<F>(&self, key: &CacheKey, completed: F)
    where
        F: FnOnce(bool) + Send + 'static,
    {
        let disk = self.disk.clone();
        let deliverer = self.deliverer.clone();
        let key = key.clone();
        self.io.submit(async move {
            let exists = disk.exists_sync(&key);
            deliverer.deliver(move || completed(exists));
        });
    }

    /// Number of entries currently in the memory tier.
    #[must_use]
    pub fn memory_count(&self) -> usize {
        self.memory.count()
    }

    /// Total cost currently held by the memory tier.
    #[must_use]
    pub fn memory_cost(&self) -> u64 {
        self.memory.total_cost()
    }
}
