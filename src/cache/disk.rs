//! On-disk image store with age- and size-bounded purging.
//!
//! Entries live flat under one directory, named by the hex SHA-256 of
//! their key so URL characters never reach the filesystem. File mtime is
//! the last-access timestamp and drives the age purge. Callers serialize
//! every mutating operation on the cache's I/O executor; read-only
//! overlay directories are searched on misses but never written to.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use filetime::FileTime;
use parking_lot::RwLock;
use tokio::fs;
use tracing::{debug, trace, warn};

use crate::error::{ImageError, Result};
use crate::key::CacheKey;

pub(crate) struct DiskStore {
    dir: PathBuf,
    overlays: RwLock<Vec<PathBuf>>,
    max_age: Duration,
    max_size: u64,
}

impl DiskStore {
    pub(crate) fn new(dir: PathBuf, max_age: Duration, max_size: u64) -> Self {
        Self {
            dir,
            overlays: RwLock::new(Vec::new()),
            max_age,
            max_size,
        }
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of `key` inside an arbitrary root directory.
    pub(crate) fn path_in(dir: &Path, key: &CacheKey) -> PathBuf {
        dir.join(key.hex_digest())
    }

    /// Path of `key` inside the primary directory.
    pub(crate) fn path_for(&self, key: &CacheKey) -> PathBuf {
        Self::path_in(&self.dir, key)
    }

    fn temp_path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!(".{}.tmp", key.hex_digest()))
    }

    pub(crate) fn add_overlay(&self, path: PathBuf) {
        self.overlays.write().push(path);
    }

    /// Reads an entry, searching the primary directory first and then
    /// every overlay in insertion order. A primary hit refreshes the
    /// file's mtime so the age purge sees it as recently used.
    pub(crate) async fn read(&self, key: &CacheKey) -> Option<Bytes> {
        let path = self.path_for(key);
        if let Ok(data) = fs::read(&path).await {
            trace!(key = %key, path = %path.display(), "disk cache hit");
            if let Err(e) = filetime::set_file_mtime(&path, FileTime::now()) {
                warn!(path = %path.display(), error = %e, "failed to refresh access time");
            }
            return Some(Bytes::from(data));
        }

        let overlays = self.overlays.read().clone();
        for overlay in overlays {
            let path = Self::path_in(&overlay, key);
            if let Ok(data) = fs::read(&path).await {
                trace!(key = %key, path = %path.display(), "overlay cache hit");
                return Some(Bytes::from(data));
            }
        }

        trace!(key = %key, "disk cache miss");
        None
    }

    /// Blocking read for callers that accept synchronous I/O.
    pub(crate) fn read_sync(&self, key: &CacheKey) -> Option<Vec<u8>> {
        if let Ok(data) = std::fs::read(self.path_for(key)) {
            return Some(data);
        }
        let overlays = self.overlays.read().clone();
        for overlay in overlays {
            if let Ok(data) = std::fs::read(Self::path_in(&overlay, key)) {
                return Some(data);
            }
        }
        None
    }

    /// Writes an entry atomically: the bytes land in a temp file that is
    /// renamed over the destination, so a reader either sees the full
    /// content or nothing.
    pub(crate) async fn write(&self, key: &CacheKey, data: &[u8]) -> Result<()> {
        if let Err(e) = fs::create_dir_all(&self.dir).await {
            return Err(ImageError::io(format!("failed to create cache dir: {e}")));
        }

        let temp = self.temp_path_for(key);
        let path = self.path_for(key);

        if let Err(e) = fs::write(&temp, data).await {
            let _ = fs::remove_file(&temp).await;
            return Err(ImageError::io(format!("failed to write cache file: {e}")));
        }
        if let Err(e) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(ImageError::io(format!("failed to commit cache file: {e}")));
        }

        debug!(key = %key, path = %path.display(), size = data.len(), "stored on disk");
        Ok(())
    }

    pub(crate) async fn remove(&self, key: &CacheKey) {
        let path = self.path_for(key);
        if let Err(e) = fs::remove_file(&path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), error = %e, "failed to remove cache file");
        }
    }

    /// Deletes the primary directory and recreates it empty. Overlays
    /// are untouched.
    pub(crate) async fn clear(&self) {
        if let Err(e) = fs::remove_dir_all(&self.dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(dir = %self.dir.display(), error = %e, "failed to clear disk cache");
        }
        if let Err(e) = fs::create_dir_all(&self.dir).await {
            warn!(dir = %self.dir.display(), error = %e, "failed to recreate cache dir");
        }
        debug!(dir = %self.dir.display(), "disk cache cleared");
    }

    /// Two-pass purge. Pass one deletes every file older than
    /// `max_age`. Pass two, entered only when the survivors exceed
    /// `max_size`, deletes oldest-first until the total drops to half
    /// the bound, so back-to-back purges stay cheap.
    pub(crate) async fn clean(&self) {
        let Ok(mut entries) = fs::read_dir(&self.dir).await else {
            return;
        };

        let cutoff = SystemTime::now().checked_sub(self.max_age);
        let mut survivors: Vec<(PathBuf, SystemTime, u64)> = Vec::new();
        let mut total_size = 0u64;

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.is_dir() {
                continue;
            }
            let modified = meta.modified().unwrap_or(UNIX_EPOCH);

            if let Some(cutoff) = cutoff
                && modified < cutoff
            {
                if let Err(e) = fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %e, "failed to purge expired file");
                } else {
                    trace!(path = %path.display(), "purged expired file");
                }
                continue;
            }

            total_size += meta.len();
            survivors.push((path, modified, meta.len()));
        }

        if self.max_size > 0 && total_size > self.max_size {
            let target = self.max_size / 2;
            survivors.sort_by_key(|(_, modified, _)| *modified);

            for (path, _, size) in survivors {
                if total_size <= target {
                    break;
                }
                if let Err(e) = fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %e, "failed to purge file for size");
                } else {
                    total_size -= size;
                    trace!(path = %path.display(), size, "purged file for size");
                }
            }
        }

        debug!(dir = %self.dir.display(), remaining = total_size, "disk cache cleaned");
    }

    /// Total size in bytes of the primary directory, blocking.
    pub(crate) fn size_sync(&self) -> u64 {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        entries
            .flatten()
            .filter_map(|e| e.metadata().ok())
            .filter(std::fs::Metadata::is_file)
            .map(|m| m.len())
            .sum()
    }

    /// Number of files in the primary directory, blocking.
    pub(crate) fn count_sync(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        entries
            .flatten()
            .filter(|e| e.metadata().is_ok_and(|m| m.is_file()))
            .count()
    }

    /// File count and total size, for the async size calculation.
    pub(crate) async fn calculate(&self) -> (usize, u64) {
        let Ok(mut entries) = fs::read_dir(&self.dir).await else {
            return (0, 0);
        };
        let mut count = 0usize;
        let mut total = 0u64;
        while let Ok(Some(entry)) = entries.next_entry().await {
            if let Ok(meta) = entry.metadata().await
                && meta.is_file()
            {
                count += 1;
                total += meta.len();
            }
        }
        (count, total)
    }

    /// Whether `key` exists in the primary directory or any overlay.
    pub(crate) fn exists_sync(&self, key: &CacheKey) -> bool {
        if self.path_for(key).is_file() {
            return true;
        }
        let overlays = self.overlays.read().clone();
        overlays
            .iter()
            .any(|overlay| Self::path_in(overlay, key).is_file())
    }
}
