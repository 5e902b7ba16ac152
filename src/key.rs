//! Cache key derivation.

use std::sync::Arc;

/// Stable identifier for a cached image, derived from its URL.
///
/// Two URLs that map to the same key are indistinguishable to the cache.
/// The raw key string indexes the memory tier; the disk tier stores each
/// entry under the key's SHA-256 hex digest so arbitrary URL characters
/// never reach the filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Creates a key from any string-like input.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Derives the default key for a URL: the URL string itself.
    #[must_use]
    pub fn from_url(url: &str) -> Self {
        Self(url.to_string())
    }

    /// Returns the raw key string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the lowercase hex SHA-256 digest used as the on-disk filename.
    #[must_use]
    pub fn hex_digest(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for CacheKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Maps a URL to the cache key identifying it.
///
/// Installed on the manager to strip volatile URL components (query
/// parameters, signatures) before cache lookup.
pub type KeyFilter = Arc<dyn Fn(&str) -> CacheKey + Send + Sync>;
