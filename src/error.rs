//! Error types for the fetch-and-cache pipeline.

use thiserror::Error;

/// Result type used across the crate.
pub type Result<T> = std::result::Result<T, ImageError>;

/// Errors produced while fetching, decoding, or caching an image.
///
/// `Cancelled` is internal control flow: a cancelled request emits no
/// callback at all, so user code never observes it.
#[derive(Debug, Clone, Error)]
pub enum ImageError {
    /// The caller-provided URL was empty or unparseable.
    #[error("invalid image URL: {reason}")]
    InvalidUrl {
        /// Why the URL was rejected.
        reason: String,
    },

    /// A transport-level failure (DNS, connect, reset, TLS, timeout).
    #[error("network failure: {message}")]
    Network {
        /// Human-readable transport error.
        message: String,
        /// True for failures worth retrying (timeout, lost connectivity).
        transient: bool,
    },

    /// The server answered with a non-2xx status.
    #[error("server returned HTTP {status}")]
    HttpStatus {
        /// The HTTP status code.
        status: u16,
    },

    /// Bytes arrived but no image could be materialized from them.
    #[error("image decode failed: {message}")]
    Decode {
        /// Decoder diagnostic.
        message: String,
    },

    /// A cache I/O failure. Disk stores degrade silently; this surfaces
    /// only through operations whose contract is the disk itself.
    #[error("cache I/O failure: {message}")]
    Io {
        /// Underlying I/O diagnostic.
        message: String,
    },

    /// The URL previously failed permanently and retries were not requested.
    #[error("URL is blacklisted after a permanent failure")]
    Blacklisted,

    /// The operation was cancelled. Never delivered to callbacks.
    #[error("operation cancelled")]
    Cancelled,
}

impl ImageError {
    /// Creates an invalid-URL error.
    #[must_use]
    pub fn invalid_url(reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            reason: reason.into(),
        }
    }

    /// Creates a hard (non-transient) network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            transient: false,
        }
    }

    /// Creates a transient network error (timeout, lost connectivity).
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            transient: true,
        }
    }

    /// Creates a decode error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode {
            message: message.into(),
        }
    }

    /// Creates a cache I/O error.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Returns whether the failure is worth retrying later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Network { transient: true, .. })
    }

    /// Returns whether the URL should be blacklisted after this failure.
    ///
    /// Permanent failures are 4xx statuses, decode failures, and hard
    /// transport errors. Timeouts and connectivity loss never blacklist.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        match self {
            Self::HttpStatus { status } => *status >= 400 && *status < 500,
            Self::Network { transient, .. } => !*transient,
            Self::Decode { .. } => true,
            _ => false,
        }
    }
}
