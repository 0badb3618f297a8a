//! Error types for the download/extract cache.
//!
//! Every failure surfaces to the caller. "Not an archive" is not an error:
//! it is reported as `extracted == false` on the fetch outcome.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the cache.
#[derive(Debug, Error)]
pub enum DlextError {
    // Verification errors
    #[error("Hash mismatch: expected {expected}, got {}", .actual.as_deref().unwrap_or("nothing"))]
    HashMismatch {
        expected: String,
        /// Digest of what was actually downloaded, if anything was written.
        actual: Option<String>,
    },

    // Transport errors
    #[error("Download failed for {url}: {message}")]
    DownloadFailed { url: String, message: String },

    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    // Detection and extraction errors
    #[error("Failed to detect content type of {path}: {message}")]
    Detection { path: PathBuf, message: String },

    #[error("Failed to decompress {path}: {message}")]
    Decode { path: PathBuf, message: String },

    #[error("Failed to unpack archive {path}: {message}")]
    Archive { path: PathBuf, message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    // Validation errors
    #[error("Invalid request field {field}: {message}")]
    InvalidRequest { field: String, message: String },
}

/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, DlextError>;

impl From<std::io::Error> for DlextError {
    fn from(err: std::io::Error) -> Self {
        DlextError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for DlextError {
    fn from(err: reqwest::Error) -> Self {
        DlextError::Network {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl DlextError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        DlextError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Whether the caller may reasonably retry the whole fetch.
    ///
    /// The cache never retries on its own.
    pub fn is_retryable(&self) -> bool {
        match self {
            DlextError::Network { .. } | DlextError::DownloadFailed { .. } => true,
            // A truncated transfer shows up as a mismatch with some bytes written.
            DlextError::HashMismatch { actual, .. } => actual.is_some(),
            _ => false,
        }
    }

    /// Whether this error came from digest verification.
    pub fn is_hash_mismatch(&self) -> bool {
        matches!(self, DlextError::HashMismatch { .. })
    }
}
