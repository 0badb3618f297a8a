//! Dlext Core - content-addressed download cache with archive extraction.
//!
//! Given a URI and the expected SHA256 of its content, [`ArtifactCache`]
//! guarantees a verified local copy exists and, if the content is a tar
//! (optionally gzip/bzip2/xz/zstd compressed) or zip archive, an unpacked
//! copy next to it.
//!
//! # Example
//!
//! ```rust,ignore
//! use dlext_core::{ArtifactCache, FetchRequest, PendingTracker};
//!
//! #[tokio::main]
//! async fn main() -> dlext_core::Result<()> {
//!     let pending = PendingTracker::new();
//!     let _cleanup = pending.cleanup_on_drop();
//!
//!     let cache = ArtifactCache::with_http()?.with_pending_tracker(pending);
//!     let outcome = cache
//!         .fetch(&FetchRequest::new(
//!             "https://example.org/tool.tar.gz",
//!             "LPJNul-wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ",
//!         ))
//!         .await?;
//!
//!     println!("{:?}", outcome.extract_path);
//!     Ok(())
//! }
//! ```

pub mod archive;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod digest;
pub mod download;
pub mod error;
pub mod inspect;
pub mod pending;

// Re-export commonly used types
pub use archive::{ArchiveKind, ArchivePipeline, ArchivePlan, Compression, ExtractProgress};
pub use cache::{ArtifactCache, CacheEntry, CacheKey, FetchOutcome, FetchRequest};
pub use digest::{digest_of, ContentDigest};
pub use download::{DownloadProgress, DownloadRequest, Downloader, HttpDownloader};
pub use error::{DlextError, Result};
pub use inspect::{DetectionResult, FileCommandInspector, Inspector, MagicInspector};
pub use pending::{CleanupOnDrop, PendingPath, PendingTracker};
