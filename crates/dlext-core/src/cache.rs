//! Fetch-if-needed, verify, unpack-if-needed.
//!
//! A cache slot is named by the digest of the request URI and the expected
//! content digest. It holds up to two artifacts under a base directory:
//!
//! ```text
//! <uri-digest>.<hash>.file    downloaded bytes, always verified
//! <uri-digest>.<hash>.dir     extracted tree, only if the file is an archive
//! ```
//!
//! Both are produced by renaming a `<final>.<millis>.pending` path, so a
//! final path never holds a partially written artifact.
//!
//! Concurrent fetches of the same slot are not coordinated: each downloads
//! and verifies on its own and the last file rename wins. For the extracted
//! directory the first commit wins and later copies are discarded.

use crate::archive::{ArchivePipeline, ExtractProgress};
use crate::config::CacheLayout;
use crate::digest::{digest_of, ContentDigest};
use crate::download::{DownloadRequest, Downloader, HttpDownloader};
use crate::error::{DlextError, Result};
use crate::inspect::Inspector;
use crate::pending::{PendingPath, PendingTracker};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Parameters of one fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub uri: String,
    /// Expected SHA256 of the content, base64 (standard or URL-safe).
    pub hash: String,
    /// Cache directory. Defaults to [`CacheLayout::default_base_path`].
    pub base_path: Option<PathBuf>,
    /// Unpack the file if it is an archive. Defaults to true.
    pub extract: bool,
    /// Extra headers forwarded to the downloader.
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn new(uri: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            hash: hash.into(),
            base_path: None,
            extract: true,
            headers: Vec::new(),
        }
    }

    pub fn with_base_path(mut self, base_path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(base_path.into());
        self
    }

    pub fn with_extract(mut self, extract: bool) -> Self {
        self.extract = extract;
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn resolved_base_path(&self) -> PathBuf {
        self.base_path
            .clone()
            .unwrap_or_else(CacheLayout::default_base_path)
    }

    fn download_request(&self) -> DownloadRequest {
        DownloadRequest {
            uri: self.uri.clone(),
            headers: self.headers.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.uri.trim().is_empty() {
            return Err(DlextError::InvalidRequest {
                field: "uri".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if self.hash.trim().is_empty() {
            return Err(DlextError::InvalidRequest {
                field: "hash".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Result of a successful fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchOutcome {
    /// Verified downloaded file.
    pub download_path: PathBuf,
    /// Whether an extracted directory exists for this slot.
    pub extracted: bool,
    /// The extracted directory, if `extracted`.
    pub extract_path: Option<PathBuf>,
}

/// Identifies one cache slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub uri_digest: ContentDigest,
    pub content_digest: ContentDigest,
}

impl CacheKey {
    pub fn new(uri: &str, hash: &str) -> Self {
        Self {
            uri_digest: ContentDigest::of_bytes(uri),
            content_digest: ContentDigest::canonicalize(hash),
        }
    }

    /// `<uri-digest>.<hash>`
    pub fn base_name(&self) -> String {
        format!("{}.{}", self.uri_digest, self.content_digest)
    }

    pub fn file_path(&self, base_path: &Path) -> PathBuf {
        base_path.join(format!("{}.{}", self.base_name(), CacheLayout::FILE_SUFFIX))
    }

    pub fn dir_path(&self, base_path: &Path) -> PathBuf {
        base_path.join(format!("{}.{}", self.base_name(), CacheLayout::DIR_SUFFIX))
    }
}

/// On-disk state of one cache slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub file_path: PathBuf,
    pub dir_path: PathBuf,
    /// A file exists at `file_path`. Its digest is not checked.
    pub file_present: bool,
    pub dir_present: bool,
}

/// Content-addressed download cache.
///
/// Staged `.pending` paths that a fetch could not settle (a dropped future,
/// a failed rename or delete) stay registered with the cache's
/// [`PendingTracker`]. Nothing removes them at process exit unless the
/// caller asks for it: hold [`PendingTracker::cleanup_on_drop`] for the
/// life of the program and/or call
/// [`PendingTracker::install_signal_cleanup`], on [`pending`](Self::pending)
/// or on a tracker passed to
/// [`with_pending_tracker`](Self::with_pending_tracker).
pub struct ArtifactCache {
    downloader: Arc<dyn Downloader>,
    pipeline: ArchivePipeline,
    pending: PendingTracker,
}

impl ArtifactCache {
    /// Cache using `downloader`, the built-in inspector and a fresh tracker.
    pub fn new(downloader: Arc<dyn Downloader>) -> Self {
        Self {
            downloader,
            pipeline: ArchivePipeline::default(),
            pending: PendingTracker::new(),
        }
    }

    /// Cache backed by [`HttpDownloader`].
    pub fn with_http() -> Result<Self> {
        Ok(Self::new(Arc::new(HttpDownloader::new()?)))
    }

    pub fn with_inspector(mut self, inspector: Arc<dyn Inspector>) -> Self {
        self.pipeline = ArchivePipeline::new(inspector);
        self
    }

    /// Share a tracker, e.g. one with exit cleanup installed.
    pub fn with_pending_tracker(mut self, pending: PendingTracker) -> Self {
        self.pending = pending;
        self
    }

    pub fn with_extract_progress(mut self, progress_tx: mpsc::Sender<ExtractProgress>) -> Self {
        self.pipeline = self.pipeline.with_progress(progress_tx);
        self
    }

    pub fn pending(&self) -> &PendingTracker {
        &self.pending
    }

    /// Describe the slot for `uri`/`hash` without fetching anything.
    pub async fn entry(&self, uri: &str, hash: &str, base_path: &Path) -> Result<CacheEntry> {
        let key = CacheKey::new(uri, hash);
        let file_path = key.file_path(base_path);
        let dir_path = key.dir_path(base_path);
        Ok(CacheEntry {
            file_present: path_exists(&file_path).await?,
            dir_present: path_exists(&dir_path).await?,
            key,
            file_path,
            dir_path,
        })
    }

    /// Make sure a verified copy of `request.uri` is cached, and unpacked
    /// if requested and possible.
    ///
    /// Nothing is retried. On error the caller may simply call again.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchOutcome> {
        request.validate()?;

        let base_path = request.resolved_base_path();
        tokio::fs::create_dir_all(&base_path)
            .await
            .map_err(|e| DlextError::io_with_path(e, &base_path))?;

        let key = CacheKey::new(&request.uri, &request.hash);
        let download_path = self.ensure_file(request, &key, &base_path).await?;

        let dir_path = key.dir_path(&base_path);
        let mut extracted = path_exists(&dir_path).await?;
        if extracted {
            debug!("Extracted directory {} already present", dir_path.display());
        } else if request.extract {
            extracted = self.ensure_extracted(&download_path, &dir_path).await?;
        }

        Ok(FetchOutcome {
            download_path,
            extracted,
            extract_path: extracted.then_some(dir_path),
        })
    }

    /// Return the slot's file path, downloading and verifying it if needed.
    async fn ensure_file(
        &self,
        request: &FetchRequest,
        key: &CacheKey,
        base_path: &Path,
    ) -> Result<PathBuf> {
        let file_path = key.file_path(base_path);
        let expected = &key.content_digest;

        match digest_of(&file_path).await? {
            Some(existing) if &existing == expected => {
                debug!("Cache hit for {} at {}", request.uri, file_path.display());
                return Ok(file_path);
            }
            Some(existing) => warn!(
                "Cached file {} has digest {}, expected {}; downloading again",
                file_path.display(),
                existing,
                expected
            ),
            None => debug!("Cache miss for {}", request.uri),
        }

        let pending = self.pending.stage(&file_path);
        info!("Downloading {} to {}", request.uri, pending.path().display());

        if let Err(e) = self
            .downloader
            .download(&request.download_request(), pending.path())
            .await
        {
            discard_quietly(pending).await;
            return Err(e);
        }

        let actual = match digest_of(pending.path()).await {
            Ok(actual) => actual,
            Err(e) => {
                discard_quietly(pending).await;
                return Err(e);
            }
        };

        if actual.as_ref() != Some(expected) {
            warn!(
                "Hash mismatch for {}: expected {}, got {:?}",
                request.uri, expected, actual
            );
            discard_quietly(pending).await;
            return Err(DlextError::HashMismatch {
                expected: expected.to_string(),
                actual: actual.map(|digest| digest.to_string()),
            });
        }

        pending.commit().await
    }

    /// Unpack `file_path` into `dir_path` via a pending directory.
    async fn ensure_extracted(&self, file_path: &Path, dir_path: &Path) -> Result<bool> {
        let pending = self.pending.stage(dir_path);

        match self.pipeline.extract(file_path, pending.path()).await {
            Ok(true) => {
                // A concurrent fetch of this slot may have committed first.
                pending.commit_or_yield().await?;
                Ok(true)
            }
            Ok(false) => {
                debug!("{} is not an archive", file_path.display());
                pending.release();
                Ok(false)
            }
            Err(e) => {
                discard_quietly(pending).await;
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCache")
            .field("pipeline", &self.pipeline)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

/// Discard a pending path on an error path. The original error wins; if
/// cleanup fails too the path stays tracked for exit cleanup.
async fn discard_quietly(pending: PendingPath) {
    let path = pending.path().to_path_buf();
    if let Err(e) = pending.discard().await {
        warn!("Failed to discard {}: {}", path.display(), e);
    }
}

async fn path_exists(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| DlextError::io_with_path(e, path))
}
