//! Archive detection and extraction.
//!
//! [`ArchivePipeline::extract`] asks an [`Inspector`] what a file is,
//! resolves that into an [`ArchivePlan`] and runs the matching
//! [`Extractor`]. Files that are not archives are left alone.

mod extractor;
mod format;

pub use extractor::{
    extractor_for, ExtractContext, ExtractProgress, Extractor, RandomAccessExtractor,
    SourceReader, StreamExtractor,
};
pub use format::{AccessMode, ArchiveKind, ArchivePlan, Compression, DecodeStage};

use crate::cancel::CancellationToken;
use crate::error::{DlextError, Result};
use crate::inspect::{Inspector, MagicInspector};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Detects and unpacks archives.
#[derive(Clone)]
pub struct ArchivePipeline {
    inspector: Arc<dyn Inspector>,
    progress_tx: Option<mpsc::Sender<ExtractProgress>>,
}

impl Default for ArchivePipeline {
    fn default() -> Self {
        Self::new(Arc::new(MagicInspector))
    }
}

impl ArchivePipeline {
    pub fn new(inspector: Arc<dyn Inspector>) -> Self {
        Self {
            inspector,
            progress_tx: None,
        }
    }

    /// Report bytes consumed from the source file during extraction.
    pub fn with_progress(mut self, progress_tx: mpsc::Sender<ExtractProgress>) -> Self {
        self.progress_tx = Some(progress_tx);
        self
    }

    /// Work out whether `path` is an archive and how to unpack it.
    pub async fn detect(&self, path: &Path) -> Result<Option<ArchivePlan>> {
        let detection = self.inspector.inspect(path).await?;
        let plan = ArchivePlan::resolve(&detection);
        debug!(
            "Detected {} as {:?} (compression {:?}): {:?}",
            path.display(),
            detection.mime,
            detection.compression,
            plan
        );
        Ok(plan)
    }

    /// Unpack `file` into `dest`.
    ///
    /// Returns `false` without creating `dest` when `file` is not an
    /// archive. On error `dest` may be partially populated.
    ///
    /// Dropping the returned future cancels the extraction at its next read.
    pub async fn extract(&self, file: &Path, dest: &Path) -> Result<bool> {
        let Some(plan) = self.detect(file).await? else {
            return Ok(false);
        };

        info!(
            "Extracting {} ({:?}) to {}",
            file.display(),
            plan.kind,
            dest.display()
        );

        let extractor = extractor_for(&plan);
        let cancel = CancellationToken::new();
        let guard = cancel.drop_guard();
        let ctx = ExtractContext {
            cancel,
            progress_tx: self.progress_tx.clone(),
        };

        let source = file.to_path_buf();
        let target = dest.to_path_buf();
        tokio::task::spawn_blocking(move || extractor.extract(&source, &target, &ctx))
            .await
            .map_err(|e| DlextError::Archive {
                path: file.to_path_buf(),
                message: format!("Extraction task failed: {}", e),
            })??;

        guard.disarm();
        info!("Extraction of {} complete", file.display());
        Ok(true)
    }
}

impl std::fmt::Debug for ArchivePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchivePipeline")
            .field("progress", &self.progress_tx.is_some())
            .finish_non_exhaustive()
    }
}
