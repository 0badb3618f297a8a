//! Unarchivers.
//!
//! Extraction is blocking work driven from [`super::ArchivePipeline`] on the
//! blocking pool. Reads of the source file go through a [`SourceReader`],
//! which counts consumed bytes for progress and fails the next read once
//! the pipeline has been cancelled.

use super::format::{AccessMode, ArchiveKind, ArchivePlan, Compression, DecodeStage};
use crate::cancel::CancellationToken;
use crate::config::ExtractConfig;
use crate::error::{DlextError, Result};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Progress update during extraction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExtractProgress {
    /// Bytes consumed from the source file so far.
    pub bytes_read: u64,
    /// Size of the source file.
    pub total_bytes: u64,
}

impl ExtractProgress {
    /// Fraction complete (0.0-1.0).
    pub fn fraction(&self) -> f32 {
        if self.total_bytes == 0 {
            1.0
        } else {
            (self.bytes_read as f32 / self.total_bytes as f32).min(1.0)
        }
    }
}

/// State shared by one extraction run.
#[derive(Debug, Clone)]
pub struct ExtractContext {
    pub cancel: CancellationToken,
    pub progress_tx: Option<mpsc::Sender<ExtractProgress>>,
}

/// Materializes a directory tree from an archive file.
pub trait Extractor: Send + Sync + std::fmt::Debug {
    fn access_mode(&self) -> AccessMode;

    /// Unpack `source` into `dest`, creating `dest` if needed.
    fn extract(&self, source: &Path, dest: &Path, ctx: &ExtractContext) -> Result<()>;
}

/// Pick the unarchiver for a plan.
pub fn extractor_for(plan: &ArchivePlan) -> Box<dyn Extractor> {
    match plan.kind {
        ArchiveKind::Tar => Box::new(StreamExtractor {
            compression: plan.compression,
        }),
        ArchiveKind::Zip => Box::new(RandomAccessExtractor),
    }
}

/// Tar: source bytes -> decoder -> tar reader.
#[derive(Debug, Clone, Copy)]
pub struct StreamExtractor {
    pub compression: Option<Compression>,
}

impl Extractor for StreamExtractor {
    fn access_mode(&self) -> AccessMode {
        AccessMode::Streaming
    }

    fn extract(&self, source: &Path, dest: &Path, ctx: &ExtractContext) -> Result<()> {
        debug!(
            "Streaming {} through {:?} into {}",
            source.display(),
            self.compression,
            dest.display()
        );

        let source_failed = Arc::new(AtomicBool::new(false));
        let reader = ErrorFlag {
            inner: SourceReader::open(source, ctx)?,
            failed: source_failed.clone(),
        };
        let buffered = BufReader::with_capacity(ExtractConfig::READ_BUFFER_SIZE, reader);
        let decoder = DecodeStage::new(self.compression, buffered).map_err(|e| {
            classify_failure(source, e, &source_failed, |path, message| DlextError::Decode {
                path,
                message,
            })
        })?;

        let decode_failed = Arc::new(AtomicBool::new(false));
        let tracked = ErrorFlag {
            inner: decoder,
            failed: decode_failed.clone(),
        };

        std::fs::create_dir_all(dest).map_err(|e| DlextError::io_with_path(e, dest))?;
        let mut archive = tar::Archive::new(tracked);
        let compressed = self.compression.is_some();
        archive.unpack(dest).map_err(|e| {
            classify_failure(source, e, &source_failed, |path, message| {
                if compressed && decode_failed.load(Ordering::SeqCst) {
                    DlextError::Decode { path, message }
                } else {
                    DlextError::Archive { path, message }
                }
            })
        })
    }
}

/// Zip: entries are read one at a time, in central-directory order.
#[derive(Debug, Clone, Copy)]
pub struct RandomAccessExtractor;

impl Extractor for RandomAccessExtractor {
    fn access_mode(&self) -> AccessMode {
        AccessMode::RandomAccess
    }

    fn extract(&self, source: &Path, dest: &Path, ctx: &ExtractContext) -> Result<()> {
        debug!("Unzipping {} into {}", source.display(), dest.display());

        let archive_error = |message: String| DlextError::Archive {
            path: source.to_path_buf(),
            message,
        };

        let source_failed = Arc::new(AtomicBool::new(false));
        let reader = ErrorFlag {
            inner: SourceReader::open(source, ctx)?,
            failed: source_failed.clone(),
        };
        let mut archive = zip::ZipArchive::new(BufReader::new(reader)).map_err(|e| {
            classify_failure(source, e.into(), &source_failed, |_, message| {
                archive_error(format!("Invalid zip archive: {}", message))
            })
        })?;

        std::fs::create_dir_all(dest).map_err(|e| DlextError::io_with_path(e, dest))?;

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).map_err(|e| {
                classify_failure(source, e.into(), &source_failed, |_, message| {
                    archive_error(format!("Failed to read zip entry {}: {}", i, message))
                })
            })?;

            let Some(relative) = entry.enclosed_name() else {
                warn!("Skipping zip entry with unsafe name {:?}", entry.name());
                continue;
            };
            let outpath = dest.join(relative);

            if entry.is_dir() {
                std::fs::create_dir_all(&outpath)
                    .map_err(|e| DlextError::io_with_path(e, &outpath))?;
                continue;
            }

            if let Some(parent) = outpath.parent() {
                std::fs::create_dir_all(parent).map_err(|e| DlextError::io_with_path(e, parent))?;
            }

            let mut outfile =
                File::create(&outpath).map_err(|e| DlextError::io_with_path(e, &outpath))?;
            std::io::copy(&mut entry, &mut outfile).map_err(|e| {
                classify_failure(source, e, &source_failed, |_, message| {
                    archive_error(format!("Failed to extract {}: {}", outpath.display(), message))
                })
            })?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Some(mode) = entry.unix_mode() {
                    std::fs::set_permissions(&outpath, std::fs::Permissions::from_mode(mode))
                        .ok();
                }
            }
        }

        Ok(())
    }
}

/// Source file reader with progress and cancellation.
pub struct SourceReader {
    file: File,
    bytes_read: u64,
    total_bytes: u64,
    ctx: ExtractContext,
}

impl SourceReader {
    pub fn open(path: &Path, ctx: &ExtractContext) -> Result<Self> {
        let file = File::open(path).map_err(|e| DlextError::io_with_path(e, path))?;
        let total_bytes = file
            .metadata()
            .map_err(|e| DlextError::io_with_path(e, path))?
            .len();
        Ok(Self {
            file,
            bytes_read: 0,
            total_bytes,
            ctx: ctx.clone(),
        })
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

impl Read for SourceReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.ctx.cancel.check()?;

        let n = self.file.read(buf)?;
        self.bytes_read += n as u64;

        if let Some(ref tx) = self.ctx.progress_tx {
            let _ = tx.try_send(ExtractProgress {
                bytes_read: self.bytes_read,
                total_bytes: self.total_bytes,
            });
        }
        Ok(n)
    }
}

impl Seek for SourceReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.file.seek(pos)
    }
}

/// Records whether the wrapped reader ever failed.
struct ErrorFlag<R> {
    inner: R,
    failed: Arc<AtomicBool>,
}

impl<R: Read> Read for ErrorFlag<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf).inspect_err(|_| {
            self.failed.store(true, Ordering::SeqCst);
        })
    }
}

impl<R: Seek> Seek for ErrorFlag<R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos).inspect_err(|_| {
            self.failed.store(true, Ordering::SeqCst);
        })
    }
}

/// Failures reading the source file itself (including cancellation) are
/// I/O errors. Anything else is classified by `format_error`.
fn classify_failure(
    source: &Path,
    err: std::io::Error,
    source_failed: &AtomicBool,
    format_error: impl FnOnce(std::path::PathBuf, String) -> DlextError,
) -> DlextError {
    if source_failed.load(Ordering::SeqCst) {
        DlextError::io_with_path(err, source)
    } else {
        format_error(source.to_path_buf(), err.to_string())
    }
}
