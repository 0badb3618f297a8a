//! Bookkeeping for staged (pending) cache artifacts.
//!
//! Every artifact is first written under a provisional name
//! `<final>.<unix-millis>.pending` and only reaches its final name through
//! an atomic rename. The tracker remembers which provisional paths are
//! still live so they can be removed when the process shuts down.
//!
//! The tracker is advisory. It does not serialize access to a cache key:
//! two concurrent fetches of the same key each stage their own (distinct)
//! pending path and the last rename wins.

use crate::config::CacheLayout;
use crate::error::{DlextError, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tracing::{debug, warn};

/// Tracker handed to the signal handler. Set once the handler is installed.
static SIGNAL_CLEANUP: OnceLock<PendingTracker> = OnceLock::new();

/// Serializes handler installation.
static SIGNAL_INSTALL: Mutex<()> = Mutex::new(());

/// Shared set of pending paths.
///
/// Cloning is cheap and every clone observes the same set.
#[derive(Debug, Clone, Default)]
pub struct PendingTracker {
    paths: Arc<Mutex<HashSet<PathBuf>>>,
}

impl PendingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a provisional path for `final_path` and register it.
    ///
    /// The timestamp is bumped past any name this tracker already holds, so
    /// two stagings of one final path never share a pending path.
    pub fn stage(&self, final_path: impl Into<PathBuf>) -> PendingPath {
        let final_path = final_path.into();
        let mut millis = chrono::Utc::now().timestamp_millis();
        let path = loop {
            let candidate = pending_path_for(&final_path, millis);
            if self.register(&candidate) {
                break candidate;
            }
            millis += 1;
        };
        PendingPath {
            tracker: self.clone(),
            path,
            final_path,
            settled: false,
        }
    }

    /// Register a path. Returns false if it was already tracked.
    pub fn register(&self, path: impl Into<PathBuf>) -> bool {
        self.lock().insert(path.into())
    }

    /// Forget a path without touching the file system.
    pub fn deregister(&self, path: &Path) -> bool {
        self.lock().remove(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lock().contains(path)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Currently tracked paths, in no particular order.
    pub fn snapshot(&self) -> Vec<PathBuf> {
        self.lock().iter().cloned().collect()
    }

    /// Recursively delete every tracked path, best-effort.
    ///
    /// Synchronous so it can run from a signal handler or a `Drop` impl.
    /// Returns the number of paths that were actually removed.
    pub fn cleanup_remaining(&self) -> usize {
        let paths: Vec<PathBuf> = self.lock().drain().collect();
        let mut removed = 0;
        for path in paths {
            match remove_path_blocking(&path) {
                Ok(true) => {
                    debug!("Removed leftover pending path {}", path.display());
                    removed += 1;
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to remove pending path {}: {}", path.display(), e),
            }
        }
        removed
    }

    /// Guard that runs [`cleanup_remaining`](Self::cleanup_remaining) when dropped.
    ///
    /// Hold it for the lifetime of the program (e.g. in `main`).
    pub fn cleanup_on_drop(&self) -> CleanupOnDrop {
        CleanupOnDrop {
            tracker: self.clone(),
        }
    }

    /// Clean up pending paths on SIGINT, SIGTERM or SIGHUP (Ctrl-C on
    /// Windows), then exit.
    ///
    /// Only the first tracker to install successfully is wired to the
    /// handler; later calls return `Ok(false)`. A failed install can be
    /// retried.
    pub fn install_signal_cleanup(&self) -> Result<bool> {
        let _installing = SIGNAL_INSTALL
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if SIGNAL_CLEANUP.get().is_some() {
            return Ok(false);
        }

        ctrlc::set_handler(|| {
            if let Some(tracker) = SIGNAL_CLEANUP.get() {
                tracker.cleanup_remaining();
            }
            std::process::exit(130);
        })
        .map_err(|e| DlextError::Io {
            message: format!("Failed to install signal handler: {}", e),
            path: None,
            source: None,
        })?;

        // Only reachable once: later callers see the tracker above.
        let _ = SIGNAL_CLEANUP.set(self.clone());
        Ok(true)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        // The set stays consistent even if a holder panicked.
        self.paths.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Runs exit cleanup for a tracker when dropped.
#[derive(Debug)]
pub struct CleanupOnDrop {
    tracker: PendingTracker,
}

impl Drop for CleanupOnDrop {
    fn drop(&mut self) {
        self.tracker.cleanup_remaining();
    }
}

/// A registered provisional path and the final path it will be promoted to.
///
/// Settled by exactly one of [`commit`](Self::commit),
/// [`discard`](Self::discard) or [`release`](Self::release). If dropped
/// unsettled (or if settling fails) the path stays registered and is
/// removed by exit cleanup.
#[derive(Debug)]
pub struct PendingPath {
    tracker: PendingTracker,
    path: PathBuf,
    final_path: PathBuf,
    settled: bool,
}

impl PendingPath {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    /// Atomically rename the pending path onto its final path.
    pub async fn commit(mut self) -> Result<PathBuf> {
        if let Err(e) = tokio::fs::rename(&self.path, &self.final_path).await {
            return Err(self.rename_error(e));
        }
        Ok(self.settle_committed())
    }

    /// Like [`commit`](Self::commit), but a directory that already sits at
    /// the final path wins: this copy is discarded and the final path is
    /// returned as if committed.
    ///
    /// Directories cannot be renamed over non-empty directories, so this is
    /// how a concurrent writer that finished first is accepted.
    pub async fn commit_or_yield(mut self) -> Result<PathBuf> {
        let e = match tokio::fs::rename(&self.path, &self.final_path).await {
            Ok(()) => return Ok(self.settle_committed()),
            Err(e) => e,
        };

        let occupied = tokio::fs::metadata(&self.final_path)
            .await
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false);
        if !occupied {
            return Err(self.rename_error(e));
        }

        debug!(
            "{} already present, dropping {}",
            self.final_path.display(),
            self.path.display()
        );
        let final_path = self.final_path.clone();
        let path = self.path.clone();
        if let Err(e) = self.discard().await {
            warn!("Failed to discard {}: {}", path.display(), e);
        }
        Ok(final_path)
    }

    fn settle_committed(&mut self) -> PathBuf {
        self.tracker.deregister(&self.path);
        self.settled = true;
        debug!("Committed {}", self.final_path.display());
        std::mem::take(&mut self.final_path)
    }

    fn rename_error(&self, e: std::io::Error) -> DlextError {
        DlextError::Io {
            message: format!(
                "Failed to rename {} to {}: {}",
                self.path.display(),
                self.final_path.display(),
                e
            ),
            path: Some(self.final_path.clone()),
            source: Some(e),
        }
    }

    /// Delete whatever was staged and stop tracking it.
    pub async fn discard(mut self) -> Result<()> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || remove_path_blocking(&path))
            .await
            .map_err(|e| DlextError::Io {
                message: format!("Cleanup task failed: {}", e),
                path: Some(self.path.clone()),
                source: None,
            })?
            .map_err(|e| DlextError::io_with_path(e, &self.path))?;

        self.tracker.deregister(&self.path);
        self.settled = true;
        debug!("Discarded {}", self.path.display());
        Ok(())
    }

    /// Stop tracking without touching the file system.
    pub fn release(mut self) {
        self.tracker.deregister(&self.path);
        self.settled = true;
    }
}

impl Drop for PendingPath {
    fn drop(&mut self) {
        if !self.settled {
            debug!(
                "Pending path {} left for exit cleanup",
                self.path.display()
            );
        }
    }
}

/// `<final>.<millis>.pending`
pub fn pending_path_for(final_path: &Path, millis: i64) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(format!(".{}.{}", millis, CacheLayout::PENDING_SUFFIX));
    PathBuf::from(name)
}

/// Remove a file or directory tree. Returns false if nothing was there.
fn remove_path_blocking(path: &Path) -> std::io::Result<bool> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    if metadata.is_dir() {
        std::fs::remove_dir_all(path)?;
    } else {
        std::fs::remove_file(path)?;
    }
    Ok(true)
}
