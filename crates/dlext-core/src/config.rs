//! Centralized configuration constants.

use std::path::PathBuf;
use std::time::Duration;

/// On-disk naming of cache artifacts.
pub struct CacheLayout;

impl CacheLayout {
    /// Directory created under the system temp dir when no base path is given.
    pub const DEFAULT_DIR_NAME: &'static str = "dlext";
    pub const FILE_SUFFIX: &'static str = "file";
    pub const DIR_SUFFIX: &'static str = "dir";
    pub const PENDING_SUFFIX: &'static str = "pending";

    /// Default base directory for cache slots.
    pub fn default_base_path() -> PathBuf {
        std::env::temp_dir().join(Self::DEFAULT_DIR_NAME)
    }
}

/// Content hashing.
pub struct HashConfig;

impl HashConfig {
    /// Read size when streaming a file through the hasher.
    pub const CHUNK_SIZE: usize = 64 * 1024;
}

/// Network-related configuration.
pub struct NetworkConfig;

impl NetworkConfig {
    pub const DOWNLOAD_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
    pub const DOWNLOAD_PROGRESS_INTERVAL: Duration = Duration::from_millis(500);
    pub const USER_AGENT: &'static str = concat!("dlext/", env!("CARGO_PKG_VERSION"));
}

/// Archive detection and extraction.
pub struct ExtractConfig;

impl ExtractConfig {
    /// Buffer in front of the source file for streaming extraction.
    pub const READ_BUFFER_SIZE: usize = 1024 * 1024;
    /// Bytes sniffed from the start of a file for signature detection.
    pub const SNIFF_SIZE: usize = 8192;
    /// Offset of the `ustar` magic inside a tar header block.
    pub const TAR_MAGIC_OFFSET: usize = 257;
    /// Executable used by the `file(1)` inspector.
    pub const FILE_COMMAND: &'static str = "file";
}
