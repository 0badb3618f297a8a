//! Content-type inspection.
//!
//! An [`Inspector`] reports a file's primary MIME type and, when the file is
//! wrapped in a compression layer, a token naming that compression. Two
//! implementations are provided:
//!
//! - [`MagicInspector`] sniffs signatures in-process and looks through one
//!   layer of compression to find what is inside.
//! - [`FileCommandInspector`] shells out to `file --mime --uncompress`.

use crate::archive::Compression;
use crate::config::ExtractConfig;
use crate::error::{DlextError, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::process::Command;
use tracing::debug;

static COMPRESSED_ENCODING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"compressed-encoding=([^\s;]+)").unwrap());

pub const MIME_TAR: &str = "application/x-tar";
pub const MIME_ZIP: &str = "application/zip";
pub const MIME_TEXT: &str = "text/plain";
pub const MIME_EMPTY: &str = "inode/x-empty";
pub const MIME_BINARY: &str = "application/octet-stream";

/// What an inspector found out about a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Declared content type of the (decompressed) content.
    pub mime: String,
    /// Compression wrapping the content, if any.
    pub compression: Option<String>,
}

impl DetectionResult {
    pub fn new(mime: impl Into<String>, compression: Option<String>) -> Self {
        Self {
            mime: mime.into(),
            compression,
        }
    }
}

/// Classifies files by content.
#[async_trait]
pub trait Inspector: Send + Sync {
    async fn inspect(&self, path: &Path) -> Result<DetectionResult>;
}

/// Signature-based inspector that needs no external tools.
#[derive(Debug, Clone, Copy, Default)]
pub struct MagicInspector;

#[async_trait]
impl Inspector for MagicInspector {
    async fn inspect(&self, path: &Path) -> Result<DetectionResult> {
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || sniff_file(&owned))
            .await
            .map_err(|e| DlextError::Detection {
                path: path.to_path_buf(),
                message: format!("Inspection task failed: {}", e),
            })?
    }
}

fn sniff_file(path: &Path) -> Result<DetectionResult> {
    let file = std::fs::File::open(path).map_err(|e| DlextError::io_with_path(e, path))?;
    let head =
        read_prefix(file, ExtractConfig::SNIFF_SIZE).map_err(|e| DlextError::io_with_path(e, path))?;

    let Some(compression) = sniff_compression(&head) else {
        return Ok(DetectionResult::new(sniff_mime(&head), None));
    };

    // Peek at the decompressed content. A stream that fails to decode is
    // still reported as compressed, just with opaque content.
    let file = std::fs::File::open(path).map_err(|e| DlextError::io_with_path(e, path))?;
    let inner = match compression.decoder(std::io::BufReader::new(file)) {
        Ok(decoder) => sniff_mime(&read_prefix_lossy(decoder, ExtractConfig::SNIFF_SIZE)),
        Err(_) => MIME_BINARY,
    };

    debug!(
        "Sniffed {}: {} inside {}",
        path.display(),
        inner,
        compression.mime()
    );
    Ok(DetectionResult::new(
        inner,
        Some(compression.mime().to_string()),
    ))
}

/// Read up to `limit` bytes, stopping early at end of stream.
fn read_prefix(reader: impl Read, limit: usize) -> std::io::Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(limit);
    reader.take(limit as u64).read_to_end(&mut buffer)?;
    Ok(buffer)
}

/// Like [`read_prefix`], but keeps whatever was read before an error.
fn read_prefix_lossy(mut reader: impl Read, limit: usize) -> Vec<u8> {
    let mut buffer = vec![0u8; limit];
    let mut filled = 0;
    while filled < limit {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    buffer.truncate(filled);
    buffer
}

/// Compression signature at the start of `head`.
pub fn sniff_compression(head: &[u8]) -> Option<Compression> {
    if head.starts_with(&[0x1f, 0x8b]) {
        Some(Compression::Gzip)
    } else if head.starts_with(b"BZh") {
        Some(Compression::Bzip2)
    } else if head.starts_with(&[0xfd, b'7', b'z', b'X', b'Z', 0x00]) {
        Some(Compression::Xz)
    } else if head.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        Some(Compression::Zstd)
    } else {
        None
    }
}

/// MIME type of uncompressed content.
pub fn sniff_mime(head: &[u8]) -> &'static str {
    let tar_magic = ExtractConfig::TAR_MAGIC_OFFSET;
    if head.is_empty() {
        MIME_EMPTY
    } else if head.starts_with(b"PK\x03\x04") || head.starts_with(b"PK\x05\x06") {
        MIME_ZIP
    } else if head.len() >= tar_magic + 5 && &head[tar_magic..tar_magic + 5] == b"ustar" {
        MIME_TAR
    } else if looks_like_text(head) {
        MIME_TEXT
    } else {
        MIME_BINARY
    }
}

fn looks_like_text(head: &[u8]) -> bool {
    let valid = match std::str::from_utf8(head) {
        Ok(_) => true,
        // A multi-byte sequence cut off by the sniff window is fine.
        Err(e) => e.error_len().is_none(),
    };
    valid && !head.contains(&0)
}

/// Inspector backed by the `file(1)` utility.
#[derive(Debug, Clone)]
pub struct FileCommandInspector {
    program: PathBuf,
    magic_file: Option<PathBuf>,
}

impl Default for FileCommandInspector {
    fn default() -> Self {
        Self {
            program: PathBuf::from(ExtractConfig::FILE_COMMAND),
            magic_file: None,
        }
    }
}

impl FileCommandInspector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific `file` executable.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Use a specific magic database (`--magic-file`).
    pub fn with_magic_file(mut self, magic_file: impl Into<PathBuf>) -> Self {
        self.magic_file = Some(magic_file.into());
        self
    }
}

#[async_trait]
impl Inspector for FileCommandInspector {
    async fn inspect(&self, path: &Path) -> Result<DetectionResult> {
        let mut command = Command::new(&self.program);
        command.arg(path);
        if let Some(magic_file) = &self.magic_file {
            command.arg("--magic-file").arg(magic_file);
        }
        command.args(["--mime", "--uncompress", "--brief"]);

        let output = command.output().await.map_err(|e| DlextError::Detection {
            path: path.to_path_buf(),
            message: format!("Failed to run {}: {}", self.program.display(), e),
        })?;

        if !output.status.success() {
            return Err(DlextError::Detection {
                path: path.to_path_buf(),
                message: format!(
                    "{} exited with {}: {}",
                    self.program.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_file_output(&stdout))
    }
}

/// Parse `file --mime --uncompress --brief` output, e.g.
/// `application/x-tar; charset=binary compressed-encoding=application/gzip; charset=binary`.
pub fn parse_file_output(output: &str) -> DetectionResult {
    let mime = output.split(';').next().unwrap_or_default().trim().to_string();
    let compression = COMPRESSED_ENCODING
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());
    DetectionResult { mime, compression }
}
