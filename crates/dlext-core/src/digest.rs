//! Streaming SHA256 digests in URL-safe, unpadded base64.
//!
//! This encoding is used for every digest that appears in a cache path or
//! is compared against a caller-supplied hash.

use crate::config::HashConfig;
use crate::error::{DlextError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;

/// A SHA256 digest in canonical (URL-safe, unpadded base64) form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Canonicalize a caller-supplied digest string.
    ///
    /// Standard base64 is rewritten to the URL-safe alphabet and padding is
    /// dropped, so `ab+/c=` and `ab-_c` name the same digest. No other
    /// validation is done: an impossible digest simply never matches.
    pub fn canonicalize(raw: &str) -> Self {
        let clean = raw
            .chars()
            .filter(|c| *c != '=')
            .map(|c| match c {
                '+' => '-',
                '/' => '_',
                other => other,
            })
            .collect();
        Self(clean)
    }

    /// Digest of an in-memory byte string.
    pub fn of_bytes(bytes: impl AsRef<[u8]>) -> Self {
        Self(URL_SAFE_NO_PAD.encode(Sha256::digest(bytes.as_ref())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContentDigest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Digest a file by streaming it in fixed-size chunks.
///
/// Returns `None` when nothing exists at `path`.
pub fn digest_file_blocking(path: impl AsRef<Path>) -> Result<Option<ContentDigest>> {
    let path = path.as_ref();
    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(DlextError::io_with_path(e, path)),
    };

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HashConfig::CHUNK_SIZE];
    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| DlextError::io_with_path(e, path))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(Some(ContentDigest(URL_SAFE_NO_PAD.encode(hasher.finalize()))))
}

/// Async wrapper around [`digest_file_blocking`].
///
/// The read loop runs on the blocking pool so large files do not stall
/// other tasks on the runtime.
pub async fn digest_of(path: impl AsRef<Path>) -> Result<Option<ContentDigest>> {
    let path = path.as_ref().to_path_buf();
    let task_path = path.clone();

    tokio::task::spawn_blocking(move || digest_file_blocking(&task_path))
        .await
        .map_err(|e| DlextError::Io {
            message: format!("Hash computation task failed: {}", e),
            path: Some(path),
            source: None,
        })?
}
