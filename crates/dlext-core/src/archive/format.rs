//! Supported compression and container formats.
//!
//! Both are closed enums so that adding a format means adding a variant,
//! and every `match` over them has to account for it.

use crate::inspect::DetectionResult;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Read};

/// A compression layer wrapping a byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Gzip,
    Bzip2,
    Xz,
    Zstd,
}

impl Compression {
    /// Resolve a compression token, e.g. `gzip` or `application/x-xz`.
    pub fn from_token(token: &str) -> Option<Self> {
        match normalize_token(token).as_str() {
            "gzip" | "x-gzip" | "application/gzip" | "application/x-gzip" => Some(Self::Gzip),
            "bzip2" | "x-bzip2" | "application/bzip2" | "application/x-bzip2" => {
                Some(Self::Bzip2)
            }
            "xz" | "x-xz" | "application/xz" | "application/x-xz" => Some(Self::Xz),
            "zstd" | "application/zstd" | "application/x-zstd" => Some(Self::Zstd),
            _ => None,
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            Self::Gzip => "application/gzip",
            Self::Bzip2 => "application/x-bzip2",
            Self::Xz => "application/x-xz",
            Self::Zstd => "application/zstd",
        }
    }

    /// Wrap `reader` in the matching decoder.
    ///
    /// Every decoder reads concatenated members/streams to the end, as
    /// written by parallel compressors such as pigz or pbzip2.
    pub fn decoder<R: BufRead>(self, reader: R) -> std::io::Result<DecodeStage<R>> {
        Ok(match self {
            Self::Gzip => DecodeStage::Gzip(flate2::bufread::MultiGzDecoder::new(reader)),
            Self::Bzip2 => DecodeStage::Bzip2(bzip2::bufread::MultiBzDecoder::new(reader)),
            Self::Xz => DecodeStage::Xz(xz2::bufread::XzDecoder::new_multi_decoder(reader)),
            Self::Zstd => DecodeStage::Zstd(zstd::stream::read::Decoder::with_buffer(reader)?),
        })
    }
}

/// Decompression stage in front of an unarchiver.
pub enum DecodeStage<R: BufRead> {
    Identity(R),
    Gzip(flate2::bufread::MultiGzDecoder<R>),
    Bzip2(bzip2::bufread::MultiBzDecoder<R>),
    Xz(xz2::bufread::XzDecoder<R>),
    Zstd(zstd::stream::read::Decoder<'static, R>),
}

impl<R: BufRead> DecodeStage<R> {
    /// Decoder for `compression`, or a pass-through if there is none.
    pub fn new(compression: Option<Compression>, reader: R) -> std::io::Result<Self> {
        match compression {
            Some(compression) => compression.decoder(reader),
            None => Ok(Self::Identity(reader)),
        }
    }
}

impl<R: BufRead> Read for DecodeStage<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Self::Identity(reader) => reader.read(buf),
            Self::Gzip(reader) => reader.read(buf),
            Self::Bzip2(reader) => reader.read(buf),
            Self::Xz(reader) => reader.read(buf),
            Self::Zstd(reader) => reader.read(buf),
        }
    }
}

/// How an unarchiver consumes its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// One ordered pass over a (possibly decompressed) byte stream.
    Streaming,
    /// Seeks within the file itself; compression layers do not apply.
    RandomAccess,
}

/// A container format that can be unpacked into a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveKind {
    Tar,
    Zip,
}

impl ArchiveKind {
    /// Resolve a container token, e.g. `application/x-tar`.
    pub fn from_token(token: &str) -> Option<Self> {
        match normalize_token(token).as_str() {
            "tar" | "x-tar" | "application/x-tar" | "application/tar" => Some(Self::Tar),
            "zip" | "application/zip" | "application/x-zip-compressed" => Some(Self::Zip),
            _ => None,
        }
    }

    pub fn access_mode(self) -> AccessMode {
        match self {
            Self::Tar => AccessMode::Streaming,
            Self::Zip => AccessMode::RandomAccess,
        }
    }
}

/// How a detected archive is to be unpacked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivePlan {
    pub kind: ArchiveKind,
    /// Decoder in front of the unarchiver. Always `None` for random-access kinds.
    pub compression: Option<Compression>,
}

impl ArchivePlan {
    /// Decide whether `detection` describes an archive.
    ///
    /// The container is looked up from the compression token first (some
    /// inspectors report self-describing containers there) and then from
    /// the MIME type. `None` means "not an archive", which is not an error.
    pub fn resolve(detection: &DetectionResult) -> Option<Self> {
        let token = detection.compression.as_deref();
        let kind = token
            .and_then(ArchiveKind::from_token)
            .or_else(|| ArchiveKind::from_token(&detection.mime))?;

        let compression = match kind.access_mode() {
            AccessMode::Streaming => token.and_then(Compression::from_token),
            AccessMode::RandomAccess => None,
        };

        Some(Self { kind, compression })
    }
}

/// Lowercase and drop any `; param=...` suffix.
fn normalize_token(token: &str) -> String {
    token
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}
