//! Shared fixtures for integration tests.
//!
//! Every archive fixture holds a single `foo.txt` entry with [`FOO_CONTENT`].

#![allow(dead_code)]

use async_trait::async_trait;
use dlext_core::{DlextError, DownloadRequest, Downloader};
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub const FOO_CONTENT: &[u8] = b"foo\n";

/// Fixture names, as they would appear at the end of a URI.
pub const ARCHIVE_FIXTURES: [&str; 6] = [
    "foo.tar",
    "foo.zip",
    "foo.tar.gz",
    "foo.tar.bz2",
    "foo.tar.xz",
    "foo.tar.zst",
];

pub fn tar_bytes() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(FOO_CONTENT.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "foo.txt", FOO_CONTENT)
        .unwrap();
    builder.into_inner().unwrap()
}

/// A tar holding `a.txt` then `b.txt`. The first entry ends at byte 1024.
pub fn two_entry_tar_bytes() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, content) in [("a.txt", b"aaa\n"), ("b.txt", b"bbb\n")] {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, &content[..]).unwrap();
    }
    builder.into_inner().unwrap()
}

pub fn zip_bytes() -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    writer.start_file("foo.txt", options).unwrap();
    writer.write_all(FOO_CONTENT).unwrap();
    writer.finish().unwrap().into_inner()
}

pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

pub fn bzip2(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

pub fn xz(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = xz2::write::XzEncoder::new(Vec::new(), 6);
    encoder.write_all(bytes).unwrap();
    encoder.finish().unwrap()
}

pub fn zstd(bytes: &[u8]) -> Vec<u8> {
    zstd::encode_all(bytes, 0).unwrap()
}

/// Bytes of a named fixture.
pub fn fixture(name: &str) -> Vec<u8> {
    match name {
        "foo.txt" => FOO_CONTENT.to_vec(),
        "foo.tar" => tar_bytes(),
        "foo.zip" => zip_bytes(),
        "foo.tar.gz" => gzip(&tar_bytes()),
        "foo.tar.bz2" => bzip2(&tar_bytes()),
        "foo.tar.xz" => xz(&tar_bytes()),
        "foo.tar.zst" => zstd(&tar_bytes()),
        other => panic!("unknown fixture {other}"),
    }
}

/// Write a named fixture into `dir` and return its path.
pub fn write_fixture(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, fixture(name)).unwrap();
    path
}

/// Sorted entry names of a directory.
pub fn list_dir(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Every path under `dir`, relative to it, with `/` separators.
pub fn list_tree(dir: &Path) -> Vec<String> {
    let mut paths: Vec<String> = walkdir::WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .map(|entry| {
            let entry = entry.unwrap();
            entry
                .path()
                .strip_prefix(dir)
                .unwrap()
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
        .collect();
    paths.sort();
    paths
}

/// Names in `dir` that end with `.pending`.
pub fn pending_leftovers(dir: &Path) -> Vec<String> {
    list_dir(dir)
        .into_iter()
        .filter(|name| name.ends_with(".pending"))
        .collect()
}

/// In-memory downloader serving bodies by the last URI segment.
#[derive(Default)]
pub struct FakeDownloader {
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    calls: AtomicUsize,
}

impl FakeDownloader {
    /// Serves every known fixture.
    pub fn with_fixtures() -> Self {
        let downloader = Self::default();
        downloader.serve("foo.txt", fixture("foo.txt"));
        for name in ARCHIVE_FIXTURES {
            downloader.serve(name, fixture(name));
        }
        downloader
    }

    pub fn serve(&self, name: &str, body: Vec<u8>) {
        self.bodies.lock().unwrap().insert(name.to_string(), body);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Downloader for FakeDownloader {
    async fn download(
        &self,
        request: &DownloadRequest,
        destination: &Path,
    ) -> dlext_core::Result<u64> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let name = request.uri.rsplit('/').next().unwrap_or_default();
        let body = self.bodies.lock().unwrap().get(name).cloned();
        let Some(body) = body else {
            // Leave a partial file behind, as a real transport might.
            tokio::fs::write(destination, b"partial").await?;
            return Err(DlextError::DownloadFailed {
                url: request.uri.clone(),
                message: "Download failed with status 404 Not Found".to_string(),
            });
        };

        tokio::fs::write(destination, &body).await?;
        Ok(body.len() as u64)
    }
}
