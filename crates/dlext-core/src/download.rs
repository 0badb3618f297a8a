//! Fetching remote bytes into a local path.
//!
//! The cache only depends on the [`Downloader`] trait. [`HttpDownloader`]
//! is the stock implementation; tests and embedders can supply their own.
//!
//! A downloader writes straight to the destination it is given. Staging and
//! verification are the cache's job, so on failure the destination may hold
//! a partial file that the caller is expected to delete.

use crate::config::NetworkConfig;
use crate::error::{DlextError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use std::path::Path;
use std::time::Instant;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// What to fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadRequest {
    pub uri: String,
    /// Extra request headers, sent in order.
    pub headers: Vec<(String, String)>,
}

impl DownloadRequest {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            headers: Vec::new(),
        }
    }
}

/// Fetches a URI into a destination path.
#[async_trait]
pub trait Downloader: Send + Sync {
    /// Write the full body of `request` to `destination`.
    ///
    /// Must not return `Ok` before every byte has been written. Returns the
    /// number of bytes written.
    async fn download(&self, request: &DownloadRequest, destination: &Path) -> Result<u64>;
}

/// Progress information for a download.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    /// Bytes downloaded so far.
    pub bytes_downloaded: u64,
    /// Total bytes (if known).
    pub total_bytes: Option<u64>,
    /// Average speed in bytes per second.
    pub speed_bytes_per_sec: f64,
    /// Percentage complete (0-100).
    pub percent: Option<f64>,
}

impl DownloadProgress {
    fn new(bytes_downloaded: u64, total_bytes: Option<u64>, speed: f64) -> Self {
        let percent = total_bytes.map(|total| {
            if total > 0 {
                (bytes_downloaded as f64 / total as f64) * 100.0
            } else {
                0.0
            }
        });

        Self {
            bytes_downloaded,
            total_bytes,
            speed_bytes_per_sec: speed,
            percent,
        }
    }
}

/// Streaming HTTP(S) downloader.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: Client,
    progress_tx: Option<mpsc::Sender<DownloadProgress>>,
}

impl HttpDownloader {
    /// Create a downloader with the default timeouts and user agent.
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(NetworkConfig::DOWNLOAD_REQUEST_TIMEOUT)
            .connect_timeout(NetworkConfig::CONNECT_TIMEOUT)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| DlextError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                source: Some(e),
            })?;
        Ok(Self::with_client(client))
    }

    /// Use a preconfigured client.
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            progress_tx: None,
        }
    }

    /// Send progress updates while downloading.
    pub fn with_progress(mut self, progress_tx: mpsc::Sender<DownloadProgress>) -> Self {
        self.progress_tx = Some(progress_tx);
        self
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(&self, request: &DownloadRequest, destination: &Path) -> Result<u64> {
        let url = url::Url::parse(&request.uri).map_err(|e| DlextError::InvalidRequest {
            field: "uri".to_string(),
            message: format!("{}: {}", request.uri, e),
        })?;

        debug!("GET {}", url);
        let mut builder = self.client.get(url);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DlextError::DownloadFailed {
                url: request.uri.clone(),
                message: format!("Download failed with status {}", status),
            });
        }

        let total_bytes = response.content_length();
        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(|e| DlextError::io_with_path(e, destination))?;

        let started = Instant::now();
        let mut last_progress_update = Instant::now();
        let mut bytes_downloaded: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| DlextError::Network {
                message: format!("Error reading download stream: {}", e),
                source: Some(e),
            })?;

            file.write_all(&chunk)
                .await
                .map_err(|e| DlextError::io_with_path(e, destination))?;
            bytes_downloaded += chunk.len() as u64;

            if last_progress_update.elapsed() >= NetworkConfig::DOWNLOAD_PROGRESS_INTERVAL {
                self.report(bytes_downloaded, total_bytes, started).await;
                last_progress_update = Instant::now();
            }
        }

        // Ensure data is on disk before reporting success
        file.flush()
            .await
            .map_err(|e| DlextError::io_with_path(e, destination))?;
        file.sync_all()
            .await
            .map_err(|e| DlextError::io_with_path(e, destination))?;

        self.report(bytes_downloaded, total_bytes, started).await;
        info!(
            "Downloaded {} bytes from {} to {}",
            bytes_downloaded,
            request.uri,
            destination.display()
        );
        Ok(bytes_downloaded)
    }
}

impl HttpDownloader {
    async fn report(&self, bytes_downloaded: u64, total_bytes: Option<u64>, started: Instant) {
        if let Some(ref tx) = self.progress_tx {
            let elapsed = started.elapsed().as_secs_f64();
            let speed = if elapsed > 0.0 {
                bytes_downloaded as f64 / elapsed
            } else {
                0.0
            };
            let _ = tx
                .send(DownloadProgress::new(bytes_downloaded, total_bytes, speed))
                .await;
        }
    }
}
