//! Resumable, verified HTTP downloads.
//!
//! Files are streamed into a `<destination>.tmp` partial. An existing
//! partial is resumed with a `Range` request. Once the body is complete the
//! partial is checked against the expected size and SHA-256 digest and only
//! then renamed over the destination, so a reader never observes a
//! half-written file.
//!
//! Transient failures are retried with linear backoff. Integrity failures are
//! not retried: re-fetching from a server that serves the wrong bytes cannot
//! fix them.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::RANGE;
use reqwest::StatusCode;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::UpdateError;
use crate::security;

/// Default timeout for establishing connections in seconds.
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default read timeout for streaming downloads in seconds.
const DEFAULT_READ_TIMEOUT_SECS: u64 = 60;

/// Default number of retries after the first attempt.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default linear backoff step between attempts.
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Suffix of in-progress download files.
pub const PARTIAL_SUFFIX: &str = ".tmp";

/// Configuration for the downloader.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Connection timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Read timeout for streaming in seconds.
    pub read_timeout_secs: u64,
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Backoff step; attempt `n` waits `n * retry_backoff`.
    pub retry_backoff: Duration,
    /// User agent string.
    pub user_agent: String,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            user_agent: format!("wfl-updater/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Progress callback invoked after every received chunk.
pub type ProgressFn<'a> = &'a (dyn Fn(DownloadProgress) + Send + Sync);

/// One file to fetch.
#[derive(Debug, Clone, Copy)]
pub struct FileDownload<'a> {
    /// Source URL.
    pub url: &'a str,
    /// Final location of the verified file.
    pub destination: &'a Path,
    /// Expected lowercase hex SHA-256.
    pub expected_sha256: &'a str,
    /// Expected size in bytes.
    pub expected_size: u64,
}

/// HTTP downloader with resume, retry and verification.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone)]
pub struct Downloader {
    /// HTTP client configured with timeouts.
    client: reqwest::Client,
    /// Configuration settings.
    config: DownloaderConfig,
}

impl Downloader {
    /// Create a new downloader with default settings.
    pub fn new() -> Result<Self, UpdateError> {
        Self::with_config(DownloaderConfig::default())
    }

    /// Create a new downloader with custom configuration.
    pub fn with_config(config: DownloaderConfig) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| UpdateError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Get the configuration.
    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    /// Fetch a URL into memory.
    ///
    /// Suitable for small payloads like manifests and signatures.
    pub async fn download_bytes(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, UpdateError> {
        self.fetch_optional(url, cancel)
            .await?
            .ok_or_else(|| UpdateError::HttpStatus {
                url: url.to_string(),
                status: StatusCode::NOT_FOUND.as_u16(),
            })
    }

    /// Fetch a URL into memory, mapping "not published" to `None`.
    ///
    /// Only 404 and 410 count as absent; every other failure is an error.
    pub async fn fetch_optional(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<u8>>, UpdateError> {
        debug!("Fetching URL: {}", url);

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
            r = self.client.get(url).send() => r?,
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            debug!(url, status = status.as_u16(), "resource not published");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(UpdateError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = tokio::select! {
            _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
            b = response.bytes() => b?,
        };
        debug!("Fetched {} bytes", bytes.len());
        Ok(Some(bytes.to_vec()))
    }

    /// Fetch a manifest and write it to `destination`.
    ///
    /// No resume and no verification; the write is still atomic.
    pub async fn download_manifest(
        &self,
        url: &str,
        destination: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), UpdateError> {
        let bytes = self.download_bytes(url, cancel).await?;
        write_atomic(destination, &bytes).await?;
        info!(url, path = %destination.display(), "manifest saved");
        Ok(())
    }

    /// Download, verify and atomically install one file.
    ///
    /// Retries transient failures up to `max_retries` times, deleting the
    /// partial file before each retry. Cancellation leaves the partial file
    /// in place so a later call resumes it.
    pub async fn download_file(
        &self,
        request: FileDownload<'_>,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<(), UpdateError> {
        let partial = partial_path(request.destination);
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(UpdateError::Cancelled);
            }

            match self.attempt_download(&request, &partial, cancel, progress).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = self.config.retry_backoff * attempt;
                    warn!(
                        url = request.url,
                        attempt,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "download failed, retrying"
                    );
                    remove_if_exists(&partial).await?;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt_download(
        &self,
        request: &FileDownload<'_>,
        partial: &Path,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<(), UpdateError> {
        if let Some(parent) = request.destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut start_byte = match fs::metadata(partial).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        if start_byte > request.expected_size {
            warn!(path = %partial.display(), "partial file larger than expected, discarding");
            fs::remove_file(partial).await?;
            start_byte = 0;
        }

        if start_byte > 0 && start_byte == request.expected_size {
            info!(path = %partial.display(), "partial file already complete");
            progress(DownloadProgress::new(start_byte, request.expected_size));
        } else {
            self.stream_to_partial(request, partial, start_byte, cancel, progress)
                .await?;
        }

        finalize(request, partial).await
    }

    async fn stream_to_partial(
        &self,
        request: &FileDownload<'_>,
        partial: &Path,
        start_byte: u64,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> Result<(), UpdateError> {
        let mut builder = self.client.get(request.url);
        if start_byte > 0 {
            debug!("Resuming download from byte {}", start_byte);
            builder = builder.header(RANGE, format!("bytes={start_byte}-"));
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(UpdateError::Cancelled),
            r = builder.send() => r?,
        };
        let status = response.status();

        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(UpdateError::Network(format!(
                "range request from byte {start_byte} rejected by server"
            )));
        }
        if !status.is_success() {
            return Err(UpdateError::HttpStatus {
                url: request.url.to_string(),
                status: status.as_u16(),
            });
        }

        let resumed = start_byte > 0 && status == StatusCode::PARTIAL_CONTENT;
        if start_byte > 0 && !resumed {
            warn!(url = request.url, "server ignored range request, restarting download");
        }

        let mut file = if resumed {
            OpenOptions::new().append(true).open(partial).await?
        } else {
            File::create(partial).await?
        };

        let mut downloaded = if resumed { start_byte } else { 0 };
        progress(DownloadProgress::new(downloaded, request.expected_size));

        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    file.flush().await?;
                    debug!(path = %partial.display(), downloaded, "download cancelled, keeping partial");
                    return Err(UpdateError::Cancelled);
                }
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|e| UpdateError::Network(e.to_string()))?;

            let received = downloaded + chunk.len() as u64;
            if received > request.expected_size {
                drop(file);
                fs::remove_file(partial).await?;
                return Err(UpdateError::SizeMismatch {
                    path: request.destination.display().to_string(),
                    expected: request.expected_size,
                    actual: received,
                });
            }

            file.write_all(&chunk).await?;
            downloaded = received;
            progress(DownloadProgress::new(downloaded, request.expected_size));
        }

        file.flush().await?;
        file.sync_all().await?;

        if downloaded < request.expected_size {
            return Err(UpdateError::Network(format!(
                "download incomplete: received {} of {} bytes",
                downloaded, request.expected_size
            )));
        }

        Ok(())
    }
}

/// Verify the completed partial and rename it over the destination.
async fn finalize(request: &FileDownload<'_>, partial: &Path) -> Result<(), UpdateError> {
    let actual_size = fs::metadata(partial).await?.len();
    if actual_size != request.expected_size {
        fs::remove_file(partial).await?;
        return Err(UpdateError::SizeMismatch {
            path: request.destination.display().to_string(),
            expected: request.expected_size,
            actual: actual_size,
        });
    }

    let actual_hash = security::compute_file_digest(partial).await?;
    if !security::digests_match(&actual_hash, request.expected_sha256) {
        fs::remove_file(partial).await?;
        tracing::error!(
            url = request.url,
            expected = request.expected_sha256,
            actual = %actual_hash,
            "downloaded file failed digest check"
        );
        return Err(UpdateError::HashMismatch {
            path: request.destination.display().to_string(),
            expected: request.expected_sha256.to_string(),
            actual: actual_hash,
        });
    }

    fs::rename(partial, request.destination).await?;
    debug!(path = %request.destination.display(), size = actual_size, "download verified");
    Ok(())
}

/// Path of the in-progress partial for `destination`.
pub fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Write `bytes` to `path` through a sibling temp file and a rename.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), UpdateError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let tmp = partial_path(path);
    let mut file = File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), UpdateError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Download progress information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadProgress {
    /// Bytes on disk so far, including bytes resumed from a partial.
    pub downloaded: u64,
    /// Total bytes expected.
    pub total: u64,
}

impl DownloadProgress {
    /// Create a new progress instance.
    pub fn new(downloaded: u64, total: u64) -> Self {
        Self { downloaded, total }
    }

    /// Get download progress as a percentage (0.0 to 100.0).
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.downloaded as f64 / self.total as f64) * 100.0
        }
    }

    /// Check if the download is complete.
    pub fn is_complete(&self) -> bool {
        self.downloaded >= self.total && self.total > 0
    }
}

impl std::fmt::Display for DownloadProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} bytes ({:.1}%)",
            self.downloaded,
            self.total,
            self.percentage()
        )
    }
}
