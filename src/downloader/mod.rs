pub mod client;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;

use crate::errors::{AppError, Result};
use client::RetryingClient;

/// Ranges a resource is split into when the server supports ranged reads.
pub const DEFAULT_CHUNK_COUNT: u64 = 8;

/// Concurrent chunk fetches across all in-flight downloads.
pub const DOWNLOAD_POOL_SIZE: usize = 10;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
pub const CHUNK_TIMEOUT: Duration = Duration::from_secs(30);
pub const COVER_TIMEOUT: Duration = Duration::from_secs(30);
pub const SINGLE_STREAM_TIMEOUT: Duration = Duration::from_secs(60);

/// One contiguous byte range of a remote resource, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Partitions `[0, length - 1]` into `count` contiguous ranges of equal
/// width, the last range absorbing the integer-division remainder.
pub fn plan_chunks(length: u64, count: u64) -> Vec<ByteRange> {
    debug_assert!(length > 0 && count > 0);
    let count = count.min(length);
    let width = length / count;

    (0..count)
        .map(|i| {
            let start = i * width;
            let end = if i == count - 1 {
                length - 1
            } else {
                start + width - 1
            };
            ByteRange { start, end }
        })
        .collect()
}

fn chunk_file_path(dest: &Path, index: usize) -> PathBuf {
    PathBuf::from(format!("{}.part{index}", dest.display()))
}

/// One in-flight retrieval. `chunks` is the range plan actually used:
/// contiguous and exhaustive over `[0, length - 1]` in chunked mode, empty
/// when the download degraded to a single stream.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub url: String,
    pub dest: PathBuf,
    pub length: Option<u64>,
    pub chunks: Vec<ByteRange>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl DownloadTask {
    fn new(url: &str, dest: &Path) -> Self {
        Self {
            url: url.to_string(),
            dest: dest.to_path_buf(),
            length: None,
            chunks: Vec::new(),
            created_at: chrono::Utc::now(),
        }
    }
}

/// Concurrent chunked downloader with single-stream fallback.
///
/// Chunk fetches share a bounded permit pool so parallel requests cannot
/// saturate the client. Chunk files are transient: they exist only between
/// chunk completion and reassembly, and every failure path removes them.
pub struct Downloader {
    client: Arc<RetryingClient>,
    permits: Arc<Semaphore>,
    chunk_count: u64,
}

impl Downloader {
    pub fn new(client: Arc<RetryingClient>, permits: Arc<Semaphore>) -> Self {
        Self {
            client,
            permits,
            chunk_count: DEFAULT_CHUNK_COUNT,
        }
    }

    pub fn with_chunk_count(mut self, chunk_count: u64) -> Self {
        self.chunk_count = chunk_count.max(1);
        self
    }

    /// Downloads `url` to `dest`, preferring the chunked path and falling
    /// back to one unranged stream. Fails only once both paths are
    /// exhausted; no partial file survives a failure.
    pub async fn download(&self, url: &str, dest: &Path) -> Result<DownloadTask> {
        let mut task = DownloadTask::new(url, dest);
        match self.download_chunked(&mut task).await {
            Ok(()) => Ok(task),
            Err(e) => {
                log::warn!("chunked download failed ({e}), falling back to single stream");
                task.chunks.clear();
                self.download_single(url, dest).await?;
                Ok(task)
            }
        }
    }

    async fn download_chunked(&self, task: &mut DownloadTask) -> Result<()> {
        let url = task.url.clone();
        let dest = task.dest.clone();

        let length = self
            .client
            .content_length(&url, PROBE_TIMEOUT)
            .await?
            .ok_or_else(|| AppError::Download("content length unavailable".to_string()))?;
        task.length = Some(length);

        let plan = plan_chunks(length, self.chunk_count);
        task.chunks = plan.clone();
        log::info!(
            "downloading {url}: {length} bytes in {} chunks",
            plan.len()
        );

        let mut handles = Vec::with_capacity(plan.len());
        for (index, range) in plan.iter().enumerate() {
            let client = self.client.clone();
            let permits = self.permits.clone();
            let url = url.to_string();
            let part_path = chunk_file_path(&dest, index);
            let range = *range;

            handles.push(tokio::spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| AppError::Unavailable("download pool closed".to_string()))?;
                fetch_chunk(&client, &url, range, &part_path).await
            }));
        }

        let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let mut pending: FuturesUnordered<_> = handles.into_iter().collect();
        let mut failure = None;

        while let Some(joined) = pending.next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(AppError::Download(format!("chunk task failed: {e}"))),
            };
            if let Err(e) = result {
                log::error!("chunk fetch failed: {e}");
                failure = Some(e);
                break;
            }
        }

        if let Some(e) = failure {
            // Partial ranges must never be concatenated. Stop the remaining
            // fetches, wait for their files to close, then clean up.
            for handle in &abort_handles {
                handle.abort();
            }
            while pending.next().await.is_some() {}
            remove_chunk_files(&dest, plan.len()).await;
            return Err(e);
        }

        self.reassemble(&dest, &plan, length).await
    }

    /// Concatenates chunk files in ascending start-offset order, then
    /// deletes them.
    async fn reassemble(&self, dest: &Path, plan: &[ByteRange], length: u64) -> Result<()> {
        let result = async {
            let mut output = tokio::fs::File::create(dest).await?;
            let mut written = 0u64;

            for (index, range) in plan.iter().enumerate() {
                let part_path = chunk_file_path(dest, index);
                let bytes = tokio::fs::read(&part_path).await?;
                if bytes.len() as u64 != range.len() {
                    return Err(AppError::Download(format!(
                        "chunk {index} is {} bytes, expected {}",
                        bytes.len(),
                        range.len()
                    )));
                }
                output.write_all(&bytes).await?;
                written += bytes.len() as u64;
            }

            output.flush().await?;
            if written != length {
                return Err(AppError::Download(format!(
                    "reassembled {written} bytes, expected {length}"
                )));
            }
            Ok(())
        }
        .await;

        remove_chunk_files(dest, plan.len()).await;
        if result.is_err() {
            remove_file_if_exists(dest).await;
        }
        result
    }

    async fn download_single(&self, url: &str, dest: &Path) -> Result<()> {
        log::info!("downloading {url} as a single stream");
        let result = async {
            let response = self.client.get(url, None, SINGLE_STREAM_TIMEOUT).await?;
            write_body_to_file(response, dest).await
        }
        .await;

        if result.is_err() {
            remove_file_if_exists(dest).await;
        }
        result
    }

    /// Fetches the cover image. Failures are logged and absorbed: tagging
    /// proceeds without an embedded picture.
    pub async fn fetch_cover(&self, cover_url: &str) -> Option<Vec<u8>> {
        match self.fetch_cover_bytes(cover_url).await {
            Ok(bytes) => {
                log::info!("cover downloaded: {} bytes", bytes.len());
                Some(bytes)
            }
            Err(e) => {
                log::error!("cover download failed: {e}");
                None
            }
        }
    }

    async fn fetch_cover_bytes(&self, cover_url: &str) -> Result<Vec<u8>> {
        let response = self.client.get(cover_url, None, COVER_TIMEOUT).await?;
        Ok(response.bytes().await?.to_vec())
    }
}

async fn fetch_chunk(
    client: &RetryingClient,
    url: &str,
    range: ByteRange,
    part_path: &Path,
) -> Result<()> {
    let response = client
        .get(url, Some((range.start, range.end)), CHUNK_TIMEOUT)
        .await?;

    // A 200 here means the server ignored the range and sent the whole
    // body; concatenating that would corrupt the artifact.
    if response.status() != reqwest::StatusCode::PARTIAL_CONTENT {
        return Err(AppError::Download(format!(
            "expected 206 for range {}-{}, got {}",
            range.start,
            range.end,
            response.status()
        )));
    }

    write_body_to_file(response, part_path).await
}

async fn write_body_to_file(response: reqwest::Response, path: &Path) -> Result<()> {
    use futures_util::StreamExt;

    let mut file = tokio::fs::File::create(path).await?;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

async fn remove_chunk_files(dest: &Path, count: usize) {
    for index in 0..count {
        remove_file_if_exists(&chunk_file_path(dest, index)).await;
    }
}

async fn remove_file_if_exists(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::error!("failed to remove {:?}: {e}", path),
    }
}
