use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::Semaphore;

use crate::downloader::client::RetryingClient;
use crate::downloader::{Downloader, DOWNLOAD_POOL_SIZE};
use crate::errors::{AppError, Result};
use crate::metadata::{MetadataFields, MetadataWriter, WRITE_POOL_SIZE};
use crate::registry::{AudioArtifact, FileRegistry};
use crate::utils::{generate_file_id, original_filename_from_url};

/// One inbound processing call. `url` and `title` are mandatory; their
/// absence is a client error and no network I/O happens before validation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub year: Option<YearField>,
    #[serde(default)]
    pub lyrics: Option<String>,
    #[serde(default)]
    pub tips: Option<String>,
    #[serde(default)]
    pub cover_url: Option<String>,
}

/// Clients send the year either as a number or as text; it is stored as
/// text in every container scheme.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum YearField {
    Number(i64),
    Text(String),
}

impl YearField {
    pub fn into_text(self) -> String {
        match self {
            YearField::Number(n) => n.to_string(),
            YearField::Text(s) => s,
        }
    }
}

#[derive(Debug)]
pub struct ProcessOutcome {
    pub file_id: String,
}

/// Sequences one request through download, cover fetch, tag rewrite and
/// registration. Every failure path removes the partial file it owns; by
/// the time an identifier is visible in the registry, path and metadata are
/// final.
pub struct Pipeline {
    downloader: Downloader,
    writer: MetadataWriter,
    registry: FileRegistry,
    cache_dir: PathBuf,
}

impl Pipeline {
    pub fn new(registry: FileRegistry, cache_dir: PathBuf) -> Result<Self> {
        let client = Arc::new(RetryingClient::new(100)?);
        let downloader = Downloader::new(client, Arc::new(Semaphore::new(DOWNLOAD_POOL_SIZE)));
        let writer = MetadataWriter::new(WRITE_POOL_SIZE);
        Ok(Self {
            downloader,
            writer,
            registry,
            cache_dir,
        })
    }

    pub async fn process(&self, request: ProcessRequest) -> Result<ProcessOutcome> {
        let url = required_field(request.url.as_deref(), "url")?;
        let title = required_field(request.title.as_deref(), "title")?;

        let file_id = generate_file_id();
        let original_filename = original_filename_from_url(url);
        let staged_path = self.cache_dir.join(format!("{file_id}_{original_filename}"));
        let processed_path = self
            .cache_dir
            .join(format!("processed_{file_id}_{original_filename}"));

        // The cover fetch runs alongside the main download; tagging waits
        // for both, and a missing cover is not fatal.
        let cover_url = request.cover_url.as_deref().filter(|u| !u.is_empty());
        let (download_result, cover) = tokio::join!(
            self.downloader.download(url, &staged_path),
            async {
                match cover_url {
                    Some(u) => self.downloader.fetch_cover(u).await,
                    None => None,
                }
            }
        );

        let task = match download_result {
            Ok(task) => task,
            Err(e) => {
                remove_file_quietly(&staged_path).await;
                return Err(AppError::Download(format!("music download failed: {e}")));
            }
        };
        log::info!(
            "download complete for {url}: {} bytes, {} chunks",
            task.length.map(|l| l.to_string()).unwrap_or_else(|| "?".to_string()),
            task.chunks.len()
        );

        let size = tokio::fs::metadata(&staged_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        if size == 0 {
            remove_file_quietly(&staged_path).await;
            return Err(AppError::Download("downloaded file is empty".to_string()));
        }

        if let Err(e) = tokio::fs::rename(&staged_path, &processed_path).await {
            remove_file_quietly(&staged_path).await;
            return Err(AppError::Io(e));
        }

        let fields = MetadataFields {
            title: title.to_string(),
            artist: non_empty(request.artist),
            album: non_empty(request.album),
            year: non_empty(request.year.map(YearField::into_text)),
            lyrics: non_empty(request.lyrics),
            comment: non_empty(request.tips),
            cover,
        };

        if let Err(e) = self.writer.write(processed_path.clone(), fields).await {
            remove_file_quietly(&processed_path).await;
            return Err(e);
        }

        let artifact = AudioArtifact::new(file_id, processed_path, original_filename);
        let file_id = self.registry.register(artifact).await;
        Ok(ProcessOutcome { file_id })
    }
}

fn required_field<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AppError::InvalidInput(format!(
            "missing required field: {name}"
        ))),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

async fn remove_file_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::error!("failed to remove {:?}: {e}", path),
    }
}
