pub mod container;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::errors::{AppError, Result};

/// Concurrent tag-write tasks. Decoupled from the download pool so tagging
/// throughput is never starved by in-flight downloads.
pub const WRITE_POOL_SIZE: usize = 5;

/// The canonical field set written to every processed container. Optional
/// fields that are absent or empty never produce frames in the output.
#[derive(Debug, Clone, Default)]
pub struct MetadataFields {
    pub title: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub year: Option<String>,
    pub lyrics: Option<String>,
    pub comment: Option<String>,
    pub cover: Option<Vec<u8>>,
}

/// Pooled entry point for tag rewrites. Container I/O is synchronous, so
/// each write runs on the blocking thread pool under a bounded permit set.
pub struct MetadataWriter {
    permits: Arc<Semaphore>,
}

impl MetadataWriter {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
        }
    }

    pub async fn write(&self, path: PathBuf, fields: MetadataFields) -> Result<()> {
        let _permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| AppError::Unavailable("metadata pool closed".to_string()))?;

        tokio::task::spawn_blocking(move || container::write_tags(&path, &fields))
            .await
            .map_err(|e| AppError::Metadata(format!("tag write task failed: {e}")))?
    }
}

impl Default for MetadataWriter {
    fn default() -> Self {
        Self::new(WRITE_POOL_SIZE)
    }
}
