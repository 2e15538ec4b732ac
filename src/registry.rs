use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::lifecycle::Shutdown;

/// Age past which a registered artifact is eligible for eviction.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// How often the sweeper scans the registry.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// A processed file owned by the registry until eviction.
#[derive(Debug, Clone)]
pub struct AudioArtifact {
    pub id: String,
    pub path: PathBuf,
    pub filename: String,
    created: Instant,
}

impl AudioArtifact {
    /// The identifier is minted by the caller (a UUID from
    /// [`generate_file_id`]) so the artifact's on-disk name and its registry
    /// key can share it.
    pub fn new(id: String, path: PathBuf, filename: String) -> Self {
        Self {
            id,
            path,
            filename,
            created: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }
}

/// In-memory map from artifact identifier to processed file.
///
/// The map is the only state shared between request handlers and the
/// sweeper; every mutation goes through the `RwLock`, and the sweeper holds
/// the write lock for its whole scan-and-evict pass so a resolve can never
/// observe a half-deleted entry. Identifiers are UUIDs and never reused.
#[derive(Clone)]
pub struct FileRegistry {
    entries: Arc<RwLock<HashMap<String, AudioArtifact>>>,
    ttl: Duration,
}

impl FileRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Registers a processed artifact. The identifier becomes visible to
    /// `resolve` only once path and filename are both in the entry.
    pub async fn register(&self, artifact: AudioArtifact) -> String {
        let id = artifact.id.clone();
        let mut entries = self.entries.write().await;
        entries.insert(id.clone(), artifact);
        id
    }

    pub async fn resolve(&self, id: &str) -> Option<AudioArtifact> {
        let entries = self.entries.read().await;
        entries.get(id).cloned()
    }

    /// Removes an entry and deletes its backing file.
    pub async fn evict(&self, id: &str) {
        let removed = {
            let mut entries = self.entries.write().await;
            entries.remove(id)
        };
        if let Some(artifact) = removed {
            remove_artifact_file(&artifact).await;
        }
    }

    pub async fn len(&self) -> usize {
        let entries = self.entries.read().await;
        entries.len()
    }

    /// Starts the background sweeper. Runs until shutdown is signalled.
    pub fn spawn_sweeper(&self, interval: Duration, shutdown: Shutdown) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if shutdown.is_shutting_down() {
                    break;
                }
                registry.sweep().await;
            }
        })
    }

    /// Evicts every entry older than the TTL.
    pub async fn sweep(&self) {
        let mut entries = self.entries.write().await;
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, artifact)| artifact.age() > self.ttl)
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            if let Some(artifact) = entries.remove(&id) {
                remove_artifact_file(&artifact).await;
                log::info!("evicted expired artifact {id} ({:?})", artifact.path);
            }
        }
    }
}

async fn remove_artifact_file(artifact: &AudioArtifact) {
    match tokio::fs::remove_file(&artifact.path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::error!("failed to delete {:?}: {e}", artifact.path),
    }
}
