//! Artifact store trait and in-memory / filesystem implementations.

use crate::core::{Artifact, ArtifactId, ArtifactRef, RunId, SourceRef, StageKind};
use crate::errors::StoreError;
use crate::utils::Timestamp;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::io::Write;
use tracing::{debug, warn};

/// Metadata about a stored artifact, without its content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSummary {
    /// Store address.
    pub id: ArtifactId,
    /// Producing stage.
    pub stage: StageKind,
    /// Producing run.
    pub run_id: RunId,
    /// Snapshot it derives from.
    pub source: SourceRef,
    /// Content hash.
    pub content_hash: String,
    /// Creation time.
    pub created_at: Timestamp,
    /// Total size of the files in bytes.
    pub size_bytes: usize,
}

impl From<&Artifact> for ArtifactSummary {
    fn from(artifact: &Artifact) -> Self {
        Self {
            id: artifact.id,
            stage: artifact.stage,
            run_id: artifact.run_id,
            source: artifact.source.clone(),
            content_hash: artifact.content_hash.clone(),
            created_at: artifact.created_at,
            size_bytes: artifact.content.total_bytes(),
        }
    }
}

/// Put/get/list storage for artifacts.
///
/// `put` must refuse an id that is already taken; artifacts are never
/// overwritten. `delete` is only used by garbage collection.
#[async_trait]
pub trait ArtifactStore: Send + Sync + Debug {
    /// Stores a new artifact.
    async fn put(&self, artifact: Artifact) -> Result<ArtifactRef, StoreError>;

    /// Fetches an artifact by id.
    async fn get(&self, id: &ArtifactId) -> Result<Arc<Artifact>, StoreError>;

    /// Lists summaries of every stored artifact.
    async fn list(&self) -> Result<Vec<ArtifactSummary>, StoreError>;

    /// Removes an artifact. Returns false if it did not exist.
    async fn delete(&self, id: &ArtifactId) -> Result<bool, StoreError>;
}

/// In-memory artifact store.
#[derive(Debug, Default)]
pub struct InMemoryArtifactStore {
    entries: DashMap<ArtifactId, Arc<Artifact>>,
}

impl InMemoryArtifactStore {
    /// Creates a new in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for InMemoryArtifactStore {
    async fn put(&self, artifact: Artifact) -> Result<ArtifactRef, StoreError> {
        let reference = artifact.reference();
        match self.entries.entry(artifact.id) {
            Entry::Occupied(_) => Err(StoreError::AlreadyExists(artifact.id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(artifact));
                Ok(reference)
            }
        }
    }

    async fn get(&self, id: &ArtifactId) -> Result<Arc<Artifact>, StoreError> {
        self.entries
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn list(&self) -> Result<Vec<ArtifactSummary>, StoreError> {
        let mut summaries: Vec<_> = self
            .entries
            .iter()
            .map(|entry| ArtifactSummary::from(entry.value().as_ref()))
            .collect();
        summaries.sort_by_key(|s| s.id);
        Ok(summaries)
    }

    async fn delete(&self, id: &ArtifactId) -> Result<bool, StoreError> {
        Ok(self.entries.remove(id).is_some())
    }
}

/// Artifact store backed by one JSON file per artifact.
///
/// File bodies are base64 encoded inside the record. A record is written to
/// a temporary file in the store directory and linked into place without
/// clobbering, so readers never see a partial record and a second put for
/// the same id fails.
#[derive(Debug, Clone)]
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    /// Opens (and creates if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// The store directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: &ArtifactId) -> PathBuf {
        self.root.join(format!("{id}.json"))
    }

    async fn read_record(&self, path: &Path, key: &str) -> Result<Artifact, StoreError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

fn write_record(root: &Path, path: &Path, body: &[u8]) -> std::io::Result<()> {
    let mut staged = tempfile::NamedTempFile::new_in(root)?;
    staged.write_all(body)?;
    staged.as_file().sync_all()?;
    staged.persist_noclobber(path).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, artifact: Artifact) -> Result<ArtifactRef, StoreError> {
        let path = self.record_path(&artifact.id);
        let body = serde_json::to_vec(&artifact).map_err(|e| StoreError::Corrupt {
            key: artifact.id.to_string(),
            reason: e.to_string(),
        })?;

        let root = self.root.clone();
        let size = body.len();
        let written = tokio::task::spawn_blocking(move || write_record(&root, &path, &body))
            .await
            .map_err(|e| StoreError::Unavailable(format!("writing {}: {e}", artifact.id)))?;
        match written {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StoreError::AlreadyExists(artifact.id.to_string()))
            }
            Err(e) => return Err(e.into()),
        }

        debug!(artifact_id = %artifact.id, bytes = size, "Stored artifact");
        Ok(artifact.reference())
    }

    async fn get(&self, id: &ArtifactId) -> Result<Arc<Artifact>, StoreError> {
        let key = id.to_string();
        let artifact = self.read_record(&self.record_path(id), &key).await?;
        if !artifact.verify() {
            return Err(StoreError::Corrupt {
                key,
                reason: "content hash mismatch".to_string(),
            });
        }
        Ok(Arc::new(artifact))
    }

    async fn list(&self) -> Result<Vec<ArtifactSummary>, StoreError> {
        let mut summaries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let key = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            match self.read_record(&path, &key).await {
                Ok(artifact) => summaries.push(ArtifactSummary::from(&artifact)),
                // Deleted since the directory was read.
                Err(StoreError::NotFound(_)) => {}
                Err(StoreError::Corrupt { key, reason }) => {
                    warn!(key = %key, reason = %reason, "Skipping unreadable artifact record");
                }
                Err(e) => return Err(e),
            }
        }
        summaries.sort_by_key(|s| s.id);
        Ok(summaries)
    }

    async fn delete(&self, id: &ArtifactId) -> Result<bool, StoreError> {
        match tokio::fs::remove_file(self.record_path(id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
