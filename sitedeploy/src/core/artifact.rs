//! Immutable artifacts handed between stages.

use super::{RunId, SourceRef, StageKind};
use crate::utils::{generate_uuid_v7, now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Unique address of an artifact in the artifact store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(Uuid);

impl ArtifactId {
    /// Allocates a fresh, time-ordered id.
    #[must_use]
    pub fn new() -> Self {
        Self(generate_uuid_v7())
    }

    /// The underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ArtifactId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ArtifactId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// The file tree carried by an artifact.
///
/// Paths are `/`-separated and relative. A `BTreeMap` keeps iteration order
/// stable, which makes the content hash reproducible.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactContent {
    #[serde(with = "base64_files")]
    files: BTreeMap<String, Vec<u8>>,
}

impl ArtifactContent {
    /// Creates empty content.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a file, replacing any previous body at the same path.
    #[must_use]
    pub fn with_file(mut self, path: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        self.insert(path, body);
        self
    }

    /// Adds a file in place.
    pub fn insert(&mut self, path: impl Into<String>, body: impl Into<Vec<u8>>) {
        let path = normalize_path(&path.into());
        self.files.insert(path, body.into());
    }

    /// Returns the body stored at `path`.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    /// Iterates over `(path, body)` in path order.
    pub fn files(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.files.iter().map(|(p, b)| (p.as_str(), b.as_slice()))
    }

    /// Number of files.
    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Returns true if there are no files.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Sum of all file sizes in bytes.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.files.values().map(Vec::len).sum()
    }

    /// SHA-256 over every `(path, length, body)` triple, hex encoded.
    #[must_use]
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, body) in &self.files {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            hasher.update((body.len() as u64).to_le_bytes());
            hasher.update(body);
        }
        hex::encode(hasher.finalize())
    }
}

impl FromIterator<(String, Vec<u8>)> for ArtifactContent {
    fn from_iter<I: IntoIterator<Item = (String, Vec<u8>)>>(iter: I) -> Self {
        let mut content = Self::new();
        for (path, body) in iter {
            content.insert(path, body);
        }
        content
    }
}

fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches("./").trim_start_matches('/').to_string()
}

/// A lightweight pointer to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Store address.
    pub id: ArtifactId,
    /// Content hash at creation time.
    pub content_hash: String,
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.id, &self.content_hash[..self.content_hash.len().min(12)])
    }
}

/// An immutable blob plus metadata about who produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Store address.
    pub id: ArtifactId,
    /// The stage that produced it.
    pub stage: StageKind,
    /// The run that produced it.
    pub run_id: RunId,
    /// The snapshot it derives from.
    pub source: SourceRef,
    /// Hash of `content`.
    pub content_hash: String,
    /// When it was created.
    pub created_at: Timestamp,
    /// The files.
    pub content: ArtifactContent,
}

impl Artifact {
    /// Wraps stage output into a new artifact with a fresh id.
    #[must_use]
    pub fn new(stage: StageKind, run_id: RunId, source: SourceRef, content: ArtifactContent) -> Self {
        Self {
            id: ArtifactId::new(),
            stage,
            run_id,
            source,
            content_hash: content.content_hash(),
            created_at: now_utc(),
            content,
        }
    }

    /// A reference to this artifact.
    #[must_use]
    pub fn reference(&self) -> ArtifactRef {
        ArtifactRef {
            id: self.id,
            content_hash: self.content_hash.clone(),
        }
    }

    /// Returns true if the stored hash still matches the content.
    #[must_use]
    pub fn verify(&self) -> bool {
        self.content.content_hash() == self.content_hash
    }
}

mod base64_files {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S>(files: &BTreeMap<String, Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded: BTreeMap<&str, String> = files
            .iter()
            .map(|(path, body)| (path.as_str(), STANDARD.encode(body)))
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BTreeMap<String, Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = BTreeMap::<String, String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(path, body)| {
                STANDARD
                    .decode(body)
                    .map(|bytes| (path, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}
