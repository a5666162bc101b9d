//! The serving content store that sync publishes into.

use super::etag;
use crate::errors::StoreError;
use crate::utils::{files, now_utc, Timestamp};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Headers attached to a published object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// `Content-Type`, if one is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// `Cache-Control`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
}

/// An object as held by a content store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    /// Object key within its target.
    pub key: String,
    /// Size in bytes.
    pub size: usize,
    /// Hex MD5 of the body.
    pub etag: String,
    /// Headers.
    pub meta: ObjectMeta,
    /// Last write time.
    pub last_modified: Timestamp,
}

/// A bucket-like key/value store with per-object headers.
///
/// `target` names the bucket or prefix; keys are `/`-separated.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContentStore: Send + Sync + Debug {
    /// Writes an object, replacing any previous version.
    async fn put_object(
        &self,
        target: &str,
        key: &str,
        body: Vec<u8>,
        meta: ObjectMeta,
    ) -> Result<StoredObject, StoreError>;

    /// Lists every key under `target`, sorted.
    async fn list_keys(&self, target: &str) -> Result<Vec<String>, StoreError>;

    /// Deletes an object. Returns false if it did not exist.
    async fn delete_object(&self, target: &str, key: &str) -> Result<bool, StoreError>;

    /// Reads an object's metadata without its body.
    async fn head_object(&self, target: &str, key: &str) -> Result<StoredObject, StoreError>;
}

fn check_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && !key.contains('\\')
        && key.split('/').all(|part| !part.is_empty() && part != "." && part != "..");
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

/// In-memory content store, mostly for tests.
#[derive(Debug, Default)]
pub struct InMemoryContentStore {
    targets: DashMap<String, BTreeMap<String, (StoredObject, Arc<Vec<u8>>)>>,
}

impl InMemoryContentStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the body of an object.
    #[must_use]
    pub fn body(&self, target: &str, key: &str) -> Option<Arc<Vec<u8>>> {
        self.targets
            .get(target)
            .and_then(|objects| objects.get(key).map(|(_, body)| Arc::clone(body)))
    }

    /// Number of objects under `target`.
    #[must_use]
    pub fn object_count(&self, target: &str) -> usize {
        self.targets.get(target).map_or(0, |objects| objects.len())
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn put_object(
        &self,
        target: &str,
        key: &str,
        body: Vec<u8>,
        meta: ObjectMeta,
    ) -> Result<StoredObject, StoreError> {
        check_key(key)?;
        let object = StoredObject {
            key: key.to_string(),
            size: body.len(),
            etag: etag(&body),
            meta,
            last_modified: now_utc(),
        };
        self.targets
            .entry(target.to_string())
            .or_default()
            .insert(key.to_string(), (object.clone(), Arc::new(body)));
        Ok(object)
    }

    async fn list_keys(&self, target: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .targets
            .get(target)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_object(&self, target: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self
            .targets
            .get_mut(target)
            .is_some_and(|mut objects| objects.remove(key).is_some()))
    }

    async fn head_object(&self, target: &str, key: &str) -> Result<StoredObject, StoreError> {
        self.targets
            .get(target)
            .and_then(|objects| objects.get(key).map(|(object, _)| object.clone()))
            .ok_or_else(|| StoreError::NotFound(format!("{target}/{key}")))
    }
}

/// Content store that mirrors each target into a directory.
///
/// Headers are kept next to the body in a `.meta/` sidecar tree so a plain
/// static file server can serve the target directory as-is.
#[derive(Debug, Clone)]
pub struct DirectoryContentStore {
    root: PathBuf,
}

const META_DIR: &str = ".meta";

impl DirectoryContentStore {
    /// Creates a store rooted at `root`. Each target is a subdirectory.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn target_dir(&self, target: &str) -> Result<PathBuf, StoreError> {
        files::safe_join(&self.root, target)
            .ok_or_else(|| StoreError::InvalidKey(target.to_string()))
    }

    fn paths(&self, target: &str, key: &str) -> Result<(PathBuf, PathBuf), StoreError> {
        check_key(key)?;
        let dir = self.target_dir(target)?;
        let body = files::safe_join(&dir, key).ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        let meta = files::safe_join(&dir.join(META_DIR), &format!("{key}.json"))
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        Ok((body, meta))
    }
}

#[async_trait]
impl ContentStore for DirectoryContentStore {
    async fn put_object(
        &self,
        target: &str,
        key: &str,
        body: Vec<u8>,
        meta: ObjectMeta,
    ) -> Result<StoredObject, StoreError> {
        if key.split('/').next() == Some(META_DIR) {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        let (body_path, meta_path) = self.paths(target, key)?;
        let object = StoredObject {
            key: key.to_string(),
            size: body.len(),
            etag: etag(&body),
            meta,
            last_modified: now_utc(),
        };
        let record = serde_json::to_vec_pretty(&object).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        for path in [&body_path, &meta_path] {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&body_path, &body).await?;
        tokio::fs::write(&meta_path, record).await?;

        debug!(deploy_target = target, key = key, size = object.size, "Wrote object");
        Ok(object)
    }

    async fn list_keys(&self, target: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.target_dir(target)?;
        let keys = tokio::task::spawn_blocking(move || files::walk_files(&dir))
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))??;
        Ok(keys
            .into_iter()
            .filter(|key| key.split('/').next() != Some(META_DIR))
            .collect())
    }

    async fn delete_object(&self, target: &str, key: &str) -> Result<bool, StoreError> {
        let (body_path, meta_path) = self.paths(target, key)?;
        let existed = match tokio::fs::remove_file(&body_path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        match tokio::fs::remove_file(&meta_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(existed)
    }

    async fn head_object(&self, target: &str, key: &str) -> Result<StoredObject, StoreError> {
        let (_, meta_path) = self.paths(target, key)?;
        let record = match tokio::fs::read(&meta_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(format!("{target}/{key}")))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&record).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn html_meta() -> ObjectMeta {
        ObjectMeta {
            content_type: Some("text/html".to_string()),
            cache_control: Some("max-age=600".to_string()),
        }
    }

    #[tokio::test]
    async fn test_in_memory_put_list_delete() {
        let store = InMemoryContentStore::new();
        let object = store
            .put_object("site", "index.html", b"hello".to_vec(), html_meta())
            .await
            .unwrap();
        assert_eq!(object.etag, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(object.size, 5);

        store
            .put_object("site", "css/a.css", b"body{}".to_vec(), ObjectMeta::default())
            .await
            .unwrap();
        assert_eq!(
            store.list_keys("site").await.unwrap(),
            vec!["css/a.css".to_string(), "index.html".to_string()]
        );
        assert!(store.list_keys("other").await.unwrap().is_empty());

        assert!(store.delete_object("site", "css/a.css").await.unwrap());
        assert!(!store.delete_object("site", "css/a.css").await.unwrap());
        assert_eq!(store.object_count("site"), 1);
    }

    #[tokio::test]
    async fn test_in_memory_rejects_bad_keys() {
        let store = InMemoryContentStore::new();
        for key in ["", "../etc/passwd", "a//b", "a\\b"] {
            let err = store
                .put_object("site", key, Vec::new(), ObjectMeta::default())
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::InvalidKey(_)), "{key}");
        }
    }

    #[tokio::test]
    async fn test_directory_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryContentStore::new(dir.path());

        store
            .put_object("site", "blog/post.html", b"<p>post</p>".to_vec(), html_meta())
            .await
            .unwrap();
        store
            .put_object("site", "index.html", b"<p>home</p>".to_vec(), html_meta())
            .await
            .unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("site/blog/post.html")).unwrap(),
            b"<p>post</p>"
        );
        assert_eq!(
            store.list_keys("site").await.unwrap(),
            vec!["blog/post.html".to_string(), "index.html".to_string()]
        );

        let head = store.head_object("site", "index.html").await.unwrap();
        assert_eq!(head.meta, html_meta());
        assert_eq!(head.etag, etag(b"<p>home</p>"));

        assert!(store.delete_object("site", "index.html").await.unwrap());
        assert!(matches!(
            store.head_object("site", "index.html").await.unwrap_err(),
            StoreError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_directory_store_reserves_meta_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryContentStore::new(dir.path());
        let err = store
            .put_object("site", ".meta/x.json", Vec::new(), ObjectMeta::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn test_directory_store_missing_target_lists_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryContentStore::new(dir.path());
        assert!(store.list_keys("nothing").await.unwrap().is_empty());
    }
}
