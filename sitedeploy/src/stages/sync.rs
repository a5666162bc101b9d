//! Sync stage: publishes a generated site into the content store.

use super::{Stage, StageContext};
use crate::core::ArtifactContent;
use crate::errors::{StageError, StoreError};
use crate::store::{etag, ContentStore, ObjectMeta};
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// File name of the manifest inside the sync output artifact.
pub const MANIFEST_FILE: &str = "publish-manifest.json";

const DEFAULT_UPLOAD_CONCURRENCY: usize = 8;

/// Maps file extensions to response headers.
///
/// A rule with no extensions matches every key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRule {
    /// Lower-case extensions without the dot.
    #[serde(default)]
    pub extensions: Vec<String>,
    /// `Content-Type` to set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// `Cache-Control` to set.
    pub cache_control: String,
}

impl CacheRule {
    /// Creates a rule.
    #[must_use]
    pub fn new(extensions: &[&str], content_type: Option<&str>, cache_control: &str) -> Self {
        Self {
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
            content_type: content_type.map(str::to_string),
            cache_control: cache_control.to_string(),
        }
    }

    /// Returns true if the rule applies to `key`.
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        let file = key.rsplit('/').next().unwrap_or(key);
        match file.rsplit_once('.') {
            Some((_, ext)) => {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|e| *e == ext)
            }
            None => false,
        }
    }

    fn meta(&self) -> ObjectMeta {
        ObjectMeta {
            content_type: self.content_type.clone(),
            cache_control: Some(self.cache_control.clone()),
        }
    }
}

/// Long-lived assets are cached for 90 days, pages for 10 minutes, feeds
/// for 4 hours, anything else for 2 hours.
#[must_use]
pub fn default_cache_rules() -> Vec<CacheRule> {
    const NINETY_DAYS: &str = "max-age=7776000";
    vec![
        CacheRule::new(&["js"], Some("application/javascript"), NINETY_DAYS),
        CacheRule::new(&["css"], Some("text/css"), NINETY_DAYS),
        CacheRule::new(&["html"], Some("text/html"), "max-age=600"),
        CacheRule::new(&["xml"], Some("text/xml"), "max-age=14400"),
        CacheRule::new(&["png", "jpg", "jpeg"], None, NINETY_DAYS),
        CacheRule::new(&["otf", "eot", "svg", "ttf", "woff", "woff2"], None, NINETY_DAYS),
        CacheRule::new(&[], None, "max-age=7200"),
    ]
}

/// One published object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedEntry {
    /// Object key.
    pub key: String,
    /// Size in bytes.
    pub size: usize,
    /// Hex MD5 of the body.
    pub etag: String,
    /// Headers the object was published with.
    pub meta: ObjectMeta,
}

/// Record of what a sync published; the sync stage's output artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishManifest {
    /// Content store target.
    pub target: String,
    /// Published objects, sorted by key.
    pub entries: Vec<PublishedEntry>,
    /// Keys removed from the target, sorted.
    #[serde(default)]
    pub removed: Vec<String>,
}

impl PublishManifest {
    /// Reads the manifest back out of a sync artifact.
    pub fn from_content(content: &ArtifactContent) -> Result<Self, StageError> {
        let body = content
            .get(MANIFEST_FILE)
            .ok_or_else(|| StageError::invalid_input(format!("artifact has no {MANIFEST_FILE}")))?;
        serde_json::from_slice(body).map_err(|e| StageError::invalid_input(e.to_string()))
    }

    fn into_content(self) -> Result<ArtifactContent, StageError> {
        let body = serde_json::to_vec_pretty(&self)
            .map_err(|e| StageError::transform_failed(e.to_string()))?;
        Ok(ArtifactContent::new().with_file(MANIFEST_FILE, body))
    }
}

/// Publishes every file of the input artifact to a content store target.
///
/// Objects whose ETag and headers already match are left alone. Keys that
/// the artifact no longer contains are only removed with `delete_removed`.
/// Publishing the same artifact twice yields the same manifest, so a retried
/// attempt is harmless.
#[derive(Debug, Clone)]
pub struct ContentSyncStage {
    store: Arc<dyn ContentStore>,
    target: String,
    rules: Vec<CacheRule>,
    delete_removed: bool,
    concurrency: usize,
}

impl ContentSyncStage {
    /// Creates a sync stage with the default cache rules.
    pub fn new(store: Arc<dyn ContentStore>, target: impl Into<String>) -> Self {
        Self {
            store,
            target: target.into(),
            rules: default_cache_rules(),
            delete_removed: false,
            concurrency: DEFAULT_UPLOAD_CONCURRENCY,
        }
    }

    /// Replaces the cache rules.
    #[must_use]
    pub fn with_rules(mut self, rules: Vec<CacheRule>) -> Self {
        self.rules = rules;
        self
    }

    /// Enables removal of keys absent from the artifact.
    #[must_use]
    pub fn with_delete_removed(mut self, delete_removed: bool) -> Self {
        self.delete_removed = delete_removed;
        self
    }

    /// Sets how many uploads run at once.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Headers for `key`, from the first matching rule.
    #[must_use]
    pub fn meta_for(&self, key: &str) -> ObjectMeta {
        self.rules
            .iter()
            .find(|rule| rule.matches(key))
            .map(CacheRule::meta)
            .unwrap_or_default()
    }

    async fn publish(&self, key: String, body: Vec<u8>) -> Result<(PublishedEntry, bool), StageError> {
        let meta = self.meta_for(&key);
        let tag = etag(&body);

        match self.store.head_object(&self.target, &key).await {
            Ok(existing) if existing.etag == tag && existing.meta == meta => {
                let entry = PublishedEntry {
                    size: body.len(),
                    key,
                    etag: tag,
                    meta,
                };
                return Ok((entry, false));
            }
            Ok(_) | Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let stored = self.store.put_object(&self.target, &key, body, meta).await?;
        let entry = PublishedEntry {
            key: stored.key,
            size: stored.size,
            etag: stored.etag,
            meta: stored.meta,
        };
        Ok((entry, true))
    }
}

#[async_trait]
impl Stage for ContentSyncStage {
    fn name(&self) -> &str {
        "content-sync"
    }

    async fn execute(&self, ctx: &StageContext) -> Result<ArtifactContent, StageError> {
        let site = ctx.input_artifact()?;
        if !site.verify() {
            return Err(StageError::invalid_input(format!(
                "artifact {} does not match its content hash",
                site.id
            )));
        }

        let files: Vec<(String, Vec<u8>)> = site
            .content
            .files()
            .map(|(key, body)| (key.to_string(), body.to_vec()))
            .collect();
        let results: Vec<(PublishedEntry, bool)> = stream::iter(files)
            .map(|(key, body)| self.publish(key, body))
            .buffer_unordered(self.concurrency)
            .try_collect()
            .await?;

        let uploaded = results.iter().filter(|(_, written)| *written).count();
        let mut entries: Vec<PublishedEntry> = results.into_iter().map(|(entry, _)| entry).collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        let mut removed = Vec::new();
        if self.delete_removed {
            let keep: BTreeSet<&str> = entries.iter().map(|e| e.key.as_str()).collect();
            for key in self.store.list_keys(&self.target).await? {
                if !keep.contains(key.as_str()) && self.store.delete_object(&self.target, &key).await? {
                    debug!(run_id = %ctx.run_id, key = %key, "Removed stale object");
                    removed.push(key);
                }
            }
            removed.sort();
        }

        info!(
            run_id = %ctx.run_id,
            source = %ctx.source,
            deploy_target = %self.target,
            files = entries.len(),
            uploaded,
            unchanged = entries.len() - uploaded,
            removed = removed.len(),
            "Synced site"
        );

        PublishManifest {
            target: self.target.clone(),
            entries,
            removed,
        }
        .into_content()
    }
}
