//! Deployment configuration, loaded from TOML.
//!
//! Every section and field has a default, so an empty file is a valid
//! configuration that deploys `main` with `hugo`.
//!
//! ```toml
//! [watch]
//! tracked_branches = ["main", "release/.*"]
//!
//! [generate]
//! max_attempts = 1
//! timeout_seconds = 600
//!
//! [sync]
//! target = "www.example.com"
//! max_attempts = 3
//! retry = { base_delay_ms = 500, backoff = "exponential" }
//! ```

use crate::errors::{ConfigurationError, Result};
use crate::observability::LoggingConfig;
use crate::stages::{default_cache_rules, CacheRule, GeneratorCommand, RetryPolicy, StagePolicy};
use crate::watcher::compile_branch_patterns;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Which branches deploy and how change notifications are deduplicated.
    #[serde(default)]
    pub watch: WatchConfig,
    /// Generate stage policy.
    #[serde(default)]
    pub generate: GenerateConfig,
    /// The generator command.
    #[serde(default)]
    pub generator: GeneratorCommand,
    /// Sync stage policy and publishing options.
    #[serde(default)]
    pub sync: SyncConfig,
    /// Run and artifact retention.
    #[serde(default)]
    pub retention: RetentionConfig,
    /// Activity notification subscribers.
    #[serde(default)]
    pub notify: NotifyConfig,
    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl DeployConfig {
    /// Parses a TOML document. Does not validate.
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Reads and parses a TOML file. Does not validate.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load_and_validate(path: impl AsRef<Path>) -> Result<Self> {
        let config = Self::load_from_path(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the tracked branch patterns.
    #[must_use]
    pub fn with_tracked_branches(mut self, patterns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.watch.tracked_branches = patterns.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the sync target.
    #[must_use]
    pub fn with_sync_target(mut self, target: impl Into<String>) -> Self {
        self.sync.target = target.into();
        self
    }

    /// Checks the semantic constraints serde cannot express.
    pub fn validate(&self) -> std::result::Result<(), ConfigurationError> {
        compile_branch_patterns(&self.watch.tracked_branches)?;
        if self.watch.tracked_branches.is_empty() {
            return Err(invalid("watch.tracked_branches must not be empty"));
        }
        if self.watch.dedup_window == 0 {
            return Err(invalid("watch.dedup_window must be at least 1"));
        }
        check_stage("generate", self.generate.max_attempts, self.generate.timeout_seconds)?;
        check_stage("sync", self.sync.max_attempts, self.sync.timeout_seconds)?;
        if self.generator.command.trim().is_empty() {
            return Err(invalid("generator.command must not be empty"));
        }
        if self.sync.target.trim().is_empty() {
            return Err(invalid("sync.target must not be empty"));
        }
        if let Some(rule) = self.sync.cache_rules.iter().find(|r| r.cache_control.trim().is_empty()) {
            return Err(invalid(format!(
                "sync.cache_rules entry for {:?} has an empty cache_control",
                rule.extensions
            )));
        }
        if self.retention.keep_runs_per_branch == 0 {
            return Err(invalid("retention.keep_runs_per_branch must be at least 1"));
        }
        if let Some(url) = self
            .notify
            .webhooks
            .iter()
            .find(|u| !(u.starts_with("http://") || u.starts_with("https://")))
        {
            return Err(invalid(format!("notify.webhooks entry {url:?} is not an http(s) URL")));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigurationError {
    ConfigurationError::Invalid(message.into())
}

fn check_stage(section: &str, max_attempts: u32, timeout_seconds: u64) -> std::result::Result<(), ConfigurationError> {
    if max_attempts == 0 {
        return Err(invalid(format!("{section}.max_attempts must be at least 1")));
    }
    if timeout_seconds == 0 {
        return Err(invalid(format!("{section}.timeout_seconds must be at least 1")));
    }
    Ok(())
}

/// `[watch]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Branch name patterns (regular expressions, matched against the whole
    /// name).
    #[serde(default = "default_tracked_branches")]
    pub tracked_branches: Vec<String>,
    /// How many recent commits per branch are remembered for deduplication.
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
}

fn default_tracked_branches() -> Vec<String> {
    vec!["main".to_string()]
}

fn default_dedup_window() -> usize {
    1024
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            tracked_branches: default_tracked_branches(),
            dedup_window: default_dedup_window(),
        }
    }
}

/// `[generate]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateConfig {
    /// Attempts including the first.
    #[serde(default = "default_generate_attempts")]
    pub max_attempts: u32,
    /// Per-attempt timeout.
    #[serde(default = "default_generate_timeout")]
    pub timeout_seconds: u64,
    /// Delay between attempts.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_generate_attempts() -> u32 {
    1
}

fn default_generate_timeout() -> u64 {
    600
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_generate_attempts(),
            timeout_seconds: default_generate_timeout(),
            retry: RetryPolicy::default(),
        }
    }
}

impl GenerateConfig {
    /// The runtime policy.
    #[must_use]
    pub fn policy(&self) -> StagePolicy {
        StagePolicy::new(self.max_attempts, Duration::from_secs(self.timeout_seconds))
            .with_retry(self.retry.clone())
    }
}

/// `[sync]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Attempts including the first.
    #[serde(default = "default_sync_attempts")]
    pub max_attempts: u32,
    /// Per-attempt timeout.
    #[serde(default = "default_sync_timeout")]
    pub timeout_seconds: u64,
    /// Delay between attempts.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Content store target (bucket or prefix).
    #[serde(default = "default_target")]
    pub target: String,
    /// Remove objects the new site no longer contains.
    #[serde(default)]
    pub delete_removed: bool,
    /// Header rules, first match wins.
    #[serde(default = "default_cache_rules")]
    pub cache_rules: Vec<CacheRule>,
}

fn default_sync_attempts() -> u32 {
    3
}

fn default_sync_timeout() -> u64 {
    300
}

fn default_target() -> String {
    "site".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_sync_attempts(),
            timeout_seconds: default_sync_timeout(),
            retry: RetryPolicy::default(),
            target: default_target(),
            delete_removed: false,
            cache_rules: default_cache_rules(),
        }
    }
}

impl SyncConfig {
    /// The runtime policy.
    #[must_use]
    pub fn policy(&self) -> StagePolicy {
        StagePolicy::new(self.max_attempts, Duration::from_secs(self.timeout_seconds))
            .with_retry(self.retry.clone())
    }
}

/// `[retention]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Terminal runs kept per branch; older ones are archived.
    #[serde(default = "default_keep_runs")]
    pub keep_runs_per_branch: usize,
    /// Unreferenced artifacts younger than this are never collected.
    #[serde(default = "default_artifact_min_age")]
    pub artifact_min_age_seconds: u64,
}

fn default_keep_runs() -> usize {
    20
}

fn default_artifact_min_age() -> u64 {
    3600
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_runs_per_branch: default_keep_runs(),
            artifact_min_age_seconds: default_artifact_min_age(),
        }
    }
}

impl RetentionConfig {
    /// Minimum artifact age as a duration.
    #[must_use]
    pub fn artifact_min_age(&self) -> Duration {
        Duration::from_secs(self.artifact_min_age_seconds)
    }
}

/// `[notify]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Webhook endpoints (requires the `webhook` feature).
    #[serde(default)]
    pub webhooks: Vec<String>,
    /// Also write every activity event to the log.
    #[serde(default = "default_log_events")]
    pub log_events: bool,
}

fn default_log_events() -> bool {
    true
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhooks: Vec::new(),
            log_events: default_log_events(),
        }
    }
}

/// `sitedeploy.toml` in the working directory.
#[must_use]
pub fn default_config_path() -> PathBuf {
    PathBuf::from("sitedeploy.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::DeployError;
    use crate::observability::LogFormat;
    use crate::stages::BackoffStrategy;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = DeployConfig::from_toml_str("").unwrap();
        assert_eq!(config, DeployConfig::default());
        assert_eq!(config.watch.tracked_branches, vec!["main"]);
        assert_eq!(config.generate.max_attempts, 1);
        assert_eq!(config.sync.max_attempts, 3);
        assert_eq!(config.generator.command, "hugo");
        assert_eq!(config.sync.cache_rules.len(), 7);
        config.validate().unwrap();
    }

    #[test]
    fn test_full_document() {
        let config = DeployConfig::from_toml_str(
            r#"
            [watch]
            tracked_branches = ["main", "release/.*"]
            dedup_window = 16

            [generate]
            max_attempts = 2
            timeout_seconds = 120

            [generator]
            command = "zola"
            args = ["build", "--output-dir", "{destination}"]

            [sync]
            target = "www.example.com"
            delete_removed = true
            retry = { base_delay_ms = 500, backoff = "linear" }

            [[sync.cache_rules]]
            extensions = ["html"]
            content_type = "text/html"
            cache_control = "no-cache"

            [[sync.cache_rules]]
            cache_control = "max-age=60"

            [retention]
            keep_runs_per_branch = 5

            [notify]
            webhooks = ["https://hooks.example.com/deploy"]
            log_events = false

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.watch.dedup_window, 16);
        assert_eq!(config.generate.policy().timeout, Duration::from_secs(120));
        assert_eq!(config.generator.args[2], "{destination}");
        assert_eq!(config.sync.policy().max_attempts, 3);
        assert_eq!(config.sync.retry.base_delay_ms, 500);
        assert_eq!(config.sync.retry.backoff, BackoffStrategy::Linear);
        assert_eq!(config.sync.cache_rules.len(), 2);
        assert!(config.sync.cache_rules[1].extensions.is_empty());
        assert_eq!(config.retention.artifact_min_age_seconds, 3600);
        assert!(!config.notify.log_events);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = DeployConfig::default();
        config.sync.max_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigurationError::Invalid(msg)) if msg.contains("sync.max_attempts")));
    }

    #[test]
    fn test_validate_rejects_bad_pattern() {
        let config = DeployConfig::default().with_tracked_branches(["feature/("]);
        assert!(matches!(
            config.validate(),
            Err(ConfigurationError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_empty_branch_list() {
        let config = DeployConfig::default().with_tracked_branches(Vec::<String>::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_http_webhook() {
        let mut config = DeployConfig::default();
        config.notify.webhooks.push("mailto:ops@example.com".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_toml_is_an_error() {
        let err = DeployConfig::from_toml_str("[watch\n").unwrap_err();
        assert!(matches!(err, DeployError::Toml(_)));
    }

    #[test]
    fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sitedeploy.toml");
        std::fs::write(&path, "[sync]\ntarget = \"preview\"\n").unwrap();

        let config = DeployConfig::load_and_validate(&path).unwrap();
        assert_eq!(config.sync.target, "preview");

        assert!(matches!(
            DeployConfig::load_from_path(dir.path().join("missing.toml")),
            Err(DeployError::Io(_))
        ));
    }
}
