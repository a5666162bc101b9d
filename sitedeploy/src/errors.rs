//! Error types for the deployment pipeline.
//!
//! Stage failures are classified as transient (retried up to the stage's
//! attempt budget) or permanent (fail the run immediately). Configuration
//! errors are rejected at the watcher and never reach the orchestrator.

use crate::core::RunId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The main error type for sitedeploy operations.
#[derive(Debug, Error)]
pub enum DeployError {
    /// A stage reported a failure.
    #[error("{0}")]
    Stage(#[from] StageError),

    /// An artifact or content store operation failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Invalid configuration or an untracked branch.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// A notification could not be delivered.
    #[error("{0}")]
    Notify(#[from] NotifyError),

    /// The run was superseded by a newer run on the same branch.
    ///
    /// Not a failure: recorded so callers waiting on a run can tell why it
    /// never published.
    #[error("Run {run_id} superseded{}", .by.as_ref().map(|b| format!(" by {b}")).unwrap_or_default())]
    Superseded {
        /// The superseded run.
        run_id: RunId,
        /// The run that took precedence, if known.
        by: Option<RunId>,
    },

    /// No run with this id is known to the orchestrator.
    #[error("Unknown run: {0}")]
    UnknownRun(RunId),

    /// The orchestrator is shutting down and no longer accepts work.
    #[error("Orchestrator is shut down")]
    Shutdown,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error.
    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = DeployError> = std::result::Result<T, E>;

/// Classification of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageErrorKind {
    /// The transform did not report within its timeout.
    Timeout,
    /// A collaborator (store, repository) was temporarily unavailable.
    Unavailable,
    /// The input was malformed (bad source content, corrupt artifact).
    InvalidInput,
    /// The transform ran and reported failure.
    TransformFailed,
    /// The transform panicked.
    Crashed,
}

impl StageErrorKind {
    /// Returns true if a failure of this kind may succeed on retry.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Timeout | Self::Unavailable)
    }
}

impl fmt::Display for StageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::Unavailable => write!(f, "unavailable"),
            Self::InvalidInput => write!(f, "invalid_input"),
            Self::TransformFailed => write!(f, "transform_failed"),
            Self::Crashed => write!(f, "crashed"),
        }
    }
}

/// A failure reported by (or on behalf of) a stage transform.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct StageError {
    /// What went wrong.
    pub kind: StageErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl StageError {
    /// Creates a new stage error.
    #[must_use]
    pub fn new(kind: StageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// A transient collaborator failure.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::Unavailable, message)
    }

    /// A permanent transform failure.
    #[must_use]
    pub fn transform_failed(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::TransformFailed, message)
    }

    /// Malformed input.
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::InvalidInput, message)
    }

    /// The transform exceeded its timeout.
    #[must_use]
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::new(
            StageErrorKind::Timeout,
            format!("no report within {timeout_ms}ms"),
        )
    }

    /// The transform panicked.
    #[must_use]
    pub fn crashed(message: impl Into<String>) -> Self {
        Self::new(StageErrorKind::Crashed, message)
    }

    /// Returns true if the failure is worth retrying.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl From<std::io::Error> for StageError {
    fn from(err: std::io::Error) -> Self {
        Self::unavailable(format!("io: {err}"))
    }
}

/// Errors from the artifact store and content store adapters.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No object under this key.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Artifacts are immutable; the id is already taken.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The backing store is temporarily unreachable.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The key is not a safe relative path.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// A stored record could not be decoded.
    #[error("Corrupt record {key}: {reason}")]
    Corrupt {
        /// The key of the record.
        key: String,
        /// Why it could not be decoded.
        reason: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for StageError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(_) | StoreError::Io(_) => Self::unavailable(err.to_string()),
            StoreError::NotFound(_) | StoreError::InvalidKey(_) | StoreError::Corrupt { .. } => {
                Self::invalid_input(err.to_string())
            }
            StoreError::AlreadyExists(_) => Self::transform_failed(err.to_string()),
        }
    }
}

/// Configuration problems, including events for untracked branches.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    /// The branch does not match any tracked pattern.
    #[error("Branch '{0}' is not tracked")]
    UntrackedBranch(String),

    /// A tracked-branch pattern is not a valid regex.
    #[error("Invalid branch pattern '{pattern}': {reason}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// The regex error.
        reason: String,
    },

    /// A configuration value is out of range or inconsistent.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// A notification delivery failure for a single subscriber.
#[derive(Debug, Clone, Error)]
#[error("Delivery to '{subscriber}' failed: {reason}")]
pub struct NotifyError {
    /// The subscriber name.
    pub subscriber: String,
    /// The failure reason.
    pub reason: String,
}

impl NotifyError {
    /// Creates a new notify error.
    #[must_use]
    pub fn new(subscriber: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            subscriber: subscriber.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StageErrorKind::Timeout.is_transient());
        assert!(StageErrorKind::Unavailable.is_transient());
        assert!(!StageErrorKind::InvalidInput.is_transient());
        assert!(!StageErrorKind::TransformFailed.is_transient());
        assert!(!StageErrorKind::Crashed.is_transient());
    }

    #[test]
    fn test_stage_error_display() {
        let err = StageError::transform_failed("template error in index.md");
        assert_eq!(err.to_string(), "transform_failed: template error in index.md");
    }

    #[test]
    fn test_timeout_error() {
        let err = StageError::timeout(1500);
        assert_eq!(err.kind, StageErrorKind::Timeout);
        assert!(err.is_transient());
        assert!(err.message.contains("1500ms"));
    }

    #[test]
    fn test_store_error_into_stage_error() {
        let transient: StageError = StoreError::Unavailable("503".into()).into();
        assert!(transient.is_transient());

        let permanent: StageError = StoreError::NotFound("a/b".into()).into();
        assert_eq!(permanent.kind, StageErrorKind::InvalidInput);
    }

    #[test]
    fn test_stage_error_kind_serialize() {
        let json = serde_json::to_string(&StageErrorKind::TransformFailed).unwrap();
        assert_eq!(json, r#""transform_failed""#);
    }

    #[test]
    fn test_superseded_display() {
        let run_id = RunId::new();
        let by = RunId::new();
        let err = DeployError::Superseded {
            run_id,
            by: Some(by),
        };
        let text = err.to_string();
        assert!(text.contains(&run_id.to_string()));
        assert!(text.contains(&by.to_string()));
    }

    #[test]
    fn test_untracked_branch_display() {
        let err = ConfigurationError::UntrackedBranch("feature/x".into());
        assert_eq!(err.to_string(), "Branch 'feature/x' is not tracked");
    }
}
