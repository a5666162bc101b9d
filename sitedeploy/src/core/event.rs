//! Trigger events and activity events.

use super::{RunId, StageKind};
use crate::errors::StageErrorKind;
use crate::utils::Timestamp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A reference to an exact source snapshot: a commit on a branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceRef {
    /// The branch name.
    pub branch: String,
    /// The commit identifier.
    pub commit: String,
}

impl SourceRef {
    /// Creates a new source reference.
    #[must_use]
    pub fn new(branch: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            commit: commit.into(),
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.branch, self.commit)
    }
}

/// "Branch B advanced to commit C at time T".
///
/// Produced by the watcher, consumed exactly once by the orchestrator.
/// `sequence` is assigned by the watcher and is strictly increasing per
/// branch, so the orchestrator can refuse anything older than what it has
/// already accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// The snapshot the branch now points at.
    pub source: SourceRef,
    /// When the upstream reported the change.
    pub timestamp: Timestamp,
    /// Per-branch acceptance order.
    pub sequence: u64,
}

impl TriggerEvent {
    /// Creates a new trigger event.
    #[must_use]
    pub fn new(source: SourceRef, timestamp: Timestamp, sequence: u64) -> Self {
        Self {
            source,
            timestamp,
            sequence,
        }
    }

    /// The branch this event advances.
    #[must_use]
    pub fn branch(&self) -> &str {
        &self.source.branch
    }
}

/// A human-readable activity notification.
///
/// Source activity is published independently of pipeline outcome; run
/// events carry the run id, the stage and the error kind on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActivityEvent {
    /// A commit was pushed to a tracked branch.
    CommitPushed {
        /// Where the commit landed.
        source: SourceRef,
        /// When it was reported.
        timestamp: Timestamp,
    },
    /// A tracked branch was seen for the first time.
    BranchCreated {
        /// The new branch and its first commit.
        source: SourceRef,
        /// When it was reported.
        timestamp: Timestamp,
    },
    /// A tracked branch was removed upstream.
    BranchDeleted {
        /// The deleted branch.
        branch: String,
        /// When it was reported.
        timestamp: Timestamp,
    },
    /// A run published its content.
    RunSucceeded {
        /// The run.
        run_id: RunId,
        /// The snapshot that was published.
        source: SourceRef,
    },
    /// A run was halted in favour of a newer one.
    RunSuperseded {
        /// The halted run.
        run_id: RunId,
        /// Its snapshot.
        source: SourceRef,
        /// The run that took precedence.
        superseded_by: Option<RunId>,
    },
    /// A run failed.
    RunFailed {
        /// The run.
        run_id: RunId,
        /// Its snapshot.
        source: SourceRef,
        /// The stage that failed.
        stage: StageKind,
        /// Failure classification.
        error_kind: StageErrorKind,
        /// Failure detail.
        message: String,
    },
}

impl ActivityEvent {
    /// Dotted event type name, e.g. `source.commit_pushed`.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::CommitPushed { .. } => "source.commit_pushed",
            Self::BranchCreated { .. } => "source.branch_created",
            Self::BranchDeleted { .. } => "source.branch_deleted",
            Self::RunSucceeded { .. } => "run.succeeded",
            Self::RunSuperseded { .. } => "run.superseded",
            Self::RunFailed { .. } => "run.failed",
        }
    }

    /// The branch the event concerns.
    #[must_use]
    pub fn branch(&self) -> &str {
        match self {
            Self::BranchDeleted { branch, .. } => branch,
            Self::CommitPushed { source, .. }
            | Self::BranchCreated { source, .. }
            | Self::RunSucceeded { source, .. }
            | Self::RunSuperseded { source, .. }
            | Self::RunFailed { source, .. } => &source.branch,
        }
    }

    /// Returns true for raw source activity (as opposed to run outcomes).
    #[must_use]
    pub fn is_source_activity(&self) -> bool {
        matches!(
            self,
            Self::CommitPushed { .. } | Self::BranchCreated { .. } | Self::BranchDeleted { .. }
        )
    }

    /// One-line summary suitable for a notification subject.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::CommitPushed { source, .. } => {
                format!("Commit {} pushed to {}", source.commit, source.branch)
            }
            Self::BranchCreated { source, .. } => {
                format!("Branch {} created at {}", source.branch, source.commit)
            }
            Self::BranchDeleted { branch, .. } => format!("Branch {branch} deleted"),
            Self::RunSucceeded { run_id, source } => {
                format!("Run {run_id} published {source}")
            }
            Self::RunSuperseded {
                run_id,
                source,
                superseded_by,
            } => match superseded_by {
                Some(by) => format!("Run {run_id} for {source} superseded by {by}"),
                None => format!("Run {run_id} for {source} superseded"),
            },
            Self::RunFailed {
                run_id,
                source,
                stage,
                error_kind,
                message,
            } => format!("Run {run_id} for {source} failed in {stage} ({error_kind}): {message}"),
        }
    }
}
