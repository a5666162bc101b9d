//! Run state, stage kind and invocation status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The named stages of the fixed pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Turns a source snapshot into generated site content.
    Generate,
    /// Writes generated content to the content store.
    Sync,
}

impl StageKind {
    /// All stages in pipeline order.
    pub const ALL: [Self; 2] = [Self::Generate, Self::Sync];

    /// The run state while this stage is in flight.
    #[must_use]
    pub fn active_state(self) -> RunState {
        match self {
            Self::Generate => RunState::Generating,
            Self::Sync => RunState::Syncing,
        }
    }

    /// The run state when this stage exhausts its attempts.
    #[must_use]
    pub fn failed_state(self) -> RunState {
        match self {
            Self::Generate => RunState::GenerateFailed,
            Self::Sync => RunState::SyncFailed,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generate => write!(f, "generate"),
            Self::Sync => write!(f, "sync"),
        }
    }
}

/// Lifecycle state of a run.
///
/// ```text
/// PENDING -> GENERATING -> SYNCING -> SUCCEEDED
///               |            |
///               v            v
///        GENERATE_FAILED  SYNC_FAILED
///
/// any non-terminal state -> SUPERSEDED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    /// Accepted, waiting for the branch slot.
    #[default]
    Pending,
    /// The generate stage is in flight.
    Generating,
    /// The sync stage is in flight.
    Syncing,
    /// Content published.
    Succeeded,
    /// Generate exhausted its attempts or failed permanently.
    GenerateFailed,
    /// Sync exhausted its attempts or failed permanently.
    SyncFailed,
    /// A newer run on the same branch took precedence.
    Superseded,
}

impl RunState {
    /// Returns true if no further transitions are possible.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::GenerateFailed | Self::SyncFailed | Self::Superseded
        )
    }

    /// Returns true while a stage invocation is in flight.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Generating | Self::Syncing)
    }

    /// Returns true for the two failure states.
    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(self, Self::GenerateFailed | Self::SyncFailed)
    }

    /// Returns true if `next` is a legal successor of this state.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Pending, Self::Generating)
            | (Self::Generating, Self::Syncing | Self::GenerateFailed)
            | (Self::Syncing, Self::Succeeded | Self::SyncFailed) => true,
            (from, Self::Superseded) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Generating => write!(f, "GENERATING"),
            Self::Syncing => write!(f, "SYNCING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::GenerateFailed => write!(f, "GENERATE_FAILED"),
            Self::SyncFailed => write!(f, "SYNC_FAILED"),
            Self::Superseded => write!(f, "SUPERSEDED"),
        }
    }
}

/// Status of a single stage invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    /// Attempts are in progress.
    #[default]
    Running,
    /// An attempt produced an output artifact.
    Succeeded,
    /// Attempts exhausted or a permanent error was reported.
    Failed,
}

impl fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
