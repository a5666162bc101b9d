//! Run and stage-invocation records.

use super::{ArtifactRef, InvocationStatus, RunState, SourceRef, StageKind, TriggerEvent};
use crate::errors::StageError;
use crate::utils::{generate_uuid_v7, now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Identifier of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
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

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a stage invocation consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageInputRef {
    /// A source snapshot, fetched by the stage itself.
    Source(SourceRef),
    /// An artifact produced by an earlier stage.
    Artifact(ArtifactRef),
}

/// One attempt-series of a named stage within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageInvocation {
    /// The stage.
    pub stage: StageKind,
    /// The input handed to every attempt.
    pub input: StageInputRef,
    /// Set once an attempt succeeds.
    pub output: Option<ArtifactRef>,
    /// Attempts made so far.
    pub attempts: u32,
    /// Current status.
    pub status: InvocationStatus,
    /// The last error reported, if any.
    pub error: Option<StageError>,
    /// When the first attempt started.
    pub started_at: Timestamp,
    /// When the invocation finished.
    pub ended_at: Option<Timestamp>,
    /// Wall time spent inside the transform across all attempts.
    pub busy_ms: u64,
}

impl StageInvocation {
    /// Starts a new invocation record.
    #[must_use]
    pub fn new(stage: StageKind, input: StageInputRef) -> Self {
        Self {
            stage,
            input,
            output: None,
            attempts: 0,
            status: InvocationStatus::Running,
            error: None,
            started_at: now_utc(),
            ended_at: None,
            busy_ms: 0,
        }
    }

    /// Records an attempt that failed.
    pub fn record_failure(&mut self, error: StageError, elapsed_ms: u64) {
        self.attempts += 1;
        self.busy_ms += elapsed_ms;
        self.error = Some(error);
    }

    /// Records the successful attempt and closes the invocation.
    pub fn succeed(&mut self, output: ArtifactRef, elapsed_ms: u64) {
        self.attempts += 1;
        self.busy_ms += elapsed_ms;
        self.output = Some(output);
        self.status = InvocationStatus::Succeeded;
        self.ended_at = Some(now_utc());
    }

    /// Closes the invocation as failed, keeping the last recorded error.
    pub fn fail(&mut self) {
        self.status = InvocationStatus::Failed;
        self.ended_at = Some(now_utc());
    }
}

/// An illegal state change was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid run transition {from} -> {to}")]
pub struct InvalidTransition {
    /// Current state.
    pub from: RunState,
    /// Requested state.
    pub to: RunState,
}

/// One execution of the pipeline for a single trigger event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    /// Run id.
    pub id: RunId,
    /// The snapshot being deployed.
    pub source: SourceRef,
    /// Per-branch trigger order.
    pub sequence: u64,
    /// When the trigger event was reported.
    pub triggered_at: Timestamp,
    /// Current state.
    pub state: RunState,
    /// Stage invocations, in execution order.
    pub invocations: Vec<StageInvocation>,
    /// When the run was accepted.
    pub created_at: Timestamp,
    /// When the run claimed its branch slot.
    pub started_at: Option<Timestamp>,
    /// When the run reached a terminal state.
    pub ended_at: Option<Timestamp>,
    /// A newer run exists; halt at the next stage boundary.
    pub supersede_requested: bool,
    /// The newer run that caused supersession.
    pub superseded_by: Option<RunId>,
    /// Whether this run's output is the branch's live content.
    pub published: bool,
}

impl Run {
    /// Creates a pending run for a trigger event.
    #[must_use]
    pub fn new(trigger: &TriggerEvent) -> Self {
        Self {
            id: RunId::new(),
            source: trigger.source.clone(),
            sequence: trigger.sequence,
            triggered_at: trigger.timestamp,
            state: RunState::Pending,
            invocations: Vec::new(),
            created_at: now_utc(),
            started_at: None,
            ended_at: None,
            supersede_requested: false,
            superseded_by: None,
            published: false,
        }
    }

    /// The branch this run deploys.
    #[must_use]
    pub fn branch(&self) -> &str {
        &self.source.branch
    }

    /// Returns true once the run can no longer change state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Moves the run to `next`, stamping start/end times.
    pub fn transition(&mut self, next: RunState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        if self.state == RunState::Pending && next.is_active() {
            self.started_at = Some(now_utc());
        }
        self.state = next;
        if next.is_terminal() {
            self.ended_at = Some(now_utc());
        }
        Ok(())
    }

    /// The invocation for `stage`, if it has started.
    #[must_use]
    pub fn invocation(&self, stage: StageKind) -> Option<&StageInvocation> {
        self.invocations.iter().find(|i| i.stage == stage)
    }

    /// Mutable access to the invocation for `stage`.
    pub fn invocation_mut(&mut self, stage: StageKind) -> Option<&mut StageInvocation> {
        self.invocations.iter_mut().find(|i| i.stage == stage)
    }

    /// The output artifact recorded for `stage`.
    #[must_use]
    pub fn output_of(&self, stage: StageKind) -> Option<&ArtifactRef> {
        self.invocation(stage).and_then(|i| i.output.as_ref())
    }

    /// Every artifact this run produced.
    pub fn artifacts(&self) -> impl Iterator<Item = &ArtifactRef> {
        self.invocations.iter().filter_map(|i| i.output.as_ref())
    }

    /// The error that failed the run, if it failed.
    #[must_use]
    pub fn failure(&self) -> Option<(StageKind, &StageError)> {
        if !self.state.is_failure() {
            return None;
        }
        self.invocations
            .iter()
            .rev()
            .find_map(|i| i.error.as_ref().map(|e| (i.stage, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ArtifactId;
    use crate::errors::StageErrorKind;

    fn trigger() -> TriggerEvent {
        TriggerEvent::new(SourceRef::new("main", "abc123"), now_utc(), 1)
    }

    fn artifact_ref() -> ArtifactRef {
        ArtifactRef {
            id: ArtifactId::new(),
            content_hash: "00ff".into(),
        }
    }

    #[test]
    fn test_new_run_is_pending() {
        let run = Run::new(&trigger());
        assert_eq!(run.state, RunState::Pending);
        assert_eq!(run.branch(), "main");
        assert!(run.started_at.is_none());
        assert!(!run.is_terminal());
    }

    #[test]
    fn test_transition_stamps_times() {
        let mut run = Run::new(&trigger());
        run.transition(RunState::Generating).unwrap();
        assert!(run.started_at.is_some());
        assert!(run.ended_at.is_none());

        run.transition(RunState::Syncing).unwrap();
        run.transition(RunState::Succeeded).unwrap();
        assert!(run.ended_at.is_some());
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut run = Run::new(&trigger());
        let err = run.transition(RunState::Succeeded).unwrap_err();
        assert_eq!(err.from, RunState::Pending);
        assert_eq!(err.to, RunState::Succeeded);
        assert_eq!(run.state, RunState::Pending);
    }

    #[test]
    fn test_invocation_bookkeeping() {
        let mut inv = StageInvocation::new(
            StageKind::Sync,
            StageInputRef::Artifact(artifact_ref()),
        );
        inv.record_failure(StageError::unavailable("503"), 10);
        assert_eq!(inv.attempts, 1);
        assert_eq!(inv.status, InvocationStatus::Running);

        let out = artifact_ref();
        inv.succeed(out.clone(), 5);
        assert_eq!(inv.attempts, 2);
        assert_eq!(inv.busy_ms, 15);
        assert_eq!(inv.output, Some(out));
        assert_eq!(inv.status, InvocationStatus::Succeeded);
    }

    #[test]
    fn test_failure_reports_stage_and_error() {
        let mut run = Run::new(&trigger());
        run.transition(RunState::Generating).unwrap();
        let mut inv = StageInvocation::new(
            StageKind::Generate,
            StageInputRef::Source(run.source.clone()),
        );
        inv.record_failure(StageError::transform_failed("bad template"), 3);
        inv.fail();
        run.invocations.push(inv);
        run.transition(RunState::GenerateFailed).unwrap();

        let (stage, err) = run.failure().unwrap();
        assert_eq!(stage, StageKind::Generate);
        assert_eq!(err.kind, StageErrorKind::TransformFailed);
    }
}
