//! Stage trait, stage runner and the built-in generate/sync stages.
//!
//! Stages are opaque transforms: they consume one input (a source snapshot
//! reference or an earlier artifact) and produce artifact content or a
//! classified [`StageError`]. The orchestrator never looks inside them, so
//! alternative generators and syncers can be swapped in freely.

mod generate;
mod retry;
mod runner;
mod source;
mod sync;

pub use generate::{CommandGenerateStage, GeneratorCommand};
pub use retry::{BackoffStrategy, JitterStrategy, RetryPolicy, StagePolicy};
pub use runner::{AttemptOutcome, StageRunner};
pub use source::{GitSourceRepository, InMemorySourceRepository, SourceRepository};
pub use sync::{
    default_cache_rules, CacheRule, ContentSyncStage, PublishManifest, PublishedEntry, MANIFEST_FILE,
};

use crate::core::{Artifact, ArtifactContent, RunId, SourceRef, StageInputRef, StageKind};
use crate::errors::StageError;
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

/// What a stage attempt consumes.
#[derive(Debug, Clone)]
pub enum StageInput {
    /// A source snapshot reference; the stage fetches the snapshot itself.
    Source(SourceRef),
    /// An artifact produced by the previous stage.
    Artifact(Arc<Artifact>),
}

impl StageInput {
    /// The reference recorded on the stage invocation.
    #[must_use]
    pub fn to_ref(&self) -> StageInputRef {
        match self {
            Self::Source(source) => StageInputRef::Source(source.clone()),
            Self::Artifact(artifact) => StageInputRef::Artifact(artifact.reference()),
        }
    }
}

/// Context handed to every stage attempt.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// The run being executed.
    pub run_id: RunId,
    /// Which stage this is.
    pub stage: StageKind,
    /// The snapshot the run deploys.
    pub source: SourceRef,
    /// 1-based attempt number.
    pub attempt: u32,
    /// The input.
    pub input: StageInput,
}

impl StageContext {
    /// Creates a context for the first attempt.
    #[must_use]
    pub fn new(run_id: RunId, stage: StageKind, source: SourceRef, input: StageInput) -> Self {
        Self {
            run_id,
            stage,
            source,
            attempt: 1,
            input,
        }
    }

    /// Returns the same context for a later attempt.
    #[must_use]
    pub fn for_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }

    /// The input artifact, for stages that require one.
    pub fn input_artifact(&self) -> Result<&Artifact, StageError> {
        match &self.input {
            StageInput::Artifact(artifact) => Ok(artifact),
            StageInput::Source(source) => Err(StageError::invalid_input(format!(
                "stage {} expects an artifact, got source {source}",
                self.stage
            ))),
        }
    }
}

/// A pipeline transform.
///
/// Implementations must be safe to invoke more than once for the same input:
/// the runner may retry after a timeout even if the earlier attempt did
/// eventually finish.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage implementation.
    fn name(&self) -> &str;

    /// Executes one attempt.
    async fn execute(&self, ctx: &StageContext) -> Result<ArtifactContent, StageError>;
}

/// A simple function-based stage.
pub struct FnStage<F>
where
    F: Fn(&StageContext) -> Result<ArtifactContent, StageError> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(&StageContext) -> Result<ArtifactContent, StageError> + Send + Sync,
{
    /// Creates a new function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(&StageContext) -> Result<ArtifactContent, StageError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(&StageContext) -> Result<ArtifactContent, StageError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> Result<ArtifactContent, StageError> {
        (self.func)(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source_ctx() -> StageContext {
        StageContext::new(
            RunId::new(),
            StageKind::Generate,
            SourceRef::new("main", "abc123"),
            StageInput::Source(SourceRef::new("main", "abc123")),
        )
    }

    #[tokio::test]
    async fn test_fn_stage() {
        let stage = FnStage::new("echo", |ctx: &StageContext| {
            Ok(ArtifactContent::new().with_file("commit.txt", ctx.source.commit.clone()))
        });

        assert_eq!(stage.name(), "echo");
        let content = stage.execute(&source_ctx()).await.unwrap();
        assert_eq!(content.get("commit.txt"), Some(&b"abc123"[..]));
    }

    #[test]
    fn test_fn_stage_error_passes_through() {
        let stage = FnStage::new("broken", |_: &StageContext| -> Result<ArtifactContent, StageError> {
            Err(StageError::invalid_input("no config.toml in source tree"))
        });

        let err = tokio_test::block_on(stage.execute(&source_ctx())).unwrap_err();
        assert!(!err.is_transient());
        assert!(err.message.contains("config.toml"));
    }

    #[test]
    fn test_input_artifact_rejects_source_input() {
        let err = source_ctx().input_artifact().unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_for_attempt_keeps_input() {
        let ctx = source_ctx();
        let third = ctx.for_attempt(3);
        assert_eq!(third.attempt, 3);
        assert_eq!(third.run_id, ctx.run_id);
        assert_eq!(third.input.to_ref(), ctx.input.to_ref());
    }
}
