//! Core domain model for the deployment pipeline.
//!
//! This module contains the fundamental types used throughout the crate:
//! - Run and stage-invocation records with their state machine
//! - Immutable artifacts and their content
//! - Trigger events and activity events

mod artifact;
mod event;
mod run;
mod status;

pub use artifact::{Artifact, ArtifactContent, ArtifactId, ArtifactRef};
pub use event::{ActivityEvent, SourceRef, TriggerEvent};
pub use run::{InvalidTransition, Run, RunId, StageInputRef, StageInvocation};
pub use status::{InvocationStatus, RunState, StageKind};
