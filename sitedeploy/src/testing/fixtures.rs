//! Test fixtures for pipeline testing.

use super::ScriptedStage;
use crate::core::{ArtifactContent, SourceRef, TriggerEvent};
use crate::notify::{CollectingSubscriber, Notifier};
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::stages::{Stage, StageContext, StageInput};
use crate::store::InMemoryArtifactStore;
use crate::utils::now_utc;
use std::sync::Arc;

/// A source reference.
#[must_use]
pub fn source(branch: &str, commit: &str) -> SourceRef {
    SourceRef::new(branch, commit)
}

/// A trigger event stamped now.
#[must_use]
pub fn trigger(branch: &str, commit: &str, sequence: u64) -> TriggerEvent {
    TriggerEvent::new(source(branch, commit), now_utc(), sequence)
}

/// A small static site.
#[must_use]
pub fn sample_site() -> ArtifactContent {
    ArtifactContent::new()
        .with_file("index.html", "<h1>Home</h1>")
        .with_file("posts/hello/index.html", "<h1>Hello</h1>")
        .with_file("css/site.css", "body { margin: 0 }")
        .with_file("index.xml", "<rss/>")
}

/// Deterministic output for a stage attempt.
///
/// From a source reference it renders a one-page site naming the snapshot;
/// from an artifact it records the input's content hash.
#[must_use]
pub fn render_output(ctx: &StageContext) -> ArtifactContent {
    match &ctx.input {
        StageInput::Source(source) => ArtifactContent::new()
            .with_file("index.html", format!("<h1>{source}</h1>"))
            .with_file("commit.txt", source.commit.clone()),
        StageInput::Artifact(artifact) => {
            ArtifactContent::new().with_file("published.txt", artifact.content_hash.clone())
        }
    }
}

/// An orchestrator wired to in-memory collaborators.
#[derive(Debug)]
pub struct TestPipeline {
    /// The orchestrator under test.
    pub orchestrator: Orchestrator,
    /// Artifact store shared with the orchestrator.
    pub artifacts: Arc<InMemoryArtifactStore>,
    /// The notifier.
    pub notifier: Arc<Notifier>,
    /// Every activity event published.
    pub events: Arc<CollectingSubscriber>,
}

impl TestPipeline {
    /// Builds a pipeline around the given stages.
    pub fn new(config: OrchestratorConfig, generate: Arc<dyn Stage>, sync: Arc<dyn Stage>) -> Self {
        let artifacts = Arc::new(InMemoryArtifactStore::new());
        let notifier = Arc::new(Notifier::new());
        let events = Arc::new(CollectingSubscriber::new());
        notifier.subscribe(events.clone());
        let orchestrator = Orchestrator::new(config, generate, sync, artifacts.clone(), notifier.clone());
        Self {
            orchestrator,
            artifacts,
            notifier,
            events,
        }
    }

    /// Builds a pipeline with two always-succeeding scripted stages.
    #[must_use]
    pub fn scripted(config: OrchestratorConfig) -> (Self, Arc<ScriptedStage>, Arc<ScriptedStage>) {
        let generate = Arc::new(ScriptedStage::new("generate"));
        let sync = Arc::new(ScriptedStage::new("sync"));
        let pipeline = Self::new(config, generate.clone(), sync.clone());
        (pipeline, generate, sync)
    }
}
