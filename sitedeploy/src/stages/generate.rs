//! Generate stage backed by an external site generator command.

use super::source::spawn_error;
use super::{SourceRepository, Stage, StageContext, StageInput};
use crate::core::ArtifactContent;
use crate::errors::StageError;
use crate::utils::files;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

const SOURCE_PLACEHOLDER: &str = "{source}";
const DESTINATION_PLACEHOLDER: &str = "{destination}";

/// The generator program and its argument template.
///
/// `{source}` and `{destination}` in any argument are replaced with the
/// snapshot directory and the output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorCommand {
    /// Program to run.
    #[serde(default = "default_program")]
    pub command: String,
    /// Argument template.
    #[serde(default = "default_args")]
    pub args: Vec<String>,
}

fn default_program() -> String {
    "hugo".to_string()
}

fn default_args() -> Vec<String> {
    ["--source", SOURCE_PLACEHOLDER, "--destination", DESTINATION_PLACEHOLDER]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for GeneratorCommand {
    fn default() -> Self {
        Self {
            command: default_program(),
            args: default_args(),
        }
    }
}

impl GeneratorCommand {
    /// Creates a command with explicit arguments.
    #[must_use]
    pub fn new(command: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Expands the argument template.
    #[must_use]
    pub fn render_args(&self, source: &Path, destination: &Path) -> Vec<String> {
        let source = source.to_string_lossy();
        let destination = destination.to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace(SOURCE_PLACEHOLDER, &source)
                    .replace(DESTINATION_PLACEHOLDER, &destination)
            })
            .collect()
    }
}

/// Materializes the snapshot, runs the generator and collects its output.
///
/// Every attempt works in a fresh temporary directory, so retries never see
/// leftovers from an earlier attempt.
#[derive(Debug, Clone)]
pub struct CommandGenerateStage {
    repository: Arc<dyn SourceRepository>,
    command: GeneratorCommand,
}

impl CommandGenerateStage {
    /// Creates a generate stage.
    pub fn new(repository: Arc<dyn SourceRepository>, command: GeneratorCommand) -> Self {
        Self {
            repository,
            command,
        }
    }

    async fn run_generator(&self, source: &Path, destination: &Path) -> Result<(), StageError> {
        let args = self.command.render_args(source, destination);
        debug!(command = %self.command.command, ?args, "Running generator");

        let output = Command::new(&self.command.command)
            .args(&args)
            .current_dir(source)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| spawn_error(&self.command.command, &e))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(StageError::transform_failed(format!(
            "generator exited with {}: {}",
            output.status,
            last_lines(&stderr, 20)
        )))
    }
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

#[async_trait]
impl Stage for CommandGenerateStage {
    fn name(&self) -> &str {
        &self.command.command
    }

    async fn execute(&self, ctx: &StageContext) -> Result<ArtifactContent, StageError> {
        let source = match &ctx.input {
            StageInput::Source(source) => source,
            StageInput::Artifact(artifact) => {
                return Err(StageError::invalid_input(format!(
                    "generate expects a source reference, got artifact {}",
                    artifact.id
                )))
            }
        };

        let workdir = tempfile::tempdir()?;
        let source_dir = workdir.path().join("source");
        let output_dir = workdir.path().join("output");
        tokio::fs::create_dir_all(&source_dir).await?;
        tokio::fs::create_dir_all(&output_dir).await?;

        self.repository.materialize(source, &source_dir).await?;
        self.run_generator(&source_dir, &output_dir).await?;

        let content = tokio::task::spawn_blocking(move || files::read_tree(&output_dir))
            .await
            .map_err(|e| StageError::crashed(e.to_string()))??;
        if content.is_empty() {
            return Err(StageError::transform_failed("generator produced no files"));
        }

        info!(
            run_id = %ctx.run_id,
            source = %source,
            files = content.len(),
            bytes = content.total_bytes(),
            "Generated site"
        );
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Artifact, RunId, SourceRef, StageKind};
    use crate::errors::StageErrorKind;
    use crate::stages::InMemorySourceRepository;
    use pretty_assertions::assert_eq;

    fn repo() -> Arc<dyn SourceRepository> {
        Arc::new(
            InMemorySourceRepository::new()
                .with_snapshot("abc123", ArtifactContent::new().with_file("index.html", "<h1>home</h1>")),
        )
    }

    fn ctx(commit: &str) -> StageContext {
        let source = SourceRef::new("main", commit);
        StageContext::new(
            RunId::new(),
            StageKind::Generate,
            source.clone(),
            StageInput::Source(source),
        )
    }

    #[test]
    fn test_default_command_matches_hugo() {
        let cmd = GeneratorCommand::default();
        assert_eq!(
            cmd.render_args(Path::new("/src"), Path::new("/out")),
            vec!["--source", "/src", "--destination", "/out"]
        );
    }

    #[test]
    fn test_last_lines() {
        assert_eq!(last_lines("a\nb\nc\n", 2), "b\nc");
        assert_eq!(last_lines("", 2), "");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_copy_generator_collects_output() {
        let stage = CommandGenerateStage::new(
            repo(),
            GeneratorCommand::new("sh", ["-c", "cp -R {source}/. {destination}/"]),
        );
        let content = stage.execute(&ctx("abc123")).await.unwrap();
        assert_eq!(content.get("index.html"), Some(&b"<h1>home</h1>"[..]));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_generator_is_permanent() {
        let stage = CommandGenerateStage::new(
            repo(),
            GeneratorCommand::new("sh", ["-c", "echo broken template >&2; exit 3"]),
        );
        let err = stage.execute(&ctx("abc123")).await.unwrap_err();
        assert_eq!(err.kind, StageErrorKind::TransformFailed);
        assert!(err.message.contains("broken template"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_empty_output_is_permanent() {
        let stage = CommandGenerateStage::new(repo(), GeneratorCommand::new("true", Vec::<String>::new()));
        let err = stage.execute(&ctx("abc123")).await.unwrap_err();
        assert_eq!(err.kind, StageErrorKind::TransformFailed);
    }

    #[tokio::test]
    async fn test_missing_binary_is_permanent() {
        let stage = CommandGenerateStage::new(
            repo(),
            GeneratorCommand::new("sitedeploy-no-such-generator", Vec::<String>::new()),
        );
        let err = stage.execute(&ctx("abc123")).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_unknown_commit_fails_before_generator() {
        let stage = CommandGenerateStage::new(repo(), GeneratorCommand::default());
        let err = stage.execute(&ctx("bad000")).await.unwrap_err();
        assert_eq!(err.kind, StageErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_rejects_artifact_input() {
        let stage = CommandGenerateStage::new(repo(), GeneratorCommand::default());
        let artifact = Artifact::new(
            StageKind::Generate,
            RunId::new(),
            SourceRef::new("main", "abc123"),
            ArtifactContent::new(),
        );
        let mut ctx = ctx("abc123");
        ctx.input = StageInput::Artifact(Arc::new(artifact));
        let err = stage.execute(&ctx).await.unwrap_err();
        assert_eq!(err.kind, StageErrorKind::InvalidInput);
    }
}
