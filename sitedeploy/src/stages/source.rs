//! Source snapshot access for the generate stage.

use crate::core::{ArtifactContent, SourceRef};
use crate::errors::StageError;
use crate::utils::files;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Classifies a failure to start an external program.
///
/// A program that is missing or not executable stays that way on retry.
pub(super) fn spawn_error(program: &str, err: &std::io::Error) -> StageError {
    match err.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
            StageError::transform_failed(format!("cannot run {program}: {err}"))
        }
        _ => StageError::unavailable(format!("spawning {program}: {err}")),
    }
}

/// Materializes the tree of a commit into a directory.
#[async_trait]
pub trait SourceRepository: Send + Sync + Debug {
    /// Writes the snapshot named by `source` into `dest`, which exists and
    /// is empty.
    async fn materialize(&self, source: &SourceRef, dest: &Path) -> Result<(), StageError>;
}

/// A local git repository. Snapshots are exported with `git archive`.
#[derive(Debug, Clone)]
pub struct GitSourceRepository {
    repo: PathBuf,
    git: String,
}

impl GitSourceRepository {
    /// Uses the repository at `repo` and `git` from `PATH`.
    #[must_use]
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self {
            repo: repo.into(),
            git: "git".to_string(),
        }
    }

    /// Overrides the git binary.
    #[must_use]
    pub fn with_git_binary(mut self, git: impl Into<String>) -> Self {
        self.git = git.into();
        self
    }

    /// The repository path.
    #[must_use]
    pub fn repo(&self) -> &Path {
        &self.repo
    }
}

#[async_trait]
impl SourceRepository for GitSourceRepository {
    async fn materialize(&self, source: &SourceRef, dest: &Path) -> Result<(), StageError> {
        if source.commit.starts_with('-') {
            return Err(StageError::invalid_input(format!(
                "refusing commit id {:?}",
                source.commit
            )));
        }

        debug!(repo = %self.repo.display(), source = %source, "Exporting snapshot");
        let archive = Command::new(&self.git)
            .arg("-C")
            .arg(&self.repo)
            .args(["archive", "--format=tar"])
            .arg(&source.commit)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| spawn_error(&self.git, &e))?;

        if !archive.status.success() {
            // Unknown commits are a property of the input, so retrying won't help.
            return Err(StageError::invalid_input(format!(
                "git archive {} failed: {}",
                source.commit,
                String::from_utf8_lossy(&archive.stderr).trim()
            )));
        }

        let mut untar = Command::new("tar")
            .arg("-x")
            .arg("-C")
            .arg(dest)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error("tar", &e))?;

        if let Some(mut stdin) = untar.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin.write_all(&archive.stdout).await?;
        }
        let output = untar.wait_with_output().await?;
        if !output.status.success() {
            return Err(StageError::unavailable(format!(
                "extracting snapshot failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// In-memory snapshots keyed by commit id.
#[derive(Debug, Clone, Default)]
pub struct InMemorySourceRepository {
    snapshots: HashMap<String, ArtifactContent>,
}

impl InMemorySourceRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the tree for `commit`.
    #[must_use]
    pub fn with_snapshot(mut self, commit: impl Into<String>, tree: ArtifactContent) -> Self {
        self.snapshots.insert(commit.into(), tree);
        self
    }
}

#[async_trait]
impl SourceRepository for InMemorySourceRepository {
    async fn materialize(&self, source: &SourceRef, dest: &Path) -> Result<(), StageError> {
        let tree = self
            .snapshots
            .get(&source.commit)
            .cloned()
            .ok_or_else(|| StageError::invalid_input(format!("unknown commit {}", source.commit)))?;
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || files::write_tree(&dest, &tree))
            .await
            .map_err(|e| StageError::crashed(e.to_string()))??;
        Ok(())
    }
}
