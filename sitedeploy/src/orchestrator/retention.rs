//! Run archiving and artifact garbage collection.

use super::Orchestrator;
use crate::core::{ArtifactId, RunId};
use crate::errors::Result;
use crate::utils::now_utc;
use std::collections::HashSet;
use tracing::{debug, info};

/// Result of [`Orchestrator::apply_retention`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionReport {
    /// Runs dropped from memory.
    pub archived: Vec<RunId>,
}

/// Result of [`Orchestrator::collect_garbage`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GarbageReport {
    /// Artifacts deleted from the store.
    pub deleted: Vec<ArtifactId>,
    /// Artifacts left in place.
    pub kept: usize,
}

impl Orchestrator {
    /// Archives terminal runs beyond `keep_runs_per_branch`, oldest first.
    ///
    /// Active, pending and published runs are never archived; the published
    /// run still counts towards the limit.
    pub fn apply_retention(&self) -> RetentionReport {
        let keep = self.shared.config.retention.keep_runs_per_branch;
        let mut report = RetentionReport::default();

        for mut slot in self.shared.branches.iter_mut() {
            let terminal: Vec<RunId> = slot
                .runs
                .iter()
                .copied()
                .filter(|id| self.shared.runs.get(id).is_some_and(|e| e.run.is_terminal()))
                .collect();
            let excess = terminal.len().saturating_sub(keep);
            if excess == 0 {
                continue;
            }

            let published = slot.published;
            let doomed: HashSet<RunId> = terminal
                .into_iter()
                .filter(|id| Some(*id) != published)
                .take(excess)
                .collect();
            slot.runs.retain(|id| !doomed.contains(id));
            for id in &doomed {
                self.shared.runs.remove(id);
            }
            debug!(branch = %slot.key(), archived = doomed.len(), "Archived runs");
            report.archived.extend(doomed);
        }

        report.archived.sort();
        if !report.archived.is_empty() {
            info!(archived = report.archived.len(), "Applied run retention");
        }
        report
    }

    /// Deletes stored artifacts that no retained run references and that are
    /// older than `artifact_min_age_seconds`.
    ///
    /// The age floor protects artifacts written by an in-flight stage that
    /// has not recorded its output yet.
    pub async fn collect_garbage(&self) -> Result<GarbageReport> {
        let min_age = self.shared.config.retention.artifact_min_age();
        let Some(cutoff) = chrono::Duration::from_std(min_age)
            .ok()
            .and_then(|age| now_utc().checked_sub_signed(age))
        else {
            return Ok(GarbageReport::default());
        };

        let referenced: HashSet<ArtifactId> = self
            .shared
            .runs
            .iter()
            .flat_map(|entry| entry.run.artifacts().map(|a| a.id).collect::<Vec<_>>())
            .collect();

        let mut report = GarbageReport::default();
        for summary in self.shared.artifacts.list().await? {
            if referenced.contains(&summary.id) || summary.created_at > cutoff {
                report.kept += 1;
                continue;
            }
            if self.shared.artifacts.delete(&summary.id).await? {
                debug!(artifact_id = %summary.id, stage = %summary.stage, run_id = %summary.run_id, "Deleted artifact");
                report.deleted.push(summary.id);
            }
        }

        info!(deleted = report.deleted.len(), kept = report.kept, "Collected garbage");
        Ok(report)
    }
}
