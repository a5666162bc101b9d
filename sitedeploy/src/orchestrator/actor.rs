//! Per-branch execution: claim, generate, boundary check, sync, settle.

use super::{transition, Shared};
use crate::core::{ActivityEvent, Artifact, RunId, RunState, SourceRef, StageInvocation, StageKind};
use crate::errors::StageError;
use crate::stages::{StageContext, StageInput};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

enum StageResult {
    Produced(Arc<Artifact>),
    Failed(StageError),
    /// Stopped between attempts; carries the last attempt's error.
    Halted(StageError),
}

pub(super) async fn branch_actor(shared: Arc<Shared>, branch: String, mut queue: mpsc::UnboundedReceiver<RunId>) {
    debug!(branch = %branch, "Branch actor started");
    while let Some(run_id) = queue.recv().await {
        shared.execute(&branch, run_id).await;
    }
    debug!(branch = %branch, "Branch actor stopped");
}

impl Shared {
    async fn execute(&self, branch: &str, run_id: RunId) {
        let Some(source) = self.claim(branch, run_id) else {
            return;
        };

        let site = match self
            .run_stage(run_id, &source, StageKind::Generate, StageInput::Source(source.clone()))
            .await
        {
            StageResult::Produced(artifact) => artifact,
            StageResult::Failed(err) => return self.settle_failed(branch, run_id, StageKind::Generate, err),
            StageResult::Halted(_) => return self.settle_superseded(branch, run_id),
        };

        if !self.enter_sync(branch, run_id) {
            return self.settle_superseded(branch, run_id);
        }

        match self
            .run_stage(run_id, &source, StageKind::Sync, StageInput::Artifact(site))
            .await
        {
            StageResult::Produced(_) => self.settle_succeeded(branch, run_id),
            StageResult::Failed(err) | StageResult::Halted(err) => {
                self.settle_failed(branch, run_id, StageKind::Sync, err);
            }
        }
    }

    /// `PENDING -> GENERATING`, taking the branch's active slot.
    fn claim(&self, branch: &str, run_id: RunId) -> Option<SourceRef> {
        let mut slot = self.branches.get_mut(branch)?;
        if let Some(other) = slot.active {
            error!(branch = branch, run_id = %run_id, active = %other, "Branch slot already taken");
            return None;
        }
        let source = self.update_run(&run_id, |run| {
            if run.state != RunState::Pending {
                debug!(run_id = %run.id, state = %run.state, "Skipping run that is no longer pending");
                return None;
            }
            transition(run, RunState::Generating).then(|| run.source.clone())
        })??;
        slot.active = Some(run_id);
        info!(run_id = %run_id, branch = branch, commit = %source.commit, "Run started");
        Some(source)
    }

    /// The generate/sync boundary: either `GENERATING -> SYNCING`, or false
    /// if a newer run asked this one to stop.
    fn enter_sync(&self, branch: &str, run_id: RunId) -> bool {
        let _slot = self.branches.get_mut(branch);
        self.update_run(&run_id, |run| {
            if run.supersede_requested {
                return false;
            }
            transition(run, RunState::Syncing)
        })
        .unwrap_or(false)
    }

    async fn run_stage(&self, run_id: RunId, source: &SourceRef, kind: StageKind, input: StageInput) -> StageResult {
        let (stage, policy) = match kind {
            StageKind::Generate => (&self.generate, &self.config.generate),
            StageKind::Sync => (&self.sync, &self.config.sync),
        };
        let input_ref = input.to_ref();
        self.update_run(&run_id, |run| run.invocations.push(StageInvocation::new(kind, input_ref)));

        let base = StageContext::new(run_id, kind, source.clone(), input);
        let mut attempt = 1;
        loop {
            let ctx = base.for_attempt(attempt);
            let outcome = self.runner.invoke(stage.as_ref(), &ctx, policy.timeout).await;
            let elapsed_ms = outcome.elapsed_ms;
            let result = match outcome.result {
                Ok(content) => self.store_output(run_id, source, kind, content).await,
                Err(err) => Err(err),
            };

            let err = match result {
                Ok(artifact) => {
                    let reference = artifact.reference();
                    info!(
                        run_id = %run_id,
                        stage = %kind,
                        attempt,
                        artifact_id = %reference.id,
                        content_hash = %reference.content_hash,
                        "Stage succeeded"
                    );
                    self.update_run(&run_id, |run| {
                        if let Some(invocation) = run.invocation_mut(kind) {
                            invocation.succeed(reference, elapsed_ms);
                        }
                    });
                    return StageResult::Produced(artifact);
                }
                Err(err) => err,
            };

            let retry = err.is_transient() && policy.allows_another(attempt);
            // Sync is past the point of no return; only generate may stop early.
            let halt = retry && kind == StageKind::Generate && self.supersede_requested(&run_id);
            self.update_run(&run_id, |run| {
                if let Some(invocation) = run.invocation_mut(kind) {
                    invocation.record_failure(err.clone(), elapsed_ms);
                    if !retry || halt {
                        invocation.fail();
                    }
                }
            });

            if halt {
                return StageResult::Halted(err);
            }
            if !retry {
                return StageResult::Failed(err);
            }

            let delay = policy.retry.delay_after(attempt);
            warn!(
                run_id = %run_id,
                stage = %kind,
                attempt,
                max_attempts = policy.max_attempts,
                error_kind = %err.kind,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Retrying stage"
            );
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            attempt += 1;
        }
    }

    async fn store_output(
        &self,
        run_id: RunId,
        source: &SourceRef,
        kind: StageKind,
        content: crate::core::ArtifactContent,
    ) -> Result<Arc<Artifact>, StageError> {
        let artifact = Artifact::new(kind, run_id, source.clone(), content);
        self.artifacts.put(artifact.clone()).await?;
        Ok(Arc::new(artifact))
    }

    fn supersede_requested(&self, run_id: &RunId) -> bool {
        self.runs.get(run_id).is_some_and(|entry| entry.run.supersede_requested)
    }

    fn release(&self, branch: &str, run_id: RunId) -> Option<dashmap::mapref::one::RefMut<'_, String, super::BranchSlot>> {
        let mut slot = self.branches.get_mut(branch)?;
        if slot.active == Some(run_id) {
            slot.active = None;
        }
        Some(slot)
    }

    fn settle_succeeded(&self, branch: &str, run_id: RunId) {
        let event = {
            let Some(mut slot) = self.release(branch, run_id) else {
                return;
            };
            let Some(sequence) = self.runs.get(&run_id).map(|entry| entry.run.sequence) else {
                return;
            };
            let live = slot
                .published
                .filter(|id| *id != run_id)
                .and_then(|id| self.runs.get(&id).map(|entry| (id, entry.run.sequence)));
            let publish = match live {
                Some((_, live_sequence)) if live_sequence > sequence => {
                    info!(run_id = %run_id, "Newer output already published; keeping it");
                    false
                }
                Some((previous, _)) => {
                    self.update_run(&previous, |run| run.published = false);
                    true
                }
                None => true,
            };

            let event = self.settle_run(&run_id, |run| {
                transition(run, RunState::Succeeded).then(|| {
                    run.published = publish;
                    ActivityEvent::RunSucceeded {
                        run_id,
                        source: run.source.clone(),
                    }
                })
            });
            if event.is_some() && publish {
                slot.published = Some(run_id);
            }
            event
        };

        if let Some(event) = event {
            info!(run_id = %run_id, branch = branch, "{}", event.summary());
        }
    }

    fn settle_failed(&self, branch: &str, run_id: RunId, stage: StageKind, err: StageError) {
        let event = {
            let _slot = self.release(branch, run_id);
            self.settle_run(&run_id, |run| {
                // A run flagged during generate ends superseded even if its
                // last attempt failed.
                if stage == StageKind::Generate && run.supersede_requested {
                    return transition(run, RunState::Superseded).then(|| ActivityEvent::RunSuperseded {
                        run_id,
                        source: run.source.clone(),
                        superseded_by: run.superseded_by,
                    });
                }
                transition(run, stage.failed_state()).then(|| ActivityEvent::RunFailed {
                    run_id,
                    source: run.source.clone(),
                    stage,
                    error_kind: err.kind,
                    message: err.message.clone(),
                })
            })
        };

        match event {
            Some(event @ ActivityEvent::RunFailed { .. }) => warn!(
                run_id = %run_id,
                branch = branch,
                stage = %stage,
                error_kind = %err.kind,
                "{}", event.summary()
            ),
            Some(event) => info!(run_id = %run_id, branch = branch, "{}", event.summary()),
            None => {}
        }
    }

    fn settle_superseded(&self, branch: &str, run_id: RunId) {
        let event = {
            let _slot = self.release(branch, run_id);
            self.settle_run(&run_id, |run| {
                transition(run, RunState::Superseded).then(|| ActivityEvent::RunSuperseded {
                    run_id,
                    source: run.source.clone(),
                    superseded_by: run.superseded_by,
                })
            })
        };

        if let Some(event) = event {
            info!(run_id = %run_id, branch = branch, "{}", event.summary());
        }
    }
}
