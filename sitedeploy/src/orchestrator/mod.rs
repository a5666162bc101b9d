//! Pipeline orchestrator.
//!
//! Every branch gets one actor task fed by an unbounded queue of run ids.
//! The actor executes runs strictly one at a time and in acceptance order,
//! which is what guarantees that at most one run per branch is ever
//! `GENERATING` or `SYNCING`. Runs for different branches proceed in
//! parallel.
//!
//! Supersession is cooperative. When a newer trigger is accepted for a
//! branch:
//!
//! - runs still `PENDING` are superseded on the spot;
//! - a `GENERATING` run is flagged and halts at its next boundary (between
//!   attempts, or before sync starts);
//! - a `SYNCING` run is past the point of no return and finishes normally.
//!   The newer run takes over publication when it succeeds.
//!
//! All bookkeeping happens under the branch slot lock, taken before any run
//! entry lock and never held across an await.

mod actor;
#[cfg(test)]
mod integration_tests;
mod retention;

pub use retention::{GarbageReport, RetentionReport};

use crate::config::{DeployConfig, RetentionConfig};
use crate::core::{ActivityEvent, Run, RunId, RunState, TriggerEvent};
use crate::errors::{DeployError, Result};
use crate::notify::Notifier;
use crate::stages::{Stage, StagePolicy, StageRunner};
use crate::store::ArtifactStore;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Policies the orchestrator runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Generate stage policy.
    pub generate: StagePolicy,
    /// Sync stage policy.
    pub sync: StagePolicy,
    /// Run and artifact retention.
    pub retention: RetentionConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&DeployConfig::default())
    }
}

impl From<&DeployConfig> for OrchestratorConfig {
    fn from(config: &DeployConfig) -> Self {
        Self {
            generate: config.generate.policy(),
            sync: config.sync.policy(),
            retention: config.retention.clone(),
        }
    }
}

impl OrchestratorConfig {
    /// Sets the generate policy.
    #[must_use]
    pub fn with_generate(mut self, policy: StagePolicy) -> Self {
        self.generate = policy;
        self
    }

    /// Sets the sync policy.
    #[must_use]
    pub fn with_sync(mut self, policy: StagePolicy) -> Self {
        self.sync = policy;
        self
    }

    /// Sets the retention policy.
    #[must_use]
    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.retention = retention;
        self
    }
}

/// What happened to a submitted trigger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A new run was created in `PENDING`.
    Created(RunId),
    /// The event repeats one that already has a run.
    Duplicate(RunId),
    /// The event's sequence is not newer than the last accepted one.
    Stale {
        /// Highest sequence accepted so far for the branch.
        last_sequence: u64,
    },
}

impl SubmitOutcome {
    /// The id of the created run, if any.
    #[must_use]
    pub fn created(&self) -> Option<RunId> {
        match self {
            Self::Created(id) => Some(*id),
            _ => None,
        }
    }
}

pub(crate) struct RunEntry {
    run: Run,
    state_tx: watch::Sender<RunState>,
}

impl RunEntry {
    fn new(run: Run) -> Self {
        let (state_tx, _) = watch::channel(run.state);
        Self { run, state_tx }
    }
}

#[derive(Default)]
struct BranchSlot {
    queue: Option<mpsc::UnboundedSender<RunId>>,
    last_sequence: u64,
    /// Retained runs in acceptance order.
    runs: Vec<RunId>,
    active: Option<RunId>,
    published: Option<RunId>,
}

pub(crate) struct Shared {
    config: OrchestratorConfig,
    generate: Arc<dyn Stage>,
    sync: Arc<dyn Stage>,
    runner: StageRunner,
    artifacts: Arc<dyn ArtifactStore>,
    notifier: Arc<Notifier>,
    runs: DashMap<RunId, RunEntry>,
    branches: DashMap<String, BranchSlot>,
    accepting: AtomicBool,
    actors: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    /// Applies `f` to a run and broadcasts any state change.
    fn update_run<R>(&self, run_id: &RunId, f: impl FnOnce(&mut Run) -> R) -> Option<R> {
        let mut entry = self.runs.get_mut(run_id)?;
        let before = entry.run.state;
        let out = f(&mut entry.run);
        if entry.run.state != before {
            entry.state_tx.send_replace(entry.run.state);
        }
        Some(out)
    }

    /// Applies a terminal change to a run. The returned event reaches the
    /// notifier before the new state is broadcast, so a waiter woken by the
    /// change can flush and observe it.
    fn settle_run(&self, run_id: &RunId, f: impl FnOnce(&mut Run) -> Option<ActivityEvent>) -> Option<ActivityEvent> {
        let mut entry = self.runs.get_mut(run_id)?;
        let before = entry.run.state;
        let event = f(&mut entry.run);
        if let Some(event) = &event {
            self.notifier.publish(event.clone());
        }
        if entry.run.state != before {
            entry.state_tx.send_replace(entry.run.state);
        }
        event
    }

    fn snapshot(&self, run_id: &RunId) -> Option<Run> {
        self.runs.get(run_id).map(|entry| entry.run.clone())
    }
}

/// Moves `run` to `next`, logging instead of failing on an illegal move.
fn transition(run: &mut Run, next: RunState) -> bool {
    match run.transition(next) {
        Ok(()) => true,
        Err(e) => {
            error!(run_id = %run.id, branch = run.branch(), error = %e, "Refusing run transition");
            false
        }
    }
}

/// The pipeline orchestrator. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("generate", &self.shared.generate.name())
            .field("sync", &self.shared.sync.name())
            .field("branches", &self.shared.branches.len())
            .field("runs", &self.shared.runs.len())
            .finish()
    }
}

impl Orchestrator {
    /// Creates an orchestrator. Branch actors are spawned on demand, so
    /// this must be used from within a Tokio runtime.
    pub fn new(
        config: OrchestratorConfig,
        generate: Arc<dyn Stage>,
        sync: Arc<dyn Stage>,
        artifacts: Arc<dyn ArtifactStore>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                generate,
                sync,
                runner: StageRunner::new(),
                artifacts,
                notifier,
                runs: DashMap::new(),
                branches: DashMap::new(),
                accepting: AtomicBool::new(true),
                actors: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The policies in force.
    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.shared.config
    }

    /// Accepts a trigger event.
    ///
    /// Creates a `PENDING` run, supersedes older unfinished runs of the same
    /// branch and queues the new run on the branch actor.
    pub fn submit(&self, trigger: TriggerEvent) -> Result<SubmitOutcome> {
        if !self.shared.accepting.load(Ordering::Acquire) {
            return Err(DeployError::Shutdown);
        }

        let shared = &self.shared;
        let branch = trigger.branch().to_string();
        let mut superseded = Vec::new();

        let run = Run::new(&trigger);
        let run_id = run.id;
        {
            let mut slot = shared
                .branches
                .entry(branch.clone())
                .or_insert_with(|| self.spawn_actor(&branch));

            let repeated = slot.runs.iter().rev().find(|id| {
                shared.runs.get(*id).is_some_and(|entry| {
                    entry.run.source.commit == trigger.source.commit
                        && (entry.run.sequence == trigger.sequence || !entry.run.is_terminal())
                })
            });
            if let Some(existing) = repeated {
                debug!(branch = %branch, commit = %trigger.source.commit, run_id = %existing, "Duplicate trigger");
                return Ok(SubmitOutcome::Duplicate(*existing));
            }
            if trigger.sequence <= slot.last_sequence {
                warn!(
                    branch = %branch,
                    commit = %trigger.source.commit,
                    sequence = trigger.sequence,
                    last_sequence = slot.last_sequence,
                    "Stale trigger"
                );
                return Ok(SubmitOutcome::Stale {
                    last_sequence: slot.last_sequence,
                });
            }
            let queue = slot.queue.clone().ok_or(DeployError::Shutdown)?;

            for older in &slot.runs {
                let event = shared.settle_run(older, |run| match run.state {
                    RunState::Pending => transition(run, RunState::Superseded).then(|| {
                        run.superseded_by = Some(run_id);
                        ActivityEvent::RunSuperseded {
                            run_id: run.id,
                            source: run.source.clone(),
                            superseded_by: Some(run_id),
                        }
                    }),
                    RunState::Generating => {
                        run.supersede_requested = true;
                        run.superseded_by = Some(run_id);
                        info!(run_id = %run.id, by = %run_id, "Supersession requested at next boundary");
                        None
                    }
                    _ => None,
                });
                superseded.extend(event);
            }

            shared.runs.insert(run_id, RunEntry::new(run));
            if queue.send(run_id).is_err() {
                shared.runs.remove(&run_id);
                return Err(DeployError::Shutdown);
            }
            slot.runs.push(run_id);
            slot.last_sequence = trigger.sequence;
        }

        info!(
            run_id = %run_id,
            branch = %branch,
            commit = %trigger.source.commit,
            sequence = trigger.sequence,
            "Run created"
        );
        for event in superseded {
            info!(branch = %branch, "{}", event.summary());
        }
        Ok(SubmitOutcome::Created(run_id))
    }

    fn spawn_actor(&self, branch: &str) -> BranchSlot {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(actor::branch_actor(
            Arc::clone(&self.shared),
            branch.to_string(),
            rx,
        ));
        self.shared.actors.lock().push(handle);
        BranchSlot {
            queue: Some(tx),
            ..BranchSlot::default()
        }
    }

    /// Feeds trigger events from a watcher queue into [`submit`](Self::submit)
    /// until the queue closes or the orchestrator shuts down.
    pub fn spawn_intake(&self, mut rx: mpsc::UnboundedReceiver<TriggerEvent>) -> JoinHandle<()> {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            while let Some(trigger) = rx.recv().await {
                match orchestrator.submit(trigger) {
                    Ok(outcome) => debug!(?outcome, "Trigger submitted"),
                    Err(DeployError::Shutdown) => break,
                    Err(e) => warn!(error = %e, "Trigger rejected"),
                }
            }
            debug!("Intake stopped");
        })
    }

    /// A snapshot of a run.
    #[must_use]
    pub fn run(&self, run_id: RunId) -> Option<Run> {
        self.shared.snapshot(&run_id)
    }

    /// Watches a run's state.
    #[must_use]
    pub fn subscribe(&self, run_id: RunId) -> Option<watch::Receiver<RunState>> {
        self.shared.runs.get(&run_id).map(|entry| entry.state_tx.subscribe())
    }

    /// Waits until the run is terminal and returns its final snapshot.
    pub async fn wait_for_terminal(&self, run_id: RunId) -> Result<Run> {
        let mut rx = self.subscribe(run_id).ok_or(DeployError::UnknownRun(run_id))?;
        // An error here means the run was archived, which only happens once
        // it is terminal anyway.
        let _ = rx.wait_for(|state| state.is_terminal()).await;
        self.run(run_id).ok_or(DeployError::UnknownRun(run_id))
    }

    /// Waits for the run and turns anything but success into an error.
    pub async fn wait_for_success(&self, run_id: RunId) -> Result<Run> {
        let run = self.wait_for_terminal(run_id).await?;
        match run.state {
            RunState::Succeeded => Ok(run),
            RunState::Superseded => Err(DeployError::Superseded {
                run_id,
                by: run.superseded_by,
            }),
            _ => Err(run
                .failure()
                .map(|(_, err)| DeployError::Stage(err.clone()))
                .unwrap_or(DeployError::UnknownRun(run_id))),
        }
    }

    /// Waits with a deadline. Returns `None` on timeout.
    pub async fn wait_for_terminal_within(&self, run_id: RunId, limit: Duration) -> Option<Result<Run>> {
        tokio::time::timeout(limit, self.wait_for_terminal(run_id)).await.ok()
    }

    /// Retained runs of a branch, oldest first.
    #[must_use]
    pub fn runs_for_branch(&self, branch: &str) -> Vec<Run> {
        let ids: Vec<RunId> = self
            .shared
            .branches
            .get(branch)
            .map(|slot| slot.runs.clone())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.shared.snapshot(id)).collect()
    }

    /// The run currently generating or syncing on a branch.
    #[must_use]
    pub fn active_run(&self, branch: &str) -> Option<Run> {
        let id = self.shared.branches.get(branch).and_then(|slot| slot.active)?;
        self.shared.snapshot(&id)
    }

    /// The run whose output the branch currently serves.
    #[must_use]
    pub fn published_run(&self, branch: &str) -> Option<Run> {
        let id = self.shared.branches.get(branch).and_then(|slot| slot.published)?;
        self.shared.snapshot(&id)
    }

    /// Names of every branch seen so far.
    #[must_use]
    pub fn branches(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.branches.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Stops accepting triggers, lets every branch actor drain its queue,
    /// then flushes notifications.
    pub async fn shutdown(&self) {
        if !self.shared.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down orchestrator");
        for mut slot in self.shared.branches.iter_mut() {
            slot.queue = None;
        }
        let actors: Vec<JoinHandle<()>> = std::mem::take(&mut *self.shared.actors.lock());
        for handle in actors {
            if let Err(e) = handle.await {
                error!(error = %e, "Branch actor ended abnormally");
            }
        }
        self.shared.notifier.flush().await;
        info!("Orchestrator stopped");
    }
}
