//! Turns upstream change notifications into trigger events.
//!
//! The watcher is the only place branch tracking is decided: anything that
//! reaches the orchestrator is already known to be tracked, unseen and in
//! order.

use crate::config::WatchConfig;
use crate::core::{ActivityEvent, SourceRef, TriggerEvent};
use crate::errors::{ConfigurationError, DeployError};
use crate::notify::Notifier;
use crate::utils::Timestamp;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Compiles branch patterns, anchored so they match whole names.
pub fn compile_branch_patterns(patterns: &[String]) -> Result<Vec<Regex>, ConfigurationError> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(&format!("^(?:{pattern})$")).map_err(|e| ConfigurationError::InvalidPattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// What happened to a change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// A new trigger event was enqueued for the orchestrator.
    Accepted(TriggerEvent),
    /// A re-delivery of a change already accepted; nothing was enqueued.
    Duplicate,
    /// The change is older than one already accepted for the branch.
    Stale,
    /// The branch is not tracked.
    Rejected(ConfigurationError),
}

impl WatchOutcome {
    /// The trigger event, if one was enqueued.
    #[must_use]
    pub fn trigger(&self) -> Option<&TriggerEvent> {
        match self {
            Self::Accepted(trigger) => Some(trigger),
            _ => None,
        }
    }
}

/// Per-branch memory.
#[derive(Debug, Default)]
struct BranchState {
    exists: bool,
    next_sequence: u64,
    last_timestamp: Option<Timestamp>,
    /// Accepted `(commit, timestamp)` pairs, newest last.
    recent: VecDeque<(String, Timestamp)>,
}

impl BranchState {
    /// True for the current head, or for an older accepted change delivered
    /// again with its original timestamp. A branch moving back to an earlier
    /// commit carries a newer timestamp and is not a re-delivery.
    fn is_redelivery(&self, commit: &str, timestamp: Timestamp) -> bool {
        if self.recent.back().is_some_and(|(head, _)| head == commit) {
            return true;
        }
        self.recent
            .iter()
            .any(|(seen, at)| seen == commit && *at == timestamp)
    }

    fn remember(&mut self, commit: &str, timestamp: Timestamp, window: usize) {
        self.recent.push_back((commit.to_string(), timestamp));
        while self.recent.len() > window {
            self.recent.pop_front();
        }
    }

    fn forget_commits(&mut self) {
        self.recent.clear();
        self.last_timestamp = None;
    }
}

/// Source watcher.
///
/// `on_change` collapses re-deliveries of accepted changes still inside the
/// dedup window, never distinct advancements of a branch, and assigns every accepted event a per-branch sequence number that only
/// ever grows, including across branch deletion.
#[derive(Debug)]
pub struct SourceWatcher {
    patterns: Vec<Regex>,
    dedup_window: usize,
    branches: Mutex<HashMap<String, BranchState>>,
    tx: mpsc::UnboundedSender<TriggerEvent>,
    notifier: Arc<Notifier>,
}

impl SourceWatcher {
    /// Creates a watcher and the receiving end of its trigger queue.
    pub fn new(
        config: &WatchConfig,
        notifier: Arc<Notifier>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TriggerEvent>), ConfigurationError> {
        let patterns = compile_branch_patterns(&config.tracked_branches)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = Self {
            patterns,
            dedup_window: config.dedup_window.max(1),
            branches: Mutex::new(HashMap::new()),
            tx,
            notifier,
        };
        Ok((watcher, rx))
    }

    /// Returns true if `branch` is tracked.
    #[must_use]
    pub fn is_tracked(&self, branch: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(branch))
    }

    /// Records that `branch` now points at `commit`.
    ///
    /// Returns [`DeployError::Shutdown`] if the orchestrator has stopped
    /// taking events.
    pub fn on_change(
        &self,
        branch: &str,
        commit: &str,
        timestamp: Timestamp,
    ) -> Result<WatchOutcome, DeployError> {
        if !self.is_tracked(branch) {
            debug!(branch = branch, commit = commit, "Ignoring change on untracked branch");
            return Ok(WatchOutcome::Rejected(ConfigurationError::UntrackedBranch(
                branch.to_string(),
            )));
        }
        if self.tx.is_closed() {
            return Err(DeployError::Shutdown);
        }

        let source = SourceRef::new(branch, commit);
        let (trigger, created) = {
            let mut branches = self.branches.lock();
            let state = branches.entry(branch.to_string()).or_default();

            if state.is_redelivery(commit, timestamp) {
                debug!(branch = branch, commit = commit, "Collapsed duplicate change notification");
                return Ok(WatchOutcome::Duplicate);
            }
            if state.last_timestamp.is_some_and(|last| timestamp < last) {
                warn!(branch = branch, commit = commit, %timestamp, "Dropping out-of-order change notification");
                return Ok(WatchOutcome::Stale);
            }

            state.remember(commit, timestamp, self.dedup_window);
            state.last_timestamp = Some(timestamp);
            state.next_sequence += 1;
            let created = !state.exists;
            state.exists = true;

            let trigger = TriggerEvent::new(source.clone(), timestamp, state.next_sequence);
            // Sent while holding the lock so queue order matches sequence order.
            self.tx.send(trigger.clone()).map_err(|_| DeployError::Shutdown)?;
            (trigger, created)
        };

        info!(
            branch = branch,
            commit = commit,
            sequence = trigger.sequence,
            "Accepted change"
        );
        if created {
            self.notifier.publish(ActivityEvent::BranchCreated {
                source: source.clone(),
                timestamp,
            });
        }
        self.notifier.publish(ActivityEvent::CommitPushed { source, timestamp });
        Ok(WatchOutcome::Accepted(trigger))
    }

    /// Records that `branch` was deleted upstream.
    ///
    /// Forgets the branch's recent commits, so recreating it at a commit it
    /// already had starts a new run. Returns false for untracked or unknown
    /// branches.
    pub fn on_branch_deleted(&self, branch: &str, timestamp: Timestamp) -> bool {
        if !self.is_tracked(branch) {
            return false;
        }
        {
            let mut branches = self.branches.lock();
            match branches.get_mut(branch) {
                Some(state) if state.exists => {
                    state.exists = false;
                    state.forget_commits();
                }
                _ => return false,
            }
        }

        info!(branch = branch, "Branch deleted");
        self.notifier.publish(ActivityEvent::BranchDeleted {
            branch: branch.to_string(),
            timestamp,
        });
        true
    }
}
