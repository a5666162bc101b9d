//! Stage doubles for testing.

use super::fixtures::render_output;
use crate::core::{ArtifactContent, RunId};
use crate::errors::StageError;
use crate::stages::{Stage, StageContext};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

/// One recorded stage attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCall {
    /// The run.
    pub run_id: RunId,
    /// Branch of the run.
    pub branch: String,
    /// Commit of the run.
    pub commit: String,
    /// 1-based attempt.
    pub attempt: u32,
}

#[derive(Debug, Default)]
struct InFlight {
    current: HashMap<String, usize>,
    peak: HashMap<String, usize>,
}

/// A stage whose per-commit results are scripted ahead of time.
///
/// Unscripted attempts succeed with [`render_output`]. Every attempt is
/// recorded, along with how many attempts were running at once per branch.
#[derive(Debug)]
pub struct ScriptedStage {
    name: String,
    scripts: Mutex<HashMap<String, VecDeque<Result<(), StageError>>>>,
    always_fail: Mutex<HashMap<String, StageError>>,
    delay: Mutex<Duration>,
    calls: Mutex<Vec<StageCall>>,
    in_flight: Mutex<InFlight>,
}

impl ScriptedStage {
    /// Creates a stage that always succeeds.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scripts: Mutex::new(HashMap::new()),
            always_fail: Mutex::new(HashMap::new()),
            delay: Mutex::new(Duration::ZERO),
            calls: Mutex::new(Vec::new()),
            in_flight: Mutex::new(InFlight::default()),
        }
    }

    /// Queues per-attempt results for `commit`; `Ok(())` means the default
    /// output. Once the script runs out, attempts succeed.
    #[must_use]
    pub fn with_script(self, commit: &str, script: Vec<Result<(), StageError>>) -> Self {
        self.scripts.lock().insert(commit.to_string(), script.into());
        self
    }

    /// Fails every attempt for `commit` with `error`.
    #[must_use]
    pub fn failing_for(self, commit: &str, error: StageError) -> Self {
        self.always_fail.lock().insert(commit.to_string(), error);
        self
    }

    /// Sleeps for `delay` inside every attempt.
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.delay.lock() = delay;
        self
    }

    /// All recorded attempts, in start order.
    #[must_use]
    pub fn calls(&self) -> Vec<StageCall> {
        self.calls.lock().clone()
    }

    /// Number of recorded attempts.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Attempts made for `commit`.
    #[must_use]
    pub fn calls_for(&self, commit: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.commit == commit).count()
    }

    /// The most attempts that were ever running at once on `branch`.
    #[must_use]
    pub fn peak_in_flight(&self, branch: &str) -> usize {
        self.in_flight.lock().peak.get(branch).copied().unwrap_or(0)
    }

    fn enter(&self, ctx: &StageContext) {
        self.calls.lock().push(StageCall {
            run_id: ctx.run_id,
            branch: ctx.source.branch.clone(),
            commit: ctx.source.commit.clone(),
            attempt: ctx.attempt,
        });
        let mut in_flight = self.in_flight.lock();
        let current = in_flight.current.entry(ctx.source.branch.clone()).or_insert(0);
        *current += 1;
        let now = *current;
        let peak = in_flight.peak.entry(ctx.source.branch.clone()).or_insert(0);
        *peak = (*peak).max(now);
    }

    fn leave(&self, ctx: &StageContext) {
        if let Some(current) = self.in_flight.lock().current.get_mut(&ctx.source.branch) {
            *current = current.saturating_sub(1);
        }
    }

    fn next_result(&self, ctx: &StageContext) -> Result<(), StageError> {
        if let Some(err) = self.always_fail.lock().get(&ctx.source.commit) {
            return Err(err.clone());
        }
        self.scripts
            .lock()
            .get_mut(&ctx.source.commit)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Ok(()))
    }
}

#[async_trait]
impl Stage for ScriptedStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &StageContext) -> Result<ArtifactContent, StageError> {
        self.enter(ctx);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let result = self.next_result(ctx).map(|()| render_output(ctx));
        self.leave(ctx);
        result
    }
}

/// Wraps a stage and holds attempts for chosen commits until released.
///
/// Lets a test observe a run while it is `GENERATING` or `SYNCING`.
#[derive(Debug)]
pub struct GateStage {
    inner: Arc<dyn Stage>,
    gated: Mutex<HashMap<String, Arc<Semaphore>>>,
    entered: Mutex<HashSet<String>>,
    entered_notify: Notify,
}

impl GateStage {
    /// Wraps `inner`. No commit is gated until [`gate`](Self::gate) is called.
    pub fn new(inner: Arc<dyn Stage>) -> Self {
        Self {
            inner,
            gated: Mutex::new(HashMap::new()),
            entered: Mutex::new(HashSet::new()),
            entered_notify: Notify::new(),
        }
    }

    /// Makes attempts for `commit` wait for [`release`](Self::release).
    pub fn gate(&self, commit: &str) {
        self.gated
            .lock()
            .entry(commit.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(0)));
    }

    /// Lets one waiting (or future) attempt for `commit` through.
    pub fn release(&self, commit: &str) {
        if let Some(gate) = self.gated.lock().get(commit) {
            gate.add_permits(1);
        }
    }

    /// Resolves once an attempt for `commit` has reached the gate.
    pub async fn wait_entered(&self, commit: &str) {
        loop {
            let notified = self.entered_notify.notified();
            if self.entered.lock().contains(commit) {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Stage for GateStage {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn execute(&self, ctx: &StageContext) -> Result<ArtifactContent, StageError> {
        let gate = self.gated.lock().get(&ctx.source.commit).cloned();
        self.entered.lock().insert(ctx.source.commit.clone());
        self.entered_notify.notify_waiters();

        if let Some(gate) = gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|e| StageError::unavailable(e.to_string()))?;
            permit.forget();
        }
        self.inner.execute(ctx).await
    }
}
