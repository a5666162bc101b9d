//! Invokes one stage attempt under a timeout.

use super::{Stage, StageContext};
use crate::core::ArtifactContent;
use crate::errors::StageError;
use crate::observability::SpanTimer;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of a single attempt.
#[derive(Debug)]
pub struct AttemptOutcome {
    /// Output content, or the classified failure.
    pub result: Result<ArtifactContent, StageError>,
    /// Time spent waiting on the transform.
    pub elapsed_ms: u64,
}

impl AttemptOutcome {
    /// Returns true if the attempt produced output.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Stateless executor for stage attempts.
///
/// A transform that does not report within the timeout is recorded as a
/// `Timeout` (transient). A panic is recorded as `Crashed` (permanent).
/// All bookkeeping lives on the run's stage invocation, not here.
#[derive(Debug, Clone, Copy, Default)]
pub struct StageRunner;

impl StageRunner {
    /// Creates a runner.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Runs one attempt of `stage`.
    pub async fn invoke(
        &self,
        stage: &dyn Stage,
        ctx: &StageContext,
        timeout: Duration,
    ) -> AttemptOutcome {
        let timer = SpanTimer::start(format!("{}:{}", ctx.stage, stage.name()));
        debug!(
            run_id = %ctx.run_id,
            stage = %ctx.stage,
            attempt = ctx.attempt,
            implementation = stage.name(),
            "Invoking stage"
        );

        let attempt = AssertUnwindSafe(stage.execute(ctx)).catch_unwind();
        let result = match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => Err(StageError::crashed(panic_message(panic.as_ref()))),
            Err(_) => Err(StageError::timeout(duration_ms(timeout))),
        };

        let elapsed_ms = timer.finish_ms();
        if let Err(ref err) = result {
            warn!(
                run_id = %ctx.run_id,
                stage = %ctx.stage,
                attempt = ctx.attempt,
                error_kind = %err.kind,
                elapsed_ms,
                "Stage attempt failed: {}", err.message
            );
        }

        AttemptOutcome { result, elapsed_ms }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("stage panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("stage panicked: {s}")
    } else {
        "stage panicked".to_string()
    }
}
