//! Span timing helper.

use std::time::Instant;

/// Simple span timing helper.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
    name: String,
}

impl SpanTimer {
    /// Starts a new span timer.
    #[must_use]
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            start: Instant::now(),
            name: name.into(),
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    /// Returns the span name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Finishes the span, logs it at trace level and returns the duration.
    #[must_use]
    pub fn finish_ms(self) -> u64 {
        let elapsed = self.elapsed_ms();
        tracing::trace!(span_name = %self.name, duration_ms = elapsed, "Span finished");
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_timer() {
        let timer = SpanTimer::start("generate:hugo");
        assert_eq!(timer.name(), "generate:hugo");
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(timer.finish_ms() >= 10);
    }
}
