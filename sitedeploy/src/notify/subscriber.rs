//! Subscriber trait and the built-in subscribers.

use crate::core::ActivityEvent;
use crate::errors::NotifyError;
use async_trait::async_trait;
use std::fmt::Debug;
use tracing::{debug, info, Level};

/// Receives activity events from the [`Notifier`](super::Notifier).
///
/// Delivery errors are logged by the notifier and otherwise ignored.
#[async_trait]
pub trait Subscriber: Send + Sync + Debug {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Delivers one event.
    async fn deliver(&self, event: &ActivityEvent) -> Result<(), NotifyError>;
}

/// A subscriber that writes each event to the tracing log.
#[derive(Debug, Clone)]
pub struct LoggingSubscriber {
    level: Level,
}

impl Default for LoggingSubscriber {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingSubscriber {
    /// Creates a logging subscriber with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging subscriber.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }
}

#[async_trait]
impl Subscriber for LoggingSubscriber {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &ActivityEvent) -> Result<(), NotifyError> {
        if self.level == Level::DEBUG {
            debug!(event_type = event.event_type(), branch = event.branch(), "{}", event.summary());
        } else {
            info!(event_type = event.event_type(), branch = event.branch(), "{}", event.summary());
        }
        Ok(())
    }
}

/// A collecting subscriber for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingSubscriber {
    events: parking_lot::RwLock<Vec<ActivityEvent>>,
}

impl CollectingSubscriber {
    /// Creates a new collecting subscriber.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<ActivityEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Returns events whose type starts with `type_prefix`.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<ActivityEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type().starts_with(type_prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Subscriber for CollectingSubscriber {
    fn name(&self) -> &str {
        "collect"
    }

    async fn deliver(&self, event: &ActivityEvent) -> Result<(), NotifyError> {
        self.events.write().push(event.clone());
        Ok(())
    }
}
