//! Fire-and-forget activity notifications.
//!
//! The [`Notifier`] fans each [`ActivityEvent`] out to its subscribers.
//! Every subscriber has its own queue and worker task, so a slow or failing
//! subscriber delays nobody but itself, and each subscriber sees events in
//! publish order. Nothing a subscriber does can affect a pipeline run.

mod subscriber;
#[cfg(feature = "webhook")]
mod webhook;

pub use subscriber::{CollectingSubscriber, LoggingSubscriber, Subscriber};
#[cfg(feature = "webhook")]
pub use webhook::WebhookSubscriber;

use crate::core::ActivityEvent;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

enum Envelope {
    Event(Arc<ActivityEvent>),
    Flush(oneshot::Sender<()>),
}

struct Worker {
    name: String,
    tx: mpsc::UnboundedSender<Envelope>,
    handle: JoinHandle<()>,
}

/// Broadcasts activity events to subscribers without waiting for them.
pub struct Notifier {
    workers: Mutex<Vec<Worker>>,
    delivery_timeout: Duration,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.workers.lock().iter().map(|w| w.name.clone()).collect();
        f.debug_struct("Notifier")
            .field("subscribers", &names)
            .field("delivery_timeout", &self.delivery_timeout)
            .finish()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    /// Creates a notifier with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(Vec::new()),
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
        }
    }

    /// Bounds how long a single delivery may take before it is abandoned.
    #[must_use]
    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    /// Adds a subscriber and starts its delivery worker.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        let name = subscriber.name().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(deliver_loop(subscriber, rx, self.delivery_timeout));
        debug!(subscriber = %name, "Subscriber registered");
        self.workers.lock().push(Worker { name, tx, handle });
    }

    /// Number of registered subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.workers.lock().len()
    }

    /// Queues `event` for every subscriber and returns immediately.
    pub fn publish(&self, event: ActivityEvent) {
        let event = Arc::new(event);
        for worker in self.workers.lock().iter() {
            if worker.tx.send(Envelope::Event(Arc::clone(&event))).is_err() {
                warn!(subscriber = %worker.name, "Subscriber worker stopped; event dropped");
            }
        }
    }

    /// Waits until every event published so far has been handled.
    pub async fn flush(&self) {
        let acks: Vec<oneshot::Receiver<()>> = self
            .workers
            .lock()
            .iter()
            .filter_map(|worker| {
                let (ack_tx, ack_rx) = oneshot::channel();
                worker.tx.send(Envelope::Flush(ack_tx)).ok().map(|()| ack_rx)
            })
            .collect();
        for ack in acks {
            let _ = ack.await;
        }
    }

    /// Drains outstanding deliveries and stops every worker.
    pub async fn close(&self) {
        let workers: Vec<Worker> = self.workers.lock().drain(..).collect();
        for Worker { name, tx, handle } in workers {
            drop(tx);
            if let Err(e) = handle.await {
                warn!(subscriber = %name, error = %e, "Subscriber worker ended abnormally");
            }
        }
    }
}

async fn deliver_loop(
    subscriber: Arc<dyn Subscriber>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    timeout: Duration,
) {
    while let Some(envelope) = rx.recv().await {
        match envelope {
            Envelope::Event(event) => {
                match tokio::time::timeout(timeout, subscriber.deliver(&event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(
                        subscriber = subscriber.name(),
                        event_type = event.event_type(),
                        error = %e,
                        "Notification delivery failed"
                    ),
                    Err(_) => warn!(
                        subscriber = subscriber.name(),
                        event_type = event.event_type(),
                        timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        "Notification delivery timed out"
                    ),
                }
            }
            Envelope::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
}
