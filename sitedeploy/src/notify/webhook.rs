//! HTTP webhook subscriber.

use super::Subscriber;
use crate::core::ActivityEvent;
use crate::errors::NotifyError;
use async_trait::async_trait;
use std::time::Duration;

/// POSTs each event as JSON to a URL.
///
/// The event type is also sent in the `X-Sitedeploy-Event` header.
#[derive(Debug, Clone)]
pub struct WebhookSubscriber {
    url: String,
    client: reqwest::Client,
}

impl WebhookSubscriber {
    /// Creates a webhook subscriber with a 10 second request timeout.
    pub fn new(url: impl Into<String>) -> Result<Self, NotifyError> {
        let url = url.into();
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| NotifyError::new(url.clone(), e.to_string()))?;
        Ok(Self { url, client })
    }

    /// The endpoint.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Subscriber for WebhookSubscriber {
    fn name(&self) -> &str {
        &self.url
    }

    async fn deliver(&self, event: &ActivityEvent) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .header("X-Sitedeploy-Event", event.event_type())
            .json(event)
            .send()
            .await
            .map_err(|e| NotifyError::new(&self.url, e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(NotifyError::new(&self.url, format!("HTTP {status}")))
        }
    }
}
