//! Webhook delivery of job lifecycle events.
//!
//! Delivery is best effort: failures are logged and never reach the job.

use crate::jobs::{current_timestamp_ms, JobEvent, JobRegistry};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use transcode_daemon_config::NotificationConfig;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Body posted to the webhook.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload<'a> {
    pub event: &'static str,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub data: &'a crate::jobs::JobSnapshot,
}

impl<'a> WebhookPayload<'a> {
    pub fn from_event(event: &'a JobEvent) -> Self {
        Self {
            event: event.kind.as_str(),
            timestamp: current_timestamp_ms(),
            data: &event.job,
        }
    }
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    events: Vec<String>,
}

impl WebhookNotifier {
    /// Returns `None` when no webhook URL is configured.
    pub fn new(config: &NotificationConfig) -> Option<Self> {
        let url = config.webhook_url.as_deref()?.trim();
        if url.is_empty() {
            return None;
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Some(Self {
            client,
            url: url.to_string(),
            events: config.events.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_enabled(&self, event: &JobEvent) -> bool {
        let name = event.kind.as_str();
        self.events.iter().any(|e| e == name)
    }

    /// Post one event if its kind is enabled. Errors are logged.
    pub async fn deliver(&self, event: &JobEvent) {
        if !self.is_enabled(event) {
            return;
        }

        let payload = WebhookPayload::from_event(event);
        let result = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .and_then(|resp| resp.error_for_status());

        match result {
            Ok(_) => debug!(
                job_id = %event.job.job_id,
                event = payload.event,
                "Webhook delivered"
            ),
            Err(e) => warn!(
                job_id = %event.job.job_id,
                event = payload.event,
                url = %self.url,
                error = %e,
                "Webhook delivery failed"
            ),
        }
    }

    /// Forward registry events until the registry is dropped.
    pub async fn run(self, registry: Arc<JobRegistry>) {
        let mut events = registry.subscribe();
        drop(registry);

        info!(url = %self.url, events = ?self.events, "Webhook notifications enabled");

        loop {
            match events.recv().await {
                Ok(event) => self.deliver(&event).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Webhook notifier fell behind; events dropped");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

/// Spawn the notifier when a webhook is configured.
pub fn spawn_notifier(
    registry: Arc<JobRegistry>,
    config: &NotificationConfig,
) -> Option<tokio::task::JoinHandle<()>> {
    let notifier = WebhookNotifier::new(config)?;
    Some(tokio::spawn(notifier.run(registry)))
}
