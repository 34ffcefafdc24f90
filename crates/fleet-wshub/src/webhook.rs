//! Alert fan-out to configured webhook/chat sinks (§4.4).

use async_trait::async_trait;
use serde_json::json;
use tracing::warn;

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, agent_id: &str, level: &str, message: &str);
}

pub struct NoopAlertSink;

#[async_trait]
impl AlertSink for NoopAlertSink {
    async fn notify(&self, _agent_id: &str, _level: &str, _message: &str) {}
}

/// POSTs a JSON body to each configured webhook URL. Failures are logged
/// and otherwise swallowed — a slow or down webhook endpoint must never
/// block alert ingestion from agents.
pub struct WebhookAlertSink {
    client: reqwest::Client,
    urls: Vec<String>,
}

impl WebhookAlertSink {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            urls,
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn notify(&self, agent_id: &str, level: &str, message: &str) {
        if self.urls.is_empty() {
            return;
        }
        let body = json!({ "agentId": agent_id, "level": level, "message": message });
        for url in &self.urls {
            let result = self.client.post(url).json(&body).send().await;
            if let Err(e) = result {
                warn!(url, error = %e, "alert webhook delivery failed");
            }
        }
    }
}
