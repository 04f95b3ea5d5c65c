use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

/// Best-effort progress and failure messages to a chat webhook.
///
/// Sending never fails from the caller's point of view; errors are logged.
#[derive(Clone, Debug)]
pub struct Notifier {
    http: reqwest::Client,
    webhook_url: Option<String>,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http, webhook_url }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn is_enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    pub async fn send(&self, text: &str) {
        let Some(url) = &self.webhook_url else {
            debug!(text, "notification skipped, no webhook configured");
            return;
        };

        let res = self
            .http
            .post(url)
            .json(&json!({ "text": text }))
            .send()
            .await
            .and_then(|r| r.error_for_status());

        if let Err(e) = res {
            warn!(error = %e, "notification dropped");
        }
    }
}
