//! Read-only operator endpoints.

use axum::{routing::get, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::clock::Clock;
use crate::jobs::QueueBackend;

pub mod metrics;

#[derive(Clone)]
pub struct AdminState {
    pub backend: Arc<dyn QueueBackend>,
    pub clock: Arc<dyn Clock>,
    pub queues: Arc<Vec<String>>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/queues", get(metrics::queues))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::jobs::{JobOptions, MemoryQueue, NewJob};

    #[tokio::test]
    async fn queues_reports_counts_per_queue() {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let queue = Arc::new(MemoryQueue::new(clock.clone()));
        queue
            .enqueue(NewJob::new("holders", "plan", json!({}), JobOptions::default()))
            .await
            .unwrap();

        let app = router(AdminState {
            backend: queue,
            clock,
            queues: Arc::new(vec!["holders".into(), "protocols".into()]),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let body: Value = reqwest::get(format!("http://{addr}/queues"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["totals"]["waiting"], 1);
        assert_eq!(body["per_queue"][0]["queue"], "holders");
        assert_eq!(body["per_queue"][1]["waiting"], 0);

        let health: Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["ok"], true);
    }
}
