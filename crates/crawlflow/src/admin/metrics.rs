use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use super::AdminState;
use crate::jobs::QueueCounts;

#[derive(Serialize)]
pub struct Metrics {
    pub now_utc: String,
    pub totals: QueueCounts,
    pub per_queue: Vec<QueueMetrics>,
}

#[derive(Serialize)]
pub struct QueueMetrics {
    pub queue: String,
    #[serde(flatten)]
    pub counts: QueueCounts,
}

pub async fn queues(State(st): State<AdminState>) -> Result<Json<Metrics>, (StatusCode, String)> {
    let mut per_queue = Vec::with_capacity(st.queues.len());
    let mut totals = QueueCounts::default();

    for queue in st.queues.iter() {
        let counts = st.backend.counts(queue).await.map_err(backend_err)?;
        totals.waiting += counts.waiting;
        totals.delayed += counts.delayed;
        totals.active += counts.active;
        totals.completed += counts.completed;
        totals.failed += counts.failed;
        per_queue.push(QueueMetrics {
            queue: queue.clone(),
            counts,
        });
    }

    Ok(Json(Metrics {
        now_utc: st.clock.now().to_rfc3339(),
        totals,
        per_queue,
    }))
}

fn backend_err(e: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("backend error: {e}"))
}
