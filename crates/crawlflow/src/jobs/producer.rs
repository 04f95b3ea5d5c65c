use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::jobs::backend::QueueBackend;
use crate::jobs::model::{EnqueueOutcome, JobOptions, NewJob};

#[derive(Debug, Clone)]
pub struct BulkJob {
    pub name: String,
    pub payload: Value,
    pub opts: JobOptions,
}

impl BulkJob {
    pub fn new(name: &str, payload: Value, opts: JobOptions) -> Self {
        Self {
            name: name.to_string(),
            payload,
            opts,
        }
    }
}

/// Job producer API used by the scheduler and by pipeline stages that
/// enqueue the next stage.
#[derive(Clone)]
pub struct QueueProducer {
    backend: Arc<dyn QueueBackend>,
}

impl QueueProducer {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn QueueBackend> {
        &self.backend
    }

    pub async fn add_job(
        &self,
        queue: &str,
        name: &str,
        payload: Value,
        opts: JobOptions,
    ) -> Result<EnqueueOutcome> {
        let key = opts.job_id.clone();
        let out = self
            .backend
            .enqueue(NewJob::new(queue, name, payload, opts))
            .await?;
        debug!(queue, name, key = ?key, created = out.created, "add_job");
        Ok(out)
    }

    pub async fn add_bulk(&self, queue: &str, jobs: Vec<BulkJob>) -> Result<Vec<EnqueueOutcome>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        let batch: Vec<NewJob> = jobs
            .into_iter()
            .map(|j| NewJob::new(queue, &j.name, j.payload, j.opts))
            .collect();
        let out = self.backend.enqueue_bulk(batch).await?;
        debug!(
            queue,
            total = out.len(),
            created = out.iter().filter(|o| o.created).count(),
            "add_bulk"
        );
        Ok(out)
    }
}
