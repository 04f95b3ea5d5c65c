//! Second, coarser retry tier: terminal failures are snapshotted to the
//! cache and re-enqueued the next time their queue drains.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;
use tracing::{debug, info, warn};

use crate::cache::KvCache;
use crate::error::{ErrorClass, Result};
use crate::jobs::backend::QueueBackend;
use crate::jobs::model::{Job, JobOptions, NewJob};
use crate::jobs::worker::{JobFailure, QueueListener};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedJobSnapshot {
    /// Row id of the failed job; absent in snapshots written before it was kept.
    #[serde(default)]
    pub job_id: Option<Uuid>,
    pub queue: String,
    pub name: String,
    pub data: Value,
    pub opts: JobOptions,
}

impl FailedJobSnapshot {
    pub fn of(job: &Job) -> Self {
        Self {
            job_id: Some(job.id),
            queue: job.queue.clone(),
            name: job.name.clone(),
            data: job.payload_json.clone(),
            opts: job.options(),
        }
    }

    fn into_new_job(self) -> NewJob {
        NewJob {
            queue: self.queue,
            name: self.name,
            payload: self.data,
            opts: self.opts,
            replay_of: self.job_id,
        }
    }
}

pub fn failed_prefix(queue: &str) -> String {
    format!("jobs:{queue}:failed:")
}

pub fn failed_key(queue: &str, job_key: &str) -> String {
    format!("{}{job_key}", failed_prefix(queue))
}

#[derive(Clone)]
pub struct FailureRecorder {
    cache: Arc<dyn KvCache>,
    backend: Arc<dyn QueueBackend>,
}

impl FailureRecorder {
    pub fn new(cache: Arc<dyn KvCache>, backend: Arc<dyn QueueBackend>) -> Self {
        Self { cache, backend }
    }

    pub async fn record(&self, job: &Job) -> Result<String> {
        let key = failed_key(&job.queue, &job.display_key());
        let body = serde_json::to_string(&FailedJobSnapshot::of(job))?;
        self.cache.set(&key, &body, None).await?;
        Ok(key)
    }

    pub async fn pending(&self, queue: &str) -> Result<Vec<String>> {
        self.cache.keys_with_prefix(&failed_prefix(queue)).await
    }

    /// Re-enqueues every snapshot for `queue`. Each snapshot is claimed with
    /// an atomic take, so concurrent replays never enqueue one twice.
    pub async fn replay(&self, queue: &str) -> Result<usize> {
        let keys = self.pending(queue).await?;
        if keys.is_empty() {
            return Ok(0);
        }

        let mut claimed: Vec<(String, String)> = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(body) = self.cache.take(&key).await? {
                claimed.push((key, body));
            }
        }

        let mut jobs = Vec::with_capacity(claimed.len());
        for (key, body) in &claimed {
            match serde_json::from_str::<FailedJobSnapshot>(body) {
                Ok(snapshot) => jobs.push(snapshot.into_new_job()),
                Err(e) => warn!(%key, error = %e, "dropping unreadable failed-job snapshot"),
            }
        }

        let count = jobs.len();
        if count == 0 {
            return Ok(0);
        }

        if let Err(e) = self.backend.enqueue_bulk(jobs).await {
            // put the snapshots back so the next drain tries again
            for (key, body) in &claimed {
                if let Err(put_back) = self.cache.set(key, body, None).await {
                    warn!(%key, error = %put_back, "failed-job snapshot lost");
                }
            }
            return Err(e.into());
        }

        info!(queue, count, "replayed failed jobs");
        Ok(count)
    }
}

#[async_trait]
impl QueueListener for FailureRecorder {
    async fn on_failed(&self, job: &Job, failure: &JobFailure) {
        // replaying cannot fix these
        if failure.class == ErrorClass::NonRetryable {
            debug!(queue = %job.queue, job = %job.display_key(), code = %failure.code, "non-retryable failure not snapshotted");
            return;
        }
        match self.record(job).await {
            Ok(key) => info!(
                queue = %job.queue,
                %key,
                code = %failure.code,
                "failed job snapshot stored"
            ),
            Err(e) => warn!(queue = %job.queue, job = %job.display_key(), error = %e, "could not store failed job"),
        }
    }

    async fn on_drained(&self, queue: &str) {
        if let Err(e) = self.replay(queue).await {
            warn!(queue, error = %e, "failed job replay aborted");
        }
    }
}
