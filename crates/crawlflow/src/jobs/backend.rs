use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

use crate::jobs::model::{
    EnqueueOutcome, Job, LeaseRequest, NewJob, QueueCounts, Retention, StallReport,
};

/// Storage behind the queue runtime.
///
/// Every transition out of `running` names the worker that holds the lease
/// and returns `false` without touching the row when that worker no longer
/// owns it.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Inserts `job` unless a job with the same key is queued or running in
    /// that queue, in which case the existing id is returned.
    async fn enqueue(&self, job: NewJob) -> anyhow::Result<EnqueueOutcome>;

    async fn enqueue_bulk(&self, jobs: Vec<NewJob>) -> anyhow::Result<Vec<EnqueueOutcome>>;

    /// Claims up to `req.limit` ready jobs, fewer when the rate limiter
    /// window is nearly spent.
    async fn lease(&self, req: &LeaseRequest) -> anyhow::Result<Vec<Job>>;

    async fn extend_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lock_duration: Duration,
    ) -> anyhow::Result<bool>;

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        retention: Retention,
    ) -> anyhow::Result<bool>;

    async fn retry_later(
        &self,
        job_id: Uuid,
        worker_id: &str,
        delay: Duration,
        error_code: &str,
        error_message: &str,
    ) -> anyhow::Result<bool>;

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error_code: &str,
        error_message: &str,
        retention: Retention,
    ) -> anyhow::Result<bool>;

    /// Returns expired leases to the queue, or fails them once they stalled
    /// more than `max_stalled_count` times.
    async fn reap_stalled(&self, queue: &str, max_stalled_count: u32)
        -> anyhow::Result<StallReport>;

    async fn counts(&self, queue: &str) -> anyhow::Result<QueueCounts>;

    async fn get(&self, job_id: Uuid) -> anyhow::Result<Option<Job>>;

    /// Deletes finished jobs whose retention window elapsed.
    async fn purge_finished(&self, limit: i64) -> anyhow::Result<u64>;

    /// Deletes attempt history finished before `cutoff`.
    async fn prune_attempts(&self, cutoff: DateTime<Utc>, limit: i64) -> anyhow::Result<u64>;
}
