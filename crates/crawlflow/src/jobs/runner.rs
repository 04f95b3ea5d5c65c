use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{CrawlError, ErrorClass, ErrorCode};
use crate::jobs::backend::QueueBackend;
use crate::jobs::model::Job;
use crate::notify::Notifier;

pub const DEFAULT_RATE_LIMIT_FACTOR: u32 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Retrying { delay: Duration },
    Failed,
    /// The lease moved to another worker; nothing was written.
    LeaseLost,
}

/// Applies a handler result to the job row: complete, retry with backoff,
/// or terminal failure.
#[derive(Clone)]
pub struct JobRunner {
    backend: Arc<dyn QueueBackend>,
    notifier: Notifier,
    rate_limit_factor: u32,
}

impl JobRunner {
    pub fn new(backend: Arc<dyn QueueBackend>, notifier: Notifier) -> Self {
        Self {
            backend,
            notifier,
            rate_limit_factor: DEFAULT_RATE_LIMIT_FACTOR,
        }
    }

    pub fn with_rate_limit_factor(mut self, factor: u32) -> Self {
        self.rate_limit_factor = factor.max(1);
        self
    }

    pub async fn on_success(&self, job: &Job, worker_id: &str) -> anyhow::Result<RunOutcome> {
        let retention = job.options().remove_on_complete;
        if self.backend.complete(job.id, worker_id, retention).await? {
            Ok(RunOutcome::Completed)
        } else {
            Ok(RunOutcome::LeaseLost)
        }
    }

    pub async fn on_failure(
        &self,
        job: &Job,
        worker_id: &str,
        err: &CrawlError,
    ) -> anyhow::Result<RunOutcome> {
        let code = err.code();
        let message = err.to_string();
        let opts = job.options();

        self.escalate(job, code, &message).await;

        // 1) Decide retry vs terminal. attempts_made does not include this one yet.
        let attempt_no = job.attempts_made + 1;
        let can_retry = err.class() == ErrorClass::Retryable && attempt_no < job.max_attempts;

        if can_retry {
            let mut delay = opts.backoff.delay(job.attempts_made.max(0) as u32);
            if code == ErrorCode::RateLimit {
                delay = delay.saturating_mul(self.rate_limit_factor);
            }

            let owned = self
                .backend
                .retry_later(job.id, worker_id, delay, code.as_str(), &message)
                .await?;
            if !owned {
                return Ok(RunOutcome::LeaseLost);
            }
            info!(
                queue = %job.queue,
                job = %job.display_key(),
                attempt_no,
                code = code.as_str(),
                delay_ms = delay.as_millis() as u64,
                "job scheduled for retry"
            );
            return Ok(RunOutcome::Retrying { delay });
        }

        // 2) Terminal: attempts exhausted or non-retryable
        let owned = self
            .backend
            .fail(job.id, worker_id, code.as_str(), &message, opts.remove_on_fail)
            .await?;
        if !owned {
            return Ok(RunOutcome::LeaseLost);
        }
        warn!(
            queue = %job.queue,
            job = %job.display_key(),
            attempt_no,
            code = code.as_str(),
            error = %message,
            "job failed"
        );
        Ok(RunOutcome::Failed)
    }

    async fn escalate(&self, job: &Job, code: ErrorCode, message: &str) {
        let repeated_rate_limit = code == ErrorCode::RateLimit
            && job.last_error_code.as_deref() == Some(ErrorCode::RateLimit.as_str());

        if code.is_systemic() || code == ErrorCode::PartitionWrite || repeated_rate_limit {
            self.notifier
                .send(&format!(
                    "[{}] {} {} failed with {}: {}",
                    job.queue,
                    job.name,
                    job.display_key(),
                    code.as_str(),
                    message
                ))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::FetchError;
    use crate::jobs::memory::MemoryQueue;
    use crate::jobs::model::{JobOptions, LeaseRequest, NewJob};
    use crate::retry::Backoff;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    async fn leased(attempts: u32) -> (Arc<MemoryQueue>, Job) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 14, 0, 0, 0).unwrap(),
        ));
        let q = Arc::new(MemoryQueue::new(clock));
        let opts = JobOptions {
            attempts,
            backoff: Backoff::exponential(1_000),
            ..Default::default()
        };
        q.enqueue(NewJob::new("crawl", "page", json!({}), opts))
            .await
            .unwrap();
        let job = q
            .lease(&LeaseRequest {
                queue: "crawl".into(),
                worker_id: "w1".into(),
                limit: 1,
                lock_duration: Duration::from_secs(30),
                rate_limiter: None,
            })
            .await
            .unwrap()
            .remove(0);
        (q, job)
    }

    fn fetch_error() -> CrawlError {
        CrawlError::Fetch(FetchError {
            status: 500,
            error_code: None,
            message: "upstream".into(),
        })
    }

    #[tokio::test]
    async fn retryable_errors_back_off_until_attempts_run_out() {
        let (q, job) = leased(2).await;
        let runner = JobRunner::new(q.clone(), Notifier::disabled());

        let out = runner.on_failure(&job, "w1", &fetch_error()).await.unwrap();
        assert_eq!(
            out,
            RunOutcome::Retrying {
                delay: Duration::from_secs(1)
            }
        );

        let requeued = q.get(job.id).await.unwrap().unwrap();
        assert_eq!(requeued.attempts_made, 1);
        assert_eq!(requeued.status, "queued");
        assert_eq!(requeued.last_error_code.as_deref(), Some("FETCH_ERROR"));

        // second and last attempt
        let mut second = requeued.clone();
        second.status = "running".into();
        let out = runner.on_failure(&second, "w1", &fetch_error()).await.unwrap();
        // the row is not leased, so the report is stale
        assert_eq!(out, RunOutcome::LeaseLost);
    }

    #[tokio::test]
    async fn last_attempt_is_terminal() {
        let (q, job) = leased(1).await;
        let runner = JobRunner::new(q.clone(), Notifier::disabled());
        let out = runner.on_failure(&job, "w1", &fetch_error()).await.unwrap();
        assert_eq!(out, RunOutcome::Failed);
        let row = q.get(job.id).await.unwrap().unwrap();
        assert_eq!(row.attempts_made, 1);
        assert_eq!(row.failed_reason.as_deref(), Some("fetch failed with status 500 (error_code=None): upstream"));
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_on_first_attempt() {
        let (q, job) = leased(5).await;
        let runner = JobRunner::new(q.clone(), Notifier::disabled());

        let out = runner
            .on_failure(&job, "w1", &CrawlError::InvalidJobName("nope".into()))
            .await
            .unwrap();
        assert_eq!(out, RunOutcome::Failed);
        assert_eq!(q.get(job.id).await.unwrap().unwrap().status, "failed");
    }

    #[tokio::test]
    async fn rate_limits_wait_longer() {
        let (q, job) = leased(3).await;
        let runner = JobRunner::new(q, Notifier::disabled());
        let err = CrawlError::RateLimited {
            origin: "holders".into(),
            message: "429".into(),
        };
        let out = runner.on_failure(&job, "w1", &err).await.unwrap();
        assert_eq!(
            out,
            RunOutcome::Retrying {
                delay: Duration::from_secs(4)
            }
        );
    }

    #[tokio::test]
    async fn stale_worker_reports_are_dropped() {
        let (q, job) = leased(3).await;
        let runner = JobRunner::new(q, Notifier::disabled());
        let out = runner.on_success(&job, "w2").await.unwrap();
        assert_eq!(out, RunOutcome::LeaseLost);
    }
}
