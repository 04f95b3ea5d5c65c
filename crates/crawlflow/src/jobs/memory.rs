use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::clock::Clock;
use crate::jobs::backend::QueueBackend;
use crate::jobs::model::{
    EnqueueOutcome, Job, JobStatus, LeaseRequest, NewJob, QueueCounts, Retention, StallReport,
};

#[derive(Debug, Clone)]
struct AttemptRow {
    job_id: Uuid,
    queue: String,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct State {
    jobs: HashMap<Uuid, Job>,
    attempts: Vec<AttemptRow>,
}

/// Queue kept in process memory, with time read from the injected clock.
///
/// Transitions match [`PgQueue`](crate::jobs::PgQueue) one for one so the
/// worker pool behaves the same on either backend.
pub struct MemoryQueue {
    state: Mutex<State>,
    clock: Arc<dyn Clock>,
}

impl MemoryQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            clock,
        }
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow::anyhow!("memory queue poisoned"))
    }

    /// Every job currently stored for `queue`, in no particular order.
    pub fn jobs(&self, queue: &str) -> anyhow::Result<Vec<Job>> {
        Ok(self
            .lock()?
            .jobs
            .values()
            .filter(|j| j.queue == queue)
            .cloned()
            .collect())
    }

    fn insert(state: &mut State, job: NewJob, now: DateTime<Utc>) -> anyhow::Result<EnqueueOutcome> {
        if let Some(key) = job.opts.job_id.as_deref() {
            let pending = state.jobs.values().find(|j| {
                j.queue == job.queue
                    && j.job_key.as_deref() == Some(key)
                    && matches!(j.status(), JobStatus::Queued | JobStatus::Running)
            });
            if let Some(existing) = pending {
                return Ok(EnqueueOutcome {
                    id: existing.id,
                    created: false,
                });
            }
        }

        let id = Uuid::new_v4();
        let delay = ChronoDuration::milliseconds(i64::try_from(job.opts.delay_ms).unwrap_or(i64::MAX / 2));
        let row = Job {
            id,
            queue: job.queue,
            name: job.name,
            job_key: job.opts.job_id.clone(),
            payload_json: job.payload,
            opts_json: serde_json::to_value(&job.opts)?,
            run_at: now + delay,
            status: JobStatus::Queued.as_str().to_string(),
            priority: job.opts.priority,
            max_attempts: job.opts.max_attempts(),
            attempts_made: 0,
            stalled_count: 0,
            locked_at: None,
            locked_by: None,
            lock_expires_at: None,
            last_error_code: None,
            last_error_message: None,
            failed_reason: None,
            finished_at: None,
            keep_until: None,
            replay_of_job_id: job.replay_of,
            created_at: now,
            updated_at: now,
        };
        state.jobs.insert(id, row);
        Ok(EnqueueOutcome { id, created: true })
    }

    fn owned<'a>(state: &'a mut State, job_id: Uuid, worker_id: &str) -> Option<&'a mut Job> {
        state.jobs.get_mut(&job_id).filter(|j| {
            j.status() == JobStatus::Running && j.locked_by.as_deref() == Some(worker_id)
        })
    }

    fn finish_attempt(state: &mut State, job_id: Uuid, now: DateTime<Utc>) {
        for a in state
            .attempts
            .iter_mut()
            .filter(|a| a.job_id == job_id && a.finished_at.is_none())
        {
            a.finished_at = Some(now);
        }
    }

    fn finish(state: &mut State, job_id: Uuid, status: JobStatus, retention: Retention, now: DateTime<Utc>) {
        if retention == Retention::Remove {
            state.jobs.remove(&job_id);
            return;
        }
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.status = status.as_str().to_string();
            job.finished_at = Some(now);
            job.keep_until = retention.keep_until(now);
            unlock(job, now);
        }
    }
}

fn unlock(job: &mut Job, now: DateTime<Utc>) {
    job.locked_at = None;
    job.locked_by = None;
    job.lock_expires_at = None;
    job.updated_at = now;
}

fn chrono_ms(d: Duration) -> ChronoDuration {
    ChronoDuration::milliseconds(i64::try_from(d.as_millis()).unwrap_or(i64::MAX / 2))
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn enqueue(&self, job: NewJob) -> anyhow::Result<EnqueueOutcome> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        Self::insert(&mut state, job, now)
    }

    async fn enqueue_bulk(&self, jobs: Vec<NewJob>) -> anyhow::Result<Vec<EnqueueOutcome>> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        jobs.into_iter()
            .map(|job| Self::insert(&mut state, job, now))
            .collect()
    }

    async fn lease(&self, req: &LeaseRequest) -> anyhow::Result<Vec<Job>> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let mut limit = req.limit;

        if let Some(rl) = req.rate_limiter {
            let window_start = now - chrono_ms(Duration::from_millis(rl.per_ms));
            let started = state
                .attempts
                .iter()
                .filter(|a| a.queue == req.queue && a.started_at > window_start)
                .count();
            limit = limit.min((rl.max as usize).saturating_sub(started));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut ready: Vec<&Job> = state
            .jobs
            .values()
            .filter(|j| j.queue == req.queue && j.status() == JobStatus::Queued && j.run_at <= now)
            .collect();
        ready.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.run_at.cmp(&b.run_at))
                .then(a.created_at.cmp(&b.created_at))
        });
        let picked: Vec<Uuid> = ready.into_iter().take(limit).map(|j| j.id).collect();

        let mut leased = Vec::with_capacity(picked.len());
        for id in picked {
            if let Some(job) = state.jobs.get_mut(&id) {
                job.status = JobStatus::Running.as_str().to_string();
                job.locked_by = Some(req.worker_id.clone());
                job.locked_at = Some(now);
                job.lock_expires_at = Some(now + chrono_ms(req.lock_duration));
                job.updated_at = now;
                leased.push(job.clone());
            }
            state.attempts.push(AttemptRow {
                job_id: id,
                queue: req.queue.clone(),
                started_at: now,
                finished_at: None,
            });
        }
        Ok(leased)
    }

    async fn extend_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lock_duration: Duration,
    ) -> anyhow::Result<bool> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        match Self::owned(&mut state, job_id, worker_id) {
            Some(job) => {
                job.lock_expires_at = Some(now + chrono_ms(lock_duration));
                job.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        retention: Retention,
    ) -> anyhow::Result<bool> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        if Self::owned(&mut state, job_id, worker_id).is_none() {
            return Ok(false);
        }
        Self::finish_attempt(&mut state, job_id, now);
        Self::finish(&mut state, job_id, JobStatus::Completed, retention, now);
        Ok(true)
    }

    async fn retry_later(
        &self,
        job_id: Uuid,
        worker_id: &str,
        delay: Duration,
        error_code: &str,
        error_message: &str,
    ) -> anyhow::Result<bool> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let Some(job) = Self::owned(&mut state, job_id, worker_id) else {
            return Ok(false);
        };
        job.status = JobStatus::Queued.as_str().to_string();
        job.run_at = now + chrono_ms(delay);
        job.attempts_made += 1;
        job.last_error_code = Some(error_code.to_string());
        job.last_error_message = Some(error_message.to_string());
        unlock(job, now);
        Self::finish_attempt(&mut state, job_id, now);
        Ok(true)
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error_code: &str,
        error_message: &str,
        retention: Retention,
    ) -> anyhow::Result<bool> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let Some(job) = Self::owned(&mut state, job_id, worker_id) else {
            return Ok(false);
        };
        job.attempts_made += 1;
        job.last_error_code = Some(error_code.to_string());
        job.last_error_message = Some(error_message.to_string());
        job.failed_reason = Some(error_message.to_string());
        Self::finish_attempt(&mut state, job_id, now);
        Self::finish(&mut state, job_id, JobStatus::Failed, retention, now);
        Ok(true)
    }

    async fn reap_stalled(
        &self,
        queue: &str,
        max_stalled_count: u32,
    ) -> anyhow::Result<StallReport> {
        let now = self.clock.now();
        let mut state = self.lock()?;

        let expired: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|j| {
                j.queue == queue
                    && j.status() == JobStatus::Running
                    && j.lock_expires_at.is_some_and(|at| at < now)
            })
            .map(|j| j.id)
            .collect();

        let mut report = StallReport::default();
        for id in expired {
            Self::finish_attempt(&mut state, id, now);
            let Some(job) = state.jobs.get_mut(&id) else {
                continue;
            };
            job.stalled_count += 1;
            job.last_error_code = Some("STALLED".into());
            job.last_error_message = Some("lease expired without renewal".into());
            unlock(job, now);

            if job.stalled_count as i64 > max_stalled_count as i64 {
                job.failed_reason = Some("job stalled more than allowable limit".into());
                job.status = JobStatus::Failed.as_str().to_string();
                let snapshot = job.clone();
                let retention = snapshot.options().remove_on_fail;
                Self::finish(&mut state, id, JobStatus::Failed, retention, now);
                report.failed.push(snapshot);
            } else {
                job.status = JobStatus::Queued.as_str().to_string();
                report.requeued.push(id);
            }
        }
        Ok(report)
    }

    async fn counts(&self, queue: &str) -> anyhow::Result<QueueCounts> {
        let now = self.clock.now();
        let state = self.lock()?;
        let mut counts = QueueCounts::default();
        for job in state.jobs.values().filter(|j| j.queue == queue) {
            match job.status() {
                JobStatus::Queued if job.run_at <= now => counts.waiting += 1,
                JobStatus::Queued => counts.delayed += 1,
                JobStatus::Running => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn get(&self, job_id: Uuid) -> anyhow::Result<Option<Job>> {
        Ok(self.lock()?.jobs.get(&job_id).cloned())
    }

    async fn purge_finished(&self, limit: i64) -> anyhow::Result<u64> {
        let now = self.clock.now();
        let mut state = self.lock()?;
        let doomed: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|j| {
                matches!(j.status(), JobStatus::Completed | JobStatus::Failed)
                    && j.keep_until.is_some_and(|at| at <= now)
            })
            .take(limit.max(0) as usize)
            .map(|j| j.id)
            .collect();
        for id in &doomed {
            state.jobs.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    async fn prune_attempts(&self, cutoff: DateTime<Utc>, limit: i64) -> anyhow::Result<u64> {
        let mut state = self.lock()?;
        let mut budget = limit.max(0) as usize;
        let before = state.attempts.len();
        state.attempts.retain(|a| {
            let old = a.finished_at.is_some_and(|at| at < cutoff);
            if old && budget > 0 {
                budget -= 1;
                false
            } else {
                true
            }
        });
        Ok((before - state.attempts.len()) as u64)
    }
}
