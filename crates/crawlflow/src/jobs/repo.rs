// crates/crawlflow/src/jobs/repo.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use std::time::Duration;
use uuid::Uuid;

use crate::jobs::backend::QueueBackend;
use crate::jobs::model::{
    EnqueueOutcome, Job, JobStatus, LeaseRequest, NewJob, QueueCounts, Retention, StallReport,
};

const STALLED_REASON: &str = "job stalled more than allowable limit";

/// Postgres queue over `jobs` and `job_attempts`.
#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ----------------------------
    // Enqueue helpers
    // ----------------------------

    async fn insert_job(conn: &mut PgConnection, job: &NewJob) -> anyhow::Result<EnqueueOutcome> {
        let opts_json = serde_json::to_value(&job.opts)?;
        let delay_ms = i64::try_from(job.opts.delay_ms).unwrap_or(i64::MAX);

        // The conflict can disappear between the insert and the lookup when
        // the pending job finishes, so try again a couple of times.
        for _ in 0..3 {
            let inserted: Option<Uuid> = sqlx::query_scalar(
                r#"
                INSERT INTO jobs (
                    queue, name, job_key, payload_json, opts_json,
                    run_at, status, priority, max_attempts, replay_of_job_id
                )
                VALUES (
                    $1, $2, $3, $4, $5,
                    now() + ($6::bigint * interval '1 millisecond'), $7, $8, $9, $10
                )
                ON CONFLICT (queue, job_key)
                    WHERE job_key IS NOT NULL AND status IN ('queued', 'running')
                    DO NOTHING
                RETURNING id
                "#,
            )
            .bind(&job.queue)
            .bind(&job.name)
            .bind(job.opts.job_id.as_deref())
            .bind(&job.payload)
            .bind(&opts_json)
            .bind(delay_ms)
            .bind(JobStatus::Queued.as_str())
            .bind(job.opts.priority)
            .bind(job.opts.max_attempts())
            .bind(job.replay_of)
            .fetch_optional(&mut *conn)
            .await?;

            if let Some(id) = inserted {
                return Ok(EnqueueOutcome { id, created: true });
            }

            let existing: Option<Uuid> = sqlx::query_scalar(
                r#"
                SELECT id FROM jobs
                WHERE queue = $1 AND job_key = $2 AND status IN ('queued', 'running')
                "#,
            )
            .bind(&job.queue)
            .bind(job.opts.job_id.as_deref())
            .fetch_optional(&mut *conn)
            .await?;

            if let Some(id) = existing {
                return Ok(EnqueueOutcome { id, created: false });
            }
        }

        anyhow::bail!(
            "could not enqueue {}/{} key={:?}: key kept flipping",
            job.queue,
            job.name,
            job.opts.job_id
        )
    }

    async fn finish_attempts(
        conn: &mut PgConnection,
        job_id: Uuid,
        status: &str,
        error_code: Option<&str>,
        error_message: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE job_attempts
            SET status = $2,
                finished_at = now(),
                error_code = $3,
                error_message = $4
            WHERE job_id = $1 AND status = 'running'
            "#,
        )
        .bind(job_id)
        .bind(status)
        .bind(error_code)
        .bind(error_message)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn apply_failed_retention(conn: &mut PgConnection, job: &Job) -> anyhow::Result<()> {
        match job.options().remove_on_fail {
            Retention::Keep => {}
            Retention::Remove => {
                sqlx::query("DELETE FROM jobs WHERE id = $1")
                    .bind(job.id)
                    .execute(&mut *conn)
                    .await?;
            }
            Retention::KeepFor(d) => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET keep_until = now() + ($2::bigint * interval '1 millisecond')
                    WHERE id = $1
                    "#,
                )
                .bind(job.id)
                .bind(duration_ms(d))
                .execute(&mut *conn)
                .await?;
            }
        }
        Ok(())
    }
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn keep_for_ms(r: Retention) -> Option<i64> {
    match r {
        Retention::Keep => None,
        Retention::Remove => Some(0),
        Retention::KeepFor(d) => Some(duration_ms(d)),
    }
}

#[async_trait]
impl QueueBackend for PgQueue {
    async fn enqueue(&self, job: NewJob) -> anyhow::Result<EnqueueOutcome> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_job(&mut conn, &job).await
    }

    async fn enqueue_bulk(&self, jobs: Vec<NewJob>) -> anyhow::Result<Vec<EnqueueOutcome>> {
        let mut tx = self.pool.begin().await?;
        let mut out = Vec::with_capacity(jobs.len());
        for job in &jobs {
            out.push(Self::insert_job(&mut tx, job).await?);
        }
        tx.commit().await?;
        Ok(out)
    }

    // ----------------------------
    // Leasing + rate limiter
    // ----------------------------

    async fn lease(&self, req: &LeaseRequest) -> anyhow::Result<Vec<Job>> {
        let mut tx = self.pool.begin().await?;
        let mut limit = req.limit as i64;

        // 1) Shared rate limiter: attempts started in the window, counted
        //    under a per-queue lock so concurrent pools see each other.
        if let Some(rl) = req.rate_limiter {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(format!("crawlflow:lease:{}", req.queue))
                .execute(&mut *tx)
                .await?;

            let started_in_window: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*)
                FROM job_attempts
                WHERE queue = $1
                  AND started_at > now() - ($2::bigint * interval '1 millisecond')
                "#,
            )
            .bind(&req.queue)
            .bind(i64::try_from(rl.per_ms).unwrap_or(i64::MAX))
            .fetch_one(&mut *tx)
            .await?;

            limit = limit.min(rl.max as i64 - started_in_window);
        }

        if limit <= 0 {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        // 2) Pick and lease in one statement
        let mut leased = sqlx::query_as::<_, Job>(
            r#"
            WITH picked AS (
                SELECT id
                FROM jobs
                WHERE queue = $1
                  AND status = 'queued'
                  AND run_at <= now()
                ORDER BY priority DESC, run_at ASC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $2
            )
            UPDATE jobs j
            SET status = 'running',
                locked_by = $3,
                locked_at = now(),
                lock_expires_at = now() + ($4::bigint * interval '1 millisecond'),
                updated_at = now()
            FROM picked
            WHERE j.id = picked.id
            RETURNING j.*
            "#,
        )
        .bind(&req.queue)
        .bind(limit)
        .bind(&req.worker_id)
        .bind(duration_ms(req.lock_duration))
        .fetch_all(&mut *tx)
        .await?;

        // 3) Attempt audit rows, also what the rate limiter counts
        if !leased.is_empty() {
            let ids: Vec<Uuid> = leased.iter().map(|j| j.id).collect();
            sqlx::query(
                r#"
                INSERT INTO job_attempts (job_id, queue, attempt_no, worker_id)
                SELECT id, queue, attempts_made + stalled_count + 1, $2
                FROM jobs
                WHERE id = ANY($1)
                "#,
            )
            .bind(&ids)
            .bind(&req.worker_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        leased.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.run_at.cmp(&b.run_at))
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(leased)
    }

    async fn extend_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lock_duration: Duration,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET lock_expires_at = now() + ($3::bigint * interval '1 millisecond'),
                updated_at = now()
            WHERE id = $1
              AND status = 'running'
              AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(duration_ms(lock_duration))
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    // ----------------------------
    // State transitions
    // ----------------------------

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        retention: Retention,
    ) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;

        let res = if retention == Retention::Remove {
            sqlx::query("DELETE FROM jobs WHERE id = $1 AND status = 'running' AND locked_by = $2")
                .bind(job_id)
                .bind(worker_id)
                .execute(&mut *tx)
                .await?
        } else {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'completed',
                    finished_at = now(),
                    keep_until = CASE
                        WHEN $3::bigint IS NULL THEN NULL
                        ELSE now() + ($3::bigint * interval '1 millisecond')
                    END,
                    locked_at = NULL,
                    locked_by = NULL,
                    lock_expires_at = NULL,
                    updated_at = now()
                WHERE id = $1
                  AND status = 'running'
                  AND locked_by = $2
                "#,
            )
            .bind(job_id)
            .bind(worker_id)
            .bind(keep_for_ms(retention))
            .execute(&mut *tx)
            .await?
        };

        let owned = res.rows_affected() == 1;
        if owned {
            Self::finish_attempts(&mut tx, job_id, "completed", None, None).await?;
        }
        tx.commit().await?;
        Ok(owned)
    }

    async fn retry_later(
        &self,
        job_id: Uuid,
        worker_id: &str,
        delay: Duration,
        error_code: &str,
        error_message: &str,
    ) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;

        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued',
                run_at = now() + ($3::bigint * interval '1 millisecond'),
                attempts_made = attempts_made + 1,
                last_error_code = $4,
                last_error_message = $5,
                locked_at = NULL,
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            WHERE id = $1
              AND status = 'running'
              AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(duration_ms(delay))
        .bind(error_code)
        .bind(error_message)
        .execute(&mut *tx)
        .await?;

        let owned = res.rows_affected() == 1;
        if owned {
            Self::finish_attempts(&mut tx, job_id, "failed", Some(error_code), Some(error_message))
                .await?;
        }
        tx.commit().await?;
        Ok(owned)
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error_code: &str,
        error_message: &str,
        retention: Retention,
    ) -> anyhow::Result<bool> {
        let mut tx = self.pool.begin().await?;

        let res = if retention == Retention::Remove {
            sqlx::query("DELETE FROM jobs WHERE id = $1 AND status = 'running' AND locked_by = $2")
                .bind(job_id)
                .bind(worker_id)
                .execute(&mut *tx)
                .await?
        } else {
            sqlx::query(
                r#"
                UPDATE jobs
                SET status = 'failed',
                    attempts_made = attempts_made + 1,
                    last_error_code = $3,
                    last_error_message = $4,
                    failed_reason = $4,
                    finished_at = now(),
                    keep_until = CASE
                        WHEN $5::bigint IS NULL THEN NULL
                        ELSE now() + ($5::bigint * interval '1 millisecond')
                    END,
                    locked_at = NULL,
                    locked_by = NULL,
                    lock_expires_at = NULL,
                    updated_at = now()
                WHERE id = $1
                  AND status = 'running'
                  AND locked_by = $2
                "#,
            )
            .bind(job_id)
            .bind(worker_id)
            .bind(error_code)
            .bind(error_message)
            .bind(keep_for_ms(retention))
            .execute(&mut *tx)
            .await?
        };

        let owned = res.rows_affected() == 1;
        if owned {
            Self::finish_attempts(&mut tx, job_id, "failed", Some(error_code), Some(error_message))
                .await?;
        }
        tx.commit().await?;
        Ok(owned)
    }

    // ----------------------------
    // Stall detection
    // ----------------------------

    async fn reap_stalled(
        &self,
        queue: &str,
        max_stalled_count: u32,
    ) -> anyhow::Result<StallReport> {
        let mut tx = self.pool.begin().await?;
        let max_stalled = i32::try_from(max_stalled_count).unwrap_or(i32::MAX);

        // SET expressions see the pre-update row, so `stalled_count + 1` is
        // this stall's ordinal everywhere below.
        let reaped = sqlx::query_as::<_, Job>(
            r#"
            WITH expired AS (
                SELECT id
                FROM jobs
                WHERE queue = $1
                  AND status = 'running'
                  AND lock_expires_at IS NOT NULL
                  AND lock_expires_at < now()
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs j
            SET stalled_count = j.stalled_count + 1,
                status = CASE WHEN j.stalled_count + 1 > $2 THEN 'failed' ELSE 'queued' END,
                failed_reason = CASE WHEN j.stalled_count + 1 > $2 THEN $3 ELSE j.failed_reason END,
                finished_at = CASE WHEN j.stalled_count + 1 > $2 THEN now() ELSE NULL END,
                last_error_code = 'STALLED',
                last_error_message = 'lease expired without renewal',
                locked_at = NULL,
                locked_by = NULL,
                lock_expires_at = NULL,
                updated_at = now()
            FROM expired
            WHERE j.id = expired.id
            RETURNING j.*
            "#,
        )
        .bind(queue)
        .bind(max_stalled)
        .bind(STALLED_REASON)
        .fetch_all(&mut *tx)
        .await?;

        if reaped.is_empty() {
            tx.commit().await?;
            return Ok(StallReport::default());
        }

        let ids: Vec<Uuid> = reaped.iter().map(|j| j.id).collect();
        sqlx::query(
            r#"
            UPDATE job_attempts
            SET status = 'stalled',
                finished_at = now(),
                error_code = 'STALLED'
            WHERE job_id = ANY($1) AND status = 'running'
            "#,
        )
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

        let mut report = StallReport::default();
        for job in reaped {
            if job.status() == JobStatus::Failed {
                Self::apply_failed_retention(&mut tx, &job).await?;
                report.failed.push(job);
            } else {
                report.requeued.push(job.id);
            }
        }

        tx.commit().await?;
        Ok(report)
    }

    // ----------------------------
    // Reads
    // ----------------------------

    async fn counts(&self, queue: &str) -> anyhow::Result<QueueCounts> {
        let (waiting, delayed, active, completed, failed) =
            sqlx::query_as::<_, (i64, i64, i64, i64, i64)>(
                r#"
                SELECT
                    COUNT(*) FILTER (WHERE status = 'queued' AND run_at <= now()),
                    COUNT(*) FILTER (WHERE status = 'queued' AND run_at > now()),
                    COUNT(*) FILTER (WHERE status = 'running'),
                    COUNT(*) FILTER (WHERE status = 'completed'),
                    COUNT(*) FILTER (WHERE status = 'failed')
                FROM jobs
                WHERE queue = $1
                "#,
            )
            .bind(queue)
            .fetch_one(&self.pool)
            .await?;

        Ok(QueueCounts {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }

    async fn get(&self, job_id: Uuid) -> anyhow::Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(job)
    }

    // ----------------------------
    // Maintenance
    // ----------------------------

    async fn purge_finished(&self, limit: i64) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE id IN (
                SELECT id
                FROM jobs
                WHERE status IN ('completed', 'failed')
                  AND keep_until IS NOT NULL
                  AND keep_until <= now()
                ORDER BY keep_until ASC
                LIMIT $1
            )
            "#,
        )
        .bind(limit)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn prune_attempts(&self, cutoff: DateTime<Utc>, limit: i64) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
            DELETE FROM job_attempts
            WHERE id IN (
                SELECT id
                FROM job_attempts
                WHERE finished_at IS NOT NULL
                  AND finished_at < $1
                ORDER BY finished_at ASC
                LIMIT $2
            )
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }
}
