use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ErrorClass, ErrorCode};
use crate::jobs::backend::QueueBackend;
use crate::jobs::model::{Job, LeaseRequest, WorkerPoolConfig};
use crate::jobs::registry::HandlerRegistry;
use crate::jobs::runner::{JobRunner, RunOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub code: String,
    pub class: ErrorClass,
    pub message: String,
}

impl JobFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code: code.as_str().to_string(),
            class: code.class(),
            message: message.into(),
        }
    }
}

/// Queue events. Only terminal failures reach `on_failed`.
#[async_trait]
pub trait QueueListener: Send + Sync {
    async fn on_completed(&self, _job: &Job) {}

    async fn on_failed(&self, _job: &Job, _failure: &JobFailure) {}

    /// Fired once each time the queue goes from busy to having no ready
    /// and no in-flight jobs, and once when the pool first finds it idle.
    async fn on_drained(&self, _queue: &str) {}
}

/// One queue's worker pool: leases up to `concurrency` jobs, runs them
/// through the registry, renews leases while they run and detects stalls.
pub struct WorkerPool<C> {
    queue: String,
    worker_id: String,
    config: WorkerPoolConfig,
    backend: Arc<dyn QueueBackend>,
    registry: Arc<HandlerRegistry<C>>,
    runner: JobRunner,
    ctx: C,
    listeners: Vec<Arc<dyn QueueListener>>,
    poll_interval: Duration,
}

impl<C: Clone + Send + Sync + 'static> WorkerPool<C> {
    pub fn new(
        queue: &str,
        worker_id: &str,
        config: WorkerPoolConfig,
        backend: Arc<dyn QueueBackend>,
        registry: Arc<HandlerRegistry<C>>,
        runner: JobRunner,
        ctx: C,
    ) -> Self {
        Self {
            queue: queue.to_string(),
            worker_id: worker_id.to_string(),
            config,
            backend,
            registry,
            runner,
            ctx,
            listeners: Vec::new(),
            poll_interval: Duration::from_millis(250),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn QueueListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_poll_interval(mut self, every: Duration) -> Self {
        self.poll_interval = every;
        self
    }

    /// Runs until `cancel` fires, then waits for in-flight jobs.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let pool = Arc::new(self);
        let concurrency = pool.config.concurrency.max(1);
        let mut in_flight = JoinSet::new();
        let mut stall_tick = tokio::time::interval(pool.config.stalled_interval());
        stall_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut idle = false;
        let mut wait = Duration::ZERO;

        info!(
            queue = %pool.queue,
            worker_id = %pool.worker_id,
            concurrency,
            lock_ms = pool.config.lock_duration_ms,
            "worker pool started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(queue = %pool.queue, error = %e, "job task panicked");
                    }
                    continue;
                }
                _ = stall_tick.tick() => {
                    pool.check_stalled().await;
                    continue;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            let free = concurrency.saturating_sub(in_flight.len());
            if free == 0 {
                wait = pool.poll_interval;
                continue;
            }

            let leased = match pool.backend.lease(&pool.lease_request(free)).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    warn!(queue = %pool.queue, error = %e, "lease failed");
                    wait = pool.poll_interval;
                    continue;
                }
            };

            if leased.is_empty() {
                if in_flight.is_empty() && !idle && !pool.has_ready_work().await {
                    idle = true;
                    pool.emit_drained().await;
                }
                wait = pool.poll_interval;
                continue;
            }

            idle = false;
            wait = Duration::ZERO;
            for job in leased {
                let pool = pool.clone();
                in_flight.spawn(async move { pool.process(job).await });
            }
        }

        info!(queue = %pool.queue, in_flight = in_flight.len(), "worker pool stopping");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(queue = %pool.queue, error = %e, "job task panicked");
            }
        }
        Ok(())
    }

    fn lease_request(&self, limit: usize) -> LeaseRequest {
        LeaseRequest {
            queue: self.queue.clone(),
            worker_id: self.worker_id.clone(),
            limit,
            lock_duration: self.config.lock_duration(),
            rate_limiter: self.config.rate_limiter,
        }
    }

    async fn process(&self, job: Job) {
        let start = Instant::now();
        debug!(
            queue = %job.queue,
            job = %job.display_key(),
            name = %job.name,
            attempt_no = job.attempts_made + 1,
            "leased job"
        );

        // the heartbeat stops on a lost lease; the handler keeps running
        let work = self.registry.dispatch(&job, &self.ctx);
        tokio::pin!(work);
        let heartbeat = self.heartbeat(job.id);
        tokio::pin!(heartbeat);
        let mut beating = true;

        let result = loop {
            tokio::select! {
                res = &mut work => break res,
                _ = &mut heartbeat, if beating => beating = false,
            }
        };

        let latency_ms = start.elapsed().as_millis() as u64;
        let outcome = match &result {
            Ok(()) => self.runner.on_success(&job, &self.worker_id).await,
            Err(err) => self.runner.on_failure(&job, &self.worker_id, err).await,
        };

        match (outcome, result) {
            (Ok(RunOutcome::Completed), _) => {
                debug!(queue = %job.queue, job = %job.display_key(), latency_ms, "job completed");
                for l in &self.listeners {
                    l.on_completed(&job).await;
                }
            }
            (Ok(RunOutcome::Failed), Err(err)) => {
                let failure = JobFailure::new(err.code(), err.to_string());
                for l in &self.listeners {
                    l.on_failed(&job, &failure).await;
                }
            }
            (Ok(RunOutcome::LeaseLost), _) => {
                warn!(
                    queue = %job.queue,
                    job = %job.display_key(),
                    latency_ms,
                    "lease lost before the job reported, result dropped"
                );
            }
            (Ok(_), _) => {}
            (Err(e), _) => {
                // the lease expires and the stall detector takes over
                error!(queue = %job.queue, job = %job.display_key(), error = %e, "recording job result failed");
            }
        }
    }

    /// Renews the lease every half lock duration. Returns once the lease is gone.
    async fn heartbeat(&self, job_id: Uuid) {
        let mut tick = tokio::time::interval(self.config.heartbeat_interval());
        tick.tick().await;
        loop {
            tick.tick().await;
            match self
                .backend
                .extend_lease(job_id, &self.worker_id, self.config.lock_duration())
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    warn!(queue = %self.queue, %job_id, "lease lost, heartbeat stopped");
                    return;
                }
                Err(e) => warn!(queue = %self.queue, %job_id, error = %e, "lease renewal failed"),
            }
        }
    }

    async fn check_stalled(&self) {
        let report = match self
            .backend
            .reap_stalled(&self.queue, self.config.max_stalled_count)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(queue = %self.queue, error = %e, "stall check failed");
                return;
            }
        };

        if !report.requeued.is_empty() {
            warn!(queue = %self.queue, count = report.requeued.len(), "stalled jobs returned to queue");
        }
        for job in &report.failed {
            warn!(
                queue = %self.queue,
                job = %job.display_key(),
                stalled_count = job.stalled_count,
                "job stalled too often, failed"
            );
            let failure = JobFailure::new(
                ErrorCode::Stalled,
                job.failed_reason.clone().unwrap_or_default(),
            );
            for l in &self.listeners {
                l.on_failed(job, &failure).await;
            }
        }
    }

    /// An empty lease only means "nothing ready" without a rate limiter;
    /// with one, the window may have throttled it while jobs still wait.
    async fn has_ready_work(&self) -> bool {
        if self.config.rate_limiter.is_none() {
            return false;
        }
        match self.backend.counts(&self.queue).await {
            Ok(c) => c.waiting > 0,
            Err(e) => {
                warn!(queue = %self.queue, error = %e, "count check failed, drained deferred");
                true
            }
        }
    }

    async fn emit_drained(&self) {
        debug!(queue = %self.queue, "queue drained");
        for l in &self.listeners {
            l.on_drained(&self.queue).await;
        }
    }
}
