use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::KvCache;
use crate::clock::Clock;
use crate::crawl_id::date_tag;
use crate::error::Result;
use crate::jobs::model::JobOptions;
use crate::jobs::producer::QueueProducer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Every(Duration),
    /// Once per UTC calendar day.
    Daily,
}

#[derive(Debug, Clone)]
pub struct RepeatSpec {
    pub queue: String,
    pub name: String,
    pub payload: Value,
    pub opts: JobOptions,
    pub key_prefix: String,
    pub cadence: Cadence,
}

impl RepeatSpec {
    /// Job key for the slot containing `now`: `{prefix}:{slot}` for fixed
    /// intervals, `{prefix}:{YYYYMMDD}` for daily jobs.
    pub fn slot_key(&self, now: DateTime<Utc>) -> String {
        match self.cadence {
            Cadence::Every(every) => {
                let every = every.as_secs().max(1) as i64;
                format!("{}:{}", self.key_prefix, now.timestamp().div_euclid(every))
            }
            Cadence::Daily => format!("{}:{}", self.key_prefix, date_tag(now.date_naive())),
        }
    }

    fn claim_ttl(&self) -> Duration {
        match self.cadence {
            Cadence::Every(every) => every.max(Duration::from_secs(1)) * 2,
            Cadence::Daily => Duration::from_secs(2 * 24 * 3600),
        }
    }
}

/// Enqueues one job per slot per spec. A cache claim on the slot key keeps
/// several processes ticking the same schedule from running a slot twice.
pub struct RepeatScheduler {
    producer: QueueProducer,
    cache: Arc<dyn KvCache>,
    clock: Arc<dyn Clock>,
    specs: Vec<RepeatSpec>,
    last_slot: HashMap<String, String>,
}

impl RepeatScheduler {
    pub fn new(
        producer: QueueProducer,
        cache: Arc<dyn KvCache>,
        clock: Arc<dyn Clock>,
        specs: Vec<RepeatSpec>,
    ) -> Self {
        Self {
            producer,
            cache,
            clock,
            specs,
            last_slot: HashMap::new(),
        }
    }

    pub fn specs(&self) -> &[RepeatSpec] {
        &self.specs
    }

    /// Returns the keys enqueued by this tick.
    pub async fn tick(&mut self) -> Result<Vec<String>> {
        let now = self.clock.now();
        let mut enqueued = Vec::new();

        for spec in &self.specs {
            let key = spec.slot_key(now);
            if self.last_slot.get(&spec.key_prefix) == Some(&key) {
                continue;
            }

            let claim = format!("repeat:{key}");
            let claimed = self
                .cache
                .set_if_absent(&claim, "1", spec.claim_ttl())
                .await?;
            if claimed {
                let opts = spec.opts.clone().with_job_id(key.clone());
                if let Err(e) = self
                    .producer
                    .add_job(&spec.queue, &spec.name, spec.payload.clone(), opts)
                    .await
                {
                    // release the slot so the next tick tries again
                    if let Err(release) = self.cache.del(&claim).await {
                        warn!(%key, error = %release, "repeat slot claim not released");
                    }
                    return Err(e);
                }
                info!(queue = %spec.queue, name = %spec.name, %key, "repeat job enqueued");
                enqueued.push(key.clone());
            }
            self.last_slot.insert(spec.key_prefix.clone(), key);
        }

        Ok(enqueued)
    }

    pub async fn run(mut self, every: Duration, cancel: CancellationToken) -> anyhow::Result<()> {
        let mut tick = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tick.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "repeat tick failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::clock::ManualClock;
    use crate::jobs::backend::QueueBackend;
    use crate::jobs::memory::MemoryQueue;
    use crate::jobs::model::{EnqueueOutcome, Job, LeaseRequest, NewJob, QueueCounts, Retention, StallReport};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use uuid::Uuid;

    fn spec(cadence: Cadence, prefix: &str) -> RepeatSpec {
        RepeatSpec {
            queue: "crawl".into(),
            name: "plan".into(),
            payload: json!({ "dataset": "whales" }),
            opts: JobOptions::default(),
            key_prefix: prefix.into(),
            cadence,
        }
    }

    #[test]
    fn slot_keys_follow_the_cadence() {
        let now = Utc.with_ymd_and_hms(2026, 10, 14, 0, 10, 0).unwrap();
        let hourly = spec(Cadence::Every(Duration::from_secs(3600)), "whales:plan");
        assert_eq!(
            hourly.slot_key(now),
            format!("whales:plan:{}", now.timestamp() / 3600)
        );
        let daily = spec(Cadence::Daily, "maintenance");
        assert_eq!(daily.slot_key(now), "maintenance:20261014");
    }

    #[tokio::test]
    async fn two_schedulers_enqueue_one_job_per_slot() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 14, 0, 0, 0).unwrap(),
        ));
        let queue = Arc::new(MemoryQueue::new(clock.clone()));
        let cache: Arc<dyn KvCache> = Arc::new(MemoryCache::new(clock.clone()));
        let producer = QueueProducer::new(queue.clone());
        let specs = vec![spec(Cadence::Every(Duration::from_secs(600)), "whales:plan")];

        let mut a = RepeatScheduler::new(producer.clone(), cache.clone(), clock.clone(), specs.clone());
        let mut b = RepeatScheduler::new(producer, cache, clock.clone(), specs);

        assert_eq!(a.tick().await.unwrap().len(), 1);
        assert!(b.tick().await.unwrap().is_empty());
        assert!(a.tick().await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(600));
        assert_eq!(b.tick().await.unwrap().len(), 1);
        assert!(a.tick().await.unwrap().is_empty());

        assert_eq!(queue.counts("crawl").await.unwrap().waiting, 2);
    }

    /// Memory queue whose enqueues fail while `down` is set.
    struct FlakyQueue {
        inner: MemoryQueue,
        down: AtomicBool,
    }

    #[async_trait]
    impl QueueBackend for FlakyQueue {
        async fn enqueue(&self, job: NewJob) -> anyhow::Result<EnqueueOutcome> {
            if self.down.load(Ordering::SeqCst) {
                anyhow::bail!("database unavailable");
            }
            self.inner.enqueue(job).await
        }
        async fn enqueue_bulk(&self, jobs: Vec<NewJob>) -> anyhow::Result<Vec<EnqueueOutcome>> {
            self.inner.enqueue_bulk(jobs).await
        }
        async fn lease(&self, req: &LeaseRequest) -> anyhow::Result<Vec<Job>> {
            self.inner.lease(req).await
        }
        async fn extend_lease(&self, id: Uuid, worker: &str, d: Duration) -> anyhow::Result<bool> {
            self.inner.extend_lease(id, worker, d).await
        }
        async fn complete(&self, id: Uuid, worker: &str, r: Retention) -> anyhow::Result<bool> {
            self.inner.complete(id, worker, r).await
        }
        async fn retry_later(
            &self,
            id: Uuid,
            worker: &str,
            delay: Duration,
            code: &str,
            message: &str,
        ) -> anyhow::Result<bool> {
            self.inner.retry_later(id, worker, delay, code, message).await
        }
        async fn fail(
            &self,
            id: Uuid,
            worker: &str,
            code: &str,
            message: &str,
            r: Retention,
        ) -> anyhow::Result<bool> {
            self.inner.fail(id, worker, code, message, r).await
        }
        async fn reap_stalled(&self, queue: &str, max: u32) -> anyhow::Result<StallReport> {
            self.inner.reap_stalled(queue, max).await
        }
        async fn counts(&self, queue: &str) -> anyhow::Result<QueueCounts> {
            self.inner.counts(queue).await
        }
        async fn get(&self, id: Uuid) -> anyhow::Result<Option<Job>> {
            self.inner.get(id).await
        }
        async fn purge_finished(&self, limit: i64) -> anyhow::Result<u64> {
            self.inner.purge_finished(limit).await
        }
        async fn prune_attempts(&self, cutoff: DateTime<Utc>, limit: i64) -> anyhow::Result<u64> {
            self.inner.prune_attempts(cutoff, limit).await
        }
    }

    #[tokio::test]
    async fn a_failed_enqueue_leaves_the_slot_open() {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 14, 0, 0, 0).unwrap(),
        ));
        let queue = Arc::new(FlakyQueue {
            inner: MemoryQueue::new(clock.clone()),
            down: AtomicBool::new(true),
        });
        let cache: Arc<dyn KvCache> = Arc::new(MemoryCache::new(clock.clone()));
        let specs = vec![spec(Cadence::Every(Duration::from_secs(600)), "whales:plan")];
        let mut scheduler =
            RepeatScheduler::new(QueueProducer::new(queue.clone()), cache, clock.clone(), specs);

        assert!(scheduler.tick().await.is_err());

        // same slot, database back
        queue.down.store(false, Ordering::SeqCst);
        assert_eq!(scheduler.tick().await.unwrap().len(), 1);
        assert_eq!(queue.counts("crawl").await.unwrap().waiting, 1);
    }
}
