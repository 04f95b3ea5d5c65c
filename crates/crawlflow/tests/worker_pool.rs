mod common;

use common::manual_clock;

use crawlflow::cache::MemoryCache;
use crawlflow::error::CrawlError;
use crawlflow::jobs::{
    boxed, FailureRecorder, HandlerRegistry, JobOptions, JobRunner, JobStatus, MemoryQueue,
    QueueBackend, QueueListener, QueueProducer, RateLimiterConfig, WorkerPool, WorkerPoolConfig,
};
use crawlflow::notify::Notifier;
use serde_json::json;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn a_terminal_failure_is_replayed_once_the_queue_drains() {
    let clock = manual_clock(2024, 3, 1);
    let queue = Arc::new(MemoryQueue::new(clock.clone()));
    let cache = Arc::new(MemoryCache::new(clock.clone()));
    let backend: Arc<dyn QueueBackend> = queue.clone();

    // fails terminally on the first call, succeeds afterwards
    let calls = Arc::new(AtomicU32::new(0));
    let mut registry: HandlerRegistry<Arc<AtomicU32>> = HandlerRegistry::new();
    registry.register("flaky", |_, calls| {
        boxed(async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(CrawlError::DataShape("first call".into()))
            } else {
                Ok(())
            }
        })
    });

    QueueProducer::new(backend.clone())
        .add_job(
            "holders",
            "flaky",
            json!({}),
            JobOptions::default().with_job_id("top_holders:page:2024030101:0"),
        )
        .await
        .unwrap();

    let recorder: Arc<dyn QueueListener> =
        Arc::new(FailureRecorder::new(cache.clone(), backend.clone()));
    let pool = WorkerPool::new(
        "holders",
        "w1",
        WorkerPoolConfig::default(),
        backend.clone(),
        Arc::new(registry),
        JobRunner::new(backend.clone(), Notifier::disabled()),
        calls.clone(),
    )
    .with_listener(recorder)
    .with_poll_interval(Duration::from_millis(5));

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(pool.run(cancel.clone()));

    let mut counts = queue.counts("holders").await.unwrap();
    for _ in 0..500 {
        if counts.completed >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        counts = queue.counts("holders").await.unwrap();
    }
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(counts.failed, 1);
    assert_eq!(counts.completed, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let jobs = queue.jobs("holders").unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs
        .iter()
        .all(|j| j.job_key.as_deref() == Some("top_holders:page:2024030101:0")));

    let failed = jobs.iter().find(|j| j.status == JobStatus::Failed.as_str()).unwrap();
    let replay = jobs.iter().find(|j| j.status == JobStatus::Completed.as_str()).unwrap();
    assert_eq!(failed.replay_of_job_id, None);
    assert_eq!(replay.replay_of_job_id, Some(failed.id));
}

#[tokio::test]
async fn a_bad_payload_is_not_replayed() {
    let clock = manual_clock(2024, 3, 1);
    let queue = Arc::new(MemoryQueue::new(clock.clone()));
    let cache = Arc::new(MemoryCache::new(clock.clone()));
    let backend: Arc<dyn QueueBackend> = queue.clone();

    let calls = Arc::new(AtomicU32::new(0));
    let mut registry: HandlerRegistry<Arc<AtomicU32>> = HandlerRegistry::new();
    registry.register("broken", |_, calls| {
        boxed(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CrawlError::BadPayload("missing dataset".into()))
        })
    });

    QueueProducer::new(backend.clone())
        .add_job("holders", "broken", json!({}), JobOptions::default())
        .await
        .unwrap();

    let recorder = Arc::new(FailureRecorder::new(cache.clone(), backend.clone()));
    let pool = WorkerPool::new(
        "holders",
        "w1",
        WorkerPoolConfig::default(),
        backend.clone(),
        Arc::new(registry),
        JobRunner::new(backend.clone(), Notifier::disabled()),
        calls.clone(),
    )
    .with_listener(recorder.clone() as Arc<dyn QueueListener>)
    .with_poll_interval(Duration::from_millis(5));

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(pool.run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(300)).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(queue.jobs("holders").unwrap().len(), 1);
    assert_eq!(queue.counts("holders").await.unwrap().failed, 1);
    assert!(recorder.pending("holders").await.unwrap().is_empty());
}

#[derive(Default)]
struct DrainCounter(AtomicUsize);

#[async_trait]
impl QueueListener for DrainCounter {
    async fn on_drained(&self, _queue: &str) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn a_throttled_queue_is_not_reported_as_drained() {
    let clock = manual_clock(2024, 3, 1);
    let queue = Arc::new(MemoryQueue::new(clock.clone()));
    let backend: Arc<dyn QueueBackend> = queue.clone();

    let calls = Arc::new(AtomicU32::new(0));
    let mut registry: HandlerRegistry<Arc<AtomicU32>> = HandlerRegistry::new();
    registry.register("page", |_, calls| {
        boxed(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    });

    let producer = QueueProducer::new(backend.clone());
    for page in 0..3 {
        producer
            .add_job("holders", "page", json!({ "page": page }), JobOptions::default())
            .await
            .unwrap();
    }

    // the clock never moves, so the window stays full after the first start
    let config = WorkerPoolConfig {
        concurrency: 3,
        rate_limiter: Some(RateLimiterConfig {
            max: 1,
            per_ms: 60_000,
        }),
        ..WorkerPoolConfig::default()
    };
    let drained = Arc::new(DrainCounter::default());
    let pool = WorkerPool::new(
        "holders",
        "w1",
        config,
        backend.clone(),
        Arc::new(registry),
        JobRunner::new(backend.clone(), Notifier::disabled()),
        calls.clone(),
    )
    .with_listener(drained.clone() as Arc<dyn QueueListener>)
    .with_poll_interval(Duration::from_millis(5));

    let cancel = CancellationToken::new();
    let handle = tokio::spawn(pool.run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();
    handle.await.unwrap().unwrap();

    let counts = queue.counts("holders").await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.waiting, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(drained.0.load(Ordering::SeqCst), 0);
}
