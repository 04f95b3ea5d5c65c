mod common;

use common::{holders_catalogue, manual_clock};

use chrono::Duration as ChronoDuration;
use crawlflow::clock::Clock;
use crawlflow::context::AppContext;
use crawlflow::crawl::build_registry;
use crawlflow::jobs::{JobOptions, LeaseRequest, NewJob, QueueBackend, Retention};
use crawlflow::planner::MAINTAIN_JOB;
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn maintain_rolls_partitions_forward_and_purges_finished_jobs() {
    let clock = manual_clock(2024, 3, 1);
    let (ctx, parts) =
        AppContext::in_memory(holders_catalogue("http://127.0.0.1:9"), clock.clone()).unwrap();
    let registry = build_registry();

    let maintain = parts
        .queue
        .enqueue(NewJob::new("holders", MAINTAIN_JOB, json!({}), JobOptions::default()))
        .await
        .unwrap();
    let maintain = parts.queue.get(maintain.id).await.unwrap().unwrap();

    registry.dispatch(&maintain, &ctx).await.unwrap();
    let first_window = parts.sink.partition_dates("top_holders");
    assert_eq!(first_window.len(), 3, "today plus two days ahead");

    // a finished job kept for one hour
    let done = parts
        .queue
        .enqueue(NewJob::new("holders", "page", json!({}), JobOptions::default()))
        .await
        .unwrap()
        .id;
    parts
        .queue
        .lease(&LeaseRequest {
            queue: "holders".into(),
            worker_id: "w1".into(),
            limit: 10,
            lock_duration: Duration::from_secs(30),
            rate_limiter: None,
        })
        .await
        .unwrap();
    parts
        .queue
        .complete(done, "w1", Retention::KeepFor(Duration::from_secs(3600)))
        .await
        .unwrap();

    clock.advance(ChronoDuration::days(20));
    registry.dispatch(&maintain, &ctx).await.unwrap();

    let today = clock.today();
    let dates = parts.sink.partition_dates("top_holders");
    assert!(dates.iter().all(|d| *d >= today - ChronoDuration::days(14)), "{dates:?}");
    assert!(dates.contains(&today));
    assert!(dates.contains(&(today + ChronoDuration::days(2))));
    assert!(first_window.iter().all(|d| !dates.contains(d)));

    assert!(parts.queue.get(done).await.unwrap().is_none());
}
