#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use crawlflow::catalogue::Catalogue;
use crawlflow::clock::ManualClock;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

/// Connects to `TEST_DATABASE_URL` and resets queue and run tables. `None`
/// when the variable is unset, so database tests skip on machines without
/// Postgres.
pub async fn setup_db() -> Option<PgPool> {
    let _ = dotenvy::dotenv();
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping");
        return None;
    };

    let pool = crawlflow::db::connect(&url, 10, Duration::from_secs(10))
        .await
        .expect("failed to connect to TEST_DATABASE_URL");
    crawlflow::db::run_migrations(&pool)
        .await
        .expect("migrations failed");

    sqlx::query("TRUNCATE TABLE job_attempts, jobs, crawl_runs, documents")
        .execute(&pool)
        .await
        .expect("truncate failed");

    Some(pool)
}

pub fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
}

pub fn manual_clock(y: i32, m: u32, d: u32) -> Arc<ManualClock> {
    Arc::new(ManualClock::new(at(y, m, d, 9)))
}

/// One offsets dataset against `base_url`: 100 items per page, keyed by
/// `user_address`.
pub fn holders_catalogue(base_url: &str) -> Catalogue {
    Catalogue::parse(&format!(
        r#"
[[queues]]
name = "holders"
concurrency = 3
lock_duration_ms = 30000
stalled_interval_ms = 1000

[[sources]]
name = "chain_api"
base_url = "{base_url}"
rate_limit_codes = ["40029"]

[[datasets]]
name = "top_holders"
source = "chain_api"
queue = "holders"
endpoint = "/v1/holders"
natural_key = "user_address"
delay_ms = 0
attempts = 2
backoff = {{ type = "fixed", base_ms = 10 }}
fan_out = {{ mode = "offsets", page_size = 100 }}

[datasets.params]
chain = "eth"
"#
    ))
    .expect("test catalogue is valid")
}
