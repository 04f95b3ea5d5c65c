use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::clock::Clock;
use crate::crawl_id::CrawlId;
use crate::error::{CrawlError, Result};

/// Durable record of crawl ids already handed out, per dataset.
#[async_trait]
pub trait CrawlIdStore: Send + Sync {
    async fn max_crawl_id(&self, dataset: &str) -> anyhow::Result<Option<CrawlId>>;
    async fn record(&self, dataset: &str, id: CrawlId) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct PgCrawlIdStore {
    pool: PgPool,
}

impl PgCrawlIdStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CrawlIdStore for PgCrawlIdStore {
    async fn max_crawl_id(&self, dataset: &str) -> anyhow::Result<Option<CrawlId>> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(crawl_id) FROM crawl_runs WHERE dataset = $1")
                .bind(dataset)
                .fetch_one(&self.pool)
                .await?;

        Ok(max.map(CrawlId::from_i64).transpose()?)
    }

    async fn record(&self, dataset: &str, id: CrawlId) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO crawl_runs (dataset, crawl_id)
            VALUES ($1, $2)
            ON CONFLICT (dataset, crawl_id) DO NOTHING
            "#,
        )
        .bind(dataset)
        .bind(id.as_i64())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryCrawlIdStore {
    runs: Mutex<HashMap<String, BTreeSet<CrawlId>>>,
}

impl MemoryCrawlIdStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CrawlIdStore for MemoryCrawlIdStore {
    async fn max_crawl_id(&self, dataset: &str) -> anyhow::Result<Option<CrawlId>> {
        let runs = self
            .runs
            .lock()
            .map_err(|_| anyhow::anyhow!("crawl id store poisoned"))?;
        Ok(runs.get(dataset).and_then(|ids| ids.last().copied()))
    }

    async fn record(&self, dataset: &str, id: CrawlId) -> anyhow::Result<()> {
        let mut runs = self
            .runs
            .lock()
            .map_err(|_| anyhow::anyhow!("crawl id store poisoned"))?;
        runs.entry(dataset.to_string()).or_default().insert(id);
        Ok(())
    }
}

/// Hands out per-dataset crawl ids derived from the durable maximum.
///
/// Read-max-then-record is not isolated: two callers racing on the same
/// dataset and day can both receive the same id. Sink upserts absorb that.
#[derive(Clone)]
pub struct Sequencer {
    store: Arc<dyn CrawlIdStore>,
    clock: Arc<dyn Clock>,
}

impl Sequencer {
    pub fn new(store: Arc<dyn CrawlIdStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn next_crawl_id(&self, dataset: &str) -> Result<CrawlId> {
        let today = self.clock.today();
        let current = self.store.max_crawl_id(dataset).await?;

        let next = match current {
            Some(max) => max
                .next_for(today)
                .map_err(|e| CrawlError::Config(e.to_string()))?,
            None => CrawlId::first_of(today),
        };

        self.store.record(dataset, next).await?;
        debug!(dataset, crawl_id = %next, "allocated crawl id");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone, Utc};

    fn sequencer() -> (Sequencer, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 14, 8, 0, 0).unwrap(),
        ));
        let seq = Sequencer::new(Arc::new(MemoryCrawlIdStore::new()), clock.clone());
        (seq, clock)
    }

    #[tokio::test]
    async fn first_run_of_the_day_gets_sequence_one() {
        let (seq, _) = sequencer();
        let id = seq.next_crawl_id("whales").await.unwrap();
        assert_eq!(id.to_string(), "2026101401");
    }

    #[tokio::test]
    async fn same_day_runs_increment_by_one() {
        let (seq, _) = sequencer();
        let mut prev = seq.next_crawl_id("whales").await.unwrap();
        for _ in 0..5 {
            let next = seq.next_crawl_id("whales").await.unwrap();
            assert_eq!(next.date(), prev.date());
            assert_eq!(next.sequence(), prev.sequence() + 1);
            prev = next;
        }
    }

    #[tokio::test]
    async fn ids_are_strictly_increasing_across_days() {
        let (seq, clock) = sequencer();
        let mut seen = Vec::new();
        for step in 0..12 {
            if step % 3 == 0 {
                clock.advance(Duration::days(1));
            }
            seen.push(seq.next_crawl_id("top_holders").await.unwrap());
        }
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "{seen:?}");
        assert_eq!(seen[3].sequence(), 1, "new day restarts the sequence");
    }

    #[tokio::test]
    async fn datasets_have_independent_sequences() {
        let (seq, _) = sequencer();
        seq.next_crawl_id("whales").await.unwrap();
        seq.next_crawl_id("whales").await.unwrap();
        let other = seq.next_crawl_id("social_ranking").await.unwrap();
        assert_eq!(other.sequence(), 1);
    }

    #[tokio::test]
    async fn sequence_survives_a_new_sequencer_over_the_same_store() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 14, 8, 0, 0).unwrap(),
        ));
        let store: Arc<dyn CrawlIdStore> = Arc::new(MemoryCrawlIdStore::new());

        let first = Sequencer::new(store.clone(), clock.clone());
        first.next_crawl_id("whales").await.unwrap();

        // a restarted process builds a fresh sequencer
        let restarted = Sequencer::new(store, clock);
        let id = restarted.next_crawl_id("whales").await.unwrap();
        assert_eq!(id.sequence(), 2);
    }

    /// Yields between reading the maximum and returning it, so a second
    /// caller can read the same maximum.
    struct YieldingStore(MemoryCrawlIdStore);

    #[async_trait]
    impl CrawlIdStore for YieldingStore {
        async fn max_crawl_id(&self, dataset: &str) -> anyhow::Result<Option<CrawlId>> {
            let max = self.0.max_crawl_id(dataset).await;
            tokio::task::yield_now().await;
            max
        }

        async fn record(&self, dataset: &str, id: CrawlId) -> anyhow::Result<()> {
            self.0.record(dataset, id).await
        }
    }

    #[tokio::test]
    async fn racing_callers_may_share_an_id() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 14, 8, 0, 0).unwrap(),
        ));
        let seq = Sequencer::new(Arc::new(YieldingStore(MemoryCrawlIdStore::new())), clock);

        let (a, b) = tokio::join!(seq.next_crawl_id("whales"), seq.next_crawl_id("whales"));
        assert_eq!(a.unwrap(), b.unwrap());

        // the next caller still moves past the shared id
        let next = seq.next_crawl_id("whales").await.unwrap();
        assert_eq!(next.sequence(), 2);
    }
}
