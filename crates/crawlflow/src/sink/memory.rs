use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::partitions::{date_partition, retention_cutoff};
use super::{dedup_last, Document, SnapshotRow, SnapshotSink};
use crate::catalogue::DocumentTarget;
use crate::clock::Clock;
use crate::crawl_id::CrawlId;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub data: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

type RowKey = (NaiveDate, CrawlId, String);
type DocKey = (String, String, String, CrawlId);

#[derive(Default)]
struct State {
    tables: BTreeMap<String, BTreeMap<RowKey, StoredRow>>,
    partitions: BTreeMap<String, BTreeSet<NaiveDate>>,
    documents: BTreeMap<DocKey, StoredRow>,
}

/// Sink kept in process memory, with the same upsert and retention rules
/// as the Postgres one.
pub struct MemorySink {
    clock: Arc<dyn Clock>,
    state: Mutex<State>,
}

impl MemorySink {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, BTreeMap::len)
    }

    /// Distinct natural keys stored for one run.
    pub fn keys_for(&self, table: &str, crawl_id: CrawlId) -> Vec<String> {
        self.lock()
            .tables
            .get(table)
            .map(|rows| {
                rows.keys()
                    .filter(|(_, id, _)| *id == crawl_id)
                    .map(|(_, _, k)| k.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn row(&self, table: &str, crawl_id: CrawlId, key: &str) -> Option<StoredRow> {
        self.lock()
            .tables
            .get(table)?
            .get(&(crawl_id.date(), crawl_id, key.to_string()))
            .cloned()
    }

    pub fn partition_dates(&self, table: &str) -> Vec<NaiveDate> {
        self.lock()
            .partitions
            .get(table)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn document(
        &self,
        target: &DocumentTarget,
        natural_id: &str,
        crawl_id: CrawlId,
    ) -> Option<StoredRow> {
        self.lock()
            .documents
            .get(&(
                target.database.clone(),
                target.collection.clone(),
                natural_id.to_string(),
                crawl_id,
            ))
            .cloned()
    }

    pub fn document_count(&self) -> usize {
        self.lock().documents.len()
    }
}

fn upsert_into<K: Ord>(map: &mut BTreeMap<K, StoredRow>, key: K, data: &Value, now: DateTime<Utc>) {
    map.entry(key)
        .and_modify(|row| {
            row.data = data.clone();
            row.updated_at = now;
        })
        .or_insert_with(|| StoredRow {
            data: data.clone(),
            created_at: now,
            updated_at: now,
        });
}

#[async_trait]
impl SnapshotSink for MemorySink {
    async fn ensure_partitions(&self, table: &str, dates: &[NaiveDate]) -> Result<()> {
        let mut st = self.lock();
        st.tables.entry(table.to_string()).or_default();
        st.partitions
            .entry(table.to_string())
            .or_default()
            .extend(dates.iter().copied());
        Ok(())
    }

    async fn upsert_rows(&self, table: &str, rows: &[SnapshotRow]) -> Result<u64> {
        let now = self.clock.now();
        let rows = dedup_last(rows, |r| (r.natural_key.clone(), r.crawl_id));

        let mut st = self.lock();
        st.partitions
            .entry(table.to_string())
            .or_default()
            .extend(rows.iter().map(|r| r.crawl_date()));
        let target = st.tables.entry(table.to_string()).or_default();
        for row in &rows {
            upsert_into(
                target,
                (row.crawl_date(), row.crawl_id, row.natural_key.clone()),
                &row.data,
                now,
            );
        }
        Ok(rows.len() as u64)
    }

    async fn drop_stale(
        &self,
        table: &str,
        today: NaiveDate,
        retention_days: u32,
    ) -> Result<Vec<String>> {
        let cutoff = retention_cutoff(today, retention_days);
        let mut st = self.lock();

        let stale: Vec<NaiveDate> = st
            .partitions
            .get(table)
            .map(|s| s.iter().copied().filter(|d| *d < cutoff).collect())
            .unwrap_or_default();

        if let Some(dates) = st.partitions.get_mut(table) {
            dates.retain(|d| *d >= cutoff);
        }
        if let Some(rows) = st.tables.get_mut(table) {
            rows.retain(|(d, _, _), _| *d >= cutoff);
        }

        Ok(stale.into_iter().map(|d| date_partition(table, d)).collect())
    }

    async fn upsert_documents(&self, target: &DocumentTarget, docs: &[Document]) -> Result<u64> {
        let now = self.clock.now();
        let docs = dedup_last(docs, |d| (d.natural_id.clone(), d.crawl_id));

        let mut st = self.lock();
        for doc in &docs {
            upsert_into(
                &mut st.documents,
                (
                    target.database.clone(),
                    target.collection.clone(),
                    doc.natural_id.clone(),
                    doc.crawl_id,
                ),
                &doc.body,
                now,
            );
        }
        Ok(docs.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use serde_json::json;

    fn setup() -> (MemorySink, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
        ));
        (MemorySink::new(clock.clone()), clock)
    }

    fn rows(id: CrawlId, keys: &[&str]) -> Vec<SnapshotRow> {
        keys.iter()
            .map(|k| SnapshotRow {
                natural_key: k.to_string(),
                crawl_id: id,
                data: json!({ "user_address": k }),
            })
            .collect()
    }

    #[tokio::test]
    async fn same_batch_twice_keeps_one_row_and_bumps_updated_at() {
        let (sink, clock) = setup();
        let id: CrawlId = "2024030101".parse().unwrap();
        let batch = rows(id, &["0xa", "0xb"]);

        sink.upsert_rows("whales", &batch).await.unwrap();
        let first = sink.row("whales", id, "0xa").unwrap();

        clock.advance(chrono::Duration::minutes(5));
        sink.upsert_rows("whales", &batch).await.unwrap();
        let second = sink.row("whales", id, "0xa").unwrap();

        assert_eq!(sink.row_count("whales"), 2);
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);
    }

    #[tokio::test]
    async fn stale_days_are_dropped_whole() {
        let (sink, _clock) = setup();
        let old: CrawlId = "2024020101".parse().unwrap();
        let recent: CrawlId = "2024022901".parse().unwrap();
        sink.upsert_rows("whales", &rows(old, &["0xa"])).await.unwrap();
        sink.upsert_rows("whales", &rows(recent, &["0xa"])).await.unwrap();

        let today = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let dropped = sink.drop_stale("whales", today, 14).await.unwrap();

        assert_eq!(dropped, vec!["whales-20240201"]);
        assert_eq!(sink.keys_for("whales", old), Vec::<String>::new());
        assert_eq!(sink.keys_for("whales", recent), vec!["0xa"]);
    }

    #[tokio::test]
    async fn documents_are_keyed_by_id_and_run() {
        let (sink, _clock) = setup();
        let target = DocumentTarget {
            database: "onchain".into(),
            collection: "profiles".into(),
        };
        let a: CrawlId = "2024030101".parse().unwrap();
        let b: CrawlId = "2024030102".parse().unwrap();
        let doc = |id| Document {
            natural_id: "0xa".into(),
            crawl_id: id,
            body: json!({"ok": true}),
        };

        sink.upsert_documents(&target, &[doc(a), doc(a)]).await.unwrap();
        sink.upsert_documents(&target, &[doc(b)]).await.unwrap();

        assert_eq!(sink.document_count(), 2);
        assert!(sink.document(&target, "0xa", b).is_some());
    }
}
