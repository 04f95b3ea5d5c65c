//! Date/crawl-id partitioned snapshot tables and the document store.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use std::collections::HashMap;

use crate::catalogue::DocumentTarget;
use crate::crawl_id::CrawlId;
use crate::error::{CrawlError, Result};
use crate::fetch::{lookup, scalar_to_string};

pub mod memory;
pub mod partitions;
pub mod postgres;

pub use memory::MemorySink;
pub use postgres::PgSink;

/// Rows per INSERT statement.
pub const UPSERT_CHUNK: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRow {
    pub natural_key: String,
    pub crawl_id: CrawlId,
    pub data: Value,
}

impl SnapshotRow {
    /// Fails with `DATA_SHAPE` when the item has no usable `key_field`.
    pub fn from_item(item: &Value, key_field: &str, crawl_id: CrawlId) -> Result<Self> {
        let natural_key = lookup(item, key_field)
            .and_then(scalar_to_string)
            .ok_or_else(|| {
                CrawlError::DataShape(format!("item has no natural key {key_field:?}"))
            })?;
        Ok(Self {
            natural_key,
            crawl_id,
            data: item.clone(),
        })
    }

    pub fn crawl_date(&self) -> NaiveDate {
        self.crawl_id.date()
    }
}

/// Latest per-entity snapshot, keyed by natural id plus crawl id.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub natural_id: String,
    pub crawl_id: CrawlId,
    pub body: Value,
}

impl From<SnapshotRow> for Document {
    fn from(row: SnapshotRow) -> Self {
        Self {
            natural_id: row.natural_key,
            crawl_id: row.crawl_id,
            body: row.data,
        }
    }
}

#[async_trait]
pub trait SnapshotSink: Send + Sync {
    /// Creates the parent table and, for each date, the day partition with
    /// its list partitions and default. Idempotent.
    async fn ensure_partitions(&self, table: &str, dates: &[NaiveDate]) -> Result<()>;

    /// Insert-or-update on `(natural_key, crawl_date, crawl_id)`. Returns the
    /// number of distinct rows written.
    async fn upsert_rows(&self, table: &str, rows: &[SnapshotRow]) -> Result<u64>;

    /// Drops day partitions older than the retention window; returns their names.
    async fn drop_stale(&self, table: &str, today: NaiveDate, retention_days: u32)
        -> Result<Vec<String>>;

    async fn upsert_documents(&self, target: &DocumentTarget, docs: &[Document]) -> Result<u64>;
}

/// Keeps the last occurrence of each key, in first-seen order.
///
/// One `ON CONFLICT DO UPDATE` statement cannot touch the same row twice.
pub fn dedup_last<T, K, F>(items: &[T], key: F) -> Vec<&T>
where
    K: std::hash::Hash + Eq,
    F: Fn(&T) -> K,
{
    let mut slot: HashMap<K, usize> = HashMap::with_capacity(items.len());
    let mut out: Vec<&T> = Vec::with_capacity(items.len());
    for item in items {
        match slot.get(&key(item)) {
            Some(&i) => out[i] = item,
            None => {
                slot.insert(key(item), out.len());
                out.push(item);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id() -> CrawlId {
        "2024030102".parse().unwrap()
    }

    #[test]
    fn row_key_comes_from_the_item() {
        let row = SnapshotRow::from_item(&json!({"user_address": "0xabc", "balance": 5}), "user_address", id())
            .unwrap();
        assert_eq!(row.natural_key, "0xabc");
        assert_eq!(row.crawl_date(), NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());

        let numeric = SnapshotRow::from_item(&json!({"pool_id": 42}), "pool_id", id()).unwrap();
        assert_eq!(numeric.natural_key, "42");
    }

    #[test]
    fn missing_key_is_a_shape_error() {
        let err = SnapshotRow::from_item(&json!({"balance": 5}), "user_address", id()).unwrap_err();
        assert!(matches!(err, CrawlError::DataShape(_)));
    }

    #[test]
    fn dedup_keeps_last_value_in_first_position() {
        let items = vec![("a", 1), ("b", 2), ("a", 3)];
        let out = dedup_last(&items, |(k, _)| *k);
        assert_eq!(out, vec![&("a", 3), &("b", 2)]);
    }
}
