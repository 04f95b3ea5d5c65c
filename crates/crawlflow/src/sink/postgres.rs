use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::{BTreeSet, HashSet};
use std::sync::Mutex;
use tracing::{debug, info};

use super::partitions::{
    create_parent_sql, date_partition_sql, parse_date_partition, quote_ident, retention_cutoff,
};
use super::{dedup_last, Document, SnapshotRow, SnapshotSink, UPSERT_CHUNK};
use crate::catalogue::DocumentTarget;
use crate::error::{CrawlError, Result};

/// Snapshot tables in Postgres, partitioned by day and then by crawl id.
pub struct PgSink {
    pool: PgPool,
    max_list_partition: u8,
    // (table, date) pairs this process already ensured
    ensured: Mutex<HashSet<(String, NaiveDate)>>,
}

impl PgSink {
    pub fn new(pool: PgPool, max_list_partition: u8) -> Self {
        Self {
            pool,
            max_list_partition,
            ensured: Mutex::new(HashSet::new()),
        }
    }

    fn missing_dates(&self, table: &str, dates: impl IntoIterator<Item = NaiveDate>) -> Vec<NaiveDate> {
        let ensured = self.ensured.lock().unwrap_or_else(|p| p.into_inner());
        dates
            .into_iter()
            .filter(|d| !ensured.contains(&(table.to_string(), *d)))
            .collect()
    }

    fn mark_ensured(&self, table: &str, dates: &[NaiveDate]) {
        let mut ensured = self.ensured.lock().unwrap_or_else(|p| p.into_inner());
        for d in dates {
            ensured.insert((table.to_string(), *d));
        }
    }

    fn forget(&self, table: &str, date: NaiveDate) {
        let mut ensured = self.ensured.lock().unwrap_or_else(|p| p.into_inner());
        ensured.remove(&(table.to_string(), date));
    }

    async fn child_tables(&self, table: &str) -> Result<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            r#"
            SELECT c.relname::text
            FROM pg_inherits i
            JOIN pg_class c ON c.oid = i.inhrelid
            JOIN pg_class p ON p.oid = i.inhparent
            JOIN pg_namespace n ON n.oid = p.relnamespace
            WHERE p.relname = $1
              AND n.nspname = current_schema()
            "#,
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| write_error(table, e))?;
        Ok(names)
    }
}

#[async_trait]
impl SnapshotSink for PgSink {
    async fn ensure_partitions(&self, table: &str, dates: &[NaiveDate]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| write_error(table, e))?;

        // 1) serialise DDL for this table across workers
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("crawlflow:ddl:{table}"))
            .execute(&mut *tx)
            .await
            .map_err(|e| write_error(table, e))?;

        // 2) parent, then each day with its nested partitions
        sqlx::query(&create_parent_sql(table))
            .execute(&mut *tx)
            .await
            .map_err(|e| write_error(table, e))?;

        for date in dates {
            for sql in date_partition_sql(table, *date, self.max_list_partition) {
                sqlx::query(&sql)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| write_error(table, e))?;
            }
        }

        tx.commit().await.map_err(|e| write_error(table, e))?;
        self.mark_ensured(table, dates);
        debug!(table, days = dates.len(), "partitions ensured");
        Ok(())
    }

    async fn upsert_rows(&self, table: &str, rows: &[SnapshotRow]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let dates: BTreeSet<NaiveDate> = rows.iter().map(SnapshotRow::crawl_date).collect();
        let missing = self.missing_dates(table, dates);
        if !missing.is_empty() {
            self.ensure_partitions(table, &missing).await?;
        }

        let rows = dedup_last(rows, |r| (r.natural_key.clone(), r.crawl_id));
        let mut written = 0_u64;

        for chunk in rows.chunks(UPSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
                "INSERT INTO {} (natural_key, crawl_date, crawl_id, data) ",
                quote_ident(table)
            ));
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(&row.natural_key)
                    .push_bind(row.crawl_date())
                    .push_bind(row.crawl_id.as_i64())
                    .push_bind(&row.data);
            });
            qb.push(
                " ON CONFLICT (natural_key, crawl_date, crawl_id) \
                 DO UPDATE SET data = EXCLUDED.data, updated_at = now()",
            );

            let res = qb
                .build()
                .execute(&self.pool)
                .await
                .map_err(|e| write_error(table, e))?;
            written += res.rows_affected();
        }

        Ok(written)
    }

    async fn drop_stale(
        &self,
        table: &str,
        today: NaiveDate,
        retention_days: u32,
    ) -> Result<Vec<String>> {
        let cutoff = retention_cutoff(today, retention_days);
        let mut dropped = Vec::new();

        for child in self.child_tables(table).await? {
            let Some(date) = parse_date_partition(table, &child) else {
                continue;
            };
            if date >= cutoff {
                continue;
            }

            // whole day at once; nested list and default partitions go with it
            sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(&child)))
                .execute(&self.pool)
                .await
                .map_err(|e| write_error(table, e))?;
            self.forget(table, date);
            dropped.push(child);
        }

        if !dropped.is_empty() {
            info!(table, %cutoff, dropped = dropped.len(), "dropped stale partitions");
        }
        Ok(dropped)
    }

    async fn upsert_documents(&self, target: &DocumentTarget, docs: &[Document]) -> Result<u64> {
        if docs.is_empty() {
            return Ok(0);
        }
        let label = format!("documents {}.{}", target.database, target.collection);
        let docs = dedup_last(docs, |d| (d.natural_id.clone(), d.crawl_id));
        let mut written = 0_u64;

        for chunk in docs.chunks(UPSERT_CHUNK) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO documents (database_name, collection, natural_id, crawl_id, body) ",
            );
            qb.push_values(chunk, |mut b, doc| {
                b.push_bind(&target.database)
                    .push_bind(&target.collection)
                    .push_bind(&doc.natural_id)
                    .push_bind(doc.crawl_id.as_i64())
                    .push_bind(&doc.body);
            });
            qb.push(
                " ON CONFLICT (database_name, collection, natural_id, crawl_id) \
                 DO UPDATE SET body = EXCLUDED.body, updated_at = now()",
            );

            let res = qb
                .build()
                .execute(&self.pool)
                .await
                .map_err(|e| write_error(&label, e))?;
            written += res.rows_affected();
        }

        Ok(written)
    }
}

/// Integrity violations (SQLSTATE class 23) are structural and not retried;
/// anything else is treated as the database being unavailable.
fn write_error(table: &str, e: sqlx::Error) -> CrawlError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().is_some_and(|c| c.starts_with("23")) {
            return CrawlError::PartitionWrite {
                table: table.to_string(),
                message: db.message().to_string(),
            };
        }
    }
    CrawlError::Storage(format!("{table}: {e}"))
}
