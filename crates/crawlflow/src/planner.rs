//! Splits one crawl run into page or entity jobs.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::catalogue::DatasetSpec;
use crate::crawl_id::CrawlId;
use crate::error::{CrawlError, Result};
use crate::jobs::model::JobOptions;
use crate::jobs::producer::{BulkJob, QueueProducer};

pub const PLAN_JOB: &str = "plan";
pub const PAGE_JOB: &str = "page";
pub const ENTITY_JOB: &str = "entity";
pub const MAINTAIN_JOB: &str = "maintain";

pub const JOB_NAMES: [&str; 4] = [PLAN_JOB, PAGE_JOB, ENTITY_JOB, MAINTAIN_JOB];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanPayload {
    pub dataset: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagePayload {
    pub dataset: String,
    pub crawl_id: CrawlId,
    pub offset: u64,
    pub limit: u64,
    /// Items this page must hold for the run to add up to the reported total.
    pub expected: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityPayload {
    pub dataset: String,
    pub crawl_id: CrawlId,
    pub entity_id: String,
}

/// `ceil(total / page_size)` offsets starting at 0, `page_size` apart.
/// A zero total plans nothing.
pub fn plan_pages(total_count: u64, page_size: u64) -> Vec<u64> {
    if page_size == 0 {
        return Vec::new();
    }
    (0..total_count.div_ceil(page_size))
        .map(|i| i * page_size)
        .collect()
}

/// Items expected on the page at `offset`.
pub fn expected_on_page(total_count: u64, page_size: u64, offset: u64) -> u64 {
    total_count.saturating_sub(offset).min(page_size)
}

pub fn page_job_key(dataset: &str, crawl_id: CrawlId, offset: u64) -> String {
    format!("{dataset}:page:{crawl_id}:{offset}")
}

pub fn entity_job_key(dataset: &str, crawl_id: CrawlId, entity_id: &str) -> String {
    format!("{dataset}:entity:{crawl_id}:{entity_id}")
}

/// Enqueues one page job per offset. Keys are deterministic, so planning the
/// same run twice adds nothing.
pub async fn enqueue_page_jobs(
    producer: &QueueProducer,
    dataset: &DatasetSpec,
    crawl_id: CrawlId,
    total_count: u64,
    page_size: u64,
) -> Result<usize> {
    let offsets = plan_pages(total_count, page_size);
    let base = dataset.job_options();

    let jobs = offsets
        .iter()
        .map(|&offset| {
            let payload = PagePayload {
                dataset: dataset.name.clone(),
                crawl_id,
                offset,
                limit: page_size,
                expected: expected_on_page(total_count, page_size, offset),
            };
            to_bulk(
                PAGE_JOB,
                &payload,
                base.clone()
                    .with_job_id(page_job_key(&dataset.name, crawl_id, offset)),
            )
        })
        .collect::<Result<Vec<_>>>()?;

    let created = count_created(producer.add_bulk(&dataset.queue, jobs).await?);
    tracing::info!(
        dataset = %dataset.name,
        %crawl_id,
        total_count,
        pages = offsets.len(),
        created,
        "planned pages"
    );
    Ok(created)
}

/// Enqueues one entity job per id.
pub async fn enqueue_entity_jobs(
    producer: &QueueProducer,
    dataset: &DatasetSpec,
    crawl_id: CrawlId,
    entity_ids: &[String],
) -> Result<usize> {
    let base = dataset.job_options();
    let jobs = entity_ids
        .iter()
        .map(|id| {
            let payload = EntityPayload {
                dataset: dataset.name.clone(),
                crawl_id,
                entity_id: id.clone(),
            };
            to_bulk(
                ENTITY_JOB,
                &payload,
                base.clone()
                    .with_job_id(entity_job_key(&dataset.name, crawl_id, id)),
            )
        })
        .collect::<Result<Vec<_>>>()?;

    let created = count_created(producer.add_bulk(&dataset.queue, jobs).await?);
    tracing::debug!(dataset = %dataset.name, %crawl_id, ids = entity_ids.len(), created, "planned entities");
    Ok(created)
}

fn to_bulk<T: Serialize>(name: &str, payload: &T, opts: JobOptions) -> Result<BulkJob> {
    let payload = serde_json::to_value(payload)
        .map_err(|e| CrawlError::BadPayload(format!("{name} payload: {e}")))?;
    Ok(BulkJob::new(name, payload, opts))
}

fn count_created(out: Vec<crate::jobs::model::EnqueueOutcome>) -> usize {
    out.iter().filter(|o| o.created).count()
}

pub fn plan_payload(dataset: &str) -> serde_json::Value {
    json!({ "dataset": dataset })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_cover_the_total_without_gaps() {
        assert_eq!(plan_pages(235, 100), vec![0, 100, 200]);
        assert_eq!(plan_pages(200, 100), vec![0, 100]);
        assert_eq!(plan_pages(1, 100), vec![0]);
        assert!(plan_pages(0, 100).is_empty());

        for total in 0..350_u64 {
            for size in [1_u64, 7, 50, 100] {
                let offsets = plan_pages(total, size);
                assert_eq!(offsets.len() as u64, total.div_ceil(size));
                let covered: u64 = offsets
                    .iter()
                    .map(|&o| expected_on_page(total, size, o))
                    .sum();
                assert_eq!(covered, total, "total={total} size={size}");
                assert!(offsets.windows(2).all(|w| w[1] - w[0] == size));
            }
        }
    }

    #[test]
    fn last_page_expects_the_remainder() {
        assert_eq!(expected_on_page(235, 100, 0), 100);
        assert_eq!(expected_on_page(235, 100, 200), 35);
    }

    #[test]
    fn keys_are_deterministic() {
        let id: CrawlId = "2024030102".parse().unwrap();
        assert_eq!(page_job_key("top_holders", id, 200), "top_holders:page:2024030102:200");
        assert_eq!(
            entity_job_key("protocols", id, "uniswap"),
            "protocols:entity:2024030102:uniswap"
        );
    }

    #[test]
    fn page_payload_carries_crawl_id_as_number() {
        let p = PagePayload {
            dataset: "whales".into(),
            crawl_id: "2024030102".parse().unwrap(),
            offset: 100,
            limit: 100,
            expected: 100,
        };
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["crawl_id"], 2024030102_i64);
    }
}
