//! Pipeline stages run by the worker pools: plan a run, fetch pages or
//! entities, keep partitions and queues tidy.

use serde_json::Value;
use std::time::Duration;

use crate::catalogue::{Catalogue, DatasetSpec, SourceSpec};
use crate::context::AppContext;
use crate::crawl_id::CrawlId;
use crate::error::{CrawlError, Result};
use crate::jobs::model::JobOptions;
use crate::jobs::registry::{boxed, HandlerOptions, HandlerRegistry};
use crate::jobs::repeat::{Cadence, RepeatSpec};
use crate::planner::{plan_payload, ENTITY_JOB, MAINTAIN_JOB, PAGE_JOB, PLAN_JOB};
use crate::sink::{Document, SnapshotRow};

pub mod fetchers;
pub mod maintain;
pub mod plan;

pub const MAINTENANCE_KEY_PREFIX: &str = "maintenance";

pub fn build_registry() -> HandlerRegistry<AppContext> {
    let mut registry = HandlerRegistry::new();
    registry.register(PLAN_JOB, |job, ctx| boxed(plan::handle_plan(job, ctx)));
    registry.register(PAGE_JOB, |job, ctx| boxed(fetchers::handle_page(job, ctx)));
    registry.register(ENTITY_JOB, |job, ctx| {
        boxed(fetchers::handle_entity(job, ctx))
    });
    registry.register_with_options(
        MAINTAIN_JOB,
        |job, ctx| boxed(maintain::handle_maintain(job, ctx)),
        HandlerOptions::new()
            .max_concurrency(1)
            .timeout(Duration::from_secs(15 * 60)),
    );
    registry
}

/// One plan job per `every_secs` slot for each scheduled dataset, plus a
/// daily maintenance job on `maintenance_queue`.
pub fn repeat_specs(catalogue: &Catalogue, maintenance_queue: Option<&str>) -> Vec<RepeatSpec> {
    let mut specs: Vec<RepeatSpec> = catalogue
        .datasets
        .iter()
        .filter_map(|d| {
            let every = d.every_secs?;
            Some(RepeatSpec {
                queue: d.queue.clone(),
                name: PLAN_JOB.to_string(),
                payload: plan_payload(&d.name),
                opts: JobOptions {
                    delay_ms: 0,
                    ..d.job_options()
                },
                key_prefix: format!("{}:plan", d.name),
                cadence: Cadence::Every(Duration::from_secs(every)),
            })
        })
        .collect();

    if let Some(queue) = maintenance_queue {
        specs.push(RepeatSpec {
            queue: queue.to_string(),
            name: MAINTAIN_JOB.to_string(),
            payload: Value::Object(Default::default()),
            opts: JobOptions::default(),
            key_prefix: MAINTENANCE_KEY_PREFIX.to_string(),
            cadence: Cadence::Daily,
        });
    }
    specs
}

pub fn cursor_key(dataset: &str, crawl_id: CrawlId) -> String {
    format!("cursor:{dataset}:{crawl_id}")
}

pub(crate) fn resolve<'c>(
    ctx: &'c AppContext,
    dataset: &str,
) -> Result<(&'c DatasetSpec, &'c SourceSpec)> {
    let spec = ctx.catalogue.require_dataset(dataset)?;
    let source = ctx.catalogue.require_source(&spec.source)?;
    Ok((spec, source))
}

/// Fails with `DATA_SHAPE` naming the first missing or null field.
pub(crate) fn check_required(dataset: &DatasetSpec, item: &Value) -> Result<()> {
    for field in &dataset.required_fields {
        let present = crate::fetch::lookup(item, field).is_some_and(|v| !v.is_null());
        if !present {
            return Err(CrawlError::DataShape(format!(
                "{}: item is missing required field {field:?}",
                dataset.name
            )));
        }
    }
    Ok(())
}

/// Writes rows to the dataset's table and/or document collection.
pub(crate) async fn store(ctx: &AppContext, dataset: &DatasetSpec, rows: Vec<SnapshotRow>) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }
    let mut written = 0;
    if dataset.storage.table {
        written = ctx.sink.upsert_rows(&dataset.name, &rows).await?;
    }
    if let Some(target) = &dataset.storage.documents {
        let docs: Vec<Document> = rows.into_iter().map(Document::from).collect();
        let n = ctx.sink.upsert_documents(target, &docs).await?;
        written = written.max(n);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::JOB_NAMES;

    #[test]
    fn registry_covers_every_produced_job_name() {
        let registry = build_registry();
        registry.ensure_registered(JOB_NAMES).unwrap();
    }

    #[test]
    fn scheduled_datasets_get_plan_specs() {
        let catalogue = Catalogue::parse(
            r#"
[[queues]]
name = "holders"

[[sources]]
name = "chain_api"
base_url = "https://api.example.com"

[[datasets]]
name = "top_holders"
source = "chain_api"
queue = "holders"
endpoint = "/v1/holders"
natural_key = "user_address"
every_secs = 3600
fan_out = { mode = "offsets", page_size = 100 }

[[datasets]]
name = "whales"
source = "chain_api"
queue = "holders"
endpoint = "/v1/whales"
natural_key = "user_address"
fan_out = { mode = "offsets", page_size = 50 }
"#,
        )
        .unwrap();

        let specs = repeat_specs(&catalogue, Some("holders"));
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].key_prefix, "top_holders:plan");
        assert_eq!(specs[0].cadence, Cadence::Every(Duration::from_secs(3600)));
        assert_eq!(specs[1].name, MAINTAIN_JOB);
        assert_eq!(specs[1].cadence, Cadence::Daily);
    }
}
