use serde_json::Value;
use tracing::{debug, info};

use super::{cursor_key, resolve};
use crate::catalogue::{DatasetSpec, EntityListSpec, FanOutSpec, SourceSpec};
use crate::context::AppContext;
use crate::crawl_id::CrawlId;
use crate::error::{CrawlError, Result};
use crate::fetch::{lookup, scalar_to_string, RequestSpec};
use crate::jobs::model::Job;
use crate::planner::{enqueue_entity_jobs, enqueue_page_jobs, PlanPayload};
use crate::sink::partitions::date_window;

pub fn run_key(job: &Job) -> String {
    format!("crawl_run:{}", job.display_key())
}

pub async fn handle_plan(job: &Job, ctx: &AppContext) -> Result<()> {
    let payload: PlanPayload = job.payload()?;
    let (dataset, source) = resolve(ctx, &payload.dataset)?;

    // 1) one crawl id per run, kept across retries of this plan job
    let crawl_id = run_crawl_id(job, ctx, &dataset.name).await?;

    // 2) partitions exist before any page lands
    if dataset.storage.table {
        let days = date_window(ctx.clock.today(), ctx.settings.partition_future_days);
        ctx.sink.ensure_partitions(&dataset.name, &days).await?;
    }

    // 3) fan out
    let planned = match &dataset.fan_out {
        FanOutSpec::Offsets { .. } => plan_offsets(ctx, dataset, source, crawl_id).await?,
        FanOutSpec::Entities { ids, list, .. } => {
            let mut created = enqueue_entity_jobs(&ctx.producer, dataset, crawl_id, ids).await?;
            if let Some(list) = list {
                created += walk_entity_list(ctx, dataset, source, list, crawl_id).await?;
            }
            created
        }
    };

    info!(dataset = %dataset.name, %crawl_id, planned, "run planned");
    ctx.notifier
        .send(&format!(
            "crawl {} run {crawl_id} planned: {planned} jobs",
            dataset.name
        ))
        .await;
    Ok(())
}

async fn run_crawl_id(job: &Job, ctx: &AppContext, dataset: &str) -> Result<CrawlId> {
    let key = run_key(job);
    if let Some(raw) = ctx.cache.get(&key).await? {
        if let Ok(id) = raw.parse::<CrawlId>() {
            debug!(dataset, crawl_id = %id, "resuming run");
            return Ok(id);
        }
    }

    let id = ctx.sequencer.next_crawl_id(dataset).await?;
    ctx.cache
        .set(&key, &id.to_string(), Some(ctx.settings.run_memory))
        .await?;
    Ok(id)
}

async fn plan_offsets(
    ctx: &AppContext,
    dataset: &DatasetSpec,
    source: &SourceSpec,
    crawl_id: CrawlId,
) -> Result<usize> {
    let FanOutSpec::Offsets {
        page_size,
        total_pointer,
        offset_param,
        limit_param,
        ..
    } = &dataset.fan_out
    else {
        return Ok(0);
    };

    let req = RequestSpec::new(&dataset.endpoint)
        .params(&dataset.params)
        .param(offset_param, 0)
        .param(limit_param, page_size);
    let body = ctx.fetch.fetch(source, &req).await?;

    let total = read_total(&body, total_pointer).ok_or_else(|| {
        CrawlError::DataShape(format!(
            "{}: no total count at {total_pointer:?}",
            dataset.name
        ))
    })?;

    enqueue_page_jobs(&ctx.producer, dataset, crawl_id, total, *page_size).await
}

/// Accepts the count as a JSON number or a numeric string.
pub fn read_total(body: &Value, pointer: &str) -> Option<u64> {
    match lookup(body, pointer)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Walks a cursor-paged id listing. The cursor is saved after every page so
/// a restarted plan job picks up where this one stopped.
async fn walk_entity_list(
    ctx: &AppContext,
    dataset: &DatasetSpec,
    source: &SourceSpec,
    list: &EntityListSpec,
    crawl_id: CrawlId,
) -> Result<usize> {
    let key = cursor_key(&dataset.name, crawl_id);
    let mut cursor = ctx.cache.get(&key).await?;
    let mut created = 0;
    let mut pages = 0_u32;

    loop {
        let mut req = RequestSpec::new(&list.endpoint).params(&list.params);
        if let Some(c) = &cursor {
            req = req.param(&list.cursor_param, c);
        }
        let body = ctx.fetch.fetch(source, &req).await?;

        let ids = read_ids(&body, &list.ids_pointer).ok_or_else(|| {
            CrawlError::DataShape(format!(
                "{}: no id list at {:?}",
                dataset.name, list.ids_pointer
            ))
        })?;
        if ids.is_empty() {
            break;
        }
        created += enqueue_entity_jobs(&ctx.producer, dataset, crawl_id, &ids).await?;
        pages += 1;

        let next = lookup(&body, &list.cursor_pointer).and_then(scalar_to_string);
        match next {
            Some(next) if cursor.as_deref() != Some(next.as_str()) => {
                ctx.cache
                    .set(&key, &next, Some(ctx.settings.run_memory))
                    .await?;
                cursor = Some(next);
            }
            _ => break,
        }
    }

    ctx.cache.del(&key).await?;
    debug!(dataset = %dataset.name, %crawl_id, pages, created, "entity list walked");
    Ok(created)
}

fn read_ids(body: &Value, pointer: &str) -> Option<Vec<String>> {
    let items = lookup(body, pointer)?.as_array()?;
    Some(items.iter().filter_map(scalar_to_string).collect())
}
