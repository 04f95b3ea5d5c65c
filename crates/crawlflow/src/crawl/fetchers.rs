use serde_json::Value;
use tracing::debug;

use super::{check_required, resolve, store};
use crate::catalogue::FanOutSpec;
use crate::context::AppContext;
use crate::error::{CrawlError, Result};
use crate::fetch::{lookup, RequestSpec};
use crate::jobs::model::Job;
use crate::planner::{EntityPayload, PagePayload};
use crate::sink::SnapshotRow;

pub async fn handle_page(job: &Job, ctx: &AppContext) -> Result<()> {
    let p: PagePayload = job.payload()?;
    let (dataset, source) = resolve(ctx, &p.dataset)?;
    let FanOutSpec::Offsets {
        items_pointer,
        offset_param,
        limit_param,
        ..
    } = &dataset.fan_out
    else {
        return Err(CrawlError::BadPayload(format!(
            "page job for {} which is not an offsets dataset",
            dataset.name
        )));
    };

    let req = RequestSpec::new(&dataset.endpoint)
        .params(&dataset.params)
        .param(offset_param, p.offset)
        .param(limit_param, p.limit);
    let body = ctx.fetch.fetch(source, &req).await?;

    let items = lookup(&body, items_pointer)
        .and_then(Value::as_array)
        .ok_or_else(|| {
            CrawlError::DataShape(format!(
                "{} offset {}: no item array at {items_pointer:?}",
                dataset.name, p.offset
            ))
        })?;

    // a short or long page means the source shifted under us; retry the page
    if items.len() as u64 != p.expected {
        return Err(CrawlError::DataShape(format!(
            "{} offset {}: expected {} items, got {}",
            dataset.name,
            p.offset,
            p.expected,
            items.len()
        )));
    }

    let rows = items
        .iter()
        .map(|item| {
            check_required(dataset, item)?;
            SnapshotRow::from_item(item, &dataset.natural_key, p.crawl_id)
        })
        .collect::<Result<Vec<_>>>()?;

    let written = store(ctx, dataset, rows).await?;
    debug!(
        dataset = %dataset.name,
        crawl_id = %p.crawl_id,
        offset = p.offset,
        written,
        "page stored"
    );
    Ok(())
}

pub async fn handle_entity(job: &Job, ctx: &AppContext) -> Result<()> {
    let p: EntityPayload = job.payload()?;
    let (dataset, source) = resolve(ctx, &p.dataset)?;
    let FanOutSpec::Entities {
        id_param,
        entity_pointer,
        ..
    } = &dataset.fan_out
    else {
        return Err(CrawlError::BadPayload(format!(
            "entity job for {} which is not an entities dataset",
            dataset.name
        )));
    };

    let req = RequestSpec::new(&dataset.endpoint)
        .params(&dataset.params)
        .param(id_param, &p.entity_id);
    let body = ctx.fetch.fetch(source, &req).await?;

    let entity = lookup(&body, entity_pointer)
        .filter(|v| v.is_object())
        .ok_or_else(|| {
            CrawlError::DataShape(format!(
                "{} entity {}: no object at {entity_pointer:?}",
                dataset.name, p.entity_id
            ))
        })?;
    check_required(dataset, entity)?;

    let row = match SnapshotRow::from_item(entity, &dataset.natural_key, p.crawl_id) {
        Ok(row) => row,
        Err(_) => SnapshotRow {
            natural_key: p.entity_id.clone(),
            crawl_id: p.crawl_id,
            data: entity.clone(),
        },
    };

    store(ctx, dataset, vec![row]).await?;
    debug!(dataset = %dataset.name, crawl_id = %p.crawl_id, entity = %p.entity_id, "entity stored");
    Ok(())
}
