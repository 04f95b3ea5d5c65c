use tracing::info;

use crate::context::AppContext;
use crate::error::Result;
use crate::jobs::maintenance::QueueMaintenance;
use crate::jobs::model::Job;
use crate::sink::partitions::date_window;

/// Daily housekeeping: partition window forward, stale days out, finished
/// jobs purged.
pub async fn handle_maintain(_job: &Job, ctx: &AppContext) -> Result<()> {
    let today = ctx.clock.today();
    let window = date_window(today, ctx.settings.partition_future_days);
    let mut dropped = 0;

    for dataset in ctx.catalogue.datasets.iter().filter(|d| d.storage.table) {
        ctx.sink.ensure_partitions(&dataset.name, &window).await?;
        dropped += ctx
            .sink
            .drop_stale(&dataset.name, today, ctx.settings.partition_retention_days)
            .await?
            .len();
    }

    let report = QueueMaintenance::new(ctx.backend.clone(), ctx.settings.history_days)
        .run_once(ctx.clock.now())
        .await?;

    info!(
        dropped_partitions = dropped,
        purged_jobs = report.purged_jobs,
        pruned_attempts = report.pruned_attempts,
        "maintenance done"
    );
    Ok(())
}
