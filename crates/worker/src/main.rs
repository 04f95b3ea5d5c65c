use crawlflow::admin::{self, AdminState};
use crawlflow::catalogue::Catalogue;
use crawlflow::config;
use crawlflow::context::AppContext;
use crawlflow::crawl::{build_registry, repeat_specs};
use crawlflow::jobs::{FailureRecorder, JobRunner, QueueListener, RepeatScheduler, WorkerPool};
use crawlflow::logging;
use crawlflow::planner::JOB_NAMES;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

const REPEAT_TICK: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::from_env()?;
    logging::init(cfg.log_format);

    let catalogue = Catalogue::load(&cfg.catalogue_path)?;
    let queues: Vec<String> = catalogue
        .queues
        .iter()
        .map(|q| q.name.clone())
        .filter(|q| cfg.works_queue(q))
        .collect();
    if queues.is_empty() {
        anyhow::bail!("no catalogue queue matches CRAWLFLOW_QUEUES");
    }

    info!(
        worker_id = %cfg.worker_id,
        queues = ?queues,
        admin = cfg.admin_addr.as_deref().unwrap_or("disabled"),
        migrate_on_startup = cfg.migrate_on_startup,
        catalogue = %cfg.catalogue_path.display(),
        "crawlflow starting"
    );

    let ctx = AppContext::connect(&cfg, catalogue).await?;
    let registry = Arc::new(build_registry());
    registry.ensure_registered(JOB_NAMES)?;

    let cancel = CancellationToken::new();
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();
    let recorder: Arc<dyn QueueListener> =
        Arc::new(FailureRecorder::new(ctx.cache.clone(), ctx.backend.clone()));

    // ---- Worker pools ----
    for name in &queues {
        let Some(profile) = ctx.catalogue.queue(name) else {
            continue;
        };
        let runner = JobRunner::new(ctx.backend.clone(), ctx.notifier.clone());
        let pool = WorkerPool::new(
            name,
            &cfg.worker_id,
            profile.pool.clone(),
            ctx.backend.clone(),
            registry.clone(),
            runner,
            ctx.clone(),
        )
        .with_listener(recorder.clone())
        .with_poll_interval(Duration::from_millis(cfg.poll_interval_ms));
        tasks.spawn(pool.run(cancel.clone()));
    }

    // ---- Repeat scheduler (plan slots + daily maintenance) ----
    let scheduler = RepeatScheduler::new(
        ctx.producer.clone(),
        ctx.cache.clone(),
        ctx.clock.clone(),
        repeat_specs(&ctx.catalogue, queues.first().map(String::as_str)),
    );
    info!(specs = scheduler.specs().len(), "repeat scheduler ready");
    tasks.spawn(scheduler.run(REPEAT_TICK, cancel.clone()));

    // ---- Admin API ----
    if let Some(addr) = cfg.admin_addr.clone() {
        let app = admin::router(AdminState {
            backend: ctx.backend.clone(),
            clock: ctx.clock.clone(),
            queues: Arc::new(queues.clone()),
        });
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let listener = tokio::net::TcpListener::bind(&addr).await?;
            info!(%addr, "admin api listening");
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await?;
            Ok(())
        });
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
        Some(res) = tasks.join_next() => match res {
            Ok(Ok(())) => info!("a component stopped"),
            Ok(Err(e)) => error!(error = %e, "component failed"),
            Err(e) => error!(error = %e, "component panicked"),
        },
    }

    // in-flight jobs finish before the pools return
    cancel.cancel();
    while let Some(res) = tasks.join_next().await {
        if let Ok(Err(e)) = res {
            error!(error = %e, "component failed during shutdown");
        }
    }
    info!("crawlflow stopped");
    Ok(())
}
