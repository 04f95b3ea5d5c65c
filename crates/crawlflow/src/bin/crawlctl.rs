use clap::{Parser, Subcommand};
use crawlflow::catalogue::Catalogue;
use crawlflow::config::Config;
use crawlflow::context::AppContext;
use crawlflow::jobs::{FailureRecorder, JobOptions};
use crawlflow::logging;
use crawlflow::planner::{plan_payload, PLAN_JOB};
use crawlflow::sink::partitions::date_window;

/// Operator commands against a running crawlflow deployment.
///
/// Reads the same environment and catalogue as the worker.
#[derive(Parser, Debug)]
#[command(name = "crawlctl", about = "crawlflow operator tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Allocate the next crawl id for a dataset
    NextCrawlId { dataset: String },
    /// Enqueue a plan job for a dataset now
    Plan { dataset: String },
    /// Re-enqueue the failed-job snapshots recorded for a queue
    Replay { queue: String },
    /// Create today's and the upcoming partitions for a dataset
    EnsurePartitions { dataset: String },
    /// Drop date partitions older than the retention window
    DropStale { dataset: String },
    /// Print job counts for a queue
    Counts { queue: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = Config::from_env()?;
    logging::init(cfg.log_format);

    let catalogue = Catalogue::load(&cfg.catalogue_path)?;
    let ctx = AppContext::connect(&cfg, catalogue).await?;

    match cli.command {
        Command::NextCrawlId { dataset } => {
            ctx.catalogue.require_dataset(&dataset)?;
            let id = ctx.sequencer.next_crawl_id(&dataset).await?;
            println!("{id}");
        }
        Command::Plan { dataset } => {
            let spec = ctx.catalogue.require_dataset(&dataset)?;
            let out = ctx
                .producer
                .add_job(
                    &spec.queue,
                    PLAN_JOB,
                    plan_payload(&spec.name),
                    JobOptions {
                        delay_ms: 0,
                        ..spec.job_options()
                    },
                )
                .await?;
            println!("plan job {} on {} (created={})", out.id, spec.queue, out.created);
        }
        Command::Replay { queue } => {
            let recorder = FailureRecorder::new(ctx.cache.clone(), ctx.backend.clone());
            let n = recorder.replay(&queue).await?;
            println!("replayed {n} jobs on {queue}");
        }
        Command::EnsurePartitions { dataset } => {
            let spec = ctx.catalogue.require_dataset(&dataset)?;
            let days = date_window(ctx.clock.today(), ctx.settings.partition_future_days);
            ctx.sink.ensure_partitions(&spec.name, &days).await?;
            println!("ensured {} days for {}", days.len(), spec.name);
        }
        Command::DropStale { dataset } => {
            let spec = ctx.catalogue.require_dataset(&dataset)?;
            let dropped = ctx
                .sink
                .drop_stale(&spec.name, ctx.clock.today(), ctx.settings.partition_retention_days)
                .await?;
            for name in &dropped {
                println!("- dropped {name}");
            }
            println!("dropped {} partitions", dropped.len());
        }
        Command::Counts { queue } => {
            let c = ctx.backend.counts(&queue).await?;
            println!(
                "{queue}: waiting={} delayed={} active={} completed={} failed={}",
                c.waiting, c.delayed, c.active, c.completed, c.failed
            );
        }
    }

    Ok(())
}
