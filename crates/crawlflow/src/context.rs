use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::cache::{KvCache, MemoryCache, RedisCache};
use crate::catalogue::Catalogue;
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, Egress};
use crate::db;
use crate::error::CrawlError;
use crate::fetch::FetchClient;
use crate::jobs::{MemoryQueue, PgQueue, QueueBackend, QueueProducer};
use crate::notify::Notifier;
use crate::sequencer::{MemoryCrawlIdStore, PgCrawlIdStore, Sequencer};
use crate::session::{ChromiumConnector, SignedFetch, TokenHarvester};
use crate::sink::{MemorySink, PgSink, SnapshotSink};

/// Tunables the crawl handlers read at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrawlSettings {
    pub partition_future_days: u32,
    pub partition_retention_days: u32,
    pub history_days: i64,
    /// How long a plan job remembers the crawl id it allocated.
    pub run_memory: Duration,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            partition_future_days: 2,
            partition_retention_days: 14,
            history_days: 7,
            run_memory: Duration::from_secs(24 * 3600),
        }
    }
}

impl CrawlSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            partition_future_days: cfg.partition_future_days,
            partition_retention_days: cfg.partition_retention_days,
            history_days: cfg.history_days,
            ..Self::default()
        }
    }
}

/// Everything a component needs, built once at start and cloned into each
/// worker pool and handler.
#[derive(Clone)]
pub struct AppContext {
    pub catalogue: Arc<Catalogue>,
    pub settings: CrawlSettings,
    pub clock: Arc<dyn Clock>,
    pub backend: Arc<dyn QueueBackend>,
    pub producer: QueueProducer,
    pub cache: Arc<dyn KvCache>,
    pub sequencer: Arc<Sequencer>,
    pub fetch: SignedFetch,
    pub sink: Arc<dyn SnapshotSink>,
    pub notifier: Notifier,
}

/// Concrete in-memory back-ends behind an [`AppContext::in_memory`] context.
#[derive(Clone)]
pub struct MemoryParts {
    pub queue: Arc<MemoryQueue>,
    pub cache: Arc<MemoryCache>,
    pub sink: Arc<MemorySink>,
}

impl AppContext {
    /// Production wiring: Postgres, Redis, the outbound proxy and, when any
    /// source needs it, a remote headless browser.
    pub async fn connect(cfg: &Config, catalogue: Catalogue) -> anyhow::Result<Self> {
        let pool = db::make_pool(cfg).await?;
        if cfg.migrate_on_startup {
            db::run_migrations(&pool).await?;
            info!("migrations applied");
        }

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let backend: Arc<dyn QueueBackend> = Arc::new(PgQueue::new(pool.clone()));
        let cache: Arc<dyn KvCache> = Arc::new(RedisCache::connect(&cfg.redis_url).await?);
        let sequencer = Arc::new(Sequencer::new(
            Arc::new(PgCrawlIdStore::new(pool.clone())),
            clock.clone(),
        ));
        let sink: Arc<dyn SnapshotSink> = Arc::new(PgSink::new(pool, cfg.max_list_partition));

        let mut fetch = SignedFetch::new(FetchClient::new(&cfg.egress)?);
        for source in catalogue.sources.iter().filter(|s| s.requires_session) {
            let (Some(ws_url), Some(spec)) = (&cfg.browser_ws_url, &source.session) else {
                return Err(CrawlError::Config(format!(
                    "source {:?} requires a session; set CRAWLFLOW_BROWSER_WS_URL",
                    source.name
                ))
                .into());
            };
            let harvester = TokenHarvester::new(
                source.name.clone(),
                spec.clone(),
                Duration::from_secs(cfg.session_ttl_secs),
                cache.clone(),
                Arc::new(ChromiumConnector::new(ws_url.clone())),
            );
            fetch = fetch.with_harvester(&source.name, Arc::new(harvester));
        }

        if cfg.egress == Egress::Direct {
            tracing::warn!("fetching without a proxy");
        }

        Ok(Self {
            catalogue: Arc::new(catalogue),
            settings: CrawlSettings::from_config(cfg),
            clock,
            producer: QueueProducer::new(backend.clone()),
            backend,
            cache,
            sequencer,
            fetch,
            sink,
            notifier: Notifier::new(cfg.notify_webhook_url.clone()),
        })
    }

    /// Memory-backed context for tests and local runs. Fetches go direct.
    pub fn in_memory(catalogue: Catalogue, clock: Arc<dyn Clock>) -> crate::error::Result<(Self, MemoryParts)> {
        let queue = Arc::new(MemoryQueue::new(clock.clone()));
        let cache = Arc::new(MemoryCache::new(clock.clone()));
        let sink = Arc::new(MemorySink::new(clock.clone()));
        let backend: Arc<dyn QueueBackend> = queue.clone();

        let ctx = Self {
            catalogue: Arc::new(catalogue),
            settings: CrawlSettings::default(),
            sequencer: Arc::new(Sequencer::new(
                Arc::new(MemoryCrawlIdStore::new()),
                clock.clone(),
            )),
            clock,
            producer: QueueProducer::new(backend.clone()),
            backend,
            cache: cache.clone(),
            fetch: SignedFetch::new(FetchClient::new(&Egress::Direct)?),
            sink: sink.clone(),
            notifier: Notifier::disabled(),
        };

        Ok((ctx, MemoryParts { queue, cache, sink }))
    }

    pub fn with_fetch(mut self, fetch: SignedFetch) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn with_notifier(mut self, notifier: Notifier) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_settings(mut self, settings: CrawlSettings) -> Self {
        self.settings = settings;
        self
    }
}
