use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Outbound proxy every source request goes through.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyProfile {
    /// The scheme picks the protocol: `http://`, `https://` or `socks5://`.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Egress {
    Proxy(ProxyProfile),
    /// Local development only.
    Direct,
}

/// Process configuration, read once from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub worker_id: String,
    /// `None` works every queue in the catalogue.
    pub queues: Option<Vec<String>>,
    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,
    pub catalogue_path: PathBuf,
    pub egress: Egress,
    pub browser_ws_url: Option<String>,
    pub session_ttl_secs: u64,
    pub partition_future_days: u32,
    pub partition_retention_days: u32,
    pub max_list_partition: u8,
    /// Attempt history older than this is pruned.
    pub history_days: i64,
    pub notify_webhook_url: Option<String>,
    pub poll_interval_ms: u64,
    pub log_format: LogFormat,
    pub db_max_connections: u32,
    pub db_acquire_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let redis_url = env_or_fallback("CRAWLFLOW_REDIS_URL", "REDIS_URL")
            .unwrap_or_else(|| "redis://127.0.0.1:6379".to_string());

        let worker_id = env_or_fallback("CRAWLFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker-1".to_string());

        let queues = env_or_fallback("CRAWLFLOW_QUEUES", "QUEUES").map(|s| parse_list(&s));

        let admin_addr = env_or_fallback("CRAWLFLOW_ADMIN_ADDR", "ADMIN_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        let migrate_on_startup = env_bool("CRAWLFLOW_MIGRATE_ON_STARTUP").unwrap_or(false);

        let catalogue_path = env_or_fallback("CRAWLFLOW_CATALOGUE", "CATALOGUE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("config/catalogue.toml"));

        let proxy_url = env_or_fallback("CRAWLFLOW_PROXY_URL", "PROXY_URL");
        let allow_direct = env_bool("CRAWLFLOW_ALLOW_DIRECT").unwrap_or(false);
        let egress = resolve_egress(
            proxy_url,
            env_or_fallback("CRAWLFLOW_PROXY_USERNAME", "PROXY_USERNAME"),
            env_or_fallback("CRAWLFLOW_PROXY_PASSWORD", "PROXY_PASSWORD"),
            allow_direct,
        )?;

        let browser_ws_url = env_or_fallback("CRAWLFLOW_BROWSER_WS_URL", "BROWSER_WS_URL");

        let session_ttl_secs = env_parse::<u64>("CRAWLFLOW_SESSION_TTL_SECS", 300).max(1);
        let partition_future_days = env_parse::<u32>("CRAWLFLOW_PARTITION_FUTURE_DAYS", 2);
        let partition_retention_days = env_parse::<u32>("CRAWLFLOW_PARTITION_RETENTION_DAYS", 14).max(1);
        let max_list_partition = env_parse::<u8>("CRAWLFLOW_MAX_LIST_PARTITION", 10).clamp(1, 99);

        let history_days = env_parse::<i64>("CRAWLFLOW_HISTORY_DAYS", 7).max(1);

        let notify_webhook_url =
            env_or_fallback("CRAWLFLOW_NOTIFY_WEBHOOK_URL", "NOTIFY_WEBHOOK_URL");

        let poll_interval_ms = env_parse::<u64>("CRAWLFLOW_POLL_INTERVAL_MS", 250).max(10);

        let log_format = match env_or_fallback("CRAWLFLOW_LOG_FORMAT", "LOG_FORMAT")
            .map(|s| s.to_lowercase())
            .as_deref()
        {
            Some("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let db_max_connections = env_parse::<u32>("CRAWLFLOW_DB_MAX_CONNECTIONS", 8).clamp(1, 64);
        let db_acquire_timeout_secs = env_parse::<u64>("CRAWLFLOW_DB_ACQUIRE_TIMEOUT_SECS", 10).clamp(1, 60);

        Ok(Self {
            database_url,
            redis_url,
            worker_id,
            queues,
            admin_addr,
            migrate_on_startup,
            catalogue_path,
            egress,
            browser_ws_url,
            session_ttl_secs,
            partition_future_days,
            partition_retention_days,
            max_list_partition,
            history_days,
            notify_webhook_url,
            poll_interval_ms,
            log_format,
            db_max_connections,
            db_acquire_timeout_secs,
        })
    }

    /// Whether this process should run `queue`.
    pub fn works_queue(&self, queue: &str) -> bool {
        self.queues
            .as_ref()
            .map_or(true, |qs| qs.iter().any(|q| q == queue))
    }
}

pub fn resolve_egress(
    proxy_url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    allow_direct: bool,
) -> anyhow::Result<Egress> {
    match proxy_url {
        Some(url) => Ok(Egress::Proxy(ProxyProfile {
            url,
            username,
            password,
        })),
        None if allow_direct => Ok(Egress::Direct),
        None => anyhow::bail!(
            "CRAWLFLOW_PROXY_URL is missing (set CRAWLFLOW_ALLOW_DIRECT=1 to fetch without a proxy)"
        ),
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
