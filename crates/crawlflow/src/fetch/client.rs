use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Jitter, Quota, RateLimiter as GovernorRateLimiter,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use super::lookup;
use crate::catalogue::SourceSpec;
use crate::config::Egress;
use crate::error::{CrawlError, FetchError, Result};

type SourceLimiter = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

const MAX_MESSAGE_CHARS: usize = 300;

#[derive(Debug, Clone, Default)]
pub struct RequestSpec {
    pub endpoint: String,
    pub params: BTreeMap<String, String>,
    pub headers: Vec<(String, String)>,
}

impl RequestSpec {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            ..Default::default()
        }
    }

    pub fn params(mut self, params: &BTreeMap<String, String>) -> Self {
        self.params
            .extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn param(mut self, key: &str, value: impl ToString) -> Self {
        self.params.insert(key.to_string(), value.to_string());
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// Outbound client for source APIs. Every request goes through the process
/// proxy and the source's rate limiter; nothing is retried here.
#[derive(Clone)]
pub struct FetchClient {
    http: reqwest::Client,
    limiters: Arc<RwLock<HashMap<String, Arc<SourceLimiter>>>>,
}

impl FetchClient {
    pub fn new(egress: &Egress) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .connect_timeout(Duration::from_secs(10));

        if let Egress::Proxy(profile) = egress {
            let mut proxy = reqwest::Proxy::all(&profile.url)
                .map_err(|e| CrawlError::Config(format!("invalid proxy url: {e}")))?;
            if let Some(user) = &profile.username {
                proxy = proxy.basic_auth(user, profile.password.as_deref().unwrap_or_default());
            }
            builder = builder.proxy(proxy);
        } else {
            builder = builder.no_proxy();
        }

        let http = builder
            .build()
            .map_err(|e| CrawlError::Config(format!("cannot build http client: {e}")))?;

        Ok(Self {
            http,
            limiters: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub async fn fetch(&self, source: &SourceSpec, req: &RequestSpec) -> Result<Value> {
        self.wait_for_slot(source).await;

        let url = join_url(&source.base_url, &req.endpoint);
        let mut builder = self
            .http
            .get(&url)
            .query(&req.params)
            .timeout(Duration::from_secs(source.timeout_secs.max(1)));
        for (name, value) in source.headers.iter() {
            builder = builder.header(name.as_str(), value.as_str());
        }
        for (name, value) in &req.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let resp = builder
            .send()
            .await
            .map_err(|e| send_error(source, &url, e))?;
        let status = resp.status().as_u16();
        let text = resp
            .text()
            .await
            .map_err(|e| send_error(source, &url, e))?;

        debug!(source = %source.name, %url, status, bytes = text.len(), "fetched");
        classify(source, status, &text)
    }

    /// Waits for the source's rate limiter without sending anything.
    pub(crate) async fn wait_for_slot(&self, source: &SourceSpec) {
        let Some(rps) = source.requests_per_second.and_then(NonZeroU32::new) else {
            return;
        };

        let existing = self.limiters.read().await.get(&source.name).cloned();
        let limiter = match existing {
            Some(l) => l,
            None => {
                let mut limiters = self.limiters.write().await;
                limiters
                    .entry(source.name.clone())
                    .or_insert_with(|| Arc::new(GovernorRateLimiter::direct(Quota::per_second(rps))))
                    .clone()
            }
        };

        limiter
            .until_ready_with_jitter(Jitter::up_to(Duration::from_millis(50)))
            .await;
    }
}

fn join_url(base: &str, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

/// Absolute URL of `req` against `source`, query string included.
pub fn request_url(source: &SourceSpec, req: &RequestSpec) -> Result<String> {
    let url = join_url(&source.base_url, &req.endpoint);
    reqwest::Url::parse_with_params(&url, &req.params)
        .map(String::from)
        .map_err(|e| CrawlError::Config(format!("{}: bad url {url:?}: {e}", source.name)))
}

fn send_error(source: &SourceSpec, url: &str, e: reqwest::Error) -> CrawlError {
    if e.is_timeout() {
        CrawlError::Timeout(u128::from(source.timeout_secs) * 1000)
    } else {
        CrawlError::Transport(format!("{} {url}: {e}", source.name))
    }
}

/// Maps an answer to success or a typed error.
///
/// Success is HTTP 200 whose `error_code_field` is absent or null.
pub fn classify(source: &SourceSpec, status: u16, text: &str) -> Result<Value> {
    let body: Option<Value> = serde_json::from_str(text).ok();
    let error_code = body
        .as_ref()
        .and_then(|b| lookup(b, &source.error_code_field))
        .filter(|v| !v.is_null())
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });

    let message = body
        .as_ref()
        .and_then(|b| {
            ["error_message", "message", "error"]
                .iter()
                .find_map(|k| b.get(*k).and_then(Value::as_str))
        })
        .map(str::to_string)
        .unwrap_or_else(|| truncate(text));

    let in_list = |codes: &[String]| {
        error_code
            .as_deref()
            .is_some_and(|c| codes.iter().any(|x| x == c))
    };

    if status == 429 || in_list(&source.rate_limit_codes) {
        return Err(CrawlError::RateLimited {
            origin: source.name.clone(),
            message,
        });
    }
    if status == 401 || in_list(&source.session_expired_codes) {
        return Err(CrawlError::SessionExpired(format!("{}: {message}", source.name)));
    }
    if status == 407 {
        return Err(CrawlError::Transport(format!("proxy rejected credentials: {message}")));
    }

    match (status, error_code, body) {
        (200, None, Some(body)) => Ok(body),
        (200, None, None) => Err(CrawlError::DataShape(format!(
            "{} answered 200 with a non-JSON body: {}",
            source.name,
            truncate(text)
        ))),
        (status, error_code, _) => Err(CrawlError::Fetch(FetchError {
            status,
            error_code,
            message,
        })),
    }
}

fn truncate(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(MAX_MESSAGE_CHARS) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
