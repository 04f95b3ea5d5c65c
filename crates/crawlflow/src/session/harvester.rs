use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::browser::{with_browser_session, BrowserConnector, PageDriver};
use super::token::{token_key, SessionToken};
use crate::cache::KvCache;
use crate::catalogue::{SessionSpec, SourceSpec};
use crate::error::{CrawlError, FetchError, Result};
use crate::fetch::client::classify;
use crate::retry::{retry_with_backoff, Backoff, RetryPolicy};

const RECOVERY_PAUSE_MS: u64 = 500;

/// Obtains signed credentials for one source by watching a real browser
/// session, and shares them through the cache.
pub struct TokenHarvester {
    source: String,
    spec: SessionSpec,
    ttl: Duration,
    cache: Arc<dyn KvCache>,
    connector: Arc<dyn BrowserConnector>,
    // one browser warm-up at a time per source and process
    refreshing: Mutex<()>,
}

impl TokenHarvester {
    pub fn new(
        source: impl Into<String>,
        spec: SessionSpec,
        ttl: Duration,
        cache: Arc<dyn KvCache>,
        connector: Arc<dyn BrowserConnector>,
    ) -> Self {
        Self {
            source: source.into(),
            spec,
            ttl,
            cache,
            connector,
            refreshing: Mutex::new(()),
        }
    }

    pub fn spec(&self) -> &SessionSpec {
        &self.spec
    }

    pub fn connector(&self) -> &dyn BrowserConnector {
        self.connector.as_ref()
    }

    /// Cache first; opens a browser session only on a miss.
    pub async fn get_token(&self) -> Result<SessionToken> {
        if let Some(token) = self.cached().await? {
            return Ok(token);
        }

        let _guard = self.refreshing.lock().await;
        // another task may have refreshed while we waited
        if let Some(token) = self.cached().await? {
            return Ok(token);
        }

        with_browser_session(self.connector.as_ref(), |page| async move {
            self.refresh(page.as_ref()).await
        })
        .await
    }

    /// Navigates `page` to the warm-up URL and waits for a request carrying
    /// all four credential headers.
    pub async fn refresh(&self, page: &dyn PageDriver) -> Result<SessionToken> {
        let mut requests = page.request_headers().await?;
        page.goto(&self.spec.warmup_url).await?;

        let wait = Duration::from_millis(self.spec.harvest_timeout_ms);
        let spec = &self.spec;
        let found = tokio::time::timeout(wait, async {
            while let Some(headers) = requests.next().await {
                if let Some(token) = SessionToken::from_headers(&headers, spec) {
                    return Some(token);
                }
            }
            None
        })
        .await
        .ok()
        .flatten();

        let token = found.ok_or_else(|| {
            CrawlError::Browser(format!(
                "no signed request observed on {} within {}ms",
                self.spec.warmup_url, self.spec.harvest_timeout_ms
            ))
        })?;

        self.store(&token).await?;
        info!(source = %self.source, version = %token.version, "harvested session token");
        Ok(token)
    }

    pub async fn invalidate(&self) -> Result<()> {
        self.cache.del(&token_key(&self.source)).await
    }

    /// Fetches `url` from inside the page. After a timeout, a browser error
    /// or a non-200 the page goes back to the recovery URL before the next
    /// attempt. A 200 is classified like any other answer from `source`.
    pub async fn page_driven_fetch(
        &self,
        source: &SourceSpec,
        url: &str,
        page: &dyn PageDriver,
        retry: u32,
    ) -> Result<Value> {
        let policy = RetryPolicy::new(retry, Backoff::fixed(RECOVERY_PAUSE_MS));
        let wait = Duration::from_millis(self.spec.harvest_timeout_ms);

        let result = retry_with_backoff(
            &policy,
            |attempt| async move {
                let outcome = match tokio::time::timeout(wait, page.fetch_in_page(url)).await {
                    Err(_) => Err(CrawlError::Timeout(wait.as_millis())),
                    Ok(Err(e)) => Err(e),
                    Ok(Ok(resp)) if resp.status == 200 => {
                        return classify(source, 200, &resp.body);
                    }
                    Ok(Ok(resp)) => Err(CrawlError::Fetch(FetchError {
                        status: resp.status,
                        error_code: None,
                        message: truncate(&resp.body),
                    })),
                };

                debug!(attempt, %url, "in-page fetch failed, returning to recovery page");
                if let Err(e) = page.goto(self.spec.recovery_url()).await {
                    warn!(error = %e, "recovery navigation failed");
                }
                outcome
            },
            recoverable,
        )
        .await;

        result.map_err(|e| {
            if recoverable(&e) {
                CrawlError::Browser(format!(
                    "in-page fetch of {url} failed after {} attempts: {e}",
                    policy.max_attempts
                ))
            } else {
                e
            }
        })
    }

    async fn cached(&self) -> Result<Option<SessionToken>> {
        let Some(raw) = self.cache.get(&token_key(&self.source)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(token) => Ok(Some(token)),
            Err(e) => {
                warn!(source = %self.source, error = %e, "dropping unreadable cached token");
                self.invalidate().await?;
                Ok(None)
            }
        }
    }

    async fn store(&self, token: &SessionToken) -> Result<()> {
        let raw = serde_json::to_string(token)?;
        self.cache
            .set(&token_key(&self.source), &raw, Some(self.ttl))
            .await
    }
}

/// Failures a trip to the recovery page can clear.
fn recoverable(e: &CrawlError) -> bool {
    match e {
        CrawlError::Timeout(_) | CrawlError::Browser(_) => true,
        CrawlError::Fetch(f) => f.status != 200,
        _ => false,
    }
}

fn truncate(body: &str) -> String {
    body.chars().take(200).collect()
}
