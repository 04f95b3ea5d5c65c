use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use super::browser::with_browser_session;
use super::harvester::TokenHarvester;
use crate::catalogue::{FetchMode, SessionSpec, SourceSpec};
use crate::error::{CrawlError, ErrorCode, Result};
use crate::fetch::{request_url, FetchClient, RequestSpec};
use crate::retry::{retry_with_backoff, Backoff, RetryPolicy};

/// Fetch client that adds harvested credentials for sources that need them,
/// or runs the request inside the browser page for `in_page` sources.
#[derive(Clone)]
pub struct SignedFetch {
    client: FetchClient,
    harvesters: HashMap<String, Arc<TokenHarvester>>,
}

impl SignedFetch {
    pub fn new(client: FetchClient) -> Self {
        Self {
            client,
            harvesters: HashMap::new(),
        }
    }

    pub fn with_harvester(mut self, source: &str, harvester: Arc<TokenHarvester>) -> Self {
        self.harvesters.insert(source.to_string(), harvester);
        self
    }

    pub fn client(&self) -> &FetchClient {
        &self.client
    }

    pub fn harvester(&self, source: &str) -> Option<&Arc<TokenHarvester>> {
        self.harvesters.get(source)
    }

    /// On `SESSION_EXPIRED` the cached token is dropped and one fresh
    /// token is tried before the error reaches the job.
    pub async fn fetch(&self, source: &SourceSpec, req: &RequestSpec) -> Result<Value> {
        if !source.requires_session {
            return self.client.fetch(source, req).await;
        }

        let (harvester, spec) = match (self.harvesters.get(&source.name), &source.session) {
            (Some(h), Some(spec)) => (h, spec),
            _ => {
                return Err(CrawlError::Config(format!(
                    "source {:?} requires a session but no browser is configured",
                    source.name
                )))
            }
        };

        if source.fetch_mode == FetchMode::InPage {
            return self.fetch_in_page(harvester, spec, source, req).await;
        }

        let policy = RetryPolicy::new(2, Backoff::fixed(0));
        retry_with_backoff(
            &policy,
            |attempt| async move {
                if attempt > 0 {
                    info!(source = %source.name, "session expired, harvesting a new token");
                    harvester.invalidate().await?;
                }
                let token = harvester.get_token().await?;
                let mut signed = req.clone();
                signed.headers.extend(token.headers(spec));
                self.client.fetch(source, &signed).await
            },
            |e| e.code() == ErrorCode::SessionExpired,
        )
        .await
    }

    async fn fetch_in_page(
        &self,
        harvester: &TokenHarvester,
        spec: &SessionSpec,
        source: &SourceSpec,
        req: &RequestSpec,
    ) -> Result<Value> {
        let url = request_url(source, req)?;
        self.client.wait_for_slot(source).await;

        with_browser_session(harvester.connector(), |page| async move {
            page.goto(&spec.warmup_url).await?;
            harvester
                .page_driven_fetch(source, &url, page.as_ref(), spec.page_fetch_retries)
                .await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::clock::{Clock, SystemClock};
    use crate::config::Egress;
    use crate::session::browser::fake::{FakeConnector, FakePage};
    use crate::session::browser::PageResponse;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn signed(nonce: &str) -> HashMap<String, String> {
        [
            ("x-nonce", nonce),
            ("x-signature", "sig"),
            ("x-timestamp", "1700000000000"),
            ("x-version", "3"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    fn source(base_url: &str) -> SourceSpec {
        toml::from_str(&format!(
            r#"
name = "chain_app"
base_url = "{base_url}"
requires_session = true
session_expired_codes = ["40101"]

[session]
warmup_url = "https://app.example.com/whales"
harvest_timeout_ms = 200
"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn re_harvests_once_on_expired_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/whales"))
            .and(header("x-nonce", "stale"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/whales"))
            .and(header("x-nonce", "fresh"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": ["0xabc"]})),
            )
            .mount(&server)
            .await;

        let page = Arc::new(FakePage::default());
        page.header_batches
            .lock()
            .unwrap()
            .extend([vec![signed("stale")], vec![signed("fresh")]]);
        let src = source(&server.uri());
        let cache = Arc::new(MemoryCache::new(Arc::new(SystemClock) as Arc<dyn Clock>));
        let harvester = Arc::new(TokenHarvester::new(
            "chain_app",
            src.session.clone().unwrap(),
            Duration::from_secs(300),
            cache,
            Arc::new(FakeConnector::new(page.clone())),
        ));

        let fetch = SignedFetch::new(FetchClient::new(&Egress::Direct).unwrap())
            .with_harvester("chain_app", harvester);
        let body = fetch
            .fetch(&src, &RequestSpec::new("/api/whales"))
            .await
            .unwrap();

        assert_eq!(body["data"][0], "0xabc");
        assert_eq!(page.visits().len(), 2, "one warm-up per token");
    }

    #[tokio::test]
    async fn in_page_sources_are_fetched_through_the_browser() {
        let page = Arc::new(FakePage::default());
        page.responses.lock().unwrap().extend([
            Ok(PageResponse {
                status: 403,
                body: "blocked".into(),
            }),
            Ok(PageResponse {
                status: 200,
                body: r#"{"data": {"list": ["BTCUSDT"]}}"#.into(),
            }),
        ]);
        let mut src = source("https://www.exchange.example/api");
        src.fetch_mode = FetchMode::InPage;
        let cache = Arc::new(MemoryCache::new(Arc::new(SystemClock) as Arc<dyn Clock>));
        let connector = Arc::new(FakeConnector::new(page.clone()));
        let harvester = Arc::new(TokenHarvester::new(
            "chain_app",
            src.session.clone().unwrap(),
            Duration::from_secs(300),
            cache,
            connector.clone(),
        ));

        let fetch = SignedFetch::new(FetchClient::new(&Egress::Direct).unwrap())
            .with_harvester("chain_app", harvester);
        let body = fetch
            .fetch(&src, &RequestSpec::new("/futures/open-interest").param("page_size", 50))
            .await
            .unwrap();

        assert_eq!(body["data"]["list"][0], "BTCUSDT");
        // warm-up, then one trip to the recovery page after the 403
        assert_eq!(
            page.visits(),
            vec![
                "https://app.example.com/whales",
                "https://app.example.com/whales"
            ]
        );
        assert_eq!(
            page.fetched(),
            vec![
                "https://www.exchange.example/api/futures/open-interest?page_size=50",
                "https://www.exchange.example/api/futures/open-interest?page_size=50"
            ]
        );
        assert_eq!(
            connector.events(),
            vec!["open", "close_page", "close_context", "disconnect"]
        );
    }

    #[tokio::test]
    async fn session_source_without_browser_is_a_config_error() {
        let src = source("http://127.0.0.1:9");
        let fetch = SignedFetch::new(FetchClient::new(&Egress::Direct).unwrap());
        let err = fetch
            .fetch(&src, &RequestSpec::new("/api/whales"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Config);
    }
}
