use async_trait::async_trait;
use chromiumoxide::browser::Browser;
use chromiumoxide::cdp::browser_protocol::network::{EnableParams, EventRequestWillBeSent};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::Page;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{CrawlError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PageResponse {
    pub status: u16,
    pub body: String,
}

/// One browser page. Not shared between concurrent tasks.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn goto(&self, url: &str) -> Result<()>;

    /// Headers of every request the page issues from now on.
    async fn request_headers(&self) -> Result<BoxStream<'static, HashMap<String, String>>>;

    /// Runs `fetch(url)` inside the page so it carries the page's cookies and origin.
    async fn fetch_in_page(&self, url: &str) -> Result<PageResponse>;
}

#[async_trait]
pub trait BrowserLease: Send {
    fn page(&self) -> Arc<dyn PageDriver>;

    /// Close page, close context, disconnect. Never fails; problems are logged.
    async fn release(self: Box<Self>);
}

#[async_trait]
pub trait BrowserConnector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn BrowserLease>>;
}

/// Runs `f` with a fresh page and releases the page, its context and the
/// browser connection afterwards, whether `f` succeeded or not. If the
/// returned future is dropped first, the release runs on a spawned task.
pub async fn with_browser_session<T, F, Fut>(connector: &dyn BrowserConnector, f: F) -> Result<T>
where
    F: FnOnce(Arc<dyn PageDriver>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let lease = connector.open().await?;
    let page = lease.page();
    let mut guard = ReleaseOnDrop(Some(lease));
    let out = f(page).await;
    if let Some(lease) = guard.0.take() {
        lease.release().await;
    }
    out
}

struct ReleaseOnDrop(Option<Box<dyn BrowserLease>>);

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        let Some(lease) = self.0.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(lease.release());
            }
            Err(_) => warn!("no runtime left to release the browser session"),
        }
    }
}

// ---- chromiumoxide ----

pub struct ChromiumConnector {
    ws_url: String,
}

impl ChromiumConnector {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            ws_url: ws_url.into(),
        }
    }
}

#[async_trait]
impl BrowserConnector for ChromiumConnector {
    async fn open(&self) -> Result<Box<dyn BrowserLease>> {
        let (browser, mut handler) = Browser::connect(self.ws_url.as_str())
            .await
            .map_err(|e| CrawlError::Browser(format!("connect {}: {e}", self.ws_url)))?;

        // the CDP handler must be polled for the connection to make progress
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        let mut session = ChromiumSession {
            browser,
            handler_task,
            context_id: None,
            page: None,
        };

        // 1) isolated context so cookies of one session never leak into another
        let context_id = match session
            .browser
            .execute(CreateBrowserContextParams::default())
            .await
        {
            Ok(resp) => resp.result.browser_context_id.clone(),
            Err(e) => {
                Box::new(session).release().await;
                return Err(CrawlError::Browser(format!("create context: {e}")));
            }
        };
        session.context_id = Some(context_id.clone());

        // 2) blank page inside it
        let mut target = CreateTargetParams::new("about:blank");
        target.browser_context_id = Some(context_id);
        let page = match session.browser.new_page(target).await {
            Ok(p) => p,
            Err(e) => {
                Box::new(session).release().await;
                return Err(CrawlError::Browser(format!("new page: {e}")));
            }
        };

        if let Err(e) = page.execute(EnableParams::default()).await {
            warn!(error = %e, "cannot enable network events");
        }

        session.page = Some(Arc::new(ChromiumPage { page }));
        Ok(Box::new(session))
    }
}

struct ChromiumSession {
    browser: Browser,
    handler_task: JoinHandle<()>,
    context_id: Option<BrowserContextId>,
    page: Option<Arc<ChromiumPage>>,
}

#[async_trait]
impl BrowserLease for ChromiumSession {
    fn page(&self) -> Arc<dyn PageDriver> {
        match &self.page {
            Some(p) => p.clone(),
            None => Arc::new(ClosedPage),
        }
    }

    async fn release(mut self: Box<Self>) {
        if let Some(page) = self.page.take() {
            if let Err(e) = page.page.clone().close().await {
                warn!(error = %e, "failed to close page");
            }
        }
        if let Some(id) = self.context_id.take() {
            if let Err(e) = self
                .browser
                .execute(DisposeBrowserContextParams::new(id))
                .await
            {
                warn!(error = %e, "failed to dispose browser context");
            }
        }
        self.handler_task.abort();
        debug!("browser session released");
    }
}

impl Drop for ChromiumSession {
    fn drop(&mut self) {
        self.handler_task.abort();
    }
}

pub struct ChromiumPage {
    page: Page,
}

#[async_trait]
impl PageDriver for ChromiumPage {
    async fn goto(&self, url: &str) -> Result<()> {
        self.page
            .goto(url)
            .await
            .map_err(|e| CrawlError::Browser(format!("goto {url}: {e}")))?;
        Ok(())
    }

    async fn request_headers(&self) -> Result<BoxStream<'static, HashMap<String, String>>> {
        let events = self
            .page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(|e| CrawlError::Browser(format!("request listener: {e}")))?;

        Ok(events
            .map(|event| header_map(serde_json::to_value(&event.request.headers).ok()))
            .boxed())
    }

    async fn fetch_in_page(&self, url: &str) -> Result<PageResponse> {
        let url_literal = serde_json::to_string(url)?;
        let script = format!(
            "fetch({url_literal}, {{ credentials: 'include' }})\
             .then(async (r) => ({{ status: r.status, body: await r.text() }}))"
        );
        let params = EvaluateParams::builder()
            .expression(script)
            .await_promise(true)
            .return_by_value(true)
            .build()
            .map_err(CrawlError::Browser)?;

        let result = self
            .page
            .evaluate_expression(params)
            .await
            .map_err(|e| CrawlError::Browser(format!("in-page fetch {url}: {e}")))?;

        result
            .into_value::<PageResponse>()
            .map_err(|e| CrawlError::Browser(format!("in-page fetch {url} returned junk: {e}")))
    }
}

fn header_map(value: Option<Value>) -> HashMap<String, String> {
    let Some(Value::Object(map)) = value else {
        return HashMap::new();
    };
    map.into_iter()
        .filter_map(|(k, v)| match v {
            Value::String(s) => Some((k, s)),
            Value::Null => None,
            other => Some((k, other.to_string())),
        })
        .collect()
}

struct ClosedPage;

#[async_trait]
impl PageDriver for ClosedPage {
    async fn goto(&self, _url: &str) -> Result<()> {
        Err(CrawlError::Browser("page already closed".into()))
    }

    async fn request_headers(&self) -> Result<BoxStream<'static, HashMap<String, String>>> {
        Err(CrawlError::Browser("page already closed".into()))
    }

    async fn fetch_in_page(&self, _url: &str) -> Result<PageResponse> {
        Err(CrawlError::Browser("page already closed".into()))
    }
}


#[cfg(test)]
mod tests {
    use super::fake::{FakeConnector, FakePage};
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn session_is_released_after_success() {
        let connector = FakeConnector::new(Arc::new(FakePage::default()));
        let out = with_browser_session(&connector, |page| async move {
            page.goto("https://app.example.com").await?;
            Ok(7)
        })
        .await
        .unwrap();

        assert_eq!(out, 7);
        assert_eq!(
            connector.events(),
            vec!["open", "close_page", "close_context", "disconnect"]
        );
    }

    #[tokio::test]
    async fn session_is_released_after_failure() {
        let connector = FakeConnector::new(Arc::new(FakePage::default()));
        let out: Result<()> = with_browser_session(&connector, |_page| async move {
            Err(CrawlError::Browser("target crashed".into()))
        })
        .await;

        assert!(out.is_err());
        assert_eq!(
            connector.events(),
            vec!["open", "close_page", "close_context", "disconnect"]
        );
    }

    #[tokio::test]
    async fn session_is_released_when_the_caller_gives_up() {
        let connector = FakeConnector::new(Arc::new(FakePage::default()));
        let out = tokio::time::timeout(
            Duration::from_millis(20),
            with_browser_session(&connector, |_page| async move {
                std::future::pending::<Result<()>>().await
            }),
        )
        .await;
        assert!(out.is_err());

        for _ in 0..50 {
            if connector.events().last() == Some(&"disconnect") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            connector.events(),
            vec!["open", "close_page", "close_context", "disconnect"]
        );
    }

    #[test]
    fn header_values_are_stringified() {
        let map = header_map(Some(serde_json::json!({
            "x-nonce": "abc",
            "x-timestamp": 17,
            "x-empty": null
        })));
        assert_eq!(map.get("x-nonce").map(String::as_str), Some("abc"));
        assert_eq!(map.get("x-timestamp").map(String::as_str), Some("17"));
        assert!(!map.contains_key("x-empty"));
    }
}
