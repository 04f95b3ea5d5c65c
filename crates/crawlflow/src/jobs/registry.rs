use std::{collections::HashMap, pin::Pin, sync::Arc, time::Duration};
use tokio::{sync::Semaphore, time::timeout};

use crate::error::{CrawlError, Result};
use crate::jobs::model::Job;

pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
type HandlerFn<C> = dyn for<'a> Fn(&'a Job, &'a C) -> BoxFuture<'a, Result<()>> + Send + Sync;

pub struct HandlerEntry<C> {
    pub handler: Arc<HandlerFn<C>>,
    pub semaphore: Option<Arc<Semaphore>>,
    pub timeout: Option<Duration>,
}

impl<C> Clone for HandlerEntry<C> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            semaphore: self.semaphore.clone(),
            timeout: self.timeout,
        }
    }
}

/// Job name to handler. `C` is whatever the handlers need at run time.
pub struct HandlerRegistry<C> {
    handlers: HashMap<String, HandlerEntry<C>>,
}

impl<C> Default for HandlerRegistry<C> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<C: Send + Sync + 'static> HandlerRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: for<'a> Fn(&'a Job, &'a C) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        self.register_with_options(name, handler, HandlerOptions::new());
    }

    pub fn register_with_options<F>(&mut self, name: &str, handler: F, opts: HandlerOptions)
    where
        F: for<'a> Fn(&'a Job, &'a C) -> BoxFuture<'a, Result<()>> + Send + Sync + 'static,
    {
        let semaphore = opts
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        self.handlers.insert(
            name.to_string(),
            HandlerEntry {
                handler: Arc::new(handler),
                semaphore,
                timeout: opts.timeout,
            },
        );
    }

    pub fn handler_for(&self, name: &str) -> Option<HandlerEntry<C>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Fails unless every name in `names` has a handler. Called at startup
    /// with the names producers will enqueue.
    pub fn ensure_registered<'n>(&self, names: impl IntoIterator<Item = &'n str>) -> Result<()> {
        let missing: Vec<&str> = names
            .into_iter()
            .filter(|n| !self.handlers.contains_key(*n))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(CrawlError::InvalidJobName(missing.join(", ")))
        }
    }

    /// Runs the handler for `job.name`; unknown names fail fast.
    pub async fn dispatch(&self, job: &Job, ctx: &C) -> Result<()> {
        match self.handler_for(&job.name) {
            Some(entry) => entry.run(job, ctx).await,
            None => Err(CrawlError::InvalidJobName(format!(
                "no handler for {:?} on queue {}",
                job.name, job.queue
            ))),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct HandlerOptions {
    max_concurrency: Option<usize>,
    timeout: Option<Duration>,
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    pub fn timeout(mut self, dur: Duration) -> Self {
        self.timeout = Some(dur);
        self
    }
}

impl<C> HandlerEntry<C> {
    pub async fn run(&self, job: &Job, ctx: &C) -> Result<()> {
        let _permit = match &self.semaphore {
            Some(sem) => Some(
                sem.clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| CrawlError::Config("handler semaphore closed".into()))?,
            ),
            None => None,
        };

        let fut = (self.handler)(job, ctx);
        match self.timeout {
            Some(dur) => match timeout(dur, fut).await {
                Ok(inner) => inner,
                Err(_) => Err(CrawlError::Timeout(dur.as_millis())),
            },
            None => fut.await,
        }
    }
}

pub fn boxed<'a, T>(fut: impl std::future::Future<Output = T> + Send + 'a) -> BoxFuture<'a, T> {
    Box::pin(fut)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn job(name: &str) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            queue: "crawl".into(),
            name: name.into(),
            job_key: None,
            payload_json: json!({}),
            opts_json: json!({}),
            run_at: now,
            status: "running".into(),
            priority: 0,
            max_attempts: 1,
            attempts_made: 0,
            stalled_count: 0,
            locked_at: None,
            locked_by: None,
            lock_expires_at: None,
            last_error_code: None,
            last_error_message: None,
            failed_reason: None,
            finished_at: None,
            keep_until: None,
            replay_of_job_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn unknown_names_fail_fast() {
        let registry: HandlerRegistry<()> = HandlerRegistry::new();
        let err = registry.dispatch(&job("ghost"), &()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidJobName);
    }

    #[test]
    fn ensure_registered_names_the_missing_handlers() {
        let mut registry: HandlerRegistry<()> = HandlerRegistry::new();
        registry.register("plan", |_, _| boxed(async { Ok(()) }));
        assert!(registry.ensure_registered(["plan"]).is_ok());
        let err = registry.ensure_registered(["plan", "page"]).unwrap_err();
        assert!(err.to_string().contains("page"));
    }

    #[tokio::test]
    async fn timeout_maps_to_timeout_code() {
        let mut registry: HandlerRegistry<()> = HandlerRegistry::new();
        registry.register_with_options(
            "slow",
            |_, _| {
                boxed(async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                })
            },
            HandlerOptions::new().timeout(Duration::from_millis(10)),
        );
        let err = registry.dispatch(&job("slow"), &()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Timeout);
    }

    #[tokio::test]
    async fn handlers_receive_the_context() {
        let mut registry: HandlerRegistry<AtomicUsize> = HandlerRegistry::new();
        registry.register("count", |_, ctx| {
            boxed(async move {
                ctx.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        let ctx = AtomicUsize::new(0);
        registry.dispatch(&job("count"), &ctx).await.unwrap();
        registry.dispatch(&job("count"), &ctx).await.unwrap();
        assert_eq!(ctx.load(Ordering::SeqCst), 2);
    }
}
