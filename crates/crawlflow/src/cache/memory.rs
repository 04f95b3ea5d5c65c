use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::KvCache;
use crate::clock::Clock;
use crate::error::{CrawlError, Result};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

/// In-process cache; expiry is evaluated lazily against the injected clock.
pub struct MemoryCache {
    entries: Mutex<BTreeMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            clock,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| CrawlError::Cache("memory cache poisoned".into()))
    }

    fn live(&self, entry: &Entry) -> bool {
        entry.expires_at.map_or(true, |at| at > self.clock.now())
    }
}

#[async_trait]
impl KvCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.lock()?;
        match entries.get(key) {
            Some(e) if self.live(e) => Ok(Some(e.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at = match ttl {
            Some(ttl) => Some(
                self.clock.now()
                    + chrono::Duration::from_std(ttl)
                        .map_err(|e| CrawlError::Cache(e.to_string()))?,
            ),
            None => None,
        };
        self.lock()?.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let expires_at = self.clock.now()
            + chrono::Duration::from_std(ttl).map_err(|e| CrawlError::Cache(e.to_string()))?;
        let mut entries = self.lock()?;
        if entries.get(key).is_some_and(|e| self.live(e)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(expires_at),
            },
        );
        Ok(true)
    }

    async fn take(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.lock()?;
        Ok(entries
            .remove(key)
            .filter(|e| self.live(e))
            .map(|e| e.value))
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.lock()?;
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .filter(|(_, e)| self.live(e))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
