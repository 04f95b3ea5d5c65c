//! Low-latency key/value store for session tokens, failed-job snapshots and
//! pagination cursors.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

pub mod memory;
pub mod redis_cache;

pub use memory::MemoryCache;
pub use redis_cache::RedisCache;

#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Stores `value`; a `ttl` of `None` keeps it until deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Stores only when `key` is absent; returns whether this call stored it.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Atomically reads and deletes. Of several concurrent callers on one key
    /// at most one sees the value.
    async fn take(&self, key: &str) -> Result<Option<String>>;

    async fn del(&self, key: &str) -> Result<()>;

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}
