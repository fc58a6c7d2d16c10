//! Shared session cache port.
//!
//! The cache is the only shared state between worker processes: task and
//! job sessions, task outputs, bot incarnation tokens and error markers all
//! live here. Writers are last-write-wins; nothing holds a lock.

mod memory;
#[cfg(feature = "cache-redis")]
mod redis_cache;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CacheError;
use crate::task::Session;

pub use memory::MemoryCache;
#[cfg(feature = "cache-redis")]
pub use redis_cache::RedisCache;

/// Cache name used when a task does not pick one.
pub const DEFAULT_CACHE: &str = "session";

/// Keyed store with per-entry TTL.
///
/// A `None` TTL keeps the entry until it is deleted.
#[async_trait]
pub trait SessionCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError>;

    /// Fetch several keys; missing keys are absent from the result.
    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Value>, CacheError>;

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Write only if the key is absent. Returns true if this call wrote it.
    async fn set_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    async fn delete_many(&self, keys: &[String]) -> Result<(), CacheError>;
}

/// Load and decode a task or job session.
pub async fn load_session(
    cache: &dyn SessionCache,
    key: &str,
) -> Result<Option<Session>, CacheError> {
    match cache.get(key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

pub async fn store_session(
    cache: &dyn SessionCache,
    key: &str,
    session: &Session,
    ttl: Duration,
) -> Result<(), CacheError> {
    let value = serde_json::to_value(session)?;
    tracing::trace!(key, "cache set session");
    cache.set(key, value, Some(ttl)).await
}

/// Connect the shared cache named by `redis_url`, or an in-process one.
///
/// An in-process cache is only handed out for single-node engines: a
/// distributed engine without a URL is an error, and so is a URL without the
/// `cache-redis` feature. Cached task pointers sent to the queue must resolve
/// on every worker.
pub async fn connect(
    redis_url: Option<&str>,
    distributed: bool,
) -> Result<Arc<dyn SessionCache>, CacheError> {
    match redis_url {
        None if distributed => Err(CacheError::Backend(
            "distributed mode needs a shared cache, set REDIS_URL".into(),
        )),
        None => Ok(Arc::new(MemoryCache::new())),
        #[cfg(feature = "cache-redis")]
        Some(url) => Ok(Arc::new(RedisCache::connect(url).await?)),
        #[cfg(not(feature = "cache-redis"))]
        Some(_) => Err(CacheError::Backend(
            "Redis cache requires the 'cache-redis' Cargo feature".into(),
        )),
    }
}
