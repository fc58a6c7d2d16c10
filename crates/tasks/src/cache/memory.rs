use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use super::SessionCache;
use crate::error::CacheError;

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Minimum gap between expired-entry sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

struct Store {
    entries: HashMap<String, Entry>,
    next_sweep: Instant,
}

impl Store {
    /// Drop expired entries once the sweep interval has passed. Runs on
    /// writes, so keys that are never read again still get evicted.
    fn sweep(&mut self, now: Instant) {
        if now < self.next_sweep {
            return;
        }
        let before = self.entries.len();
        self.entries.retain(|_, e| e.live(now));
        let evicted = before - self.entries.len();
        if evicted > 0 {
            tracing::trace!(evicted, "memory cache sweep");
        }
        self.next_sweep = now + SWEEP_INTERVAL;
    }
}

/// Process-local cache. Single-node deployments and tests.
pub struct MemoryCache {
    store: Mutex<Store>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self {
            store: Mutex::new(Store {
                entries: HashMap::new(),
                next_sweep: Instant::now() + SWEEP_INTERVAL,
            }),
        }
    }
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Store>, CacheError> {
        self.store
            .lock()
            .map_err(|e| CacheError::Backend(format!("memory cache lock poisoned: {e}")))
    }

    /// Live entries, for diagnostics.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.store
            .lock()
            .map(|s| s.entries.values().filter(|e| e.live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn entry(value: Value, ttl: Option<Duration>) -> Entry {
    Entry {
        value,
        expires_at: ttl.map(|ttl| Instant::now() + ttl),
    }
}

#[async_trait]
impl SessionCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, CacheError> {
        let now = Instant::now();
        let mut store = self.lock()?;
        match store.entries.get(key) {
            Some(e) if e.live(now) => Ok(Some(e.value.clone())),
            Some(_) => {
                store.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, Value>, CacheError> {
        let now = Instant::now();
        let store = self.lock()?;
        Ok(keys
            .iter()
            .filter_map(|k| {
                store
                    .entries
                    .get(k)
                    .filter(|e| e.live(now))
                    .map(|e| (k.clone(), e.value.clone()))
            })
            .collect())
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut store = self.lock()?;
        store.sweep(Instant::now());
        store.entries.insert(key.to_string(), entry(value, ttl));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut store = self.lock()?;
        store.sweep(now);
        if store.entries.get(key).is_some_and(|e| e.live(now)) {
            return Ok(false);
        }
        store.entries.insert(key.to_string(), entry(value, ttl));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.lock()?.entries.remove(key);
        Ok(())
    }

    async fn delete_many(&self, keys: &[String]) -> Result<(), CacheError> {
        let mut store = self.lock()?;
        for key in keys {
            store.entries.remove(key);
        }
        Ok(())
    }
}
