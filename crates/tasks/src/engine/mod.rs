//! The engine handle.
//!
//! [`Engine`] bundles everything a process needs to send and run work: the
//! config, the function registry, the named session caches, one durable
//! queue per tier, and the local spooler. It is cheap to clone and is
//! handed to every task function through its [`TaskContext`](crate::TaskContext).

mod dispatch;
mod sender;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use drover_queue::DurableQueue;

use crate::cache::{MemoryCache, SessionCache, DEFAULT_CACHE};
use crate::config::EngineConfig;
use crate::error::{CacheError, ConfigError, EngineError};
use crate::job::JobPollConfig;
use crate::priority::QueueTier;
use crate::registry::Registry;
use crate::spooler::Spooler;
use crate::task::MessageReceipt;

pub use dispatch::{Dispatch, ERROR_LOG_PREFIX};
pub use sender::{Sent, HANDLER_ATTR, PRIORITY_ATTR, VERSION_ATTR};

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    config: EngineConfig,
    registry: Registry,
    caches: HashMap<String, Arc<dyn SessionCache>>,
    queues: HashMap<QueueTier, Arc<dyn DurableQueue>>,
    spooler: Option<Spooler>,
}

impl Engine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder {
            config,
            registry: Registry::new(),
            caches: HashMap::new(),
            queues: HashMap::new(),
            spooler: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Look up a session cache by name.
    pub fn cache(&self, name: &str) -> Result<&dyn SessionCache, CacheError> {
        self.inner
            .caches
            .get(name)
            .map(|cache| cache.as_ref())
            .ok_or_else(|| CacheError::Unknown(name.to_string()))
    }

    /// The cache holding bot tokens and other process-group state.
    pub fn default_cache(&self) -> Result<&dyn SessionCache, CacheError> {
        self.cache(&self.inner.config.engine.default_cache)
    }

    pub fn is_distributed(&self) -> bool {
        self.inner.config.engine.distributed()
    }

    pub fn job_poll(&self) -> JobPollConfig {
        self.inner.config.engine.job_poll()
    }

    pub fn queue(&self, tier: QueueTier) -> Option<&Arc<dyn DurableQueue>> {
        self.inner.queues.get(&tier)
    }

    pub fn spooler(&self) -> Option<&Spooler> {
        self.inner.spooler.as_ref()
    }

    /// Remove a received message from its queue.
    pub async fn delete_message(&self, receipt: &MessageReceipt) -> Result<(), EngineError> {
        let queue = self
            .queue(receipt.tier)
            .ok_or(EngineError::NoQueue(receipt.tier))?;
        queue.ack(&receipt.receipt_handle).await?;
        debug!(queue = %queue.name(), "deleted message");
        Ok(())
    }

    /// Delete a message, logging instead of failing.
    pub(crate) async fn delete_message_logged(&self, receipt: &MessageReceipt) {
        if let Err(e) = self.delete_message(receipt).await {
            warn!(tier = %receipt.tier, error = %e, "message delete failed");
        }
    }

    /// Configured pause for loops inside long-running tasks.
    ///
    /// With a loop counter, pauses only on every `breathe_every`th iteration.
    pub async fn breathe(&self, loop_counter: Option<u64>) {
        let spool = &self.inner.config.spool;
        let pause = spool.breathe();
        if pause.is_zero() {
            return;
        }
        if let Some(counter) = loop_counter {
            if spool.breathe_every > 0 && counter % spool.breathe_every != 0 {
                return;
            }
        }
        debug!(?pause, "breathing");
        tokio::time::sleep(pause).await;
    }
}

/// Assembles an [`Engine`].
pub struct EngineBuilder {
    config: EngineConfig,
    registry: Registry,
    caches: HashMap<String, Arc<dyn SessionCache>>,
    queues: HashMap<QueueTier, Arc<dyn DurableQueue>>,
    spooler: Option<Spooler>,
}

impl EngineBuilder {
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn cache(mut self, name: impl Into<String>, cache: Arc<dyn SessionCache>) -> Self {
        self.caches.insert(name.into(), cache);
        self
    }

    pub fn queue(mut self, tier: QueueTier, queue: Arc<dyn DurableQueue>) -> Self {
        self.queues.insert(tier, queue);
        self
    }

    pub fn spooler(mut self, spooler: Spooler) -> Self {
        self.spooler = Some(spooler);
        self
    }

    /// Finish the engine.
    ///
    /// The configured default cache falls back to an in-process cache, and
    /// the `session` cache name falls back to the default cache.
    pub fn build(mut self) -> Result<Engine, EngineError> {
        let default_name = self.config.engine.default_cache.clone();
        let default_cache = self
            .caches
            .entry(default_name.clone())
            .or_insert_with(|| {
                info!(cache = %default_name, "using in-process session cache");
                Arc::new(MemoryCache::new()) as Arc<dyn SessionCache>
            })
            .clone();
        self.caches
            .entry(DEFAULT_CACHE.to_string())
            .or_insert(default_cache);

        if self.config.engine.distributed() {
            if self.queues.is_empty() {
                return Err(ConfigError::Invalid(
                    "distributed engine needs at least one queue".into(),
                )
                .into());
            }
            for tier in QueueTier::ALL {
                if !self.queues.contains_key(&tier) {
                    warn!(%tier, "no queue for tier; sends at this tier will fail");
                }
            }
        }

        info!(
            distributed = self.config.engine.distributed(),
            version = %self.config.engine.version(),
            caches = self.caches.len(),
            queues = self.queues.len(),
            spooler = self.spooler.is_some(),
            functions = self.registry.names().len(),
            "engine ready"
        );

        Ok(Engine {
            inner: Arc::new(Inner {
                config: self.config,
                registry: self.registry,
                caches: self.caches,
                queues: self.queues,
                spooler: self.spooler,
            }),
        })
    }
}
