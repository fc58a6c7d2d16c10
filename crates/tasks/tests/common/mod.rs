#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tempfile::TempDir;

use drover_queue::MemoryQueue;
use drover_tasks::poller::poll_once;
use drover_tasks::{
    Engine, EngineConfig, MemoryCache, QueueTier, Registry, Shutdown, Spooler, DEFAULT_CACHE,
};

/// Three tiers, no long polling, batches of ten.
pub const DISTRIBUTED_TOML: &str = r#"
[engine]
distributed = true
version = "7"
queue_prefix = "test"

[queues.HIGH]
long_poll_secs = 0
visibility_timeout_secs = 30
max_messages = 10
full_threshold = 100

[queues.MED]
long_poll_secs = 0
visibility_timeout_secs = 30
max_messages = 10
full_threshold = 100

[queues.LOW]
long_poll_secs = 0
visibility_timeout_secs = 30
max_messages = 10
full_threshold = 100
"#;

/// Distributed engine over in-memory queues, with a temp spool directory.
pub struct Harness {
    pub engine: Engine,
    pub cache: Arc<MemoryCache>,
    pub shutdown: Shutdown,
    queues: Vec<(QueueTier, Arc<MemoryQueue>)>,
    _spool: TempDir,
}

impl Harness {
    pub fn distributed(registry: Registry) -> Self {
        Self::with_config(EngineConfig::from_toml(DISTRIBUTED_TOML).unwrap(), registry)
    }

    pub fn with_config(config: EngineConfig, registry: Registry) -> Self {
        let spool = tempfile::tempdir().unwrap();
        let spooler = Spooler::open(spool.path(), &config.spool).unwrap();
        let cache = Arc::new(MemoryCache::new());

        let mut builder = Engine::builder(config)
            .registry(registry)
            .cache(DEFAULT_CACHE, cache.clone())
            .spooler(spooler);
        let mut queues = Vec::new();
        for tier in QueueTier::ALL {
            let queue = Arc::new(MemoryQueue::new(format!("test_{tier}.fifo")));
            builder = builder.queue(tier, queue.clone());
            queues.push((tier, queue));
        }

        Self {
            engine: builder.build().unwrap(),
            cache,
            shutdown: Shutdown::new(),
            queues,
            _spool: spool,
        }
    }

    pub fn queue(&self, tier: QueueTier) -> &MemoryQueue {
        self.queues
            .iter()
            .find(|(t, _)| *t == tier)
            .map(|(_, q)| q.as_ref())
            .unwrap()
    }

    pub async fn poll(&self, tier: QueueTier) -> usize {
        poll_once(&self.engine, tier, &self.shutdown).await.unwrap()
    }

    pub async fn drain(&self) -> usize {
        self.engine
            .spooler()
            .unwrap()
            .drain_once(&self.engine)
            .await
            .unwrap()
    }

    /// Poll every tier and drain the spool until nothing moves.
    pub async fn pump(&self) -> usize {
        let mut total = 0;
        for _ in 0..100 {
            let mut round = 0;
            for tier in QueueTier::ALL {
                round += self.poll(tier).await;
            }
            round += self.drain().await;
            if round == 0 {
                break;
            }
            total += round;
        }
        total
    }
}

/// Single-node engine without a spooler; spooled work runs on spawned tasks.
pub fn local(registry: Registry) -> (Engine, Arc<MemoryCache>) {
    let mut config = EngineConfig::local();
    config.engine.job_poll_attempts = 500;
    config.engine.job_poll_interval_secs = 0.01;

    let cache = Arc::new(MemoryCache::new());
    let engine = Engine::builder(config)
        .registry(registry)
        .cache(DEFAULT_CACHE, cache.clone())
        .build()
        .unwrap();
    (engine, cache)
}

/// Shared log that task functions append to.
#[derive(Clone, Default)]
pub struct Calls(Arc<Mutex<Vec<Value>>>);

impl Calls {
    pub fn push(&self, value: Value) {
        self.0.lock().unwrap().push(value);
    }

    pub fn take(&self) -> Vec<Value> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }
}
