//! Execution context handed to every task function.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::debug;

use crate::cache;
use crate::engine::Engine;
use crate::error::{CacheError, TaskError};
use crate::job::Job;
use crate::output::output_key;
use crate::task::{MessageReceipt, Session, Task};

/// How a task function finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    /// Leave the queue message alone so its visibility timeout redelivers it.
    Retry,
    /// Business failure. Recorded as output and treated as done.
    Failed(String),
}

/// The task descriptor plus everything a function needs to do its work.
#[derive(Clone)]
pub struct TaskContext {
    engine: Engine,
    session: Session,
    kwargs: Map<String, Value>,
    args: Vec<Value>,
    message: Option<MessageReceipt>,
    finalized: Arc<AtomicBool>,
}

impl TaskContext {
    pub(crate) fn new(
        engine: Engine,
        session: Session,
        kwargs: Map<String, Value>,
        args: Vec<Value>,
        message: Option<MessageReceipt>,
    ) -> Self {
        Self {
            engine,
            session,
            kwargs,
            args,
            message,
            finalized: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn task(&self) -> &Task {
        self.session.task()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// The job record, when this context runs a job's completion check.
    pub fn job(&self) -> Option<&Job> {
        self.session.as_job()
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    /// Decode a required kwarg.
    pub fn kwarg_as<T: DeserializeOwned>(&self, name: &str) -> Result<T, TaskError> {
        let value = self
            .kwargs
            .get(name)
            .cloned()
            .ok_or_else(|| TaskError::Failed(format!("missing kwarg '{name}'")))?;
        Ok(serde_json::from_value(value)?)
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn message(&self) -> Option<&MessageReceipt> {
        self.message.as_ref()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    /// Publish `output` under the task's output key and delete its session,
    /// which is how a job observes that this task is done.
    pub async fn finalize(&self, output: Value) -> Result<(), CacheError> {
        self.finalized.store(true, Ordering::SeqCst);
        let task = self.task();
        if !task.is_cached() {
            return Ok(());
        }
        let key = task.cache_key();
        let cache = task.cache(&self.engine)?;
        debug!(task = %task.label(), "finalizing");
        cache.set(&output_key(&key), output, Some(task.ttl())).await?;
        cache.delete(&key).await
    }

    /// Load the owning job from the cache.
    pub async fn load_job(&self) -> Result<Option<Job>, CacheError> {
        let Some(job_ref) = self.task().job.as_ref() else {
            return Ok(None);
        };
        let cache = self.engine.cache(&job_ref.cache_name)?;
        match cache::load_session(cache, &job_ref.task_key).await? {
            Some(Session::Job(job)) => Ok(Some(job)),
            _ => Ok(None),
        }
    }

    /// Throttle pause for loops inside long-running tasks.
    pub async fn breathe(&self, loop_counter: Option<u64>) {
        self.engine.breathe(loop_counter).await
    }
}
