//! Function registry.
//!
//! Queue messages and spool files name their function by a stable string,
//! so every function a process may run is registered once, up front, in an
//! explicit table. Duplicate names fail registration; unknown names fail
//! dispatch.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::context::{TaskContext, TaskOutcome};
use crate::error::{RegistryError, TaskError};
use crate::job::{job_done, JOB_DONE};

/// A registered unit of work.
#[async_trait]
pub trait TaskFn: Send + Sync {
    async fn call(&self, ctx: TaskContext) -> Result<TaskOutcome, TaskError>;
}

/// Boxed future returned by closure-based task functions.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<TaskOutcome, TaskError>> + Send>>;

/// Adapter for plain async functions and closures.
struct FnTask {
    func: Box<dyn Fn(TaskContext) -> TaskFuture + Send + Sync>,
}

#[async_trait]
impl TaskFn for FnTask {
    async fn call(&self, ctx: TaskContext) -> Result<TaskOutcome, TaskError> {
        (self.func)(ctx).await
    }
}

#[derive(Clone)]
pub struct Registered {
    pub func: Arc<dyn TaskFn>,
    /// False for functions only the local spooler may run.
    pub dispatchable: bool,
}

/// Name → function table. Built at startup, read-only afterwards.
#[derive(Clone)]
pub struct Registry {
    entries: HashMap<String, Registered>,
}

impl Registry {
    /// A registry holding the built-in job completion function.
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            JOB_DONE.to_string(),
            Registered {
                func: boxed(job_done),
                dispatchable: true,
            },
        );
        Self { entries }
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        func: Arc<dyn TaskFn>,
    ) -> Result<(), RegistryError> {
        self.insert(name.into(), func, true)
    }

    /// Register an async function or closure.
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, func: F) -> Result<(), RegistryError>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskOutcome, TaskError>> + Send + 'static,
    {
        self.insert(name.into(), boxed(func), true)
    }

    /// Register a function the spooler may run but queue messages may not name.
    pub fn register_local<F, Fut>(
        &mut self,
        name: impl Into<String>,
        func: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TaskOutcome, TaskError>> + Send + 'static,
    {
        self.insert(name.into(), boxed(func), false)
    }

    fn insert(
        &mut self,
        name: String,
        func: Arc<dyn TaskFn>,
        dispatchable: bool,
    ) -> Result<(), RegistryError> {
        if self.entries.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        debug!(name = %name, dispatchable, "registered task function");
        self.entries.insert(name, Registered { func, dispatchable });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Registered> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn boxed<F, Fut>(func: F) -> Arc<dyn TaskFn>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TaskOutcome, TaskError>> + Send + 'static,
{
    Arc::new(FnTask {
        func: Box::new(move |ctx| Box::pin(func(ctx))),
    })
}
