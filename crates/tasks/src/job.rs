//! Jobs: a task that coordinates a set of sub-tasks.
//!
//! A job caches read-only data for its sub-tasks, tracks their session
//! keys, and runs a completion check as its own task function. Sub-tasks
//! must be independent of each other; a job has no notion of ordering or
//! dependencies among them.
//!
//! Lifecycle: build the job, add sub-tasks, `start()` (job cached first,
//! sub-tasks sent, job sent last), then the completion check runs until
//! every sub-task has finalized or the job expires.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::cache::{self, DEFAULT_CACHE};
use crate::context::{TaskContext, TaskOutcome};
use crate::engine::Engine;
use crate::error::{EngineError, TaskError};
use crate::group::TaskGroup;
use crate::output::{accumulate, get_output};
use crate::priority::Priority;
use crate::task::{Schedulable, Session, Task, TaskOptions};

/// Built-in completion check, registered in every [`Registry`](crate::Registry).
pub const JOB_DONE: &str = "drover.job_done";

/// Construction options for [`Job::new`].
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub priority: Option<Priority>,
    /// Jobs are always cached.
    pub cache: String,
    pub expires: Option<DateTime<Utc>>,
    /// Completion function; receives the job as its session.
    pub done_fn: String,
    /// Passed to the completion function.
    pub kwargs: Map<String, Value>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: None,
            cache: DEFAULT_CACHE.to_string(),
            expires: None,
            done_fn: JOB_DONE.to_string(),
            kwargs: Map::new(),
        }
    }
}

impl JobOptions {
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn cache(mut self, name: impl Into<String>) -> Self {
        self.cache = name.into();
        self
    }

    pub fn expires(mut self, at: DateTime<Utc>) -> Self {
        self.expires = Some(at);
        self
    }

    pub fn done_fn(mut self, name: impl Into<String>) -> Self {
        self.done_fn = name.into();
        self
    }

    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    fn into_task_options(self) -> TaskOptions {
        TaskOptions {
            priority: self.priority,
            cache: Some(self.cache),
            expires: self.expires,
            kwargs: self.kwargs,
            args: Vec::new(),
        }
    }
}

/// Result of one completion check.
#[derive(Debug, Clone, PartialEq)]
pub enum JobCheck {
    Running,
    Complete { output: Option<Value>, expired: bool },
}

/// Single-node completion polling. Without a durable queue nothing
/// redelivers the job, so the check waits in place before forcing
/// completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobPollConfig {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for JobPollConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub task: Task,
    /// Shared read-only data for sub-tasks.
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Session keys of sub-tasks added through [`Job::add_task`].
    #[serde(default)]
    pub task_keys: Vec<String>,
}

impl Job {
    pub fn new(group: impl Into<TaskGroup>, data: Map<String, Value>, options: JobOptions) -> Self {
        let handler = options.done_fn.clone();
        let task = Task::build(
            handler,
            group.into().partition_key(),
            None,
            options.into_task_options(),
        );
        Self {
            task,
            data,
            task_keys: Vec::new(),
        }
    }

    /// A sub-job in `parent`'s cache scope.
    pub fn child(
        parent: &Job,
        group: impl Into<TaskGroup>,
        data: Map<String, Value>,
        options: JobOptions,
    ) -> Self {
        let options = options.cache(parent.cache_name());
        let handler = options.done_fn.clone();
        let task = Task::build(
            handler,
            group.into().partition_key(),
            parent.task.cache_ref(),
            options.into_task_options(),
        );
        Self {
            task,
            data,
            task_keys: Vec::new(),
        }
    }

    pub fn cache_key(&self) -> String {
        self.task.cache_key()
    }

    fn cache_name(&self) -> String {
        self.task
            .cache_name
            .clone()
            .unwrap_or_else(|| DEFAULT_CACHE.to_string())
    }

    pub fn label(&self) -> String {
        format!("JOB_{}", self.cache_key())
    }

    /// Add and cache a sub-task in this job's group.
    ///
    /// Priority defaults to the job's; expiry is capped at the job's.
    pub async fn add_task(
        &mut self,
        engine: &Engine,
        handler: impl Into<String>,
        mut options: TaskOptions,
    ) -> Result<Task, EngineError> {
        options.priority = options.priority.or(Some(self.task.priority));
        options.expires = Some(
            options
                .expires
                .map_or(self.task.expires, |at| at.min(self.task.expires)),
        );
        options.cache = Some(self.cache_name());

        let task = Task::build(
            handler.into(),
            self.task.group.clone(),
            self.task.cache_ref(),
            options,
        );
        let key = task.cache_key();
        cache::store_session(
            engine.cache(&self.cache_name())?,
            &key,
            &Session::Task(task.clone()),
            task.ttl(),
        )
        .await?;
        self.task_keys.push(key);
        Ok(task)
    }

    /// Wait for a sub-job built with [`Job::child`]. Start the sub-job
    /// before this one; its finalized output is merged like any task's.
    pub fn track(&mut self, child: &Job) {
        self.task_keys.push(child.cache_key());
    }

    /// Cache the job, send every sub-task still cached, then send the job.
    pub async fn start(&self, engine: &Engine) -> Result<(), EngineError> {
        let cache = engine.cache(&self.cache_name())?;
        cache::store_session(cache, &self.cache_key(), &self.to_session(), self.session_ttl(engine))
            .await?;

        for key in &self.task_keys {
            match cache::load_session(cache, key).await? {
                Some(Session::Task(task)) => {
                    debug!(job = %self.label(), task = %task.label(), "job queuing task");
                    engine.send(&task).await?;
                }
                Some(Session::Job(_)) => {
                    debug!(job = %self.label(), key = %key, "sub-job already started");
                }
                _ => warn!(job = %self.label(), key = %key, "job task not in cache"),
            }
        }

        engine.send(self).await?;
        info!(job = %self.label(), tasks = self.task_keys.len(), "job started");
        Ok(())
    }

    /// Fetch and delete every sub-task output, in `task_keys` order.
    ///
    /// For custom roll-ups that don't merge in memory.
    pub async fn take_outputs(&self, engine: &Engine) -> Result<Vec<(String, Value)>, EngineError> {
        let cache = engine.cache(&self.cache_name())?;
        let mut outputs = Vec::new();
        for key in &self.task_keys {
            if let Some(output) = get_output(cache, key).await? {
                outputs.push((key.clone(), output));
            }
        }
        Ok(outputs)
    }

    /// Merge every available sub-task output, then delete what's left of
    /// the sub-task sessions. A second call finds nothing and returns `None`.
    pub async fn process_output(&self, engine: &Engine) -> Result<Option<Value>, EngineError> {
        info!(job = %self.label(), "processing job output");
        let mut merged = Value::Null;
        for (_, output) in self.take_outputs(engine).await? {
            merged = accumulate(merged, output)?;
        }
        self.cleanup(engine).await?;
        Ok((!merged.is_null()).then_some(merged))
    }

    /// Delete any remaining sub-task sessions.
    pub async fn cleanup(&self, engine: &Engine) -> Result<(), EngineError> {
        engine
            .cache(&self.cache_name())?
            .delete_many(&self.task_keys)
            .await?;
        Ok(())
    }

    /// One completion check. Safe to run any number of times.
    pub async fn check_completion(&mut self, engine: &Engine) -> Result<JobCheck, EngineError> {
        if Utc::now() > self.task.expires {
            warn!(job = %self.label(), "job expired");
            self.task.expired = true;
            let output = self.process_output(engine).await?;
            return Ok(JobCheck::Complete {
                output,
                expired: true,
            });
        }

        if self.remaining(engine).await? == 0 {
            debug!(job = %self.label(), "job has no more tasks");
            return self.complete(engine).await;
        }

        if engine.is_distributed() {
            return Ok(JobCheck::Running);
        }

        // Single node: nothing will redeliver this check, so wait here.
        let poll = engine.job_poll();
        for attempt in 1..poll.attempts {
            info!(job = %self.label(), attempt, "waiting for job tasks");
            tokio::time::sleep(poll.interval).await;
            if self.remaining(engine).await? == 0 {
                break;
            }
        }
        self.complete(engine).await
    }

    async fn remaining(&self, engine: &Engine) -> Result<usize, EngineError> {
        if self.task_keys.is_empty() {
            return Ok(0);
        }
        let cache = engine.cache(&self.cache_name())?;
        Ok(cache.get_many(&self.task_keys).await?.len())
    }

    async fn complete(&self, engine: &Engine) -> Result<JobCheck, EngineError> {
        let output = self.process_output(engine).await?;
        Ok(JobCheck::Complete {
            output,
            expired: false,
        })
    }
}

impl Schedulable for Job {
    fn task(&self) -> &Task {
        &self.task
    }

    fn to_session(&self) -> Session {
        Session::Job(self.clone())
    }

    /// Outlives its expiry by the configured grace so the completion check
    /// can still observe that it expired.
    fn session_ttl(&self, engine: &Engine) -> Duration {
        self.task.ttl() + engine.config().engine.job_expiry_grace()
    }
}

/// Default completion function.
///
/// Asks for a retry while sub-tasks are running; once complete, finalizes
/// the job with the merged output so a parent job can collect it.
pub async fn job_done(ctx: TaskContext) -> Result<TaskOutcome, TaskError> {
    let mut job = ctx
        .job()
        .cloned()
        .ok_or_else(|| TaskError::Failed(format!("{} is not a job", ctx.task().label())))?;

    match job.check_completion(ctx.engine()).await? {
        JobCheck::Running => Ok(TaskOutcome::Retry),
        JobCheck::Complete { output, expired } => {
            info!(job = %job.label(), expired, output = ?output, "job complete");
            ctx.finalize(output.unwrap_or(Value::Null)).await?;
            Ok(TaskOutcome::Done)
        }
    }
}
