//! Smoke tests for a running deployment.
//!
//! `smoke_task` sends one logging task; `smoke_job` builds a job tree whose
//! leaves each finalize one line of output, so the root's merged output
//! shows that every level ran and rolled up.

use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::context::{TaskContext, TaskOutcome};
use crate::engine::Engine;
use crate::error::{EngineError, RegistryError, TaskError};
use crate::job::{job_done, Job, JobOptions};
use crate::priority::Priority;
use crate::registry::Registry;
use crate::task::{Task, TaskOptions};

pub const SMOKE_TASK: &str = "drover.smoke_task";
pub const SMOKE_JOB_TASK: &str = "drover.smoke_job_task";
pub const SMOKE_JOB_DONE: &str = "drover.smoke_job_done";

/// Largest tree `smoke_job` will build.
pub const MAX_SMOKE_TASKS: u64 = 5000;

const ROOT_GROUP: &str = "TASK_TEST";

/// Register the smoke-test functions.
pub fn register(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.register_fn(SMOKE_TASK, smoke_task_fn)?;
    registry.register_fn(SMOKE_JOB_TASK, smoke_job_task_fn)?;
    registry.register_fn(SMOKE_JOB_DONE, smoke_job_done_fn)?;
    Ok(())
}

/// Shape of a smoke-test job tree.
#[derive(Debug, Clone)]
pub struct SmokeJob {
    pub message: String,
    /// Levels in the tree; 1 is a single job holding the tasks.
    pub depth: u32,
    /// Sub-jobs under every non-leaf job.
    pub jobs: u32,
    /// Tasks under every leaf job.
    pub tasks: u32,
    pub priority: Priority,
    pub cache: String,
}

impl SmokeJob {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            depth: 1,
            jobs: 1,
            tasks: 1,
            priority: Priority::HighSpooled,
            cache: crate::cache::DEFAULT_CACHE.to_string(),
        }
    }

    /// Leaf tasks in the tree.
    pub fn total_tasks(&self) -> u64 {
        u64::from(self.jobs)
            .saturating_pow(self.depth.saturating_sub(1))
            .saturating_mul(u64::from(self.tasks))
    }
}

/// Send one smoke task.
pub async fn smoke_task(
    engine: &Engine,
    message: &str,
    priority: Priority,
    sleep: Duration,
) -> Result<Task, EngineError> {
    let mut kwargs = Map::new();
    kwargs.insert("message".into(), json!(message));
    kwargs.insert("sleep_secs".into(), json!(sleep.as_secs_f64()));
    engine
        .run_queue_function(
            SMOKE_TASK,
            "TEST_TASK",
            Vec::new(),
            kwargs,
            TaskOptions::default().priority(priority),
        )
        .await
}

/// Build and start a smoke job tree. `None` if the tree is too large.
pub async fn smoke_job(engine: &Engine, spec: &SmokeJob) -> Result<Option<Job>, EngineError> {
    let total = spec.total_tasks();
    if total > MAX_SMOKE_TASKS {
        info!(total, max = MAX_SMOKE_TASKS, "smoke job too big, not started");
        return Ok(None);
    }
    info!(total, depth = spec.depth, "starting smoke job");

    let mut root = Job::new(
        ROOT_GROUP,
        data(&spec.message),
        node_options(spec, &spec.message).cache(spec.cache.clone()),
    );
    build_node(engine, &mut root, 1, spec).await?;
    root.start(engine).await?;
    Ok(Some(root))
}

fn build_node<'a>(
    engine: &'a Engine,
    job: &'a mut Job,
    level: u32,
    spec: &'a SmokeJob,
) -> BoxFuture<'a, Result<(), EngineError>> {
    Box::pin(async move {
        if level >= spec.depth.max(1) {
            for number in 0..spec.tasks {
                job.add_task(
                    engine,
                    SMOKE_JOB_TASK,
                    TaskOptions::default().kwarg("number", number),
                )
                .await?;
            }
            return Ok(());
        }

        let parent_message = message_of(job);
        for n in 0..spec.jobs {
            let message = format!("{parent_message}-SUBJOB: {n}");
            let mut child = Job::child(
                job,
                format!("{ROOT_GROUP}{}", level + 1),
                data(&message),
                node_options(spec, &message),
            );
            build_node(engine, &mut child, level + 1, spec).await?;
            child.start(engine).await?;
            job.track(&child);
        }
        Ok(())
    })
}

fn node_options(spec: &SmokeJob, message: &str) -> JobOptions {
    JobOptions::default()
        .priority(spec.priority)
        .done_fn(SMOKE_JOB_DONE)
        .kwarg("message", message)
}

fn data(message: &str) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("message".into(), json!(message));
    data
}

fn message_of(job: &Job) -> String {
    job.data
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

async fn smoke_task_fn(ctx: TaskContext) -> Result<TaskOutcome, TaskError> {
    let message = ctx.kwarg("message").and_then(Value::as_str).unwrap_or_default();
    info!(task = %ctx.task().label(), message, "smoke task");
    let sleep = ctx
        .kwarg("sleep_secs")
        .and_then(Value::as_f64)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or_default();
    tokio::time::sleep(sleep).await;
    Ok(TaskOutcome::Done)
}

async fn smoke_job_task_fn(ctx: TaskContext) -> Result<TaskOutcome, TaskError> {
    let number: u64 = ctx.kwarg_as("number")?;
    let job = ctx.load_job().await?;
    let message = job.as_ref().map(message_of).unwrap_or_default();
    let line = format!("{message}-TASK: {number}");
    info!(task = %ctx.task().label(), %line, "smoke job task");
    ctx.finalize(json!([line])).await?;
    Ok(TaskOutcome::Done)
}

async fn smoke_job_done_fn(ctx: TaskContext) -> Result<TaskOutcome, TaskError> {
    let outcome = job_done(ctx.clone()).await?;
    if outcome == TaskOutcome::Done {
        let message = ctx.kwarg("message").and_then(Value::as_str).unwrap_or_default();
        info!(message, "smoke job completed");
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_tasks_counts_leaves() {
        let mut spec = SmokeJob::new("x");
        assert_eq!(spec.total_tasks(), 1);

        spec.depth = 3;
        spec.jobs = 4;
        spec.tasks = 5;
        assert_eq!(spec.total_tasks(), 80);

        spec.depth = 40;
        assert!(spec.total_tasks() > MAX_SMOKE_TASKS);
    }

    #[test]
    fn registers_once() {
        let mut registry = Registry::new();
        register(&mut registry).unwrap();
        assert!(registry.contains(SMOKE_JOB_DONE));
        assert!(register(&mut registry).is_err());
    }
}
