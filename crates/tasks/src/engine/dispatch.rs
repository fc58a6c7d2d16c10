//! Dispatch: resolve a function and its arguments, then run or spool it.

use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, warn};

use crate::cache::SessionCache;
use crate::context::{TaskContext, TaskOutcome};
use crate::error::{DispatchError, TaskError};
use crate::priority::{DeleteTiming, ExecutionMode, Priority};
use crate::registry::{Registered, TaskFn};
use crate::spooler::{SpoolBody, SpoolRecord};
use crate::task::{MessageBody, MessageReceipt, Session, Task, ARGS_KWARG};

use super::Engine;

/// Sessions whose dispatch failed are parked under this prefix.
pub const ERROR_LOG_PREFIX: &str = "ERROR_LOG_";

const ERROR_LOG_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// What happened to a dispatched unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Ran to completion in this call.
    Executed(TaskOutcome),
    /// Handed to the spooler, or to a background task without one.
    Spooled,
    /// Session missing or expired; nothing ran.
    Skipped,
}

type Work = (Session, Map<String, Value>, Vec<Value>);

impl Engine {
    /// Run or spool `handler` with the arguments carried by `body`.
    ///
    /// `receipt` identifies the queue message the work came from. It is
    /// deleted before or after execution according to the priority; an
    /// outcome of [`TaskOutcome::Retry`] leaves an undeleted message for
    /// redelivery.
    pub async fn execute(
        &self,
        handler: &str,
        priority: Priority,
        body: MessageBody,
        receipt: Option<MessageReceipt>,
    ) -> Result<Dispatch, DispatchError> {
        let registered = self.resolve(handler)?;

        let Some((session, kwargs, args)) = self.load_work(handler, priority, body).await? else {
            if let Some(receipt) = &receipt {
                self.delete_message_logged(receipt).await;
            }
            return Ok(Dispatch::Skipped);
        };

        let receipt = match (priority.delete_timing(), receipt) {
            (DeleteTiming::BeforeExecution, Some(receipt)) => {
                self.delete_message_logged(&receipt).await;
                None
            }
            (_, receipt) => receipt,
        };

        // A job's completion check manages its own output.
        let wrapped = !matches!(session, Session::Job(_));

        match priority.execution() {
            ExecutionMode::Inline => {
                debug!(task = %session.task().label(), "executing inline");
                let ctx = TaskContext::new(self.clone(), session, kwargs, args, receipt);
                Ok(Dispatch::Executed(
                    self.run_context(&registered, ctx, wrapped).await,
                ))
            }
            ExecutionMode::Spooled => {
                let record = SpoolRecord {
                    fn_name: handler.to_string(),
                    level: priority.spool_level(),
                    body: SpoolBody {
                        args,
                        kwargs,
                        task: session,
                        wrapped,
                        message: receipt,
                    },
                };
                self.spool(record).await
            }
        }
    }

    /// Spool a registered function for this process only.
    ///
    /// Unlike [`Engine::execute`], functions registered with
    /// [`Registry::register_local`](crate::Registry::register_local) are allowed.
    pub async fn run_local(
        &self,
        handler: &str,
        priority: Priority,
        kwargs: Map<String, Value>,
    ) -> Result<Dispatch, DispatchError> {
        if !self.registry().contains(handler) {
            return Err(DispatchError::UnknownHandler(handler.to_string()));
        }
        let task = Task::placeholder(handler, priority, kwargs.clone());
        let record = SpoolRecord {
            fn_name: handler.to_string(),
            level: priority.spool_level(),
            body: SpoolBody {
                args: Vec::new(),
                kwargs,
                task: Session::Task(task),
                wrapped: true,
                message: None,
            },
        };
        self.spool(record).await
    }

    /// Run one spooled unit of work. Never fails; problems are logged.
    pub async fn run_record(&self, record: SpoolRecord) -> TaskOutcome {
        let Some(registered) = self.registry().get(&record.fn_name).cloned() else {
            error!(function = %record.fn_name, "spooled function not registered");
            if let Some(receipt) = &record.body.message {
                self.delete_message_logged(receipt).await;
            }
            return TaskOutcome::Failed(format!("unknown function {}", record.fn_name));
        };

        let SpoolBody {
            args,
            kwargs,
            task,
            wrapped,
            message,
        } = record.body;
        let ctx = TaskContext::new(self.clone(), task, kwargs, args, message);
        self.run_context(&registered, ctx, wrapped).await
    }

    fn resolve(&self, handler: &str) -> Result<Registered, DispatchError> {
        let registered = self
            .registry()
            .get(handler)
            .ok_or_else(|| DispatchError::UnknownHandler(handler.to_string()))?;
        if !registered.dispatchable {
            return Err(DispatchError::NotDispatchable(handler.to_string()));
        }
        Ok(registered.clone())
    }

    /// Rebuild the session and arguments, or `None` if there is nothing to run.
    async fn load_work(
        &self,
        handler: &str,
        priority: Priority,
        body: MessageBody,
    ) -> Result<Option<Work>, DispatchError> {
        let cached = match body {
            MessageBody::Inline(mut kwargs) => {
                let args = match kwargs.remove(ARGS_KWARG) {
                    Some(Value::Array(args)) => args,
                    Some(other) => vec![other],
                    None => Vec::new(),
                };
                let mut task = Task::placeholder(handler, priority, kwargs.clone());
                task.args = args.clone();
                return Ok(Some((Session::Task(task), kwargs, args)));
            }
            MessageBody::Cached { cached_task } => cached_task,
        };

        let cache = self.cache(&cached.cache_name)?;
        let key = cached.task_key.as_str();
        let Some(raw) = cache.get(key).await? else {
            info!(key, handler, "session gone, skipping");
            return Ok(None);
        };

        let session: Session = match serde_json::from_value(raw.clone()) {
            Ok(session) => session,
            Err(e) => {
                quarantine(cache, key, raw).await;
                return Err(DispatchError::CorruptSession {
                    key: key.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let task = session.task();
        if task.handler != handler {
            warn!(key, handler, cached = %task.handler, "message handler differs from session");
        }
        // Jobs run past expiry so their completion check can report it.
        if let Session::Task(task) = &session {
            if task.is_expired_at(Utc::now()) {
                warn!(task = %task.label(), expires = %task.expires, "task expired, purging");
                cache.delete(key).await?;
                return Ok(None);
            }
        }

        let kwargs = task.kwargs.clone();
        let args = task.args.clone();
        Ok(Some((session, kwargs, args)))
    }

    async fn spool(&self, record: SpoolRecord) -> Result<Dispatch, DispatchError> {
        let Some(spooler) = self.spooler() else {
            let engine = self.clone();
            tokio::spawn(async move {
                engine.run_record(record).await;
            });
            return Ok(Dispatch::Spooled);
        };

        if let Err(e) = spooler.enqueue(&record).await {
            error!(function = %record.fn_name, error = %e, "spool write failed");
            if let Some(cache_ref) = record.body.task.task().cache_ref() {
                if let (Ok(cache), Ok(value)) = (
                    self.cache(&cache_ref.cache_name),
                    serde_json::to_value(&record.body.task),
                ) {
                    quarantine(cache, &cache_ref.task_key, value).await;
                }
            }
            return Err(e.into());
        }
        Ok(Dispatch::Spooled)
    }

    /// Run a task function, then settle its queue message.
    pub(crate) async fn run_context(
        &self,
        registered: &Registered,
        ctx: TaskContext,
        wrapped: bool,
    ) -> TaskOutcome {
        let func = registered.func.as_ref();
        let outcome = if wrapped {
            run_wrapped(func, &ctx).await
        } else {
            run_raw(func, &ctx).await
        };

        match (&outcome, ctx.message()) {
            (TaskOutcome::Retry, Some(_)) => {
                debug!(task = %ctx.task().label(), "retry, leaving message for redelivery");
            }
            (TaskOutcome::Retry, None) => self.requeue(ctx.session()).await,
            (_, Some(receipt)) => self.delete_message_logged(receipt).await,
            (_, None) => {}
        }
        outcome
    }

    /// Retry work whose message is already gone by sending it again.
    async fn requeue(&self, session: &Session) {
        if !self.is_distributed() {
            warn!(task = %session.task().label(), "retry requested with nothing to redeliver");
            return;
        }
        let result = match session {
            Session::Task(task) => self.resend(task).await,
            Session::Job(job) => self.resend(job).await,
        };
        if let Err(e) = result {
            error!(task = %session.task().label(), error = %e, "requeue failed");
        }
    }
}

/// Standard wrapper: one retry on a transient error, and every finish
/// recorded as output so an owning job sees the task as done.
async fn run_wrapped(func: &dyn TaskFn, ctx: &TaskContext) -> TaskOutcome {
    let label = ctx.task().label();
    let mut result = func.call(ctx.clone()).await;
    if let Err(TaskError::Transient(reason)) = &result {
        warn!(task = %label, %reason, "transient failure, retrying once");
        result = func.call(ctx.clone()).await;
    }

    let (outcome, output) = match result {
        Ok(TaskOutcome::Done) => (TaskOutcome::Done, Value::Null),
        Ok(TaskOutcome::Retry) => return TaskOutcome::Retry,
        Ok(TaskOutcome::Failed(reason)) => {
            warn!(task = %label, %reason, "task failed");
            let output = json!(format!("Task failed: {reason}"));
            (TaskOutcome::Failed(reason), output)
        }
        Err(TaskError::Failed(reason)) => {
            warn!(task = %label, %reason, "task failed");
            let output = json!(format!("Task failed: {reason}"));
            (TaskOutcome::Failed(reason), output)
        }
        Err(TaskError::Transient(reason)) => {
            error!(task = %label, %reason, "task exception");
            let output = json!(format!("Task exception: {reason}"));
            (TaskOutcome::Failed(reason), output)
        }
    };

    let failed = matches!(outcome, TaskOutcome::Failed(_));
    if failed || !ctx.is_finalized() {
        if let Err(e) = ctx.finalize(output).await {
            error!(task = %label, error = %e, "finalize failed");
        }
    }
    outcome
}

/// Unwrapped: errors are logged, and a transient one asks for redelivery.
async fn run_raw(func: &dyn TaskFn, ctx: &TaskContext) -> TaskOutcome {
    match func.call(ctx.clone()).await {
        Ok(outcome) => outcome,
        Err(TaskError::Transient(reason)) => {
            warn!(task = %ctx.task().label(), %reason, "transient failure, retrying later");
            TaskOutcome::Retry
        }
        Err(TaskError::Failed(reason)) => {
            error!(task = %ctx.task().label(), %reason, "task failed");
            TaskOutcome::Failed(reason)
        }
    }
}

async fn quarantine(cache: &dyn SessionCache, key: &str, value: Value) {
    let parked = format!("{ERROR_LOG_PREFIX}{key}");
    if let Err(e) = cache.set(&parked, value, Some(ERROR_LOG_TTL)).await {
        error!(key, error = %e, "could not park failed session");
    }
    if let Err(e) = cache.delete(key).await {
        error!(key, error = %e, "could not delete failed session");
    }
    warn!(key, parked = %parked, "session parked after dispatch failure");
}
