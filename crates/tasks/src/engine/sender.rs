//! Sending work to the durable queues.

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tracing::{debug, info};

use drover_queue::OutboundMessage;

use crate::error::{DispatchError, EngineError};
use crate::group::TaskGroup;
use crate::priority::Priority;
use crate::task::{new_key, put_info, MessageBody, Schedulable, Task, TaskOptions};

use super::{Dispatch, Engine};

/// Message attribute carrying the priority code.
pub const PRIORITY_ATTR: &str = "mpPriority";
/// Message attribute carrying the registered function name.
pub const HANDLER_ATTR: &str = "mpHandler";
/// Message attribute carrying the protocol version.
pub const VERSION_ATTR: &str = "mpVersion";

/// Where a sent task went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Queued { message_id: String },
    /// Single-node mode: dispatched in this process.
    Local(Dispatch),
}

impl Engine {
    /// Send a task or job.
    ///
    /// The task key is the deduplication id, so sending the same task twice
    /// within the queue's dedup window delivers it once.
    pub async fn send<S>(&self, item: &S) -> Result<Sent, EngineError>
    where
        S: Schedulable + Sync + ?Sized,
    {
        self.send_with_dedup(item, None).await
    }

    /// Send again with a fresh deduplication id.
    pub async fn resend<S>(&self, item: &S) -> Result<Sent, EngineError>
    where
        S: Schedulable + Sync + ?Sized,
    {
        self.send_with_dedup(item, Some(new_key())).await
    }

    /// Wrap a plain function call in a default task and send it.
    pub async fn run_queue_function(
        &self,
        handler: impl Into<String>,
        group: impl Into<TaskGroup>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        options: TaskOptions,
    ) -> Result<Task, EngineError> {
        let task = Task::new(handler, group, options.kwargs(kwargs).args(args));
        self.send(&task).await?;
        Ok(task)
    }

    async fn send_with_dedup<S>(&self, item: &S, dedup: Option<String>) -> Result<Sent, EngineError>
    where
        S: Schedulable + Sync + ?Sized,
    {
        let body = put_info(item, self).await?;
        let task = item.task();

        if !self.is_distributed() {
            debug!(task = %task.label(), "single node, dispatching locally");
            let dispatch = self
                .execute_boxed(task.handler.clone(), task.priority, body)
                .await?;
            return Ok(Sent::Local(dispatch));
        }

        let tier = task.priority.tier();
        let queue = self.queue(tier).ok_or(EngineError::NoQueue(tier))?;
        let message = OutboundMessage::new(serde_json::to_string(&body)?)
            .attribute(PRIORITY_ATTR, task.priority.code())
            .attribute(HANDLER_ATTR, task.handler.as_str())
            .attribute(VERSION_ATTR, self.config().engine.version())
            .group(task.partition_key())
            .deduplication(dedup.unwrap_or_else(|| task.key.clone()));

        let message_id = queue.send(message).await?;
        info!(task = %task.label(), queue = %queue.name(), message_id = %message_id, "task queued");
        Ok(Sent::Queued { message_id })
    }

    /// Local dispatch reached from inside running tasks; boxed to break the
    /// execute -> task -> send -> execute cycle.
    fn execute_boxed(
        &self,
        handler: String,
        priority: Priority,
        body: MessageBody,
    ) -> BoxFuture<'_, Result<Dispatch, DispatchError>> {
        Box::pin(async move { self.execute(&handler, priority, body, None).await })
    }
}
