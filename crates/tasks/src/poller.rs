//! Durable-queue pollers.
//!
//! Each configured poller is one loop over its queues. A round polls every
//! queue in turn, skipping those whose tier is backed up in the local
//! spooler, then waits `freq_secs`. Received messages are filtered by
//! protocol version and message group before dispatch; messages this
//! process does not take are released for other consumers.

use std::str::FromStr;

use tracing::{debug, error, info, warn};

use drover_queue::QueueMessage;

use crate::config::{PollerSettings, QueueSettings};
use crate::engine::{Dispatch, Engine, HANDLER_ATTR, PRIORITY_ATTR, VERSION_ATTR};
use crate::error::{DispatchError, EngineError};
use crate::group::is_eligible;
use crate::priority::{Priority, QueueTier};
use crate::shutdown::Shutdown;
use crate::task::{MessageBody, MessageReceipt};

/// What the poller did with one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// Made visible again for another consumer.
    Released,
    Dispatched(Dispatch),
    /// Could not be dispatched and was deleted.
    Discarded,
}

/// Poll the configured queues until shutdown.
pub async fn run_poller(engine: Engine, name: String, settings: PollerSettings, shutdown: Shutdown) {
    info!(poller = %name, queues = ?settings.queues, freq = ?settings.freq(), "poller started");

    while !shutdown.is_shutdown() {
        for tier in &settings.queues {
            if shutdown.is_shutdown() {
                break;
            }
            match poll_once(&engine, *tier, &shutdown).await {
                Ok(0) => {}
                Ok(count) => debug!(poller = %name, %tier, count, "processed messages"),
                Err(e) => error!(poller = %name, %tier, error = %e, "poll failed"),
            }
        }
        if shutdown.wait(settings.freq()).await {
            break;
        }
    }

    info!(poller = %name, "poller stopped");
}

/// One long poll of one queue. Returns the number of messages received.
///
/// Shutdown interrupts the long poll but not the dispatch of messages
/// already received.
pub async fn poll_once(
    engine: &Engine,
    tier: QueueTier,
    shutdown: &Shutdown,
) -> Result<usize, EngineError> {
    let settings = engine
        .config()
        .queues
        .get(&tier)
        .ok_or(EngineError::NoQueue(tier))?;
    let queue = engine.queue(tier).ok_or(EngineError::NoQueue(tier))?;

    if let Some(spooler) = engine.spooler() {
        let backlog = spooler.backlog().await?.get(tier);
        if backlog >= settings.full_threshold {
            debug!(%tier, backlog, threshold = settings.full_threshold, "spool full, not polling");
            return Ok(0);
        }
    }

    let options = settings.receive_options();
    let messages = tokio::select! {
        _ = shutdown.cancelled() => return Ok(0),
        polled = queue.poll_batch(&options) => polled?,
    };
    let count = messages.len();
    for message in &messages {
        handle_message(engine, tier, settings, message).await;
    }
    Ok(count)
}

/// Filter one received message and dispatch it.
pub async fn handle_message(
    engine: &Engine,
    tier: QueueTier,
    settings: &QueueSettings,
    message: &QueueMessage,
) -> Received {
    let Some(queue) = engine.queue(tier) else {
        return Received::Released;
    };

    let version = engine.config().engine.version();
    if message.attribute(VERSION_ATTR) != Some(version) {
        debug!(
            id = %message.id,
            got = ?message.attribute(VERSION_ATTR),
            want = %version,
            "message version mismatch, releasing"
        );
        release(queue.name(), queue.nack(&message.receipt_handle).await);
        return Received::Released;
    }

    if !is_eligible(message.group_id.as_deref(), &settings.task_groups) {
        debug!(id = %message.id, group = ?message.group_id, "message group not handled here, releasing");
        release(queue.name(), queue.nack(&message.receipt_handle).await);
        return Received::Released;
    }

    match dispatch_message(engine, tier, message).await {
        Ok(dispatch) => Received::Dispatched(dispatch),
        Err(e) => {
            error!(id = %message.id, queue = %queue.name(), error = %e, "message failed, deleting");
            if let Err(e) = queue.ack(&message.receipt_handle).await {
                warn!(id = %message.id, error = %e, "delete of failed message failed");
            }
            Received::Discarded
        }
    }
}

async fn dispatch_message(
    engine: &Engine,
    tier: QueueTier,
    message: &QueueMessage,
) -> Result<Dispatch, DispatchError> {
    let priority = message
        .attribute(PRIORITY_ATTR)
        .ok_or_else(|| DispatchError::Malformed(format!("missing {PRIORITY_ATTR}")))
        .and_then(|code| Priority::from_str(code).map_err(DispatchError::Malformed))?;
    let handler = message
        .attribute(HANDLER_ATTR)
        .ok_or_else(|| DispatchError::Malformed(format!("missing {HANDLER_ATTR}")))?;
    let body: MessageBody = serde_json::from_str(&message.body)
        .map_err(|e| DispatchError::Malformed(format!("body: {e}")))?;

    debug!(
        id = %message.id,
        %priority,
        handler,
        attempt = message.attempt_count,
        "dispatching message"
    );
    let receipt = MessageReceipt {
        tier,
        receipt_handle: message.receipt_handle.clone(),
    };
    engine.execute(handler, priority, body, Some(receipt)).await
}

fn release(queue: &str, result: Result<(), drover_queue::QueueError>) {
    if let Err(e) = result {
        warn!(queue, error = %e, "release failed");
    }
}
