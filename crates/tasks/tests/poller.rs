mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};

use drover_queue::{DurableQueue, OutboundMessage};
use drover_tasks::engine::{HANDLER_ATTR, PRIORITY_ATTR, VERSION_ATTR};
use drover_tasks::poller::handle_message;
use drover_tasks::spooler::SpoolBody;
use drover_tasks::{
    Dispatch, EngineConfig, Priority, QueueTier, Received, Registry, Session, SpoolRecord, Task,
    TaskContext, TaskOptions, TaskOutcome,
};

use common::{Calls, Harness, DISTRIBUTED_TOML};

fn recording(name: &'static str, seen: &Calls) -> Registry {
    let mut registry = Registry::new();
    let log = seen.clone();
    registry
        .register_fn(name, move |ctx: TaskContext| {
            log.push(json!(ctx.message().is_some()));
            async { Ok(TaskOutcome::Done) }
        })
        .unwrap();
    registry
}

/// Returns `Retry` on the first call and `Done` afterwards.
fn retry_once(name: &'static str, calls: &Arc<AtomicUsize>) -> Registry {
    let mut registry = Registry::new();
    let counter = calls.clone();
    registry
        .register_fn(name, move |_ctx: TaskContext| {
            let first = counter.fetch_add(1, Ordering::SeqCst) == 0;
            async move {
                Ok(if first {
                    TaskOutcome::Retry
                } else {
                    TaskOutcome::Done
                })
            }
        })
        .unwrap();
    registry
}

fn raw_message(version: &str, priority: &str, handler: &str, body: &str) -> OutboundMessage {
    OutboundMessage::new(body)
        .attribute(VERSION_ATTR, version)
        .attribute(PRIORITY_ATTR, priority)
        .attribute(HANDLER_ATTR, handler)
        .group("DEFAULT_SYSTEM")
}

async fn receive_one(harness: &Harness, tier: QueueTier) -> Received {
    let settings = &harness.engine.config().queues[&tier];
    let queue = harness.queue(tier);
    let mut batch = queue.poll_batch(&settings.receive_options()).await.unwrap();
    assert_eq!(batch.len(), 1);
    let message = batch.remove(0);
    handle_message(&harness.engine, tier, settings, &message).await
}

#[tokio::test]
async fn other_versions_are_released() {
    let seen = Calls::default();
    let harness = Harness::distributed(recording("x", &seen));
    let queue = harness.queue(QueueTier::High);
    queue
        .send(raw_message("6", "HI", "x", "{}"))
        .await
        .unwrap();

    assert_eq!(receive_one(&harness, QueueTier::High).await, Received::Released);
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.in_flight(), 0);
    assert_eq!(seen.len(), 0);
}

#[tokio::test]
async fn consumers_take_only_their_groups() {
    let seen = Calls::default();
    let mut config = EngineConfig::from_toml(DISTRIBUTED_TOML).unwrap();
    config
        .queues
        .get_mut(&QueueTier::High)
        .unwrap()
        .task_groups = vec!["REPORTS".to_string()];
    let harness = Harness::with_config(config, recording("x", &seen));
    let options = || TaskOptions::default().priority(Priority::HighInline);

    harness
        .engine
        .send(&Task::new("x", "DEFAULT_acct-1", options()))
        .await
        .unwrap();
    assert_eq!(receive_one(&harness, QueueTier::High).await, Received::Released);

    let queue = harness.queue(QueueTier::High);
    harness
        .engine
        .send(&Task::new("x", "REPORTS_7", options()))
        .await
        .unwrap();

    // The released message is visible again, so both come back; only the
    // REPORTS one runs.
    let settings = &harness.engine.config().queues[&QueueTier::High];
    let batch = queue.poll_batch(&settings.receive_options()).await.unwrap();
    assert_eq!(batch.len(), 2);
    let mut results = Vec::new();
    for message in &batch {
        results.push(handle_message(&harness.engine, QueueTier::High, settings, message).await);
    }
    assert_eq!(
        results,
        vec![
            Received::Released,
            Received::Dispatched(Dispatch::Executed(TaskOutcome::Done)),
        ]
    );
    assert_eq!(seen.len(), 1);
    assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn delete_timing_follows_priority() {
    let seen = Calls::default();
    let harness = Harness::distributed(recording("x", &seen));
    let queue = harness.queue(QueueTier::High);

    // Inline and unsafe priorities delete before running.
    harness
        .engine
        .send(&Task::new("x", "G1", TaskOptions::default().priority(Priority::HighInline)))
        .await
        .unwrap();
    assert_eq!(harness.poll(QueueTier::High).await, 1);
    assert_eq!(seen.take(), vec![json!(false)]);
    assert!(queue.is_empty());

    // Safe spooled priorities delete after.
    harness
        .engine
        .send(&Task::new("x", "G2", TaskOptions::default().priority(Priority::HighSpooled)))
        .await
        .unwrap();
    assert_eq!(harness.poll(QueueTier::High).await, 1);
    assert_eq!(queue.in_flight(), 1);
    assert_eq!(harness.drain().await, 1);
    assert_eq!(seen.take(), vec![json!(true)]);
    assert!(queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn safe_retry_waits_for_redelivery() {
    let calls = Arc::new(AtomicUsize::new(0));
    let harness = Harness::distributed(retry_once("x", &calls));
    let queue = harness.queue(QueueTier::High);

    harness
        .engine
        .send(&Task::new("x", "G", TaskOptions::default().priority(Priority::HighSpooled)))
        .await
        .unwrap();
    harness.poll(QueueTier::High).await;
    harness.drain().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.in_flight(), 1);
    assert_eq!(harness.poll(QueueTier::High).await, 0);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(harness.poll(QueueTier::High).await, 1);
    harness.drain().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn unsafe_retry_is_sent_again() {
    let calls = Arc::new(AtomicUsize::new(0));
    let harness = Harness::distributed(retry_once("x", &calls));
    let queue = harness.queue(QueueTier::High);

    harness
        .engine
        .send(&Task::new("x", "G", TaskOptions::default().priority(Priority::HighInline)))
        .await
        .unwrap();
    assert_eq!(harness.poll(QueueTier::High).await, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // Original deleted, copy queued.
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.in_flight(), 0);

    assert_eq!(harness.poll(QueueTier::High).await, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn undispatchable_messages_are_deleted() {
    let harness = Harness::distributed(recording("x", &Calls::default()));
    let queue = harness.queue(QueueTier::High);

    queue.send(raw_message("7", "HI", "x", "not json")).await.unwrap();
    assert_eq!(receive_one(&harness, QueueTier::High).await, Received::Discarded);
    assert!(queue.is_empty());

    queue.send(raw_message("7", "HI", "nope", "{}")).await.unwrap();
    assert_eq!(receive_one(&harness, QueueTier::High).await, Received::Discarded);
    assert!(queue.is_empty());

    queue.send(raw_message("7", "ZZ", "x", "{}")).await.unwrap();
    assert_eq!(receive_one(&harness, QueueTier::High).await, Received::Discarded);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn full_spool_pauses_polling() {
    let seen = Calls::default();
    let mut config = EngineConfig::from_toml(DISTRIBUTED_TOML).unwrap();
    config
        .queues
        .get_mut(&QueueTier::High)
        .unwrap()
        .full_threshold = 1;
    let harness = Harness::with_config(config, recording("x", &seen));

    let parked = Task::new("x", "G", TaskOptions::default().priority(Priority::HighSpooled));
    harness
        .engine
        .spooler()
        .unwrap()
        .enqueue(&SpoolRecord {
            fn_name: "x".into(),
            level: 1,
            body: SpoolBody {
                args: Vec::<Value>::new(),
                kwargs: Map::new(),
                task: Session::Task(parked),
                wrapped: true,
                message: None,
            },
        })
        .await
        .unwrap();

    harness
        .engine
        .send(&Task::new("x", "G", TaskOptions::default().priority(Priority::HighInline)))
        .await
        .unwrap();
    assert_eq!(harness.poll(QueueTier::High).await, 0);
    assert_eq!(harness.queue(QueueTier::High).in_flight(), 0);

    assert_eq!(harness.drain().await, 1);
    assert_eq!(harness.poll(QueueTier::High).await, 1);
    assert_eq!(seen.len(), 2);
}
