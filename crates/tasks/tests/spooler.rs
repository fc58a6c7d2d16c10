mod common;

use serde_json::{json, Map};

use drover_tasks::{Dispatch, MessageBody, Priority, QueueTier, Registry, TaskContext, TaskOutcome};

use common::{Calls, Harness};

fn labelled(label: &str) -> MessageBody {
    let mut kwargs = Map::new();
    kwargs.insert("label".into(), json!(label));
    MessageBody::Inline(kwargs)
}

#[tokio::test]
async fn drains_by_level_then_age() {
    let seen = Calls::default();
    let mut registry = Registry::new();
    let log = seen.clone();
    registry
        .register_fn("spool.record", move |ctx: TaskContext| {
            log.push(ctx.kwarg("label").cloned().unwrap_or_default());
            async { Ok(TaskOutcome::Done) }
        })
        .unwrap();
    let harness = Harness::distributed(registry);

    for (priority, label) in [
        (Priority::LowSpooled, "low"),
        (Priority::MedSpooled, "med"),
        (Priority::HighSpooled, "high-1"),
        (Priority::HighSpooledUnsafe, "high-2"),
    ] {
        let dispatch = harness
            .engine
            .execute("spool.record", priority, labelled(label), None)
            .await
            .unwrap();
        assert_eq!(dispatch, Dispatch::Spooled);
    }

    let backlog = harness.engine.spooler().unwrap().backlog().await.unwrap();
    assert_eq!(backlog.get(QueueTier::High), 2);
    assert_eq!(backlog.get(QueueTier::Med), 3);
    assert_eq!(backlog.total(), 4);

    assert_eq!(harness.drain().await, 4);
    assert_eq!(
        seen.take(),
        vec![json!("high-1"), json!("high-2"), json!("med"), json!("low")]
    );
    assert_eq!(harness.drain().await, 0);
}

#[tokio::test]
async fn corrupt_files_are_skipped_and_removed() {
    let harness = Harness::distributed(Registry::new());
    let spooler = harness.engine.spooler().unwrap();
    let path = spooler.root().join("2").join("00000000000000000000-0000000000-bad.json");
    std::fs::write(&path, b"{ not a record").unwrap();

    assert_eq!(spooler.backlog().await.unwrap().total(), 1);
    assert_eq!(harness.drain().await, 0);
    assert_eq!(spooler.backlog().await.unwrap().total(), 0);
    assert!(!path.exists());
}
