mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};

use drover_tasks::cache::{load_session, SessionCache};
use drover_tasks::engine::ERROR_LOG_PREFIX;
use drover_tasks::task::CacheRef;
use drover_tasks::{
    get_output, output_key, Dispatch, DispatchError, Job, JobOptions, MessageBody, Partitioned,
    Priority, Registry, Sent, Task, TaskContext, TaskError, TaskGroup, TaskOptions, TaskOutcome,
};

use common::{local, Calls};

fn inline(priority: Priority) -> TaskOptions {
    TaskOptions::default().priority(priority)
}

#[tokio::test]
async fn finalize_publishes_output_and_removes_session() {
    let mut registry = Registry::new();
    registry
        .register_fn("reports.total", |ctx: TaskContext| async move {
            ctx.finalize(json!({"total": 3})).await?;
            Ok::<_, TaskError>(TaskOutcome::Done)
        })
        .unwrap();
    let (engine, cache) = local(registry);

    let task = Task::new("reports.total", "REPORTS", inline(Priority::MedInline));
    let sent = engine.send(&task).await.unwrap();
    assert_eq!(sent, Sent::Local(Dispatch::Executed(TaskOutcome::Done)));

    let key = task.cache_key();
    assert!(cache.get(&key).await.unwrap().is_none());
    assert_eq!(
        get_output(cache.as_ref(), &key).await.unwrap(),
        Some(json!({"total": 3}))
    );
    // Single consumer: the output is gone once read.
    assert_eq!(get_output(cache.as_ref(), &key).await.unwrap(), None);
}

#[tokio::test]
async fn unfinalized_task_records_null_output() {
    let mut registry = Registry::new();
    registry
        .register_fn("noop", |_ctx: TaskContext| async { Ok(TaskOutcome::Done) })
        .unwrap();
    let (engine, cache) = local(registry);

    let task = Task::new("noop", "G", inline(Priority::HighInline));
    engine.send(&task).await.unwrap();

    assert_eq!(
        cache.get(&output_key(&task.cache_key())).await.unwrap(),
        Some(Value::Null)
    );
}

#[tokio::test]
async fn business_failure_is_recorded_as_output() {
    let mut registry = Registry::new();
    registry
        .register_fn("strict", |_ctx: TaskContext| async {
            Err::<TaskOutcome, _>(TaskError::Failed("bad input".into()))
        })
        .unwrap();
    let (engine, cache) = local(registry);

    let task = Task::new("strict", "G", inline(Priority::MedInline));
    let sent = engine.send(&task).await.unwrap();
    assert_eq!(
        sent,
        Sent::Local(Dispatch::Executed(TaskOutcome::Failed("bad input".into())))
    );
    assert_eq!(
        get_output(cache.as_ref(), &task.cache_key()).await.unwrap(),
        Some(json!("Task failed: bad input"))
    );
}

#[tokio::test]
async fn transient_failure_is_retried_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = Registry::new();
    let counter = calls.clone();
    registry
        .register_fn("flaky", move |_ctx: TaskContext| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(TaskError::Transient("connection reset".into()));
                }
                Ok(TaskOutcome::Done)
            }
        })
        .unwrap();
    let (engine, _cache) = local(registry);

    let task = Task::new("flaky", "G", inline(Priority::MedInline));
    let sent = engine.send(&task).await.unwrap();
    assert_eq!(sent, Sent::Local(Dispatch::Executed(TaskOutcome::Done)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn repeated_transient_failure_becomes_exception_output() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = Registry::new();
    let counter = calls.clone();
    registry
        .register_fn("down", move |_ctx: TaskContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<TaskOutcome, _>(TaskError::Transient("timeout".into())) }
        })
        .unwrap();
    let (engine, cache) = local(registry);

    let task = Task::new("down", "G", inline(Priority::MedInline));
    engine.send(&task).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        get_output(cache.as_ref(), &task.cache_key()).await.unwrap(),
        Some(json!("Task exception: timeout"))
    );
}

struct Account {
    id: String,
}

impl Partitioned for Account {
    fn partition_identity(&self) -> String {
        self.id.clone()
    }
}

#[tokio::test]
async fn keyed_partition_and_cache_key_survive_the_cache() {
    let seen = Calls::default();
    let mut registry = Registry::new();
    let log = seen.clone();
    registry
        .register_fn("billing.invoice", move |ctx: TaskContext| {
            log.push(json!([ctx.task().partition_key(), ctx.task().cache_key()]));
            async { Ok(TaskOutcome::Done) }
        })
        .unwrap();
    let (engine, cache) = local(registry);

    let account = Account { id: "acct-42".into() };
    let mut job = Job::new(TaskGroup::keyed(&account), Map::new(), JobOptions::default());
    let task = job
        .add_task(&engine, "billing.invoice", inline(Priority::MedInline))
        .await
        .unwrap();
    assert_eq!(task.partition_key(), "DEFAULT_acct-42");
    assert_eq!(task.cache_key(), format!("{}_{}", job.cache_key(), task.key));

    let stored = load_session(cache.as_ref(), &task.cache_key())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.task().cache_key(), task.cache_key());
    assert_eq!(stored.task().partition_key(), "DEFAULT_acct-42");

    engine.send(&task).await.unwrap();
    assert_eq!(
        seen.take(),
        vec![json!(["DEFAULT_acct-42", task.cache_key()])]
    );
}

#[tokio::test]
async fn expired_task_is_purged_not_run() {
    let calls = Calls::default();
    let mut registry = Registry::new();
    let log = calls.clone();
    registry
        .register_fn("late", move |_ctx: TaskContext| {
            log.push(Value::Null);
            async { Ok(TaskOutcome::Done) }
        })
        .unwrap();
    let (engine, cache) = local(registry);

    let mut task = Task::new("late", "G", inline(Priority::MedInline));
    task.expires = Utc::now() - chrono::Duration::seconds(5);
    let body = task.put_info(&engine).await.unwrap();
    assert!(cache.get(&task.cache_key()).await.unwrap().is_some());

    let dispatch = engine
        .execute("late", Priority::MedInline, body, None)
        .await
        .unwrap();
    assert_eq!(dispatch, Dispatch::Skipped);
    assert_eq!(calls.len(), 0);
    assert!(cache.get(&task.cache_key()).await.unwrap().is_none());
}

#[tokio::test]
async fn missing_session_is_skipped() {
    let mut registry = Registry::new();
    registry
        .register_fn("gone", |_ctx: TaskContext| async { Ok(TaskOutcome::Done) })
        .unwrap();
    let (engine, _cache) = local(registry);

    let body = MessageBody::Cached {
        cached_task: CacheRef {
            cache_name: "session".into(),
            task_key: "task_tmissing".into(),
        },
    };
    let dispatch = engine
        .execute("gone", Priority::MedInline, body, None)
        .await
        .unwrap();
    assert_eq!(dispatch, Dispatch::Skipped);
}

#[tokio::test]
async fn uncached_task_carries_kwargs_and_args_inline() {
    let seen = Calls::default();
    let mut registry = Registry::new();
    let log = seen.clone();
    registry
        .register_fn("echo", move |ctx: TaskContext| {
            log.push(json!({
                "kwargs": Value::Object(ctx.kwargs().clone()),
                "args": ctx.args().to_vec(),
            }));
            async { Ok(TaskOutcome::Done) }
        })
        .unwrap();
    let (engine, cache) = local(registry);

    let task = Task::new(
        "echo",
        "G",
        inline(Priority::HighInline)
            .uncached()
            .kwarg("report", 7)
            .args(vec![json!("x"), json!(2)]),
    );
    assert!(matches!(
        task.put_info(&engine).await.unwrap(),
        MessageBody::Inline(ref m) if m["_args"] == json!(["x", 2])
    ));

    engine.send(&task).await.unwrap();
    assert_eq!(
        seen.take(),
        vec![json!({"kwargs": {"report": 7}, "args": ["x", 2]})]
    );
    assert!(cache.is_empty());
}

#[tokio::test]
async fn unknown_and_local_functions_are_not_dispatched() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut registry = Registry::new();
    registry
        .register_local("cleanup.tmp", move |ctx: TaskContext| {
            let _ = tx.send(ctx.kwarg("path").cloned());
            async { Ok(TaskOutcome::Done) }
        })
        .unwrap();
    let (engine, _cache) = local(registry);

    let err = engine
        .execute("nope", Priority::MedSpooled, MessageBody::Inline(Map::new()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::UnknownHandler(ref n) if n == "nope"));

    let err = engine
        .execute("cleanup.tmp", Priority::MedSpooled, MessageBody::Inline(Map::new()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NotDispatchable(_)));

    // The local path may run it.
    let mut kwargs = Map::new();
    kwargs.insert("path".into(), json!("/tmp/x"));
    let dispatch = engine
        .run_local("cleanup.tmp", Priority::LowSpooled, kwargs)
        .await
        .unwrap();
    assert_eq!(dispatch, Dispatch::Spooled);
    let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(got, Some(json!("/tmp/x")));
}

#[tokio::test]
async fn corrupt_session_is_parked() {
    let mut registry = Registry::new();
    registry
        .register_fn("any", |_ctx: TaskContext| async { Ok(TaskOutcome::Done) })
        .unwrap();
    let (engine, cache) = local(registry);

    cache
        .set("task_tbad", json!({"kind": "nonsense"}), None)
        .await
        .unwrap();
    let body = MessageBody::Cached {
        cached_task: CacheRef {
            cache_name: "session".into(),
            task_key: "task_tbad".into(),
        },
    };
    let err = engine
        .execute("any", Priority::MedInline, body, None)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::CorruptSession { ref key, .. } if key == "task_tbad"));
    assert!(cache.get("task_tbad").await.unwrap().is_none());
    assert_eq!(
        cache
            .get(&format!("{ERROR_LOG_PREFIX}task_tbad"))
            .await
            .unwrap(),
        Some(json!({"kind": "nonsense"}))
    );
}

#[tokio::test]
async fn run_queue_function_wraps_a_call() {
    let seen = Calls::default();
    let mut registry = Registry::new();
    let log = seen.clone();
    registry
        .register_fn("mail.send", move |ctx: TaskContext| {
            log.push(json!([ctx.kwarg("to"), ctx.args().to_vec()]));
            async { Ok(TaskOutcome::Done) }
        })
        .unwrap();
    let (engine, _cache) = local(registry);

    let mut kwargs = Map::new();
    kwargs.insert("to".into(), json!("ops@example.com"));
    let task = engine
        .run_queue_function(
            "mail.send",
            TaskGroup::System,
            vec![json!(1)],
            kwargs,
            inline(Priority::HighInline),
        )
        .await
        .unwrap();
    assert_eq!(task.group, "DEFAULT_SYSTEM");
    assert_eq!(seen.take(), vec![json!(["ops@example.com", [1]])]);
}
