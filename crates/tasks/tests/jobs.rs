mod common;

use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map};

use drover_tasks::cache::SessionCache;
use drover_tasks::diagnostics::{self, SmokeJob};
use drover_tasks::{
    get_output, output_key, Engine, EngineConfig, Job, JobCheck, JobOptions, MemoryCache,
    Priority, QueueTier, Registry, TaskContext, TaskError, TaskOptions, TaskOutcome,
    DEFAULT_CACHE,
};

use common::{local, Harness};

/// Finalizes `[number]`.
fn part_registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register_fn("count.part", |ctx: TaskContext| async move {
            let number: u64 = ctx.kwarg_as("number")?;
            ctx.finalize(json!([number])).await?;
            Ok::<_, TaskError>(TaskOutcome::Done)
        })
        .unwrap();
    registry
}

fn numbered(priority: Priority, number: u64) -> TaskOptions {
    TaskOptions::default().priority(priority).kwarg("number", number)
}

#[tokio::test]
async fn process_output_merges_once() {
    let (engine, cache) = local(Registry::new());
    let mut job = Job::new("REPORTS", Map::new(), JobOptions::default());
    let a = job.add_task(&engine, "x", TaskOptions::default()).await.unwrap();
    let b = job.add_task(&engine, "x", TaskOptions::default()).await.unwrap();
    let c = job.add_task(&engine, "x", TaskOptions::default()).await.unwrap();

    cache
        .set(&output_key(&a.cache_key()), json!({"rows": 2, "a": 1}), None)
        .await
        .unwrap();
    cache
        .set(&output_key(&b.cache_key()), json!({"rows": 5}), None)
        .await
        .unwrap();

    let merged = job.process_output(&engine).await.unwrap();
    assert_eq!(merged, Some(json!({"rows": 5, "a": 1})));

    // Leftover sessions are cleaned up with the outputs.
    assert!(cache.get(&c.cache_key()).await.unwrap().is_none());
    assert_eq!(job.process_output(&engine).await.unwrap(), None);
}

#[tokio::test]
async fn add_task_inherits_priority_and_caps_expiry() {
    let (engine, _cache) = local(Registry::new());
    let job_expiry = Utc::now() + chrono::Duration::minutes(10);
    let mut job = Job::new(
        "REPORTS_9",
        Map::new(),
        JobOptions::default()
            .priority(Priority::LowSpooled)
            .expires(job_expiry),
    );

    let late = job
        .add_task(
            &engine,
            "x",
            TaskOptions::default().expires(Utc::now() + chrono::Duration::days(1)),
        )
        .await
        .unwrap();
    assert_eq!(late.expires, job.task.expires);
    assert_eq!(late.priority, Priority::LowSpooled);
    assert_eq!(late.group, "REPORTS_9");

    let urgent = job
        .add_task(&engine, "x", TaskOptions::default().priority(Priority::HighInline))
        .await
        .unwrap();
    assert_eq!(urgent.priority, Priority::HighInline);
    assert_eq!(job.task_keys, vec![late.cache_key(), urgent.cache_key()]);
}

#[tokio::test]
async fn local_job_runs_to_completion() {
    let (engine, cache) = local(part_registry());
    let mut job = Job::new(
        "COUNT",
        Map::new(),
        JobOptions::default().priority(Priority::MedInline),
    );
    for number in 0..3 {
        job.add_task(&engine, "count.part", numbered(Priority::MedInline, number))
            .await
            .unwrap();
    }
    job.start(&engine).await.unwrap();

    assert_eq!(
        get_output(cache.as_ref(), &job.cache_key()).await.unwrap(),
        Some(json!([0, 1, 2]))
    );
    assert!(cache.get(&job.cache_key()).await.unwrap().is_none());
}

#[tokio::test]
async fn distributed_check_reports_running_until_all_done() {
    let harness = Harness::distributed(Registry::new());
    let engine = &harness.engine;
    let mut job = Job::new("COUNT", Map::new(), JobOptions::default());
    let first = job.add_task(engine, "x", TaskOptions::default()).await.unwrap();
    let second = job.add_task(engine, "x", TaskOptions::default()).await.unwrap();

    harness
        .cache
        .set(&output_key(&first.cache_key()), json!([1]), None)
        .await
        .unwrap();
    harness.cache.delete(&first.cache_key()).await.unwrap();
    assert_eq!(job.check_completion(engine).await.unwrap(), JobCheck::Running);

    harness
        .cache
        .set(&output_key(&second.cache_key()), json!([2]), None)
        .await
        .unwrap();
    harness.cache.delete(&second.cache_key()).await.unwrap();
    assert_eq!(
        job.check_completion(engine).await.unwrap(),
        JobCheck::Complete {
            output: Some(json!([1, 2])),
            expired: false,
        }
    );
}

#[tokio::test]
async fn expired_job_completes_with_partial_output() {
    let harness = Harness::distributed(Registry::new());
    let engine = &harness.engine;
    let mut job = Job::new("COUNT", Map::new(), JobOptions::default());
    let done = job.add_task(engine, "x", TaskOptions::default()).await.unwrap();
    let stuck = job.add_task(engine, "x", TaskOptions::default()).await.unwrap();

    harness
        .cache
        .set(&output_key(&done.cache_key()), json!(["partial"]), None)
        .await
        .unwrap();
    harness.cache.delete(&done.cache_key()).await.unwrap();
    job.task.expires = Utc::now() - chrono::Duration::seconds(1);

    assert_eq!(
        job.check_completion(engine).await.unwrap(),
        JobCheck::Complete {
            output: Some(json!(["partial"])),
            expired: true,
        }
    );
    assert!(job.task.expired);
    assert!(harness.cache.get(&stuck.cache_key()).await.unwrap().is_none());
}

#[tokio::test]
async fn single_node_check_forces_completion() {
    let mut config = EngineConfig::local();
    config.engine.job_poll_attempts = 3;
    config.engine.job_poll_interval_secs = 0.01;
    let cache = std::sync::Arc::new(MemoryCache::new());
    let engine = Engine::builder(config)
        .cache(DEFAULT_CACHE, cache.clone())
        .build()
        .unwrap();

    let mut job = Job::new("COUNT", Map::new(), JobOptions::default());
    let never_run = job.add_task(&engine, "x", TaskOptions::default()).await.unwrap();

    let check = tokio::time::timeout(Duration::from_secs(5), job.check_completion(&engine))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        check,
        JobCheck::Complete {
            output: None,
            expired: false,
        }
    );
    assert!(cache.get(&never_run.cache_key()).await.unwrap().is_none());
}

#[tokio::test]
async fn distributed_job_runs_through_queue_and_spool() {
    let harness = Harness::distributed(part_registry());
    let engine = &harness.engine;
    let mut job = Job::new("COUNT", Map::new(), JobOptions::default());
    for number in 0..3 {
        job.add_task(engine, "count.part", numbered(Priority::MedSpooled, number))
            .await
            .unwrap();
    }
    job.start(engine).await.unwrap();
    assert_eq!(harness.queue(QueueTier::Med).len(), 4);

    // Three tasks and the completion check, one at a time in their group.
    assert_eq!(harness.pump().await, 8);
    assert!(harness.queue(QueueTier::Med).is_empty());
    assert_eq!(
        get_output(harness.cache.as_ref(), &job.cache_key()).await.unwrap(),
        Some(json!([0, 1, 2]))
    );
}

#[tokio::test]
async fn smoke_job_tree_rolls_up_to_root() {
    let mut registry = Registry::new();
    diagnostics::register(&mut registry).unwrap();
    let (engine, cache) = local(registry);

    let spec = SmokeJob {
        depth: 2,
        jobs: 2,
        tasks: 2,
        ..SmokeJob::new("smoke")
    };
    assert_eq!(spec.total_tasks(), 4);
    let root = diagnostics::smoke_job(&engine, &spec).await.unwrap().unwrap();

    let key = output_key(&root.cache_key());
    let output = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(output) = cache.get(&key).await.unwrap() {
                return output;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(
        output,
        json!([
            "smoke-SUBJOB: 0-TASK: 0",
            "smoke-SUBJOB: 0-TASK: 1",
            "smoke-SUBJOB: 1-TASK: 0",
            "smoke-SUBJOB: 1-TASK: 1",
        ])
    );
}

#[tokio::test]
async fn oversized_smoke_job_is_refused() {
    let mut registry = Registry::new();
    diagnostics::register(&mut registry).unwrap();
    let (engine, cache) = local(registry);

    let spec = SmokeJob {
        depth: 5,
        jobs: 10,
        tasks: 10,
        ..SmokeJob::new("big")
    };
    assert!(diagnostics::smoke_job(&engine, &spec).await.unwrap().is_none());
    assert!(cache.is_empty());
}
