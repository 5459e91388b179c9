//! Integration tests for the Redis backend.
//!
//! These tests need a Redis server with the JSON module (e.g. Redis Stack).
//! Run with: REDIS_URL=redis://localhost:6379 cargo test --test redis_backend -- --ignored

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use uuid::Uuid;
use xtraplatform_jobs::scheduler::job::now_epoch;
use xtraplatform_jobs::scheduler::{
    BackendOptions, HealthState, Job, JobProcessor, JobQueue, JobQueueBackend, JobResult,
    JobRunner, JobSet, RedisBackend, RunnerConfig, Volatile,
};

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// Backend under a fresh key prefix, so tests never see each other's data.
async fn backend_with(options: BackendOptions) -> (Arc<RedisBackend>, String) {
    let prefix = format!("test:jobs:{}", Uuid::new_v4());
    let backend = RedisBackend::connect(&redis_url(), &prefix, options)
        .await
        .expect("Redis should be reachable for integration tests");
    (Arc::new(backend), prefix)
}

async fn backend() -> (Arc<RedisBackend>, String) {
    backend_with(BackendOptions::default()).await
}

async fn raw_connection() -> redis::aio::MultiplexedConnection {
    redis::Client::open(redis_url())
        .expect("valid Redis URL")
        .get_multiplexed_async_connection()
        .await
        .expect("Redis connection")
}

async fn cleanup(prefix: &str) {
    let mut conn = raw_connection().await;
    let keys: Vec<String> = redis::cmd("KEYS")
        .arg(format!("{}:*", prefix))
        .query_async(&mut conn)
        .await
        .unwrap_or_default();
    if !keys.is_empty() {
        let _: () = redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .expect("cleanup should succeed");
    }
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_backend -- --ignored
async fn test_priority_and_fifo_order() {
    let (backend, prefix) = backend().await;

    backend
        .push(Job::new("tiles", json!({})).with_id("low").into(), false)
        .await
        .unwrap();
    backend
        .push(
            Job::new("tiles", json!({}))
                .with_id("high-1")
                .with_priority(10)
                .into(),
            false,
        )
        .await
        .unwrap();
    backend
        .push(
            Job::new("tiles", json!({}))
                .with_id("high-2")
                .with_priority(10)
                .into(),
            false,
        )
        .await
        .unwrap();

    let mut order = Vec::new();
    while let Some(job) = backend.take("tiles", "e1").await.unwrap() {
        assert_eq!(job.executor.as_deref(), Some("e1"));
        order.push(job.id);
    }
    assert_eq!(order, vec!["high-1", "high-2", "low"]);
    assert_eq!(backend.get_taken().await.unwrap().len(), 3);

    for id in &order {
        assert!(backend.done(id).await.unwrap());
    }
    assert!(backend.get_taken().await.unwrap().is_empty());
    assert!(backend.get_job("low").await.unwrap().is_none());
    assert!(!backend.done("low").await.unwrap());

    cleanup(&prefix).await;
}

#[tokio::test]
#[ignore]
async fn test_untake_returns_job_to_front() {
    let (backend, prefix) = backend().await;

    for id in ["a", "b"] {
        backend
            .push(Job::new("tiles", json!({})).with_id(id).into(), false)
            .await
            .unwrap();
    }

    let job = backend.take("tiles", "e1").await.unwrap().unwrap();
    assert_eq!(job.id, "a");
    backend.update_job("a", 3).await.unwrap();

    let stored = backend.get_job("a").await.unwrap().unwrap();
    backend.push(stored.into(), true).await.unwrap();

    assert!(backend.get_taken().await.unwrap().is_empty());
    let lanes = backend.get_open().await.unwrap();
    let ids: Vec<&str> = lanes[0].jobs.iter().map(|job| job.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(lanes[0].jobs[0].current, 3);
    assert!(lanes[0].jobs[0].executor.is_none());

    cleanup(&prefix).await;
}

#[tokio::test]
#[ignore]
async fn test_retries_then_failed_list() {
    let (backend, prefix) = backend_with(BackendOptions {
        max_retries: 1,
        max_failed: 10,
    })
    .await;

    backend
        .push(Job::new("tiles", json!({})).with_id("a").into(), false)
        .await
        .unwrap();

    backend.take("tiles", "e1").await.unwrap().unwrap();
    assert!(backend.error("a", "timeout", true).await.unwrap());
    let job = backend.get_job("a").await.unwrap().unwrap();
    assert_eq!(job.retries, 1);

    backend.take("tiles", "e1").await.unwrap().unwrap();
    assert!(backend.error("a", "timeout", true).await.unwrap());

    let failed = backend.get_failed().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, "a");
    assert!(backend.take("tiles", "e1").await.unwrap().is_none());

    assert_eq!(backend.clear_failed().await.unwrap(), 1);
    assert!(backend.get_failed().await.unwrap().is_empty());

    cleanup(&prefix).await;
}

#[tokio::test]
#[ignore]
async fn test_set_completion_pushes_follow_ups_once() {
    let (backend, prefix) = backend().await;

    let set = JobSet::new("seed", "Seed", json!({"tiles": 0}))
        .with_id("set")
        .with_total(2)
        .with_follow_up(Job::new("cleanup", json!({})).with_id("follow-up"));
    backend.push(set.into(), false).await.unwrap();

    let mut params = Map::new();
    params.insert("tiles".to_string(), Value::from(5));

    assert!(backend.update_job_set("set", 1, &params).await.unwrap());
    assert!(backend.take("cleanup", "e1").await.unwrap().is_none());

    assert!(backend.update_job_set("set", 1, &params).await.unwrap());
    assert!(backend.update_job_set("set", 1, &params).await.unwrap());

    let follow_up = backend.take("cleanup", "e1").await.unwrap().unwrap();
    assert_eq!(follow_up.id, "follow-up");
    assert!(backend.take("cleanup", "e1").await.unwrap().is_none());

    let set = backend.get_set("set").await.unwrap().unwrap();
    assert!(set.is_done());
    assert_eq!(set.details["tiles"], json!(15));

    assert!(backend.done_set("set").await.unwrap());
    assert!(backend.get_set("set").await.unwrap().is_none());

    cleanup(&prefix).await;
}

#[tokio::test]
#[ignore]
async fn test_push_notifications() {
    let (backend, prefix) = backend().await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    backend
        .on_push(Arc::new(move |job_type: &str| {
            let _ = tx.send(job_type.to_string());
        }))
        .await
        .unwrap();

    backend
        .push(Job::new("tiles", json!({})).into(), false)
        .await
        .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("notification should arrive");
    assert_eq!(received.as_deref(), Some("tiles"));

    cleanup(&prefix).await;
}

#[tokio::test]
#[ignore]
async fn test_health_state_available() {
    let (backend, prefix) = backend().await;
    assert_eq!(backend.state().await, HealthState::Available);
    cleanup(&prefix).await;
}

#[tokio::test]
#[ignore]
async fn test_take_stamps_executor_on_idle_job() {
    let (backend, prefix) = backend().await;

    let mut job = Job::new("tiles", json!({})).with_id("a");
    job.updated_at = now_epoch() - 3600;
    backend.push(job.into(), false).await.unwrap();

    let taken = backend.take("tiles", "e1").await.unwrap().unwrap();
    assert_eq!(taken.executor.as_deref(), Some("e1"));

    let stored = backend.get_taken().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].executor.as_deref(), Some("e1"));
    assert!(!stored[0].is_stale(now_epoch(), 60));

    cleanup(&prefix).await;
}

#[tokio::test]
#[ignore]
async fn test_concurrent_progress_updates_are_not_lost() {
    let (backend, prefix) = backend().await;

    backend
        .push(Job::new("tiles", json!({})).with_id("a").with_total(100).into(), false)
        .await
        .unwrap();
    backend.take("tiles", "e1").await.unwrap().unwrap();

    let updates = (0..20).map(|_| {
        let backend = Arc::clone(&backend);
        tokio::spawn(async move { backend.update_job("a", 2).await.unwrap() })
    });
    for update in futures::future::join_all(updates).await {
        assert!(update.unwrap());
    }
    assert_eq!(backend.get_job("a").await.unwrap().unwrap().current, 40);

    backend.update_job("a", i64::MAX).await.unwrap();
    assert_eq!(backend.get_job("a").await.unwrap().unwrap().current, 100);
    backend.update_job("a", i64::MIN).await.unwrap();
    assert_eq!(backend.get_job("a").await.unwrap().unwrap().current, 0);
    assert!(!backend.update_job("missing", 1).await.unwrap());

    cleanup(&prefix).await;
}

#[tokio::test]
#[ignore]
async fn test_push_of_failed_job_leaves_failed_list() {
    let (backend, prefix) = backend().await;

    backend
        .push(Job::new("tiles", json!({})).with_id("a").into(), false)
        .await
        .unwrap();
    backend.take("tiles", "e1").await.unwrap().unwrap();
    assert!(backend.error("a", "fatal", false).await.unwrap());
    assert_eq!(backend.get_failed().await.unwrap().len(), 1);

    backend
        .push(Job::new("tiles", json!({})).with_id("a").into(), false)
        .await
        .unwrap();
    assert!(backend.get_failed().await.unwrap().is_empty());
    assert_eq!(backend.take("tiles", "e1").await.unwrap().unwrap().id, "a");

    cleanup(&prefix).await;
}

#[tokio::test]
#[ignore]
async fn test_failed_transition_keeps_job_taken() {
    let (backend, prefix) = backend().await;

    // A set key of the wrong type makes crediting the member fail.
    let mut conn = raw_connection().await;
    let _: () = redis::cmd("SET")
        .arg(backend.keys().set("broken"))
        .arg("not json")
        .query_async(&mut conn)
        .await
        .unwrap();

    for id in ["a", "b"] {
        backend
            .push(
                Job::new("tiles", json!({}))
                    .with_id(id)
                    .with_part_of("broken")
                    .into(),
                false,
            )
            .await
            .unwrap();
        backend.take("tiles", "e1").await.unwrap().unwrap();
    }

    assert!(backend.done("a").await.is_err());
    assert!(backend.error("b", "fatal", false).await.is_err());

    let mut taken: Vec<String> = backend
        .get_taken()
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();
    taken.sort();
    assert_eq!(taken, vec!["a", "b"]);
    assert!(backend.get_failed().await.unwrap().is_empty());

    cleanup(&prefix).await;
}

struct CountingProcessor;

#[async_trait]
impl JobProcessor for CountingProcessor {
    fn job_type(&self) -> &str {
        "tiles"
    }

    fn concurrency(&self, _set: &JobSet) -> usize {
        2
    }

    async fn process(
        &self,
        job: &Job,
        _set: Option<&JobSet>,
        queue: &JobQueue,
    ) -> anyhow::Result<JobResult> {
        queue.update_job(&job.id, 1).await?;
        Ok(JobResult::success())
    }
}

#[tokio::test]
#[ignore]
async fn test_runner_drains_set() {
    let (backend, prefix) = backend().await;
    let queue = JobQueue::select(vec![backend as Arc<dyn JobQueueBackend>]).unwrap();

    queue
        .push(
            JobSet::new("tiles", "Seed", json!({}))
                .with_id("set")
                .with_total(5),
        )
        .await
        .unwrap();
    for _ in 0..5 {
        queue
            .push(Job::new("tiles", json!({})).with_part_of("set"))
            .await
            .unwrap();
    }

    let config = RunnerConfig::new(4)
        .with_executor("it-runner")
        .with_poll_interval(Duration::from_millis(50));
    let processors: Vec<Arc<dyn JobProcessor>> = vec![Arc::new(CountingProcessor)];
    let mut runner = JobRunner::new(config, queue.clone(), processors);
    runner.start().await.unwrap();

    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let set = queue.get_set("set").await.unwrap().unwrap();
            if set.is_done() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;

    runner.shutdown().await.unwrap();
    assert!(drained.is_ok(), "runner should complete the set");
    assert_eq!(runner.stats().jobs_succeeded, 5);

    cleanup(&prefix).await;
}
