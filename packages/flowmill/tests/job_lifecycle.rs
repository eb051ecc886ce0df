//! Job engine lifecycle scenarios on the in-memory store with a stepped
//! clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Duration;
use flowmill::job::{JobEngine, JobOutcome, JobSpec, JobStatus, MemoryJobStore};
use flowmill::{Clock, EngineError, EventBus, ExecutorRegistry, JobEngineConfig, ManualClock};

struct Harness {
    engine: JobEngine,
    store: Arc<MemoryJobStore>,
    clock: Arc<ManualClock>,
    handled: Arc<AtomicUsize>,
}

fn harness(handler_fails: bool, config: JobEngineConfig) -> Harness {
    let store = Arc::new(MemoryJobStore::new());
    let clock = Arc::new(ManualClock::starting_now());
    let handled = Arc::new(AtomicUsize::new(0));

    let mut registry = ExecutorRegistry::new();
    let calls = handled.clone();
    registry.register_job_handler("work", move |_job| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            if handler_fails {
                Err(anyhow::anyhow!("handler exploded"))
            } else {
                Ok(None)
            }
        }
    });

    let engine = JobEngine::new(
        store.clone(),
        Arc::new(registry),
        EventBus::new(),
        clock.clone(),
        config,
    );

    Harness {
        engine,
        store,
        clock,
        handled,
    }
}

#[tokio::test]
async fn round_trip_success_is_terminal() {
    let h = harness(false, JobEngineConfig::default());
    let job = h
        .engine
        .create_job(JobSpec::immediate("work", serde_json::json!({"n": 1})))
        .await
        .unwrap();

    let claimed = h.engine.acquire_jobs("worker-a", 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    // Running implies a lock owner.
    assert_eq!(claimed[0].status, JobStatus::Running);
    assert!(claimed[0].lock_owner.is_some());

    let outcome = h.engine.execute_job(job.id).await.unwrap();
    assert_eq!(outcome, JobOutcome::Completed);
    assert_eq!(h.handled.load(Ordering::SeqCst), 1);

    let stored = h.engine.find_job(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert!(stored.ended_at.is_some());

    // A completed job is never re-acquired.
    assert!(h.engine.acquire_jobs("worker-b", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn exponential_backoff_then_dead_letter() {
    let h = harness(true, JobEngineConfig::default());
    let job = h
        .engine
        .create_job(
            JobSpec::builder()
                .job_type("work")
                .retry_wait_ms(1_000i64)
                .build(),
        )
        .await
        .unwrap();

    let t0 = h.clock.now();
    let expected_delays = [2, 4, 8]; // seconds after each failing attempt

    for (attempt, delay) in expected_delays.iter().enumerate() {
        let claimed = h.engine.acquire_jobs("w", 10).await.unwrap();
        assert_eq!(claimed.len(), 1, "attempt {} should claim", attempt + 1);

        let outcome = h.engine.execute_job(job.id).await.unwrap();
        assert_eq!(outcome, JobOutcome::Retried);

        let stored = h.engine.find_job(job.id).await.unwrap();
        assert_eq!(stored.retry_count, attempt as i32 + 1);
        assert_eq!(
            stored.next_retry_at.unwrap(),
            h.clock.now() + Duration::seconds(*delay)
        );

        // Not eligible until the backoff elapses.
        assert!(h.engine.acquire_jobs("w", 10).await.unwrap().is_empty());
        h.clock.advance(Duration::seconds(*delay));
    }

    // Fourth attempt exhausts the budget and moves the row out.
    h.engine.acquire_jobs("w", 10).await.unwrap();
    let outcome = h.engine.execute_job(job.id).await.unwrap();
    assert_eq!(outcome, JobOutcome::DeadLettered);
    assert_eq!(h.handled.load(Ordering::SeqCst), 4);
    assert_eq!(h.store.job_count(), 0);
    assert_eq!(h.store.dead_letter_count(), 1);

    let dead = &h.engine.list_dead_letters(10, 0).await.unwrap()[0];
    assert_eq!(dead.source_job_id, job.id);
    assert_eq!(dead.total_retries, 3);
    assert!(dead.exception_message.as_deref().unwrap().contains("handler exploded"));

    // Sanity: the whole schedule took t0 + 2 + 4 + 8 seconds.
    assert_eq!(h.clock.now(), t0 + Duration::seconds(14));
}

#[tokio::test]
async fn lock_expiry_recovery_keeps_retry_count() {
    let mut config = JobEngineConfig::default();
    config.lock_ttl_ms = 60_000;
    let h = harness(false, config);

    let job = h
        .engine
        .create_job(JobSpec::immediate("work", serde_json::Value::Null))
        .await
        .unwrap();

    // Worker A claims and crashes (never completes).
    let claimed = h.engine.acquire_jobs("worker-a", 10).await.unwrap();
    assert_eq!(claimed.len(), 1);

    // While the lock is live nobody else can claim.
    assert!(h.engine.acquire_jobs("worker-b", 10).await.unwrap().is_empty());

    // TTL passes, the sweeper reaps the lock.
    h.clock.advance(Duration::seconds(61));
    assert_eq!(h.engine.release_expired_locks().await.unwrap(), 1);

    let reclaimed = h.engine.acquire_jobs("worker-b", 10).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, job.id);
    assert_eq!(reclaimed[0].retry_count, 0);
    assert_eq!(reclaimed[0].lock_owner.as_deref(), Some("worker-b"));
}

#[tokio::test]
async fn dead_letter_replay_creates_fresh_pending_job() {
    let h = harness(true, JobEngineConfig::default());
    let job = h
        .engine
        .create_job(
            JobSpec::builder()
                .job_type("work")
                .max_retries(0i32)
                .build(),
        )
        .await
        .unwrap();

    h.engine.acquire_jobs("w", 10).await.unwrap();
    assert_eq!(
        h.engine.execute_job(job.id).await.unwrap(),
        JobOutcome::DeadLettered
    );

    let dead_id = h.engine.list_dead_letters(10, 0).await.unwrap()[0].id;
    let replayed = h.engine.retry_dead_letter_job(dead_id).await.unwrap();
    assert_ne!(replayed.id, job.id);
    assert_eq!(replayed.status, JobStatus::Pending);
    assert_eq!(replayed.retry_count, 0);

    // The dead-letter row stays for the audit trail, with the replay
    // counted.
    let dead = h.engine.list_dead_letters(10, 0).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].replay_count, 1);

    assert!(matches!(
        h.engine.retry_dead_letter_job(uuid::Uuid::new_v4()).await,
        Err(EngineError::NotFound { .. })
    ));
}

#[tokio::test]
async fn cancel_removes_pending_but_not_running() {
    let h = harness(false, JobEngineConfig::default());
    let pending = h
        .engine
        .create_job(JobSpec::immediate("work", serde_json::Value::Null))
        .await
        .unwrap();
    assert!(h.engine.cancel_job(pending.id).await.unwrap());

    let running = h
        .engine
        .create_job(JobSpec::immediate("work", serde_json::Value::Null))
        .await
        .unwrap();
    h.engine.acquire_jobs("w", 10).await.unwrap();
    assert!(!h.engine.cancel_job(running.id).await.unwrap());
}

#[tokio::test]
async fn priority_orders_acquisition() {
    let h = harness(false, JobEngineConfig::default());
    let low = h
        .engine
        .create_job(JobSpec::builder().job_type("work").priority(10i32).build())
        .await
        .unwrap();
    h.clock.advance(Duration::milliseconds(5));
    let high = h
        .engine
        .create_job(JobSpec::builder().job_type("work").priority(90i32).build())
        .await
        .unwrap();

    let claimed = h.engine.acquire_jobs("w", 10).await.unwrap();
    assert_eq!(claimed[0].id, high.id);
    assert_eq!(claimed[1].id, low.id);
}

#[tokio::test]
async fn retention_drops_old_completed_jobs() {
    let h = harness(false, JobEngineConfig::default());
    let job = h
        .engine
        .create_job(JobSpec::immediate("work", serde_json::Value::Null))
        .await
        .unwrap();
    h.engine.acquire_jobs("w", 10).await.unwrap();
    h.engine.execute_job(job.id).await.unwrap();

    // Inside the window nothing is deleted.
    assert_eq!(h.engine.cleanup_finished().await.unwrap(), 0);

    h.clock.advance(Duration::days(31));
    assert_eq!(h.engine.cleanup_finished().await.unwrap(), 1);
    assert_eq!(h.store.job_count(), 0);
}
