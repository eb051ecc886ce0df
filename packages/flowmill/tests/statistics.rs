//! Statistics aggregation across the four engines.

use std::sync::Arc;

use flowmill::batch::{BatchEngine, BatchItem, BatchSpec, MemoryBatchStore};
use flowmill::job::{JobEngine, JobSpec, MemoryJobStore};
use flowmill::subscription::{
    MemorySubscriptionStore, SubscriptionEngine, SubscriptionSpec,
};
use flowmill::timer::{MemoryTimerStore, TimerEngine, TimerSpec};
use flowmill::{
    BatchEngineConfig, EventBus, ExecutorRegistry, JobEngineConfig, ManualClock,
    StatisticsAggregator, SubscriptionEngineConfig, TimerEngineConfig,
};

#[tokio::test]
async fn snapshot_counts_by_type_status_and_tenant() {
    let clock = Arc::new(ManualClock::starting_now());
    let bus = EventBus::new();

    let mut registry = ExecutorRegistry::new();
    registry.register_job_handler("work", |_job| async move { Ok(None) });
    registry.register_job_handler("doomed", |_job| async move {
        Err(anyhow::anyhow!("always fails"))
    });
    let registry = Arc::new(registry);

    let job_store = Arc::new(MemoryJobStore::new());
    let jobs = JobEngine::new(
        job_store.clone(),
        registry.clone(),
        bus.clone(),
        clock.clone(),
        JobEngineConfig::default(),
    );
    let timer_store = Arc::new(MemoryTimerStore::new());
    let timers = TimerEngine::new(
        timer_store.clone(),
        registry.clone(),
        bus.clone(),
        clock.clone(),
        TimerEngineConfig::default(),
    );
    let batch_store = Arc::new(MemoryBatchStore::new());
    let batches = BatchEngine::new(
        batch_store.clone(),
        registry.clone(),
        bus.clone(),
        clock.clone(),
        BatchEngineConfig::default(),
    );
    let subscription_store = Arc::new(MemorySubscriptionStore::new());
    let subscriptions = SubscriptionEngine::new(
        subscription_store.clone(),
        registry,
        bus,
        clock.clone(),
        SubscriptionEngineConfig::default(),
    );

    // One completed job, one dead-lettered job (per tenant "acme").
    let done = jobs
        .create_job(
            JobSpec::builder()
                .job_type("work")
                .tenant_id("acme")
                .build(),
        )
        .await
        .unwrap();
    jobs.acquire_jobs("w", 10).await.unwrap();
    jobs.execute_job(done.id).await.unwrap();

    let doomed = jobs
        .create_job(
            JobSpec::builder()
                .job_type("doomed")
                .max_retries(0i32)
                .tenant_id("acme")
                .build(),
        )
        .await
        .unwrap();
    jobs.acquire_jobs("w", 10).await.unwrap();
    jobs.execute_job(doomed.id).await.unwrap();

    // A pending timer, a pending batch, an unprocessed subscription.
    timers
        .create_timer(TimerSpec::for_expression("PT5M"))
        .await
        .unwrap();
    batches
        .create_batch(
            BatchSpec::builder()
                .batch_type("reindex")
                .items(vec![BatchItem::new(serde_json::json!({}))])
                .build(),
        )
        .await
        .unwrap();
    subscriptions
        .create_subscription(SubscriptionSpec::signal("reload"))
        .await
        .unwrap();

    let aggregator = StatisticsAggregator::new(
        job_store,
        timer_store,
        batch_store,
        subscription_store,
    );
    let stats = aggregator.snapshot().await.unwrap();

    let completed = stats
        .jobs
        .iter()
        .find(|row| row.work_type == "work" && row.status == "completed")
        .unwrap();
    assert_eq!(completed.count, 1);
    assert_eq!(completed.tenant_id.as_deref(), Some("acme"));

    let dead = stats
        .dead_letters
        .iter()
        .find(|row| row.work_type == "doomed")
        .unwrap();
    assert_eq!(dead.count, 1);
    assert_eq!(stats.failed_job_total(), 1);

    assert!(stats
        .timers
        .iter()
        .any(|row| row.work_type == "duration" && row.status == "pending"));
    assert!(stats
        .batches
        .iter()
        .any(|row| row.work_type == "reindex" && row.status == "pending"));
    assert!(stats
        .subscriptions
        .iter()
        .any(|row| row.work_type == "signal" && row.status == "unprocessed"));

    // Duration percentiles cover the one completed job.
    let durations = stats
        .job_durations
        .iter()
        .find(|row| row.work_type == "work")
        .unwrap();
    assert_eq!(durations.count, 1);
    assert!(durations.p50_ms.is_some());
}
