//! Batch engine scenarios: completion math, cancellation, part retries.

use std::sync::Arc;

use chrono::Duration;
use flowmill::batch::{
    BatchEngine, BatchItem, BatchPartStatus, BatchSpec, BatchStatus, MemoryBatchStore,
};
use flowmill::{BatchEngineConfig, Clock, EventBus, ExecutorRegistry, ManualClock, PartOutcome};

struct Harness {
    engine: BatchEngine,
    store: Arc<MemoryBatchStore>,
    clock: Arc<ManualClock>,
}

/// Executor contract for these tests: part data `{"fail": true}` fails,
/// anything else succeeds and echoes its data back as the result.
fn harness() -> Harness {
    let store = Arc::new(MemoryBatchStore::new());
    let clock = Arc::new(ManualClock::starting_now());

    let mut registry = ExecutorRegistry::new();
    registry.register_part_executor("t", |part, _batch| async move {
        if part.data.get("fail").and_then(serde_json::Value::as_bool) == Some(true) {
            PartOutcome::fail("part exploded")
        } else {
            PartOutcome::ok_with(part.data.clone())
        }
    });

    let engine = BatchEngine::new(
        store.clone(),
        Arc::new(registry),
        EventBus::new(),
        clock.clone(),
        BatchEngineConfig::default(),
    );

    Harness {
        engine,
        store,
        clock,
    }
}

fn items(success: usize, failing: usize) -> Vec<BatchItem> {
    let mut items: Vec<BatchItem> = (0..success)
        .map(|n| BatchItem::typed("t", serde_json::json!({"n": n})))
        .collect();
    items.extend((0..failing).map(|_| BatchItem::typed("t", serde_json::json!({"fail": true}))));
    items
}

fn assert_counter_invariant(batch: &flowmill::batch::Batch, skipped: i32) {
    assert!(batch.total >= batch.processed_total);
    assert_eq!(
        batch.processed_total,
        batch.success_total + batch.fail_total + skipped
    );
}

#[tokio::test]
async fn completion_math_with_failures() {
    let h = harness();
    let batch = h
        .engine
        .create_batch(
            BatchSpec::builder()
                .batch_type("t")
                .items(items(7, 2))
                .max_retries(1i32)
                .build(),
        )
        .await
        .unwrap();

    h.engine.run_once().await.unwrap();

    let batch = h.engine.find_batch(batch.id).await.unwrap();
    assert_eq!(batch.total, 9);
    assert_eq!(batch.processed_total, 9);
    assert_eq!(batch.success_total, 7);
    assert_eq!(batch.fail_total, 2);
    assert_eq!(batch.status, BatchStatus::Failed);
    assert!(batch.error_message.as_deref().unwrap().contains("2 of 9"));
    assert_counter_invariant(&batch, 0);

    let parts = h.engine.parts(batch.id).await.unwrap();
    let completed = parts
        .iter()
        .filter(|p| p.status == BatchPartStatus::Completed)
        .count();
    assert_eq!(completed, 7);
    assert!(parts
        .iter()
        .filter(|p| p.status == BatchPartStatus::Completed)
        .all(|p| p.result.is_some()));
}

#[tokio::test]
async fn all_success_completes_the_batch() {
    let h = harness();
    let batch = h
        .engine
        .create_batch(BatchSpec::builder().batch_type("t").items(items(3, 0)).build())
        .await
        .unwrap();

    h.engine.run_once().await.unwrap();

    let batch = h.engine.find_batch(batch.id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.success_total, 3);
    assert_eq!(batch.fail_total, 0);
    assert!(batch.ended_at.is_some());
    assert_counter_invariant(&batch, 0);
}

#[tokio::test]
async fn part_retry_bound_is_exact() {
    let h = harness();
    let batch = h
        .engine
        .create_batch(
            BatchSpec::builder()
                .batch_type("t")
                .items(items(0, 1))
                .max_retries(3i32)
                .build(),
        )
        .await
        .unwrap();

    // First failing round: back to pending, gated by exponential backoff
    // (retry_wait_ms defaults to 5 s, so attempt 1 waits 10 s).
    h.engine.run_once().await.unwrap();
    let part = &h.engine.parts(batch.id).await.unwrap()[0];
    assert_eq!(part.status, BatchPartStatus::Pending);
    assert_eq!(part.retry_count, 1);
    assert_eq!(
        part.next_retry_at.unwrap(),
        h.clock.now() + Duration::seconds(10)
    );

    // While the backoff is running, rounds must not touch the part.
    h.engine.run_once().await.unwrap();
    let part = &h.engine.parts(batch.id).await.unwrap()[0];
    assert_eq!(part.retry_count, 1);

    // Second failing attempt: backoff doubles to 20 s.
    h.clock.advance(Duration::seconds(10));
    h.engine.run_once().await.unwrap();
    let part = &h.engine.parts(batch.id).await.unwrap()[0];
    assert_eq!(part.status, BatchPartStatus::Pending);
    assert_eq!(part.retry_count, 2);
    assert_eq!(
        part.next_retry_at.unwrap(),
        h.clock.now() + Duration::seconds(20)
    );

    // The third failure lands exactly on the bound and is terminal.
    h.clock.advance(Duration::seconds(20));
    h.engine.run_once().await.unwrap();
    let part = &h.engine.parts(batch.id).await.unwrap()[0];
    assert_eq!(part.status, BatchPartStatus::Failed);
    assert_eq!(part.retry_count, 3);

    let batch = h.engine.find_batch(batch.id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Failed);
}

#[tokio::test]
async fn cancel_running_batch_then_retry_is_noop() {
    let h = harness();
    // 5 parts: 2 will complete, 1 held running, 2 left pending.
    let batch = h
        .engine
        .create_batch(BatchSpec::builder().batch_type("t").items(items(5, 0)).build())
        .await
        .unwrap();

    use flowmill::batch::BatchStore;
    let parts = h.store.parts_for_batch(batch.id).await.unwrap();
    let now = h.clock.now();
    // Simulate in-flight work: complete two parts, hold one running.
    assert!(h.store.try_claim_part(parts[0].id, now).await.unwrap());
    h.store
        .complete_part(parts[0].id, None, now)
        .await
        .unwrap();
    assert!(h.store.try_claim_part(parts[1].id, now).await.unwrap());
    h.store
        .complete_part(parts[1].id, None, now)
        .await
        .unwrap();
    let running_id = parts[2].id;
    assert!(h.store.try_claim_part(running_id, now).await.unwrap());

    let cancelled = h.engine.cancel_batch(batch.id).await.unwrap();
    assert_eq!(cancelled.status, BatchStatus::Cancelled);

    let parts = h.engine.parts(batch.id).await.unwrap();
    let skipped = parts
        .iter()
        .filter(|p| p.status == BatchPartStatus::Skipped)
        .count();
    assert_eq!(skipped, 2);
    // The running part was not preempted.
    let running = h.store.find_part(running_id).await.unwrap().unwrap();
    assert_eq!(running.status, BatchPartStatus::Running);

    // It finishes naturally without altering the terminal state.
    h.store
        .complete_part(running_id, None, h.clock.now())
        .await
        .unwrap();
    h.store.recompute_counters(batch.id).await.unwrap();

    let batch = h.engine.find_batch(batch.id).await.unwrap();
    assert_eq!(batch.status, BatchStatus::Cancelled);
    assert_eq!(batch.processed_total, 5);
    assert_eq!(batch.success_total, 3);
    assert_counter_invariant(&batch, 2);

    // No failed parts, so retrying them is a no-op.
    assert_eq!(h.engine.retry_failed_parts(batch.id).await.unwrap(), 0);

    // Cancelling again stays a no-op.
    let again = h.engine.cancel_batch(batch.id).await.unwrap();
    assert_eq!(again.status, BatchStatus::Cancelled);
}

#[tokio::test]
async fn retry_failed_parts_resets_parts_and_batch() {
    let h = harness();
    let batch = h
        .engine
        .create_batch(
            BatchSpec::builder()
                .batch_type("t")
                .items(items(2, 1))
                .max_retries(1i32)
                .build(),
        )
        .await
        .unwrap();

    h.engine.run_once().await.unwrap();
    assert_eq!(
        h.engine.find_batch(batch.id).await.unwrap().status,
        BatchStatus::Failed
    );

    use flowmill::batch::BatchStore;
    let failed_part = h
        .engine
        .parts(batch.id)
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.status == BatchPartStatus::Failed)
        .unwrap();
    let reset = h.engine.retry_failed_parts(batch.id).await.unwrap();
    assert_eq!(reset, 1);

    let part = h.store.find_part(failed_part.id).await.unwrap().unwrap();
    assert_eq!(part.status, BatchPartStatus::Pending);
    assert_eq!(part.retry_count, 0);
    assert!(part.error_message.is_none());
    assert!(part.next_retry_at.is_none());

    let batch_row = h.engine.find_batch(batch.id).await.unwrap();
    assert_eq!(batch_row.status, BatchStatus::Pending);
}

#[tokio::test]
async fn processed_never_exceeds_total_mid_flight() {
    let h = harness();
    let batch = h
        .engine
        .create_batch(BatchSpec::builder().batch_type("t").items(items(4, 2)).build())
        .await
        .unwrap();

    for _ in 0..4 {
        h.engine.run_once().await.unwrap();
        let row = h.engine.find_batch(batch.id).await.unwrap();
        assert!(row.total >= row.processed_total);
        assert!(row.processed_total >= row.success_total + row.fail_total);
        // Step past any retry backoff so the next round makes progress.
        h.clock.advance(Duration::hours(1));
    }

    let row = h.engine.find_batch(batch.id).await.unwrap();
    assert_eq!(row.status, BatchStatus::Failed);
    assert_eq!(row.processed_total, 6);
}
