//! Subscription engine scenarios: at-most-once firing under concurrent
//! triggers, tenant scoping, retention.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Duration;
use flowmill::subscription::{
    EventType, MemorySubscriptionStore, SubscriptionEngine, SubscriptionSpec,
};
use flowmill::{EventBus, ExecutorRegistry, ManualClock, SubscriptionEngineConfig};
use serde_json::Value;

struct Harness {
    engine: Arc<SubscriptionEngine>,
    clock: Arc<ManualClock>,
    delivered: Arc<AtomicUsize>,
}

fn harness() -> Harness {
    let clock = Arc::new(ManualClock::starting_now());
    let delivered = Arc::new(AtomicUsize::new(0));

    let mut registry = ExecutorRegistry::new();
    let count = delivered.clone();
    registry.register_event_handler("default", move |_sub, _payload| {
        let count = count.clone();
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    });

    let engine = Arc::new(SubscriptionEngine::new(
        Arc::new(MemorySubscriptionStore::new()),
        Arc::new(registry),
        EventBus::new(),
        clock.clone(),
        SubscriptionEngineConfig::default(),
    ));

    Harness {
        engine,
        clock,
        delivered,
    }
}

#[tokio::test]
async fn concurrent_triggers_fire_exactly_once() {
    let h = harness();
    h.engine
        .create_subscription(SubscriptionSpec::message("m", "pi-1"))
        .await
        .unwrap();

    // Two workers race the same trigger.
    let a = {
        let engine = h.engine.clone();
        tokio::spawn(async move { engine.trigger_message("m", Value::Null, Some("pi-1")).await })
    };
    let b = {
        let engine = h.engine.clone();
        tokio::spawn(async move { engine.trigger_message("m", Value::Null, Some("pi-1")).await })
    };

    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();

    // Exactly one of them wins the conditional update.
    assert_eq!(a.count + b.count, 1);
    assert_eq!(h.delivered.load(Ordering::SeqCst), 1);

    let winner = if a.count == 1 { &a } else { &b };
    let subscription = h
        .engine
        .find_subscription(winner.subscriptions[0].id)
        .await
        .unwrap();
    assert!(subscription.is_processed);
    assert!(subscription.processed_at.is_some());
}

#[tokio::test]
async fn trigger_selection_orders_by_priority_then_age() {
    let h = harness();
    let low = h
        .engine
        .create_subscription(
            SubscriptionSpec::builder()
                .event_type(EventType::Signal)
                .event_name("s")
                .priority(10i32)
                .build(),
        )
        .await
        .unwrap();
    h.clock.advance(Duration::milliseconds(10));
    let high = h
        .engine
        .create_subscription(
            SubscriptionSpec::builder()
                .event_type(EventType::Signal)
                .event_name("s")
                .priority(90i32)
                .build(),
        )
        .await
        .unwrap();

    let outcome = h.engine.trigger_signal("s", Value::Null, None).await.unwrap();
    assert_eq!(outcome.count, 2);
    assert_eq!(outcome.subscriptions[0].id, high.id);
    assert_eq!(outcome.subscriptions[1].id, low.id);
}

#[tokio::test]
async fn handler_failure_does_not_unprocess() {
    let clock = Arc::new(ManualClock::starting_now());
    let mut registry = ExecutorRegistry::new();
    registry.register_event_handler("default", |_sub, _payload| async move {
        Err(anyhow::anyhow!("downstream exploded"))
    });
    let engine = SubscriptionEngine::new(
        Arc::new(MemorySubscriptionStore::new()),
        Arc::new(registry),
        EventBus::new(),
        clock,
        SubscriptionEngineConfig::default(),
    );

    let subscription = engine
        .create_subscription(SubscriptionSpec::signal("s"))
        .await
        .unwrap();

    let outcome = engine.trigger_signal("s", Value::Null, None).await.unwrap();
    assert_eq!(outcome.count, 1);

    // The failure stayed downstream; the subscription is consumed.
    let stored = engine.find_subscription(subscription.id).await.unwrap();
    assert!(stored.is_processed);
    assert_eq!(
        engine
            .trigger_signal("s", Value::Null, None)
            .await
            .unwrap()
            .count,
        0
    );
}

#[tokio::test]
async fn delete_by_process_instance_removes_registrations() {
    let h = harness();
    h.engine
        .create_subscription(SubscriptionSpec::message("m", "pi-1"))
        .await
        .unwrap();
    h.engine
        .create_subscription(SubscriptionSpec::message("m", "pi-2"))
        .await
        .unwrap();

    assert_eq!(
        h.engine
            .delete_subscriptions_by_process_instance("pi-1")
            .await
            .unwrap(),
        1
    );

    let outcome = h
        .engine
        .trigger_message("m", Value::Null, Some("pi-1"))
        .await
        .unwrap();
    assert_eq!(outcome.count, 0);
    let outcome = h
        .engine
        .trigger_message("m", Value::Null, Some("pi-2"))
        .await
        .unwrap();
    assert_eq!(outcome.count, 1);
}

#[tokio::test]
async fn retention_drops_only_old_processed_rows() {
    let h = harness();
    h.engine
        .create_subscription(SubscriptionSpec::signal("consumed"))
        .await
        .unwrap();
    h.engine
        .create_subscription(SubscriptionSpec::signal("waiting"))
        .await
        .unwrap();

    h.engine
        .trigger_signal("consumed", Value::Null, None)
        .await
        .unwrap();

    // Inside the 7-day window nothing is deleted.
    assert_eq!(h.engine.cleanup_processed_subscriptions().await.unwrap(), 0);

    h.clock.advance(Duration::days(8));
    assert_eq!(h.engine.cleanup_processed_subscriptions().await.unwrap(), 1);

    // The unprocessed registration survives the sweep.
    let outcome = h
        .engine
        .trigger_signal("waiting", Value::Null, None)
        .await
        .unwrap();
    assert_eq!(outcome.count, 1);
}
