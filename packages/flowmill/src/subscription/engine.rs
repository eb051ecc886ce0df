//! Event subscription engine: registration, trigger, and retention.
//!
//! Triggering selects matching unprocessed subscriptions and races each
//! through the conditional mark-processed update; only won rows are
//! dispatched and reported. Downstream handler failures are logged and do
//! not un-process the subscription — at-least-once overall delivery is
//! the caller's concern (retry the trigger).

use std::sync::Arc;

use chrono::Duration;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::model::{EventSubscription, EventType, SubscriptionSpec};
use super::store::SubscriptionStore;
use crate::clock::SharedClock;
use crate::config::SubscriptionEngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, SubscriptionEvent};
use crate::executor::SharedExecutorRegistry;

/// Result of a message or signal trigger.
#[derive(Debug, Clone)]
pub struct TriggerOutcome {
    /// How many subscriptions this call consumed.
    pub count: usize,
    /// The consumed subscriptions, in selection order.
    pub subscriptions: Vec<EventSubscription>,
}

/// Engine driving subscription registration and event correlation.
pub struct SubscriptionEngine {
    store: Arc<dyn SubscriptionStore>,
    executors: SharedExecutorRegistry,
    bus: EventBus,
    clock: SharedClock,
    config: SubscriptionEngineConfig,
}

impl SubscriptionEngine {
    /// Wire an engine from its collaborators.
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        executors: SharedExecutorRegistry,
        bus: EventBus,
        clock: SharedClock,
        config: SubscriptionEngineConfig,
    ) -> Self {
        Self {
            store,
            executors,
            bus,
            clock,
            config,
        }
    }

    /// The underlying store (for the statistics aggregator).
    pub fn store(&self) -> Arc<dyn SubscriptionStore> {
        Arc::clone(&self.store)
    }

    /// Register a subscription. Emits `subscription.created`.
    pub async fn create_subscription(
        &self,
        spec: SubscriptionSpec,
    ) -> EngineResult<EventSubscription> {
        let subscription = EventSubscription {
            id: Uuid::new_v4(),
            event_type: spec.event_type,
            event_name: spec.event_name,
            process_instance_id: spec.process_instance_id,
            execution_id: spec.execution_id,
            activity_id: spec.activity_id,
            configuration_type: spec.configuration_type,
            configuration: spec.configuration,
            priority: spec.priority,
            is_processed: false,
            processed_at: None,
            callback_id: spec.callback_id,
            tenant_id: spec.tenant_id,
            created_at: self.clock.now(),
        };

        let subscription = self.store.insert(subscription).await?;
        debug!(
            subscription_id = %subscription.id,
            event_name = %subscription.event_name,
            "subscription created"
        );
        self.bus.emit(SubscriptionEvent::Created {
            subscription_id: subscription.id,
            event_name: subscription.event_name.clone(),
        });
        Ok(subscription)
    }

    /// Find a subscription by id.
    pub async fn find_subscription(&self, id: Uuid) -> EngineResult<EventSubscription> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::not_found("subscription", id))
    }

    /// Deliver a message: targeted at one process instance when given,
    /// otherwise every unprocessed subscription of that name.
    pub async fn trigger_message(
        &self,
        event_name: &str,
        payload: Value,
        process_instance_id: Option<&str>,
    ) -> EngineResult<TriggerOutcome> {
        self.trigger(EventType::Message, event_name, payload, process_instance_id, None)
            .await
    }

    /// Broadcast a signal. With a tenant given, tenant-less subscriptions
    /// still match (they listen across tenants).
    pub async fn trigger_signal(
        &self,
        event_name: &str,
        payload: Value,
        tenant_id: Option<&str>,
    ) -> EngineResult<TriggerOutcome> {
        self.trigger(EventType::Signal, event_name, payload, None, tenant_id)
            .await
    }

    /// Bulk delete for a terminated process instance.
    pub async fn delete_subscriptions_by_process_instance(
        &self,
        process_instance_id: &str,
    ) -> EngineResult<u64> {
        Ok(self
            .store
            .delete_by_process_instance(process_instance_id)
            .await?)
    }

    /// Bulk delete for a finished execution.
    pub async fn delete_subscriptions_by_execution(&self, execution_id: &str) -> EngineResult<u64> {
        Ok(self.store.delete_by_execution(execution_id).await?)
    }

    /// Retention pass: drop processed subscriptions older than the window.
    pub async fn cleanup_processed_subscriptions(&self) -> EngineResult<u64> {
        let cutoff = self.clock.now() - Duration::days(self.config.retention_days);
        Ok(self.store.delete_processed_before(cutoff).await?)
    }

    async fn trigger(
        &self,
        event_type: EventType,
        event_name: &str,
        payload: Value,
        process_instance_id: Option<&str>,
        tenant_id: Option<&str>,
    ) -> EngineResult<TriggerOutcome> {
        let candidates = self
            .store
            .find_unprocessed(event_type, event_name, process_instance_id, tenant_id)
            .await?;

        let mut consumed = Vec::new();
        for mut subscription in candidates {
            let now = self.clock.now();
            // The conditional update is the at-most-once guard; losing the
            // race means another trigger owns this subscription.
            if !self.store.mark_processed(subscription.id, now).await? {
                continue;
            }
            subscription.is_processed = true;
            subscription.processed_at = Some(now);

            self.bus.emit(SubscriptionEvent::Triggered {
                subscription_id: subscription.id,
                event_name: subscription.event_name.clone(),
            });
            self.dispatch(&subscription, payload.clone()).await;
            consumed.push(subscription);
        }

        Ok(TriggerOutcome {
            count: consumed.len(),
            subscriptions: consumed,
        })
    }

    /// Fire-and-forget dispatch to the registered event handler. A missing
    /// handler or a handler error is logged; the subscription stays
    /// processed either way.
    async fn dispatch(&self, subscription: &EventSubscription, payload: Value) {
        match self.executors.event_handler(&subscription.configuration_type) {
            Some(handler) => {
                if let Err(error) = handler(subscription.clone(), payload).await {
                    warn!(
                        subscription_id = %subscription.id,
                        error = %error,
                        "event handler failed, subscription stays processed"
                    );
                }
            }
            None => {
                warn!(
                    subscription_id = %subscription.id,
                    configuration_type = %subscription.configuration_type,
                    "no event handler registered"
                );
            }
        }
    }
}
