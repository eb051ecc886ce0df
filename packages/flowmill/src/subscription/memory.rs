//! In-memory subscription store for deterministic tests and embedded use.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::model::{EventSubscription, EventType};
use super::store::SubscriptionStore;
use crate::stats::StatusCount;

/// In-memory `SubscriptionStore` implementation.
#[derive(Default)]
pub struct MemorySubscriptionStore {
    subscriptions: RwLock<HashMap<Uuid, EventSubscription>>,
}

impl MemorySubscriptionStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn insert(&self, subscription: EventSubscription) -> Result<EventSubscription> {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        subscriptions.insert(subscription.id, subscription.clone());
        Ok(subscription)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<EventSubscription>> {
        let subscriptions = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
        Ok(subscriptions.get(&id).cloned())
    }

    async fn find_unprocessed(
        &self,
        event_type: EventType,
        event_name: &str,
        process_instance_id: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Result<Vec<EventSubscription>> {
        let subscriptions = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<EventSubscription> = subscriptions
            .values()
            .filter(|s| s.event_type == event_type && s.event_name == event_name)
            .filter(|s| !s.is_processed)
            .filter(|s| {
                process_instance_id.map_or(true, |p| s.process_instance_id.as_deref() == Some(p))
            })
            .filter(|s| {
                tenant_id.map_or(true, |t| {
                    s.tenant_id.is_none() || s.tenant_id.as_deref() == Some(t)
                })
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(rows)
    }

    async fn mark_processed(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        match subscriptions.get_mut(&id) {
            Some(subscription) if !subscription.is_processed => {
                subscription.is_processed = true;
                subscription.processed_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_by_process_instance(&self, process_instance_id: &str) -> Result<u64> {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let before = subscriptions.len();
        subscriptions.retain(|_, s| s.process_instance_id.as_deref() != Some(process_instance_id));
        Ok((before - subscriptions.len()) as u64)
    }

    async fn delete_by_execution(&self, execution_id: &str) -> Result<u64> {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let before = subscriptions.len();
        subscriptions.retain(|_, s| s.execution_id.as_deref() != Some(execution_id));
        Ok((before - subscriptions.len()) as u64)
    }

    async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let before = subscriptions.len();
        subscriptions.retain(|_, s| {
            !(s.is_processed && s.processed_at.map_or(false, |at| at < cutoff))
        });
        Ok((before - subscriptions.len()) as u64)
    }

    async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        let subscriptions = self.subscriptions.read().unwrap_or_else(|e| e.into_inner());
        let mut counts: HashMap<(&'static str, &'static str, Option<String>), i64> = HashMap::new();
        for subscription in subscriptions.values() {
            let work_type = match subscription.event_type {
                EventType::Message => "message",
                EventType::Signal => "signal",
                EventType::Conditional => "conditional",
                EventType::Compensation => "compensation",
                EventType::Error => "error",
                EventType::Timer => "timer",
                EventType::Escalation => "escalation",
            };
            let status = if subscription.is_processed {
                "processed"
            } else {
                "unprocessed"
            };
            *counts
                .entry((work_type, status, subscription.tenant_id.clone()))
                .or_default() += 1;
        }
        let mut rows: Vec<StatusCount> = counts
            .into_iter()
            .map(|((work_type, status, tenant_id), count)| StatusCount {
                work_type: work_type.to_string(),
                status: status.to_string(),
                tenant_id,
                count,
            })
            .collect();
        rows.sort_by(|a, b| a.work_type.cmp(&b.work_type).then(a.status.cmp(&b.status)));
        Ok(rows)
    }
}
