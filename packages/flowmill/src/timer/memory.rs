//! In-memory timer store for deterministic tests and embedded use.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::model::{Timer, TimerFilter, TimerStatus, TimerType};
use super::store::TimerStore;
use crate::stats::StatusCount;

/// In-memory `TimerStore` implementation.
#[derive(Default)]
pub struct MemoryTimerStore {
    timers: RwLock<HashMap<Uuid, Timer>>,
}

impl MemoryTimerStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TimerStore for MemoryTimerStore {
    async fn insert(&self, timer: Timer) -> Result<Timer> {
        let mut timers = self.timers.write().unwrap_or_else(|e| e.into_inner());
        timers.insert(timer.id, timer.clone());
        Ok(timer)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Timer>> {
        let timers = self.timers.read().unwrap_or_else(|e| e.into_inner());
        Ok(timers.get(&id).cloned())
    }

    async fn list(&self, filter: TimerFilter) -> Result<Vec<Timer>> {
        let timers = self.timers.read().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<Timer> = timers
            .values()
            .filter(|t| filter.status.map_or(true, |s| t.status == s))
            .filter(|t| {
                filter
                    .process_instance_id
                    .as_deref()
                    .map_or(true, |p| t.process_instance_id.as_deref() == Some(p))
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.due_date.cmp(&b.due_date));
        Ok(rows
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect())
    }

    async fn due_timers(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<Timer>> {
        let timers = self.timers.read().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<Timer> = timers.values().filter(|t| t.is_due(now)).cloned().collect();
        rows.sort_by(|a, b| a.due_date.cmp(&b.due_date));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn try_claim(
        &self,
        id: Uuid,
        worker_id: &str,
        lock_ttl_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut timers = self.timers.write().unwrap_or_else(|e| e.into_inner());
        let Some(timer) = timers.get_mut(&id) else {
            return Ok(false);
        };
        let lock_free = timer.lock_owner.is_none()
            || timer.lock_expires_at.map_or(true, |expires| expires < now);
        if timer.status != TimerStatus::Pending || !lock_free {
            return Ok(false);
        }
        timer.lock_owner = Some(worker_id.to_string());
        timer.lock_expires_at = Some(now + Duration::milliseconds(lock_ttl_ms));
        Ok(true)
    }

    async fn finish_fire_advance(
        &self,
        id: Uuid,
        next_due: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut timers = self.timers.write().unwrap_or_else(|e| e.into_inner());
        match timers.get_mut(&id) {
            Some(timer) if timer.status == TimerStatus::Pending => {
                timer.execution_count += 1;
                timer.due_date = next_due;
                timer.next_execution_at = Some(next_due);
                timer.executed_at = Some(now);
                timer.retry_count = 0;
                timer.lock_owner = None;
                timer.lock_expires_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_fire_complete(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut timers = self.timers.write().unwrap_or_else(|e| e.into_inner());
        match timers.get_mut(&id) {
            Some(timer) if timer.status == TimerStatus::Pending => {
                timer.execution_count += 1;
                timer.status = TimerStatus::Executed;
                timer.executed_at = Some(now);
                timer.next_execution_at = None;
                timer.lock_owner = None;
                timer.lock_expires_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn schedule_retry(&self, id: Uuid, retry_at: DateTime<Utc>) -> Result<bool> {
        let mut timers = self.timers.write().unwrap_or_else(|e| e.into_inner());
        match timers.get_mut(&id) {
            Some(timer) if timer.status == TimerStatus::Pending => {
                timer.retry_count += 1;
                timer.due_date = retry_at;
                timer.lock_owner = None;
                timer.lock_expires_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_failed(&self, id: Uuid, _now: DateTime<Utc>) -> Result<bool> {
        let mut timers = self.timers.write().unwrap_or_else(|e| e.into_inner());
        match timers.get_mut(&id) {
            Some(timer) if timer.status == TimerStatus::Pending => {
                timer.status = TimerStatus::Failed;
                timer.retry_count += 1;
                timer.lock_owner = None;
                timer.lock_expires_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel(&self, id: Uuid) -> Result<bool> {
        let mut timers = self.timers.write().unwrap_or_else(|e| e.into_inner());
        match timers.get_mut(&id) {
            Some(timer) if timer.status == TimerStatus::Pending => {
                timer.status = TimerStatus::Cancelled;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_by_process_instance(&self, process_instance_id: &str) -> Result<u64> {
        let mut timers = self.timers.write().unwrap_or_else(|e| e.into_inner());
        let mut cancelled = 0;
        for timer in timers.values_mut() {
            if timer.status == TimerStatus::Pending
                && timer.process_instance_id.as_deref() == Some(process_instance_id)
            {
                timer.status = TimerStatus::Cancelled;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn cancel_by_execution(&self, execution_id: &str) -> Result<u64> {
        let mut timers = self.timers.write().unwrap_or_else(|e| e.into_inner());
        let mut cancelled = 0;
        for timer in timers.values_mut() {
            if timer.status == TimerStatus::Pending
                && timer.execution_id.as_deref() == Some(execution_id)
            {
                timer.status = TimerStatus::Cancelled;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn release_expired_locks(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut timers = self.timers.write().unwrap_or_else(|e| e.into_inner());
        let mut released = 0;
        for timer in timers.values_mut() {
            if timer.status == TimerStatus::Pending
                && timer.lock_expires_at.map_or(false, |expires| expires < now)
            {
                timer.lock_owner = None;
                timer.lock_expires_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut timers = self.timers.write().unwrap_or_else(|e| e.into_inner());
        let before = timers.len();
        timers.retain(|_, timer| {
            let terminal = matches!(
                timer.status,
                TimerStatus::Executed | TimerStatus::Cancelled | TimerStatus::Failed
            );
            !(terminal && timer.executed_at.unwrap_or(timer.created_at) < cutoff)
        });
        Ok((before - timers.len()) as u64)
    }

    async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        let timers = self.timers.read().unwrap_or_else(|e| e.into_inner());
        let mut counts: HashMap<(&'static str, &'static str, Option<String>), i64> = HashMap::new();
        for timer in timers.values() {
            let work_type = match timer.timer_type {
                TimerType::Date => "date",
                TimerType::Duration => "duration",
                TimerType::Cycle => "cycle",
            };
            let status = match timer.status {
                TimerStatus::Pending => "pending",
                TimerStatus::Executed => "executed",
                TimerStatus::Failed => "failed",
                TimerStatus::Cancelled => "cancelled",
            };
            *counts
                .entry((work_type, status, timer.tenant_id.clone()))
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
