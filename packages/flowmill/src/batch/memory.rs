//! In-memory batch store for deterministic tests and embedded use.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use super::model::{Batch, BatchCounters, BatchFilter, BatchPart, BatchPartStatus, BatchStatus};
use super::store::BatchStore;
use crate::stats::{percentile, DurationStats, StatusCount};

/// In-memory `BatchStore` implementation.
#[derive(Default)]
pub struct MemoryBatchStore {
    batches: RwLock<HashMap<Uuid, Batch>>,
    parts: RwLock<HashMap<Uuid, BatchPart>>,
}

impl MemoryBatchStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn derive_counters(parts: &HashMap<Uuid, BatchPart>, batch_id: Uuid) -> BatchCounters {
        let mut counters = BatchCounters::default();
        for part in parts.values().filter(|p| p.batch_id == batch_id) {
            counters.total += 1;
            match part.status {
                BatchPartStatus::Completed => {
                    counters.success_total += 1;
                    counters.processed_total += 1;
                }
                BatchPartStatus::Failed => {
                    counters.fail_total += 1;
                    counters.processed_total += 1;
                }
                BatchPartStatus::Skipped => {
                    counters.skipped_total += 1;
                    counters.processed_total += 1;
                }
                BatchPartStatus::Running => counters.running += 1,
                BatchPartStatus::Pending => counters.pending += 1,
            }
        }
        counters
    }
}

#[async_trait]
impl BatchStore for MemoryBatchStore {
    async fn insert_batch(&self, batch: Batch) -> Result<Batch> {
        let mut batches = self.batches.write().unwrap_or_else(|e| e.into_inner());
        batches.insert(batch.id, batch.clone());
        Ok(batch)
    }

    async fn insert_parts(&self, new_parts: Vec<BatchPart>) -> Result<u64> {
        let mut parts = self.parts.write().unwrap_or_else(|e| e.into_inner());
        let count = new_parts.len() as u64;
        for part in new_parts {
            parts.insert(part.id, part);
        }
        Ok(count)
    }

    async fn find_batch(&self, id: Uuid) -> Result<Option<Batch>> {
        let batches = self.batches.read().unwrap_or_else(|e| e.into_inner());
        Ok(batches.get(&id).cloned())
    }

    async fn find_part(&self, id: Uuid) -> Result<Option<BatchPart>> {
        let parts = self.parts.read().unwrap_or_else(|e| e.into_inner());
        Ok(parts.get(&id).cloned())
    }

    async fn list(&self, filter: BatchFilter) -> Result<Vec<Batch>> {
        let batches = self.batches.read().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<Batch> = batches
            .values()
            .filter(|b| filter.status.map_or(true, |s| b.status == s))
            .filter(|b| {
                filter
                    .batch_type
                    .as_deref()
                    .map_or(true, |t| b.batch_type == t)
            })
            .filter(|b| {
                filter
                    .tenant_id
                    .as_deref()
                    .map_or(true, |t| b.tenant_id.as_deref() == Some(t))
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect())
    }

    async fn parts_for_batch(&self, batch_id: Uuid) -> Result<Vec<BatchPart>> {
        let parts = self.parts.read().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<BatchPart> = parts
            .values()
            .filter(|p| p.batch_id == batch_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(rows)
    }

    async fn ready_batches(&self, limit: i64) -> Result<Vec<Batch>> {
        let batches = self.batches.read().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<Batch> = batches
            .values()
            .filter(|b| matches!(b.status, BatchStatus::Pending | BatchStatus::Running))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn mark_batch_running(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut batches = self.batches.write().unwrap_or_else(|e| e.into_inner());
        match batches.get_mut(&id) {
            Some(batch) if batch.status == BatchStatus::Pending => {
                batch.status = BatchStatus::Running;
                batch.started_at.get_or_insert(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn pending_parts(
        &self,
        batch_id: Uuid,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<BatchPart>> {
        let parts = self.parts.read().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<BatchPart> = parts
            .values()
            .filter(|p| p.batch_id == batch_id && p.is_claimable(now))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn try_claim_part(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut parts = self.parts.write().unwrap_or_else(|e| e.into_inner());
        match parts.get_mut(&id) {
            Some(part) if part.status == BatchPartStatus::Pending => {
                part.status = BatchPartStatus::Running;
                part.started_at.get_or_insert(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_part(
        &self,
        id: Uuid,
        result: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut parts = self.parts.write().unwrap_or_else(|e| e.into_inner());
        match parts.get_mut(&id) {
            Some(part) if part.status == BatchPartStatus::Running => {
                part.status = BatchPartStatus::Completed;
                part.result = result;
                part.ended_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_part_retry(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut parts = self.parts.write().unwrap_or_else(|e| e.into_inner());
        match parts.get_mut(&id) {
            Some(part) if part.status == BatchPartStatus::Running => {
                part.status = BatchPartStatus::Pending;
                part.retry_count += 1;
                part.error_message = Some(error.to_string());
                part.next_retry_at = Some(next_retry_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_part_terminal(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut parts = self.parts.write().unwrap_or_else(|e| e.into_inner());
        match parts.get_mut(&id) {
            Some(part) if part.status == BatchPartStatus::Running => {
                part.status = BatchPartStatus::Failed;
                part.retry_count += 1;
                part.error_message = Some(error.to_string());
                part.ended_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn recompute_counters(&self, batch_id: Uuid) -> Result<BatchCounters> {
        let parts = self.parts.read().unwrap_or_else(|e| e.into_inner());
        let counters = Self::derive_counters(&parts, batch_id);
        drop(parts);

        let mut batches = self.batches.write().unwrap_or_else(|e| e.into_inner());
        if let Some(batch) = batches.get_mut(&batch_id) {
            batch.total = counters.total;
            batch.processed_total = counters.processed_total;
            batch.success_total = counters.success_total;
            batch.fail_total = counters.fail_total;
        }
        Ok(counters)
    }

    async fn finalize_batch(
        &self,
        id: Uuid,
        status: BatchStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut batches = self.batches.write().unwrap_or_else(|e| e.into_inner());
        match batches.get_mut(&id) {
            Some(batch)
                if matches!(batch.status, BatchStatus::Pending | BatchStatus::Running) =>
            {
                batch.status = status;
                batch.error_message = error_message.map(str::to_string);
                batch.ended_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_batch(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<u64>> {
        let mut batches = self.batches.write().unwrap_or_else(|e| e.into_inner());
        let Some(batch) = batches.get_mut(&id) else {
            return Ok(None);
        };
        if !matches!(batch.status, BatchStatus::Pending | BatchStatus::Running) {
            return Ok(None);
        }
        batch.status = BatchStatus::Cancelled;
        batch.ended_at = Some(now);
        drop(batches);

        let mut parts = self.parts.write().unwrap_or_else(|e| e.into_inner());
        let mut skipped = 0;
        for part in parts.values_mut() {
            if part.batch_id == id && part.status == BatchPartStatus::Pending {
                part.status = BatchPartStatus::Skipped;
                part.ended_at = Some(now);
                skipped += 1;
            }
        }
        Ok(Some(skipped))
    }

    async fn reset_failed_parts(&self, batch_id: Uuid) -> Result<u64> {
        let mut parts = self.parts.write().unwrap_or_else(|e| e.into_inner());
        let mut reset = 0;
        for part in parts.values_mut() {
            if part.batch_id == batch_id && part.status == BatchPartStatus::Failed {
                part.status = BatchPartStatus::Pending;
                part.retry_count = 0;
                part.error_message = None;
                part.next_retry_at = None;
                part.started_at = None;
                part.ended_at = None;
                reset += 1;
            }
        }
        Ok(reset)
    }

    async fn reset_batch_pending(&self, id: Uuid) -> Result<bool> {
        let mut batches = self.batches.write().unwrap_or_else(|e| e.into_inner());
        match batches.get_mut(&id) {
            Some(batch) if batch.status == BatchStatus::Failed => {
                batch.status = BatchStatus::Pending;
                batch.ended_at = None;
                batch.error_message = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut batches = self.batches.write().unwrap_or_else(|e| e.into_inner());
        let doomed: Vec<Uuid> = batches
            .values()
            .filter(|b| {
                matches!(
                    b.status,
                    BatchStatus::Completed | BatchStatus::Failed | BatchStatus::Cancelled
                ) && b.ended_at.map_or(false, |ended| ended < cutoff)
            })
            .map(|b| b.id)
            .collect();
        for id in &doomed {
            batches.remove(id);
        }
        drop(batches);

        // FK cascade equivalent.
        let mut parts = self.parts.write().unwrap_or_else(|e| e.into_inner());
        parts.retain(|_, part| !doomed.contains(&part.batch_id));

        Ok(doomed.len() as u64)
    }

    async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        let batches = self.batches.read().unwrap_or_else(|e| e.into_inner());
        let mut counts: HashMap<(String, &'static str, Option<String>), i64> = HashMap::new();
        for batch in batches.values() {
            let status = match batch.status {
                BatchStatus::Pending => "pending",
                BatchStatus::Running => "running",
                BatchStatus::Completed => "completed",
                BatchStatus::Failed => "failed",
                BatchStatus::Cancelled => "cancelled",
            };
            *counts
                .entry((batch.batch_type.clone(), status, batch.tenant_id.clone()))
                .or_default() += 1;
        }
        let mut rows: Vec<StatusCount> = counts
            .into_iter()
            .map(|((work_type, status, tenant_id), count)| StatusCount {
                work_type,
                status: status.to_string(),
                tenant_id,
                count,
            })
            .collect();
        rows.sort_by(|a, b| a.work_type.cmp(&b.work_type).then(a.status.cmp(&b.status)));
        Ok(rows)
    }

    async fn duration_percentiles(&self) -> Result<Vec<DurationStats>> {
        let batches = self.batches.read().unwrap_or_else(|e| e.into_inner());
        let mut durations: HashMap<String, Vec<f64>> = HashMap::new();
        for batch in batches.values() {
            if !matches!(batch.status, BatchStatus::Completed | BatchStatus::Failed) {
                continue;
            }
            if let (Some(started), Some(ended)) = (batch.started_at, batch.ended_at) {
                durations
                    .entry(batch.batch_type.clone())
                    .or_default()
                    .push((ended - started).num_milliseconds() as f64);
            }
        }
        let mut rows: Vec<DurationStats> = durations
            .into_iter()
            .map(|(work_type, mut samples)| {
                samples.sort_by(|a, b| a.total_cmp(b));
                DurationStats {
                    work_type,
                    count: samples.len() as i64,
                    p50_ms: percentile(&samples, 0.5),
                    p95_ms: percentile(&samples, 0.95),
                }
            })
            .collect();
        rows.sort_by(|a, b| a.work_type.cmp(&b.work_type));
        Ok(rows)
    }
}
