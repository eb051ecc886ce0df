//! Batch engine: parent/child aggregation with bounded concurrent
//! execution and derived progress counters.
//!
//! ```text
//! run_once (one scheduler round)
//!     │
//!     ├─► select ready batches (priority DESC, created_at ASC)
//!     ├─► skip batches already in the processing set
//!     └─► per batch:
//!           pending → running on first touch
//!           claim parts (conditional update), dispatch executors
//!           recompute counters (one aggregation query)
//!           finalize when nothing is pending or running
//! ```
//!
//! The in-memory processing set keeps one round from touching the same
//! batch twice in-process; the per-part conditional claim is the
//! authoritative guard across processes.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::model::{
    Batch, BatchCounters, BatchFilter, BatchItem, BatchPart, BatchPartStatus, BatchSpec,
    BatchStatus,
};
use super::store::BatchStore;
use crate::clock::SharedClock;
use crate::config::BatchEngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{BatchEvent, EventBus};
use crate::executor::SharedExecutorRegistry;

/// Engine driving batch creation, part execution, and aggregation.
pub struct BatchEngine {
    store: Arc<dyn BatchStore>,
    executors: SharedExecutorRegistry,
    bus: EventBus,
    clock: SharedClock,
    config: BatchEngineConfig,
    /// Batches this process is currently working on.
    processing: Mutex<HashSet<Uuid>>,
}

impl BatchEngine {
    /// Wire an engine from its collaborators.
    pub fn new(
        store: Arc<dyn BatchStore>,
        executors: SharedExecutorRegistry,
        bus: EventBus,
        clock: SharedClock,
        config: BatchEngineConfig,
    ) -> Self {
        Self {
            store,
            executors,
            bus,
            clock,
            config,
            processing: Mutex::new(HashSet::new()),
        }
    }

    /// The underlying store (for the statistics aggregator).
    pub fn store(&self) -> Arc<dyn BatchStore> {
        Arc::clone(&self.store)
    }

    /// Create a batch, with or without initial parts. Emits
    /// `batch.created`.
    pub async fn create_batch(&self, spec: BatchSpec) -> EngineResult<Batch> {
        let now = self.clock.now();
        let batch = Batch {
            id: Uuid::new_v4(),
            batch_type: spec.batch_type,
            status: BatchStatus::Pending,
            total: spec.items.len() as i32,
            processed_total: 0,
            success_total: 0,
            fail_total: 0,
            priority: spec.priority,
            max_retries: spec.max_retries,
            config: spec.config,
            error_message: None,
            tenant_id: spec.tenant_id,
            created_at: now,
            started_at: None,
            ended_at: None,
        };

        let batch = self.store.insert_batch(batch).await?;
        if !spec.items.is_empty() {
            let parts = self.build_parts(&batch, spec.items);
            self.store.insert_parts(parts).await?;
        }

        debug!(batch_id = %batch.id, batch_type = %batch.batch_type, total = batch.total, "batch created");
        self.bus.emit(BatchEvent::Created {
            batch_id: batch.id,
            batch_type: batch.batch_type.clone(),
            total: batch.total,
        });
        Ok(batch)
    }

    /// Append parts to a batch that has not started yet.
    pub async fn add_parts(&self, batch_id: Uuid, items: Vec<BatchItem>) -> EngineResult<u64> {
        let batch = self.require_batch(batch_id).await?;
        if batch.status != BatchStatus::Pending {
            return Err(EngineError::invalid_state(
                "batch",
                batch_id,
                "parts may only be added while the batch is pending",
            ));
        }

        let parts = self.build_parts(&batch, items);
        let added = self.store.insert_parts(parts).await?;
        self.store.recompute_counters(batch_id).await?;
        Ok(added)
    }

    /// One processing round: select ready batches, work each one, and
    /// return how many were touched. Driven by the scheduler tick.
    pub async fn run_once(&self) -> EngineResult<usize> {
        if !self.config.enabled {
            return Ok(0);
        }

        let candidates = self.store.ready_batches(self.config.max_concurrent).await?;
        let mut selected = Vec::with_capacity(candidates.len());
        {
            let mut processing = self.processing.lock().await;
            for batch in candidates {
                if processing.insert(batch.id) {
                    selected.push(batch);
                }
            }
        }

        let results = join_all(selected.iter().map(|batch| self.process_batch(batch))).await;

        {
            let mut processing = self.processing.lock().await;
            for batch in &selected {
                processing.remove(&batch.id);
            }
        }

        for (batch, result) in selected.iter().zip(results) {
            if let Err(error) = result {
                warn!(batch_id = %batch.id, error = %error, "batch processing round failed");
            }
        }

        Ok(selected.len())
    }

    /// Cancel a batch: pending parts skip, running parts finish naturally.
    ///
    /// Idempotent on an already-cancelled batch; `InvalidState` on a
    /// completed or failed one.
    pub async fn cancel_batch(&self, id: Uuid) -> EngineResult<Batch> {
        let batch = self.require_batch(id).await?;
        match batch.status {
            BatchStatus::Cancelled => Ok(batch),
            BatchStatus::Completed | BatchStatus::Failed => Err(EngineError::invalid_state(
                "batch",
                id,
                format!("cannot cancel a {} batch", status_name(batch.status)),
            )),
            BatchStatus::Pending | BatchStatus::Running => {
                let now = self.clock.now();
                let skipped = self.store.cancel_batch(id, now).await?.unwrap_or(0);
                self.store.recompute_counters(id).await?;
                self.bus.emit(BatchEvent::Cancelled {
                    batch_id: id,
                    skipped: skipped as i32,
                });
                self.require_batch(id).await
            }
        }
    }

    /// Reset all failed parts to pending with a fresh budget; a failed
    /// batch returns to pending. No failed parts means a no-op.
    pub async fn retry_failed_parts(&self, id: Uuid) -> EngineResult<u64> {
        let batch = self.require_batch(id).await?;
        let reset = self.store.reset_failed_parts(id).await?;
        if reset > 0 && batch.status == BatchStatus::Failed {
            self.store.reset_batch_pending(id).await?;
        }
        if reset > 0 {
            self.store.recompute_counters(id).await?;
        }
        Ok(reset)
    }

    /// Find a batch by id.
    pub async fn find_batch(&self, id: Uuid) -> EngineResult<Batch> {
        self.require_batch(id).await
    }

    /// All parts of a batch, oldest first.
    pub async fn parts(&self, batch_id: Uuid) -> EngineResult<Vec<BatchPart>> {
        self.require_batch(batch_id).await?;
        Ok(self.store.parts_for_batch(batch_id).await?)
    }

    /// Paginated, filtered batch listing.
    pub async fn list_batches(&self, filter: BatchFilter) -> EngineResult<Vec<Batch>> {
        Ok(self.store.list(filter).await?)
    }

    /// Retention pass: drop terminal batches older than the window.
    pub async fn cleanup_finished(&self) -> EngineResult<u64> {
        if !self.config.auto_cleanup {
            return Ok(0);
        }
        let cutoff = self.clock.now() - Duration::days(self.config.retention_days);
        Ok(self.store.delete_terminal_before(cutoff).await?)
    }

    async fn require_batch(&self, id: Uuid) -> EngineResult<Batch> {
        self.store
            .find_batch(id)
            .await?
            .ok_or_else(|| EngineError::not_found("batch", id))
    }

    fn build_parts(&self, batch: &Batch, items: Vec<BatchItem>) -> Vec<BatchPart> {
        let now = self.clock.now();
        items
            .into_iter()
            .map(|item| BatchPart {
                id: Uuid::new_v4(),
                batch_id: batch.id,
                part_type: item.part_type.unwrap_or_else(|| batch.batch_type.clone()),
                status: BatchPartStatus::Pending,
                data: item.data,
                result: None,
                error_message: None,
                retry_count: 0,
                next_retry_at: None,
                created_at: now,
                started_at: None,
                ended_at: None,
            })
            .collect()
    }

    /// Work one batch for one round: claim a page of pending parts,
    /// dispatch them concurrently, then re-derive the counters. With
    /// nothing left pending or running, finalize.
    async fn process_batch(&self, batch: &Batch) -> EngineResult<()> {
        let now = self.clock.now();
        if batch.status == BatchStatus::Pending
            && self.store.mark_batch_running(batch.id, now).await?
        {
            self.bus.emit(BatchEvent::Started { batch_id: batch.id });
        }

        let parts = self
            .store
            .pending_parts(batch.id, self.config.batch_size, now)
            .await?;

        if parts.is_empty() {
            let counters = self.store.recompute_counters(batch.id).await?;
            if counters.running == 0 && counters.pending == 0 {
                self.finalize(batch.id, counters).await?;
            }
            return Ok(());
        }

        join_all(
            parts
                .into_iter()
                .map(|part| self.execute_part(batch, part)),
        )
        .await;

        let counters = self.store.recompute_counters(batch.id).await?;
        self.bus.emit(BatchEvent::Progress {
            batch_id: batch.id,
            processed_total: counters.processed_total,
            success_total: counters.success_total,
            fail_total: counters.fail_total,
        });

        if counters.running == 0 && counters.pending == 0 {
            self.finalize(batch.id, counters).await?;
        }
        Ok(())
    }

    /// Claim and execute one part. Failure consumes one unit of the
    /// per-part budget; a retried part waits out an exponential backoff
    /// before the next claim, and the transition to terminal `failed`
    /// happens when `retry_count` reaches `batch.max_retries`.
    async fn execute_part(&self, batch: &Batch, part: BatchPart) {
        let now = self.clock.now();
        match self.store.try_claim_part(part.id, now).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(error) => {
                warn!(part_id = %part.id, error = %error, "part claim failed");
                return;
            }
        }

        let executor = self
            .executors
            .part_executor(&part.part_type)
            .or_else(|| self.executors.part_executor(&batch.batch_type));

        // A missing executor is fatal at the part level, not retryable.
        let Some(executor) = executor else {
            warn!(
                part_id = %part.id,
                part_type = %part.part_type,
                "no executor registered for batch part"
            );
            let error = format!("no executor registered for type {}", part.part_type);
            let now = self.clock.now();
            if let Err(error) = self.store.fail_part_terminal(part.id, &error, now).await {
                warn!(part_id = %part.id, error = %error, "part status update failed");
            }
            return;
        };

        let outcome = executor(part.clone(), batch.clone()).await;

        let now = self.clock.now();
        let result = if outcome.success {
            self.store.complete_part(part.id, outcome.result, now).await
        } else {
            let error = outcome
                .error
                .unwrap_or_else(|| "part execution failed".to_string());
            let attempt = part.retry_count + 1;
            if attempt >= batch.max_retries {
                self.store.fail_part_terminal(part.id, &error, now).await
            } else {
                let next_retry_at = now + part_retry_delay(self.config.retry_wait_ms, attempt);
                self.store
                    .fail_part_retry(part.id, &error, next_retry_at)
                    .await
            }
        };

        if let Err(error) = result {
            warn!(part_id = %part.id, error = %error, "part status update failed");
        }
    }

    async fn finalize(&self, batch_id: Uuid, counters: BatchCounters) -> EngineResult<()> {
        let status = if counters.fail_total > 0 {
            BatchStatus::Failed
        } else {
            BatchStatus::Completed
        };
        let error_message = (counters.fail_total > 0).then(|| {
            format!(
                "{} of {} parts failed",
                counters.fail_total, counters.total
            )
        });

        let now = self.clock.now();
        if self
            .store
            .finalize_batch(batch_id, status, error_message.as_deref(), now)
            .await?
        {
            self.bus.emit(BatchEvent::Completed {
                batch_id,
                success_total: counters.success_total,
                fail_total: counters.fail_total,
            });
        }
        Ok(())
    }
}

/// Backoff before retry attempt number `attempt` (1-based):
/// `retry_wait_ms * 2^attempt`, capped at one hour.
fn part_retry_delay(retry_wait_ms: i64, attempt: i32) -> Duration {
    let factor = 2i64.saturating_pow(attempt.max(0) as u32);
    Duration::milliseconds(retry_wait_ms.saturating_mul(factor).min(3_600_000))
}

fn status_name(status: BatchStatus) -> &'static str {
    match status {
        BatchStatus::Pending => "pending",
        BatchStatus::Running => "running",
        BatchStatus::Completed => "completed",
        BatchStatus::Failed => "failed",
        BatchStatus::Cancelled => "cancelled",
    }
}
