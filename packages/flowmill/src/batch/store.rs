//! Batch persistence gateway: store trait and PostgreSQL implementation.
//!
//! Parts are claimed with the same conditional-update pattern as jobs and
//! timers; batch counters are rewritten from a single aggregation over the
//! parts so concurrent part transitions can never drift them.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use super::model::{Batch, BatchCounters, BatchFilter, BatchPart, BatchStatus};
use crate::stats::{DurationStats, StatusCount};

/// Typed persistence operations for batches and their parts.
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Insert a new batch row.
    async fn insert_batch(&self, batch: Batch) -> Result<Batch>;

    /// Insert part rows (initial creation or append).
    async fn insert_parts(&self, parts: Vec<BatchPart>) -> Result<u64>;

    /// Find a batch by id.
    async fn find_batch(&self, id: Uuid) -> Result<Option<Batch>>;

    /// Find a part by id.
    async fn find_part(&self, id: Uuid) -> Result<Option<BatchPart>>;

    /// Paginated, filtered batch listing.
    async fn list(&self, filter: BatchFilter) -> Result<Vec<Batch>>;

    /// All parts of a batch, oldest first.
    async fn parts_for_batch(&self, batch_id: Uuid) -> Result<Vec<BatchPart>>;

    /// Batches eligible for processing, highest priority first.
    async fn ready_batches(&self, limit: i64) -> Result<Vec<Batch>>;

    /// Conditional `pending → running` transition on first touch.
    async fn mark_batch_running(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Pending parts of a batch eligible at `now` (past any retry
    /// backoff), oldest first.
    async fn pending_parts(
        &self,
        batch_id: Uuid,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<BatchPart>>;

    /// Lock arbiter claim for one part (`pending → running`).
    async fn try_claim_part(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Terminal part success, storing the handler result.
    async fn complete_part(
        &self,
        id: Uuid,
        result: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Part failure with budget remaining: back to pending,
    /// `retry_count++`, not claimable again before `next_retry_at`.
    async fn fail_part_retry(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Part failure with the budget spent: terminal failed, `retry_count++`.
    async fn fail_part_terminal(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Recompute and persist the batch counters from one aggregation over
    /// the parts. Returns the derived counters, including live
    /// running/pending tallies for finalization decisions.
    async fn recompute_counters(&self, batch_id: Uuid) -> Result<BatchCounters>;

    /// Terminal transition for a fully processed batch. Conditional on the
    /// batch still being pending/running so a concurrent cancel wins.
    async fn finalize_batch(
        &self,
        id: Uuid,
        status: BatchStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Cancel a batch and skip its pending parts in one transaction.
    /// Returns the skipped-part count, or None when the batch was not in a
    /// cancellable state.
    async fn cancel_batch(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<u64>>;

    /// Reset all failed parts to pending with a fresh retry budget.
    async fn reset_failed_parts(&self, batch_id: Uuid) -> Result<u64>;

    /// Return a failed batch to pending for reprocessing.
    async fn reset_batch_pending(&self, id: Uuid) -> Result<bool>;

    /// Retention: delete terminal batches ended before `cutoff` (parts
    /// cascade).
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Counts grouped by (type, status, tenant).
    async fn status_counts(&self) -> Result<Vec<StatusCount>>;

    /// Batch duration percentiles per type over terminal batches.
    async fn duration_percentiles(&self) -> Result<Vec<DurationStats>>;
}

const BATCH_COLUMNS: &str = "id, batch_type, status, total, processed_total, success_total, fail_total, \
     priority, max_retries, config, error_message, tenant_id, created_at, started_at, ended_at";

const PART_COLUMNS: &str = "id, batch_id, part_type, status, data, result, error_message, retry_count, \
     next_retry_at, created_at, started_at, ended_at";

/// PostgreSQL-backed batch store.
pub struct PostgresBatchStore {
    pool: PgPool,
}

impl PostgresBatchStore {
    /// Create a store over an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BatchStore for PostgresBatchStore {
    async fn insert_batch(&self, batch: Batch) -> Result<Batch> {
        let inserted = sqlx::query_as::<_, Batch>(&format!(
            r#"
            INSERT INTO batches ({BATCH_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            RETURNING {BATCH_COLUMNS}
            "#
        ))
        .bind(batch.id)
        .bind(&batch.batch_type)
        .bind(batch.status)
        .bind(batch.total)
        .bind(batch.processed_total)
        .bind(batch.success_total)
        .bind(batch.fail_total)
        .bind(batch.priority)
        .bind(batch.max_retries)
        .bind(&batch.config)
        .bind(&batch.error_message)
        .bind(&batch.tenant_id)
        .bind(batch.created_at)
        .bind(batch.started_at)
        .bind(batch.ended_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(inserted)
    }

    async fn insert_parts(&self, parts: Vec<BatchPart>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for part in &parts {
            sqlx::query(&format!(
                r#"
                INSERT INTO batch_parts ({PART_COLUMNS})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#
            ))
            .bind(part.id)
            .bind(part.batch_id)
            .bind(&part.part_type)
            .bind(part.status)
            .bind(&part.data)
            .bind(&part.result)
            .bind(&part.error_message)
            .bind(part.retry_count)
            .bind(part.next_retry_at)
            .bind(part.created_at)
            .bind(part.started_at)
            .bind(part.ended_at)
            .execute(&mut *tx)
            .await?;
            inserted += 1;
        }
        tx.commit().await?;

        Ok(inserted)
    }

    async fn find_batch(&self, id: Uuid) -> Result<Option<Batch>> {
        let batch = sqlx::query_as::<_, Batch>(&format!(
            "SELECT {BATCH_COLUMNS} FROM batches WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(batch)
    }

    async fn find_part(&self, id: Uuid) -> Result<Option<BatchPart>> {
        let part = sqlx::query_as::<_, BatchPart>(&format!(
            "SELECT {PART_COLUMNS} FROM batch_parts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(part)
    }

    async fn list(&self, filter: BatchFilter) -> Result<Vec<Batch>> {
        let batches = sqlx::query_as::<_, Batch>(&format!(
            r#"
            SELECT {BATCH_COLUMNS}
            FROM batches
            WHERE ($1::batch_status IS NULL OR status = $1)
              AND ($2::text IS NULL OR batch_type = $2)
              AND ($3::text IS NULL OR tenant_id = $3)
            ORDER BY created_at DESC
            LIMIT $4 OFFSET $5
            "#
        ))
        .bind(filter.status)
        .bind(&filter.batch_type)
        .bind(&filter.tenant_id)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(batches)
    }

    async fn parts_for_batch(&self, batch_id: Uuid) -> Result<Vec<BatchPart>> {
        let parts = sqlx::query_as::<_, BatchPart>(&format!(
            "SELECT {PART_COLUMNS} FROM batch_parts WHERE batch_id = $1 ORDER BY created_at ASC"
        ))
        .bind(batch_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(parts)
    }

    async fn ready_batches(&self, limit: i64) -> Result<Vec<Batch>> {
        let batches = sqlx::query_as::<_, Batch>(&format!(
            r#"
            SELECT {BATCH_COLUMNS}
            FROM batches
            WHERE status IN ('pending', 'running')
            ORDER BY priority DESC, created_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(batches)
    }

    async fn mark_batch_running(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE batches
            SET status = 'running', started_at = COALESCE(started_at, $2)
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn pending_parts(
        &self,
        batch_id: Uuid,
        limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<BatchPart>> {
        let parts = sqlx::query_as::<_, BatchPart>(&format!(
            r#"
            SELECT {PART_COLUMNS}
            FROM batch_parts
            WHERE batch_id = $1
              AND status = 'pending'
              AND (next_retry_at IS NULL OR next_retry_at <= $3)
            ORDER BY created_at ASC
            LIMIT $2
            "#
        ))
        .bind(batch_id)
        .bind(limit)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(parts)
    }

    async fn try_claim_part(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE batch_parts
            SET status = 'running', started_at = COALESCE(started_at, $2)
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete_part(
        &self,
        id: Uuid,
        result: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let outcome = sqlx::query(
            r#"
            UPDATE batch_parts
            SET status = 'completed', result = $2, ended_at = $3
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(&result)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    async fn fail_part_retry(
        &self,
        id: Uuid,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE batch_parts
            SET status = 'pending', retry_count = retry_count + 1,
                error_message = $2, next_retry_at = $3
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(next_retry_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn fail_part_terminal(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE batch_parts
            SET status = 'failed', retry_count = retry_count + 1, error_message = $2, ended_at = $3
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn recompute_counters(&self, batch_id: Uuid) -> Result<BatchCounters> {
        let counters = sqlx::query_as::<_, BatchCounters>(
            r#"
            WITH agg AS (
                SELECT
                    COUNT(*)::int AS total,
                    COUNT(*) FILTER (WHERE status IN ('completed', 'failed', 'skipped'))::int AS processed_total,
                    COUNT(*) FILTER (WHERE status = 'completed')::int AS success_total,
                    COUNT(*) FILTER (WHERE status = 'failed')::int AS fail_total,
                    COUNT(*) FILTER (WHERE status = 'skipped')::int AS skipped_total,
                    COUNT(*) FILTER (WHERE status = 'running')::int AS running,
                    COUNT(*) FILTER (WHERE status = 'pending')::int AS pending
                FROM batch_parts
                WHERE batch_id = $1
            )
            UPDATE batches
            SET total = agg.total,
                processed_total = agg.processed_total,
                success_total = agg.success_total,
                fail_total = agg.fail_total
            FROM agg
            WHERE batches.id = $1
            RETURNING agg.total, agg.processed_total, agg.success_total, agg.fail_total,
                      agg.skipped_total, agg.running, agg.pending
            "#,
        )
        .bind(batch_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(counters)
    }

    async fn finalize_batch(
        &self,
        id: Uuid,
        status: BatchStatus,
        error_message: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE batches
            SET status = $2, error_message = $3, ended_at = $4
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(error_message)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn cancel_batch(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<u64>> {
        let mut tx = self.pool.begin().await?;

        let cancelled = sqlx::query(
            r#"
            UPDATE batches
            SET status = 'cancelled', ended_at = $2
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if cancelled.rows_affected() == 0 {
            return Ok(None);
        }

        let skipped = sqlx::query(
            r#"
            UPDATE batch_parts
            SET status = 'skipped', ended_at = $2
            WHERE batch_id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(skipped.rows_affected()))
    }

    async fn reset_failed_parts(&self, batch_id: Uuid) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE batch_parts
            SET status = 'pending', retry_count = 0, error_message = NULL,
                next_retry_at = NULL, started_at = NULL, ended_at = NULL
            WHERE batch_id = $1 AND status = 'failed'
            "#,
        )
        .bind(batch_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn reset_batch_pending(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE batches
            SET status = 'pending', ended_at = NULL, error_message = NULL
            WHERE id = $1 AND status = 'failed'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM batches
            WHERE status IN ('completed', 'failed', 'cancelled') AND ended_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        let rows = sqlx::query_as::<_, StatusCount>(
            r#"
            SELECT batch_type AS work_type, status::text AS status, tenant_id, COUNT(*) AS count
            FROM batches
            GROUP BY batch_type, status, tenant_id
            ORDER BY batch_type, status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn duration_percentiles(&self) -> Result<Vec<DurationStats>> {
        let rows = sqlx::query_as::<_, DurationStats>(
            r#"
            SELECT batch_type AS work_type,
                   COUNT(*) AS count,
                   percentile_cont(0.5) WITHIN GROUP (ORDER BY EXTRACT(EPOCH FROM (ended_at - started_at)) * 1000) AS p50_ms,
                   percentile_cont(0.95) WITHIN GROUP (ORDER BY EXTRACT(EPOCH FROM (ended_at - started_at)) * 1000) AS p95_ms
            FROM batches
            WHERE status IN ('completed', 'failed') AND started_at IS NOT NULL AND ended_at IS NOT NULL
            GROUP BY batch_type
            ORDER BY batch_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
