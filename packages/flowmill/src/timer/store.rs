//! Timer persistence gateway: store trait and PostgreSQL implementation.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::model::{Timer, TimerFilter, TimerStatus};
use crate::stats::StatusCount;

/// Typed persistence operations for timers.
#[async_trait]
pub trait TimerStore: Send + Sync {
    /// Insert a new timer row.
    async fn insert(&self, timer: Timer) -> Result<Timer>;

    /// Find a timer by id.
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Timer>>;

    /// Paginated, filtered listing.
    async fn list(&self, filter: TimerFilter) -> Result<Vec<Timer>>;

    /// Due pending timers with a free (or expired) lock, earliest first.
    async fn due_timers(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<Timer>>;

    /// Lock arbiter claim for a due timer.
    async fn try_claim(
        &self,
        id: Uuid,
        worker_id: &str,
        lock_ttl_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Record a successful firing and advance a repeating timer to
    /// `next_due`: `execution_count++`, lock cleared, still pending.
    async fn finish_fire_advance(
        &self,
        id: Uuid,
        next_due: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Record a successful terminal firing: `execution_count++`,
    /// `status=executed`, lock cleared.
    async fn finish_fire_complete(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Callback failed with budget remaining: `retry_count++`, re-due at
    /// `retry_at`, lock cleared, still pending.
    async fn schedule_retry(&self, id: Uuid, retry_at: DateTime<Utc>) -> Result<bool>;

    /// Callback failed with the budget spent: `status=failed`, lock cleared.
    async fn mark_failed(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Cancel a pending timer. Idempotent at the engine level; this
    /// returns whether a row actually transitioned.
    async fn cancel(&self, id: Uuid) -> Result<bool>;

    /// Cancel all pending timers of a process instance.
    async fn cancel_by_process_instance(&self, process_instance_id: &str) -> Result<u64>;

    /// Cancel all pending timers of an execution.
    async fn cancel_by_execution(&self, execution_id: &str) -> Result<u64>;

    /// Lock sweeper: clear expired locks on pending timers so the next
    /// due-scan can pick them up again.
    async fn release_expired_locks(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Retention: delete terminal timers that last fired (or were created)
    /// before `cutoff`.
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Counts grouped by (type, status, tenant).
    async fn status_counts(&self) -> Result<Vec<StatusCount>>;
}

const TIMER_COLUMNS: &str = "id, timer_type, expression, due_date, repeat, repeat_interval_ms, \
     max_executions, execution_count, end_time, status, callback_config, payload, \
     retry_count, max_retries, lock_owner, lock_expires_at, \
     process_instance_id, execution_id, activity_id, tenant_id, \
     created_at, executed_at, next_execution_at";

/// PostgreSQL-backed timer store.
pub struct PostgresTimerStore {
    pool: PgPool,
}

impl PostgresTimerStore {
    /// Create a store over an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TimerStore for PostgresTimerStore {
    async fn insert(&self, timer: Timer) -> Result<Timer> {
        let inserted = sqlx::query_as::<_, Timer>(&format!(
            r#"
            INSERT INTO timers ({TIMER_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23)
            RETURNING {TIMER_COLUMNS}
            "#
        ))
        .bind(timer.id)
        .bind(timer.timer_type)
        .bind(&timer.expression)
        .bind(timer.due_date)
        .bind(timer.repeat)
        .bind(timer.repeat_interval_ms)
        .bind(timer.max_executions)
        .bind(timer.execution_count)
        .bind(timer.end_time)
        .bind(timer.status)
        .bind(&timer.callback_config)
        .bind(&timer.payload)
        .bind(timer.retry_count)
        .bind(timer.max_retries)
        .bind(&timer.lock_owner)
        .bind(timer.lock_expires_at)
        .bind(&timer.process_instance_id)
        .bind(&timer.execution_id)
        .bind(&timer.activity_id)
        .bind(&timer.tenant_id)
        .bind(timer.created_at)
        .bind(timer.executed_at)
        .bind(timer.next_execution_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(inserted)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Timer>> {
        let timer = sqlx::query_as::<_, Timer>(&format!(
            "SELECT {TIMER_COLUMNS} FROM timers WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(timer)
    }

    async fn list(&self, filter: TimerFilter) -> Result<Vec<Timer>> {
        let timers = sqlx::query_as::<_, Timer>(&format!(
            r#"
            SELECT {TIMER_COLUMNS}
            FROM timers
            WHERE ($1::timer_status IS NULL OR status = $1)
              AND ($2::text IS NULL OR process_instance_id = $2)
            ORDER BY due_date ASC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(filter.status)
        .bind(&filter.process_instance_id)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(timers)
    }

    async fn due_timers(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<Timer>> {
        let timers = sqlx::query_as::<_, Timer>(&format!(
            r#"
            SELECT {TIMER_COLUMNS}
            FROM timers
            WHERE status = 'pending'
              AND due_date <= $2
              AND (lock_owner IS NULL OR lock_expires_at < $2)
            ORDER BY due_date ASC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(timers)
    }

    async fn try_claim(
        &self,
        id: Uuid,
        worker_id: &str,
        lock_ttl_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE timers
            SET lock_owner = $2,
                lock_expires_at = $3
            WHERE id = $1
              AND status = 'pending'
              AND (lock_owner IS NULL OR lock_expires_at < $4)
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(now + Duration::milliseconds(lock_ttl_ms))
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn finish_fire_advance(
        &self,
        id: Uuid,
        next_due: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE timers
            SET execution_count = execution_count + 1,
                due_date = $2,
                next_execution_at = $2,
                executed_at = $3,
                retry_count = 0,
                lock_owner = NULL,
                lock_expires_at = NULL
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(next_due)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn finish_fire_complete(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE timers
            SET execution_count = execution_count + 1,
                status = 'executed',
                executed_at = $2,
                next_execution_at = NULL,
                lock_owner = NULL,
                lock_expires_at = NULL
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn schedule_retry(&self, id: Uuid, retry_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE timers
            SET retry_count = retry_count + 1,
                due_date = $2,
                lock_owner = NULL,
                lock_expires_at = NULL
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .bind(retry_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(&self, id: Uuid, _now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE timers
            SET status = 'failed',
                retry_count = retry_count + 1,
                lock_owner = NULL,
                lock_expires_at = NULL
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn cancel(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE timers SET status = 'cancelled' WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn cancel_by_process_instance(&self, process_instance_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE timers SET status = 'cancelled' WHERE process_instance_id = $1 AND status = 'pending'",
        )
        .bind(process_instance_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn cancel_by_execution(&self, execution_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE timers SET status = 'cancelled' WHERE execution_id = $1 AND status = 'pending'",
        )
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn release_expired_locks(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE timers
            SET lock_owner = NULL,
                lock_expires_at = NULL
            WHERE status = 'pending' AND lock_expires_at < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM timers
            WHERE status IN ('executed', 'cancelled', 'failed')
              AND COALESCE(executed_at, created_at) < $1
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
            SELECT timer_type::text AS work_type, status::text AS status, tenant_id, COUNT(*) AS count
            FROM timers
            GROUP BY timer_type, status, tenant_id
            ORDER BY timer_type, status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
