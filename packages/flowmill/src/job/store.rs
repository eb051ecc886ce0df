//! Job persistence gateway: store trait and PostgreSQL implementation.
//!
//! The claim path is the lock arbiter: a conditional `UPDATE` whose
//! predicate only matches an unclaimed (or expired-lock) pending row.
//! The affected-row count decides the winner, which gives at-most-one
//! claimant per job without distributed locks.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::model::{DeadLetterJob, Job, JobFailure, JobFilter, JobStatus};
use crate::stats::{DurationStats, StatusCount};

/// Typed persistence operations for jobs and the dead-letter sink.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job row.
    async fn insert(&self, job: Job) -> Result<Job>;

    /// Find a job by id.
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>>;

    /// Paginated, filtered listing.
    async fn list(&self, filter: JobFilter) -> Result<Vec<Job>>;

    /// Fetch up to `limit` acquirable pending jobs ordered by
    /// `priority DESC, created_at ASC`. Candidates only; claiming is a
    /// separate conditional update per row.
    async fn fetch_claimable(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Attempt to claim a job for `worker_id`. Returns whether this caller
    /// won the row.
    async fn try_claim(
        &self,
        id: Uuid,
        worker_id: &str,
        lock_ttl_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Extend the lock of a running job (heartbeat for long handlers).
    async fn extend_lock(&self, id: Uuid, lock_ttl_ms: i64, now: DateTime<Utc>) -> Result<bool>;

    /// Terminal success: `status=completed, ended_at=now`, lock cleared.
    async fn mark_completed(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Transient failure marker: `status=failed` with the exception stored.
    async fn mark_failed(&self, id: Uuid, failure: &JobFailure, now: DateTime<Utc>) -> Result<bool>;

    /// Return a job to pending for retry: `retry_count++`, exception
    /// stored, lock cleared, eligible again at `next_retry_at`.
    async fn schedule_retry(
        &self,
        id: Uuid,
        failure: &JobFailure,
        next_retry_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Delete a pending job (cancellation). Running jobs are untouched.
    async fn delete_pending(&self, id: Uuid) -> Result<bool>;

    /// Move a job into the dead-letter sink: insert the mirror row and
    /// delete the original in one transaction.
    async fn move_to_dead_letter(
        &self,
        job: &Job,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterJob>;

    /// Find a dead-letter row by id.
    async fn find_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetterJob>>;

    /// List dead-letter rows, newest first.
    async fn list_dead_letters(&self, limit: i64, offset: i64) -> Result<Vec<DeadLetterJob>>;

    /// Re-queue a dead-letter row as a fresh pending job, bumping the
    /// row's replay counter. Returns the new job, or None if the
    /// dead-letter row does not exist.
    async fn requeue_dead_letter(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Job>>;

    /// Lock sweeper: return every expired running job to pending with the
    /// lock cleared and `retry_count` untouched.
    async fn release_expired_locks(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Retention: delete completed jobs that ended before `cutoff`.
    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Counts grouped by (type, status, tenant).
    async fn status_counts(&self) -> Result<Vec<StatusCount>>;

    /// Dead-letter counts grouped by (type, tenant).
    async fn dead_letter_counts(&self) -> Result<Vec<StatusCount>>;

    /// Execution duration percentiles per job type over completed jobs.
    async fn duration_percentiles(&self) -> Result<Vec<DurationStats>>;
}

const JOB_COLUMNS: &str = "id, job_type, status, priority, retry_count, max_retries, retry_wait_ms, \
     next_retry_at, due_date, lock_owner, lock_expires_at, payload, handler_type, handler_config, \
     process_instance_id, execution_id, exception_message, exception_stack, tenant_id, \
     created_at, started_at, ended_at";

const DEAD_LETTER_COLUMNS: &str = "id, source_job_id, job_type, handler_type, handler_config, payload, \
     priority, total_retries, replay_count, exception_message, exception_stack, \
     process_instance_id, execution_id, tenant_id, created_at, dead_lettered_at";

/// PostgreSQL-backed job store.
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    /// Create a store over an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    async fn insert(&self, job: Job) -> Result<Job> {
        let inserted = sqlx::query_as::<_, Job>(&format!(
            r#"
            INSERT INTO jobs ({JOB_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.id)
        .bind(&job.job_type)
        .bind(job.status)
        .bind(job.priority)
        .bind(job.retry_count)
        .bind(job.max_retries)
        .bind(job.retry_wait_ms)
        .bind(job.next_retry_at)
        .bind(job.due_date)
        .bind(&job.lock_owner)
        .bind(job.lock_expires_at)
        .bind(&job.payload)
        .bind(&job.handler_type)
        .bind(&job.handler_config)
        .bind(&job.process_instance_id)
        .bind(&job.execution_id)
        .bind(&job.exception_message)
        .bind(&job.exception_stack)
        .bind(&job.tenant_id)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.ended_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(inserted)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>> {
        let job = sqlx::query_as::<_, Job>(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn list(&self, filter: JobFilter) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE ($1::job_status IS NULL OR status = $1)
              AND ($2::text IS NULL OR job_type = $2)
              AND ($3::text IS NULL OR tenant_id = $3)
              AND ($4::text IS NULL OR process_instance_id = $4)
            ORDER BY created_at DESC
            LIMIT $5 OFFSET $6
            "#
        ))
        .bind(filter.status)
        .bind(&filter.job_type)
        .bind(&filter.tenant_id)
        .bind(&filter.process_instance_id)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn fetch_claimable(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE status = 'pending'
              AND (next_retry_at IS NULL OR next_retry_at <= $2)
              AND (due_date IS NULL OR due_date <= $2)
            ORDER BY priority DESC, created_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
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
            UPDATE jobs
            SET status = 'running',
                lock_owner = $2,
                lock_expires_at = $3,
                started_at = COALESCE(started_at, $4)
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

    async fn extend_lock(&self, id: Uuid, lock_ttl_ms: i64, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET lock_expires_at = $2 WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(now + Duration::milliseconds(lock_ttl_ms))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_completed(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed',
                ended_at = $2,
                lock_owner = NULL,
                lock_expires_at = NULL
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_failed(&self, id: Uuid, failure: &JobFailure, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'failed',
                exception_message = $2,
                exception_stack = $3,
                ended_at = $4,
                lock_owner = NULL,
                lock_expires_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(&failure.message)
        .bind(&failure.stack)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        failure: &JobFailure,
        next_retry_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                retry_count = retry_count + 1,
                next_retry_at = $2,
                exception_message = $3,
                exception_stack = $4,
                lock_owner = NULL,
                lock_expires_at = NULL
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(next_retry_at)
        .bind(&failure.message)
        .bind(&failure.stack)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_pending(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1 AND status = 'pending'")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn move_to_dead_letter(
        &self,
        job: &Job,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterJob> {
        let mut tx = self.pool.begin().await?;

        let dead = sqlx::query_as::<_, DeadLetterJob>(&format!(
            r#"
            INSERT INTO dead_letter_jobs ({DEAD_LETTER_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $9, $10, $11, $12, $13, $14, $15)
            RETURNING {DEAD_LETTER_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(job.id)
        .bind(&job.job_type)
        .bind(&job.handler_type)
        .bind(&job.handler_config)
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.retry_count)
        .bind(&failure.message)
        .bind(&failure.stack)
        .bind(&job.process_instance_id)
        .bind(&job.execution_id)
        .bind(&job.tenant_id)
        .bind(job.created_at)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(job.id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(dead)
    }

    async fn find_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetterJob>> {
        let dead = sqlx::query_as::<_, DeadLetterJob>(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter_jobs WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(dead)
    }

    async fn list_dead_letters(&self, limit: i64, offset: i64) -> Result<Vec<DeadLetterJob>> {
        let rows = sqlx::query_as::<_, DeadLetterJob>(&format!(
            r#"
            SELECT {DEAD_LETTER_COLUMNS}
            FROM dead_letter_jobs
            ORDER BY dead_lettered_at DESC
            LIMIT $1 OFFSET $2
            "#
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn requeue_dead_letter(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut tx = self.pool.begin().await?;

        let dead = sqlx::query_as::<_, DeadLetterJob>(&format!(
            "SELECT {DEAD_LETTER_COLUMNS} FROM dead_letter_jobs WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(dead) = dead else {
            return Ok(None);
        };

        let job = sqlx::query_as::<_, Job>(&format!(
            r#"
            INSERT INTO jobs (id, job_type, status, priority, retry_count, max_retries, retry_wait_ms,
                              payload, handler_type, handler_config,
                              process_instance_id, execution_id, tenant_id, created_at)
            VALUES ($1, $2, 'pending', $3, 0, 3, 5000, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(&dead.job_type)
        .bind(dead.priority)
        .bind(&dead.payload)
        .bind(&dead.handler_type)
        .bind(&dead.handler_config)
        .bind(&dead.process_instance_id)
        .bind(&dead.execution_id)
        .bind(&dead.tenant_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("UPDATE dead_letter_jobs SET replay_count = replay_count + 1 WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Some(job))
    }

    async fn release_expired_locks(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'pending',
                lock_owner = NULL,
                lock_expires_at = NULL
            WHERE status = 'running' AND lock_expires_at < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE status = 'completed' AND ended_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        let rows = sqlx::query_as::<_, StatusCount>(
            r#"
            SELECT job_type AS work_type, status::text AS status, tenant_id, COUNT(*) AS count
            FROM jobs
            GROUP BY job_type, status, tenant_id
            ORDER BY job_type, status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn dead_letter_counts(&self) -> Result<Vec<StatusCount>> {
        let rows = sqlx::query_as::<_, StatusCount>(
            r#"
            SELECT job_type AS work_type, 'dead_letter' AS status, tenant_id, COUNT(*) AS count
            FROM dead_letter_jobs
            GROUP BY job_type, tenant_id
            ORDER BY job_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn duration_percentiles(&self) -> Result<Vec<DurationStats>> {
        let rows = sqlx::query_as::<_, DurationStats>(
            r#"
            SELECT job_type AS work_type,
                   COUNT(*) AS count,
                   percentile_cont(0.5) WITHIN GROUP (ORDER BY EXTRACT(EPOCH FROM (ended_at - started_at)) * 1000) AS p50_ms,
                   percentile_cont(0.95) WITHIN GROUP (ORDER BY EXTRACT(EPOCH FROM (ended_at - started_at)) * 1000) AS p95_ms
            FROM jobs
            WHERE status = 'completed' AND started_at IS NOT NULL AND ended_at IS NOT NULL
            GROUP BY job_type
            ORDER BY job_type
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
