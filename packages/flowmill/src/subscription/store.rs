//! Subscription persistence gateway: store trait and PostgreSQL
//! implementation.
//!
//! `mark_processed` is the at-most-once guard: a conditional update on
//! `is_processed = false` whose affected-row count decides which of the
//! concurrent triggers owns the firing.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::model::{EventSubscription, EventType};
use crate::stats::StatusCount;

/// Typed persistence operations for event subscriptions.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Insert a new subscription row.
    async fn insert(&self, subscription: EventSubscription) -> Result<EventSubscription>;

    /// Find a subscription by id.
    async fn find_by_id(&self, id: Uuid) -> Result<Option<EventSubscription>>;

    /// Unprocessed subscriptions matching `(event_type, event_name)`,
    /// ordered `priority DESC, created_at ASC`.
    ///
    /// `process_instance_id` narrows to one instance. `tenant_id` keeps
    /// rows of that tenant plus tenant-less rows (which match any tenant).
    async fn find_unprocessed(
        &self,
        event_type: EventType,
        event_name: &str,
        process_instance_id: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Result<Vec<EventSubscription>>;

    /// Conditional `is_processed false → true`. Returns whether this
    /// caller won the transition.
    async fn mark_processed(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Bulk delete for a terminated process instance.
    async fn delete_by_process_instance(&self, process_instance_id: &str) -> Result<u64>;

    /// Bulk delete for a finished execution.
    async fn delete_by_execution(&self, execution_id: &str) -> Result<u64>;

    /// Retention: delete processed rows older than `cutoff`.
    async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Counts grouped by (event type, processed flag, tenant).
    async fn status_counts(&self) -> Result<Vec<StatusCount>>;
}

const SUBSCRIPTION_COLUMNS: &str = "id, event_type, event_name, process_instance_id, execution_id, \
     activity_id, configuration_type, configuration, priority, is_processed, processed_at, \
     callback_id, tenant_id, created_at";

/// PostgreSQL-backed subscription store.
pub struct PostgresSubscriptionStore {
    pool: PgPool,
}

impl PostgresSubscriptionStore {
    /// Create a store over an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PostgresSubscriptionStore {
    async fn insert(&self, subscription: EventSubscription) -> Result<EventSubscription> {
        let inserted = sqlx::query_as::<_, EventSubscription>(&format!(
            r#"
            INSERT INTO event_subscriptions ({SUBSCRIPTION_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(subscription.id)
        .bind(subscription.event_type)
        .bind(&subscription.event_name)
        .bind(&subscription.process_instance_id)
        .bind(&subscription.execution_id)
        .bind(&subscription.activity_id)
        .bind(&subscription.configuration_type)
        .bind(&subscription.configuration)
        .bind(subscription.priority)
        .bind(subscription.is_processed)
        .bind(subscription.processed_at)
        .bind(&subscription.callback_id)
        .bind(&subscription.tenant_id)
        .bind(subscription.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(inserted)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<EventSubscription>> {
        let subscription = sqlx::query_as::<_, EventSubscription>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM event_subscriptions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    async fn find_unprocessed(
        &self,
        event_type: EventType,
        event_name: &str,
        process_instance_id: Option<&str>,
        tenant_id: Option<&str>,
    ) -> Result<Vec<EventSubscription>> {
        let subscriptions = sqlx::query_as::<_, EventSubscription>(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM event_subscriptions
            WHERE event_type = $1
              AND event_name = $2
              AND is_processed = FALSE
              AND ($3::text IS NULL OR process_instance_id = $3)
              AND ($4::text IS NULL OR tenant_id IS NULL OR tenant_id = $4)
            ORDER BY priority DESC, created_at ASC
            "#
        ))
        .bind(event_type)
        .bind(event_name)
        .bind(process_instance_id)
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(subscriptions)
    }

    async fn mark_processed(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE event_subscriptions
            SET is_processed = TRUE, processed_at = $2
            WHERE id = $1 AND is_processed = FALSE
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_by_process_instance(&self, process_instance_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM event_subscriptions WHERE process_instance_id = $1")
            .bind(process_instance_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn delete_by_execution(&self, execution_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM event_subscriptions WHERE execution_id = $1")
            .bind(execution_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn delete_processed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM event_subscriptions WHERE is_processed = TRUE AND processed_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        let rows = sqlx::query_as::<_, StatusCount>(
            r#"
            SELECT event_type::text AS work_type,
                   CASE WHEN is_processed THEN 'processed' ELSE 'unprocessed' END AS status,
                   tenant_id,
                   COUNT(*) AS count
            FROM event_subscriptions
            GROUP BY event_type, is_processed, tenant_id
            ORDER BY event_type, status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}
