//! Timer records for due-date-driven firings.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Which expression grammar produced the timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "timer_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TimerType {
    Date,
    Duration,
    Cycle,
}

/// Lifecycle status of a timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "timer_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TimerStatus {
    #[default]
    Pending,
    Executed,
    Failed,
    Cancelled,
}

/// A scheduled firing based on a date, duration, or cycle expression.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Timer {
    pub id: Uuid,
    pub timer_type: TimerType,
    /// The raw expression; repeat advancement re-parses it.
    pub expression: String,
    pub due_date: DateTime<Utc>,
    pub repeat: bool,
    /// Fixed repeat interval, cached for cycle timers with one.
    pub repeat_interval_ms: Option<i64>,
    pub max_executions: Option<i32>,
    pub execution_count: i32,
    /// Hard stop: no firing is scheduled past this instant.
    pub end_time: Option<DateTime<Utc>>,
    pub status: TimerStatus,
    /// Callback routing; `callback_config.type` selects the registered
    /// callback (the built-in `"job"` type promotes the firing to a job).
    pub callback_config: Value,
    pub payload: Value,
    pub retry_count: i32,
    pub max_retries: i32,
    pub lock_owner: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub process_instance_id: Option<String>,
    pub execution_id: Option<String>,
    pub activity_id: Option<String>,
    pub tenant_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
    pub next_execution_at: Option<DateTime<Utc>>,
}

impl Timer {
    /// The callback type string from `callback_config`, if present.
    pub fn callback_type(&self) -> Option<&str> {
        self.callback_config.get("type").and_then(Value::as_str)
    }

    /// Deserialize the payload into a typed struct.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| anyhow!("failed to deserialize payload for timer {}: {}", self.id, e))
    }

    /// Whether this timer is due at `now` and free to claim.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if self.status != TimerStatus::Pending || self.due_date > now {
            return false;
        }
        self.lock_owner.is_none() || self.lock_expires_at.map_or(true, |expires| expires < now)
    }

    /// Whether the repeat budget is spent after `execution_count` firings.
    pub fn repeat_budget_spent(&self) -> bool {
        self.max_executions
            .map_or(false, |max| self.execution_count >= max)
    }
}

/// Options for creating a timer.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct TimerSpec {
    /// Date, duration, or cycle expression (see the expression module).
    pub expression: String,
    #[builder(default = Value::Null)]
    pub callback_config: Value,
    #[builder(default = Value::Null)]
    pub payload: Value,
    /// Explicit firing bound; a bounded `R<n>/` expression also sets one.
    #[builder(default, setter(strip_option))]
    pub max_executions: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub end_time: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub max_retries: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub process_instance_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub execution_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub activity_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub tenant_id: Option<String>,
}

impl TimerSpec {
    /// Shorthand for a bare expression with no callback routing.
    pub fn for_expression(expression: impl Into<String>) -> Self {
        Self::builder().expression(expression).build()
    }
}

/// Filter for timer listings.
#[derive(Debug, Clone, TypedBuilder)]
pub struct TimerFilter {
    #[builder(default, setter(strip_option))]
    pub status: Option<TimerStatus>,
    #[builder(default, setter(strip_option))]
    pub process_instance_id: Option<String>,
    #[builder(default = 50)]
    pub limit: i64,
    #[builder(default = 0)]
    pub offset: i64,
}

impl Default for TimerFilter {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_timer(now: DateTime<Utc>) -> Timer {
        Timer {
            id: Uuid::new_v4(),
            timer_type: TimerType::Duration,
            expression: "PT5M".into(),
            due_date: now,
            repeat: false,
            repeat_interval_ms: None,
            max_executions: None,
            execution_count: 0,
            end_time: None,
            status: TimerStatus::Pending,
            callback_config: serde_json::json!({"type": "escalate"}),
            payload: Value::Null,
            retry_count: 0,
            max_retries: 3,
            lock_owner: None,
            lock_expires_at: None,
            process_instance_id: None,
            execution_id: None,
            activity_id: None,
            tenant_id: None,
            created_at: now,
            executed_at: None,
            next_execution_at: None,
        }
    }

    #[test]
    fn callback_type_reads_discriminator() {
        let timer = sample_timer(Utc::now());
        assert_eq!(timer.callback_type(), Some("escalate"));

        let mut bare = timer.clone();
        bare.callback_config = Value::Null;
        assert_eq!(bare.callback_type(), None);
    }

    #[test]
    fn due_timer_with_free_lock_is_due() {
        let now = Utc::now();
        let timer = sample_timer(now);
        assert!(timer.is_due(now));
    }

    #[test]
    fn future_timer_is_not_due() {
        let now = Utc::now();
        let mut timer = sample_timer(now);
        timer.due_date = now + Duration::minutes(1);
        assert!(!timer.is_due(now));
    }

    #[test]
    fn held_lock_blocks_due_until_expiry() {
        let now = Utc::now();
        let mut timer = sample_timer(now);
        timer.lock_owner = Some("worker-1".into());
        timer.lock_expires_at = Some(now + Duration::seconds(60));
        assert!(!timer.is_due(now));

        // Expired lock frees the row again.
        timer.lock_expires_at = Some(now - Duration::seconds(1));
        assert!(timer.is_due(now));
    }

    #[test]
    fn cancelled_timer_is_never_due() {
        let now = Utc::now();
        let mut timer = sample_timer(now);
        timer.status = TimerStatus::Cancelled;
        assert!(!timer.is_due(now));
    }

    #[test]
    fn repeat_budget() {
        let now = Utc::now();
        let mut timer = sample_timer(now);
        assert!(!timer.repeat_budget_spent());

        timer.max_executions = Some(3);
        timer.execution_count = 2;
        assert!(!timer.repeat_budget_spent());

        timer.execution_count = 3;
        assert!(timer.repeat_budget_spent());
    }
}
