//! Job records for deferred asynchronous work.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::config::RetryBackoff;

/// Lifecycle status of a job.
///
/// `Failed` is a transient marker: a failed job is either returned to
/// `Pending` by a retry or moved out to the dead letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

/// A single unit of deferred asynchronous work with a retry policy.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub status: JobStatus,
    pub priority: i32,
    pub retry_count: i32,
    pub max_retries: i32,
    pub retry_wait_ms: i64,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub due_date: Option<DateTime<Utc>>,
    pub lock_owner: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub payload: Value,
    /// Executor-registry key; defaults to `job_type` at creation.
    pub handler_type: String,
    pub handler_config: Value,
    pub process_instance_id: Option<String>,
    pub execution_id: Option<String>,
    pub exception_message: Option<String>,
    pub exception_stack: Option<String>,
    pub tenant_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether this job is eligible for acquisition at `now`.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Pending {
            return false;
        }
        if let Some(next_retry) = self.next_retry_at {
            if next_retry > now {
                return false;
            }
        }
        match self.due_date {
            None => true,
            Some(due) => due <= now,
        }
    }

    /// Deserialize the payload into a typed struct.
    ///
    /// Payloads are opaque JSON up to this point; the `handler_type`
    /// discriminates the schema.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| anyhow!("failed to deserialize payload for job {}: {}", self.id, e))
    }

    /// Backoff delay before retry attempt number `attempt` (1-based).
    ///
    /// Capped at one hour so runaway exponents stay bounded.
    pub fn retry_delay(&self, backoff: RetryBackoff, attempt: i32) -> Duration {
        let wait_ms = match backoff {
            RetryBackoff::Exponential => {
                let factor = 2i64.saturating_pow(attempt.max(0) as u32);
                self.retry_wait_ms.saturating_mul(factor)
            }
            RetryBackoff::Fixed => self.retry_wait_ms,
        };
        Duration::milliseconds(wait_ms.min(3_600_000))
    }
}

/// Failure detail recorded on a job row.
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub message: String,
    pub stack: Option<String>,
}

impl JobFailure {
    /// Build from a handler error, keeping the full chain as the stack.
    pub fn from_error(error: &anyhow::Error) -> Self {
        Self {
            message: error.to_string(),
            stack: Some(format!("{error:?}")),
        }
    }

    /// Build from a bare message with no stack.
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }
}

/// Options for creating a job. Unset fields fall back to the engine's
/// configured defaults.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobSpec {
    /// The job type (must match a registered handler unless `handler_type`
    /// is given).
    pub job_type: String,
    #[builder(default = Value::Null)]
    pub payload: Value,
    /// Executor-registry key; defaults to `job_type`.
    #[builder(default, setter(strip_option))]
    pub handler_type: Option<String>,
    #[builder(default = Value::Null)]
    pub handler_config: Value,
    #[builder(default, setter(strip_option))]
    pub priority: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub max_retries: Option<i32>,
    #[builder(default, setter(strip_option))]
    pub retry_wait_ms: Option<i64>,
    /// Earliest instant the job may run. None means immediately.
    #[builder(default, setter(strip_option))]
    pub due_date: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub process_instance_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub execution_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub tenant_id: Option<String>,
}

impl JobSpec {
    /// Shorthand for an immediate job with a payload.
    pub fn immediate(job_type: impl Into<String>, payload: Value) -> Self {
        Self::builder().job_type(job_type).payload(payload).build()
    }
}

/// Terminal sink row for a job that exhausted its retry budget.
///
/// Moving a job here deletes the original row; `source_job_id` preserves
/// the original identity and `replay_count` tracks re-queues.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterJob {
    pub id: Uuid,
    pub source_job_id: Uuid,
    pub job_type: String,
    pub handler_type: String,
    pub handler_config: Value,
    pub payload: Value,
    pub priority: i32,
    pub total_retries: i32,
    pub replay_count: i32,
    pub exception_message: Option<String>,
    pub exception_stack: Option<String>,
    pub process_instance_id: Option<String>,
    pub execution_id: Option<String>,
    pub tenant_id: Option<String>,
    /// Creation instant of the original job.
    pub created_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Filter for paginated job listings.
#[derive(Debug, Clone, TypedBuilder)]
pub struct JobFilter {
    #[builder(default, setter(strip_option))]
    pub status: Option<JobStatus>,
    #[builder(default, setter(strip_option))]
    pub job_type: Option<String>,
    #[builder(default, setter(strip_option))]
    pub tenant_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub process_instance_id: Option<String>,
    #[builder(default = 50)]
    pub limit: i64,
    #[builder(default = 0)]
    pub offset: i64,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self::builder().build()
    }
}
