//! Batch and batch-part records for fan-out work.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Lifecycle status of a batch aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "batch_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Lifecycle status of a single part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "batch_part_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BatchPartStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    /// Reachable only from `Pending`, via batch cancellation.
    Skipped,
}

/// An aggregate of homogeneous work items progressing together.
///
/// The counters are derived: after each part transition they are rewritten
/// from one aggregation query over the parts, never incremented in place.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: Uuid,
    pub batch_type: String,
    pub status: BatchStatus,
    pub total: i32,
    pub processed_total: i32,
    pub success_total: i32,
    pub fail_total: i32,
    pub priority: i32,
    /// Per-part retry budget.
    pub max_retries: i32,
    pub config: Value,
    pub error_message: Option<String>,
    pub tenant_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl Batch {
    /// Whether every part has reached a terminal state.
    pub fn is_fully_processed(&self) -> bool {
        self.processed_total >= self.total
    }
}

/// One leaf work item inside a batch.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct BatchPart {
    pub id: Uuid,
    pub batch_id: Uuid,
    /// Executor key; falls back to the parent's `batch_type` at creation.
    pub part_type: String,
    pub status: BatchPartStatus,
    pub data: Value,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub retry_count: i32,
    /// Earliest instant a retried part may be claimed again.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl BatchPart {
    /// Deserialize the part data into a typed struct.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone())
            .map_err(|e| anyhow!("failed to deserialize data for part {}: {}", self.id, e))
    }

    /// Whether this part is eligible for claiming at `now`: pending and
    /// past any retry backoff.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == BatchPartStatus::Pending
            && self.next_retry_at.map_or(true, |at| at <= now)
    }
}

/// One work item in a batch creation or append request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    /// Executor key override; None inherits the batch type.
    pub part_type: Option<String>,
    pub data: Value,
}

impl BatchItem {
    /// An item inheriting the batch's type.
    pub fn new(data: Value) -> Self {
        Self {
            part_type: None,
            data,
        }
    }

    /// An item with its own executor key.
    pub fn typed(part_type: impl Into<String>, data: Value) -> Self {
        Self {
            part_type: Some(part_type.into()),
            data,
        }
    }
}

/// Options for creating a batch, with or without initial parts.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct BatchSpec {
    pub batch_type: String,
    #[builder(default)]
    pub items: Vec<BatchItem>,
    #[builder(default = 50)]
    pub priority: i32,
    #[builder(default = 3)]
    pub max_retries: i32,
    #[builder(default = Value::Null)]
    pub config: Value,
    #[builder(default, setter(strip_option))]
    pub tenant_id: Option<String>,
}

/// Derived counters from one aggregation pass over a batch's parts.
#[derive(FromRow, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounters {
    pub total: i32,
    pub processed_total: i32,
    pub success_total: i32,
    pub fail_total: i32,
    pub skipped_total: i32,
    pub running: i32,
    pub pending: i32,
}

/// Filter for batch listings.
#[derive(Debug, Clone, TypedBuilder)]
pub struct BatchFilter {
    #[builder(default, setter(strip_option))]
    pub status: Option<BatchStatus>,
    #[builder(default, setter(strip_option))]
    pub batch_type: Option<String>,
    #[builder(default, setter(strip_option))]
    pub tenant_id: Option<String>,
    #[builder(default = 50)]
    pub limit: i64,
    #[builder(default = 0)]
    pub offset: i64,
}

impl Default for BatchFilter {
    fn default() -> Self {
        Self::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_defaults() {
        let spec = BatchSpec::builder().batch_type("reindex").build();
        assert_eq!(spec.priority, 50);
        assert_eq!(spec.max_retries, 3);
        assert!(spec.items.is_empty());
    }

    #[test]
    fn item_inherits_or_overrides_type() {
        let inherit = BatchItem::new(serde_json::json!({"k": 1}));
        assert!(inherit.part_type.is_none());

        let typed = BatchItem::typed("thumbnail", serde_json::json!({"k": 2}));
        assert_eq!(typed.part_type.as_deref(), Some("thumbnail"));
    }

    #[test]
    fn part_data_deserializes_at_handler_boundary() {
        #[derive(Deserialize)]
        struct Data {
            k: i32,
        }
        let part = BatchPart {
            id: Uuid::new_v4(),
            batch_id: Uuid::new_v4(),
            part_type: "t".into(),
            status: BatchPartStatus::Pending,
            data: serde_json::json!({"k": 7}),
            result: None,
            error_message: None,
            retry_count: 0,
            next_retry_at: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        };
        let data: Data = part.data_as().unwrap();
        assert_eq!(data.k, 7);
    }

    #[test]
    fn retry_backoff_gates_claimability() {
        let now = Utc::now();
        let mut part = BatchPart {
            id: Uuid::new_v4(),
            batch_id: Uuid::new_v4(),
            part_type: "t".into(),
            status: BatchPartStatus::Pending,
            data: Value::Null,
            result: None,
            error_message: None,
            retry_count: 1,
            next_retry_at: Some(now + chrono::Duration::seconds(10)),
            created_at: now,
            started_at: None,
            ended_at: None,
        };
        assert!(!part.is_claimable(now));
        assert!(part.is_claimable(now + chrono::Duration::seconds(10)));

        part.status = BatchPartStatus::Running;
        assert!(!part.is_claimable(now + chrono::Duration::seconds(10)));
    }
}
