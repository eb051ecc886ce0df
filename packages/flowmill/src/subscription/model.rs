//! Event subscription records: durable registrations that convert named
//! incoming signals and messages into targeted wakeups.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Kind of event a subscription listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "event_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Message,
    Signal,
    Conditional,
    Compensation,
    Error,
    Timer,
    Escalation,
}

/// A durable registration for a named incoming event.
///
/// `(event_type, event_name, is_processed=false)` is the hot lookup key;
/// the `is_processed` transition is monotonic and guarded by a row-level
/// conditional update, so a subscription fires at most once.
#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct EventSubscription {
    pub id: Uuid,
    pub event_type: EventType,
    pub event_name: String,
    pub process_instance_id: Option<String>,
    pub execution_id: Option<String>,
    pub activity_id: Option<String>,
    /// Selects the registered event handler on dispatch.
    pub configuration_type: String,
    pub configuration: Value,
    pub priority: i32,
    pub is_processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub callback_id: Option<String>,
    pub tenant_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Options for registering a subscription.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct SubscriptionSpec {
    pub event_type: EventType,
    pub event_name: String,
    #[builder(default = "default".to_string())]
    pub configuration_type: String,
    #[builder(default = Value::Null)]
    pub configuration: Value,
    #[builder(default = 50)]
    pub priority: i32,
    #[builder(default, setter(strip_option))]
    pub process_instance_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub execution_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub activity_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub callback_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub tenant_id: Option<String>,
}

impl SubscriptionSpec {
    /// Shorthand for a message subscription scoped to a process instance.
    pub fn message(event_name: impl Into<String>, process_instance_id: impl Into<String>) -> Self {
        Self::builder()
            .event_type(EventType::Message)
            .event_name(event_name)
            .process_instance_id(process_instance_id)
            .build()
    }

    /// Shorthand for a broadcast signal subscription.
    pub fn signal(event_name: impl Into<String>) -> Self {
        Self::builder()
            .event_type(EventType::Signal)
            .event_name(event_name)
            .build()
    }
}
