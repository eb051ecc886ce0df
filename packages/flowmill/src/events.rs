//! In-process event bus and engine lifecycle events.
//!
//! # Guarantees
//!
//! - **At-most-once delivery**: slow receivers may miss events
//! - **In-memory only**: events are not persisted
//! - **No replay**: lagged receivers get `RecvError::Lagged`
//!
//! Events represent facts about work lifecycles, not commands. Emission is
//! synchronous with the causal persistence change; subscribers must not
//! throw back into the emitter (the bus cannot carry errors upstream).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Default channel capacity for the event bus.
const DEFAULT_CAPACITY: usize = 10_000;

/// Job lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    /// A job row was inserted with `status=pending`.
    Created {
        job_id: Uuid,
        job_type: String,
        priority: i32,
    },

    /// A worker claimed the job and began executing it.
    Started {
        job_id: Uuid,
        job_type: String,
        worker_id: String,
        retry_count: i32,
    },

    /// The handler returned successfully.
    Completed {
        job_id: Uuid,
        job_type: String,
        duration_ms: i64,
    },

    /// The handler failed.
    Failed {
        job_id: Uuid,
        job_type: String,
        error: String,
        retry_count: i32,
        will_retry: bool,
    },

    /// The job was returned to pending with a backoff delay.
    Retry {
        job_id: Uuid,
        job_type: String,
        retry_count: i32,
        next_retry_at: DateTime<Utc>,
    },

    /// The job exhausted its retry budget and moved to the dead letter.
    DeadLettered {
        job_id: Uuid,
        job_type: String,
        total_retries: i32,
        final_error: String,
    },
}

/// Timer lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TimerEvent {
    /// A timer row was created.
    Created {
        timer_id: Uuid,
        due_date: DateTime<Utc>,
    },

    /// A due timer fired its callback.
    Fired {
        timer_id: Uuid,
        execution_count: i32,
    },

    /// A repeating timer advanced to its next occurrence.
    Advanced {
        timer_id: Uuid,
        next_due: DateTime<Utc>,
    },

    /// The callback failed.
    Failed {
        timer_id: Uuid,
        error: String,
        will_retry: bool,
    },

    /// The timer was cancelled while pending.
    Cancelled { timer_id: Uuid },
}

/// Batch lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BatchEvent {
    /// A batch row (and its initial parts) was created.
    Created {
        batch_id: Uuid,
        batch_type: String,
        total: i32,
    },

    /// The batch left `pending` and began processing parts.
    Started { batch_id: Uuid },

    /// Counters were recomputed after part transitions.
    Progress {
        batch_id: Uuid,
        processed_total: i32,
        success_total: i32,
        fail_total: i32,
    },

    /// All parts are terminal; the batch finalized.
    Completed {
        batch_id: Uuid,
        success_total: i32,
        fail_total: i32,
    },

    /// The batch was cancelled; pending parts skipped.
    Cancelled { batch_id: Uuid, skipped: i32 },
}

/// Event subscription lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SubscriptionEvent {
    /// A subscription row was registered.
    Created {
        subscription_id: Uuid,
        event_name: String,
    },

    /// A trigger won the conditional update and consumed the subscription.
    Triggered {
        subscription_id: Uuid,
        event_name: String,
    },
}

/// All events flowing through the core bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CoreEvent {
    Job(JobEvent),
    Timer(TimerEvent),
    Batch(BatchEvent),
    Subscription(SubscriptionEvent),
}

impl From<JobEvent> for CoreEvent {
    fn from(event: JobEvent) -> Self {
        CoreEvent::Job(event)
    }
}

impl From<TimerEvent> for CoreEvent {
    fn from(event: TimerEvent) -> Self {
        CoreEvent::Timer(event)
    }
}

impl From<BatchEvent> for CoreEvent {
    fn from(event: BatchEvent) -> Self {
        CoreEvent::Batch(event)
    }
}

impl From<SubscriptionEvent> for CoreEvent {
    fn from(event: SubscriptionEvent) -> Self {
        CoreEvent::Subscription(event)
    }
}

/// Broadcast bus for engine lifecycle events.
///
/// Cloning shares the underlying channel; emitting is fire-and-forget and
/// never blocks the emitting engine.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// Create a bus with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus with a specific buffer capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers. Returns the receiver count.
    pub fn emit(&self, event: impl Into<CoreEvent>) -> usize {
        self.sender.send(event.into()).unwrap_or(0)
    }

    /// Subscribe to all events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emit_and_receive() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.emit(JobEvent::Created {
            job_id: Uuid::new_v4(),
            job_type: "test_job".into(),
            priority: 50,
        });

        match receiver.recv().await.unwrap() {
            CoreEvent::Job(JobEvent::Created { job_type, .. }) => {
                assert_eq!(job_type, "test_job");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        let count = bus.emit(TimerEvent::Cancelled {
            timer_id: Uuid::new_v4(),
        });
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        let count = bus.emit(BatchEvent::Started {
            batch_id: Uuid::new_v4(),
        });
        assert_eq!(count, 2);

        assert!(matches!(
            a.recv().await.unwrap(),
            CoreEvent::Batch(BatchEvent::Started { .. })
        ));
        assert!(matches!(
            b.recv().await.unwrap(),
            CoreEvent::Batch(BatchEvent::Started { .. })
        ));
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let bus = EventBus::new();
        bus.emit(SubscriptionEvent::Created {
            subscription_id: Uuid::new_v4(),
            event_name: "order_placed".into(),
        });

        let mut receiver = bus.subscribe();
        bus.emit(SubscriptionEvent::Triggered {
            subscription_id: Uuid::new_v4(),
            event_name: "order_placed".into(),
        });

        assert!(matches!(
            receiver.recv().await.unwrap(),
            CoreEvent::Subscription(SubscriptionEvent::Triggered { .. })
        ));
    }

    #[test]
    fn events_serialize() {
        let event: CoreEvent = JobEvent::DeadLettered {
            job_id: Uuid::new_v4(),
            job_type: "test".into(),
            total_retries: 3,
            final_error: "boom".into(),
        }
        .into();
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("DeadLettered"));
        let _: CoreEvent = serde_json::from_str(&json).unwrap();
    }
}
