//! Executor registry for dispatching work items to user code.
//!
//! The registry maps `type` strings to handlers for each work shape:
//! jobs, batch parts, timer callbacks, and event-subscription handlers.
//! Registration happens at wiring time; once the registry is wrapped in an
//! `Arc` and handed to the engines it is effectively sealed. A missing
//! handler is a defined error kind, never a panic: jobs dead-letter
//! immediately, batch parts fail, timers and events log a warning.
//!
//! Payloads stay `serde_json::Value` up to this boundary; handlers parse
//! them into typed structs via `payload_as` helpers on the records.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::batch::{Batch, BatchPart};
use crate::job::Job;
use crate::subscription::EventSubscription;

/// Boxed future returned by registered handlers.
pub type HandlerFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

type JobHandlerFn = Box<dyn Fn(Job) -> HandlerFuture<Result<Option<Value>>> + Send + Sync>;
type PartExecutorFn = Box<dyn Fn(BatchPart, Batch) -> HandlerFuture<PartOutcome> + Send + Sync>;
type TimerCallbackFn = Box<dyn Fn(TimerFireContext) -> HandlerFuture<Result<()>> + Send + Sync>;
type EventHandlerFn = Box<dyn Fn(EventSubscription, Value) -> HandlerFuture<Result<()>> + Send + Sync>;

/// Result of a batch-part execution.
#[derive(Debug, Clone)]
pub struct PartOutcome {
    /// Whether the part succeeded.
    pub success: bool,
    /// Result payload stored on the part when successful.
    pub result: Option<Value>,
    /// Error message stored on the part when failed.
    pub error: Option<String>,
}

impl PartOutcome {
    /// A successful outcome with no result payload.
    pub fn ok() -> Self {
        Self {
            success: true,
            result: None,
            error: None,
        }
    }

    /// A successful outcome carrying a result payload.
    pub fn ok_with(result: Value) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// A failed outcome with an error message.
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Context handed to a timer callback when the timer fires.
#[derive(Debug, Clone)]
pub struct TimerFireContext {
    pub timer_id: Uuid,
    pub payload: Value,
    pub process_instance_id: Option<String>,
    pub execution_id: Option<String>,
    pub activity_id: Option<String>,
    /// 1-based count of this firing.
    pub execution_count: i32,
    /// The instant the firing was due.
    pub due_date: DateTime<Utc>,
}

/// Process-wide mapping from `type` strings to handlers.
///
/// # Example
///
/// ```ignore
/// let mut registry = ExecutorRegistry::new();
/// registry.register_job_handler("send_email", |job| async move {
///     let req: EmailRequest = job.payload_as()?;
///     mailer.send(req).await?;
///     Ok(None)
/// });
/// let registry = Arc::new(registry); // sealed from here on
/// ```
#[derive(Default)]
pub struct ExecutorRegistry {
    job_handlers: HashMap<String, JobHandlerFn>,
    part_executors: HashMap<String, PartExecutorFn>,
    timer_callbacks: HashMap<String, TimerCallbackFn>,
    event_handlers: HashMap<String, EventHandlerFn>,
}

impl ExecutorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job handler for `handler_type`.
    pub fn register_job_handler<F, Fut>(&mut self, handler_type: impl Into<String>, handler: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        self.job_handlers
            .insert(handler_type.into(), Box::new(move |job| Box::pin(handler(job))));
    }

    /// Register a batch-part executor for `part_type`.
    pub fn register_part_executor<F, Fut>(&mut self, part_type: impl Into<String>, executor: F)
    where
        F: Fn(BatchPart, Batch) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = PartOutcome> + Send + 'static,
    {
        self.part_executors.insert(
            part_type.into(),
            Box::new(move |part, batch| Box::pin(executor(part, batch))),
        );
    }

    /// Register a timer callback for `callback_type`.
    pub fn register_timer_callback<F, Fut>(&mut self, callback_type: impl Into<String>, callback: F)
    where
        F: Fn(TimerFireContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.timer_callbacks.insert(
            callback_type.into(),
            Box::new(move |ctx| Box::pin(callback(ctx))),
        );
    }

    /// Register an event-subscription handler for `configuration_type`.
    pub fn register_event_handler<F, Fut>(&mut self, configuration_type: impl Into<String>, handler: F)
    where
        F: Fn(EventSubscription, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.event_handlers.insert(
            configuration_type.into(),
            Box::new(move |sub, payload| Box::pin(handler(sub, payload))),
        );
    }

    pub(crate) fn job_handler(&self, handler_type: &str) -> Option<&JobHandlerFn> {
        self.job_handlers.get(handler_type)
    }

    pub(crate) fn part_executor(&self, part_type: &str) -> Option<&PartExecutorFn> {
        self.part_executors.get(part_type)
    }

    pub(crate) fn timer_callback(&self, callback_type: &str) -> Option<&TimerCallbackFn> {
        self.timer_callbacks.get(callback_type)
    }

    pub(crate) fn event_handler(&self, configuration_type: &str) -> Option<&EventHandlerFn> {
        self.event_handlers.get(configuration_type)
    }

    /// Whether a job handler exists for `handler_type`.
    pub fn has_job_handler(&self, handler_type: &str) -> bool {
        self.job_handlers.contains_key(handler_type)
    }

    /// Whether a part executor exists for `part_type`.
    pub fn has_part_executor(&self, part_type: &str) -> bool {
        self.part_executors.contains_key(part_type)
    }

    /// Whether a timer callback exists for `callback_type`.
    pub fn has_timer_callback(&self, callback_type: &str) -> bool {
        self.timer_callbacks.contains_key(callback_type)
    }

    /// Whether an event handler exists for `configuration_type`.
    pub fn has_event_handler(&self, configuration_type: &str) -> bool {
        self.event_handlers.contains_key(configuration_type)
    }

    /// All registered job handler types.
    pub fn job_handler_types(&self) -> Vec<&str> {
        self.job_handlers.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("job_handlers", &self.job_handlers.keys().collect::<Vec<_>>())
            .field("part_executors", &self.part_executors.keys().collect::<Vec<_>>())
            .field("timer_callbacks", &self.timer_callbacks.keys().collect::<Vec<_>>())
            .field("event_handlers", &self.event_handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Registry handle shared by the engines. Wrapping in `Arc` seals it.
pub type SharedExecutorRegistry = Arc<ExecutorRegistry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_check_job_handler() {
        let mut registry = ExecutorRegistry::new();
        registry.register_job_handler("send_email", |_job| async move { Ok(None) });

        assert!(registry.has_job_handler("send_email"));
        assert!(!registry.has_job_handler("unknown"));
    }

    #[test]
    fn register_and_check_part_executor() {
        let mut registry = ExecutorRegistry::new();
        registry.register_part_executor("resize_image", |_part, _batch| async move {
            PartOutcome::ok()
        });

        assert!(registry.has_part_executor("resize_image"));
    }

    #[test]
    fn register_and_check_timer_callback() {
        let mut registry = ExecutorRegistry::new();
        registry.register_timer_callback("escalate", |_ctx| async move { Ok(()) });

        assert!(registry.has_timer_callback("escalate"));
        assert!(!registry.has_timer_callback("job"));
    }

    #[test]
    fn part_outcome_constructors() {
        assert!(PartOutcome::ok().success);
        let with = PartOutcome::ok_with(serde_json::json!({"n": 1}));
        assert!(with.success);
        assert!(with.result.is_some());

        let failed = PartOutcome::fail("boom");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn debug_lists_registered_types() {
        let mut registry = ExecutorRegistry::new();
        registry.register_event_handler("wake_process", |_sub, _payload| async move { Ok(()) });
        let debug = format!("{registry:?}");
        assert!(debug.contains("wake_process"));
    }
}
