//! Timer engine: due-date-driven firings, single-shot and repeating.
//!
//! ```text
//! create_timer ──► pending ──due──► claim ──► callback
//!                     ▲                          │
//!                     │ advance (repeat)         │
//!                     └──────────────────────────┼──► executed (terminal)
//!                                                └──► retry / failed
//! ```
//!
//! A cancellation that lands after a tick has claimed the row loses that
//! firing: the claimed execution completes naturally. Callbacks must
//! tolerate one extra invocation after cancellation.

use std::sync::Arc;

use chrono::Duration;
use futures::future::join_all;
use tracing::{debug, warn};
use uuid::Uuid;

use super::expression::TimerExpression;
use super::model::{Timer, TimerFilter, TimerSpec, TimerStatus};
use super::store::TimerStore;
use crate::clock::SharedClock;
use crate::config::TimerEngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, TimerEvent};
use crate::executor::{SharedExecutorRegistry, TimerFireContext};
use crate::job::{JobEngine, JobSpec};

/// Callback type that promotes a firing into a job.
const JOB_PROMOTION_TYPE: &str = "job";

/// What happened to a timer on an execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    /// Callback ran; the timer advanced to its next occurrence.
    FiredAndAdvanced,
    /// Callback ran; the timer reached a terminal `executed` state.
    FiredAndCompleted,
    /// The row was not pending or the claim was lost.
    Skipped,
    /// Callback failed; a retry was scheduled.
    Retried,
    /// Callback failed with the retry budget spent.
    Failed,
}

/// Engine driving timer creation, due-scans, firing, and repetition.
pub struct TimerEngine {
    store: Arc<dyn TimerStore>,
    executors: SharedExecutorRegistry,
    bus: EventBus,
    clock: SharedClock,
    config: TimerEngineConfig,
    /// Set at wiring time to enable the built-in `"job"` callback type.
    job_engine: Option<Arc<JobEngine>>,
}

impl TimerEngine {
    /// Wire an engine from its collaborators.
    pub fn new(
        store: Arc<dyn TimerStore>,
        executors: SharedExecutorRegistry,
        bus: EventBus,
        clock: SharedClock,
        config: TimerEngineConfig,
    ) -> Self {
        Self {
            store,
            executors,
            bus,
            clock,
            config,
            job_engine: None,
        }
    }

    /// Enable timer-to-job promotion through the given job engine.
    pub fn with_job_promotion(mut self, job_engine: Arc<JobEngine>) -> Self {
        self.job_engine = Some(job_engine);
        self
    }

    /// The underlying store (for the statistics aggregator).
    pub fn store(&self) -> Arc<dyn TimerStore> {
        Arc::clone(&self.store)
    }

    /// Parse the expression, compute the initial due date, and persist the
    /// timer. A due date at or before now makes it immediately eligible;
    /// a due date past `end_time` inserts the timer already executed.
    pub async fn create_timer(&self, spec: TimerSpec) -> EngineResult<Timer> {
        let expression = TimerExpression::parse(&spec.expression)?;
        let now = self.clock.now();
        let due_date = expression.initial_due(now)?;

        let max_executions = spec
            .max_executions
            .or_else(|| expression.repeat_count().map(|count| count as i32));
        let past_end = spec.end_time.map_or(false, |end| due_date > end);

        let timer = Timer {
            id: Uuid::new_v4(),
            timer_type: expression.timer_type(),
            expression: spec.expression,
            due_date,
            repeat: expression.is_repeating(),
            repeat_interval_ms: expression.fixed_interval_ms(),
            max_executions,
            execution_count: 0,
            end_time: spec.end_time,
            status: if past_end {
                TimerStatus::Executed
            } else {
                TimerStatus::Pending
            },
            callback_config: spec.callback_config,
            payload: spec.payload,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(3),
            lock_owner: None,
            lock_expires_at: None,
            process_instance_id: spec.process_instance_id,
            execution_id: spec.execution_id,
            activity_id: spec.activity_id,
            tenant_id: spec.tenant_id,
            created_at: now,
            executed_at: None,
            next_execution_at: None,
        };

        let timer = self.store.insert(timer).await?;
        debug!(timer_id = %timer.id, due_date = %timer.due_date, "timer created");
        self.bus.emit(TimerEvent::Created {
            timer_id: timer.id,
            due_date: timer.due_date,
        });
        Ok(timer)
    }

    /// Due pending timers with a free lock, earliest first.
    pub async fn get_due_timers(&self, limit: i64) -> EngineResult<Vec<Timer>> {
        let now = self.clock.now();
        Ok(self.store.due_timers(limit, now).await?)
    }

    /// Scheduler phase: fetch due timers and execute them concurrently.
    /// Returns how many firings ran (advanced or completed).
    pub async fn fire_due(&self, worker_id: &str) -> EngineResult<usize> {
        let due = self.get_due_timers(self.config.due_scan_limit).await?;
        let outcomes = join_all(
            due.iter()
                .map(|timer| self.execute_timer(timer.id, worker_id)),
        )
        .await;

        let mut fired = 0;
        for outcome in outcomes {
            match outcome {
                Ok(TimerOutcome::FiredAndAdvanced) | Ok(TimerOutcome::FiredAndCompleted) => {
                    fired += 1
                }
                Ok(_) => {}
                Err(error) => warn!(error = %error, "timer execution failed"),
            }
        }
        Ok(fired)
    }

    /// Claim and fire one timer.
    ///
    /// The claim is the lock arbiter: losing it (or finding the row no
    /// longer pending) is a silent skip. Callback errors retry with
    /// exponential backoff up to `max_retries`, then mark the timer failed.
    pub async fn execute_timer(&self, id: Uuid, worker_id: &str) -> EngineResult<TimerOutcome> {
        let timer = self
            .store
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::not_found("timer", id))?;

        if timer.status != TimerStatus::Pending {
            return Ok(TimerOutcome::Skipped);
        }

        let now = self.clock.now();
        if !self
            .store
            .try_claim(id, worker_id, self.config.lock_ttl_ms, now)
            .await?
        {
            return Ok(TimerOutcome::Skipped);
        }

        match self.dispatch_callback(&timer).await {
            Ok(()) => self.advance_or_complete(&timer).await,
            Err(error) => {
                warn!(timer_id = %timer.id, error = %error, "timer callback failed");
                self.retry_or_fail(&timer, &error.to_string()).await
            }
        }
    }

    /// Cancel a pending timer. Idempotent: cancelling a timer that is
    /// already cancelled (or otherwise terminal) is a no-op returning false.
    pub async fn cancel_timer(&self, id: Uuid) -> EngineResult<bool> {
        // Existence check so an unknown id still surfaces NotFound.
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::not_found("timer", id))?;

        let cancelled = self.store.cancel(id).await?;
        if cancelled {
            self.bus.emit(TimerEvent::Cancelled { timer_id: id });
        }
        Ok(cancelled)
    }

    /// Cancel all pending timers of a process instance.
    pub async fn cancel_timers_by_process_instance(
        &self,
        process_instance_id: &str,
    ) -> EngineResult<u64> {
        Ok(self
            .store
            .cancel_by_process_instance(process_instance_id)
            .await?)
    }

    /// Cancel all pending timers of an execution.
    pub async fn cancel_timers_by_execution(&self, execution_id: &str) -> EngineResult<u64> {
        Ok(self.store.cancel_by_execution(execution_id).await?)
    }

    /// Lock sweeper pass for timers.
    pub async fn release_expired_locks(&self) -> EngineResult<u64> {
        let now = self.clock.now();
        Ok(self.store.release_expired_locks(now).await?)
    }

    /// Retention pass: drop terminal timers older than the window.
    pub async fn cleanup_finished(&self) -> EngineResult<u64> {
        let cutoff = self.clock.now() - Duration::days(self.config.retention_days);
        Ok(self.store.delete_terminal_before(cutoff).await?)
    }

    /// Find a timer by id.
    pub async fn find_timer(&self, id: Uuid) -> EngineResult<Timer> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::not_found("timer", id))
    }

    /// Paginated, filtered timer listing.
    pub async fn list_timers(&self, filter: TimerFilter) -> EngineResult<Vec<Timer>> {
        Ok(self.store.list(filter).await?)
    }

    /// Route the firing to its callback.
    ///
    /// The `"job"` callback type promotes the firing into a pending job.
    /// A missing or unregistered callback is a warning, not an error: the
    /// firing is consumed so the timer still advances.
    async fn dispatch_callback(&self, timer: &Timer) -> anyhow::Result<()> {
        match timer.callback_type() {
            Some(JOB_PROMOTION_TYPE) => self.promote_to_job(timer).await,
            Some(callback_type) => match self.executors.timer_callback(callback_type) {
                Some(callback) => {
                    let context = TimerFireContext {
                        timer_id: timer.id,
                        payload: timer.payload.clone(),
                        process_instance_id: timer.process_instance_id.clone(),
                        execution_id: timer.execution_id.clone(),
                        activity_id: timer.activity_id.clone(),
                        execution_count: timer.execution_count + 1,
                        due_date: timer.due_date,
                    };
                    callback(context).await
                }
                None => {
                    warn!(
                        timer_id = %timer.id,
                        callback_type,
                        "no timer callback registered, firing is a no-op"
                    );
                    Ok(())
                }
            },
            None => {
                warn!(timer_id = %timer.id, "timer has no callback type, firing is a no-op");
                Ok(())
            }
        }
    }

    /// Timer-to-job promotion: create a pending job carrying the timer's
    /// payload and correlation ids.
    async fn promote_to_job(&self, timer: &Timer) -> anyhow::Result<()> {
        let Some(job_engine) = &self.job_engine else {
            warn!(timer_id = %timer.id, "job promotion not wired, firing is a no-op");
            return Ok(());
        };
        let Some(job_type) = timer
            .callback_config
            .get("job_type")
            .and_then(serde_json::Value::as_str)
        else {
            warn!(timer_id = %timer.id, "job promotion config has no job_type, firing is a no-op");
            return Ok(());
        };

        let mut spec = JobSpec::builder()
            .job_type(job_type)
            .payload(timer.payload.clone())
            .build();
        spec.process_instance_id = timer.process_instance_id.clone();
        spec.execution_id = timer.execution_id.clone();
        spec.tenant_id = timer.tenant_id.clone();

        let job = job_engine.create_job(spec).await?;
        debug!(timer_id = %timer.id, job_id = %job.id, "timer promoted to job");
        Ok(())
    }

    /// After a successful firing: advance a repeating timer or terminate.
    async fn advance_or_complete(&self, timer: &Timer) -> EngineResult<TimerOutcome> {
        let now = self.clock.now();
        let count_after = timer.execution_count + 1;
        self.bus.emit(TimerEvent::Fired {
            timer_id: timer.id,
            execution_count: count_after,
        });

        let budget_spent = timer
            .max_executions
            .map_or(false, |max| count_after >= max);
        let next_due = if budget_spent {
            None
        } else {
            TimerExpression::parse(&timer.expression)
                .ok()
                .and_then(|expression| expression.next_due(now))
        };
        let past_end = |due| timer.end_time.map_or(false, |end| due > end);

        match next_due {
            Some(due) if !past_end(due) => {
                self.store.finish_fire_advance(timer.id, due, now).await?;
                self.bus.emit(TimerEvent::Advanced {
                    timer_id: timer.id,
                    next_due: due,
                });
                Ok(TimerOutcome::FiredAndAdvanced)
            }
            _ => {
                self.store.finish_fire_complete(timer.id, now).await?;
                Ok(TimerOutcome::FiredAndCompleted)
            }
        }
    }

    /// After a callback failure: retry at `now + 2^retry_count` seconds
    /// while the budget allows, else mark the timer failed.
    async fn retry_or_fail(&self, timer: &Timer, error: &str) -> EngineResult<TimerOutcome> {
        let now = self.clock.now();
        let attempt = timer.retry_count + 1;
        let will_retry = attempt < timer.max_retries;

        self.bus.emit(TimerEvent::Failed {
            timer_id: timer.id,
            error: error.to_string(),
            will_retry,
        });

        if will_retry {
            let delay = Duration::seconds(2i64.saturating_pow(attempt.max(0) as u32).min(3_600));
            self.store.schedule_retry(timer.id, now + delay).await?;
            Ok(TimerOutcome::Retried)
        } else {
            self.store.mark_failed(timer.id, now).await?;
            Ok(TimerOutcome::Failed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::executor::ExecutorRegistry;
    use crate::timer::memory::MemoryTimerStore;

    fn engine(clock: Arc<ManualClock>) -> TimerEngine {
        TimerEngine::new(
            Arc::new(MemoryTimerStore::new()),
            Arc::new(ExecutorRegistry::new()),
            EventBus::new(),
            clock,
            TimerEngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn duration_timer_becomes_due_after_offset() {
        let clock = Arc::new(ManualClock::starting_now());
        let engine = engine(clock.clone());

        let timer = engine
            .create_timer(TimerSpec::for_expression("PT5M"))
            .await
            .unwrap();
        assert_eq!(timer.status, TimerStatus::Pending);
        assert!(engine.get_due_timers(10).await.unwrap().is_empty());

        clock.advance(Duration::minutes(5));
        let due = engine.get_due_timers(10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, timer.id);
    }

    #[tokio::test]
    async fn invalid_expression_is_surfaced() {
        let clock = Arc::new(ManualClock::starting_now());
        let engine = engine(clock);
        let result = engine.create_timer(TimerSpec::for_expression("whenever")).await;
        assert!(matches!(result, Err(EngineError::Expression { .. })));
    }

    #[tokio::test]
    async fn timer_past_end_time_is_born_executed() {
        let clock = Arc::new(ManualClock::starting_now());
        let end = clock.now() + Duration::minutes(1);
        let engine = engine(clock);

        let timer = engine
            .create_timer(TimerSpec::builder().expression("PT5M").end_time(end).build())
            .await
            .unwrap();
        assert_eq!(timer.status, TimerStatus::Executed);
    }

    #[tokio::test]
    async fn bounded_cycle_inherits_repeat_count() {
        let clock = Arc::new(ManualClock::starting_now());
        let engine = engine(clock);
        let timer = engine
            .create_timer(TimerSpec::for_expression("R3/PT1M"))
            .await
            .unwrap();
        assert!(timer.repeat);
        assert_eq!(timer.max_executions, Some(3));
        assert_eq!(timer.repeat_interval_ms, Some(60_000));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_checks_existence() {
        let clock = Arc::new(ManualClock::starting_now());
        let engine = engine(clock);
        let timer = engine
            .create_timer(TimerSpec::for_expression("PT1M"))
            .await
            .unwrap();

        assert!(engine.cancel_timer(timer.id).await.unwrap());
        assert!(!engine.cancel_timer(timer.id).await.unwrap());
        assert!(matches!(
            engine.cancel_timer(Uuid::new_v4()).await,
            Err(EngineError::NotFound { .. })
        ));
    }
}
