//! Job engine: lifecycle of transient jobs.
//!
//! ```text
//! create_job ──► pending ──claim──► running ──► completed
//!                   ▲                  │
//!                   │  retry (backoff) │ handler error
//!                   └──────────────────┤
//!                                      └──► dead letter (budget exhausted
//!                                           or handler missing)
//! ```
//!
//! Handler failures are internalised: they land on the row (exception
//! columns) or in the dead-letter sink, never on the caller. Lock expiry
//! makes a job re-eligible with `retry_count` unchanged, so a second
//! worker may re-execute it — handlers must be idempotent.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use super::model::{DeadLetterJob, Job, JobFailure, JobFilter, JobSpec, JobStatus};
use super::store::JobStore;
use crate::clock::SharedClock;
use crate::config::JobEngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, JobEvent};
use crate::executor::SharedExecutorRegistry;

/// What happened to a job after execution or an explicit retry request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Handler returned successfully.
    Completed,
    /// Returned to pending with a backoff delay.
    Retried,
    /// Moved to the dead-letter sink.
    DeadLettered,
}

/// Engine driving job creation, acquisition, execution, and retry.
pub struct JobEngine {
    store: Arc<dyn JobStore>,
    executors: SharedExecutorRegistry,
    bus: EventBus,
    clock: SharedClock,
    config: JobEngineConfig,
}

impl JobEngine {
    /// Wire an engine from its collaborators.
    pub fn new(
        store: Arc<dyn JobStore>,
        executors: SharedExecutorRegistry,
        bus: EventBus,
        clock: SharedClock,
        config: JobEngineConfig,
    ) -> Self {
        Self {
            store,
            executors,
            bus,
            clock,
            config,
        }
    }

    /// The underlying store (for the statistics aggregator).
    pub fn store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.store)
    }

    /// Insert a new pending job, filling unset spec fields from config
    /// defaults. Emits `job.created`.
    pub async fn create_job(&self, spec: JobSpec) -> EngineResult<Job> {
        let now = self.clock.now();
        let job = Job {
            id: Uuid::new_v4(),
            handler_type: spec.handler_type.unwrap_or_else(|| spec.job_type.clone()),
            job_type: spec.job_type,
            status: JobStatus::Pending,
            priority: spec.priority.unwrap_or(self.config.default_priority),
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(self.config.default_max_retries),
            retry_wait_ms: spec
                .retry_wait_ms
                .unwrap_or(self.config.default_retry_wait_ms),
            next_retry_at: None,
            due_date: spec.due_date,
            lock_owner: None,
            lock_expires_at: None,
            payload: spec.payload,
            handler_config: spec.handler_config,
            process_instance_id: spec.process_instance_id,
            execution_id: spec.execution_id,
            exception_message: None,
            exception_stack: None,
            tenant_id: spec.tenant_id,
            created_at: now,
            started_at: None,
            ended_at: None,
        };

        let job = self.store.insert(job).await?;
        debug!(job_id = %job.id, job_type = %job.job_type, "job created");
        self.bus.emit(JobEvent::Created {
            job_id: job.id,
            job_type: job.job_type.clone(),
            priority: job.priority,
        });
        Ok(job)
    }

    /// Claim up to `max` acquirable jobs for `worker_id`, highest priority
    /// first. Only successfully claimed jobs are returned; rows lost to a
    /// concurrent claimant are silently skipped.
    pub async fn acquire_jobs(&self, worker_id: &str, max: i64) -> EngineResult<Vec<Job>> {
        let now = self.clock.now();
        let candidates = self.store.fetch_claimable(max, now).await?;
        let mut claimed = Vec::with_capacity(candidates.len());

        for mut job in candidates {
            if self
                .store
                .try_claim(job.id, worker_id, self.config.lock_ttl_ms, now)
                .await?
            {
                job.status = JobStatus::Running;
                job.lock_owner = Some(worker_id.to_string());
                job.lock_expires_at =
                    Some(now + chrono::Duration::milliseconds(self.config.lock_ttl_ms));
                job.started_at.get_or_insert(now);

                self.bus.emit(JobEvent::Started {
                    job_id: job.id,
                    job_type: job.job_type.clone(),
                    worker_id: worker_id.to_string(),
                    retry_count: job.retry_count,
                });
                claimed.push(job);
            }
        }

        Ok(claimed)
    }

    /// Execute a claimed job through its registered handler.
    ///
    /// A missing handler dead-letters the job immediately; a handler error
    /// retries with exponential backoff until the budget is spent. Neither
    /// surfaces to the caller.
    pub async fn execute_job(&self, id: Uuid) -> EngineResult<JobOutcome> {
        let job = self
            .store
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::not_found("job", id))?;

        let Some(handler) = self.executors.job_handler(&job.handler_type) else {
            warn!(
                job_id = %job.id,
                handler_type = %job.handler_type,
                "no executor registered, dead-lettering job"
            );
            let failure = JobFailure::message(format!(
                "no executor registered for type {}",
                job.handler_type
            ));
            return self.dead_letter(&job, &failure).await;
        };

        match handler(job.clone()).await {
            Ok(result) => {
                let now = self.clock.now();
                self.store.mark_completed(job.id, now).await?;
                if let Some(result) = result {
                    debug!(job_id = %job.id, %result, "job handler returned result");
                }
                let duration_ms = job
                    .started_at
                    .map(|started| (now - started).num_milliseconds())
                    .unwrap_or(0);
                self.bus.emit(JobEvent::Completed {
                    job_id: job.id,
                    job_type: job.job_type.clone(),
                    duration_ms,
                });
                Ok(JobOutcome::Completed)
            }
            Err(error) => {
                warn!(job_id = %job.id, job_type = %job.job_type, error = %error, "job handler failed");
                let failure = JobFailure::from_error(&error);
                self.retry_or_dead_letter(&job, &failure).await
            }
        }
    }

    /// Explicitly retry a job, reusing the exception already stored on the
    /// row. Returns `Retried` or `DeadLettered`.
    pub async fn retry_job(&self, id: Uuid) -> EngineResult<JobOutcome> {
        let job = self
            .store
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::not_found("job", id))?;

        let failure = JobFailure {
            message: job
                .exception_message
                .clone()
                .unwrap_or_else(|| "retry requested".to_string()),
            stack: job.exception_stack.clone(),
        };
        self.retry_or_dead_letter(&job, &failure).await
    }

    /// Re-queue a dead-letter row as a fresh pending job.
    pub async fn retry_dead_letter_job(&self, id: Uuid) -> EngineResult<Job> {
        let now = self.clock.now();
        let job = self
            .store
            .requeue_dead_letter(id, now)
            .await?
            .ok_or_else(|| EngineError::not_found("dead-letter job", id))?;

        self.bus.emit(JobEvent::Created {
            job_id: job.id,
            job_type: job.job_type.clone(),
            priority: job.priority,
        });
        Ok(job)
    }

    /// Cancel a pending job. Returns whether a row was removed; running
    /// jobs are left to finish.
    pub async fn cancel_job(&self, id: Uuid) -> EngineResult<bool> {
        Ok(self.store.delete_pending(id).await?)
    }

    /// Heartbeat for a long-running handler: push the lock expiry out by
    /// one TTL so the sweeper does not reap live work.
    pub async fn extend_lock(&self, id: Uuid) -> EngineResult<bool> {
        let now = self.clock.now();
        Ok(self
            .store
            .extend_lock(id, self.config.lock_ttl_ms, now)
            .await?)
    }

    /// Lock sweeper pass: return expired running jobs to pending with
    /// `retry_count` unchanged.
    pub async fn release_expired_locks(&self) -> EngineResult<u64> {
        let now = self.clock.now();
        let released = self.store.release_expired_locks(now).await?;
        if released > 0 {
            warn!(count = released, "released expired job locks");
        }
        Ok(released)
    }

    /// Retention pass: drop completed jobs older than the configured window.
    pub async fn cleanup_finished(&self) -> EngineResult<u64> {
        let cutoff = self.clock.now() - chrono::Duration::days(self.config.retention_days);
        Ok(self.store.delete_terminal_before(cutoff).await?)
    }

    /// Find a job by id.
    pub async fn find_job(&self, id: Uuid) -> EngineResult<Job> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::not_found("job", id))
    }

    /// Paginated, filtered job listing.
    pub async fn list_jobs(&self, filter: JobFilter) -> EngineResult<Vec<Job>> {
        Ok(self.store.list(filter).await?)
    }

    /// List dead-letter rows, newest first.
    pub async fn list_dead_letters(
        &self,
        limit: i64,
        offset: i64,
    ) -> EngineResult<Vec<DeadLetterJob>> {
        Ok(self.store.list_dead_letters(limit, offset).await?)
    }

    /// Retry with backoff if budget remains, otherwise dead-letter.
    async fn retry_or_dead_letter(
        &self,
        job: &Job,
        failure: &JobFailure,
    ) -> EngineResult<JobOutcome> {
        let will_retry = job.retry_count < job.max_retries;
        self.bus.emit(JobEvent::Failed {
            job_id: job.id,
            job_type: job.job_type.clone(),
            error: failure.message.clone(),
            retry_count: job.retry_count,
            will_retry,
        });

        if will_retry {
            let now = self.clock.now();
            let attempt = job.retry_count + 1;
            let next_retry_at = now + job.retry_delay(self.config.backoff, attempt);
            self.store
                .schedule_retry(job.id, failure, next_retry_at)
                .await?;
            self.bus.emit(JobEvent::Retry {
                job_id: job.id,
                job_type: job.job_type.clone(),
                retry_count: attempt,
                next_retry_at,
            });
            Ok(JobOutcome::Retried)
        } else {
            self.dead_letter(job, failure).await
        }
    }

    /// Record the transient failed marker, then move the row out.
    async fn dead_letter(&self, job: &Job, failure: &JobFailure) -> EngineResult<JobOutcome> {
        let now = self.clock.now();
        self.store.mark_failed(job.id, failure, now).await?;
        self.store.move_to_dead_letter(job, failure, now).await?;
        self.bus.emit(JobEvent::DeadLettered {
            job_id: job.id,
            job_type: job.job_type.clone(),
            total_retries: job.retry_count,
            final_error: failure.message.clone(),
        });
        Ok(JobOutcome::DeadLettered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::executor::ExecutorRegistry;
    use crate::job::memory::MemoryJobStore;

    fn engine_with(registry: ExecutorRegistry) -> JobEngine {
        JobEngine::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(registry),
            EventBus::new(),
            Arc::new(SystemClock),
            JobEngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn create_applies_config_defaults() {
        let engine = engine_with(ExecutorRegistry::new());
        let job = engine
            .create_job(JobSpec::immediate("send_email", serde_json::json!({})))
            .await
            .unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, 50);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.retry_wait_ms, 5_000);
        assert_eq!(job.handler_type, "send_email");
    }

    #[tokio::test]
    async fn missing_handler_dead_letters_immediately() {
        let engine = engine_with(ExecutorRegistry::new());
        let job = engine
            .create_job(JobSpec::immediate("no_such_handler", serde_json::Value::Null))
            .await
            .unwrap();

        let claimed = engine.acquire_jobs("worker-1", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);

        let outcome = engine.execute_job(job.id).await.unwrap();
        assert_eq!(outcome, JobOutcome::DeadLettered);

        // The original row is gone.
        assert!(matches!(
            engine.find_job(job.id).await,
            Err(EngineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn execute_unknown_id_surfaces_not_found() {
        let engine = engine_with(ExecutorRegistry::new());
        let result = engine.execute_job(Uuid::new_v4()).await;
        assert!(matches!(result, Err(EngineError::NotFound { .. })));
    }

    #[tokio::test]
    async fn acquire_respects_backoff_schedule() {
        let clock = Arc::new(ManualClock::starting_now());
        let mut registry = ExecutorRegistry::new();
        registry.register_job_handler("flaky", |_job| async move {
            Err(anyhow::anyhow!("always fails"))
        });
        let engine = JobEngine::new(
            Arc::new(MemoryJobStore::new()),
            Arc::new(registry),
            EventBus::new(),
            clock.clone(),
            JobEngineConfig::default(),
        );

        let job = engine
            .create_job(
                JobSpec::builder()
                    .job_type("flaky")
                    .retry_wait_ms(1_000)
                    .build(),
            )
            .await
            .unwrap();

        engine.acquire_jobs("w", 1).await.unwrap();
        let outcome = engine.execute_job(job.id).await.unwrap();
        assert_eq!(outcome, JobOutcome::Retried);

        // Not yet eligible: backoff pushed next_retry_at 2 s out.
        assert!(engine.acquire_jobs("w", 1).await.unwrap().is_empty());
        clock.advance(chrono::Duration::seconds(2));
        assert_eq!(engine.acquire_jobs("w", 1).await.unwrap().len(), 1);
    }
}
