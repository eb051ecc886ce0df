//! Clock-driven scheduler loop.
//!
//! One logical loop per process wakes every tick (default 1 s) and runs,
//! in order: (a) timer due-scan, (b) batch ready-scan at its own cadence,
//! (c) job acquisition and execution, (d) housekeeping — the lock sweeper
//! once per minute and the per-engine retention passes on a slower cadence.
//!
//! ```text
//! tick ─► timers.fire_due ─► batches.run_once ─► jobs.acquire + execute
//!                                                      │
//!            every sweep interval: release expired locks
//!            every retention interval: per-engine cleanup
//! ```
//!
//! The loop is re-entrant-safe: an `is_processing` guard skips a tick
//! that would overlap a still-running one. Missed ticks are harmless —
//! the next tick re-selects any still-due rows. Store errors inside a
//! phase are logged and end that phase; the next tick retries.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::batch::BatchEngine;
use crate::config::{CoreConfig, SchedulerConfig};
use crate::job::JobEngine;
use crate::subscription::SubscriptionEngine;
use crate::timer::TimerEngine;

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// True when the overlap guard skipped this tick entirely.
    pub skipped: bool,
    pub timers_fired: usize,
    pub batches_processed: usize,
    pub jobs_executed: usize,
    pub locks_released: u64,
    pub rows_cleaned: u64,
}

impl TickSummary {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }
}

/// The per-process scheduler driving all four engines.
pub struct Scheduler {
    jobs: Arc<JobEngine>,
    timers: Arc<TimerEngine>,
    batches: Arc<BatchEngine>,
    subscriptions: Arc<SubscriptionEngine>,
    config: SchedulerConfig,
    /// Batch ready-scan cadence, derived from `batch.process_interval_ms`.
    batch_interval_ticks: u64,
    worker_id: String,
    is_processing: AtomicBool,
    tick_count: AtomicU64,
}

impl Scheduler {
    /// Wire the scheduler over already-constructed engines.
    pub fn new(
        jobs: Arc<JobEngine>,
        timers: Arc<TimerEngine>,
        batches: Arc<BatchEngine>,
        subscriptions: Arc<SubscriptionEngine>,
        config: &CoreConfig,
    ) -> Self {
        let tick_ms = config.scheduler.tick_interval_ms.max(1);
        let batch_interval_ticks = (config.batch.process_interval_ms / tick_ms).max(1) as u64;
        Self {
            jobs,
            timers,
            batches,
            subscriptions,
            config: config.scheduler.clone(),
            batch_interval_ticks,
            worker_id: format!("scheduler-{}", Uuid::new_v4()),
            is_processing: AtomicBool::new(false),
            tick_count: AtomicU64::new(0),
        }
    }

    /// Use a stable worker id instead of the generated one.
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    /// The id this scheduler claims work under.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run one tick. Public so tests can drive the loop with a stepped
    /// clock instead of real time.
    pub async fn tick(&self) -> TickSummary {
        if self.is_processing.swap(true, Ordering::SeqCst) {
            return TickSummary::skipped();
        }

        let tick = self.tick_count.fetch_add(1, Ordering::SeqCst) + 1;
        let mut summary = TickSummary::default();

        // (a) Timer due-scan.
        match self.timers.fire_due(&self.worker_id).await {
            Ok(fired) => summary.timers_fired = fired,
            Err(error) => error!(error = %error, "timer phase failed"),
        }

        // (b) Batch ready-scan, on its own cadence.
        if tick % self.batch_interval_ticks == 0 {
            match self.batches.run_once().await {
                Ok(processed) => summary.batches_processed = processed,
                Err(error) => error!(error = %error, "batch phase failed"),
            }
        }

        // (c) Job acquisition; execution runs concurrently within the phase.
        match self
            .jobs
            .acquire_jobs(&self.worker_id, self.config.job_acquire_limit)
            .await
        {
            Ok(claimed) => {
                let outcomes =
                    join_all(claimed.iter().map(|job| self.jobs.execute_job(job.id))).await;
                for outcome in outcomes {
                    match outcome {
                        Ok(_) => summary.jobs_executed += 1,
                        Err(error) => error!(error = %error, "job execution failed"),
                    }
                }
            }
            Err(error) => error!(error = %error, "job acquisition failed"),
        }

        // (d) Housekeeping: lock sweeper and retention.
        if tick % self.config.sweep_interval_ticks == 0 {
            summary.locks_released = self.sweep_locks().await;
        }
        if tick % self.config.retention_interval_ticks == 0 {
            summary.rows_cleaned = self.run_retention().await;
        }

        debug!(tick, ?summary, "scheduler tick finished");
        self.is_processing.store(false, Ordering::SeqCst);
        summary
    }

    /// Run the loop until the token is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            worker_id = %self.worker_id,
            tick_interval_ms = self.config.tick_interval_ms,
            "scheduler starting"
        );

        let mut interval =
            tokio::time::interval(Duration::from_millis(self.config.tick_interval_ms.max(1) as u64));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }

        info!(worker_id = %self.worker_id, "scheduler stopped");
    }

    /// Start the loop as an owned task. Returns a handle for graceful
    /// shutdown.
    pub fn spawn(self: Arc<Self>) -> SchedulerHandle {
        let token = CancellationToken::new();
        let task = tokio::spawn(Arc::clone(&self).run(token.clone()));
        SchedulerHandle { token, task }
    }

    /// Lock sweeper: reverse expired claims so crashed workers' rows
    /// become eligible again.
    async fn sweep_locks(&self) -> u64 {
        let mut released = 0;
        match self.jobs.release_expired_locks().await {
            Ok(count) => released += count,
            Err(error) => error!(error = %error, "job lock sweep failed"),
        }
        match self.timers.release_expired_locks().await {
            Ok(count) => released += count,
            Err(error) => error!(error = %error, "timer lock sweep failed"),
        }
        released
    }

    /// One retention pass per engine, all reading their own retention
    /// config.
    async fn run_retention(&self) -> u64 {
        let mut cleaned = 0;
        match self.jobs.cleanup_finished().await {
            Ok(count) => cleaned += count,
            Err(error) => error!(error = %error, "job retention failed"),
        }
        match self.timers.cleanup_finished().await {
            Ok(count) => cleaned += count,
            Err(error) => error!(error = %error, "timer retention failed"),
        }
        match self.batches.cleanup_finished().await {
            Ok(count) => cleaned += count,
            Err(error) => error!(error = %error, "batch retention failed"),
        }
        match self.subscriptions.cleanup_processed_subscriptions().await {
            Ok(count) => cleaned += count,
            Err(error) => error!(error = %error, "subscription retention failed"),
        }
        cleaned
    }
}

/// Handle to a spawned scheduler loop.
pub struct SchedulerHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Token that stops the loop when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop the loop and wait for it to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        let _ = self.task.await;
    }
}
