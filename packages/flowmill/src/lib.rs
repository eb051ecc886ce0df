//! Durable work coordination core for a workflow engine.
//!
//! Four engines over one persistence discipline:
//!
//! - [`job::JobEngine`] — fire-and-forget continuations with bounded
//!   retry and a dead-letter sink
//! - [`timer::TimerEngine`] — due-date firings from date, duration, and
//!   cycle expressions, resilient across restarts
//! - [`batch::BatchEngine`] — fan-out of homogeneous parts under a parent
//!   aggregate with derived progress
//! - [`subscription::SubscriptionEngine`] — durable registrations that
//!   convert named signals/messages into at-most-once wakeups
//!
//! Every claim goes through the same lock-arbiter pattern: a conditional
//! update whose affected-row count elects at most one worker per record.
//! The relational store is the only cross-process arbiter; within a
//! process a single [`scheduler::Scheduler`] tick fans due work out to
//! concurrent worker tasks.
//!
//! # Wiring
//!
//! ```ignore
//! let pool = PgPool::connect(&database_url).await?;
//! sqlx::migrate!().run(&pool).await?;
//!
//! let mut registry = ExecutorRegistry::new();
//! registry.register_job_handler("send_email", send_email_handler);
//! let registry = Arc::new(registry);
//!
//! let config = CoreConfig::from_env()?;
//! let clock: SharedClock = Arc::new(SystemClock);
//! let bus = EventBus::new();
//!
//! let jobs = Arc::new(JobEngine::new(
//!     Arc::new(PostgresJobStore::new(pool.clone())),
//!     registry.clone(), bus.clone(), clock.clone(), config.job.clone(),
//! ));
//! let timers = Arc::new(
//!     TimerEngine::new(
//!         Arc::new(PostgresTimerStore::new(pool.clone())),
//!         registry.clone(), bus.clone(), clock.clone(), config.timer.clone(),
//!     )
//!     .with_job_promotion(jobs.clone()),
//! );
//! let batches = Arc::new(BatchEngine::new(
//!     Arc::new(PostgresBatchStore::new(pool.clone())),
//!     registry.clone(), bus.clone(), clock.clone(), config.batch.clone(),
//! ));
//! let subscriptions = Arc::new(SubscriptionEngine::new(
//!     Arc::new(PostgresSubscriptionStore::new(pool)),
//!     registry, bus, clock, config.subscription.clone(),
//! ));
//!
//! let scheduler = Arc::new(Scheduler::new(jobs, timers, batches, subscriptions, &config));
//! let handle = scheduler.spawn();
//! // ... handle.shutdown().await on exit
//! ```

pub mod batch;
pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod job;
pub mod scheduler;
pub mod stats;
pub mod subscription;
pub mod timer;
pub mod worker;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{
    BatchEngineConfig, CoreConfig, JobEngineConfig, RetryBackoff, SchedulerConfig,
    SubscriptionEngineConfig, TimerEngineConfig,
};
pub use error::{EngineError, EngineResult};
pub use events::{BatchEvent, CoreEvent, EventBus, JobEvent, SubscriptionEvent, TimerEvent};
pub use executor::{ExecutorRegistry, PartOutcome, SharedExecutorRegistry, TimerFireContext};
pub use scheduler::{Scheduler, SchedulerHandle, TickSummary};
pub use stats::{CoreStatistics, DurationStats, StatisticsAggregator, StatusCount};
pub use worker::{JobWorker, JobWorkerConfig};
