//! Engine configuration.
//!
//! Every knob has a production default; `CoreConfig::from_env` applies
//! environment overrides for deployments that tune without recompiling.

use std::env;

use anyhow::{Context, Result};

/// Retry backoff strategy for failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryBackoff {
    /// `retry_wait_ms * 2^retry_count` — doubles on every attempt.
    #[default]
    Exponential,
    /// Flat `retry_wait_ms` between attempts.
    Fixed,
}

/// Job engine configuration.
#[derive(Debug, Clone)]
pub struct JobEngineConfig {
    /// Lock TTL applied when claiming a job.
    pub lock_ttl_ms: i64,
    /// Default `max_retries` for new jobs.
    pub default_max_retries: i32,
    /// Default base retry wait for new jobs.
    pub default_retry_wait_ms: i64,
    /// Default priority for new jobs.
    pub default_priority: i32,
    /// Backoff strategy applied on retry.
    pub backoff: RetryBackoff,
    /// Retention window for completed jobs.
    pub retention_days: i64,
}

impl Default for JobEngineConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: 300_000,
            default_max_retries: 3,
            default_retry_wait_ms: 5_000,
            default_priority: 50,
            backoff: RetryBackoff::Exponential,
            retention_days: 30,
        }
    }
}

/// Timer engine configuration.
#[derive(Debug, Clone)]
pub struct TimerEngineConfig {
    /// Lock TTL applied when claiming a timer for execution.
    pub lock_ttl_ms: i64,
    /// Maximum due timers fetched per scheduler tick.
    pub due_scan_limit: i64,
    /// Retention window for executed/cancelled timers.
    pub retention_days: i64,
}

impl Default for TimerEngineConfig {
    fn default() -> Self {
        Self {
            lock_ttl_ms: 60_000,
            due_scan_limit: 50,
            retention_days: 7,
        }
    }
}

/// Batch engine configuration.
#[derive(Debug, Clone)]
pub struct BatchEngineConfig {
    /// Whether the scheduler drives batch processing at all.
    pub enabled: bool,
    /// Parts fetched per batch per processing round.
    pub batch_size: i64,
    /// Base retry wait for failed parts; doubles per attempt.
    pub retry_wait_ms: i64,
    /// How often the ready-scan runs.
    pub process_interval_ms: i64,
    /// Batches processed concurrently per process.
    pub max_concurrent: i64,
    /// Lock-equivalent bound on a single part execution.
    pub timeout_ms: i64,
    /// Whether terminal batches are cleaned up automatically.
    pub auto_cleanup: bool,
    /// Retention window for terminal batches.
    pub retention_days: i64,
}

impl Default for BatchEngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 50,
            retry_wait_ms: 5_000,
            process_interval_ms: 5_000,
            max_concurrent: 5,
            timeout_ms: 300_000,
            auto_cleanup: true,
            retention_days: 30,
        }
    }
}

/// Event subscription engine configuration.
#[derive(Debug, Clone)]
pub struct SubscriptionEngineConfig {
    /// Retention window for processed subscriptions.
    pub retention_days: i64,
}

impl Default for SubscriptionEngineConfig {
    fn default() -> Self {
        Self { retention_days: 7 }
    }
}

/// Scheduler loop configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between ticks.
    pub tick_interval_ms: i64,
    /// Jobs acquired per tick.
    pub job_acquire_limit: i64,
    /// Lock sweeper cadence, in ticks.
    pub sweep_interval_ticks: u64,
    /// Retention cleanup cadence, in ticks.
    pub retention_interval_ticks: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            job_acquire_limit: 10,
            sweep_interval_ticks: 60,
            retention_interval_ticks: 3_600,
        }
    }
}

/// Aggregate configuration for the whole coordination core.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub job: JobEngineConfig,
    pub timer: TimerEngineConfig,
    pub batch: BatchEngineConfig,
    pub subscription: SubscriptionEngineConfig,
    pub scheduler: SchedulerConfig,
}

impl CoreConfig {
    /// Load configuration with environment overrides applied on top of the
    /// defaults. Only a handful of operationally relevant knobs are exposed.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(ms) = read_i64("FLOWMILL_TICK_INTERVAL_MS")? {
            config.scheduler.tick_interval_ms = ms;
        }
        if let Some(ms) = read_i64("FLOWMILL_JOB_LOCK_TTL_MS")? {
            config.job.lock_ttl_ms = ms;
        }
        if let Some(ms) = read_i64("FLOWMILL_TIMER_LOCK_TTL_MS")? {
            config.timer.lock_ttl_ms = ms;
        }
        if let Some(n) = read_i64("FLOWMILL_BATCH_SIZE")? {
            config.batch.batch_size = n;
        }
        if let Some(n) = read_i64("FLOWMILL_BATCH_MAX_CONCURRENT")? {
            config.batch.max_concurrent = n;
        }
        if let Some(days) = read_i64("FLOWMILL_EVENT_RETENTION_DAYS")? {
            config.subscription.retention_days = days;
        }

        Ok(config)
    }
}

fn read_i64(key: &str) -> Result<Option<i64>> {
    match env::var(key) {
        Ok(raw) => {
            let value = raw
                .parse()
                .with_context(|| format!("{key} must be an integer, got '{raw}'"))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_defaults_match_contract() {
        let config = JobEngineConfig::default();
        assert_eq!(config.lock_ttl_ms, 300_000);
        assert_eq!(config.default_max_retries, 3);
        assert_eq!(config.default_retry_wait_ms, 5_000);
        assert_eq!(config.default_priority, 50);
        assert_eq!(config.backoff, RetryBackoff::Exponential);
    }

    #[test]
    fn timer_defaults_match_contract() {
        let config = TimerEngineConfig::default();
        assert_eq!(config.lock_ttl_ms, 60_000);
        assert_eq!(config.due_scan_limit, 50);
        assert_eq!(config.retention_days, 7);
    }

    #[test]
    fn batch_defaults_match_contract() {
        let config = BatchEngineConfig::default();
        assert!(config.enabled);
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.retry_wait_ms, 5_000);
        assert_eq!(config.process_interval_ms, 5_000);
        assert_eq!(config.max_concurrent, 5);
        assert_eq!(config.retention_days, 30);
    }

    #[test]
    fn scheduler_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.tick_interval_ms, 1_000);
        assert_eq!(config.sweep_interval_ticks, 60);
    }
}
