//! Standalone job worker service.
//!
//! The scheduler's job phase is enough for light deployments; heavier ones
//! run extra `JobWorker` instances (same process or different processes)
//! that poll-claim-execute against the shared store. The lock arbiter
//! keeps the workers from stepping on each other.
//!
//! ```text
//! JobWorker
//!     │
//!     ├─► acquire_jobs (claim up to batch_size)
//!     ├─► execute concurrently
//!     └─► sleep poll_interval when idle
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::job::JobEngine;

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// Maximum number of jobs to claim at once.
    pub batch_size: i64,
    /// How long to wait when no jobs are available.
    pub poll_interval: Duration,
    /// Worker ID for this instance.
    pub worker_id: String,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            poll_interval: Duration::from_secs(5),
            worker_id: format!("worker-{}", Uuid::new_v4()),
        }
    }
}

impl JobWorkerConfig {
    /// Create a config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// Background service that claims and executes jobs until shut down.
pub struct JobWorker {
    engine: Arc<JobEngine>,
    config: JobWorkerConfig,
}

impl JobWorker {
    /// Create a worker over a job engine.
    pub fn new(engine: Arc<JobEngine>) -> Self {
        Self {
            engine,
            config: JobWorkerConfig::default(),
        }
    }

    /// Create with custom configuration.
    pub fn with_config(engine: Arc<JobEngine>, config: JobWorkerConfig) -> Self {
        Self { engine, config }
    }

    /// Run until the token is cancelled. Each claimed page is executed
    /// concurrently and awaited before the next poll, so cancellation
    /// drains in-flight work instead of abandoning it.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(
            worker_id = %self.config.worker_id,
            batch_size = self.config.batch_size,
            "job worker starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let jobs = match self
                .engine
                .acquire_jobs(&self.config.worker_id, self.config.batch_size)
                .await
            {
                Ok(jobs) => jobs,
                Err(error) => {
                    error!(error = %error, "failed to claim jobs");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            }

            debug!(count = jobs.len(), "claimed jobs");

            let outcomes = join_all(jobs.iter().map(|job| self.engine.execute_job(job.id))).await;
            for (job, outcome) in jobs.iter().zip(outcomes) {
                if let Err(error) = outcome {
                    error!(job_id = %job.id, error = %error, "job execution failed");
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "job worker stopped");
        Ok(())
    }

    /// Spawn the worker as an owned task.
    pub fn spawn(self) -> (CancellationToken, tokio::task::JoinHandle<Result<()>>) {
        let token = CancellationToken::new();
        let task = tokio::spawn(self.run(token.clone()));
        (token, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = JobWorkerConfig::default();
        assert_eq!(config.batch_size, 10);
        assert!(config.worker_id.starts_with("worker-"));
    }

    #[test]
    fn config_with_worker_id() {
        let config = JobWorkerConfig::with_worker_id("my-worker");
        assert_eq!(config.worker_id, "my-worker");
        assert_eq!(config.batch_size, 10);
    }
}
