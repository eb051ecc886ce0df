//! In-memory job store for deterministic tests and embedded use.
//!
//! Implements the same claim semantics as the PostgreSQL store, including
//! the conditional-update lock arbiter, so engine behaviour under test
//! matches production row-for-row.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::model::{DeadLetterJob, Job, JobFailure, JobFilter, JobStatus};
use super::store::JobStore;
use crate::stats::{percentile, DurationStats, StatusCount};

/// In-memory `JobStore` implementation.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    dead_letters: RwLock<HashMap<Uuid, DeadLetterJob>>,
}

impl MemoryJobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live job rows (test helper).
    pub fn job_count(&self) -> usize {
        self.jobs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Number of dead-letter rows (test helper).
    pub fn dead_letter_count(&self) -> usize {
        self.dead_letters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: Job) -> Result<Job> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Job>> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        Ok(jobs.get(&id).cloned())
    }

    async fn list(&self, filter: JobFilter) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<Job> = jobs
            .values()
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .filter(|j| filter.job_type.as_deref().map_or(true, |t| j.job_type == t))
            .filter(|j| {
                filter
                    .tenant_id
                    .as_deref()
                    .map_or(true, |t| j.tenant_id.as_deref() == Some(t))
            })
            .filter(|j| {
                filter
                    .process_instance_id
                    .as_deref()
                    .map_or(true, |p| j.process_instance_id.as_deref() == Some(p))
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect())
    }

    async fn fetch_claimable(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<Job> = jobs
            .values()
            .filter(|j| j.is_acquirable(now))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn try_claim(
        &self,
        id: Uuid,
        worker_id: &str,
        lock_ttl_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(false);
        };
        let lock_free = job.lock_owner.is_none()
            || job.lock_expires_at.map_or(true, |expires| expires < now);
        if job.status != JobStatus::Pending || !lock_free {
            return Ok(false);
        }
        job.status = JobStatus::Running;
        job.lock_owner = Some(worker_id.to_string());
        job.lock_expires_at = Some(now + Duration::milliseconds(lock_ttl_ms));
        job.started_at.get_or_insert(now);
        Ok(true)
    }

    async fn extend_lock(&self, id: Uuid, lock_ttl_ms: i64, now: DateTime<Utc>) -> Result<bool> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running => {
                job.lock_expires_at = Some(now + Duration::milliseconds(lock_ttl_ms));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_completed(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running => {
                job.status = JobStatus::Completed;
                job.ended_at = Some(now);
                job.lock_owner = None;
                job.lock_expires_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_failed(&self, id: Uuid, failure: &JobFailure, now: DateTime<Utc>) -> Result<bool> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        match jobs.get_mut(&id) {
            Some(job) => {
                job.status = JobStatus::Failed;
                job.exception_message = Some(failure.message.clone());
                job.exception_stack = failure.stack.clone();
                job.ended_at = Some(now);
                job.lock_owner = None;
                job.lock_expires_at = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn schedule_retry(
        &self,
        id: Uuid,
        failure: &JobFailure,
        next_retry_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        match jobs.get_mut(&id) {
            Some(job) => {
                job.status = JobStatus::Pending;
                job.retry_count += 1;
                job.next_retry_at = Some(next_retry_at);
                job.exception_message = Some(failure.message.clone());
                job.exception_stack = failure.stack.clone();
                job.lock_owner = None;
                job.lock_expires_at = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_pending(&self, id: Uuid) -> Result<bool> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        match jobs.get(&id) {
            Some(job) if job.status == JobStatus::Pending => {
                jobs.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn move_to_dead_letter(
        &self,
        job: &Job,
        failure: &JobFailure,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterJob> {
        let dead = DeadLetterJob {
            id: Uuid::new_v4(),
            source_job_id: job.id,
            job_type: job.job_type.clone(),
            handler_type: job.handler_type.clone(),
            handler_config: job.handler_config.clone(),
            payload: job.payload.clone(),
            priority: job.priority,
            total_retries: job.retry_count,
            replay_count: 0,
            exception_message: Some(failure.message.clone()),
            exception_stack: failure.stack.clone(),
            process_instance_id: job.process_instance_id.clone(),
            execution_id: job.execution_id.clone(),
            tenant_id: job.tenant_id.clone(),
            created_at: job.created_at,
            dead_lettered_at: now,
        };

        {
            let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
            jobs.remove(&job.id);
        }
        let mut dead_letters = self.dead_letters.write().unwrap_or_else(|e| e.into_inner());
        dead_letters.insert(dead.id, dead.clone());

        Ok(dead)
    }

    async fn find_dead_letter(&self, id: Uuid) -> Result<Option<DeadLetterJob>> {
        let dead_letters = self.dead_letters.read().unwrap_or_else(|e| e.into_inner());
        Ok(dead_letters.get(&id).cloned())
    }

    async fn list_dead_letters(&self, limit: i64, offset: i64) -> Result<Vec<DeadLetterJob>> {
        let dead_letters = self.dead_letters.read().unwrap_or_else(|e| e.into_inner());
        let mut rows: Vec<DeadLetterJob> = dead_letters.values().cloned().collect();
        rows.sort_by(|a, b| b.dead_lettered_at.cmp(&a.dead_lettered_at));
        Ok(rows
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }

    async fn requeue_dead_letter(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Job>> {
        let mut dead_letters = self.dead_letters.write().unwrap_or_else(|e| e.into_inner());
        let Some(dead) = dead_letters.get_mut(&id) else {
            return Ok(None);
        };
        dead.replay_count += 1;

        let job = Job {
            id: Uuid::new_v4(),
            job_type: dead.job_type.clone(),
            status: JobStatus::Pending,
            priority: dead.priority,
            retry_count: 0,
            max_retries: 3,
            retry_wait_ms: 5_000,
            next_retry_at: None,
            due_date: None,
            lock_owner: None,
            lock_expires_at: None,
            payload: dead.payload.clone(),
            handler_type: dead.handler_type.clone(),
            handler_config: dead.handler_config.clone(),
            process_instance_id: dead.process_instance_id.clone(),
            execution_id: dead.execution_id.clone(),
            exception_message: None,
            exception_stack: None,
            tenant_id: dead.tenant_id.clone(),
            created_at: now,
            started_at: None,
            ended_at: None,
        };
        drop(dead_letters);

        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        jobs.insert(job.id, job.clone());

        Ok(Some(job))
    }

    async fn release_expired_locks(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let mut released = 0;
        for job in jobs.values_mut() {
            if job.status == JobStatus::Running
                && job.lock_expires_at.map_or(false, |expires| expires < now)
            {
                job.status = JobStatus::Pending;
                job.lock_owner = None;
                job.lock_expires_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn delete_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let before = jobs.len();
        jobs.retain(|_, job| {
            !(job.status == JobStatus::Completed
                && job.ended_at.map_or(false, |ended| ended < cutoff))
        });
        Ok((before - jobs.len()) as u64)
    }

    async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let mut counts: HashMap<(String, &'static str, Option<String>), i64> = HashMap::new();
        for job in jobs.values() {
            let status = match job.status {
                JobStatus::Pending => "pending",
                JobStatus::Running => "running",
                JobStatus::Completed => "completed",
                JobStatus::Failed => "failed",
            };
            *counts
                .entry((job.job_type.clone(), status, job.tenant_id.clone()))
                .or_default() += 1;
        }
        let mut rows: Vec<StatusCount> = counts
            .into_iter()
            .map(|((work_type, status, tenant_id), count)| StatusCount {
                work_type,
                status: status.to_string(),
                tenant_id,
                count,
            })
            .collect();
        rows.sort_by(|a, b| a.work_type.cmp(&b.work_type).then(a.status.cmp(&b.status)));
        Ok(rows)
    }

    async fn dead_letter_counts(&self) -> Result<Vec<StatusCount>> {
        let dead_letters = self.dead_letters.read().unwrap_or_else(|e| e.into_inner());
        let mut counts: HashMap<(String, Option<String>), i64> = HashMap::new();
        for dead in dead_letters.values() {
            *counts
                .entry((dead.job_type.clone(), dead.tenant_id.clone()))
                .or_default() += 1;
        }
        let mut rows: Vec<StatusCount> = counts
            .into_iter()
            .map(|((work_type, tenant_id), count)| StatusCount {
                work_type,
                status: "dead_letter".to_string(),
                tenant_id,
                count,
            })
            .collect();
        rows.sort_by(|a, b| a.work_type.cmp(&b.work_type));
        Ok(rows)
    }

    async fn duration_percentiles(&self) -> Result<Vec<DurationStats>> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        let mut durations: HashMap<String, Vec<f64>> = HashMap::new();
        for job in jobs.values() {
            if job.status != JobStatus::Completed {
                continue;
            }
            if let (Some(started), Some(ended)) = (job.started_at, job.ended_at) {
                durations
                    .entry(job.job_type.clone())
                    .or_default()
                    .push((ended - started).num_milliseconds() as f64);
            }
        }
        let mut rows: Vec<DurationStats> = durations
            .into_iter()
            .map(|(work_type, mut samples)| {
                samples.sort_by(|a, b| a.total_cmp(b));
                DurationStats {
                    work_type,
                    count: samples.len() as i64,
                    p50_ms: percentile(&samples, 0.5),
                    p95_ms: percentile(&samples, 0.95),
                }
            })
            .collect();
        rows.sort_by(|a, b| a.work_type.cmp(&b.work_type));
        Ok(rows)
    }
}
