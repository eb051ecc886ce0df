//! Statistics aggregator: read-path counts and duration percentiles
//! grouped by (type, status, tenant).

use std::sync::Arc;

use serde::Serialize;
use sqlx::FromRow;

use crate::batch::BatchStore;
use crate::error::EngineResult;
use crate::job::JobStore;
use crate::subscription::SubscriptionStore;
use crate::timer::TimerStore;

/// One count bucket.
#[derive(FromRow, Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusCount {
    pub work_type: String,
    pub status: String,
    pub tenant_id: Option<String>,
    pub count: i64,
}

/// Duration percentiles for one work type.
#[derive(FromRow, Debug, Clone, Serialize)]
pub struct DurationStats {
    pub work_type: String,
    pub count: i64,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
}

/// A point-in-time snapshot across all engines.
#[derive(Debug, Clone, Serialize, Default)]
pub struct CoreStatistics {
    pub jobs: Vec<StatusCount>,
    pub dead_letters: Vec<StatusCount>,
    pub timers: Vec<StatusCount>,
    pub batches: Vec<StatusCount>,
    pub subscriptions: Vec<StatusCount>,
    pub job_durations: Vec<DurationStats>,
    pub batch_durations: Vec<DurationStats>,
}

impl CoreStatistics {
    /// Total count of failed jobs plus dead-lettered jobs, the headline
    /// "needs attention" number.
    pub fn failed_job_total(&self) -> i64 {
        let failed: i64 = self
            .jobs
            .iter()
            .filter(|row| row.status == "failed")
            .map(|row| row.count)
            .sum();
        let dead: i64 = self.dead_letters.iter().map(|row| row.count).sum();
        failed + dead
    }
}

/// Read-side aggregator over the four engine stores.
pub struct StatisticsAggregator {
    jobs: Arc<dyn JobStore>,
    timers: Arc<dyn TimerStore>,
    batches: Arc<dyn BatchStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
}

impl StatisticsAggregator {
    /// Wire the aggregator from the engine stores.
    pub fn new(
        jobs: Arc<dyn JobStore>,
        timers: Arc<dyn TimerStore>,
        batches: Arc<dyn BatchStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
    ) -> Self {
        Self {
            jobs,
            timers,
            batches,
            subscriptions,
        }
    }

    /// Collect a full snapshot.
    pub async fn snapshot(&self) -> EngineResult<CoreStatistics> {
        Ok(CoreStatistics {
            jobs: self.jobs.status_counts().await?,
            dead_letters: self.jobs.dead_letter_counts().await?,
            timers: self.timers.status_counts().await?,
            batches: self.batches.status_counts().await?,
            subscriptions: self.subscriptions.status_counts().await?,
            job_durations: self.jobs.duration_percentiles().await?,
            batch_durations: self.batches.duration_percentiles().await?,
        })
    }
}

/// Linear-interpolated percentile over pre-sorted samples, matching
/// `percentile_cont` in the Postgres stores.
pub(crate) fn percentile(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    if sorted.len() == 1 {
        return Some(sorted[0]);
    }
    let rank = q * (sorted.len() - 1) as f64;
    let low = rank.floor() as usize;
    let high = rank.ceil() as usize;
    if low == high {
        return Some(sorted[low]);
    }
    let weight = rank - low as f64;
    Some(sorted[low] * (1.0 - weight) + sorted[high] * weight)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_of_empty_is_none() {
        assert_eq!(percentile(&[], 0.5), None);
    }

    #[test]
    fn percentile_of_single_sample() {
        assert_eq!(percentile(&[42.0], 0.5), Some(42.0));
        assert_eq!(percentile(&[42.0], 0.95), Some(42.0));
    }

    #[test]
    fn median_interpolates() {
        assert_eq!(percentile(&[1.0, 2.0, 3.0], 0.5), Some(2.0));
        assert_eq!(percentile(&[1.0, 2.0, 3.0, 4.0], 0.5), Some(2.5));
    }

    #[test]
    fn p95_of_uniform_range() {
        let samples: Vec<f64> = (1..=100).map(|n| n as f64).collect();
        let p95 = percentile(&samples, 0.95).unwrap();
        assert!((p95 - 95.05).abs() < 1e-9);
    }

    #[test]
    fn failed_job_total_sums_failed_and_dead() {
        let stats = CoreStatistics {
            jobs: vec![
                StatusCount {
                    work_type: "a".into(),
                    status: "failed".into(),
                    tenant_id: None,
                    count: 2,
                },
                StatusCount {
                    work_type: "a".into(),
                    status: "completed".into(),
                    tenant_id: None,
                    count: 9,
                },
            ],
            dead_letters: vec![StatusCount {
                work_type: "a".into(),
                status: "dead_letter".into(),
                tenant_id: None,
                count: 3,
            }],
            ..Default::default()
        };
        assert_eq!(stats.failed_job_total(), 5);
    }
}
