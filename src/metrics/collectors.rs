//! Recording interface for job queue metrics.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics so call sites never
//! deal with label ordering or uninitialized registries.

use std::collections::BTreeMap;
use std::time::Duration;

use super::prometheus::{
    FAILED_JOBS, JOBS_FINISHED_TOTAL, JOBS_IN_PROGRESS, JOBS_SUSPENDED_TOTAL, JOBS_TAKEN_TOTAL,
    JOB_DURATION, ORPHANS_RECOVERED_TOTAL, QUEUE_DEPTH,
};
use crate::scheduler::queue::QueueSnapshot;

/// Metrics collector for job queue operations.
///
/// Metrics must be initialized with `init_metrics()` for recording to have
/// any effect.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a job handed to a processor.
    pub fn record_taken(&self, job_type: &str) {
        if let Some(taken) = JOBS_TAKEN_TOTAL.get() {
            taken.with_label_values(&[job_type]).inc();
        }
        if let Some(in_progress) = JOBS_IN_PROGRESS.get() {
            in_progress.inc();
        }
    }

    /// Record a finished job.
    ///
    /// # Arguments
    ///
    /// * `job_type` - Type of the job
    /// * `result` - Result label (`success`, `failure`, `on_hold`)
    /// * `duration` - Time spent in the processor
    pub fn record_finished(&self, job_type: &str, result: &str, duration: Duration) {
        if let Some(finished) = JOBS_FINISHED_TOTAL.get() {
            finished.with_label_values(&[job_type, result]).inc();
        }
        if let Some(histogram) = JOB_DURATION.get() {
            histogram
                .with_label_values(&[job_type])
                .observe(duration.as_secs_f64());
        }
        if let Some(in_progress) = JOBS_IN_PROGRESS.get() {
            in_progress.dec();
        }

        tracing::trace!(
            job_type = job_type,
            result = result,
            duration_ms = duration.as_millis() as u64,
            "Recorded finished job metric"
        );
    }

    /// Record a job suspended by its set's concurrency ceiling.
    pub fn record_suspended(&self, job_type: &str) {
        if let Some(suspended) = JOBS_SUSPENDED_TOTAL.get() {
            suspended.with_label_values(&[job_type]).inc();
        }
    }

    /// Record orphaned jobs returned to their lanes.
    pub fn record_orphans(&self, count: usize) {
        if let Some(orphans) = ORPHANS_RECOVERED_TOTAL.get() {
            orphans.inc_by(count as f64);
        }
    }

    /// Update queue gauges from a snapshot.
    pub fn update_from_snapshot(&self, snapshot: &QueueSnapshot) {
        let mut depth: BTreeMap<&str, usize> = BTreeMap::new();
        for lane in &snapshot.open {
            *depth.entry(lane.job_type.as_str()).or_default() += lane.jobs.len();
        }

        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            for (job_type, count) in &depth {
                queue_depth.with_label_values(&[*job_type]).set(*count as f64);
            }
        }
        if let Some(failed) = FAILED_JOBS.get() {
            failed.set(snapshot.failed.len() as f64);
        }

        tracing::trace!(
            types = depth.len(),
            failed = snapshot.failed.len(),
            "Updated queue gauges"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::init_metrics;
    use crate::scheduler::backend::LaneSnapshot;
    use crate::scheduler::health::HealthState;
    use crate::scheduler::job::Job;

    fn ensure_metrics_init() {
        let _ = init_metrics();
    }

    #[test]
    fn test_metrics_collector_new() {
        let collector = MetricsCollector::new();
        assert!(std::mem::size_of_val(&collector) == 0);
    }

    #[test]
    fn test_record_job_lifecycle() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        collector.record_taken("tiles");
        collector.record_suspended("tiles");
        collector.record_finished("tiles", "success", Duration::from_millis(250));
        collector.record_orphans(2);

        let finished = JOBS_FINISHED_TOTAL
            .get()
            .expect("metrics initialized")
            .with_label_values(&["tiles", "success"])
            .get();
        assert!(finished >= 1.0);
    }

    #[test]
    fn test_update_from_snapshot() {
        ensure_metrics_init();
        let collector = MetricsCollector::new();

        let snapshot = QueueSnapshot {
            backend: "local".to_string(),
            state: HealthState::Available,
            open: vec![
                LaneSnapshot {
                    job_type: "snapshot-test".to_string(),
                    priority: 1,
                    jobs: vec![Job::new("snapshot-test", serde_json::Value::Null)],
                },
                LaneSnapshot {
                    job_type: "snapshot-test".to_string(),
                    priority: 0,
                    jobs: vec![
                        Job::new("snapshot-test", serde_json::Value::Null),
                        Job::new("snapshot-test", serde_json::Value::Null),
                    ],
                },
            ],
            taken: Vec::new(),
            failed: Vec::new(),
            sets: Vec::new(),
        };
        collector.update_from_snapshot(&snapshot);

        let depth = QUEUE_DEPTH
            .get()
            .expect("metrics initialized")
            .with_label_values(&["snapshot-test"])
            .get();
        assert_eq!(depth, 3.0);
    }
}
