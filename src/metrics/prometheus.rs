//! Prometheus metrics registration and export.
//!
//! All metrics live in a dedicated registry created by [`init_metrics`].
//! Recording through [`super::MetricsCollector`] before initialization is a
//! no-op.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all job queue metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs taken for execution, labeled by job type.
pub static JOBS_TAKEN_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Jobs finished, labeled by job type and result.
pub static JOBS_FINISHED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Jobs returned to their lane because their set hit its concurrency ceiling.
pub static JOBS_SUSPENDED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Taken jobs recovered by the orphan sweep.
pub static ORPHANS_RECOVERED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Job execution duration in seconds, labeled by job type.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Jobs currently executing in this process.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Queued jobs per job type, as of the last snapshot.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Entries in the failed list, as of the last snapshot.
pub static FAILED_JOBS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling this more than once keeps the first registry.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let jobs_taken_total = CounterVec::new(
        Opts::new("xtraplatform_jobs_taken_total", "Jobs taken for execution"),
        &["job_type"],
    )?;

    let jobs_finished_total = CounterVec::new(
        Opts::new("xtraplatform_jobs_finished_total", "Jobs finished by result"),
        &["job_type", "result"],
    )?;

    let jobs_suspended_total = CounterVec::new(
        Opts::new(
            "xtraplatform_jobs_suspended_total",
            "Jobs returned to their lane by the concurrency gate",
        ),
        &["job_type"],
    )?;

    let orphans_recovered_total = Counter::new(
        "xtraplatform_jobs_orphans_recovered_total",
        "Taken jobs recovered by the orphan sweep",
    )?;

    let job_duration = HistogramVec::new(
        HistogramOpts::new(
            "xtraplatform_jobs_duration_seconds",
            "Job execution duration in seconds",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
        &["job_type"],
    )?;

    let jobs_in_progress = Gauge::new(
        "xtraplatform_jobs_in_progress",
        "Jobs currently executing in this process",
    )?;

    let queue_depth = GaugeVec::new(
        Opts::new("xtraplatform_jobs_queue_depth", "Queued jobs per job type"),
        &["job_type"],
    )?;

    let failed_jobs = Gauge::new("xtraplatform_jobs_failed", "Entries in the failed list")?;

    registry.register(Box::new(jobs_taken_total.clone()))?;
    registry.register(Box::new(jobs_finished_total.clone()))?;
    registry.register(Box::new(jobs_suspended_total.clone()))?;
    registry.register(Box::new(orphans_recovered_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(failed_jobs.clone()))?;

    // Already initialized if any of these fail.
    let _ = REGISTRY.set(registry);
    let _ = JOBS_TAKEN_TOTAL.set(jobs_taken_total);
    let _ = JOBS_FINISHED_TOTAL.set(jobs_finished_total);
    let _ = JOBS_SUSPENDED_TOTAL.set(jobs_suspended_total);
    let _ = ORPHANS_RECOVERED_TOTAL.set(orphans_recovered_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = FAILED_JOBS.set(failed_jobs);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        let result = init_metrics();
        assert!(result.is_ok() || REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        let _ = init_metrics();

        if let Some(taken) = JOBS_TAKEN_TOTAL.get() {
            taken.with_label_values(&["export-test"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("xtraplatform_jobs_taken_total"));
    }
}
