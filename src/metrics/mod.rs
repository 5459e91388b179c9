//! Metrics module for Prometheus-based monitoring.
//!
//! This module provides metrics collection and export for job queue
//! operations: jobs taken, finished and suspended, orphan recovery, execution
//! time, and queue depth.
//!
//! # Example
//!
//! ```ignore
//! use xtraplatform_jobs::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_taken("tiles");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    FAILED_JOBS, JOBS_FINISHED_TOTAL, JOBS_IN_PROGRESS, JOBS_SUSPENDED_TOTAL, JOBS_TAKEN_TOTAL,
    JOB_DURATION, ORPHANS_RECOVERED_TOTAL, QUEUE_DEPTH, REGISTRY,
};
