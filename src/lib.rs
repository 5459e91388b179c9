//! xtraplatform-jobs: priority job queue and runner.
//!
//! This library provides a job queue with interchangeable backends (process
//! memory or Redis), job sets with shared progress and follow-ups, and a
//! runner that dispatches jobs to processors under per-set concurrency limits.

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod scheduler;

// Re-export commonly used types
pub use config::{BackendKind, ConfigError, JobsConfig};
pub use error::{QueueError, QueueResult};
