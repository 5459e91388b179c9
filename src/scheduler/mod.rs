//! Job queue and runner.
//!
//! This module provides the infrastructure for scheduling background work:
//!
//! - **Job / JobSet**: units of work and named groups of them with shared progress
//! - **JobQueue**: facade over the single enabled backend (local or Redis)
//! - **JobRunner**: dispatches queued jobs to processors under per-set concurrency limits
//! - **RemoteExecutor**: queue access for executors running in other processes
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      │  (API/CLI)   │
//!                      └──────┬───────┘
//!                             │ push
//!                      ┌──────▼───────┐
//!                      │   JobQueue   │
//!                      │ local/Redis  │
//!                      └──────┬───────┘
//!                             │ take / done / error
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Runner 1│         │ Runner N│         │ Remote  │
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use xtraplatform_jobs::scheduler::{Job, JobQueue, JobRunner, RunnerConfig};
//! use std::sync::Arc;
//!
//! let queue = JobQueue::from_config(&config).await?;
//! queue.push(Job::new("tiles", serde_json::json!({"level": 3}))).await?;
//!
//! let mut runner = JobRunner::new(RunnerConfig::new(4), queue, vec![Arc::new(TileProcessor)]);
//! runner.start().await?;
//!
//! // Graceful shutdown
//! runner.shutdown().await?;
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic take**: jobs move from their lane to the taken list in one step
//! - **Orphan recovery**: taken jobs without progress are returned to the front of their lane
//! - **Bounded retries**: jobs exceeding `max_retries` move to a bounded failed list
//! - **Exactly-once follow-ups**: a set's follow-ups are pushed by the update that completes it

pub mod backend;
pub mod bounded;
pub mod health;
pub mod job;
pub mod queue;
pub mod remote;
pub mod runner;

// Re-export main types for convenience
pub use backend::{
    BackendOptions, JobQueueBackend, LaneSnapshot, LocalBackend, PushListener, RedisBackend,
};
pub use bounded::BoundedMap;
pub use health::{HealthState, SimpleRegistry, Volatile, VolatileRegistry};
pub use job::{
    BaseJob, GenericDetails, Job, JobResult, JobSet, JobSetDetails, JobTypes, DEFAULT_PRIORITY,
};
pub use queue::{JobQueue, QueueSnapshot};
pub use remote::{FinishRequest, ProgressRequest, RemoteExecutor, TakeRequest};
pub use runner::{JobProcessor, JobRunner, RunnerConfig, RunnerError, RunnerStats};
