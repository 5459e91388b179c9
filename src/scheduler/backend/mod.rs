//! Storage backends for the job queue.
//!
//! Every backend implements [`JobQueueBackend`]. Exactly one backend is
//! enabled per process; [`crate::scheduler::JobQueue`] selects it at startup.
//!
//! - [`LocalBackend`]: in-process lanes and maps, single instance, non-durable
//! - [`RedisBackend`]: shared lists and RedisJSON documents, multi instance
//!
//! # Semantics shared by all backends
//!
//! - Lanes are keyed by (type, priority). `take` serves the highest
//!   priority non-empty lane of a type, FIFO within the lane.
//! - Untake returns a taken job to the front of its lane. Untaking a job
//!   that exists but is not taken does nothing, so two sweepers racing on
//!   the same orphan cannot queue it twice. Untaking an unknown job inserts
//!   it at the front.
//! - A normal push of a job id that is already stored replaces its document
//!   and moves it to the back of its lane. This is how processors re-queue
//!   jobs they put on hold.
//! - `done` and `error` only act on taken jobs. Unknown ids return `false`
//!   and leave the state untouched.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::{DEFAULT_MAX_FAILED, DEFAULT_MAX_RETRIES};
use crate::error::QueueResult;
use crate::scheduler::health::Volatile;
use crate::scheduler::job::{BaseJob, Job, JobSet, JobTypes};

pub mod local;
pub mod redis;

pub use self::local::LocalBackend;
pub use self::redis::RedisBackend;

/// Callback invoked with the job type whenever a job becomes available.
pub type PushListener = Arc<dyn Fn(&str) + Send + Sync>;

/// Limits shared by all backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendOptions {
    /// Retries before a retryable failure becomes permanent.
    pub max_retries: u32,
    /// Capacity of the failed list; the oldest entries are evicted.
    pub max_failed: usize,
}

impl Default for BackendOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            max_failed: DEFAULT_MAX_FAILED,
        }
    }
}

/// Jobs waiting in one lane, head first.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaneSnapshot {
    #[serde(rename = "type")]
    pub job_type: String,
    pub priority: i32,
    pub jobs: Vec<Job>,
}

/// Contract implemented by every job queue backend.
///
/// All operations are safe to call concurrently. Infrastructure failures
/// surface as [`crate::error::QueueError`]; unknown ids never do.
#[async_trait]
pub trait JobQueueBackend: Volatile {
    /// Whether this backend was enabled by configuration.
    fn is_enabled(&self) -> bool;

    /// Installs the registry used to decode job set details.
    async fn set_job_types(&self, types: Arc<JobTypes>);

    /// Enqueues a job or persists a job set (queueing its setup job).
    async fn push(&self, job: BaseJob, untake: bool) -> QueueResult<()>;

    /// Takes the next job of `job_type` for `executor`.
    async fn take(&self, job_type: &str, executor: &str) -> QueueResult<Option<Job>>;

    /// Completes a taken job.
    async fn done(&self, job_id: &str) -> QueueResult<bool>;

    /// Reports a failure for a taken job.
    async fn error(&self, job_id: &str, error: &str, retry: bool) -> QueueResult<bool>;

    async fn get_job(&self, job_id: &str) -> QueueResult<Option<Job>>;

    async fn get_set(&self, set_id: &str) -> QueueResult<Option<JobSet>>;

    async fn get_sets(&self) -> QueueResult<Vec<JobSet>>;

    /// Queued jobs per lane, type ascending then priority descending.
    async fn get_open(&self) -> QueueResult<Vec<LaneSnapshot>>;

    async fn get_taken(&self) -> QueueResult<Vec<Job>>;

    /// Permanently failed jobs, newest first.
    async fn get_failed(&self) -> QueueResult<Vec<Job>>;

    /// Adds progress to a job and refreshes its liveness timestamp.
    async fn update_job(&self, job_id: &str, delta: i64) -> QueueResult<bool>;

    /// Adds progress to a job set and feeds `params` to its details.
    async fn update_job_set(
        &self,
        set_id: &str,
        delta: i64,
        params: &Map<String, Value>,
    ) -> QueueResult<bool>;

    /// Adds `total` work units to a job set and initializes its details.
    async fn init_job_set(
        &self,
        set_id: &str,
        total: i64,
        params: &Map<String, Value>,
    ) -> QueueResult<bool>;

    async fn start_job_set(&self, set_id: &str) -> QueueResult<bool>;

    /// Deletes a job set document.
    async fn done_set(&self, set_id: &str) -> QueueResult<bool>;

    /// Drops the failed list and the failed jobs' documents.
    async fn clear_failed(&self) -> QueueResult<usize>;

    /// Registers a listener woken when jobs are pushed.
    ///
    /// Backends without a cross-process signal may ignore listeners; the
    /// runner always polls as well.
    async fn on_push(&self, listener: PushListener) -> QueueResult<()>;
}

/// Applies `f` to the set's decoded details, logging decode failures.
pub(crate) fn apply_details<F>(set: &mut JobSet, types: &JobTypes, f: F)
where
    F: FnOnce(&mut dyn crate::scheduler::job::JobSetDetails),
{
    if let Err(e) = set.update_details(types, f) {
        tracing::warn!(
            set_id = %set.id,
            job_type = %set.job_type,
            error = %e,
            "Failed to update job set details"
        );
    }
}
