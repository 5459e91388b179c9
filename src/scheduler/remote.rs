//! Request types and adapter for executors running outside this process.
//!
//! The HTTP layer is provided by the embedding service. It maps:
//!
//! ```text
//! POST   /api/jobs            {type, id}            -> RemoteExecutor::take
//! POST   /api/jobs/{jobId}    {delta, ...params}    -> RemoteExecutor::progress
//! DELETE /api/jobs/{jobId}    [{error, retry}]      -> RemoteExecutor::finish
//! ```
//!
//! A `None` from `take` should be answered with `204 No Content`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::job::{Job, JobResult};
use super::queue::JobQueue;
use crate::error::QueueResult;

/// Body of a take request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    /// Identifier of the remote executor.
    #[serde(rename = "id")]
    pub executor: String,
}

/// Body of a progress report. Every field besides `delta` is forwarded to
/// the owning set's details.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressRequest {
    #[serde(default)]
    pub delta: i64,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

/// Optional body of a finish request. Without an error the job is done.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishRequest {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry: bool,
}

impl From<FinishRequest> for JobResult {
    fn from(request: FinishRequest) -> Self {
        match request.error {
            Some(error) => JobResult::failure(error, request.retry),
            None => JobResult::success(),
        }
    }
}

/// Queue operations on behalf of remote executors.
#[derive(Debug, Clone)]
pub struct RemoteExecutor {
    queue: JobQueue,
}

impl RemoteExecutor {
    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }

    /// Takes the next job of the requested type for the remote executor.
    pub async fn take(&self, request: &TakeRequest) -> QueueResult<Option<Job>> {
        let job = self
            .queue
            .take(&request.job_type, &request.executor)
            .await?;

        if let Some(job) = &job {
            debug!(
                job_id = %job.id,
                job_type = %job.job_type,
                executor = %request.executor,
                "Job taken by remote executor"
            );
        }
        Ok(job)
    }

    /// Records progress on a taken job and on its set, if any.
    ///
    /// Returns `false` if the job is unknown or no longer taken.
    pub async fn progress(&self, job_id: &str, request: &ProgressRequest) -> QueueResult<bool> {
        let Some(job) = self.queue.get_job(job_id).await? else {
            return Ok(false);
        };
        if !job.is_taken() {
            return Ok(false);
        }

        if !self.queue.update_job(job_id, request.delta).await? {
            return Ok(false);
        }

        if let Some(set_id) = job.part_of.as_deref() {
            self.queue
                .update_job_set(set_id, request.delta, &request.params)
                .await?;
        }
        Ok(true)
    }

    /// Finishes a taken job. Without a body the job is done.
    ///
    /// Returns `false` if the job is unknown or no longer taken.
    pub async fn finish(&self, job_id: &str, request: Option<FinishRequest>) -> QueueResult<bool> {
        let result: JobResult = request.unwrap_or_default().into();
        debug!(job_id = %job_id, result = result.label(), "Remote executor finished job");

        match result {
            JobResult::Failure { error, retryable } => {
                self.queue.error(job_id, &error, retryable).await
            }
            _ => self.queue.done(job_id).await,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }
}
