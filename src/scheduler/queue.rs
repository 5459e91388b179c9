//! Job queue facade.
//!
//! `JobQueue` selects the single enabled backend at startup and forwards
//! every operation to it. It is cheap to clone; all clones share the same
//! backend.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use super::backend::{
    BackendOptions, JobQueueBackend, LaneSnapshot, LocalBackend, PushListener, RedisBackend,
};
use super::health::{HealthState, Volatile, VolatileRegistry};
use super::job::{BaseJob, Job, JobSet, JobTypes};
use crate::config::{BackendKind, JobsConfig};
use crate::error::{QueueError, QueueResult};

/// Operator view of the whole queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub backend: String,
    pub state: HealthState,
    pub open: Vec<LaneSnapshot>,
    pub taken: Vec<Job>,
    pub failed: Vec<Job>,
    pub sets: Vec<JobSet>,
}

/// Handle to the job queue.
#[derive(Clone)]
pub struct JobQueue {
    backend: Arc<dyn JobQueueBackend>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl JobQueue {
    /// Picks the single enabled backend among `candidates`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::NoBackendEnabled` or
    /// `QueueError::MultipleBackendsEnabled` unless exactly one is enabled.
    pub fn select(candidates: Vec<Arc<dyn JobQueueBackend>>) -> QueueResult<Self> {
        let mut enabled: Vec<Arc<dyn JobQueueBackend>> = candidates
            .into_iter()
            .filter(|backend| backend.is_enabled())
            .collect();

        match enabled.len() {
            0 => Err(QueueError::NoBackendEnabled),
            1 => {
                let backend = enabled.remove(0);
                info!(backend = %backend.name(), "Job queue backend selected");
                Ok(Self { backend })
            }
            _ => Err(QueueError::MultipleBackendsEnabled(
                enabled
                    .iter()
                    .map(|backend| backend.name().to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            )),
        }
    }

    /// Builds the backend named by `config` and selects it.
    pub async fn from_config(config: &JobsConfig) -> QueueResult<Self> {
        config.validate()?;

        let backend: Arc<dyn JobQueueBackend> = match config.backend {
            BackendKind::Local => Arc::new(LocalBackend::with_options(BackendOptions {
                max_retries: config.max_retries,
                max_failed: config.max_failed,
            })),
            BackendKind::Redis => Arc::new(RedisBackend::from_config(config).await?),
        };

        Self::select(vec![backend])
    }

    /// A queue over a fresh local backend.
    pub fn local() -> Self {
        Self {
            backend: Arc::new(LocalBackend::new()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn JobQueueBackend> {
        &self.backend
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub async fn set_job_types(&self, types: JobTypes) {
        self.backend.set_job_types(Arc::new(types)).await;
    }

    /// Enqueues a job, or stores a job set and queues its setup job.
    pub async fn push(&self, job: impl Into<BaseJob>) -> QueueResult<()> {
        self.backend.push(job.into(), false).await
    }

    /// Returns a taken job to the front of its lane.
    pub async fn untake(&self, job: Job) -> QueueResult<()> {
        self.backend.push(job.into(), true).await
    }

    pub async fn take(&self, job_type: &str, executor: &str) -> QueueResult<Option<Job>> {
        self.backend.take(job_type, executor).await
    }

    pub async fn done(&self, job_id: &str) -> QueueResult<bool> {
        self.backend.done(job_id).await
    }

    pub async fn error(&self, job_id: &str, error: &str, retry: bool) -> QueueResult<bool> {
        self.backend.error(job_id, error, retry).await
    }

    pub async fn get_job(&self, job_id: &str) -> QueueResult<Option<Job>> {
        self.backend.get_job(job_id).await
    }

    pub async fn get_set(&self, set_id: &str) -> QueueResult<Option<JobSet>> {
        self.backend.get_set(set_id).await
    }

    pub async fn get_sets(&self) -> QueueResult<Vec<JobSet>> {
        self.backend.get_sets().await
    }

    pub async fn get_open(&self) -> QueueResult<Vec<LaneSnapshot>> {
        self.backend.get_open().await
    }

    pub async fn get_taken(&self) -> QueueResult<Vec<Job>> {
        self.backend.get_taken().await
    }

    pub async fn get_failed(&self) -> QueueResult<Vec<Job>> {
        self.backend.get_failed().await
    }

    pub async fn update_job(&self, job_id: &str, delta: i64) -> QueueResult<bool> {
        self.backend.update_job(job_id, delta).await
    }

    pub async fn update_job_set(
        &self,
        set_id: &str,
        delta: i64,
        params: &Map<String, Value>,
    ) -> QueueResult<bool> {
        self.backend.update_job_set(set_id, delta, params).await
    }

    pub async fn init_job_set(
        &self,
        set_id: &str,
        total: i64,
        params: &Map<String, Value>,
    ) -> QueueResult<bool> {
        self.backend.init_job_set(set_id, total, params).await
    }

    pub async fn start_job_set(&self, set_id: &str) -> QueueResult<bool> {
        self.backend.start_job_set(set_id).await
    }

    pub async fn done_set(&self, set_id: &str) -> QueueResult<bool> {
        self.backend.done_set(set_id).await
    }

    pub async fn clear_failed(&self) -> QueueResult<usize> {
        self.backend.clear_failed().await
    }

    pub async fn on_push(&self, listener: PushListener) -> QueueResult<()> {
        self.backend.on_push(listener).await
    }

    /// Collects lanes, taken and failed jobs, and sets in one report.
    pub async fn snapshot(&self) -> QueueResult<QueueSnapshot> {
        let (open, taken, failed, sets) = tokio::try_join!(
            self.get_open(),
            self.get_taken(),
            self.get_failed(),
            self.get_sets()
        )?;

        Ok(QueueSnapshot {
            backend: self.backend_name().to_string(),
            state: self.backend.state().await,
            open,
            taken,
            failed,
            sets,
        })
    }

    /// Registers the queue, with its backend as dependency, for health checks.
    pub async fn register_health(&self, registry: &dyn VolatileRegistry) {
        let backend: Arc<dyn Volatile> = Arc::new(BackendHealth(Arc::clone(&self.backend)));
        registry.register(Arc::new(self.clone()), vec![backend]).await;
    }
}

#[async_trait]
impl Volatile for JobQueue {
    fn name(&self) -> &str {
        "jobs"
    }

    async fn state(&self) -> HealthState {
        self.backend.state().await
    }
}

/// Exposes a backend as a health component.
struct BackendHealth(Arc<dyn JobQueueBackend>);

#[async_trait]
impl Volatile for BackendHealth {
    fn name(&self) -> &str {
        self.0.name()
    }

    async fn state(&self) -> HealthState {
        self.0.state().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::health::SimpleRegistry;

    fn local(enabled: bool) -> Arc<dyn JobQueueBackend> {
        if enabled {
            Arc::new(LocalBackend::new())
        } else {
            Arc::new(LocalBackend::disabled())
        }
    }

    #[test]
    fn test_select_requires_an_enabled_backend() {
        let result = JobQueue::select(vec![local(false)]);
        assert!(matches!(result, Err(QueueError::NoBackendEnabled)));

        let result = JobQueue::select(Vec::new());
        assert!(matches!(result, Err(QueueError::NoBackendEnabled)));
    }

    #[test]
    fn test_select_rejects_multiple_enabled_backends() {
        let result = JobQueue::select(vec![local(true), local(true)]);
        match result {
            Err(QueueError::MultipleBackendsEnabled(names)) => assert_eq!(names, "local, local"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_select_picks_the_enabled_backend() {
        let queue = JobQueue::select(vec![local(false), local(true)]).unwrap();
        assert_eq!(queue.backend_name(), "local");
    }

    #[tokio::test]
    async fn test_from_config_local() {
        let queue = JobQueue::from_config(&JobsConfig::default()).await.unwrap();
        assert_eq!(queue.backend_name(), "local");
    }

    #[tokio::test]
    async fn test_push_take_untake() {
        let queue = JobQueue::local();
        queue
            .push(Job::new("tiles", Value::Null).with_id("a"))
            .await
            .unwrap();

        let job = queue.take("tiles", "e").await.unwrap().unwrap();
        assert_eq!(job.id, "a");
        queue.untake(job).await.unwrap();

        assert!(queue.get_taken().await.unwrap().is_empty());
        assert_eq!(queue.get_open().await.unwrap()[0].jobs[0].id, "a");
    }

    #[tokio::test]
    async fn test_snapshot() {
        let queue = JobQueue::local();
        queue
            .push(JobSet::new("seed", "Seed", Value::Null).with_id("s"))
            .await
            .unwrap();
        queue.push(Job::new("tiles", Value::Null)).await.unwrap();

        let snapshot = queue.snapshot().await.unwrap();
        assert_eq!(snapshot.backend, "local");
        assert_eq!(snapshot.state, HealthState::Available);
        assert_eq!(snapshot.open.len(), 1);
        assert_eq!(snapshot.sets.len(), 1);
        assert!(snapshot.taken.is_empty());
    }

    #[tokio::test]
    async fn test_register_health() {
        let queue = JobQueue::local();
        let registry = SimpleRegistry::new();
        queue.register_health(&registry).await;

        let report = registry.report().await;
        assert_eq!(report[0].name, "jobs");
        assert_eq!(report[0].state, HealthState::Available);
        assert_eq!(report[0].components[0].name, "local");
    }
}
