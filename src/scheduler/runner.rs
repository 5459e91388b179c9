//! Job runner: dispatches queued jobs to processors.
//!
//! The runner drives three independent loops:
//!
//! - **Dispatch** (every `poll_interval`, or when woken by a push
//!   notification or a finished job): for each processor, take jobs while a
//!   worker permit is free. Jobs of a set are gated by the set's concurrency
//!   ceiling; a job over the ceiling is returned to the front of its lane and
//!   the processor is skipped until the next tick.
//! - **Sweep** (every `orphan_sweep_interval`): returns taken jobs that have
//!   not been updated for `orphan_timeout` to their lanes, and removes done
//!   sets older than `done_set_retention`.
//! - **Progress log** (every `progress_log_interval`, debug level only).
//!
//! Each job executes on its own task. Processor errors and panics become
//! retryable failures.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backend::PushListener;
use super::bounded::BoundedMap;
use super::job::{now_epoch, Job, JobResult, JobSet};
use super::queue::JobQueue;
use crate::config::{parse_env_value, ConfigError};
use crate::error::{QueueError, QueueResult};
use crate::metrics::MetricsCollector;

/// Default capacity of the per-set concurrency gate cache.
pub const DEFAULT_GATE_CAPACITY: usize = 1024;

/// Errors that can occur in the job runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Runner is already running.
    #[error("Runner is already running")]
    AlreadyRunning,

    /// Runner is not running.
    #[error("Runner is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),

    /// Queue operation failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Configuration for the job runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum number of jobs executing at once.
    pub max_threads: usize,
    /// Executor name recorded on taken jobs.
    pub executor: String,
    /// Interval of the dispatch loop.
    pub poll_interval: Duration,
    /// Interval of the orphan sweep.
    pub orphan_sweep_interval: Duration,
    /// Idle time after which a taken job counts as orphaned.
    pub orphan_timeout: Duration,
    /// How long done sets are kept before removal.
    pub done_set_retention: Duration,
    /// Interval of the progress log.
    pub progress_log_interval: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Capacity of the per-set concurrency gate cache.
    pub gate_capacity: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            executor: format!("runner-{}", Uuid::new_v4()),
            poll_interval: Duration::from_secs(1),
            orphan_sweep_interval: Duration::from_secs(60),
            orphan_timeout: Duration::from_secs(60),
            done_set_retention: Duration::from_secs(3600),
            progress_log_interval: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
            gate_capacity: DEFAULT_GATE_CAPACITY,
        }
    }
}

impl RunnerConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(max_threads: usize) -> Self {
        Self {
            max_threads,
            ..Default::default()
        }
    }

    /// Sets the executor name.
    pub fn with_executor(mut self, executor: impl Into<String>) -> Self {
        self.executor = executor.into();
        self
    }

    /// Sets the maximum number of concurrent jobs.
    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads;
        self
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the orphan sweep interval.
    pub fn with_orphan_sweep_interval(mut self, interval: Duration) -> Self {
        self.orphan_sweep_interval = interval;
        self
    }

    /// Sets the orphan timeout.
    pub fn with_orphan_timeout(mut self, timeout: Duration) -> Self {
        self.orphan_timeout = timeout;
        self
    }

    /// Sets the done set retention.
    pub fn with_done_set_retention(mut self, retention: Duration) -> Self {
        self.done_set_retention = retention;
        self
    }

    /// Sets the progress log interval.
    pub fn with_progress_log_interval(mut self, interval: Duration) -> Self {
        self.progress_log_interval = interval;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the gate cache capacity.
    pub fn with_gate_capacity(mut self, capacity: usize) -> Self {
        self.gate_capacity = capacity;
        self
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_threads == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_threads must be greater than 0".to_string(),
            ));
        }

        if self.executor.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "executor cannot be empty".to_string(),
            ));
        }

        for (name, value) in [
            ("poll_interval", self.poll_interval),
            ("orphan_sweep_interval", self.orphan_sweep_interval),
            ("progress_log_interval", self.progress_log_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if self.gate_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "gate_capacity must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Parses a `max_threads` override, as given on the command line.
    pub fn parse_max_threads(value: &str) -> Result<usize, ConfigError> {
        parse_env_value(value, "max_threads")
    }
}

/// Executes jobs of one type.
///
/// The queue handle lets processors push further jobs and report progress
/// (`update_job` keeps a long-running job from being treated as orphaned).
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Job type served by this processor.
    fn job_type(&self) -> &str;

    /// Maximum number of jobs of `set` executing at once, across this runner.
    ///
    /// Queried once per set and cached.
    fn concurrency(&self, set: &JobSet) -> usize;

    /// Executes `job`. `set` is the owning job set, if any.
    async fn process(
        &self,
        job: &Job,
        set: Option<&JobSet>,
        queue: &JobQueue,
    ) -> anyhow::Result<JobResult>;
}

/// Statistics about the runner.
#[derive(Debug, Clone, Default)]
pub struct RunnerStats {
    /// Maximum number of concurrent jobs.
    pub max_threads: usize,
    /// Jobs currently executing.
    pub active_jobs: usize,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_on_hold: u64,
    /// Jobs returned to their lane by a set's concurrency ceiling.
    pub jobs_suspended: u64,
    pub orphans_recovered: u64,
    /// Average time spent in processors.
    pub average_job_duration: Duration,
}

impl RunnerStats {
    /// Returns the total number of jobs processed.
    pub fn total_processed(&self) -> u64 {
        self.jobs_succeeded + self.jobs_failed + self.jobs_on_hold
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_succeeded as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking runner statistics.
#[derive(Default)]
struct SharedRunnerStats {
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_on_hold: AtomicU64,
    jobs_suspended: AtomicU64,
    orphans_recovered: AtomicU64,
    total_duration_ms: AtomicU64,
    active_jobs: AtomicU64,
}

impl SharedRunnerStats {
    fn record_result(&self, result: &JobResult, duration: Duration) {
        let counter = match result {
            JobResult::Success => &self.jobs_succeeded,
            JobResult::Failure { .. } => &self.jobs_failed,
            JobResult::OnHold => &self.jobs_on_hold,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn to_runner_stats(&self, max_threads: usize) -> RunnerStats {
        let succeeded = self.jobs_succeeded.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let on_hold = self.jobs_on_hold.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let total_jobs = succeeded + failed + on_hold;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        RunnerStats {
            max_threads,
            active_jobs: self.active_jobs.load(Ordering::SeqCst) as usize,
            jobs_succeeded: succeeded,
            jobs_failed: failed,
            jobs_on_hold: on_hold,
            jobs_suspended: self.jobs_suspended.load(Ordering::SeqCst),
            orphans_recovered: self.orphans_recovered.load(Ordering::SeqCst),
            average_job_duration: average_duration,
        }
    }
}

/// Concurrency ceiling and in-flight counter of one job set.
#[derive(Debug)]
struct SetGate {
    ceiling: usize,
    in_flight: AtomicUsize,
}

impl SetGate {
    fn new(ceiling: usize) -> Self {
        Self {
            ceiling: ceiling.max(1),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Claims a slot unless the ceiling is reached.
    fn try_enter(&self) -> bool {
        self.in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.ceiling).then_some(n + 1)
            })
            .is_ok()
    }

    fn leave(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

struct RunnerInner {
    config: RunnerConfig,
    queue: JobQueue,
    processors: Vec<Arc<dyn JobProcessor>>,
    permits: Arc<Semaphore>,
    gates: Mutex<BoundedMap<String, Arc<SetGate>>>,
    wake: Notify,
    stats: SharedRunnerStats,
    metrics: MetricsCollector,
}

impl RunnerInner {
    fn handles(&self, job_type: &str) -> bool {
        self.processors.iter().any(|p| p.job_type() == job_type)
    }

    async fn dispatch_tick(self: &Arc<Self>) {
        for processor in &self.processors {
            if let Err(e) = self.dispatch_processor(processor).await {
                warn!(
                    job_type = %processor.job_type(),
                    error = %e,
                    "Dispatch failed"
                );
            }
        }
    }

    async fn dispatch_processor(
        self: &Arc<Self>,
        processor: &Arc<dyn JobProcessor>,
    ) -> QueueResult<()> {
        loop {
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                return Ok(());
            };
            let Some(job) = self
                .queue
                .take(processor.job_type(), &self.config.executor)
                .await?
            else {
                return Ok(());
            };

            let mut set = None;
            let mut gate = None;
            if let Some(set_id) = job.part_of.as_deref() {
                match self.queue.get_set(set_id).await {
                    Ok(Some(job_set)) => {
                        let set_gate = self.gate_for(&job_set, processor.as_ref()).await;
                        if !set_gate.try_enter() {
                            debug!(
                                job_id = %job.id,
                                set_id = %job_set.id,
                                ceiling = set_gate.ceiling,
                                "Job set at concurrency limit, suspending"
                            );
                            self.stats.jobs_suspended.fetch_add(1, Ordering::SeqCst);
                            self.metrics.record_suspended(&job.job_type);
                            self.queue.untake(job).await?;
                            return Ok(());
                        }
                        set = Some(job_set);
                        gate = Some(set_gate);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        let job_id = job.id.clone();
                        if let Err(untake_err) = self.queue.untake(job).await {
                            error!(job_id = %job_id, error = %untake_err, "Failed to return job");
                        }
                        return Err(e);
                    }
                }
            }

            self.spawn_job(Arc::clone(processor), job, set, gate, permit);
        }
    }

    async fn gate_for(&self, set: &JobSet, processor: &dyn JobProcessor) -> Arc<SetGate> {
        let mut gates = self.gates.lock().await;
        Arc::clone(gates.get_or_insert_with(set.id.clone(), || {
            Arc::new(SetGate::new(processor.concurrency(set)))
        }))
    }

    fn spawn_job(
        self: &Arc<Self>,
        processor: Arc<dyn JobProcessor>,
        job: Job,
        set: Option<JobSet>,
        gate: Option<Arc<SetGate>>,
        permit: OwnedSemaphorePermit,
    ) {
        let inner = Arc::clone(self);
        inner.stats.active_jobs.fetch_add(1, Ordering::SeqCst);
        inner.metrics.record_taken(&job.job_type);

        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.retries + 1,
            "Processing job"
        );

        tokio::spawn(async move {
            let _permit = permit;
            let start_time = Instant::now();

            let result = inner.execute(processor, &job, set).await;
            let duration = start_time.elapsed();

            if let Some(gate) = &gate {
                gate.leave();
            }
            inner.stats.active_jobs.fetch_sub(1, Ordering::SeqCst);
            inner.stats.record_result(&result, duration);
            inner
                .metrics
                .record_finished(&job.job_type, result.label(), duration);

            inner.report(&job, &result, duration).await;
            if let Some(set_id) = job.part_of.as_deref() {
                inner.refresh_gate(set_id).await;
            }
            inner.wake.notify_one();
        });
    }

    /// Runs the processor on its own task so a panic only fails this job.
    async fn execute(
        &self,
        processor: Arc<dyn JobProcessor>,
        job: &Job,
        set: Option<JobSet>,
    ) -> JobResult {
        let queue = self.queue.clone();
        let owned = job.clone();
        let handle = tokio::spawn(async move {
            processor.process(&owned, set.as_ref(), &queue).await
        });

        match handle.await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => JobResult::retry(format!("{:#}", e)),
            Err(e) if e.is_panic() => {
                let message = panic_message(e.into_panic());
                JobResult::retry(format!("processor panicked: {}", message))
            }
            Err(e) => JobResult::retry(e.to_string()),
        }
    }

    async fn report(&self, job: &Job, result: &JobResult, duration: Duration) {
        let outcome = match result {
            JobResult::Success => self.queue.done(&job.id).await,
            JobResult::Failure { error, retryable } => {
                self.queue.error(&job.id, error, *retryable).await
            }
            JobResult::OnHold => Ok(true),
        };

        match outcome {
            Ok(true) => debug!(
                job_id = %job.id,
                job_type = %job.job_type,
                result = result.label(),
                duration_ms = duration.as_millis() as u64,
                "Job finished"
            ),
            Ok(false) => debug!(
                job_id = %job.id,
                "Job was no longer taken when reporting its result"
            ),
            Err(e) => error!(
                job_id = %job.id,
                error = %e,
                "Failed to report job result"
            ),
        }
    }

    /// Drops the set's gate once the set is done or gone.
    async fn refresh_gate(&self, set_id: &str) {
        match self.queue.get_set(set_id).await {
            Ok(Some(set)) if !set.is_done() => {}
            Ok(_) => {
                self.gates.lock().await.remove(set_id);
            }
            Err(e) => warn!(set_id = %set_id, error = %e, "Failed to reload job set"),
        }
    }

    async fn sweep_orphans_at(&self, now: i64) -> QueueResult<usize> {
        let timeout = self.config.orphan_timeout.as_secs() as i64;
        let mut recovered = 0;

        for job in self.queue.get_taken().await? {
            if !job.is_stale(now, timeout) {
                continue;
            }
            debug!(
                job_id = %job.id,
                job_type = %job.job_type,
                executor = ?job.executor,
                idle_secs = now - job.updated_at,
                "Recovering orphaned job"
            );
            self.queue.untake(job).await?;
            recovered += 1;
        }

        if recovered > 0 {
            self.stats
                .orphans_recovered
                .fetch_add(recovered as u64, Ordering::SeqCst);
            self.metrics.record_orphans(recovered);
            self.wake.notify_one();
        }
        Ok(recovered)
    }

    async fn cleanup_done_sets_at(&self, now: i64) -> QueueResult<usize> {
        let retention = self.config.done_set_retention.as_secs() as i64;
        let mut removed = 0;

        for set in self.queue.get_sets().await? {
            if !set.is_expired(now, retention) {
                continue;
            }
            if self.queue.done_set(&set.id).await? {
                debug!(set_id = %set.id, label = %set.label, "Removed done job set");
                self.gates.lock().await.remove(&set.id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn sweep(&self) {
        let now = now_epoch();
        if let Err(e) = self.sweep_orphans_at(now).await {
            warn!(error = %e, "Orphan sweep failed");
        }
        if let Err(e) = self.cleanup_done_sets_at(now).await {
            warn!(error = %e, "Done set cleanup failed");
        }
    }

    async fn log_progress(&self) {
        if !tracing::enabled!(tracing::Level::DEBUG) {
            return;
        }

        let set_ids: Vec<String> = self
            .gates
            .lock()
            .await
            .iter()
            .map(|(id, _)| id.clone())
            .collect();

        for set_id in set_ids {
            if let Ok(Some(set)) = self.queue.get_set(&set_id).await {
                debug!(
                    set_id = %set.id,
                    label = %set.label,
                    percent = set.percent(),
                    description = set.description.as_deref().unwrap_or(""),
                    "Job set progress"
                );
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runner dispatching queued jobs to a set of processors.
pub struct JobRunner {
    inner: Arc<RunnerInner>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    is_running: AtomicBool,
    listening: AtomicBool,
}

impl JobRunner {
    /// Creates a runner for `processors` on `queue`.
    pub fn new(
        config: RunnerConfig,
        queue: JobQueue,
        processors: Vec<Arc<dyn JobProcessor>>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let max_threads = config.max_threads.max(1);
        let gate_capacity = config.gate_capacity;

        Self {
            inner: Arc::new(RunnerInner {
                config,
                queue,
                processors,
                permits: Arc::new(Semaphore::new(max_threads)),
                gates: Mutex::new(BoundedMap::new(gate_capacity)),
                wake: Notify::new(),
                stats: SharedRunnerStats::default(),
                metrics: MetricsCollector::new(),
            }),
            shutdown_tx,
            handles: Vec::new(),
            is_running: AtomicBool::new(false),
            listening: AtomicBool::new(false),
        }
    }

    /// Starts the dispatch, sweep and progress loops.
    ///
    /// # Errors
    ///
    /// Returns `RunnerError::AlreadyRunning` if the runner is already running.
    pub async fn start(&mut self) -> Result<(), RunnerError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(RunnerError::AlreadyRunning);
        }

        if !self.listening.swap(true, Ordering::SeqCst) {
            let weak: Weak<RunnerInner> = Arc::downgrade(&self.inner);
            let listener: PushListener = Arc::new(move |job_type: &str| {
                if let Some(inner) = weak.upgrade() {
                    if inner.handles(job_type) {
                        inner.wake.notify_one();
                    }
                }
            });
            if let Err(e) = self.inner.queue.on_push(listener).await {
                warn!(error = %e, "Push notifications unavailable, relying on polling");
            }
        }

        let config = &self.inner.config;
        self.handles.push(tokio::spawn(dispatch_loop(
            Arc::clone(&self.inner),
            self.shutdown_tx.subscribe(),
        )));
        self.handles.push(tokio::spawn(periodic_loop(
            "sweep",
            config.orphan_sweep_interval,
            self.shutdown_tx.subscribe(),
            Arc::clone(&self.inner),
            |inner| async move { inner.sweep().await },
        )));
        self.handles.push(tokio::spawn(periodic_loop(
            "progress",
            config.progress_log_interval,
            self.shutdown_tx.subscribe(),
            Arc::clone(&self.inner),
            |inner| async move { inner.log_progress().await },
        )));

        self.is_running.store(true, Ordering::SeqCst);
        info!(
            executor = %config.executor,
            max_threads = config.max_threads,
            job_types = ?self.job_types(),
            backend = %self.inner.queue.backend_name(),
            "Job runner started"
        );

        Ok(())
    }

    /// Stops the loops. Jobs already executing finish on their own tasks.
    ///
    /// # Errors
    ///
    /// Returns `RunnerError::ShutdownTimeout` if the loops don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), RunnerError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(RunnerError::NotRunning);
        }

        info!("Initiating job runner shutdown");

        // Loops may have already stopped.
        let _ = self.shutdown_tx.send(());

        let shutdown_timeout = self.inner.config.shutdown_timeout;
        let shutdown_future = async {
            for handle in self.handles.drain(..) {
                if let Err(e) = handle.await {
                    error!(error = %e, "Runner loop panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => {
                info!("Job runner shutdown complete");
                Ok(())
            }
            Err(_) => Err(RunnerError::ShutdownTimeout(shutdown_timeout)),
        }
    }

    /// Runs one dispatch pass over all processors.
    pub async fn dispatch_tick(&self) {
        self.inner.dispatch_tick().await;
    }

    /// Returns taken jobs idle for longer than the orphan timeout, as of `now`.
    pub async fn sweep_orphans_at(&self, now: i64) -> QueueResult<usize> {
        self.inner.sweep_orphans_at(now).await
    }

    /// Removes done sets older than the retention, as of `now`.
    pub async fn cleanup_done_sets_at(&self, now: i64) -> QueueResult<usize> {
        self.inner.cleanup_done_sets_at(now).await
    }

    /// Logs the progress of every gated job set at debug level.
    pub async fn log_progress(&self) {
        self.inner.log_progress().await;
    }

    /// Waits until no job is executing.
    pub async fn wait_idle(&self) {
        let permits = u32::try_from(self.inner.config.max_threads.max(1)).unwrap_or(u32::MAX);
        if let Ok(all) = self.inner.permits.acquire_many(permits).await {
            drop(all);
        }
    }

    /// In-flight count of a set, if its gate is cached.
    pub async fn in_flight(&self, set_id: &str) -> Option<usize> {
        self.inner
            .gates
            .lock()
            .await
            .get(set_id)
            .map(|gate| gate.in_flight.load(Ordering::SeqCst))
    }

    /// Returns current runner statistics.
    pub fn stats(&self) -> RunnerStats {
        self.inner
            .stats
            .to_runner_stats(self.inner.config.max_threads)
    }

    pub fn job_types(&self) -> Vec<&str> {
        self.inner.processors.iter().map(|p| p.job_type()).collect()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn queue(&self) -> &JobQueue {
        &self.inner.queue
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.inner.config
    }
}

async fn dispatch_loop(inner: Arc<RunnerInner>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut tick = tokio::time::interval(inner.config.poll_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tick.tick() => {}
            _ = inner.wake.notified() => {}
        }
        inner.dispatch_tick().await;
    }

    debug!("Dispatch loop stopped");
}

async fn periodic_loop<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
    inner: Arc<RunnerInner>,
    body: F,
) where
    F: Fn(Arc<RunnerInner>) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tick.tick().await; // skip the immediate first tick

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tick.tick() => body(Arc::clone(&inner)).await,
        }
    }

    debug!(task = name, "Runner loop stopped");
}
