//! In-process job queue backend.
//!
//! All state lives behind a single async mutex, so each operation (including
//! the follow-up pushes it triggers) is atomic. Nothing is persisted: jobs
//! are lost when the process exits.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use super::{apply_details, BackendOptions, JobQueueBackend, LaneSnapshot, PushListener};
use crate::error::QueueResult;
use crate::scheduler::health::{HealthState, Volatile};
use crate::scheduler::job::{now_epoch, BaseJob, Job, JobSet, JobTypes};

/// Lanes of one job type, keyed by priority.
type Lanes = BTreeMap<i32, VecDeque<String>>;

#[derive(Default)]
struct LocalState {
    lanes: HashMap<String, Lanes>,
    jobs: HashMap<String, Job>,
    sets: HashMap<String, JobSet>,
    taken: Vec<String>,
    /// Newest first.
    failed: VecDeque<String>,
    types: Arc<JobTypes>,
}

impl LocalState {
    fn lane_mut(&mut self, job_type: &str, priority: i32) -> &mut VecDeque<String> {
        self.lanes
            .entry(job_type.to_string())
            .or_default()
            .entry(priority)
            .or_default()
    }

    fn remove_from_lane(&mut self, job: &Job) {
        if let Some(lane) = self
            .lanes
            .get_mut(&job.job_type)
            .and_then(|lanes| lanes.get_mut(&job.priority))
        {
            lane.retain(|id| id != &job.id);
        }
    }

    fn untake_position(&self, job_id: &str) -> Option<usize> {
        self.taken.iter().position(|id| id == job_id)
    }

    fn push(&mut self, job: BaseJob, untake: bool, now: i64) {
        match job {
            BaseJob::Job(job) => self.push_job(job, untake, now),
            BaseJob::Set(set) => {
                let setup = set.setup_job();
                debug!(set_id = %set.id, job_type = %set.job_type, "Job set stored");
                self.sets.insert(set.id.clone(), set);
                if let Some(setup) = setup {
                    self.push_job(setup, false, now);
                }
            }
        }
    }

    fn push_job(&mut self, mut job: Job, untake: bool, now: i64) {
        let was_taken = match self.untake_position(&job.id) {
            Some(pos) => {
                self.taken.remove(pos);
                true
            }
            None => false,
        };

        if untake {
            if !was_taken && self.jobs.contains_key(&job.id) {
                return;
            }
            // Keep the stored document, it carries the latest progress.
            let mut stored = self.jobs.remove(&job.id).unwrap_or(job);
            stored.release(now);
            let (job_type, priority) = (stored.job_type.clone(), stored.priority);
            self.lane_mut(&job_type, priority).push_front(stored.id.clone());
            self.jobs.insert(stored.id.clone(), stored);
            return;
        }

        if let Some(previous) = self.jobs.remove(&job.id) {
            self.remove_from_lane(&previous);
        }
        self.failed.retain(|id| id != &job.id);
        job.executor = None;
        let (job_type, priority) = (job.job_type.clone(), job.priority);
        self.lane_mut(&job_type, priority).push_back(job.id.clone());
        self.jobs.insert(job.id.clone(), job);
    }

    fn take(&mut self, job_type: &str, executor: &str, now: i64) -> Option<Job> {
        let lanes = self.lanes.get_mut(job_type)?;
        let mut taken_id = None;
        for lane in lanes.values_mut().rev() {
            while let Some(id) = lane.pop_front() {
                if self.jobs.contains_key(&id) {
                    taken_id = Some(id);
                    break;
                }
            }
            if taken_id.is_some() {
                break;
            }
        }

        let id = taken_id?;
        let job = self.jobs.get_mut(&id)?;
        job.take(executor, now);
        self.taken.push(id);
        Some(job.clone())
    }

    /// Credits a finished member to its set and collects all follow-ups.
    fn finish(&mut self, job: &Job, now: i64) -> Vec<BaseJob> {
        let mut follow_ups = job.follow_ups.clone();
        if let Some(set) = job.part_of.as_ref().and_then(|id| self.sets.get_mut(id)) {
            let set_follow_ups = set.complete_member(job, now);
            if set.is_done() && !set_follow_ups.is_empty() {
                debug!(set_id = %set.id, "Job set done, pushing follow-ups");
            }
            follow_ups.extend(set_follow_ups);
        }
        follow_ups
    }
}

/// In-process backend for single-instance deployments and tests.
pub struct LocalBackend {
    enabled: bool,
    options: BackendOptions,
    state: Mutex<LocalState>,
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalBackend {
    /// Creates an enabled backend with default limits.
    pub fn new() -> Self {
        Self::with_options(BackendOptions::default())
    }

    pub fn with_options(options: BackendOptions) -> Self {
        Self {
            enabled: true,
            options,
            state: Mutex::new(LocalState::default()),
        }
    }

    /// Creates a backend that reports itself as disabled.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    pub fn options(&self) -> BackendOptions {
        self.options
    }
}

#[async_trait]
impl Volatile for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn state(&self) -> HealthState {
        HealthState::Available
    }
}

#[async_trait]
impl JobQueueBackend for LocalBackend {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn set_job_types(&self, types: Arc<JobTypes>) {
        self.state.lock().await.types = types;
    }

    async fn push(&self, job: BaseJob, untake: bool) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.push(job, untake, now_epoch());
        Ok(())
    }

    async fn take(&self, job_type: &str, executor: &str) -> QueueResult<Option<Job>> {
        let mut state = self.state.lock().await;
        Ok(state.take(job_type, executor, now_epoch()))
    }

    async fn done(&self, job_id: &str) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        let Some(pos) = state.untake_position(job_id) else {
            return Ok(false);
        };
        state.taken.remove(pos);

        let now = now_epoch();
        let Some(job) = state.jobs.remove(job_id) else {
            return Ok(true);
        };

        for follow_up in state.finish(&job, now) {
            state.push(follow_up, false, now);
        }

        Ok(true)
    }

    async fn error(&self, job_id: &str, error: &str, retry: bool) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        let Some(pos) = state.untake_position(job_id) else {
            return Ok(false);
        };
        state.taken.remove(pos);

        let now = now_epoch();
        let Some(mut job) = state.jobs.remove(job_id) else {
            return Ok(true);
        };

        if retry && job.retries < self.options.max_retries {
            let types = Arc::clone(&state.types);
            if let Some(set) = job.part_of.as_ref().and_then(|id| state.sets.get_mut(id)) {
                set.reset_member(&job, now);
                apply_details(set, &types, |details| details.reset(&job));
            }

            job.retry(error, now);
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                retries = job.retries,
                error = %error,
                "Job failed, re-queued for retry"
            );
            let (job_type, priority) = (job.job_type.clone(), job.priority);
            state.lane_mut(&job_type, priority).push_front(job.id.clone());
            state.jobs.insert(job.id.clone(), job);
            return Ok(true);
        }

        job.fail(error, now);
        error!(
            job_id = %job.id,
            job_type = %job.job_type,
            retries = job.retries,
            error = %error,
            "Job failed permanently"
        );

        let follow_ups = state.finish(&job, now);
        state.failed.retain(|id| id != &job.id);
        state.failed.push_front(job.id.clone());
        state.jobs.insert(job.id.clone(), job);
        while state.failed.len() > self.options.max_failed {
            if let Some(evicted) = state.failed.pop_back() {
                state.jobs.remove(&evicted);
            }
        }

        for follow_up in follow_ups {
            state.push(follow_up, false, now);
        }

        Ok(true)
    }

    async fn get_job(&self, job_id: &str) -> QueueResult<Option<Job>> {
        Ok(self.state.lock().await.jobs.get(job_id).cloned())
    }

    async fn get_set(&self, set_id: &str) -> QueueResult<Option<JobSet>> {
        Ok(self.state.lock().await.sets.get(set_id).cloned())
    }

    async fn get_sets(&self) -> QueueResult<Vec<JobSet>> {
        let state = self.state.lock().await;
        let mut sets: Vec<JobSet> = state.sets.values().cloned().collect();
        sets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(sets)
    }

    async fn get_open(&self) -> QueueResult<Vec<LaneSnapshot>> {
        let state = self.state.lock().await;
        let mut types: Vec<&String> = state.lanes.keys().collect();
        types.sort();

        let mut snapshots = Vec::new();
        for job_type in types {
            for (priority, lane) in state.lanes[job_type].iter().rev() {
                let jobs: Vec<Job> = lane
                    .iter()
                    .filter_map(|id| state.jobs.get(id).cloned())
                    .collect();
                if jobs.is_empty() {
                    continue;
                }
                snapshots.push(LaneSnapshot {
                    job_type: job_type.clone(),
                    priority: *priority,
                    jobs,
                });
            }
        }
        Ok(snapshots)
    }

    async fn get_taken(&self) -> QueueResult<Vec<Job>> {
        let state = self.state.lock().await;
        Ok(state
            .taken
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect())
    }

    async fn get_failed(&self) -> QueueResult<Vec<Job>> {
        let state = self.state.lock().await;
        Ok(state
            .failed
            .iter()
            .filter_map(|id| state.jobs.get(id).cloned())
            .collect())
    }

    async fn update_job(&self, job_id: &str, delta: i64) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(job_id) {
            Some(job) => {
                job.progress(delta, now_epoch());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_job_set(
        &self,
        set_id: &str,
        delta: i64,
        params: &Map<String, Value>,
    ) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        let now = now_epoch();
        let types = Arc::clone(&state.types);
        let Some(set) = state.sets.get_mut(set_id) else {
            return Ok(false);
        };

        let crossed = set.advance(delta, now);
        apply_details(set, &types, |details| details.update(params));
        let follow_ups = if crossed {
            set.follow_ups.clone()
        } else {
            Vec::new()
        };

        for follow_up in follow_ups {
            state.push(follow_up, false, now);
        }
        Ok(true)
    }

    async fn init_job_set(
        &self,
        set_id: &str,
        total: i64,
        params: &Map<String, Value>,
    ) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        let now = now_epoch();
        let types = Arc::clone(&state.types);
        let Some(set) = state.sets.get_mut(set_id) else {
            return Ok(false);
        };

        let was_done = set.is_done();
        set.init(total, now);
        apply_details(set, &types, |details| details.init(params));
        let follow_ups = if !was_done && set.is_done() {
            set.follow_ups.clone()
        } else {
            Vec::new()
        };

        for follow_up in follow_ups {
            state.push(follow_up, false, now);
        }
        Ok(true)
    }

    async fn start_job_set(&self, set_id: &str) -> QueueResult<bool> {
        let mut state = self.state.lock().await;
        match state.sets.get_mut(set_id) {
            Some(set) => {
                set.start(now_epoch());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn done_set(&self, set_id: &str) -> QueueResult<bool> {
        Ok(self.state.lock().await.sets.remove(set_id).is_some())
    }

    async fn clear_failed(&self) -> QueueResult<usize> {
        let mut state = self.state.lock().await;
        let failed: Vec<String> = state.failed.drain(..).collect();
        for id in &failed {
            state.jobs.remove(id);
        }
        Ok(failed.len())
    }

    async fn on_push(&self, _listener: PushListener) -> QueueResult<()> {
        Ok(())
    }
}
