//! Job definitions for the scheduler.
//!
//! This module defines the core data model used by every backend:
//!
//! - `Job`: A unit of work taken and executed by a runner
//! - `JobSet`: A named group of jobs with aggregate progress and follow-ups
//! - `BaseJob`: Either of the above, as pushed by producers
//! - `JobSetDetails` / `JobTypes`: Typed, domain-specific set progress
//! - `JobResult`: Outcome reported by a processor
//!
//! All types here are plain data. Transition methods take the current time
//! explicitly so the backends decide which clock to use.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Default priority for jobs and job sets.
pub const DEFAULT_PRIORITY: i32 = 0;

/// Current time as epoch seconds, the resolution stored in job documents.
pub fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

/// A unit of work.
///
/// Jobs are stored by the backend while queued or taken, and removed once
/// done. Permanently failed jobs stay around in the failed list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique identifier for this job.
    pub id: String,
    /// Job type, selects the lane and the processor.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Priority of the job (higher values are served first).
    #[serde(default)]
    pub priority: i32,
    /// Id of the owning job set, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_of: Option<String>,
    /// Opaque payload interpreted by the processor.
    #[serde(default)]
    pub details: Value,
    /// Creation time (epoch seconds).
    pub created_at: i64,
    /// Last update time (epoch seconds). Doubles as the liveness signal.
    pub updated_at: i64,
    /// Work units completed so far.
    #[serde(default)]
    pub current: i64,
    /// Total work units, `0` while unknown.
    #[serde(default)]
    pub total: i64,
    /// Number of failed attempts so far.
    #[serde(default)]
    pub retries: u32,
    /// Executor currently holding the job, set only while taken.
    #[serde(default)]
    pub executor: Option<String>,
    /// Message of the last failure.
    #[serde(default)]
    pub error: Option<String>,
    /// Jobs to enqueue once this job's result is known.
    #[serde(default)]
    pub follow_ups: Vec<BaseJob>,
}

impl Job {
    /// Creates a new job with a fresh id and default priority.
    pub fn new(job_type: impl Into<String>, details: Value) -> Self {
        let now = now_epoch();
        Self {
            id: Uuid::new_v4().to_string(),
            job_type: job_type.into(),
            priority: DEFAULT_PRIORITY,
            part_of: None,
            details,
            created_at: now,
            updated_at: now,
            current: 0,
            total: 0,
            retries: 0,
            executor: None,
            error: None,
            follow_ups: Vec::new(),
        }
    }

    /// Sets an explicit id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Makes this job a member of the given job set.
    pub fn with_part_of(mut self, set_id: impl Into<String>) -> Self {
        self.part_of = Some(set_id.into());
        self
    }

    /// Sets the total number of work units.
    pub fn with_total(mut self, total: i64) -> Self {
        self.total = total.max(0);
        self
    }

    /// Appends a follow-up job.
    pub fn with_follow_up(mut self, follow_up: impl Into<BaseJob>) -> Self {
        self.follow_ups.push(follow_up.into());
        self
    }

    /// Decodes the details payload into a concrete type.
    pub fn details_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.details.clone())
    }

    /// Returns whether the job is currently held by an executor.
    pub fn is_taken(&self) -> bool {
        self.executor.is_some()
    }

    /// Marks the job as taken by `executor`.
    pub fn take(&mut self, executor: impl Into<String>, now: i64) {
        self.executor = Some(executor.into());
        self.updated_at = now;
    }

    /// Returns the job to the queued state without counting a failure.
    pub fn release(&mut self, now: i64) {
        self.executor = None;
        self.updated_at = now;
    }

    /// Adds `delta` work units, clamped to `total` once it is known.
    pub fn progress(&mut self, delta: i64, now: i64) {
        self.current = clamp_progress(self.current.saturating_add(delta), self.total);
        self.updated_at = now;
    }

    /// Prepares the job for another attempt after a failure.
    pub fn retry(&mut self, error: impl Into<String>, now: i64) {
        self.retries += 1;
        self.error = Some(error.into());
        self.current = 0;
        self.executor = None;
        self.updated_at = now;
    }

    /// Marks the job as permanently failed.
    pub fn fail(&mut self, error: impl Into<String>, now: i64) {
        self.error = Some(error.into());
        self.executor = None;
        self.updated_at = now;
    }

    /// Work units to credit to the owning set when this job finishes.
    ///
    /// A job without a known total counts as a single unit.
    pub fn remaining(&self) -> i64 {
        if self.total > 0 {
            (self.total - self.current).max(0)
        } else {
            1
        }
    }

    /// Returns whether the job has not been updated for longer than `timeout_secs`.
    pub fn is_stale(&self, now: i64, timeout_secs: i64) -> bool {
        now - self.updated_at > timeout_secs
    }

    /// Progress in percent, `0` while the total is unknown.
    pub fn percent(&self) -> u8 {
        percent_of(self.current, self.total)
    }
}

/// A named group of jobs sharing a goal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobSet {
    /// Unique identifier for this set.
    pub id: String,
    /// Set type, selects the details decoder.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Priority inherited by convention by the set's members.
    #[serde(default)]
    pub priority: i32,
    /// Domain-specific progress, see [`JobSetDetails`].
    #[serde(default)]
    pub details: Value,
    /// Creation time (epoch seconds).
    pub created_at: i64,
    /// Last update time (epoch seconds).
    pub updated_at: i64,
    /// Human readable label.
    pub label: String,
    /// Optional longer description.
    #[serde(default)]
    pub description: Option<String>,
    /// Completed work units.
    #[serde(default)]
    pub current: i64,
    /// Total work units, `0` until initialized.
    #[serde(default)]
    pub total: i64,
    /// When the first member (or the setup job) finished.
    #[serde(default)]
    pub started_at: Option<i64>,
    /// Job that has to complete before the set counts as started.
    #[serde(default)]
    pub setup: Option<Job>,
    /// Jobs to enqueue once the set is done.
    #[serde(default)]
    pub follow_ups: Vec<BaseJob>,
}

impl JobSet {
    /// Creates a new, uninitialized job set.
    pub fn new(job_type: impl Into<String>, label: impl Into<String>, details: Value) -> Self {
        let now = now_epoch();
        Self {
            id: Uuid::new_v4().to_string(),
            job_type: job_type.into(),
            priority: DEFAULT_PRIORITY,
            details,
            created_at: now,
            updated_at: now,
            label: label.into(),
            description: None,
            current: 0,
            total: 0,
            started_at: None,
            setup: None,
            follow_ups: Vec::new(),
        }
    }

    /// Sets an explicit id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Sets the total number of work units.
    pub fn with_total(mut self, total: i64) -> Self {
        self.total = total.max(0);
        self
    }

    /// Sets the setup job.
    pub fn with_setup(mut self, setup: Job) -> Self {
        self.setup = Some(setup);
        self
    }

    /// Appends a follow-up job.
    pub fn with_follow_up(mut self, follow_up: impl Into<BaseJob>) -> Self {
        self.follow_ups.push(follow_up.into());
        self
    }

    /// The setup job as it should be queued, bound to this set.
    pub fn setup_job(&self) -> Option<Job> {
        self.setup.clone().map(|mut job| {
            job.part_of = Some(self.id.clone());
            job
        })
    }

    /// Returns whether `job` is this set's setup job.
    pub fn is_setup(&self, job: &Job) -> bool {
        self.setup.as_ref().is_some_and(|setup| setup.id == job.id)
    }

    /// Returns whether all work units are complete.
    ///
    /// A set whose total was never initialized is never done.
    pub fn is_done(&self) -> bool {
        self.total > 0 && self.current >= self.total
    }

    /// Returns whether the set has started.
    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    /// Progress in percent, `0` while the total is unknown.
    pub fn percent(&self) -> u8 {
        percent_of(self.current, self.total)
    }

    /// Adds `total` work units to the set's total.
    pub fn init(&mut self, total: i64, now: i64) {
        self.total = self.total.saturating_add(total.max(0));
        self.updated_at = now;
    }

    /// Marks the set as started, once.
    pub fn start(&mut self, now: i64) {
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        self.updated_at = now;
    }

    /// Adds `delta` completed units.
    ///
    /// Returns `true` only for the call that moves the set into done.
    pub fn advance(&mut self, delta: i64, now: i64) -> bool {
        let was_done = self.is_done();
        self.current = self.current.saturating_add(delta).max(0);
        self.updated_at = now;
        !was_done && self.is_done()
    }

    /// Removes a retried member's contribution.
    pub fn reset_member(&mut self, job: &Job, now: i64) {
        self.current = self.current.saturating_sub(job.current).max(0);
        self.updated_at = now;
    }

    /// Accounts for a finished (done or permanently failed) member.
    ///
    /// Returns the set's follow-ups if this member completed the set.
    pub fn complete_member(&mut self, job: &Job, now: i64) -> Vec<BaseJob> {
        if self.is_setup(job) {
            self.start(now);
            return Vec::new();
        }
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if self.advance(job.remaining(), now) {
            self.follow_ups.clone()
        } else {
            Vec::new()
        }
    }

    /// Returns whether the set is done and untouched for longer than `retention_secs`.
    pub fn is_expired(&self, now: i64, retention_secs: i64) -> bool {
        self.is_done() && now - self.updated_at > retention_secs
    }

    /// Decodes the details payload into a concrete type.
    pub fn details_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.details.clone())
    }

    /// Applies `f` to the decoded details and stores the result.
    pub fn update_details<F>(&mut self, types: &JobTypes, f: F) -> Result<(), serde_json::Error>
    where
        F: FnOnce(&mut dyn JobSetDetails),
    {
        let mut details = types.decode(&self.job_type, &self.details)?;
        f(details.as_mut());
        self.details = details.to_value()?;
        Ok(())
    }
}

/// Limits a job's counter to `0..=total`, or `0..` while the total is unknown.
pub(crate) fn clamp_progress(current: i64, total: i64) -> i64 {
    let current = current.max(0);
    if total > 0 {
        current.min(total)
    } else {
        current
    }
}

fn percent_of(current: i64, total: i64) -> u8 {
    if total <= 0 {
        return 0;
    }
    (i128::from(current.clamp(0, total)) * 100 / i128::from(total)) as u8
}

/// A job or job set, as pushed by producers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BaseJob {
    Job(Job),
    Set(JobSet),
}

impl BaseJob {
    pub fn id(&self) -> &str {
        match self {
            BaseJob::Job(job) => &job.id,
            BaseJob::Set(set) => &set.id,
        }
    }

    pub fn job_type(&self) -> &str {
        match self {
            BaseJob::Job(job) => &job.job_type,
            BaseJob::Set(set) => &set.job_type,
        }
    }

    pub fn priority(&self) -> i32 {
        match self {
            BaseJob::Job(job) => job.priority,
            BaseJob::Set(set) => set.priority,
        }
    }
}

impl From<Job> for BaseJob {
    fn from(job: Job) -> Self {
        BaseJob::Job(job)
    }
}

impl From<JobSet> for BaseJob {
    fn from(set: JobSet) -> Self {
        BaseJob::Set(set)
    }
}

/// Domain-specific progress of a job set.
///
/// Hooks receive free-form parameters reported alongside progress deltas so
/// the scheduler never needs to know the shape of the details.
pub trait JobSetDetails: Send + Sync {
    /// Called when the set is initialized with its total.
    fn init(&mut self, params: &Map<String, Value>) {
        self.update(params);
    }

    /// Called with every progress report.
    fn update(&mut self, params: &Map<String, Value>);

    /// Called when a member is retried, to drop its partial contribution.
    fn reset(&mut self, _job: &Job) {}

    /// Encodes the details for storage.
    fn to_value(&self) -> Result<Value, serde_json::Error>;
}

/// Details used for set types without a registered decoder.
///
/// Numeric parameters are summed, everything else is replaced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenericDetails(pub Map<String, Value>);

impl GenericDetails {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Object(map) => Self(map.clone()),
            Value::Null => Self::default(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.clone());
                Self(map)
            }
        }
    }
}

impl JobSetDetails for GenericDetails {
    fn init(&mut self, params: &Map<String, Value>) {
        for (key, value) in params {
            self.0.insert(key.clone(), value.clone());
        }
    }

    fn update(&mut self, params: &Map<String, Value>) {
        for (key, value) in params {
            let merged = match (self.0.get(key), value) {
                (Some(Value::Number(old)), Value::Number(new)) => {
                    match (old.as_i64(), new.as_i64()) {
                        (Some(a), Some(b)) => match a.checked_add(b) {
                            Some(sum) => Value::from(sum),
                            None => Value::from(a as f64 + b as f64),
                        },
                        _ => Value::from(old.as_f64().unwrap_or(0.0) + new.as_f64().unwrap_or(0.0)),
                    }
                }
                _ => value.clone(),
            };
            self.0.insert(key.clone(), merged);
        }
    }

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        Ok(Value::Object(self.0.clone()))
    }
}

/// Decoder turning a stored details payload into its typed form.
pub type DetailsDecoder =
    Arc<dyn Fn(&Value) -> Result<Box<dyn JobSetDetails>, serde_json::Error> + Send + Sync>;

/// Registry of typed job set details, keyed by job type.
#[derive(Clone, Default)]
pub struct JobTypes {
    decoders: HashMap<String, DetailsDecoder>,
}

impl fmt::Debug for JobTypes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.decoders.keys().collect();
        types.sort();
        f.debug_struct("JobTypes").field("types", &types).finish()
    }
}

impl JobTypes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `D` as the details type for `job_type`.
    pub fn register<D>(mut self, job_type: impl Into<String>) -> Self
    where
        D: JobSetDetails + DeserializeOwned + 'static,
    {
        let decoder: DetailsDecoder = Arc::new(|value: &Value| {
            let details: D = serde_json::from_value(value.clone())?;
            Ok(Box::new(details) as Box<dyn JobSetDetails>)
        });
        self.decoders.insert(job_type.into(), decoder);
        self
    }

    /// Registers a custom decoder for `job_type`.
    pub fn insert(&mut self, job_type: impl Into<String>, decoder: DetailsDecoder) {
        self.decoders.insert(job_type.into(), decoder);
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.decoders.contains_key(job_type)
    }

    /// Decodes `value` with the decoder registered for `job_type`.
    ///
    /// Unregistered types fall back to [`GenericDetails`].
    pub fn decode(
        &self,
        job_type: &str,
        value: &Value,
    ) -> Result<Box<dyn JobSetDetails>, serde_json::Error> {
        match self.decoders.get(job_type) {
            Some(decoder) => decoder(value),
            None => Ok(Box::new(GenericDetails::from_value(value))),
        }
    }
}

/// Outcome of processing a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    /// The job completed.
    Success,
    /// The job failed; `retryable` failures are re-queued up to the retry limit.
    Failure { error: String, retryable: bool },
    /// The processor will push the job again itself later.
    OnHold,
}

impl JobResult {
    pub fn success() -> Self {
        JobResult::Success
    }

    pub fn failure(error: impl Into<String>, retryable: bool) -> Self {
        JobResult::Failure {
            error: error.into(),
            retryable,
        }
    }

    /// A transient failure that should be retried.
    pub fn retry(error: impl Into<String>) -> Self {
        Self::failure(error, true)
    }

    /// A permanent failure.
    pub fn error(error: impl Into<String>) -> Self {
        Self::failure(error, false)
    }

    pub fn on_hold() -> Self {
        JobResult::OnHold
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobResult::Success)
    }

    /// Short label used for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            JobResult::Success => "success",
            JobResult::Failure { .. } => "failure",
            JobResult::OnHold => "on_hold",
        }
    }
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobResult::Failure { error, retryable } => {
                write!(f, "failure ({}, retryable: {})", error, retryable)
            }
            other => f.write_str(other.label()),
        }
    }
}
