//! Redis job queue backend.
//!
//! Jobs and job sets are stored as RedisJSON documents, lanes as lists of
//! job ids. The backend is safe to share between any number of processes.
//!
//! # Key Layout
//!
//! With the default prefix `xtraplatform:jobs`:
//!
//! - `{prefix}:queue:{type}:{priority}`: lane, list of job ids (head = next)
//! - `{prefix}:priorities:{type}`: sorted set of the priorities in use
//! - `{prefix}:taken`: list of job ids out for processing
//! - `{prefix}:failed`: list of permanently failed job ids, newest first
//! - `{prefix}:job:{id}`: job document
//! - `{prefix}:set:{id}`: job set document
//! - `{prefix}:notifications`: pub/sub channel, payload is the job type
//!
//! # Mutual Exclusion
//!
//! `take` runs a script that moves an id from a lane to `taken` with
//! `LMOVE` and stamps the executor on the document in the same step, so
//! only one caller can win a job and a taken job never looks idle. `done`,
//! `error` and untake all start with `LREM taken 1 id` and only proceed
//! when it removed the id. If a later step fails, the id goes back onto
//! `taken` and the orphan sweep recovers the job. Set completion compares
//! the counter before and after `JSON.NUMINCRBY`, so exactly one caller
//! observes the crossing and pushes the follow-ups.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{apply_details, BackendOptions, JobQueueBackend, LaneSnapshot, PushListener};
use crate::config::JobsConfig;
use crate::error::{QueueError, QueueResult};
use crate::scheduler::health::{HealthState, Volatile};
use crate::scheduler::job::{
    clamp_progress, now_epoch, BaseJob, Job, JobSet, JobSetDetails, JobTypes,
};

/// Timeout for the health check `PING`.
const PING_TIMEOUT: Duration = Duration::from_secs(2);

/// Batch size hint for `SCAN`.
const SCAN_COUNT: usize = 100;

/// Moves the head of a lane (`KEYS[1]`) to `taken` (`KEYS[2]`) and marks
/// the job document as taken by the executor in `ARGV[2]`.
///
/// `ARGV[1]` is the job key prefix, `ARGV[2]` the JSON-encoded executor and
/// `ARGV[3]` the current epoch second. Returns the job id, or nil when the
/// lane is empty.
const TAKE_SCRIPT: &str = r#"
local id = redis.call('LMOVE', KEYS[1], KEYS[2], 'LEFT', 'RIGHT')
if not id then
  return false
end
local key = ARGV[1] .. id
if redis.call('EXISTS', key) == 1 then
  redis.call('JSON.SET', key, '$.executor', ARGV[2])
  redis.call('JSON.SET', key, '$.updatedAt', ARGV[3])
end
return id
"#;

/// Redis key names for one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn queue(&self, job_type: &str, priority: i32) -> String {
        format!("{}:queue:{}:{}", self.prefix, job_type, priority)
    }

    pub fn priorities(&self, job_type: &str) -> String {
        format!("{}:priorities:{}", self.prefix, job_type)
    }

    pub fn taken(&self) -> String {
        format!("{}:taken", self.prefix)
    }

    pub fn failed(&self) -> String {
        format!("{}:failed", self.prefix)
    }

    pub fn job(&self, id: &str) -> String {
        format!("{}{}", self.job_prefix(), id)
    }

    /// Prefix shared by all job document keys.
    pub fn job_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    pub fn set(&self, id: &str) -> String {
        format!("{}:set:{}", self.prefix, id)
    }

    pub fn notifications(&self) -> String {
        format!("{}:notifications", self.prefix)
    }

    fn set_pattern(&self) -> String {
        format!("{}:set:*", self.prefix)
    }

    fn priorities_pattern(&self) -> String {
        format!("{}:priorities:*", self.prefix)
    }

    /// Extracts the job type from a priorities key.
    pub fn type_of_priorities_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.prefix.as_str())?
            .strip_prefix(":priorities:")
    }
}

/// Backend storing the queue in Redis.
///
/// Requires the RedisJSON module on the server.
pub struct RedisBackend {
    enabled: bool,
    client: redis::Client,
    redis: ConnectionManager,
    keys: Keys,
    options: BackendOptions,
    types: RwLock<Arc<JobTypes>>,
    listeners: Arc<RwLock<Vec<PushListener>>>,
    subscriber: Mutex<Option<JoinHandle<()>>>,
    take_script: redis::Script,
}

impl RedisBackend {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(
        redis_url: &str,
        prefix: &str,
        options: BackendOptions,
    ) -> QueueResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        info!(prefix = %prefix, "Connected to Redis job queue");

        Ok(Self {
            enabled: true,
            client,
            redis,
            keys: Keys::new(prefix),
            options,
            types: RwLock::new(Arc::new(JobTypes::default())),
            listeners: Arc::new(RwLock::new(Vec::new())),
            subscriber: Mutex::new(None),
            take_script: redis::Script::new(TAKE_SCRIPT),
        })
    }

    /// Connects using the Redis settings of `config`.
    pub async fn from_config(config: &JobsConfig) -> QueueResult<Self> {
        let options = BackendOptions {
            max_retries: config.max_retries,
            max_failed: config.max_failed,
        };
        Self::connect(&config.redis_url, &config.key_prefix, options).await
    }

    /// Overrides the enabled flag.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    async fn json_get<T: DeserializeOwned>(&self, key: &str) -> QueueResult<Option<T>> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = redis::cmd("JSON.GET")
            .arg(key)
            .query_async(&mut conn)
            .await?;

        raw.map(|s| decode_document(key, &s)).transpose()
    }

    async fn json_mget<T: DeserializeOwned>(&self, keys: &[String]) -> QueueResult<Vec<T>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let raw: Vec<Option<String>> = redis::cmd("JSON.MGET")
            .arg(keys)
            .arg("$")
            .query_async(&mut conn)
            .await?;

        let mut docs = Vec::with_capacity(raw.len());
        for (key, value) in keys.iter().zip(raw) {
            // Documents can disappear between listing and reading.
            let Some(value) = value else { continue };
            let mut matches: Vec<T> = decode_document(key, &value)?;
            if !matches.is_empty() {
                docs.push(matches.swap_remove(0));
            }
        }
        Ok(docs)
    }

    async fn json_set<T: Serialize + ?Sized>(&self, key: &str, path: &str, value: &T) -> QueueResult<()> {
        let mut conn = self.redis.clone();
        redis::cmd("JSON.SET")
            .arg(key)
            .arg(path)
            .arg(serde_json::to_string(value)?)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn json_incr(&self, key: &str, path: &str, delta: i64) -> QueueResult<i64> {
        let mut conn = self.redis.clone();
        let raw: String = redis::cmd("JSON.NUMINCRBY")
            .arg(key)
            .arg(path)
            .arg(delta)
            .query_async(&mut conn)
            .await?;
        parse_path_number(key, &raw)
    }

    async fn jobs_by_ids(&self, ids: &[String]) -> QueueResult<Vec<Job>> {
        let keys: Vec<String> = ids.iter().map(|id| self.keys.job(id)).collect();
        self.json_mget(&keys).await
    }

    async fn scan_keys(&self, pattern: &str) -> QueueResult<Vec<String>> {
        let mut conn = self.redis.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn priorities(&self, job_type: &str) -> QueueResult<Vec<i32>> {
        let mut conn = self.redis.clone();
        let priorities: Vec<i32> = conn.zrevrange(self.keys.priorities(job_type), 0, -1).await?;
        Ok(priorities)
    }

    async fn remove_taken(&self, job_id: &str) -> QueueResult<bool> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn.lrem(self.keys.taken(), 1, job_id).await?;
        Ok(removed > 0)
    }

    /// Puts `job_id` back onto `taken` after a transition failed halfway.
    async fn restore_taken(&self, job_id: &str) {
        let mut conn = self.redis.clone();
        match conn.rpush::<_, _, i64>(self.keys.taken(), job_id).await {
            Ok(_) => warn!(job_id = %job_id, "Transition failed, job returned to the taken list"),
            Err(e) => error!(
                job_id = %job_id,
                error = %e,
                "Transition failed and the job could not be returned to the taken list"
            ),
        }
    }

    async fn notify(&self, job_type: &str) {
        let mut conn = self.redis.clone();
        if let Err(e) = conn
            .publish::<_, _, ()>(self.keys.notifications(), job_type)
            .await
        {
            // Pollers pick the job up on their next tick.
            debug!(job_type = %job_type, error = %e, "Failed to publish push notification");
        }
    }

    /// Stores `job` and inserts it into its lane, at the front or the back.
    async fn enqueue(&self, job: &Job, front: bool) -> QueueResult<()> {
        let mut conn = self.redis.clone();
        let lane = self.keys.queue(&job.job_type, job.priority);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("JSON.SET")
            .arg(self.keys.job(&job.id))
            .arg("$")
            .arg(serde_json::to_string(job)?)
            .ignore()
            .zadd(self.keys.priorities(&job.job_type), job.priority, job.priority)
            .ignore();
        if front {
            pipe.lpush(&lane, &job.id).ignore();
        } else {
            pipe.lrem(&lane, 0, &job.id).ignore().rpush(&lane, &job.id).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        self.notify(&job.job_type).await;
        Ok(())
    }

    async fn push_job(&self, mut job: Job, untake: bool) -> QueueResult<()> {
        let now = now_epoch();

        if untake {
            let stored: Option<Job> = self.json_get(&self.keys.job(&job.id)).await?;
            let removed = self.remove_taken(&job.id).await?;
            if !removed && stored.is_some() {
                return Ok(());
            }
            // Keep the stored document, it carries the latest progress.
            let mut job = stored.unwrap_or(job);
            job.release(now);
            let result = self.enqueue(&job, true).await;
            if result.is_err() && removed {
                self.restore_taken(&job.id).await;
            }
            return result;
        }

        let mut conn = self.redis.clone();
        if let Some(previous) = self.json_get::<Job>(&self.keys.job(&job.id)).await? {
            let _: i64 = conn
                .lrem(self.keys.queue(&previous.job_type, previous.priority), 0, &job.id)
                .await?;
        }
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(self.keys.taken(), 0, &job.id)
            .ignore()
            .lrem(self.keys.failed(), 0, &job.id)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;

        job.executor = None;
        self.enqueue(&job, false).await
    }

    async fn push_all(&self, jobs: Vec<BaseJob>) -> QueueResult<()> {
        for job in jobs {
            self.push_base(job, false).await?;
        }
        Ok(())
    }

    async fn push_base(&self, job: BaseJob, untake: bool) -> QueueResult<()> {
        match job {
            BaseJob::Job(job) => self.push_job(job, untake).await,
            BaseJob::Set(set) => {
                self.json_set(&self.keys.set(&set.id), "$", &set).await?;
                debug!(set_id = %set.id, job_type = %set.job_type, "Job set stored");
                match set.setup_job() {
                    Some(setup) => self.push_job(setup, false).await,
                    None => Ok(()),
                }
            }
        }
    }

    /// Reads, mutates and writes back a set's details.
    async fn store_details<F>(&self, set: &mut JobSet, f: F) -> QueueResult<()>
    where
        F: FnOnce(&mut dyn JobSetDetails),
    {
        let types = Arc::clone(&*self.types.read().await);
        apply_details(set, &types, f);

        let key = self.keys.set(&set.id);
        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("JSON.SET")
            .arg(&key)
            .arg("$.details")
            .arg(serde_json::to_string(&set.details)?)
            .ignore()
            .cmd("JSON.SET")
            .arg(&key)
            .arg("$.updatedAt")
            .arg(now_epoch())
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn mark_started(&self, set: &JobSet, now: i64) -> QueueResult<()> {
        if set.started_at.is_none() {
            let key = self.keys.set(&set.id);
            self.json_set(&key, "$.startedAt", &now).await?;
            self.json_set(&key, "$.updatedAt", &now).await?;
        }
        Ok(())
    }

    /// Adds `delta` to a set's counter and returns its follow-ups if this
    /// call moved the set into done.
    async fn advance_set(&self, set: &JobSet, delta: i64) -> QueueResult<Vec<BaseJob>> {
        let key = self.keys.set(&set.id);
        let after = self.json_incr(&key, "$.current", delta).await?;
        self.json_set(&key, "$.updatedAt", &now_epoch()).await?;

        let before = after - delta;
        let crossed = set.total > 0 && before < set.total && after >= set.total;
        if crossed {
            debug!(set_id = %set.id, "Job set done, pushing follow-ups");
            Ok(set.follow_ups.clone())
        } else {
            Ok(Vec::new())
        }
    }

    /// Credits a finished job and collects all follow-ups.
    async fn finish(&self, job: &Job, now: i64) -> QueueResult<Vec<BaseJob>> {
        let mut follow_ups = job.follow_ups.clone();

        let Some(set_id) = job.part_of.as_deref() else {
            return Ok(follow_ups);
        };
        let Some(set) = self.json_get::<JobSet>(&self.keys.set(set_id)).await? else {
            return Ok(follow_ups);
        };

        self.mark_started(&set, now).await?;
        if !set.is_setup(job) {
            follow_ups.extend(self.advance_set(&set, job.remaining()).await?);
        }
        Ok(follow_ups)
    }

    /// Credits and deletes a job that was removed from `taken`.
    async fn complete(&self, job_id: &str) -> QueueResult<Vec<BaseJob>> {
        let key = self.keys.job(job_id);
        let Some(job) = self.json_get::<Job>(&key).await? else {
            return Ok(Vec::new());
        };

        let follow_ups = self.finish(&job, now_epoch()).await?;
        let mut conn = self.redis.clone();
        let _: i64 = conn.del(&key).await?;
        Ok(follow_ups)
    }

    /// Re-queues or fails a job that was removed from `taken`.
    async fn settle_error(
        &self,
        job_id: &str,
        error: &str,
        retry: bool,
    ) -> QueueResult<Vec<BaseJob>> {
        let key = self.keys.job(job_id);
        let Some(mut job) = self.json_get::<Job>(&key).await? else {
            return Ok(Vec::new());
        };
        let now = now_epoch();

        if retry && job.retries < self.options.max_retries {
            if let Some(set_id) = job.part_of.as_deref() {
                if let Some(mut set) = self.json_get::<JobSet>(&self.keys.set(set_id)).await? {
                    if job.current > 0 {
                        self.json_incr(&self.keys.set(set_id), "$.current", -job.current)
                            .await?;
                    }
                    self.store_details(&mut set, |details| details.reset(&job))
                        .await?;
                }
            }

            job.retry(error, now);
            warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                retries = job.retries,
                error = %error,
                "Job failed, re-queued for retry"
            );
            self.enqueue(&job, true).await?;
            return Ok(Vec::new());
        }

        job.fail(error, now);
        error!(
            job_id = %job.id,
            job_type = %job.job_type,
            retries = job.retries,
            error = %error,
            "Job failed permanently"
        );

        let follow_ups = self.finish(&job, now).await?;

        let mut conn = self.redis.clone();
        let failed_key = self.keys.failed();
        let max_failed = self.options.max_failed as isize;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("JSON.SET")
            .arg(&key)
            .arg("$")
            .arg(serde_json::to_string(&job)?)
            .ignore()
            .lrem(&failed_key, 0, &job.id)
            .ignore()
            .lpush(&failed_key, &job.id)
            .ignore()
            .lrange(&failed_key, max_failed, -1)
            .ltrim(&failed_key, 0, max_failed - 1)
            .ignore();
        let (evicted,): (Vec<String>,) = pipe.query_async(&mut conn).await?;

        // The job is committed to the failed list from here on.
        if !evicted.is_empty() {
            let keys: Vec<String> = evicted.iter().map(|id| self.keys.job(id)).collect();
            if let Err(e) = conn.del::<_, i64>(keys).await {
                warn!(
                    evicted = evicted.len(),
                    error = %e,
                    "Failed to delete evicted job documents"
                );
            }
        }
        Ok(follow_ups)
    }
}

impl Drop for RedisBackend {
    fn drop(&mut self) {
        if let Some(handle) = self.subscriber.get_mut().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl Volatile for RedisBackend {
    fn name(&self) -> &str {
        "redis"
    }

    async fn state(&self) -> HealthState {
        let mut conn = self.redis.clone();
        let cmd = redis::cmd("PING");
        let ping = cmd.query_async::<_, String>(&mut conn);
        match tokio::time::timeout(PING_TIMEOUT, ping).await {
            Ok(Ok(_)) => HealthState::Available,
            Ok(Err(e)) => {
                warn!(error = %e, "Redis health check failed");
                HealthState::Unavailable
            }
            Err(_) => {
                warn!(timeout = ?PING_TIMEOUT, "Redis health check timed out");
                HealthState::Unavailable
            }
        }
    }
}

#[async_trait]
impl JobQueueBackend for RedisBackend {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn set_job_types(&self, types: Arc<JobTypes>) {
        *self.types.write().await = types;
    }

    async fn push(&self, job: BaseJob, untake: bool) -> QueueResult<()> {
        self.push_base(job, untake).await
    }

    async fn take(&self, job_type: &str, executor: &str) -> QueueResult<Option<Job>> {
        let mut conn = self.redis.clone();
        let executor_json = serde_json::to_string(executor)?;
        let job_prefix = self.keys.job_prefix();

        for priority in self.priorities(job_type).await? {
            let lane = self.keys.queue(job_type, priority);
            loop {
                let id: Option<String> = self
                    .take_script
                    .key(&lane)
                    .key(self.keys.taken())
                    .arg(&job_prefix)
                    .arg(&executor_json)
                    .arg(now_epoch())
                    .invoke_async(&mut conn)
                    .await?;
                let Some(id) = id else { break };

                let Some(job) = self.json_get::<Job>(&self.keys.job(&id)).await? else {
                    warn!(job_id = %id, "Queued job has no document, dropping it");
                    let _: i64 = conn.lrem(self.keys.taken(), 1, &id).await?;
                    continue;
                };

                return Ok(Some(job));
            }
        }

        Ok(None)
    }

    async fn done(&self, job_id: &str) -> QueueResult<bool> {
        if !self.remove_taken(job_id).await? {
            return Ok(false);
        }

        let follow_ups = match self.complete(job_id).await {
            Ok(follow_ups) => follow_ups,
            Err(e) => {
                self.restore_taken(job_id).await;
                return Err(e);
            }
        };

        self.push_all(follow_ups).await?;
        Ok(true)
    }

    async fn error(&self, job_id: &str, error: &str, retry: bool) -> QueueResult<bool> {
        if !self.remove_taken(job_id).await? {
            return Ok(false);
        }

        let follow_ups = match self.settle_error(job_id, error, retry).await {
            Ok(follow_ups) => follow_ups,
            Err(e) => {
                self.restore_taken(job_id).await;
                return Err(e);
            }
        };

        self.push_all(follow_ups).await?;
        Ok(true)
    }

    async fn get_job(&self, job_id: &str) -> QueueResult<Option<Job>> {
        self.json_get(&self.keys.job(job_id)).await
    }

    async fn get_set(&self, set_id: &str) -> QueueResult<Option<JobSet>> {
        self.json_get(&self.keys.set(set_id)).await
    }

    async fn get_sets(&self) -> QueueResult<Vec<JobSet>> {
        let keys = self.scan_keys(&self.keys.set_pattern()).await?;
        let mut sets: Vec<JobSet> = self.json_mget(&keys).await?;
        sets.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(sets)
    }

    async fn get_open(&self) -> QueueResult<Vec<LaneSnapshot>> {
        let mut conn = self.redis.clone();
        let keys = self.scan_keys(&self.keys.priorities_pattern()).await?;
        let mut types: Vec<String> = keys
            .iter()
            .filter_map(|key| self.keys.type_of_priorities_key(key))
            .map(str::to_string)
            .collect();
        types.sort();

        let mut snapshots = Vec::new();
        for job_type in types {
            for priority in self.priorities(&job_type).await? {
                let ids: Vec<String> = conn
                    .lrange(self.keys.queue(&job_type, priority), 0, -1)
                    .await?;
                let jobs = self.jobs_by_ids(&ids).await?;
                if jobs.is_empty() {
                    continue;
                }
                snapshots.push(LaneSnapshot {
                    job_type: job_type.clone(),
                    priority,
                    jobs,
                });
            }
        }
        Ok(snapshots)
    }

    async fn get_taken(&self) -> QueueResult<Vec<Job>> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn.lrange(self.keys.taken(), 0, -1).await?;
        self.jobs_by_ids(&ids).await
    }

    async fn get_failed(&self) -> QueueResult<Vec<Job>> {
        let mut conn = self.redis.clone();
        let ids: Vec<String> = conn.lrange(self.keys.failed(), 0, -1).await?;
        self.jobs_by_ids(&ids).await
    }

    async fn update_job(&self, job_id: &str, delta: i64) -> QueueResult<bool> {
        let key = self.keys.job(job_id);
        let Some(job) = self.json_get::<Job>(&key).await? else {
            return Ok(false);
        };
        let delta = bounded_delta(job.current, job.total, delta);

        let mut conn = self.redis.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("JSON.NUMINCRBY")
            .arg(&key)
            .arg("$.current")
            .arg(delta)
            .cmd("JSON.SET")
            .arg(&key)
            .arg("$.updatedAt")
            .arg(now_epoch())
            .ignore();
        let (raw,): (String,) = pipe.query_async(&mut conn).await?;

        // Concurrent updates can still overshoot the bounds of one snapshot.
        let current = parse_path_number(&key, &raw)?;
        let clamped = clamp_progress(current, job.total);
        if clamped != current {
            self.json_set(&key, "$.current", &clamped).await?;
        }
        Ok(true)
    }

    async fn update_job_set(
        &self,
        set_id: &str,
        delta: i64,
        params: &Map<String, Value>,
    ) -> QueueResult<bool> {
        let Some(mut set) = self.json_get::<JobSet>(&self.keys.set(set_id)).await? else {
            return Ok(false);
        };

        let follow_ups = self.advance_set(&set, delta).await?;
        self.store_details(&mut set, |details| details.update(params))
            .await?;
        self.push_all(follow_ups).await?;
        Ok(true)
    }

    async fn init_job_set(
        &self,
        set_id: &str,
        total: i64,
        params: &Map<String, Value>,
    ) -> QueueResult<bool> {
        let key = self.keys.set(set_id);
        let Some(mut set) = self.json_get::<JobSet>(&key).await? else {
            return Ok(false);
        };

        let was_done = set.is_done();
        set.total = self.json_incr(&key, "$.total", total.max(0)).await?;
        self.store_details(&mut set, |details| details.init(params))
            .await?;

        if !was_done && set.is_done() {
            self.push_all(set.follow_ups.clone()).await?;
        }
        Ok(true)
    }

    async fn start_job_set(&self, set_id: &str) -> QueueResult<bool> {
        let Some(set) = self.json_get::<JobSet>(&self.keys.set(set_id)).await? else {
            return Ok(false);
        };
        self.mark_started(&set, now_epoch()).await?;
        Ok(true)
    }

    async fn done_set(&self, set_id: &str) -> QueueResult<bool> {
        let mut conn = self.redis.clone();
        let removed: i64 = conn.del(self.keys.set(set_id)).await?;
        Ok(removed > 0)
    }

    async fn clear_failed(&self) -> QueueResult<usize> {
        let mut conn = self.redis.clone();
        let failed_key = self.keys.failed();
        let ids: Vec<String> = conn.lrange(&failed_key, 0, -1).await?;

        let mut pipe = redis::pipe();
        pipe.atomic().del(&failed_key).ignore();
        for id in &ids {
            pipe.del(self.keys.job(id)).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(ids.len())
    }

    async fn on_push(&self, listener: PushListener) -> QueueResult<()> {
        self.listeners.write().await.push(listener);

        let mut subscriber = self.subscriber.lock().await;
        if subscriber.is_some() {
            return Ok(());
        }

        let channel = self.keys.notifications();
        let mut pubsub = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?
            .into_pubsub();
        pubsub.subscribe(&channel).await?;

        let listeners = Arc::clone(&self.listeners);
        *subscriber = Some(tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(message) = messages.next().await {
                let job_type: String = match message.get_payload() {
                    Ok(job_type) => job_type,
                    Err(e) => {
                        warn!(error = %e, "Ignoring malformed push notification");
                        continue;
                    }
                };
                for listener in listeners.read().await.iter() {
                    listener(&job_type);
                }
            }
            warn!(channel = %channel, "Push notification subscription closed");
        }));

        debug!("Subscribed to push notifications");
        Ok(())
    }
}

fn decode_document<T: DeserializeOwned>(key: &str, raw: &str) -> QueueResult<T> {
    serde_json::from_str(raw).map_err(|e| QueueError::CorruptDocument {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Parses the reply of a `$`-path numeric command, e.g. `[3]`.
fn parse_path_number(key: &str, raw: &str) -> QueueResult<i64> {
    let value: Value = decode_document(key, raw)?;
    let number = match &value {
        Value::Array(items) => items.first(),
        other => Some(other),
    };
    number
        .and_then(|n| n.as_i64().or_else(|| n.as_f64().and_then(exact_i64)))
        .ok_or_else(|| QueueError::CorruptDocument {
            key: key.to_string(),
            reason: format!("expected an integer, got {}", raw),
        })
}

/// Converts a float without a fractional part that fits into `i64`.
fn exact_i64(f: f64) -> Option<i64> {
    // `i64::MAX as f64` rounds up to 2^63, which does not fit.
    let in_range = f >= i64::MIN as f64 && f < i64::MAX as f64;
    (f.fract() == 0.0 && in_range).then_some(f as i64)
}

/// Limits a progress increment so that, applied to `current`, the counter
/// stays within `0..=total` (or `0..` while the total is unknown).
fn bounded_delta(current: i64, total: i64, delta: i64) -> i64 {
    let ceiling = if total > 0 { total } else { i64::MAX };
    delta.clamp(current.saturating_neg(), ceiling.saturating_sub(current))
}
