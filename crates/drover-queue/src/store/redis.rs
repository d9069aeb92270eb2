//! Redis-backed job store.
//!
//! Every transition runs as a Lua script so each move between structures is
//! atomic on the server. Keys of one queue share a `{queue}` hash tag and
//! therefore a cluster slot.

use super::{JobStore, QueueDepths, Transition};
use crate::error::{StoreError, StoreResult};
use crate::job::{millis, JobId, JobRecord, JobStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::{Config, Pool, Runtime};
use drover_config::RedisConfig;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const PUSH_LUA: &str = include_str!("lua/push.lua");
const CLAIM_LUA: &str = include_str!("lua/claim.lua");
const COMPLETE_LUA: &str = include_str!("lua/complete.lua");
const RESCHEDULE_LUA: &str = include_str!("lua/reschedule.lua");
const DEAD_LETTER_LUA: &str = include_str!("lua/dead_letter.lua");
const PROMOTE_LUA: &str = include_str!("lua/promote.lua");
const RECLAIM_LUA: &str = include_str!("lua/reclaim.lua");
const REQUEUE_LUA: &str = include_str!("lua/requeue.lua");
const PURGE_LUA: &str = include_str!("lua/purge.lua");

/// Create a Redis connection pool and verify it with a PING.
pub async fn create_pool(config: &RedisConfig) -> StoreResult<Pool> {
    info!("Creating Redis connection pool for job store...");

    let cfg = Config::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| StoreError::Unavailable(format!("Invalid Redis config: {}", e)))?
        .max_size(config.pool_size)
        .wait_timeout(Some(config.connect_timeout()))
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| StoreError::Unavailable(format!("Failed to create pool: {}", e)))?;

    let mut conn = pool.get().await?;
    let _: String = redis::cmd("PING").query_async(&mut *conn).await?;

    info!(pool_size = config.pool_size, "Redis connection pool created successfully");

    Ok(pool)
}

/// Redis key builder for job queues.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    /// Create a new key builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn base(&self, queue: &str) -> String {
        format!("{}:{{{}}}", self.prefix, queue)
    }

    /// Ready jobs (sorted set scored by priority, members ordered by time and sequence).
    pub fn ready(&self, queue: &str) -> String {
        format!("{}:ready", self.base(queue))
    }

    /// Delayed jobs (sorted set scored by due time).
    pub fn delayed(&self, queue: &str) -> String {
        format!("{}:delayed", self.base(queue))
    }

    /// Claimed jobs (sorted set scored by lock expiry).
    pub fn in_flight(&self, queue: &str) -> String {
        format!("{}:inflight", self.base(queue))
    }

    /// Dead-letter list.
    pub fn dead(&self, queue: &str) -> String {
        format!("{}:dead", self.base(queue))
    }

    /// Push sequence counter.
    pub fn seq(&self, queue: &str) -> String {
        format!("{}:seq", self.base(queue))
    }

    /// Prefix of job hashes; the job ID is appended.
    pub fn job_prefix(&self, queue: &str) -> String {
        format!("{}:job:", self.base(queue))
    }

    /// Job hash.
    pub fn job(&self, queue: &str, id: &JobId) -> String {
        format!("{}{}", self.job_prefix(queue), id)
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("drover")
    }
}

/// Redis-backed [`JobStore`].
///
/// Connections are borrowed from the pool per operation and never held
/// across a handler invocation.
pub struct RedisJobStore {
    pool: Pool,
    keys: RedisKeys,
    push_script: Script,
    claim_script: Script,
    complete_script: Script,
    reschedule_script: Script,
    dead_letter_script: Script,
    promote_script: Script,
    reclaim_script: Script,
    requeue_script: Script,
    purge_script: Script,
}

impl RedisJobStore {
    /// Create a store over an existing pool.
    pub fn new(pool: Pool, key_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(key_prefix),
            push_script: Script::new(PUSH_LUA),
            claim_script: Script::new(CLAIM_LUA),
            complete_script: Script::new(COMPLETE_LUA),
            reschedule_script: Script::new(RESCHEDULE_LUA),
            dead_letter_script: Script::new(DEAD_LETTER_LUA),
            promote_script: Script::new(PROMOTE_LUA),
            reclaim_script: Script::new(RECLAIM_LUA),
            requeue_script: Script::new(REQUEUE_LUA),
            purge_script: Script::new(PURGE_LUA),
        }
    }

    /// Key builder in use.
    pub fn keys(&self) -> &RedisKeys {
        &self.keys
    }

    /// Get a connection from the pool.
    async fn conn(&self) -> StoreResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    fn transition(applied: i64) -> Transition {
        if applied == 1 {
            Transition::Applied
        } else {
            Transition::StaleLock
        }
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn push(&self, job: JobRecord, now: DateTime<Utc>) -> StoreResult<JobStatus> {
        let mut conn = self.conn().await?;
        let queue = job.queue.as_str();

        let status: String = self
            .push_script
            .key(self.keys.ready(queue))
            .key(self.keys.delayed(queue))
            .key(self.keys.seq(queue))
            .key(self.keys.job(queue, &job.id))
            .arg(job.id.as_str())
            .arg(queue)
            .arg(&job.payload)
            .arg(u32::from(job.priority))
            .arg(job.attempt)
            .arg(job.max_attempts)
            .arg(millis(job.scheduled_at))
            .arg(millis(now))
            .arg(millis(job.created_at))
            .invoke_async(&mut *conn)
            .await?;

        debug!(job_id = %job.id, queue, status = %status, "Pushed job");
        JobStatus::from_str(&status).map_err(|e| StoreError::corrupt(job.id.as_str(), e))
    }

    async fn claim_next(
        &self,
        queue: &str,
        lock_ttl: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<JobRecord>> {
        let mut conn = self.conn().await?;
        let token = Uuid::new_v4().to_string();
        let ttl_ms = u64::try_from(lock_ttl.as_millis()).unwrap_or(u64::MAX);

        let fields: Option<HashMap<String, Vec<u8>>> = self
            .claim_script
            .key(self.keys.ready(queue))
            .key(self.keys.in_flight(queue))
            .arg(self.keys.job_prefix(queue))
            .arg(&token)
            .arg(millis(now))
            .arg(ttl_ms)
            .invoke_async(&mut *conn)
            .await?;

        fields.map(decode_job).transpose()
    }

    async fn complete(&self, queue: &str, id: &JobId, token: &str) -> StoreResult<Transition> {
        let mut conn = self.conn().await?;
        let applied: i64 = self
            .complete_script
            .key(self.keys.in_flight(queue))
            .key(self.keys.job(queue, id))
            .arg(id.as_str())
            .arg(token)
            .invoke_async(&mut *conn)
            .await?;
        Ok(Self::transition(applied))
    }

    async fn fail_and_reschedule(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        delay: Duration,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Transition> {
        let mut conn = self.conn().await?;
        let due = millis(crate::job::after(now, delay));
        let applied: i64 = self
            .reschedule_script
            .key(self.keys.in_flight(queue))
            .key(self.keys.delayed(queue))
            .key(self.keys.job(queue, id))
            .arg(id.as_str())
            .arg(token)
            .arg(due)
            .arg(millis(now))
            .arg(error)
            .invoke_async(&mut *conn)
            .await?;
        Ok(Self::transition(applied))
    }

    async fn dead_letter(
        &self,
        queue: &str,
        id: &JobId,
        token: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Transition> {
        let mut conn = self.conn().await?;
        let applied: i64 = self
            .dead_letter_script
            .key(self.keys.in_flight(queue))
            .key(self.keys.dead(queue))
            .key(self.keys.job(queue, id))
            .arg(id.as_str())
            .arg(token)
            .arg(millis(now))
            .arg(error)
            .invoke_async(&mut *conn)
            .await?;
        Ok(Self::transition(applied))
    }

    async fn promote_due(&self, queue: &str, now: DateTime<Utc>, limit: usize) -> StoreResult<u64> {
        let mut conn = self.conn().await?;
        let moved: u64 = self
            .promote_script
            .key(self.keys.delayed(queue))
            .key(self.keys.ready(queue))
            .arg(self.keys.job_prefix(queue))
            .arg(millis(now))
            .arg(limit)
            .invoke_async(&mut *conn)
            .await?;

        if moved > 0 {
            debug!(queue, count = moved, "Promoted delayed jobs");
        }
        Ok(moved)
    }

    async fn reclaim_expired_locks(&self, queue: &str, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut conn = self.conn().await?;
        let reclaimed: u64 = self
            .reclaim_script
            .key(self.keys.in_flight(queue))
            .key(self.keys.ready(queue))
            .arg(self.keys.job_prefix(queue))
            .arg(millis(now))
            .invoke_async(&mut *conn)
            .await?;
        Ok(reclaimed)
    }

    async fn depths(&self, queue: &str) -> StoreResult<QueueDepths> {
        let mut conn = self.conn().await?;
        let (ready, delayed, in_flight, dead_lettered): (u64, u64, u64, u64) = redis::pipe()
            .zcard(self.keys.ready(queue))
            .zcard(self.keys.delayed(queue))
            .zcard(self.keys.in_flight(queue))
            .llen(self.keys.dead(queue))
            .query_async(&mut *conn)
            .await?;

        Ok(QueueDepths {
            ready,
            delayed,
            in_flight,
            dead_lettered,
        })
    }

    async fn get_job(&self, queue: &str, id: &JobId) -> StoreResult<Option<JobRecord>> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, Vec<u8>> = conn.hgetall(self.keys.job(queue, id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        decode_job(fields).map(Some)
    }

    async fn list_dead_letters(
        &self,
        queue: &str,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<JobRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn().await?;
        let start = isize::try_from(offset).unwrap_or(isize::MAX);
        let stop = isize::try_from(offset.saturating_add(limit - 1)).unwrap_or(isize::MAX);
        let ids: Vec<String> = conn.lrange(self.keys.dead(queue), start, stop).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.hgetall(self.keys.job(queue, &JobId::from(id.as_str())));
        }
        let rows: Vec<HashMap<String, Vec<u8>>> = pipe.query_async(&mut *conn).await?;

        rows.into_iter()
            .filter(|fields| !fields.is_empty())
            .map(decode_job)
            .collect()
    }

    async fn requeue_dead_letter(
        &self,
        queue: &str,
        id: &JobId,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let requeued: i64 = self
            .requeue_script
            .key(self.keys.dead(queue))
            .key(self.keys.ready(queue))
            .key(self.keys.seq(queue))
            .key(self.keys.job(queue, id))
            .arg(id.as_str())
            .arg(max_attempts)
            .arg(millis(now))
            .invoke_async(&mut *conn)
            .await?;
        Ok(requeued == 1)
    }

    async fn purge_dead_letters(&self, queue: &str) -> StoreResult<u64> {
        let mut conn = self.conn().await?;
        let purged: u64 = self
            .purge_script
            .key(self.keys.dead(queue))
            .arg(self.keys.job_prefix(queue))
            .invoke_async(&mut *conn)
            .await?;
        Ok(purged)
    }

    async fn health_check(&self) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }
}

/// Field access over a job hash with corrupt-record errors.
struct JobFields {
    id: String,
    fields: HashMap<String, Vec<u8>>,
}

impl JobFields {
    fn new(fields: HashMap<String, Vec<u8>>) -> Self {
        let id = fields
            .get("id")
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
            .unwrap_or_default();
        Self { id, fields }
    }

    fn corrupt(&self, reason: String) -> StoreError {
        StoreError::corrupt(self.id.clone(), reason)
    }

    fn text(&self, name: &str) -> StoreResult<&str> {
        let raw = self
            .fields
            .get(name)
            .ok_or_else(|| self.corrupt(format!("missing field '{}'", name)))?;
        std::str::from_utf8(raw).map_err(|_| self.corrupt(format!("field '{}' is not UTF-8", name)))
    }

    fn optional_text(&self, name: &str) -> StoreResult<Option<String>> {
        match self.fields.get(name) {
            None => Ok(None),
            Some(raw) if raw.is_empty() => Ok(None),
            Some(_) => self.text(name).map(|s| Some(s.to_string())),
        }
    }

    fn number<T: FromStr>(&self, name: &str) -> StoreResult<T> {
        let text = self.text(name)?;
        text.parse()
            .map_err(|_| self.corrupt(format!("field '{}' is not a number: {}", name, text)))
    }

    fn timestamp(&self, name: &str) -> StoreResult<DateTime<Utc>> {
        let ms: i64 = self.number(name)?;
        DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| self.corrupt(format!("field '{}' is out of range", name)))
    }

    fn optional_timestamp(&self, name: &str) -> StoreResult<Option<DateTime<Utc>>> {
        match self.fields.get(name) {
            None => Ok(None),
            Some(raw) if raw.is_empty() => Ok(None),
            Some(_) => self.timestamp(name).map(Some),
        }
    }
}

fn decode_job(fields: HashMap<String, Vec<u8>>) -> StoreResult<JobRecord> {
    let mut fields = JobFields::new(fields);
    let payload = fields.fields.remove("payload").unwrap_or_default();
    let status = JobStatus::from_str(fields.text("status")?).map_err(|e| fields.corrupt(e))?;

    Ok(JobRecord {
        id: JobId::from_string(fields.id.clone()),
        queue: fields.text("queue")?.to_string(),
        payload,
        priority: fields.number("priority")?,
        attempt: fields.number("attempt")?,
        max_attempts: fields.number("max_attempts")?,
        status,
        scheduled_at: fields.timestamp("scheduled_at")?,
        seq: fields.number("seq")?,
        lock_token: fields.optional_text("lock_token")?,
        lock_expires_at: fields.optional_timestamp("lock_expires_at")?,
        last_error: fields.optional_text("last_error")?,
        created_at: fields.timestamp("created_at")?,
        updated_at: fields.timestamp("updated_at")?,
    })
}
