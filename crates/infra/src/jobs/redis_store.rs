//! Redis-backed job store.
//!
//! Per lane, under `{prefix}:{queue}`:
//!
//! | key          | type | content                                  |
//! |--------------|------|------------------------------------------|
//! | `:jobs`      | hash | job id → job JSON                        |
//! | `:pending`   | zset | Waiting/Delayed ids scored by `run_at` ms |
//! | `:active`    | zset | Active ids scored by claim time ms        |
//! | `:completed` | zset | ids scored by finish time ms              |
//! | `:failed`    | zset | ids scored by finish time ms              |
//! | `:dedupe`    | hash | dedupe key → live job id                  |
//!
//! Enqueue-with-replace, claim, cancel and finish are Lua scripts, so they are
//! atomic across every process sharing the Redis instance. Job JSON is never
//! re-encoded inside Lua: a claim reads the head job, marks it Active (attempt
//! bumped) in Rust, and the script swaps it in only if the stored body is
//! still the one that was read.

use std::time::Duration;

use chrono::{DateTime, Utc};
use redis::Script;
use redis::aio::ConnectionManager;
use tracing::{debug, instrument, warn};

use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{Job, JobId, JobStatus, QueueName, RetentionPolicy};

const ENQUEUE: &str = r#"
local replaced = false
if ARGV[4] ~= '' then
  local existing = redis.call('HGET', KEYS[3], ARGV[4])
  if existing and redis.call('ZSCORE', KEYS[2], existing) then
    redis.call('ZREM', KEYS[2], existing)
    redis.call('HDEL', KEYS[1], existing)
    replaced = existing
  end
  redis.call('HSET', KEYS[3], ARGV[4], ARGV[1])
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('ZADD', KEYS[2], ARGV[3], ARGV[1])
return replaced
"#;

const CLAIM: &str = r#"
if not redis.call('ZSCORE', KEYS[1], ARGV[1]) then
  return 0
end
if redis.call('HGET', KEYS[3], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZADD', KEYS[2], ARGV[4], ARGV[1])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
return 1
"#;

const CANCEL: &str = r#"
local id = redis.call('HGET', KEYS[1], ARGV[1])
if not id then
  return 0
end
if redis.call('ZREM', KEYS[2], id) == 0 then
  return 0
end
redis.call('HDEL', KEYS[3], id)
redis.call('HDEL', KEYS[1], ARGV[1])
return 1
"#;

const FINISH: &str = r#"
if redis.call('HEXISTS', KEYS[1], ARGV[1]) == 0 then
  return 0
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('ZREM', KEYS[3], ARGV[1])
redis.call('ZREM', KEYS[5], ARGV[1])
if ARGV[3] == 'completed' then
  redis.call('ZADD', KEYS[4], ARGV[4], ARGV[1])
elseif ARGV[3] == 'failed' then
  redis.call('ZADD', KEYS[5], ARGV[4], ARGV[1])
elseif ARGV[3] == 'active' then
  redis.call('ZADD', KEYS[3], ARGV[4], ARGV[1])
else
  redis.call('ZADD', KEYS[2], ARGV[4], ARGV[1])
end
if ARGV[5] ~= '' and (ARGV[3] == 'completed' or ARGV[3] == 'failed') then
  if redis.call('HGET', KEYS[6], ARGV[5]) == ARGV[1] then
    redis.call('HDEL', KEYS[6], ARGV[5])
  end
end
return 1
"#;

/// Claim races lost in a row before giving up until the next poll.
const CLAIM_ATTEMPTS: usize = 5;

struct Scripts {
    enqueue: Script,
    claim: Script,
    cancel: Script,
    finish: Script,
}

struct LaneKeys {
    jobs: String,
    pending: String,
    active: String,
    completed: String,
    failed: String,
    dedupe: String,
}

/// Redis job store shared by every worker process.
#[derive(Clone)]
pub struct RedisJobStore {
    conn: ConnectionManager,
    prefix: String,
    scripts: std::sync::Arc<Scripts>,
}

impl std::fmt::Debug for RedisJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisJobStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

fn map_redis_error(op: &str, e: redis::RedisError) -> JobStoreError {
    JobStoreError::Storage(format!("redis {op} failed: {e}"))
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

impl RedisJobStore {
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> Result<Self, JobStoreError> {
        let client = redis::Client::open(redis_url).map_err(|e| map_redis_error("open", e))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| map_redis_error("connect", e))?;
        let prefix = prefix.into();
        debug!(prefix = %prefix, "redis job store connected");
        Ok(Self::with_connection(conn, prefix))
    }

    pub fn with_connection(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            scripts: std::sync::Arc::new(Scripts {
                enqueue: Script::new(ENQUEUE),
                claim: Script::new(CLAIM),
                cancel: Script::new(CANCEL),
                finish: Script::new(FINISH),
            }),
        }
    }

    fn keys(&self, queue: QueueName) -> LaneKeys {
        let base = format!("{}:{}", self.prefix, queue);
        LaneKeys {
            jobs: format!("{base}:jobs"),
            pending: format!("{base}:pending"),
            active: format!("{base}:active"),
            completed: format!("{base}:completed"),
            failed: format!("{base}:failed"),
            dedupe: format!("{base}:dedupe"),
        }
    }

    fn decode(raw: &str) -> Result<Job, JobStoreError> {
        Ok(serde_json::from_str(raw)?)
    }

    async fn load_many(&self, keys: &LaneKeys, ids: &[String]) -> Result<Vec<Job>, JobStoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let raw: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(&keys.jobs)
            .arg(ids)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("HMGET", e))?;
        raw.into_iter()
            .flatten()
            .map(|r| Self::decode(&r))
            .collect()
    }

    async fn write(&self, job: &Job) -> Result<(), JobStoreError> {
        let keys = self.keys(job.queue);
        let json = serde_json::to_string(job)?;
        let score = match job.status {
            JobStatus::Waiting | JobStatus::Delayed => millis(job.run_at),
            _ => millis(job.updated_at),
        };
        let mut conn = self.conn.clone();
        let written: i64 = self
            .scripts
            .finish
            .key(&keys.jobs)
            .key(&keys.pending)
            .key(&keys.active)
            .key(&keys.completed)
            .key(&keys.failed)
            .key(&keys.dedupe)
            .arg(job.id.to_string())
            .arg(json)
            .arg(job.status.as_str())
            .arg(score)
            .arg(job.dedupe_key.as_deref().unwrap_or(""))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("finish", e))?;
        if written == 0 {
            return Err(JobStoreError::NotFound(job.id));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl JobStore for RedisJobStore {
    #[instrument(skip(self, job), fields(queue = %job.queue, job_id = %job.id), err)]
    async fn enqueue(&self, job: Job) -> Result<Option<JobId>, JobStoreError> {
        let keys = self.keys(job.queue);
        let json = serde_json::to_string(&job)?;
        let mut conn = self.conn.clone();
        let replaced: Option<String> = self
            .scripts
            .enqueue
            .key(&keys.jobs)
            .key(&keys.pending)
            .key(&keys.dedupe)
            .arg(job.id.to_string())
            .arg(json)
            .arg(millis(job.run_at))
            .arg(job.dedupe_key.as_deref().unwrap_or(""))
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("enqueue", e))?;

        replaced
            .map(|id| {
                id.parse::<JobId>()
                    .map_err(|e| JobStoreError::Serialization(format!("bad job id {id}: {e}")))
            })
            .transpose()
    }

    async fn claim_next(&self, queue: QueueName) -> Result<Option<Job>, JobStoreError> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();

        for _ in 0..CLAIM_ATTEMPTS {
            let now = Utc::now();
            let head: Vec<String> = redis::cmd("ZRANGEBYSCORE")
                .arg(&keys.pending)
                .arg("-inf")
                .arg(millis(now))
                .arg("LIMIT")
                .arg(0)
                .arg(1)
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis_error("ZRANGEBYSCORE", e))?;
            let Some(id) = head.into_iter().next() else {
                return Ok(None);
            };

            let raw: Option<String> = redis::cmd("HGET")
                .arg(&keys.jobs)
                .arg(&id)
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis_error("HGET", e))?;
            let Some(raw) = raw else {
                warn!(queue = %queue, job_id = %id, "pending id without job body; dropping");
                let _: i64 = redis::cmd("ZREM")
                    .arg(&keys.pending)
                    .arg(&id)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| map_redis_error("ZREM", e))?;
                continue;
            };

            let mut job = match Self::decode(&raw) {
                Ok(job) => job,
                Err(e) => {
                    warn!(queue = %queue, job_id = %id, error = %e, "undecodable job moved to failed");
                    let _: () = redis::pipe()
                        .atomic()
                        .zrem(&keys.pending, &id)
                        .ignore()
                        .zadd(&keys.failed, &id, millis(now))
                        .ignore()
                        .query_async(&mut conn)
                        .await
                        .map_err(|e| map_redis_error("quarantine", e))?;
                    continue;
                }
            };
            job.mark_active();
            let json = serde_json::to_string(&job)?;

            let claimed: i64 = self
                .scripts
                .claim
                .key(&keys.pending)
                .key(&keys.active)
                .key(&keys.jobs)
                .arg(&id)
                .arg(&raw)
                .arg(json)
                .arg(millis(job.updated_at))
                .invoke_async(&mut conn)
                .await
                .map_err(|e| map_redis_error("claim", e))?;
            if claimed == 1 {
                return Ok(Some(job));
            }
            debug!(queue = %queue, job_id = %id, "job taken by another consumer; retrying claim");
        }
        Ok(None)
    }

    #[instrument(skip(self, job), fields(queue = %job.queue, job_id = %job.id, status = job.status.as_str()), err)]
    async fn update(&self, job: &Job) -> Result<(), JobStoreError> {
        self.write(job).await
    }

    async fn cancel(&self, queue: QueueName, dedupe_key: &str) -> Result<bool, JobStoreError> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .scripts
            .cancel
            .key(&keys.dedupe)
            .key(&keys.pending)
            .key(&keys.jobs)
            .arg(dedupe_key)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("cancel", e))?;
        Ok(removed == 1)
    }

    async fn get(&self, queue: QueueName, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(&keys.jobs)
            .arg(id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("HGET", e))?;
        raw.map(|r| Self::decode(&r)).transpose()
    }

    async fn list(
        &self,
        queue: QueueName,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let now = millis(Utc::now());

        let (set, min, max) = match status {
            None => {
                let raw: Vec<String> = redis::cmd("HVALS")
                    .arg(&keys.jobs)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| map_redis_error("HVALS", e))?;
                let mut jobs = raw
                    .iter()
                    .map(|r| Self::decode(r))
                    .collect::<Result<Vec<_>, _>>()?;
                jobs.sort_by_key(|j| (j.run_at, j.created_at));
                jobs.truncate(limit);
                return Ok(jobs);
            }
            Some(JobStatus::Waiting) => (&keys.pending, "-inf".to_string(), now.to_string()),
            Some(JobStatus::Delayed) => (&keys.pending, format!("({now}"), "+inf".to_string()),
            Some(JobStatus::Active) => (&keys.active, "-inf".to_string(), "+inf".to_string()),
            Some(JobStatus::Completed) => (&keys.completed, "-inf".to_string(), "+inf".to_string()),
            Some(JobStatus::Failed) => (&keys.failed, "-inf".to_string(), "+inf".to_string()),
        };

        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(set)
            .arg(min)
            .arg(max)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("ZRANGEBYSCORE", e))?;
        self.load_many(&keys, &ids).await
    }

    async fn live_job(
        &self,
        queue: QueueName,
        dedupe_key: &str,
    ) -> Result<Option<Job>, JobStoreError> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let id: Option<String> = redis::cmd("HGET")
            .arg(&keys.dedupe)
            .arg(dedupe_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("HGET", e))?;
        match id {
            Some(id) => Ok(self.load_many(&keys, &[id]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn next_run_at(&self, queue: QueueName) -> Result<Option<DateTime<Utc>>, JobStoreError> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();
        let first: Vec<(String, f64)> = redis::cmd("ZRANGE")
            .arg(&keys.pending)
            .arg(0)
            .arg(0)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("ZRANGE", e))?;
        Ok(first
            .first()
            .and_then(|(_, score)| DateTime::from_timestamp_millis(*score as i64)))
    }

    #[instrument(skip(self), fields(queue = %queue), err)]
    async fn requeue_stalled(
        &self,
        queue: QueueName,
        stall_timeout: Duration,
    ) -> Result<usize, JobStoreError> {
        let keys = self.keys(queue);
        let cutoff = Utc::now()
            - chrono::Duration::from_std(stall_timeout).unwrap_or(chrono::Duration::MAX);
        let mut conn = self.conn.clone();
        let ids: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&keys.active)
            .arg("-inf")
            .arg(millis(cutoff))
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("ZRANGEBYSCORE", e))?;

        let mut recovered = 0;
        for mut job in self.load_many(&keys, &ids).await? {
            job.reset_to_waiting();
            self.write(&job).await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn prune_completed(
        &self,
        queue: QueueName,
        retention: RetentionPolicy,
    ) -> Result<usize, JobStoreError> {
        let keys = self.keys(queue);
        let mut conn = self.conn.clone();

        let doomed: Vec<String> = match retention {
            RetentionPolicy::KeepAll => return Ok(0),
            RetentionPolicy::KeepLast(n) => redis::cmd("ZREVRANGE")
                .arg(&keys.completed)
                .arg(n)
                .arg(-1)
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis_error("ZREVRANGE", e))?,
            RetentionPolicy::MaxAge(age) => {
                let cutoff =
                    Utc::now() - chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
                redis::cmd("ZRANGEBYSCORE")
                    .arg(&keys.completed)
                    .arg("-inf")
                    .arg(format!("({}", millis(cutoff)))
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| map_redis_error("ZRANGEBYSCORE", e))?
            }
        };

        if doomed.is_empty() {
            return Ok(0);
        }
        let _: () = redis::pipe()
            .atomic()
            .hdel(&keys.jobs, &doomed)
            .ignore()
            .zrem(&keys.completed, &doomed)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("prune", e))?;
        Ok(doomed.len())
    }

    #[instrument(skip(self), fields(queue = %queue, job_id = %id), err)]
    async fn retry_failed(&self, queue: QueueName, id: JobId) -> Result<Job, JobStoreError> {
        let keys = self.keys(queue);
        let mut job = self
            .get(queue, id)
            .await?
            .ok_or(JobStoreError::NotFound(id))?;
        if job.status != JobStatus::Failed {
            return Err(JobStoreError::InvalidState {
                id,
                status: job.status,
                expected: JobStatus::Failed,
            });
        }

        job.attempt = 0;
        job.last_error = None;
        job.history.clear();
        job.reset_to_waiting();
        self.write(&job).await?;

        if let Some(key) = &job.dedupe_key {
            let mut conn = self.conn.clone();
            let _: bool = redis::cmd("HSETNX")
                .arg(&keys.dedupe)
                .arg(key)
                .arg(id.to_string())
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis_error("HSETNX", e))?;
        }
        Ok(job)
    }

    async fn stats(&self, queue: QueueName) -> Result<JobStats, JobStoreError> {
        let keys = self.keys(queue);
        let now = millis(Utc::now());
        let mut conn = self.conn.clone();
        let (waiting, delayed, active, completed, failed): (usize, usize, usize, usize, usize) =
            redis::pipe()
                .zcount(&keys.pending, "-inf", now)
                .zcount(&keys.pending, format!("({now}"), "+inf")
                .zcard(&keys.active)
                .zcard(&keys.completed)
                .zcard(&keys.failed)
                .query_async(&mut conn)
                .await
                .map_err(|e| map_redis_error("stats", e))?;
        Ok(JobStats {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }
}
