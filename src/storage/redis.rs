//! Redis storage backend.
//!
//! Maps the storage contract onto Redis primitives:
//!
//! - Schedule index: a sorted set queried with `ZRANGEBYSCORE ... LIMIT 0 1`
//! - Distributed lock: `SET NX PX` with a per-holder token and a Lua script
//!   that only deletes the key if the token still matches
//! - Write transaction: a `MULTI`/`EXEC` pipeline
//! - Job records and states: JSON strings under per-job keys
//!
//! # Key layout
//!
//! All keys share a configurable prefix (default `jobforge`):
//!
//! - `{prefix}:schedule`: sorted set of due jobs
//! - `{prefix}:job:{id}`: serialized job record
//! - `{prefix}:job:{id}:state`: serialized state value
//! - `{prefix}:queue:{name}`: list of ready job identifiers
//! - `{prefix}:locks:*`: distributed lock keys

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::StorageError;
use crate::job::Job;
use crate::states::JobState;

use super::{
    to_epoch_score, DistributedLock, JobStorage, StorageConnection, WriteTransaction, SCHEDULE_SET,
};

/// Default key prefix.
const DEFAULT_PREFIX: &str = "jobforge";

/// How long a lock key lives before Redis reclaims it from a dead holder.
///
/// Deliberately longer than any polling pass should take; the expected-state
/// guard covers the case where a pass outlives the lease anyway.
const LOCK_LEASE: Duration = Duration::from_secs(30);

/// How long a contended lock acquisition waits between attempts.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Releases a lock key only if it still carries the holder's token.
const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end"#;

/// Redis-backed job storage.
pub struct RedisStorage {
    redis: ConnectionManager,
    prefix: String,
}

impl RedisStorage {
    /// Connects to Redis using the default key prefix.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    ///
    /// # Errors
    ///
    /// Returns `StorageError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, StorageError> {
        Self::connect_with_prefix(redis_url, DEFAULT_PREFIX).await
    }

    /// Connects to Redis with a custom key prefix.
    ///
    /// Useful for running several isolated deployments against one Redis
    /// instance.
    pub async fn connect_with_prefix(
        redis_url: &str,
        prefix: &str,
    ) -> Result<Self, StorageError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            redis,
            prefix: prefix.to_string(),
        })
    }

    /// Creates a RedisStorage from an existing ConnectionManager.
    ///
    /// Useful when sharing a connection pool across multiple components.
    pub fn from_connection(redis: ConnectionManager, prefix: &str) -> Self {
        Self {
            redis,
            prefix: prefix.to_string(),
        }
    }
}

#[async_trait]
impl JobStorage for RedisStorage {
    async fn connection(&self) -> Result<Box<dyn StorageConnection>, StorageError> {
        Ok(Box::new(RedisConnection {
            redis: self.redis.clone(),
            prefix: self.prefix.clone(),
        }))
    }
}

struct RedisConnection {
    redis: ConnectionManager,
    prefix: String,
}

/// Builds a prefixed key.
fn prefixed(prefix: &str, name: &str) -> String {
    format!("{}:{}", prefix, name)
}

/// Key holding a job's serialized record.
fn job_key(prefix: &str, job_id: &str) -> String {
    format!("{}:job:{}", prefix, job_id)
}

/// Key holding a job's serialized state.
fn job_state_key(prefix: &str, job_id: &str) -> String {
    format!("{}:job:{}:state", prefix, job_id)
}

/// Key holding a queue's list of ready job identifiers.
fn queue_key(prefix: &str, queue: &str) -> String {
    format!("{}:queue:{}", prefix, queue)
}

#[async_trait]
impl StorageConnection for RedisConnection {
    async fn acquire_lock(
        &self,
        resource: &str,
        timeout: Duration,
    ) -> Result<Box<dyn DistributedLock>, StorageError> {
        let key = prefixed(&self.prefix, resource);
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + timeout;
        let mut conn = self.redis.clone();

        loop {
            let acquired: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(LOCK_LEASE.as_millis() as u64)
                .query_async(&mut conn)
                .await?;

            if acquired.is_some() {
                return Ok(Box::new(RedisLock {
                    redis: self.redis.clone(),
                    key,
                    token,
                }));
            }

            if Instant::now() >= deadline {
                return Err(StorageError::LockTimeout {
                    resource: resource.to_string(),
                    timeout,
                });
            }

            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    async fn first_by_lowest_score(
        &self,
        set: &str,
        min_score: f64,
        max_score: f64,
    ) -> Result<Option<String>, StorageError> {
        let mut conn = self.redis.clone();

        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(prefixed(&self.prefix, set))
            .arg(min_score)
            .arg(max_score)
            .arg("LIMIT")
            .arg(0)
            .arg(1)
            .query_async(&mut conn)
            .await?;

        Ok(members.into_iter().next())
    }

    async fn create_write_transaction(&self) -> Result<Box<dyn WriteTransaction>, StorageError> {
        Ok(Box::new(RedisTransaction {
            redis: self.redis.clone(),
            prefix: self.prefix.clone(),
            ops: Vec::new(),
        }))
    }

    async fn create_scheduled_job(
        &self,
        job: &Job,
        enqueue_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let serialized_job = serde_json::to_string(job)?;
        let serialized_state = serde_json::to_string(&JobState::scheduled(enqueue_at))?;
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(job_key(&self.prefix, &job.id), serialized_job)
            .set(job_state_key(&self.prefix, &job.id), serialized_state)
            .zadd(
                prefixed(&self.prefix, SCHEDULE_SET),
                &job.id,
                to_epoch_score(enqueue_at),
            );
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StorageError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.get(job_key(&self.prefix, job_id)).await?;

        match data {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn get_job_state(&self, job_id: &str) -> Result<Option<JobState>, StorageError> {
        let mut conn = self.redis.clone();
        let data: Option<String> = conn.get(job_state_key(&self.prefix, job_id)).await?;

        match data {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn fetch_queue(&self, queue: &str) -> Result<Vec<String>, StorageError> {
        let mut conn = self.redis.clone();
        let members: Vec<String> = conn.lrange(queue_key(&self.prefix, queue), 0, -1).await?;
        Ok(members)
    }
}

enum Op {
    SetJobState { job_id: String, state: JobState },
    AddToQueue { queue: String, job_id: String },
    RemoveFromSet { set: String, member: String },
}

struct RedisTransaction {
    redis: ConnectionManager,
    prefix: String,
    ops: Vec<Op>,
}

#[async_trait]
impl WriteTransaction for RedisTransaction {
    fn set_job_state(&mut self, job_id: &str, state: JobState) {
        self.ops.push(Op::SetJobState {
            job_id: job_id.to_string(),
            state,
        });
    }

    fn add_to_queue(&mut self, queue: &str, job_id: &str) {
        self.ops.push(Op::AddToQueue {
            queue: queue.to_string(),
            job_id: job_id.to_string(),
        });
    }

    fn remove_from_set(&mut self, set: &str, member: &str) {
        self.ops.push(Op::RemoveFromSet {
            set: set.to_string(),
            member: member.to_string(),
        });
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let mut conn = self.redis.clone();

        let mut pipe = redis::pipe();
        pipe.atomic();

        for op in &self.ops {
            match op {
                Op::SetJobState { job_id, state } => {
                    let serialized = serde_json::to_string(state)?;
                    pipe.set(job_state_key(&self.prefix, job_id), serialized);
                }
                Op::AddToQueue { queue, job_id } => {
                    pipe.lpush(queue_key(&self.prefix, queue), job_id);
                }
                Op::RemoveFromSet { set, member } => {
                    pipe.zrem(prefixed(&self.prefix, set), member);
                }
            }
        }

        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

struct RedisLock {
    redis: ConnectionManager,
    key: String,
    token: String,
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn release(self: Box<Self>) -> Result<(), StorageError> {
        let mut conn = self.redis.clone();

        // Token check prevents deleting a lock Redis already handed to the
        // next holder after a lease expiry.
        redis::Script::new(RELEASE_LOCK_SCRIPT)
            .key(&self.key)
            .arg(&self.token)
            .invoke_async::<_, i64>(&mut conn)
            .await?;

        Ok(())
    }
}
