//! Storage abstraction for job state, queues, and scheduling primitives.
//!
//! The scheduling algorithm runs unmodified against any backend that can
//! provide four primitives:
//!
//! - A time-ordered schedule index (members scored by due time)
//! - A named distributed lock with a bounded acquisition timeout
//! - An atomic write transaction (all operations commit together or not at all)
//! - Persisted job records and state values
//!
//! Backends implement [`JobStorage`] and its companion traits; everything
//! above this module depends only on the traits. Two backends ship with the
//! crate: [`RedisStorage`] for production and [`MemoryStorage`] for tests
//! and local development.

pub mod memory;
pub mod redis;

pub use memory::MemoryStorage;
pub use self::redis::RedisStorage;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::job::Job;
use crate::states::JobState;

/// Name of the sorted set holding (job id, due-time score) entries.
pub const SCHEDULE_SET: &str = "schedule";

/// Name of the distributed lock serializing schedule polling passes.
pub const SCHEDULE_POLLER_LOCK: &str = "locks:schedulepoller";

/// Converts a point in time to the epoch-second score stored in the
/// schedule index.
pub fn to_epoch_score(at: DateTime<Utc>) -> f64 {
    at.timestamp() as f64
}

/// A storage backend capable of handing out connections.
#[async_trait]
pub trait JobStorage: Send + Sync {
    /// Obtains a connection for one unit of work.
    ///
    /// The connection is released when dropped; callers hold it for the
    /// duration of a single run and no longer.
    async fn connection(&self) -> Result<Box<dyn StorageConnection>, StorageError>;
}

/// A unit-of-work handle for one scheduler run.
#[async_trait]
pub trait StorageConnection: Send + Sync {
    /// Acquires the named distributed lock, blocking up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::LockTimeout`] if the lock could not be
    /// acquired before the timeout expired.
    async fn acquire_lock(
        &self,
        resource: &str,
        timeout: Duration,
    ) -> Result<Box<dyn DistributedLock>, StorageError>;

    /// Returns the single member with the lowest score in the inclusive
    /// range `[min_score, max_score]`, or `None` if no member qualifies.
    async fn first_by_lowest_score(
        &self,
        set: &str,
        min_score: f64,
        max_score: f64,
    ) -> Result<Option<String>, StorageError>;

    /// Begins an atomic write transaction.
    async fn create_write_transaction(&self) -> Result<Box<dyn WriteTransaction>, StorageError>;

    /// Persists a job in the `Scheduled` state and indexes it for promotion
    /// at `enqueue_at`.
    ///
    /// The job record, its state, and the schedule-index entry are written
    /// atomically. A job identifier appears at most once in the index.
    async fn create_scheduled_job(
        &self,
        job: &Job,
        enqueue_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Fetches a job record, or `None` if it no longer exists.
    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StorageError>;

    /// Fetches a job's persisted state, or `None` if it has none.
    async fn get_job_state(&self, job_id: &str) -> Result<Option<JobState>, StorageError>;

    /// Returns the job identifiers currently sitting in a queue.
    async fn fetch_queue(&self, queue: &str) -> Result<Vec<String>, StorageError>;
}

/// A pending atomic write.
///
/// Operations are buffered until [`commit`](WriteTransaction::commit) is
/// called; a dropped transaction applies nothing.
#[async_trait]
pub trait WriteTransaction: Send {
    /// Replaces the job's persisted state.
    fn set_job_state(&mut self, job_id: &str, state: JobState);

    /// Appends the job to the named queue.
    fn add_to_queue(&mut self, queue: &str, job_id: &str);

    /// Removes a member from a scored set.
    fn remove_from_set(&mut self, set: &str, member: &str);

    /// Applies every buffered operation atomically.
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;
}

/// Exclusive ownership of a named critical section for a bounded lease.
///
/// Holders release the lock explicitly on every exit path; backends may
/// additionally reclaim it when the lease expires, which is why transitions
/// guarded only by a lock also carry the expected-state check.
#[async_trait]
pub trait DistributedLock: Send {
    /// Releases the lock. Safe to call exactly once; the handle is consumed.
    async fn release(self: Box<Self>) -> Result<(), StorageError>;
}
