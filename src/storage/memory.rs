//! In-process storage backend.
//!
//! Implements the full storage contract over shared in-memory maps. Used by
//! the test suite and for local development without a Redis instance. All
//! handles cloned from one [`MemoryStorage`] observe the same data, so
//! multiple scheduler instances can be pointed at a single backend to
//! exercise the distributed coordination paths.
//!
//! The backend additionally exposes per-resource lock counters so tests can
//! observe that locks are acquired and released exactly once per run.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::StorageError;
use crate::job::Job;
use crate::states::JobState;

use super::{
    to_epoch_score, DistributedLock, JobStorage, StorageConnection, WriteTransaction, SCHEDULE_SET,
};

/// How long a contended lock acquisition waits between attempts.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Number of times a lock was acquired and released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockCounters {
    /// Successful acquisitions.
    pub acquired: u64,
    /// Releases, explicit or via a dropped handle.
    pub released: u64,
}

/// Number of connections opened and released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionCounters {
    /// Connections handed out.
    pub opened: u64,
    /// Connections released by being dropped.
    pub released: u64,
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<String, Job>,
    states: HashMap<String, JobState>,
    /// Scored sets: set name -> member -> score.
    sets: HashMap<String, HashMap<String, f64>>,
    queues: HashMap<String, VecDeque<String>>,
    held_locks: HashSet<String>,
    lock_counters: HashMap<String, LockCounters>,
    connection_counters: ConnectionCounters,
}

/// In-memory storage backend.
///
/// Cheap to clone; clones share the same underlying data.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    shared: Arc<Mutex<MemoryState>>,
}

impl MemoryStorage {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of members in a scored set.
    pub fn set_len(&self, set: &str) -> usize {
        let state = self.shared.lock();
        state.sets.get(set).map_or(0, HashMap::len)
    }

    /// Returns the number of entries in the schedule index.
    pub fn schedule_len(&self) -> usize {
        self.set_len(SCHEDULE_SET)
    }

    /// Returns whether the named lock is currently held.
    pub fn is_lock_held(&self, resource: &str) -> bool {
        self.shared.lock().held_locks.contains(resource)
    }

    /// Returns the acquisition/release counters for the named lock.
    pub fn lock_counters(&self, resource: &str) -> LockCounters {
        self.shared
            .lock()
            .lock_counters
            .get(resource)
            .copied()
            .unwrap_or_default()
    }

    /// Returns the open/release counters for connections.
    pub fn connection_counters(&self) -> ConnectionCounters {
        self.shared.lock().connection_counters
    }
}

#[async_trait]
impl JobStorage for MemoryStorage {
    async fn connection(&self) -> Result<Box<dyn StorageConnection>, StorageError> {
        self.shared.lock().connection_counters.opened += 1;

        Ok(Box::new(MemoryConnection {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Mutex<MemoryState>>,
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.shared.lock().connection_counters.released += 1;
    }
}

#[async_trait]
impl StorageConnection for MemoryConnection {
    async fn acquire_lock(
        &self,
        resource: &str,
        timeout: Duration,
    ) -> Result<Box<dyn DistributedLock>, StorageError> {
        let deadline = Instant::now() + timeout;

        loop {
            {
                let mut state = self.shared.lock();
                if !state.held_locks.contains(resource) {
                    state.held_locks.insert(resource.to_string());
                    state
                        .lock_counters
                        .entry(resource.to_string())
                        .or_default()
                        .acquired += 1;

                    return Ok(Box::new(MemoryLock {
                        shared: Arc::clone(&self.shared),
                        resource: resource.to_string(),
                        released: false,
                    }));
                }
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
        let state = self.shared.lock();
        let Some(members) = state.sets.get(set) else {
            return Ok(None);
        };

        // Ties on score break on member for a deterministic pick.
        let first = members
            .iter()
            .filter(|(_, score)| **score >= min_score && **score <= max_score)
            .min_by(|(a_member, a_score), (b_member, b_score)| {
                a_score
                    .total_cmp(b_score)
                    .then_with(|| a_member.cmp(b_member))
            })
            .map(|(member, _)| member.clone());

        Ok(first)
    }

    async fn create_write_transaction(&self) -> Result<Box<dyn WriteTransaction>, StorageError> {
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            ops: Vec::new(),
        }))
    }

    async fn create_scheduled_job(
        &self,
        job: &Job,
        enqueue_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut state = self.shared.lock();
        state.jobs.insert(job.id.clone(), job.clone());
        state
            .states
            .insert(job.id.clone(), JobState::scheduled(enqueue_at));
        state
            .sets
            .entry(SCHEDULE_SET.to_string())
            .or_default()
            .insert(job.id.clone(), to_epoch_score(enqueue_at));
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, StorageError> {
        Ok(self.shared.lock().jobs.get(job_id).cloned())
    }

    async fn get_job_state(&self, job_id: &str) -> Result<Option<JobState>, StorageError> {
        Ok(self.shared.lock().states.get(job_id).cloned())
    }

    async fn fetch_queue(&self, queue: &str) -> Result<Vec<String>, StorageError> {
        let state = self.shared.lock();
        Ok(state
            .queues
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default())
    }
}

enum Op {
    SetJobState { job_id: String, state: JobState },
    AddToQueue { queue: String, job_id: String },
    RemoveFromSet { set: String, member: String },
}

struct MemoryTransaction {
    shared: Arc<Mutex<MemoryState>>,
    ops: Vec<Op>,
}

#[async_trait]
impl WriteTransaction for MemoryTransaction {
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
        // Every buffered operation applies under one guard.
        let mut state = self.shared.lock();

        for op in self.ops {
            match op {
                Op::SetJobState { job_id, state: new } => {
                    state.states.insert(job_id, new);
                }
                Op::AddToQueue { queue, job_id } => {
                    state.queues.entry(queue).or_default().push_back(job_id);
                }
                Op::RemoveFromSet { set, member } => {
                    if let Some(members) = state.sets.get_mut(&set) {
                        members.remove(&member);
                    }
                }
            }
        }

        Ok(())
    }
}

struct MemoryLock {
    shared: Arc<Mutex<MemoryState>>,
    resource: String,
    released: bool,
}

impl MemoryLock {
    fn do_release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut state = self.shared.lock();
        state.held_locks.remove(&self.resource);
        state
            .lock_counters
            .entry(self.resource.clone())
            .or_default()
            .released += 1;
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn release(mut self: Box<Self>) -> Result<(), StorageError> {
        self.do_release();
        Ok(())
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        // Safety net mirroring a lease expiry: a leaked handle must not
        // wedge the critical section forever.
        self.do_release();
    }
}
