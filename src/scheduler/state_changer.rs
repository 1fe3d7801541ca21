//! Guarded job state transitions.
//!
//! A state change is a compare-and-swap expressed at the domain level: the
//! caller names the states the job is expected to currently be in, and the
//! transition is refused (not coerced) if the persisted state is not among
//! them. This guard is what makes promotion race-safe across scheduler
//! instances even when the poller lock misbehaves (lease expiry, partition):
//! of two racing instances, only one observes `Scheduled` and wins.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::states::{JobState, SCHEDULED_STATE};
use crate::storage::{JobStorage, StorageConnection, SCHEDULE_SET};

/// Default acquisition timeout for the per-job transition lock.
const DEFAULT_JOB_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// A transition request handed to a [`StateChangeProcess`].
#[derive(Debug, Clone)]
pub struct StateChangeContext {
    /// Identifier of the job to transition.
    pub job_id: String,
    /// The state to apply.
    pub new_state: JobState,
    /// Names of the states the job must currently be in.
    pub expected_states: Vec<&'static str>,
}

impl StateChangeContext {
    /// Creates a transition request.
    pub fn new(
        job_id: impl Into<String>,
        new_state: JobState,
        expected_states: impl Into<Vec<&'static str>>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            new_state,
            expected_states: expected_states.into(),
        }
    }
}

/// Applies guarded state transitions.
///
/// Implementations return `Ok(Some(applied))` when the transition was
/// applied, and `Ok(None)` when the job's current state was not among the
/// expected states or the job no longer exists. The mismatch case is an
/// expected outcome of losing a race and is never reported as an error;
/// `Err` is reserved for infrastructure failures.
#[async_trait]
pub trait StateChangeProcess: Send + Sync {
    /// Attempts the transition described by `ctx`.
    async fn change_state(&self, ctx: StateChangeContext)
        -> Result<Option<JobState>, StorageError>;
}

/// The crate's default state-change process.
///
/// Performs the read-check-write sequence under a per-job distributed lock
/// and commits the state write, the queue insertion, and the consumption of
/// the job's schedule-index entry in one atomic transaction. Because the
/// index entry is consumed here, a successful promotion leaves nothing for
/// the scheduler to clean up.
pub struct BackgroundStateChanger {
    storage: Arc<dyn JobStorage>,
    lock_timeout: Duration,
}

impl BackgroundStateChanger {
    /// Creates a state changer over the given storage backend.
    pub fn new(storage: Arc<dyn JobStorage>) -> Self {
        Self {
            storage,
            lock_timeout: DEFAULT_JOB_LOCK_TIMEOUT,
        }
    }

    /// Sets the acquisition timeout for the per-job lock.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    async fn apply_transition(
        &self,
        connection: &dyn StorageConnection,
        ctx: &StateChangeContext,
    ) -> Result<Option<JobState>, StorageError> {
        let Some(current) = connection.get_job_state(&ctx.job_id).await? else {
            debug!(job_id = %ctx.job_id, "Job no longer exists, refusing transition");
            return Ok(None);
        };

        if !ctx.expected_states.contains(&current.name()) {
            debug!(
                job_id = %ctx.job_id,
                current = current.name(),
                target = ctx.new_state.name(),
                "Current state not among expected states, refusing transition"
            );
            return Ok(None);
        }

        let mut tx = connection.create_write_transaction().await?;
        tx.set_job_state(&ctx.job_id, ctx.new_state.clone());
        if let JobState::Enqueued { queue } = &ctx.new_state {
            tx.add_to_queue(queue, &ctx.job_id);
        }
        if current.name() == SCHEDULED_STATE {
            // Leaving the scheduled state consumes its index entry in the
            // same transaction as the state write.
            tx.remove_from_set(SCHEDULE_SET, &ctx.job_id);
        }
        tx.commit().await?;

        Ok(Some(ctx.new_state.clone()))
    }
}

#[async_trait]
impl StateChangeProcess for BackgroundStateChanger {
    async fn change_state(
        &self,
        ctx: StateChangeContext,
    ) -> Result<Option<JobState>, StorageError> {
        let connection = self.storage.connection().await?;
        let lock = connection
            .acquire_lock(&format!("locks:job:{}", ctx.job_id), self.lock_timeout)
            .await?;

        let outcome = self.apply_transition(connection.as_ref(), &ctx).await;

        if let Err(err) = lock.release().await {
            warn!(job_id = %ctx.job_id, error = %err, "Failed to release job lock");
        }

        outcome
    }
}
