//! Delayed-job promotion loop.
//!
//! [`DelayedJobScheduler`] is the recurring pass that moves jobs whose due
//! time has arrived out of the schedule index and into a queue. One
//! invocation drains every due job it can see, not just one:
//!
//! 1. Open one storage connection for the run
//! 2. Acquire the `locks:schedulepoller` distributed lock
//! 3. Repeatedly pop the earliest-due entry and hand it to the state-change
//!    process with an expected-state guard of `{Scheduled}`
//! 4. Remove the schedule entry itself only when the guard refuses the
//!    transition (the entry is orphaned); a successful transition consumed
//!    it already
//! 5. Release the lock on every exit path
//!
//! Multiple instances may run this concurrently against one backend. The
//! poller lock serializes the passes; the expected-state guard independently
//! prevents double promotion if the lock ever fails open. Both mechanisms
//! are required.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{SchedulerError, StorageError};
use crate::job::DEFAULT_QUEUE;
use crate::states::{JobState, SCHEDULED_STATE};
use crate::storage::{
    to_epoch_score, JobStorage, StorageConnection, SCHEDULE_POLLER_LOCK, SCHEDULE_SET,
};

use super::state_changer::{StateChangeContext, StateChangeProcess};

/// Default pause the host takes between polling passes.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(15);

/// Default acquisition timeout for the poller lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything an invocation needs from its host: the storage backend and an
/// advisory cancellation signal.
#[derive(Clone)]
pub struct SchedulerContext {
    storage: Arc<dyn JobStorage>,
    shutdown: CancellationToken,
}

impl SchedulerContext {
    /// Creates a context with a fresh cancellation token.
    pub fn new(storage: Arc<dyn JobStorage>) -> Self {
        Self::with_shutdown(storage, CancellationToken::new())
    }

    /// Creates a context cancelled through an externally-owned token.
    pub fn with_shutdown(storage: Arc<dyn JobStorage>, shutdown: CancellationToken) -> Self {
        Self { storage, shutdown }
    }

    /// Returns the storage backend.
    pub fn storage(&self) -> &Arc<dyn JobStorage> {
        &self.storage
    }

    /// Returns the cancellation token.
    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Returns whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Promotes due jobs from `Scheduled` to `Enqueued`.
///
/// Built through [`DelayedJobScheduler::builder`]; a state-change process is
/// required. Construction carries the polling interval on behalf of the
/// recurring-execution host, the loop itself never consults it.
pub struct DelayedJobScheduler {
    polling_interval: Duration,
    lock_timeout: Duration,
    process: Arc<dyn StateChangeProcess>,
}

impl DelayedJobScheduler {
    /// Returns a builder with default polling interval and lock timeout.
    pub fn builder() -> DelayedJobSchedulerBuilder {
        DelayedJobSchedulerBuilder::default()
    }

    /// Returns the interval the host should pause between invocations.
    pub fn polling_interval(&self) -> Duration {
        self.polling_interval
    }

    /// Runs one polling pass, draining every currently-due job.
    ///
    /// Returns the number of jobs promoted. Infrastructure failures (lock
    /// acquisition, storage I/O, transaction commit) propagate without any
    /// internal retry; re-invocation is the host's responsibility. A refused
    /// state change is not a failure and takes the cleanup path instead.
    pub async fn execute(&self, ctx: &SchedulerContext) -> Result<usize, SchedulerError> {
        // One connection per run, dropped on every exit path.
        let connection = ctx.storage().connection().await?;

        let lock = connection
            .acquire_lock(SCHEDULE_POLLER_LOCK, self.lock_timeout)
            .await?;

        let outcome = self.enqueue_due_jobs(connection.as_ref(), ctx).await;

        // The pass outcome outranks a release failure; the lease expires on
        // its own if the release was lost.
        if let Err(err) = lock.release().await {
            warn!(error = %err, "Failed to release schedule poller lock");
        }

        Ok(outcome?)
    }

    async fn enqueue_due_jobs(
        &self,
        connection: &dyn StorageConnection,
        ctx: &SchedulerContext,
    ) -> Result<usize, StorageError> {
        let mut promoted = 0;

        loop {
            if ctx.is_cancelled() {
                debug!(promoted, "Polling pass cancelled between jobs");
                break;
            }

            // Evaluated fresh each iteration so jobs that become due
            // mid-pass are picked up too.
            let now = to_epoch_score(Utc::now());
            let Some(job_id) = connection
                .first_by_lowest_score(SCHEDULE_SET, 0.0, now)
                .await?
            else {
                // Backlog drained; the normal termination condition.
                break;
            };

            let queue = match connection.get_job(&job_id).await? {
                Some(job) => job.queue,
                // A missing record still gets a transition attempt so the
                // refusal below routes it into cleanup.
                None => DEFAULT_QUEUE.to_string(),
            };

            let context = StateChangeContext::new(
                &job_id,
                JobState::enqueued(queue),
                [SCHEDULED_STATE],
            );

            match self.process.change_state(context).await? {
                Some(applied) => {
                    promoted += 1;
                    debug!(job_id = %job_id, state = applied.name(), "Promoted delayed job");
                }
                None => {
                    // Lost the race or the job is gone; the schedule entry
                    // is orphaned and would be re-read forever.
                    debug!(job_id = %job_id, "State change refused, removing orphaned schedule entry");
                    let mut tx = connection.create_write_transaction().await?;
                    tx.remove_from_set(SCHEDULE_SET, &job_id);
                    tx.commit().await?;
                }
            }
        }

        Ok(promoted)
    }
}

/// Builder for [`DelayedJobScheduler`].
#[derive(Default)]
pub struct DelayedJobSchedulerBuilder {
    polling_interval: Option<Duration>,
    lock_timeout: Option<Duration>,
    process: Option<Arc<dyn StateChangeProcess>>,
}

impl DelayedJobSchedulerBuilder {
    /// Sets the interval the host pauses between invocations.
    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = Some(interval);
        self
    }

    /// Sets the acquisition timeout for the poller lock.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Sets the state-change process. Required.
    pub fn process(mut self, process: Arc<dyn StateChangeProcess>) -> Self {
        self.process = Some(process);
        self
    }

    /// Builds the scheduler.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::MissingArgument`] naming `process` if no
    /// state-change process was supplied.
    pub fn build(self) -> Result<DelayedJobScheduler, SchedulerError> {
        let process = self
            .process
            .ok_or(SchedulerError::MissingArgument { name: "process" })?;

        Ok(DelayedJobScheduler {
            polling_interval: self.polling_interval.unwrap_or(DEFAULT_POLLING_INTERVAL),
            lock_timeout: self.lock_timeout.unwrap_or(DEFAULT_LOCK_TIMEOUT),
            process,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoopProcess;

    #[async_trait]
    impl StateChangeProcess for NoopProcess {
        async fn change_state(
            &self,
            _ctx: StateChangeContext,
        ) -> Result<Option<JobState>, StorageError> {
            Ok(None)
        }
    }

    #[test]
    fn test_builder_requires_process() {
        let result = DelayedJobScheduler::builder()
            .polling_interval(Duration::from_secs(1))
            .build();

        match result {
            Err(SchedulerError::MissingArgument { name }) => assert_eq!(name, "process"),
            other => panic!("expected MissingArgument, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_builder_defaults() {
        let scheduler = DelayedJobScheduler::builder()
            .process(Arc::new(NoopProcess))
            .build()
            .expect("build");

        assert_eq!(scheduler.polling_interval(), DEFAULT_POLLING_INTERVAL);
        assert_eq!(scheduler.lock_timeout, DEFAULT_LOCK_TIMEOUT);
    }

    #[test]
    fn test_builder_overrides() {
        let scheduler = DelayedJobScheduler::builder()
            .polling_interval(Duration::from_secs(2))
            .lock_timeout(Duration::from_millis(250))
            .process(Arc::new(NoopProcess))
            .build()
            .expect("build");

        assert_eq!(scheduler.polling_interval(), Duration::from_secs(2));
        assert_eq!(scheduler.lock_timeout, Duration::from_millis(250));
    }
}
