//! Recurring-execution host for the delayed-job scheduler.
//!
//! The scheduler itself runs one pass and returns; something has to call it
//! on a cadence. [`SchedulerHost`] is that driver: a spawned task that
//! executes a pass, sleeps for the scheduler's polling interval, and repeats
//! until shut down. Pass failures are logged and swallowed here, the next
//! invocation is the retry.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::delayed::{DelayedJobScheduler, SchedulerContext};
use crate::storage::JobStorage;

/// Drives a [`DelayedJobScheduler`] on its polling cadence.
pub struct SchedulerHost {
    scheduler: Arc<DelayedJobScheduler>,
    context: SchedulerContext,
    handle: Option<JoinHandle<()>>,
}

impl SchedulerHost {
    /// Creates a host over the given scheduler and storage backend.
    pub fn new(scheduler: DelayedJobScheduler, storage: Arc<dyn JobStorage>) -> Self {
        Self::with_shutdown(scheduler, storage, CancellationToken::new())
    }

    /// Creates a host whose polling task also stops when an externally-owned
    /// token is cancelled, for embedding in an application-wide shutdown.
    pub fn with_shutdown(
        scheduler: DelayedJobScheduler,
        storage: Arc<dyn JobStorage>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            scheduler: Arc::new(scheduler),
            context: SchedulerContext::with_shutdown(storage, shutdown),
            handle: None,
        }
    }

    /// Starts polling. Does nothing if already started.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }

        let scheduler = Arc::clone(&self.scheduler);
        let ctx = self.context.clone();
        let interval = self.scheduler.polling_interval();

        let handle = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Delayed job scheduler started");

            loop {
                if ctx.is_cancelled() {
                    break;
                }

                match scheduler.execute(&ctx).await {
                    Ok(promoted) if promoted > 0 => {
                        info!(promoted, "Polling pass complete");
                    }
                    Ok(_) => {}
                    Err(err) => {
                        error!(error = %err, "Polling pass failed");
                    }
                }

                tokio::select! {
                    _ = ctx.shutdown().cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }

            info!("Delayed job scheduler stopped");
        });

        self.handle = Some(handle);
    }

    /// Signals shutdown and waits for the polling task to finish.
    pub async fn shutdown(&mut self) {
        self.context.shutdown().cancel();

        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                error!(error = %err, "Scheduler task panicked during shutdown");
            }
        }
    }

    /// Returns whether the polling task is still alive.
    ///
    /// Reports `false` once the task has exited on its own, e.g. after an
    /// externally-owned shutdown token was cancelled.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}
