//! Integration tests for the delayed-job promotion loop over the in-memory
//! backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use jobforge::scheduler::{
    BackgroundStateChanger, DelayedJobScheduler, SchedulerContext, StateChangeContext,
    StateChangeProcess,
};
use jobforge::storage::{JobStorage, MemoryStorage, SCHEDULE_POLLER_LOCK};
use jobforge::{Job, JobState, SchedulerError, StorageError};

/// Wraps a process and records every transition attempt in order.
struct RecordingProcess {
    inner: Option<BackgroundStateChanger>,
    attempts: Mutex<Vec<String>>,
}

impl RecordingProcess {
    /// Delegates to the real state changer.
    fn delegating(storage: &MemoryStorage) -> Self {
        Self {
            inner: Some(BackgroundStateChanger::new(Arc::new(storage.clone()))),
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// Refuses every transition, simulating a lost race.
    fn rejecting() -> Self {
        Self {
            inner: None,
            attempts: Mutex::new(Vec::new()),
        }
    }

    fn attempts(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }
}

#[async_trait]
impl StateChangeProcess for RecordingProcess {
    async fn change_state(
        &self,
        ctx: StateChangeContext,
    ) -> Result<Option<JobState>, StorageError> {
        self.attempts.lock().push(ctx.job_id.clone());

        match &self.inner {
            Some(inner) => inner.change_state(ctx).await,
            None => Ok(None),
        }
    }
}

/// Fails every transition with an infrastructure error.
struct FailingProcess;

#[async_trait]
impl StateChangeProcess for FailingProcess {
    async fn change_state(
        &self,
        _ctx: StateChangeContext,
    ) -> Result<Option<JobState>, StorageError> {
        Err(StorageError::ConnectionFailed("backend down".to_string()))
    }
}

fn scheduler_with(process: Arc<dyn StateChangeProcess>) -> DelayedJobScheduler {
    DelayedJobScheduler::builder()
        .lock_timeout(Duration::from_secs(1))
        .process(process)
        .build()
        .expect("scheduler should build")
}

async fn schedule_job(storage: &MemoryStorage, queue: &str, due: DateTime<Utc>) -> Job {
    let job = Job::new(serde_json::json!({ "task": "noop" })).with_queue(queue);
    let conn = storage.connection().await.expect("connection");
    conn.create_scheduled_job(&job, due)
        .await
        .expect("create_scheduled_job");
    job
}

async fn state_name(storage: &MemoryStorage, job_id: &str) -> Option<&'static str> {
    let conn = storage.connection().await.expect("connection");
    conn.get_job_state(job_id)
        .await
        .expect("get_job_state")
        .map(|s| s.name())
}

#[tokio::test]
async fn due_job_is_promoted_exactly_once() {
    let storage = MemoryStorage::new();
    let job = schedule_job(&storage, "media", Utc::now() - ChronoDuration::seconds(30)).await;

    let scheduler = scheduler_with(Arc::new(BackgroundStateChanger::new(Arc::new(
        storage.clone(),
    ))));
    let ctx = SchedulerContext::new(Arc::new(storage.clone()));

    let promoted = scheduler.execute(&ctx).await.expect("execute");

    assert_eq!(promoted, 1);
    assert_eq!(state_name(&storage, &job.id).await, Some("Enqueued"));
    assert_eq!(storage.schedule_len(), 0);

    let conn = storage.connection().await.expect("connection");
    assert_eq!(
        conn.fetch_queue("media").await.expect("fetch_queue"),
        vec![job.id]
    );
}

#[tokio::test]
async fn no_due_jobs_means_no_attempts_and_no_mutations() {
    let storage = MemoryStorage::new();
    let job = schedule_job(&storage, "default", Utc::now() + ChronoDuration::hours(1)).await;

    let process = Arc::new(RecordingProcess::delegating(&storage));
    let scheduler = scheduler_with(process.clone());
    let ctx = SchedulerContext::new(Arc::new(storage.clone()));

    let promoted = scheduler.execute(&ctx).await.expect("execute");

    assert_eq!(promoted, 0);
    assert!(process.attempts().is_empty());
    assert_eq!(storage.schedule_len(), 1);
    assert_eq!(state_name(&storage, &job.id).await, Some("Scheduled"));
}

#[tokio::test]
async fn refused_state_change_removes_orphaned_entry_without_second_attempt() {
    let storage = MemoryStorage::new();
    let job = schedule_job(&storage, "default", Utc::now() - ChronoDuration::seconds(5)).await;

    let process = Arc::new(RecordingProcess::rejecting());
    let scheduler = scheduler_with(process.clone());
    let ctx = SchedulerContext::new(Arc::new(storage.clone()));

    let promoted = scheduler.execute(&ctx).await.expect("execute");

    assert_eq!(promoted, 0);
    // One attempt, then the stale entry is gone and the loop exits.
    assert_eq!(process.attempts(), vec![job.id.clone()]);
    assert_eq!(storage.schedule_len(), 0);
    // The job's state itself was left alone.
    assert_eq!(state_name(&storage, &job.id).await, Some("Scheduled"));
}

#[tokio::test]
async fn poller_lock_is_acquired_and_released_once_per_invocation() {
    let storage = MemoryStorage::new();
    schedule_job(&storage, "default", Utc::now() - ChronoDuration::seconds(5)).await;

    let scheduler = scheduler_with(Arc::new(RecordingProcess::rejecting()));
    let ctx = SchedulerContext::new(Arc::new(storage.clone()));

    let connections_before = storage.connection_counters();
    scheduler.execute(&ctx).await.expect("execute");

    let counters = storage.lock_counters(SCHEDULE_POLLER_LOCK);
    assert_eq!(counters.acquired, 1);
    assert_eq!(counters.released, 1);
    assert!(!storage.is_lock_held(SCHEDULE_POLLER_LOCK));

    // The run's single connection was released by the time execute returned.
    let connections_after = storage.connection_counters();
    assert_eq!(connections_after.opened - connections_before.opened, 1);
    assert_eq!(connections_after.released - connections_before.released, 1);
}

#[tokio::test]
async fn poller_lock_is_released_when_the_loop_body_fails() {
    let storage = MemoryStorage::new();
    schedule_job(&storage, "default", Utc::now() - ChronoDuration::seconds(5)).await;

    let scheduler = scheduler_with(Arc::new(FailingProcess));
    let ctx = SchedulerContext::new(Arc::new(storage.clone()));

    let connections_before = storage.connection_counters();
    let result = scheduler.execute(&ctx).await;
    assert!(matches!(
        result,
        Err(SchedulerError::Storage(StorageError::ConnectionFailed(_)))
    ));

    let counters = storage.lock_counters(SCHEDULE_POLLER_LOCK);
    assert_eq!(counters.acquired, 1);
    assert_eq!(counters.released, 1);
    assert!(!storage.is_lock_held(SCHEDULE_POLLER_LOCK));

    // The connection is released on the failure path too.
    let connections_after = storage.connection_counters();
    assert_eq!(connections_after.opened - connections_before.opened, 1);
    assert_eq!(connections_after.released - connections_before.released, 1);
}

#[tokio::test]
async fn one_invocation_drains_the_whole_backlog_in_due_order() {
    let storage = MemoryStorage::new();
    let now = Utc::now();
    let first = schedule_job(&storage, "default", now - ChronoDuration::seconds(30)).await;
    let second = schedule_job(&storage, "default", now - ChronoDuration::seconds(20)).await;
    let third = schedule_job(&storage, "default", now - ChronoDuration::seconds(10)).await;

    let process = Arc::new(RecordingProcess::delegating(&storage));
    let scheduler = scheduler_with(process.clone());
    let ctx = SchedulerContext::new(Arc::new(storage.clone()));

    let promoted = scheduler.execute(&ctx).await.expect("execute");

    assert_eq!(promoted, 3);
    // Drained in ascending due-time order, then the empty index ended the pass.
    assert_eq!(process.attempts(), vec![first.id, second.id, third.id]);
    assert_eq!(storage.schedule_len(), 0);
}

#[tokio::test]
async fn cancelled_invocation_stops_before_touching_jobs() {
    let storage = MemoryStorage::new();
    let job = schedule_job(&storage, "default", Utc::now() - ChronoDuration::seconds(5)).await;

    let process = Arc::new(RecordingProcess::delegating(&storage));
    let scheduler = scheduler_with(process.clone());

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let ctx = SchedulerContext::with_shutdown(Arc::new(storage.clone()), shutdown);

    let promoted = scheduler.execute(&ctx).await.expect("execute");

    assert_eq!(promoted, 0);
    assert!(process.attempts().is_empty());
    assert_eq!(storage.schedule_len(), 1);
    assert_eq!(state_name(&storage, &job.id).await, Some("Scheduled"));

    // The lock is still acquired and released cleanly around the early exit.
    let counters = storage.lock_counters(SCHEDULE_POLLER_LOCK);
    assert_eq!(counters.acquired, 1);
    assert_eq!(counters.released, 1);
}

#[tokio::test]
async fn builder_without_process_reports_the_missing_argument() {
    let result = DelayedJobScheduler::builder().build();

    match result {
        Err(SchedulerError::MissingArgument { name }) => {
            assert_eq!(name, "process");
        }
        _ => panic!("expected MissingArgument error"),
    }
}

#[tokio::test]
async fn concurrent_schedulers_never_promote_a_job_twice() {
    let storage = MemoryStorage::new();
    let now = Utc::now();
    let mut job_ids = Vec::new();
    for i in 0..5 {
        let job = schedule_job(&storage, "default", now - ChronoDuration::seconds(10 + i)).await;
        job_ids.push(job.id);
    }

    let backend: Arc<dyn JobStorage> = Arc::new(storage.clone());
    let make_scheduler = || {
        DelayedJobScheduler::builder()
            .lock_timeout(Duration::from_secs(2))
            .process(Arc::new(BackgroundStateChanger::new(Arc::clone(&backend))))
            .build()
            .expect("scheduler should build")
    };

    let first = make_scheduler();
    let second = make_scheduler();
    let ctx_a = SchedulerContext::new(Arc::clone(&backend));
    let ctx_b = SchedulerContext::new(Arc::clone(&backend));

    let (a, b) = tokio::join!(first.execute(&ctx_a), second.execute(&ctx_b));
    let total = a.expect("first instance") + b.expect("second instance");

    // Every job promoted exactly once across both instances.
    assert_eq!(total, job_ids.len());
    assert_eq!(storage.schedule_len(), 0);

    let conn = storage.connection().await.expect("connection");
    let mut queued = conn.fetch_queue("default").await.expect("fetch_queue");
    queued.sort();
    let mut expected = job_ids.clone();
    expected.sort();
    assert_eq!(queued, expected);

    for job_id in &job_ids {
        assert_eq!(state_name(&storage, job_id).await, Some("Enqueued"));
    }
}
