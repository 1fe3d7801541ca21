//! Job state values.
//!
//! A job's lifecycle position is an immutable state value carrying a name
//! and any state-specific fields. The names are stable identifiers persisted
//! in storage and compared by the expected-state guard during transitions,
//! so they must never change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::DEFAULT_QUEUE;

/// Name of the state a job waits in until its due time arrives.
pub const SCHEDULED_STATE: &str = "Scheduled";

/// Name of the state a job enters once it is ready to execute.
pub const ENQUEUED_STATE: &str = "Enqueued";

/// A job state as persisted in the backend.
///
/// The serialized form tags each value with its state name, which keeps the
/// stored representation aligned with what the expected-state guard compares.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "name")]
pub enum JobState {
    /// Waiting for its due time; the schedule index holds a matching entry.
    Scheduled {
        /// When the job becomes eligible for promotion.
        enqueue_at: DateTime<Utc>,
    },
    /// Ready to execute; sits in a queue awaiting a worker.
    Enqueued {
        /// The queue the job was routed to.
        queue: String,
    },
}

impl JobState {
    /// Creates a `Scheduled` state due at the given time.
    pub fn scheduled(enqueue_at: DateTime<Utc>) -> Self {
        JobState::Scheduled { enqueue_at }
    }

    /// Creates an `Enqueued` state routed to the given queue.
    pub fn enqueued(queue: impl Into<String>) -> Self {
        JobState::Enqueued {
            queue: queue.into(),
        }
    }

    /// Creates an `Enqueued` state routed to the default queue.
    pub fn enqueued_default() -> Self {
        Self::enqueued(DEFAULT_QUEUE)
    }

    /// Returns the stable name of this state.
    pub fn name(&self) -> &'static str {
        match self {
            JobState::Scheduled { .. } => SCHEDULED_STATE,
            JobState::Enqueued { .. } => ENQUEUED_STATE,
        }
    }
}
