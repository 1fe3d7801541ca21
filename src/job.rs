//! Background job definitions.
//!
//! A [`Job`] is the persisted unit of work: an opaque string identifier, the
//! destination queue used once the job is enqueued, and an arbitrary JSON
//! payload describing what to execute. Execution itself belongs to worker
//! pools downstream of the scheduler and is out of scope here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Queue used when a job does not specify one.
pub const DEFAULT_QUEUE: &str = "default";

/// A background job stored in the backend.
///
/// Jobs are serializable so any storage backend can persist them. The
/// identifier is an opaque string; backends that generate their own
/// identifiers can replace it at creation time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Unique identifier for this job.
    pub id: String,
    /// Queue the job is routed to when it becomes ready to execute.
    pub queue: String,
    /// Serialized description of the work to perform.
    pub payload: serde_json::Value,
    /// When this job was created.
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Creates a new job targeting the default queue.
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            queue: DEFAULT_QUEUE.to_string(),
            payload,
            created_at: Utc::now(),
        }
    }

    /// Sets the destination queue.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_new_defaults() {
        let job = Job::new(serde_json::json!({ "task": "send_email" }));

        assert!(!job.id.is_empty());
        assert_eq!(job.queue, DEFAULT_QUEUE);
        assert_eq!(job.payload["task"], "send_email");
    }

    #[test]
    fn test_job_with_queue() {
        let job = Job::new(serde_json::json!({})).with_queue("critical");

        assert_eq!(job.queue, "critical");
    }

    #[test]
    fn test_job_serialization_roundtrip() {
        let job = Job::new(serde_json::json!({ "task": "resize_image" })).with_queue("media");

        let serialized = serde_json::to_string(&job).expect("serialization should work");
        let parsed: Job = serde_json::from_str(&serialized).expect("deserialization should work");

        assert_eq!(parsed, job);
    }
}
