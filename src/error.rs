//! Error types for jobforge operations.
//!
//! Defines error types for the two subsystems that can fail:
//! - Storage backends (connections, locks, transactions)
//! - The delayed-job scheduler itself
//!
//! Infrastructure failures are propagated to the caller unhandled; the
//! recurring-execution host decides retry cadence by re-invoking the
//! scheduler. A lost state-change race is not an error and never appears
//! here (it is reported as an empty result by the state-change process).

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Failed to establish a connection to the backend.
    #[error("Storage connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to serialize or deserialize persisted data.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A distributed lock could not be acquired before the timeout.
    #[error("Could not acquire lock '{resource}' within {timeout:?}")]
    LockTimeout { resource: String, timeout: Duration },
}

/// Errors that can occur while constructing or running the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A required constructor argument was not supplied.
    #[error("Missing required argument: {name}")]
    MissingArgument { name: &'static str },

    /// A storage operation failed during a polling pass.
    #[error("Storage operation failed: {0}")]
    Storage(#[from] StorageError),
}
