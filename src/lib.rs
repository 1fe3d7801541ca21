//! jobforge: background job processing over pluggable storage backends.
//!
//! This library provides the delayed-job promotion engine of a background
//! job framework: jobs scheduled for a future time wait in a time-ordered
//! index, and a recurring polling pass promotes the due ones into queues,
//! safely across multiple concurrent instances sharing one backend.

// Core modules
pub mod error;
pub mod job;
pub mod scheduler;
pub mod states;
pub mod storage;

// Re-export commonly used types
pub use error::{SchedulerError, StorageError};
pub use job::Job;
pub use scheduler::{
    BackgroundStateChanger, DelayedJobScheduler, SchedulerContext, SchedulerHost,
    StateChangeContext, StateChangeProcess,
};
pub use states::JobState;
pub use storage::{JobStorage, MemoryStorage, RedisStorage};
