//! Delayed-job scheduling.
//!
//! This module ties the storage primitives together into the promotion
//! engine:
//!
//! - **DelayedJobScheduler**: the polling pass that drains due jobs from the
//!   schedule index under a distributed lock
//! - **StateChangeProcess / BackgroundStateChanger**: guarded state
//!   transitions with expected-state optimistic concurrency
//! - **SchedulerHost**: the recurring driver that re-invokes the pass on a
//!   cadence
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use jobforge::scheduler::{BackgroundStateChanger, DelayedJobScheduler, SchedulerHost};
//! use jobforge::storage::RedisStorage;
//!
//! let storage = Arc::new(RedisStorage::connect("redis://localhost:6379").await?);
//! let scheduler = DelayedJobScheduler::builder()
//!     .process(Arc::new(BackgroundStateChanger::new(storage.clone())))
//!     .build()?;
//!
//! let mut host = SchedulerHost::new(scheduler, storage);
//! host.start();
//! // ...
//! host.shutdown().await;
//! ```

pub mod delayed;
pub mod host;
pub mod state_changer;

// Re-export main types for convenience
pub use delayed::{
    DelayedJobScheduler, DelayedJobSchedulerBuilder, SchedulerContext, DEFAULT_LOCK_TIMEOUT,
    DEFAULT_POLLING_INTERVAL,
};
pub use host::SchedulerHost;
pub use state_changer::{BackgroundStateChanger, StateChangeContext, StateChangeProcess};
