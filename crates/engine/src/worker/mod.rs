//! Worker pool for dispatched work
//!
//! This module provides:
//! - [`WorkQueue`] - In-process queue that is also the engine's scheduler
//! - [`WorkerPool`] - Concurrent workers pulling descriptors from the queue
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   ProcessExecutor                            │
//! │  (commits a unit, then submits its follow-up descriptors)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ submit
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkQueue                               │
//! │  (unbounded channel, in-flight counter, idle notification)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ recv
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkerPool                              │
//! │  [Worker 1] [Worker 2] ... [Worker N]  -> dispatch()        │
//! │  requeue on store outage, up to max_dispatch_attempts       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod pool;
mod queue;

pub use pool::{
    WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStats, WorkerPoolStatus,
    MAX_DISPATCH_ATTEMPTS_ENV, WORKERS_ENV, WORKER_ID_ENV,
};
pub use queue::{QueuedWork, WorkQueue, WorkReceiver};
