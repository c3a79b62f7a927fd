//! Reliability patterns for transactional work
//!
//! This module provides:
//! - [`RetryPolicy`] - retries/delay/delay-factor triple for optimistic conflicts
//! - [`RetryingWorkExecutor`] - begin/run/commit with rollback and interruptible backoff
//! - [`WorkContext`] - host, thread and tenant attached to failures

mod context;
mod retry;
mod work;

pub use context::WorkContext;
pub use retry::RetryPolicy;
pub use work::{Attempt, Completed, RetryingWorkExecutor, WorkItem, WorkSequence};
