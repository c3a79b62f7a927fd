//! # Flow-node Execution Engine
//!
//! Drives business-process instances through a process definition graph,
//! persisting progress in a transactional store so that many workers can
//! advance different flow nodes concurrently.
//!
//! ## Features
//!
//! - **Per-node state machines**: every node kind walks a fixed chain of states,
//!   with dedicated abort and cancel chains and breakpoint overrides
//! - **Converging gateways**: parallel, inclusive and complex joins fire exactly once
//! - **Multi-instance and loop activities**: fan-out/fan-in with conserved counters
//! - **Event correlation**: signals and messages consumed at most once
//! - **Optimistic concurrency**: every unit of work is retried on conflicts
//!   with exponential backoff
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ProcessExecutor                         │
//! │  (start/advance/trigger/abort, one unit of work at a time)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   RetryingWorkExecutor                       │
//! │  (begin, run, commit; retry on ConcurrencyConflict)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      FlowNodeStore                           │
//! │  (versioned flow nodes, waiting events, process data)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Follow-up work (advance this node, deliver that signal) is submitted to a
//! [`WorkScheduler`] after commit; the bundled [`WorkQueue`] feeds a
//! [`WorkerPool`].
//!
//! ## Example
//!
//! ```ignore
//! use flownode_engine::prelude::*;
//!
//! let (queue, receiver) = WorkQueue::new();
//! let store = Arc::new(InMemoryFlowNodeStore::new());
//! let executor = Arc::new(ProcessExecutor::new(
//!     store,
//!     Arc::new(queue.clone()),
//!     EngineConfig::from_env(),
//! ));
//!
//! let definition_id = executor.deploy(serde_json::from_str(&definition_json)?)?;
//! let pool = WorkerPool::new(Arc::clone(&executor), queue, receiver, WorkerPoolConfig::from_env());
//! pool.start()?;
//!
//! let process_id = executor
//!     .create_and_start_process_instance(definition_id, ProcessInputs::new())
//!     .await?;
//! pool.wait_idle().await;
//! ```

pub mod config;
pub mod coordination;
pub mod engine;
pub mod error;
pub mod events;
pub mod expression;
pub mod model;
pub mod persistence;
pub mod reliability;
pub mod state;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::EngineConfig;
    pub use crate::engine::{Advance, ProcessExecutor, ProcessInputs, WorkDescriptor, WorkScheduler};
    pub use crate::error::{EngineError, ErrorContext};
    pub use crate::events::CorrelationOutcome;
    pub use crate::expression::{ExpressionEvaluator, MinijinjaEvaluator};
    pub use crate::model::{
        BusinessDataRef, DataContainer, FlowNodeInstance, MessageKey, ProcessDefinition,
        ProcessInstance, ProcessState, StateCategory,
    };
    pub use crate::persistence::{FlowNodeStore, InMemoryFlowNodeStore, StoreError};
    pub use crate::reliability::RetryPolicy;
    pub use crate::state::{state_ids, Breakpoint, InMemoryBreakpoints, StateId};
    pub use crate::worker::{WorkQueue, WorkerPool, WorkerPoolConfig, WorkerPoolError};
    pub use std::sync::Arc;
}

// Re-export key types at crate root
pub use config::EngineConfig;
pub use engine::{Advance, ProcessExecutor, ProcessInputs, WorkDescriptor, WorkScheduler};
pub use error::{EngineError, ErrorContext};
pub use persistence::{FlowNodeStore, InMemoryFlowNodeStore, StoreError};
pub use reliability::RetryPolicy;
pub use worker::{WorkQueue, WorkerPool, WorkerPoolConfig, WorkerPoolError};
