//! Persistence layer for flow node execution
//!
//! This module provides:
//! - [`FlowNodeStore`] / [`StoreTransaction`] traits for optimistic, transactional access
//! - [`InMemoryFlowNodeStore`] reference implementation for tests and single-process runs

mod memory;
mod store;

pub use memory::InMemoryFlowNodeStore;
pub use store::{FlowNodeQuery, FlowNodeStore, StoreError, StoreTransaction, WaitingEventQuery};
