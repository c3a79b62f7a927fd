//! Breakpoints: pause a node before it enters a given state

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

use super::registry::StateId;
use crate::persistence::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub id: Uuid,
    pub process_definition_id: Uuid,

    /// Restrict to one root process instance; all instances when absent
    pub root_process_instance_id: Option<Uuid>,

    pub flow_node_name: String,

    /// State the node is about to enter
    pub state_id: StateId,

    /// State the node is parked in instead
    pub interrupted_state_id: StateId,
}

/// Source of breakpoints consulted by the transition resolver
#[async_trait]
pub trait BreakpointService: Send + Sync {
    fn is_active(&self) -> bool;

    async fn breakpoint_for(
        &self,
        process_definition_id: Uuid,
        root_process_instance_id: Uuid,
        flow_node_name: &str,
        state_id: StateId,
    ) -> Result<Option<Breakpoint>, StoreError>;
}

/// Breakpoints disabled
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBreakpoints;

#[async_trait]
impl BreakpointService for NoBreakpoints {
    fn is_active(&self) -> bool {
        false
    }

    async fn breakpoint_for(
        &self,
        _process_definition_id: Uuid,
        _root_process_instance_id: Uuid,
        _flow_node_name: &str,
        _state_id: StateId,
    ) -> Result<Option<Breakpoint>, StoreError> {
        Ok(None)
    }
}

/// Breakpoints held in memory
#[derive(Debug)]
pub struct InMemoryBreakpoints {
    breakpoints: RwLock<Vec<Breakpoint>>,
    active: AtomicBool,
}

impl InMemoryBreakpoints {
    pub fn new() -> Self {
        Self {
            breakpoints: RwLock::new(Vec::new()),
            active: AtomicBool::new(true),
        }
    }

    pub fn add(&self, breakpoint: Breakpoint) {
        self.breakpoints.write().push(breakpoint);
    }

    pub fn remove(&self, id: Uuid) -> bool {
        let mut breakpoints = self.breakpoints.write();
        let before = breakpoints.len();
        breakpoints.retain(|b| b.id != id);
        breakpoints.len() != before
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }
}

impl Default for InMemoryBreakpoints {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BreakpointService for InMemoryBreakpoints {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn breakpoint_for(
        &self,
        process_definition_id: Uuid,
        root_process_instance_id: Uuid,
        flow_node_name: &str,
        state_id: StateId,
    ) -> Result<Option<Breakpoint>, StoreError> {
        let breakpoints = self.breakpoints.read();
        let candidates = breakpoints.iter().filter(|b| {
            b.process_definition_id == process_definition_id
                && b.flow_node_name == flow_node_name
                && b.state_id == state_id
        });

        // Instance-specific breakpoints win over definition-wide ones
        let mut fallback = None;
        for breakpoint in candidates {
            match breakpoint.root_process_instance_id {
                Some(root) if root == root_process_instance_id => {
                    return Ok(Some(breakpoint.clone()))
                }
                None if fallback.is_none() => fallback = Some(breakpoint.clone()),
                _ => {}
            }
        }
        Ok(fallback)
    }
}
