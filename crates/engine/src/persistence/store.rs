//! FlowNodeStore trait definition
//!
//! Every unit of work runs against one [`StoreTransaction`]. Reads record the
//! version of what they saw; `commit` fails with
//! [`StoreError::ConcurrencyConflict`] when any of it changed meanwhile.

use std::collections::BTreeMap;

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::{
    BusinessDataRef, DataContainer, FlowNodeInstance, ProcessInstance, WaitingEvent,
};

/// Error type for store operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("flow node instance not found: {0}")]
    FlowNodeNotFound(Uuid),

    #[error("process instance not found: {0}")]
    ProcessInstanceNotFound(Uuid),

    #[error("waiting event not found: {0}")]
    WaitingEventNotFound(Uuid),

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict on {record}: read version {expected}, found {actual}")]
    ConcurrencyConflict {
        record: String,
        expected: u64,
        actual: u64,
    },

    #[error("duplicate record: {0}")]
    Duplicate(String),

    /// Backend temporarily unreachable
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("transaction already closed")]
    TransactionClosed,
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::FlowNodeNotFound(_) | Self::ProcessInstanceNotFound(_) | Self::WaitingEventNotFound(_)
        )
    }
}

/// Flow node lookup within one process instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowNodeQuery {
    pub process_instance_id: Uuid,
    pub name: Option<String>,
    pub parent_activity_instance_id: Option<Uuid>,
    pub terminal: Option<bool>,
}

impl FlowNodeQuery {
    pub fn new(process_instance_id: Uuid) -> Self {
        Self {
            process_instance_id,
            name: None,
            parent_activity_instance_id: None,
            terminal: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn children_of(mut self, parent_activity: Uuid) -> Self {
        self.parent_activity_instance_id = Some(parent_activity);
        self
    }

    pub fn non_terminal(mut self) -> Self {
        self.terminal = Some(false);
        self
    }

    pub fn matches(&self, node: &FlowNodeInstance) -> bool {
        node.parent_process_instance_id == self.process_instance_id
            && self.name.as_ref().map_or(true, |n| n == &node.name)
            && self
                .parent_activity_instance_id
                .map_or(true, |p| node.parent_activity_instance_id == Some(p))
            && self.terminal.map_or(true, |t| node.terminal == t)
    }
}

/// Waiting event lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WaitingEventQuery {
    pub message_name: Option<String>,
    pub signal_name: Option<String>,
    pub flow_node_instance_id: Option<Uuid>,
    pub active_only: bool,
}

impl WaitingEventQuery {
    pub fn message(name: impl Into<String>) -> Self {
        Self {
            message_name: Some(name.into()),
            active_only: true,
            ..Default::default()
        }
    }

    pub fn signal(name: impl Into<String>) -> Self {
        Self {
            signal_name: Some(name.into()),
            active_only: true,
            ..Default::default()
        }
    }

    pub fn for_flow_node(flow_node_instance_id: Uuid) -> Self {
        Self {
            flow_node_instance_id: Some(flow_node_instance_id),
            ..Default::default()
        }
    }

    pub fn active(mut self) -> Self {
        self.active_only = true;
        self
    }

    pub fn matches(&self, event: &WaitingEvent) -> bool {
        (!self.active_only || event.active)
            && self
                .message_name
                .as_deref()
                .map_or(true, |n| event.message_name() == Some(n))
            && self
                .signal_name
                .as_deref()
                .map_or(true, |n| event.signal_name() == Some(n))
            && self
                .flow_node_instance_id
                .map_or(true, |id| event.flow_node_instance_id == id)
    }
}

/// Persistence backend for the execution core
#[async_trait]
pub trait FlowNodeStore: Send + Sync + 'static {
    /// Open a transaction
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError>;
}

/// One optimistic unit of reads and writes.
///
/// Writes stay private until `commit`; reads see the transaction's own
/// writes. A transaction is closed by `commit` or `rollback`.
#[async_trait]
pub trait StoreTransaction: Send {
    // Process instances

    async fn get_process_instance(&mut self, id: Uuid) -> Result<ProcessInstance, StoreError>;

    async fn insert_process_instance(&mut self, process: ProcessInstance) -> Result<(), StoreError>;

    async fn update_process_instance(&mut self, process: &ProcessInstance) -> Result<(), StoreError>;

    /// Delete a process instance with its flow nodes, waiting events and data
    async fn delete_process_instance(&mut self, id: Uuid) -> Result<(), StoreError>;

    // Flow nodes

    async fn get_flow_node(&mut self, id: Uuid) -> Result<FlowNodeInstance, StoreError>;

    /// Matching flow nodes ordered by id. Observes the child set of the
    /// process so that a concurrent insert conflicts at commit.
    async fn find_flow_nodes(
        &mut self,
        query: &FlowNodeQuery,
    ) -> Result<Vec<FlowNodeInstance>, StoreError>;

    async fn insert_flow_node(&mut self, node: FlowNodeInstance) -> Result<(), StoreError>;

    async fn update_flow_node(&mut self, node: &FlowNodeInstance) -> Result<(), StoreError>;

    // Waiting events

    async fn insert_waiting_event(&mut self, event: WaitingEvent) -> Result<(), StoreError>;

    async fn get_waiting_event(&mut self, id: Uuid) -> Result<WaitingEvent, StoreError>;

    async fn find_waiting_events(
        &mut self,
        query: &WaitingEventQuery,
    ) -> Result<Vec<WaitingEvent>, StoreError>;

    async fn update_waiting_event(&mut self, event: &WaitingEvent) -> Result<(), StoreError>;

    /// Returns the number of events removed
    async fn delete_waiting_events_of(&mut self, flow_node_instance_id: Uuid)
        -> Result<usize, StoreError>;

    // Data

    async fn get_data(
        &mut self,
        container: DataContainer,
        name: &str,
    ) -> Result<Option<serde_json::Value>, StoreError>;

    async fn set_data(
        &mut self,
        container: DataContainer,
        name: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError>;

    async fn list_data(
        &mut self,
        container: DataContainer,
    ) -> Result<BTreeMap<String, serde_json::Value>, StoreError>;

    async fn get_business_data(
        &mut self,
        container: DataContainer,
        name: &str,
    ) -> Result<Option<BusinessDataRef>, StoreError>;

    async fn set_business_data(
        &mut self,
        container: DataContainer,
        name: &str,
        reference: BusinessDataRef,
    ) -> Result<(), StoreError>;

    async fn list_business_data(
        &mut self,
        container: DataContainer,
    ) -> Result<BTreeMap<String, BusinessDataRef>, StoreError>;

    // Lifecycle

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WaitingEventKind;

    #[test]
    fn test_error_classes() {
        let conflict = StoreError::ConcurrencyConflict {
            record: "flow_node".into(),
            expected: 1,
            actual: 2,
        };
        assert!(conflict.is_conflict());
        assert!(!conflict.is_transient());
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(StoreError::FlowNodeNotFound(Uuid::nil()).is_not_found());
    }

    #[test]
    fn test_waiting_event_query() {
        let process = Uuid::now_v7();
        let mut event = WaitingEvent {
            id: Uuid::now_v7(),
            kind: WaitingEventKind::Signal {
                signal_name: "go".into(),
            },
            process_definition_id: Uuid::now_v7(),
            flow_node_name: "catch".into(),
            root_process_instance_id: process,
            parent_process_instance_id: process,
            flow_node_instance_id: Uuid::now_v7(),
            active: true,
        };

        assert!(WaitingEventQuery::signal("go").matches(&event));
        assert!(!WaitingEventQuery::signal("stop").matches(&event));
        assert!(!WaitingEventQuery::message("go").matches(&event));

        event.active = false;
        assert!(!WaitingEventQuery::signal("go").matches(&event));
        assert!(WaitingEventQuery::for_flow_node(event.flow_node_instance_id).matches(&event));
    }
}
