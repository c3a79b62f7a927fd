//! Waiting events: a node's registration to be woken by a trigger

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a waiting event can be matched by
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaitingEventKind {
    Message {
        message_name: String,
        /// Name of the process definition the waiter belongs to
        process_name: String,
        flow_node_name: String,
        #[serde(default)]
        correlations: BTreeMap<String, serde_json::Value>,
    },
    Signal {
        signal_name: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitingEvent {
    pub id: Uuid,
    pub kind: WaitingEventKind,
    pub process_definition_id: Uuid,
    pub flow_node_name: String,
    pub root_process_instance_id: Uuid,
    pub parent_process_instance_id: Uuid,
    pub flow_node_instance_id: Uuid,

    /// Cleared by the single trigger that consumes the event
    pub active: bool,
}

impl WaitingEvent {
    pub fn signal_name(&self) -> Option<&str> {
        match &self.kind {
            WaitingEventKind::Signal { signal_name } => Some(signal_name),
            WaitingEventKind::Message { .. } => None,
        }
    }

    pub fn message_name(&self) -> Option<&str> {
        match &self.kind {
            WaitingEventKind::Message { message_name, .. } => Some(message_name),
            WaitingEventKind::Signal { .. } => None,
        }
    }
}

/// Address of a thrown message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageKey {
    pub message_name: String,
    pub target_process: String,
    #[serde(default)]
    pub target_flow_node: Option<String>,
    #[serde(default)]
    pub correlations: BTreeMap<String, serde_json::Value>,
}

impl MessageKey {
    pub fn new(message_name: impl Into<String>, target_process: impl Into<String>) -> Self {
        Self {
            message_name: message_name.into(),
            target_process: target_process.into(),
            target_flow_node: None,
            correlations: BTreeMap::new(),
        }
    }

    pub fn with_target_flow_node(mut self, name: impl Into<String>) -> Self {
        self.target_flow_node = Some(name.into());
        self
    }

    pub fn with_correlation(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.correlations.insert(key.into(), value);
        self
    }

    /// A waiter matches when every correlation it declares is carried by the
    /// key with an equal value
    pub fn matches(&self, event: &WaitingEvent) -> bool {
        let WaitingEventKind::Message {
            message_name,
            process_name,
            flow_node_name,
            correlations,
        } = &event.kind
        else {
            return false;
        };

        message_name == &self.message_name
            && process_name == &self.target_process
            && self
                .target_flow_node
                .as_ref()
                .map_or(true, |target| target == flow_node_name)
            && correlations
                .iter()
                .all(|(key, value)| self.correlations.get(key) == Some(value))
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "message '{}' to '{}'", self.message_name, self.target_process)?;
        if let Some(node) = &self.target_flow_node {
            write!(f, "/'{}'", node)?;
        }
        if !self.correlations.is_empty() {
            let pairs: Vec<_> = self
                .correlations
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            write!(f, " [{}]", pairs.join(", "))?;
        }
        Ok(())
    }
}
