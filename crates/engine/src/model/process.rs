//! Process instance record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::flow_node::StateCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Started,
    Aborting,
    Cancelling,
    Completed,
    Aborted,
    Cancelled,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Cancelled)
    }

    /// Category forced on the flow nodes of a process in this state
    pub fn node_category(self) -> StateCategory {
        match self {
            Self::Aborting | Self::Aborted => StateCategory::Aborting,
            Self::Cancelling | Self::Cancelled => StateCategory::Cancelling,
            _ => StateCategory::Normal,
        }
    }

    /// State reached once every flow node is terminal
    pub fn settled(self) -> Self {
        match self {
            Self::Started => Self::Completed,
            Self::Aborting => Self::Aborted,
            Self::Cancelling => Self::Cancelled,
            other => other,
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Started => "started",
            Self::Aborting => "aborting",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Owner of flow nodes, waiting events and data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInstance {
    pub id: Uuid,
    pub process_definition_id: Uuid,
    pub name: String,
    pub state: ProcessState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ProcessInstance {
    pub fn new(process_definition_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            process_definition_id,
            name: name.into(),
            state: ProcessState::Started,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn settle(&mut self) {
        self.state = self.state.settled();
        self.ended_at = Some(Utc::now());
    }
}
