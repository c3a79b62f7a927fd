//! Follow-up work descriptors and the scheduler seam
//!
//! A committed unit of work never runs its continuations inline. It records
//! [`WorkDescriptor`]s which the executor hands to a [`WorkScheduler`] once
//! the transaction is durable.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;
use crate::model::MessageKey;
use crate::state::StateId;

/// Serializable description of one schedulable unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkDescriptor {
    /// Move a flow node out of `expected_state`
    AdvanceFlowNode {
        flow_node_instance_id: Uuid,
        expected_state: StateId,
    },
    /// Consume one signal waiting event
    TriggerSignal {
        waiting_event_id: Uuid,
        signal_name: String,
    },
    /// Deliver a thrown message
    TriggerMessage { key: MessageKey },
}

impl WorkDescriptor {
    pub fn advance(flow_node_instance_id: Uuid, expected_state: StateId) -> Self {
        Self::AdvanceFlowNode {
            flow_node_instance_id,
            expected_state,
        }
    }
}

impl fmt::Display for WorkDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AdvanceFlowNode {
                flow_node_instance_id,
                expected_state,
            } => write!(f, "advance {flow_node_instance_id} from state {expected_state}"),
            Self::TriggerSignal {
                waiting_event_id,
                signal_name,
            } => write!(f, "trigger signal '{signal_name}' on {waiting_event_id}"),
            Self::TriggerMessage { key } => write!(f, "deliver {key}"),
        }
    }
}

/// Where committed follow-up work is sent
#[async_trait]
pub trait WorkScheduler: Send + Sync {
    async fn submit(&self, descriptor: WorkDescriptor) -> Result<(), EngineError>;
}
