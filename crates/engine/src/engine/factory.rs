//! Builds flow node instances from their definitions

use std::sync::Arc;

use uuid::Uuid;

use crate::error::EngineError;
use crate::model::{
    EventType, FlowNodeDefinition, FlowNodeDefinitionKind, FlowNodeInstance, FlowNodeKind,
    GatewayPayload, LoopCharacteristics, LoopPayload, MultiInstancePayload, ProcessDefinition,
};
use crate::state::StateRegistry;

#[derive(Clone)]
pub struct FlowNodeFactory {
    registry: Arc<StateRegistry>,
}

impl FlowNodeFactory {
    pub fn new(registry: Arc<StateRegistry>) -> Self {
        Self { registry }
    }

    /// Instance reached through a transition. Looping nodes become a
    /// multi-instance or loop parent.
    pub fn create(
        &self,
        definition: &ProcessDefinition,
        root_process_instance_id: Uuid,
        parent_process_instance_id: Uuid,
        node: &FlowNodeDefinition,
    ) -> Result<FlowNodeInstance, EngineError> {
        let kind = match &node.loop_characteristics {
            Some(LoopCharacteristics::MultiInstance(multi)) => {
                FlowNodeKind::MultiInstance(MultiInstancePayload::new(multi.sequential))
            }
            Some(LoopCharacteristics::Standard(standard)) => {
                FlowNodeKind::Loop(LoopPayload::new(standard.loop_max))
            }
            None => Self::base_kind(&node.kind),
        };
        self.instantiate(
            definition.id,
            &node.name,
            root_process_instance_id,
            parent_process_instance_id,
            kind,
        )
    }

    /// One iteration of a multi-instance or loop parent
    pub fn create_child(
        &self,
        node: &FlowNodeDefinition,
        parent: &FlowNodeInstance,
        loop_counter: u32,
    ) -> Result<FlowNodeInstance, EngineError> {
        let child = self.instantiate(
            parent.process_definition_id,
            &node.name,
            parent.root_process_instance_id,
            parent.parent_process_instance_id,
            Self::base_kind(&node.kind),
        )?;
        Ok(child.with_parent_activity(parent.id, loop_counter))
    }

    fn instantiate(
        &self,
        process_definition_id: Uuid,
        name: &str,
        root_process_instance_id: Uuid,
        parent_process_instance_id: Uuid,
        kind: FlowNodeKind,
    ) -> Result<FlowNodeInstance, EngineError> {
        let category = kind.category();
        let initial = self.registry.initial_state(category).ok_or_else(|| {
            EngineError::Consistency(format!("no initial state for category {category}"))
        })?;
        Ok(FlowNodeInstance::new(
            process_definition_id,
            name,
            root_process_instance_id,
            parent_process_instance_id,
            kind,
            initial,
        ))
    }

    fn base_kind(kind: &FlowNodeDefinitionKind) -> FlowNodeKind {
        match kind {
            FlowNodeDefinitionKind::StartEvent => FlowNodeKind::Event {
                event_type: EventType::Start,
            },
            FlowNodeDefinitionKind::EndEvent { .. } => FlowNodeKind::Event {
                event_type: EventType::End,
            },
            FlowNodeDefinitionKind::IntermediateCatchEvent { .. } => FlowNodeKind::Event {
                event_type: EventType::IntermediateCatch,
            },
            FlowNodeDefinitionKind::IntermediateThrowEvent { .. } => FlowNodeKind::Event {
                event_type: EventType::IntermediateThrow,
            },
            FlowNodeDefinitionKind::AutomaticTask => FlowNodeKind::AutomaticTask,
            FlowNodeDefinitionKind::HumanTask => FlowNodeKind::HumanTask,
            FlowNodeDefinitionKind::CallActivity => FlowNodeKind::CallActivity,
            FlowNodeDefinitionKind::Gateway { gateway_type, .. } => {
                FlowNodeKind::Gateway(GatewayPayload::new(*gateway_type))
            }
        }
    }
}
