//! Transition resolver: which state a node enters next

use std::sync::Arc;

use tracing::{debug, instrument};

use super::breakpoint::BreakpointService;
use super::registry::{state_ids, FlowNodeState, StateChain, StateId, StateRegistry};
use crate::error::EngineError;
use crate::model::{FlowNodeInstance, StateCategory};

/// Computes the next state of a flow node from its category, kind and
/// current state, consulting breakpoints on the way
#[derive(Clone)]
pub struct TransitionResolver {
    registry: Arc<StateRegistry>,
    breakpoints: Arc<dyn BreakpointService>,
}

impl TransitionResolver {
    pub fn new(registry: Arc<StateRegistry>, breakpoints: Arc<dyn BreakpointService>) -> Self {
        Self {
            registry,
            breakpoints,
        }
    }

    pub fn registry(&self) -> &StateRegistry {
        &self.registry
    }

    /// Next state of `node` when leaving `current`
    #[instrument(skip(self, node), fields(flow_node_id = %node.id, flow_node = %node.name))]
    pub async fn next_state(
        &self,
        node: &FlowNodeInstance,
        current: StateId,
    ) -> Result<FlowNodeState, EngineError> {
        let category = node.kind.category();
        let chain = self.registry.chain(category).ok_or_else(|| {
            EngineError::Consistency(format!("no state chain for category {category}"))
        })?;
        let current_state = self.state(current)?;

        let next_id = match node.state_category {
            StateCategory::Normal => {
                let from = if current == state_ids::INTERRUPTED {
                    node.previous_state_id.ok_or_else(|| {
                        EngineError::Consistency(format!(
                            "interrupted node {} has no previous state to resume",
                            node.id
                        ))
                    })?
                } else {
                    current
                };
                self.next_in(&chain.normal, from, node)?
            }
            StateCategory::Aborting => Self::interrupting_next(&chain.aborting, current),
            StateCategory::Cancelling => Self::interrupting_next(&chain.cancelling, current),
        };
        let next = self.state(next_id)?;

        if self.breakpoints.is_active() && !current_state.interrupting {
            let breakpoint = self
                .breakpoints
                .breakpoint_for(
                    node.process_definition_id,
                    node.root_process_instance_id,
                    &node.name,
                    next.id,
                )
                .await
                .map_err(EngineError::Breakpoint)?;
            if let Some(breakpoint) = breakpoint {
                debug!(
                    next = %next,
                    interrupted_state = breakpoint.interrupted_state_id,
                    "Breakpoint hit"
                );
                return self.state(breakpoint.interrupted_state_id).cloned();
            }
        }

        Ok(next.clone())
    }

    fn state(&self, id: StateId) -> Result<&FlowNodeState, EngineError> {
        self.registry
            .state(id)
            .ok_or_else(|| EngineError::Consistency(format!("unknown state id {id}")))
    }

    /// Next state in `sequence` that the node's kind does not skip
    fn next_in(
        &self,
        sequence: &[StateId],
        from: StateId,
        node: &FlowNodeInstance,
    ) -> Result<StateId, EngineError> {
        let mut cursor = from;
        loop {
            let next = StateChain::after(sequence, cursor).ok_or_else(|| {
                EngineError::Consistency(format!(
                    "state {from} of '{}' has no successor in its {} chain",
                    node.name,
                    node.kind.category()
                ))
            })?;
            if !node.kind.skips_state(next) {
                return Ok(next);
            }
            cursor = next;
        }
    }

    /// Inside the chain: its successor. Anywhere else: the chain's entry.
    fn interrupting_next(sequence: &[StateId], current: StateId) -> StateId {
        if sequence.contains(&current) {
            if let Some(next) = StateChain::after(sequence, current) {
                return next;
            }
        }
        sequence.first().copied().unwrap_or(current)
    }
}
