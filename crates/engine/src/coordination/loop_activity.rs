//! Standard loop activities: one child per iteration, repeated while the
//! loop condition holds

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::engine::scope::{node_scope, LOOP_COUNTER};
use crate::engine::{FlowNodeFactory, WorkDescriptor};
use crate::error::EngineError;
use crate::expression::ExpressionEvaluator;
use crate::model::{
    FlowNodeDefinition, FlowNodeInstance, LoopCharacteristics, LoopPayload, StandardLoop,
    StateCategory,
};
use crate::persistence::StoreTransaction;
use crate::state::state_ids;

#[derive(Clone)]
pub struct LoopCoordinator {
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl LoopCoordinator {
    pub fn new(evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        Self { evaluator }
    }

    fn characteristics(node: &FlowNodeDefinition) -> Result<&StandardLoop, EngineError> {
        match &node.loop_characteristics {
            Some(LoopCharacteristics::Standard(standard)) => Ok(standard),
            _ => Err(EngineError::Consistency(format!(
                "'{}' has no standard loop characteristics",
                node.name
            ))),
        }
    }

    fn payload_mut(parent: &mut FlowNodeInstance) -> Result<&mut LoopPayload, EngineError> {
        let name = parent.name.clone();
        parent
            .loop_payload_mut()
            .ok_or_else(|| EngineError::Consistency(format!("'{name}' is not a loop parent")))
    }

    pub async fn start(
        &self,
        tx: &mut dyn StoreTransaction,
        factory: &FlowNodeFactory,
        node: &FlowNodeDefinition,
        parent: &mut FlowNodeInstance,
        followups: &mut Vec<WorkDescriptor>,
    ) -> Result<(), EngineError> {
        let standard = Self::characteristics(node)?;
        let below_max = Self::payload_mut(parent)?.below_max();
        let proceed = below_max
            && (!standard.test_before || self.condition_holds(tx, standard, parent, 0).await?);

        if proceed {
            self.create_child(tx, factory, node, parent, followups).await
        } else {
            self.exhaust(parent, followups)
        }
    }

    pub async fn on_child_terminal(
        &self,
        tx: &mut dyn StoreTransaction,
        factory: &FlowNodeFactory,
        node: &FlowNodeDefinition,
        parent: &mut FlowNodeInstance,
        child: &FlowNodeInstance,
        followups: &mut Vec<WorkDescriptor>,
    ) -> Result<(), EngineError> {
        let standard = Self::characteristics(node)?;
        let payload = Self::payload_mut(parent)?;
        if payload.number_of_active_instances == 0 {
            return Err(EngineError::Consistency(format!(
                "iteration {} of '{}' terminated but none is active",
                child.id, node.name
            )));
        }
        payload.number_of_active_instances -= 1;
        let active = payload.number_of_active_instances;
        let (loop_count, below_max) = (payload.loop_count, payload.below_max());

        if parent.state_id != state_ids::EXECUTING_CHILDREN {
            return Ok(());
        }
        if parent.state_category != StateCategory::Normal {
            if active == 0 {
                followups.push(WorkDescriptor::advance(parent.id, parent.state_id));
            }
            return Ok(());
        }

        let again = child.state_id == state_ids::COMPLETED
            && below_max
            && self.condition_holds(tx, standard, parent, loop_count).await?;
        if again {
            self.create_child(tx, factory, node, parent, followups).await
        } else {
            self.exhaust(parent, followups)
        }
    }

    /// Whether the parent may leave `executing_children` normally
    pub fn completion_policy_holds(parent: &FlowNodeInstance) -> bool {
        parent
            .loop_payload()
            .is_some_and(|p| p.exhausted && p.number_of_active_instances == 0)
    }

    async fn condition_holds(
        &self,
        tx: &mut dyn StoreTransaction,
        standard: &StandardLoop,
        parent: &FlowNodeInstance,
        loop_counter: u32,
    ) -> Result<bool, EngineError> {
        let mut scope = node_scope(tx, parent).await?;
        scope.insert(LOOP_COUNTER.into(), Value::from(loop_counter));
        Ok(self
            .evaluator
            .evaluate_condition(&standard.loop_condition, &scope)?)
    }

    async fn create_child(
        &self,
        tx: &mut dyn StoreTransaction,
        factory: &FlowNodeFactory,
        node: &FlowNodeDefinition,
        parent: &mut FlowNodeInstance,
        followups: &mut Vec<WorkDescriptor>,
    ) -> Result<(), EngineError> {
        let index = Self::payload_mut(parent)?.loop_count;
        let child = factory.create_child(node, parent, index)?;
        let child_id = child.id;
        tx.insert_flow_node(child).await?;
        followups.push(WorkDescriptor::advance(child_id, state_ids::INITIALIZING));

        let payload = Self::payload_mut(parent)?;
        payload.loop_count += 1;
        payload.number_of_active_instances += 1;
        debug!(flow_node_id = %parent.id, child_id = %child_id, iteration = index, "loop iteration started");
        Ok(())
    }

    fn exhaust(
        &self,
        parent: &mut FlowNodeInstance,
        followups: &mut Vec<WorkDescriptor>,
    ) -> Result<(), EngineError> {
        Self::payload_mut(parent)?.exhausted = true;
        followups.push(WorkDescriptor::advance(parent.id, parent.state_id));
        Ok(())
    }
}
