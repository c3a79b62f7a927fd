//! Multi-instance activities
//!
//! The parent instance carries the counters; children are plain instances of
//! the same definition node with `loop_counter` set. Every child terminating
//! updates the parent record, so concurrent completions serialize through
//! optimistic conflicts and the counters always add up.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::engine::scope::node_scope;
use crate::engine::{FlowNodeFactory, WorkDescriptor};
use crate::error::EngineError;
use crate::expression::{ExpressionEvaluator, Scope};
use crate::model::{
    BusinessDataRef, DataContainer, FlowNodeDefinition, FlowNodeInstance, LoopCharacteristics,
    MultiInstanceLoop, MultiInstancePayload, ProcessDefinition, StateCategory,
};
use crate::persistence::StoreTransaction;
use crate::state::state_ids;

/// Input collection of a data-driven multi-instance
#[derive(Debug, Clone, PartialEq)]
enum Collection {
    Business(Vec<i64>),
    Plain(Vec<Value>),
}

impl Collection {
    fn len(&self) -> usize {
        match self {
            Self::Business(ids) => ids.len(),
            Self::Plain(values) => values.len(),
        }
    }
}

#[derive(Clone)]
pub struct MultiInstanceCoordinator {
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl MultiInstanceCoordinator {
    pub fn new(evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        Self { evaluator }
    }

    fn characteristics(node: &FlowNodeDefinition) -> Result<&MultiInstanceLoop, EngineError> {
        match &node.loop_characteristics {
            Some(LoopCharacteristics::MultiInstance(multi)) => Ok(multi),
            _ => Err(EngineError::Consistency(format!(
                "'{}' has no multi-instance characteristics",
                node.name
            ))),
        }
    }

    fn payload(parent: &FlowNodeInstance) -> Result<&MultiInstancePayload, EngineError> {
        parent.multi_instance().ok_or_else(|| {
            EngineError::Consistency(format!("'{}' is not a multi-instance parent", parent.name))
        })
    }

    fn payload_mut(parent: &mut FlowNodeInstance) -> Result<&mut MultiInstancePayload, EngineError> {
        let name = parent.name.clone();
        parent.multi_instance_mut().ok_or_else(|| {
            EngineError::Consistency(format!("'{name}' is not a multi-instance parent"))
        })
    }

    /// Entered `executing_children`: resolve the cardinality and create the
    /// first child, or all of them when parallel
    pub async fn start(
        &self,
        tx: &mut dyn StoreTransaction,
        factory: &FlowNodeFactory,
        node: &FlowNodeDefinition,
        parent: &mut FlowNodeInstance,
        followups: &mut Vec<WorkDescriptor>,
    ) -> Result<(), EngineError> {
        let multi = Self::characteristics(node)?;
        if let Some(expression) = &multi.loop_cardinality {
            let scope = node_scope(tx, parent).await?;
            let cardinality = self.evaluator.evaluate_count(expression, &scope)?;
            Self::payload_mut(parent)?.loop_cardinality = Some(cardinality);
        }

        let mut created = 0;
        while self.should_create_new_instance(tx, multi, parent).await?
            && (!multi.sequential || created == 0)
        {
            self.create_child(tx, factory, node, multi, parent, followups).await?;
            created += 1;
        }

        debug!(
            flow_node = %node.name,
            flow_node_id = %parent.id,
            created,
            sequential = multi.sequential,
            "multi-instance started"
        );
        if created == 0 {
            followups.push(WorkDescriptor::advance(parent.id, state_ids::EXECUTING_CHILDREN));
        }
        Ok(())
    }

    /// Count a child that reached a terminal state and schedule whatever
    /// comes next: another child, the parent, or nothing yet
    pub async fn on_child_terminal(
        &self,
        tx: &mut dyn StoreTransaction,
        factory: &FlowNodeFactory,
        definition: &ProcessDefinition,
        node: &FlowNodeDefinition,
        parent: &mut FlowNodeInstance,
        child: &FlowNodeInstance,
        followups: &mut Vec<WorkDescriptor>,
    ) -> Result<(), EngineError> {
        let multi = Self::characteristics(node)?;
        let completed = child.state_id == state_ids::COMPLETED;
        {
            let payload = Self::payload_mut(parent)?;
            if payload.number_of_active_instances == 0 {
                return Err(EngineError::Consistency(format!(
                    "child {} of '{}' terminated but no child is active",
                    child.id, node.name
                )));
            }
            payload.number_of_active_instances -= 1;
            if completed {
                payload.number_of_completed_instances += 1;
            } else {
                payload.number_of_terminated_instances += 1;
            }
        }
        if completed {
            self.merge_output(tx, definition, multi, parent, child).await?;
        }

        if parent.state_id != state_ids::EXECUTING_CHILDREN {
            return Ok(());
        }
        let active = Self::payload(parent)?.number_of_active_instances;
        if parent.state_category != StateCategory::Normal {
            if active == 0 {
                followups.push(WorkDescriptor::advance(parent.id, parent.state_id));
            }
            return Ok(());
        }

        if self.completion_condition_holds(tx, multi, parent).await? {
            debug!(flow_node_id = %parent.id, "completion condition reached");
            followups.push(WorkDescriptor::advance(parent.id, parent.state_id));
            return Ok(());
        }

        while self.should_create_new_instance(tx, multi, parent).await?
            && (!multi.sequential || Self::payload(parent)?.number_of_active_instances == 0)
        {
            self.create_child(tx, factory, node, multi, parent, followups).await?;
        }

        if Self::payload(parent)?.number_of_active_instances == 0
            && !self.should_create_new_instance(tx, multi, parent).await?
        {
            followups.push(WorkDescriptor::advance(parent.id, parent.state_id));
        }
        Ok(())
    }

    /// Whether the parent may leave `executing_children` normally
    pub async fn completion_policy_holds(
        &self,
        tx: &mut dyn StoreTransaction,
        node: &FlowNodeDefinition,
        parent: &FlowNodeInstance,
    ) -> Result<bool, EngineError> {
        let multi = Self::characteristics(node)?;
        if self.completion_condition_holds(tx, multi, parent).await? {
            return Ok(true);
        }
        Ok(Self::payload(parent)?.number_of_active_instances == 0
            && !self.should_create_new_instance(tx, multi, parent).await?)
    }

    async fn completion_condition_holds(
        &self,
        tx: &mut dyn StoreTransaction,
        multi: &MultiInstanceLoop,
        parent: &FlowNodeInstance,
    ) -> Result<bool, EngineError> {
        let Some(condition) = &multi.completion_condition else {
            return Ok(false);
        };
        let scope = self.completion_scope(tx, multi, parent).await?;
        Ok(self.evaluator.evaluate_condition(condition, &scope)?)
    }

    async fn completion_scope(
        &self,
        tx: &mut dyn StoreTransaction,
        multi: &MultiInstanceLoop,
        parent: &FlowNodeInstance,
    ) -> Result<Scope, EngineError> {
        let payload = Self::payload(parent)?;
        let total = self.number_of_instances(tx, multi, parent).await?;
        let mut scope = node_scope(tx, parent).await?;
        scope.insert("numberOfInstances".into(), Value::from(total));
        scope.insert(
            "numberOfActiveInstances".into(),
            Value::from(payload.number_of_active_instances),
        );
        scope.insert(
            "numberOfCompletedInstances".into(),
            Value::from(payload.number_of_completed_instances),
        );
        scope.insert(
            "numberOfTerminatedInstances".into(),
            Value::from(payload.number_of_terminated_instances),
        );
        Ok(scope)
    }

    /// Static cardinality, or the current size of the input collection
    async fn number_of_instances(
        &self,
        tx: &mut dyn StoreTransaction,
        multi: &MultiInstanceLoop,
        parent: &FlowNodeInstance,
    ) -> Result<u32, EngineError> {
        if let Some(cardinality) = Self::payload(parent)?.loop_cardinality {
            return Ok(cardinality);
        }
        let length = match self.load_collection(tx, multi, parent).await? {
            Some(collection) => collection.len(),
            None => 0,
        };
        u32::try_from(length).map_err(|_| {
            EngineError::Consistency(format!("collection of '{}' is too large", parent.name))
        })
    }

    async fn should_create_new_instance(
        &self,
        tx: &mut dyn StoreTransaction,
        multi: &MultiInstanceLoop,
        parent: &FlowNodeInstance,
    ) -> Result<bool, EngineError> {
        let created = Self::payload(parent)?.created();
        Ok(created < self.number_of_instances(tx, multi, parent).await?)
    }

    /// Input collection, business references first
    async fn load_collection(
        &self,
        tx: &mut dyn StoreTransaction,
        multi: &MultiInstanceLoop,
        parent: &FlowNodeInstance,
    ) -> Result<Option<Collection>, EngineError> {
        let Some(name) = &multi.loop_data_input else {
            return Ok(None);
        };
        let container = DataContainer::Process(parent.parent_process_instance_id);
        match tx.get_business_data(container, name).await? {
            Some(BusinessDataRef::Multiple(ids)) => return Ok(Some(Collection::Business(ids))),
            Some(BusinessDataRef::Single(_)) => {
                return Err(EngineError::Definition(format!(
                    "input collection '{name}' of '{}' references a single business object",
                    parent.name
                )))
            }
            None => {}
        }
        match tx.get_data(container, name).await? {
            Some(Value::Array(values)) => Ok(Some(Collection::Plain(values))),
            Some(other) => Err(EngineError::Definition(format!(
                "input collection '{name}' of '{}' is not a list: {other}",
                parent.name
            ))),
            None => Err(EngineError::Definition(format!(
                "input collection '{name}' of '{}' is not set",
                parent.name
            ))),
        }
    }

    async fn create_child(
        &self,
        tx: &mut dyn StoreTransaction,
        factory: &FlowNodeFactory,
        node: &FlowNodeDefinition,
        multi: &MultiInstanceLoop,
        parent: &mut FlowNodeInstance,
        followups: &mut Vec<WorkDescriptor>,
    ) -> Result<(), EngineError> {
        let index = Self::payload(parent)?.created();
        let child = factory.create_child(node, parent, index)?;
        let local = DataContainer::FlowNode(child.id);
        let process = DataContainer::Process(parent.parent_process_instance_id);

        if let Some(item) = &multi.data_input_item {
            match self.load_collection(tx, multi, parent).await? {
                Some(Collection::Business(ids)) => {
                    let id = ids.get(index as usize).copied().ok_or_else(|| {
                        EngineError::Consistency(format!(
                            "no business reference at index {index} of '{}'",
                            parent.name
                        ))
                    })?;
                    tx.set_business_data(local, item, BusinessDataRef::Single(Some(id)))
                        .await?;
                }
                Some(Collection::Plain(values)) => {
                    let value = values.get(index as usize).cloned().unwrap_or(Value::Null);
                    tx.set_data(local, item, value).await?;
                }
                None => {}
            }
        }

        if let Some(item) = &multi.data_output_item {
            let business_output = match &multi.loop_data_output {
                Some(output) => matches!(
                    tx.get_business_data(process, output).await?,
                    Some(BusinessDataRef::Multiple(_))
                ),
                None => false,
            };
            if business_output {
                tx.set_business_data(local, item, BusinessDataRef::Single(None))
                    .await?;
            } else {
                tx.set_data(local, item, Value::Null).await?;
            }
        }

        let child_id = child.id;
        tx.insert_flow_node(child).await?;
        followups.push(WorkDescriptor::advance(child_id, state_ids::INITIALIZING));
        Self::payload_mut(parent)?.number_of_active_instances += 1;
        debug!(flow_node_id = %parent.id, child_id = %child_id, loop_counter = index, "child created");
        Ok(())
    }

    /// Fold a completed child's output item into the output collection
    async fn merge_output(
        &self,
        tx: &mut dyn StoreTransaction,
        definition: &ProcessDefinition,
        multi: &MultiInstanceLoop,
        parent: &FlowNodeInstance,
        child: &FlowNodeInstance,
    ) -> Result<(), EngineError> {
        let (Some(output), Some(item)) = (&multi.loop_data_output, &multi.data_output_item) else {
            return Ok(());
        };
        let process = DataContainer::Process(parent.parent_process_instance_id);
        let local = DataContainer::FlowNode(child.id);
        let produced = tx.get_business_data(local, item).await?;

        if let Some(BusinessDataRef::Multiple(mut ids)) =
            tx.get_business_data(process, output).await?
        {
            if let Some(BusinessDataRef::Single(Some(id))) = produced {
                ids.push(id);
                tx.set_business_data(process, output, BusinessDataRef::Multiple(ids))
                    .await?;
            }
            return Ok(());
        }

        if definition.data_definition(output).is_some_and(|d| d.business) {
            warn!(
                output = %output,
                flow_node = %parent.name,
                "business output collection is not a reference list, storing plain values"
            );
        }
        let value = match tx.get_data(local, item).await? {
            Some(value) => value,
            None => produced.map_or(Value::Null, |r| r.to_value()),
        };
        let mut values = match tx.get_data(process, output).await? {
            Some(Value::Array(values)) => values,
            _ => Vec::new(),
        };
        let index = child.loop_counter.unwrap_or(0) as usize;
        if values.len() <= index {
            values.resize(index + 1, Value::Null);
        }
        values[index] = value;
        tx.set_data(process, output, Value::Array(values)).await?;
        Ok(())
    }
}
