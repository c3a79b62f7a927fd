//! Expression scopes and data assignment
//!
//! A node sees its process variables, overlaid by its own local variables.
//! Business references are exposed as their ids.

use serde_json::Value;
use uuid::Uuid;

use crate::error::EngineError;
use crate::expression::Scope;
use crate::model::{BusinessDataRef, DataContainer, FlowNodeInstance};
use crate::persistence::StoreTransaction;

pub const LOOP_COUNTER: &str = "loopCounter";

pub async fn process_scope(
    tx: &mut dyn StoreTransaction,
    process_instance_id: Uuid,
) -> Result<Scope, EngineError> {
    let container = DataContainer::Process(process_instance_id);
    let mut scope: Scope = tx.list_data(container).await?.into_iter().collect();
    for (name, reference) in tx.list_business_data(container).await? {
        scope.insert(name, reference.to_value());
    }
    Ok(scope)
}

pub async fn node_scope(
    tx: &mut dyn StoreTransaction,
    node: &FlowNodeInstance,
) -> Result<Scope, EngineError> {
    let mut scope = process_scope(tx, node.parent_process_instance_id).await?;
    let local = DataContainer::FlowNode(node.id);
    scope.extend(tx.list_data(local).await?);
    for (name, reference) in tx.list_business_data(local).await? {
        scope.insert(name, reference.to_value());
    }
    if let Some(counter) = node.loop_counter {
        scope.insert(LOOP_COUNTER.to_string(), Value::from(counter));
    }
    Ok(scope)
}

/// Assign `value` to the variable `target` as seen from `node`: the closest
/// existing declaration wins, business references before plain data.
pub async fn assign(
    tx: &mut dyn StoreTransaction,
    node: &FlowNodeInstance,
    target: &str,
    value: Value,
) -> Result<(), EngineError> {
    let local = DataContainer::FlowNode(node.id);
    let process = DataContainer::Process(node.parent_process_instance_id);

    for container in [local, process] {
        if tx.get_business_data(container, target).await?.is_some() {
            let reference = BusinessDataRef::from_value(target, &value)?;
            tx.set_business_data(container, target, reference).await?;
            return Ok(());
        }
        if container == local && tx.get_data(local, target).await?.is_some() {
            tx.set_data(local, target, value).await?;
            return Ok(());
        }
    }

    // Read before writing so concurrent assignments to the same variable conflict
    tx.get_data(process, target).await?;
    tx.set_data(process, target, value).await?;
    Ok(())
}
