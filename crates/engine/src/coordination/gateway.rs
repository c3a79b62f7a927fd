//! Converging gateways
//!
//! Every token arriving at a gateway is recorded on one gateway instance per
//! activation. The arrival that satisfies the firing rule sets `finished` in
//! the same write, so concurrent arrivals conflict on the gateway record and
//! only one of them can observe the rule turning true.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::engine::scope::process_scope;
use crate::engine::{FlowNodeFactory, WorkDescriptor};
use crate::error::EngineError;
use crate::expression::ExpressionEvaluator;
use crate::model::{
    FlowNodeDefinition, FlowNodeDefinitionKind, FlowNodeInstance, GatewayPayload, GatewayType,
    ProcessDefinition, TransitionDefinition,
};
use crate::persistence::{FlowNodeQuery, StoreTransaction};
use crate::state::state_ids;

/// Outcome of one token reaching a gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayArrival {
    /// Recorded; more tokens are needed
    Waiting { gateway_id: Uuid },
    /// This token made the gateway fire
    Fired { gateway_id: Uuid },
}

impl GatewayArrival {
    pub fn gateway_id(&self) -> Uuid {
        match self {
            Self::Waiting { gateway_id } | Self::Fired { gateway_id } => *gateway_id,
        }
    }
}

#[derive(Clone)]
pub struct GatewayCoordinator {
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl GatewayCoordinator {
    pub fn new(evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        Self { evaluator }
    }

    /// Record a token sent by `source` over `transition` into `gateway`
    #[allow(clippy::too_many_arguments)]
    pub async fn arrive(
        &self,
        tx: &mut dyn StoreTransaction,
        factory: &FlowNodeFactory,
        definition: &ProcessDefinition,
        source: &FlowNodeInstance,
        gateway: &FlowNodeDefinition,
        transition: &TransitionDefinition,
        followups: &mut Vec<WorkDescriptor>,
    ) -> Result<GatewayArrival, EngineError> {
        let query = FlowNodeQuery::new(source.parent_process_instance_id)
            .with_name(&gateway.name)
            .non_terminal();
        let existing = tx.find_flow_nodes(&query).await?.into_iter().find(|node| {
            node.gateway()
                .is_some_and(|g| !g.is_finished() && !g.is_hit_by(&transition.name))
        });

        let created = existing.is_none();
        let mut instance = match existing {
            Some(instance) => instance,
            None => factory.create(
                definition,
                source.root_process_instance_id,
                source.parent_process_instance_id,
                gateway,
            )?,
        };

        let mut payload = instance
            .gateway()
            .cloned()
            .ok_or_else(|| EngineError::Consistency(format!("'{}' is not a gateway", gateway.name)))?;
        payload.hit(&transition.name);
        let fire = self
            .should_fire(tx, definition, gateway, &payload, source.parent_process_instance_id)
            .await?;
        payload.finished = fire;
        if let Some(slot) = instance.gateway_mut() {
            *slot = payload;
        }

        debug!(
            gateway = %gateway.name,
            gateway_id = %instance.id,
            transition = %transition.name,
            fire,
            "token reached gateway"
        );

        let gateway_id = instance.id;
        if created {
            tx.insert_flow_node(instance).await?;
            followups.push(WorkDescriptor::advance(gateway_id, state_ids::INITIALIZING));
        } else {
            tx.update_flow_node(&instance).await?;
            if fire {
                followups.push(WorkDescriptor::advance(gateway_id, instance.state_id));
            }
        }

        Ok(if fire {
            GatewayArrival::Fired { gateway_id }
        } else {
            GatewayArrival::Waiting { gateway_id }
        })
    }

    async fn should_fire(
        &self,
        tx: &mut dyn StoreTransaction,
        definition: &ProcessDefinition,
        gateway: &FlowNodeDefinition,
        payload: &GatewayPayload,
        process_instance_id: Uuid,
    ) -> Result<bool, EngineError> {
        let all_incoming_hit =
            || definition.incoming(&gateway.name).all(|t| payload.is_hit_by(&t.name));

        match payload.gateway_type {
            GatewayType::Exclusive => Ok(true),
            GatewayType::Parallel | GatewayType::Inclusive => Ok(all_incoming_hit()),
            GatewayType::Complex => {
                let condition = match &gateway.kind {
                    FlowNodeDefinitionKind::Gateway {
                        activation_condition: Some(condition),
                        ..
                    } => condition,
                    _ => return Ok(all_incoming_hit()),
                };
                let mut scope = process_scope(tx, process_instance_id).await?;
                scope.insert("hitBys".into(), Value::from(payload.hit_bys.clone()));
                scope.insert("hitCount".into(), Value::from(payload.hit_bys.len()));
                scope.insert(
                    "incomingCount".into(),
                    Value::from(definition.incoming(&gateway.name).count()),
                );
                Ok(self.evaluator.evaluate_condition(condition, &scope)?)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::MinijinjaEvaluator;
    use crate::model::FlowNodeKind;
    use crate::persistence::{FlowNodeStore, InMemoryFlowNodeStore};
    use crate::state::StateRegistry;
    use serde_json::json;

    fn definition(gateway: Value) -> ProcessDefinition {
        serde_json::from_value(json!({
            "name": "join",
            "flow_nodes": [
                {"name": "a", "type": "automatic_task"},
                {"name": "b", "type": "automatic_task"},
                {"name": "c", "type": "automatic_task"},
                gateway,
                {"name": "end", "type": "end_event"}
            ],
            "transitions": [
                {"name": "ta", "source": "a", "target": "merge"},
                {"name": "tb", "source": "b", "target": "merge"},
                {"name": "tc", "source": "c", "target": "merge"},
                {"name": "out", "source": "merge", "target": "end"}
            ]
        }))
        .unwrap()
    }

    struct Fixture {
        store: InMemoryFlowNodeStore,
        definition: ProcessDefinition,
        factory: FlowNodeFactory,
        coordinator: GatewayCoordinator,
        source: FlowNodeInstance,
    }

    impl Fixture {
        fn new(gateway: Value) -> Self {
            let registry = Arc::new(StateRegistry::standard());
            let definition = definition(gateway);
            let process = Uuid::now_v7();
            let initial = registry.initial_state(FlowNodeKind::AutomaticTask.category()).unwrap();
            let source = FlowNodeInstance::new(
                definition.id,
                "a",
                process,
                process,
                FlowNodeKind::AutomaticTask,
                initial,
            );
            Self {
                store: InMemoryFlowNodeStore::new(),
                definition,
                factory: FlowNodeFactory::new(registry),
                coordinator: GatewayCoordinator::new(Arc::new(MinijinjaEvaluator::new())),
                source,
            }
        }

        async fn arrive(&self, transition: &str) -> (GatewayArrival, Vec<WorkDescriptor>) {
            let transition = self
                .definition
                .transitions
                .iter()
                .find(|t| t.name == transition)
                .unwrap();
            let gateway = self.definition.node("merge").unwrap();
            let mut followups = Vec::new();
            let mut tx = self.store.begin().await.unwrap();
            let arrival = self
                .coordinator
                .arrive(
                    tx.as_mut(),
                    &self.factory,
                    &self.definition,
                    &self.source,
                    gateway,
                    transition,
                    &mut followups,
                )
                .await
                .unwrap();
            tx.commit().await.unwrap();
            (arrival, followups)
        }
    }

    #[tokio::test]
    async fn test_parallel_fires_on_last_incoming() {
        let fixture = Fixture::new(json!({"name": "merge", "type": "gateway", "gateway_type": "parallel"}));

        let (first, followups) = fixture.arrive("ta").await;
        assert!(matches!(first, GatewayArrival::Waiting { .. }));
        assert_eq!(
            followups,
            vec![WorkDescriptor::advance(first.gateway_id(), state_ids::INITIALIZING)]
        );

        let (second, followups) = fixture.arrive("tb").await;
        assert_eq!(second, GatewayArrival::Waiting { gateway_id: first.gateway_id() });
        assert!(followups.is_empty());

        let (third, followups) = fixture.arrive("tc").await;
        assert_eq!(third, GatewayArrival::Fired { gateway_id: first.gateway_id() });
        assert_eq!(followups.len(), 1);

        let gateway = fixture.store.flow_node(first.gateway_id()).unwrap();
        let payload = gateway.gateway().unwrap();
        assert!(payload.is_finished());
        assert_eq!(payload.hit_bys, vec!["ta", "tb", "tc"]);
    }

    #[tokio::test]
    async fn test_repeated_transition_opens_new_activation() {
        let fixture = Fixture::new(json!({"name": "merge", "type": "gateway", "gateway_type": "parallel"}));
        let (first, _) = fixture.arrive("ta").await;
        let (again, _) = fixture.arrive("ta").await;
        assert_ne!(first.gateway_id(), again.gateway_id());
    }

    #[tokio::test]
    async fn test_exclusive_fires_every_token() {
        let fixture = Fixture::new(json!({"name": "merge", "type": "gateway", "gateway_type": "exclusive"}));
        let (first, _) = fixture.arrive("ta").await;
        let (second, _) = fixture.arrive("tb").await;
        assert!(matches!(first, GatewayArrival::Fired { .. }));
        assert!(matches!(second, GatewayArrival::Fired { .. }));
        assert_ne!(first.gateway_id(), second.gateway_id());
    }

    #[tokio::test]
    async fn test_complex_uses_activation_condition() {
        let fixture = Fixture::new(json!({
            "name": "merge",
            "type": "gateway",
            "gateway_type": "complex",
            "activation_condition": "hitCount >= 2 and incomingCount == 3"
        }));
        let (first, _) = fixture.arrive("tc").await;
        let (second, _) = fixture.arrive("ta").await;
        assert!(matches!(first, GatewayArrival::Waiting { .. }));
        assert!(matches!(second, GatewayArrival::Fired { .. }));
    }
}
