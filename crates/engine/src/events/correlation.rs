//! Event correlation
//!
//! Catch events register a [`WaitingEvent`]; triggers look them up and
//! consume them. Consuming means flipping `active` inside the trigger's
//! transaction, so two triggers racing for the same waiter conflict at commit
//! and the loser retries against a waiter that is no longer active. A waiter
//! is therefore consumed at most once.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, instrument};
use uuid::Uuid;

use crate::error::EngineError;
use crate::expression::{ExpressionEvaluator, Scope};
use crate::model::{
    CorrelationDefinition, EventTrigger, FlowNodeInstance, MessageKey, ProcessDefinition,
    WaitingEvent, WaitingEventKind,
};
use crate::persistence::{StoreTransaction, WaitingEventQuery};

/// Result of delivering a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationOutcome {
    Delivered {
        waiting_event_id: Uuid,
        flow_node_instance_id: Uuid,
    },
    /// No active waiter matched
    NotFound,
}

#[derive(Clone)]
pub struct EventCorrelationEngine {
    evaluator: Arc<dyn ExpressionEvaluator>,
}

impl EventCorrelationEngine {
    pub fn new(evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        Self { evaluator }
    }

    /// Waiting event for a catch node, correlation values evaluated in `scope`
    pub fn waiting_event_for(
        &self,
        definition: &ProcessDefinition,
        node: &FlowNodeInstance,
        trigger: &EventTrigger,
        scope: &Scope,
    ) -> Result<WaitingEvent, EngineError> {
        let kind = match trigger {
            EventTrigger::Signal { signal_name } => WaitingEventKind::Signal {
                signal_name: signal_name.clone(),
            },
            EventTrigger::Message(message) => WaitingEventKind::Message {
                message_name: message.message_name.clone(),
                process_name: definition.name.clone(),
                flow_node_name: node.name.clone(),
                correlations: self.correlations(&message.correlations, scope)?,
            },
        };
        Ok(WaitingEvent {
            id: Uuid::now_v7(),
            kind,
            process_definition_id: node.process_definition_id,
            flow_node_name: node.name.clone(),
            root_process_instance_id: node.root_process_instance_id,
            parent_process_instance_id: node.parent_process_instance_id,
            flow_node_instance_id: node.id,
            active: true,
        })
    }

    /// Address of a message thrown with `trigger`
    pub fn message_key_for(
        &self,
        trigger: &EventTrigger,
        scope: &Scope,
    ) -> Result<MessageKey, EngineError> {
        let EventTrigger::Message(message) = trigger else {
            return Err(EngineError::Definition(
                "a signal trigger has no message key".into(),
            ));
        };
        let target_process = message.target_process.clone().ok_or_else(|| {
            EngineError::Definition(format!(
                "message '{}' is thrown without a target process",
                message.message_name
            ))
        })?;
        Ok(MessageKey {
            message_name: message.message_name.clone(),
            target_process,
            target_flow_node: message.target_flow_node.clone(),
            correlations: self.correlations(&message.correlations, scope)?,
        })
    }

    fn correlations(
        &self,
        definitions: &[CorrelationDefinition],
        scope: &Scope,
    ) -> Result<BTreeMap<String, serde_json::Value>, EngineError> {
        definitions
            .iter()
            .map(|c| -> Result<_, EngineError> {
                Ok((c.key.clone(), self.evaluator.evaluate(&c.expression, scope)?))
            })
            .collect()
    }

    pub async fn register(
        &self,
        tx: &mut dyn StoreTransaction,
        event: WaitingEvent,
    ) -> Result<(), EngineError> {
        debug!(
            waiting_event_id = %event.id,
            flow_node_id = %event.flow_node_instance_id,
            "registered waiting event"
        );
        tx.insert_waiting_event(event).await?;
        Ok(())
    }

    /// Consume the single active waiter matching `key`
    #[instrument(skip(self, tx), fields(message = %key.message_name))]
    pub async fn trigger(
        &self,
        tx: &mut dyn StoreTransaction,
        key: &MessageKey,
    ) -> Result<WaitingEvent, EngineError> {
        let mut candidates: Vec<_> = tx
            .find_waiting_events(&WaitingEventQuery::message(&key.message_name))
            .await?
            .into_iter()
            .filter(|event| key.matches(event))
            .collect();

        match candidates.len() {
            0 => Err(EngineError::CorrelationNotFound(key.to_string())),
            1 => {
                let mut event = candidates.remove(0);
                event.active = false;
                tx.update_waiting_event(&event).await?;
                debug!(waiting_event_id = %event.id, "message correlated");
                Ok(event)
            }
            count => Err(EngineError::AmbiguousCorrelation {
                key: key.to_string(),
                count,
            }),
        }
    }

    /// Consume the signal waiter `waiting_event_id`
    pub async fn trigger_signal(
        &self,
        tx: &mut dyn StoreTransaction,
        waiting_event_id: Uuid,
        signal_name: &str,
    ) -> Result<WaitingEvent, EngineError> {
        let missing = || EngineError::TriggerTargetMissing {
            waiting_event_id,
            signal_name: signal_name.to_string(),
        };
        let mut event = match tx.get_waiting_event(waiting_event_id).await {
            Ok(event) => event,
            Err(e) if e.is_not_found() => return Err(missing()),
            Err(e) => return Err(e.into()),
        };
        if !event.active || event.signal_name() != Some(signal_name) {
            return Err(missing());
        }
        event.active = false;
        tx.update_waiting_event(&event).await?;
        Ok(event)
    }

    /// Active waiters of a signal
    pub async fn subscribers(
        &self,
        tx: &mut dyn StoreTransaction,
        signal_name: &str,
    ) -> Result<Vec<WaitingEvent>, EngineError> {
        Ok(tx
            .find_waiting_events(&WaitingEventQuery::signal(signal_name))
            .await?)
    }

    /// Whether `node` still waits on an unconsumed event
    pub async fn is_waiting(
        &self,
        tx: &mut dyn StoreTransaction,
        node: &FlowNodeInstance,
    ) -> Result<bool, EngineError> {
        let active = tx
            .find_waiting_events(&WaitingEventQuery::for_flow_node(node.id).active())
            .await?;
        Ok(!active.is_empty())
    }

    /// Drop every waiting event of a node
    pub async fn unregister_for(
        &self,
        tx: &mut dyn StoreTransaction,
        flow_node_instance_id: Uuid,
    ) -> Result<usize, EngineError> {
        Ok(tx.delete_waiting_events_of(flow_node_instance_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::MinijinjaEvaluator;
    use crate::model::{EventType, FlowNodeKind, MessageTrigger};
    use crate::persistence::{FlowNodeStore, InMemoryFlowNodeStore};
    use crate::state::StateRegistry;
    use serde_json::json;

    fn engine() -> EventCorrelationEngine {
        EventCorrelationEngine::new(Arc::new(MinijinjaEvaluator::new()))
    }

    fn definition() -> ProcessDefinition {
        serde_json::from_value(json!({
            "name": "orders",
            "flow_nodes": [{"name": "await payment", "type": "intermediate_catch_event",
                "trigger": {"kind": "signal", "signal_name": "go"}}]
        }))
        .unwrap()
    }

    fn catch_node(definition: &ProcessDefinition) -> FlowNodeInstance {
        let registry = StateRegistry::standard();
        let kind = FlowNodeKind::Event {
            event_type: EventType::IntermediateCatch,
        };
        let initial = registry.initial_state(kind.category()).unwrap();
        let process = Uuid::now_v7();
        FlowNodeInstance::new(definition.id, "await payment", process, process, kind, initial)
    }

    fn paid(correlation: &str) -> EventTrigger {
        EventTrigger::Message(MessageTrigger {
            message_name: "paid".into(),
            target_process: Some("orders".into()),
            target_flow_node: None,
            correlations: vec![CorrelationDefinition {
                key: "order".into(),
                expression: correlation.into(),
            }],
        })
    }

    #[tokio::test]
    async fn test_message_is_consumed_once() {
        let store = InMemoryFlowNodeStore::new();
        let engine = engine();
        let definition = definition();
        let node = catch_node(&definition);
        let mut scope = Scope::new();
        scope.insert("order_id".into(), json!(42));

        let mut tx = store.begin().await.unwrap();
        let event = engine
            .waiting_event_for(&definition, &node, &paid("order_id"), &scope)
            .unwrap();
        engine.register(tx.as_mut(), event.clone()).await.unwrap();
        tx.commit().await.unwrap();

        let key = engine.message_key_for(&paid("order_id"), &scope).unwrap();
        let mut tx = store.begin().await.unwrap();
        assert!(engine.is_waiting(tx.as_mut(), &node).await.unwrap());
        let consumed = engine.trigger(tx.as_mut(), &key).await.unwrap();
        assert_eq!(consumed.id, event.id);
        assert!(!consumed.active);
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(matches!(
            engine.trigger(tx.as_mut(), &key).await,
            Err(EngineError::CorrelationNotFound(_))
        ));
        assert!(!engine.is_waiting(tx.as_mut(), &node).await.unwrap());
    }

    #[tokio::test]
    async fn test_ambiguous_correlation() {
        let store = InMemoryFlowNodeStore::new();
        let engine = engine();
        let definition = definition();
        let scope = Scope::new();

        let mut tx = store.begin().await.unwrap();
        for _ in 0..2 {
            let node = catch_node(&definition);
            let event = engine
                .waiting_event_for(&definition, &node, &paid("1"), &scope)
                .unwrap();
            engine.register(tx.as_mut(), event).await.unwrap();
        }
        let key = engine.message_key_for(&paid("1"), &scope).unwrap();
        assert!(matches!(
            engine.trigger(tx.as_mut(), &key).await,
            Err(EngineError::AmbiguousCorrelation { count: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_signal_trigger_checks_target() {
        let store = InMemoryFlowNodeStore::new();
        let engine = engine();
        let definition = definition();
        let node = catch_node(&definition);
        let trigger = EventTrigger::Signal {
            signal_name: "go".into(),
        };

        let mut tx = store.begin().await.unwrap();
        let event = engine
            .waiting_event_for(&definition, &node, &trigger, &Scope::new())
            .unwrap();
        engine.register(tx.as_mut(), event.clone()).await.unwrap();
        assert_eq!(engine.subscribers(tx.as_mut(), "go").await.unwrap().len(), 1);

        assert!(matches!(
            engine.trigger_signal(tx.as_mut(), event.id, "stop").await,
            Err(EngineError::TriggerTargetMissing { .. })
        ));
        engine.trigger_signal(tx.as_mut(), event.id, "go").await.unwrap();
        assert!(matches!(
            engine.trigger_signal(tx.as_mut(), event.id, "go").await,
            Err(EngineError::TriggerTargetMissing { .. })
        ));
        assert!(matches!(
            engine.trigger_signal(tx.as_mut(), Uuid::now_v7(), "go").await,
            Err(EngineError::TriggerTargetMissing { .. })
        ));
        assert_eq!(engine.unregister_for(tx.as_mut(), node.id).await.unwrap(), 1);
    }

    #[test]
    fn test_thrown_message_needs_target() {
        let trigger = EventTrigger::Message(MessageTrigger {
            message_name: "paid".into(),
            target_process: None,
            target_flow_node: None,
            correlations: Vec::new(),
        });
        assert!(matches!(
            engine().message_key_for(&trigger, &Scope::new()),
            Err(EngineError::Definition(_))
        ));
    }
}
