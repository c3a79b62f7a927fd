//! Flow node execution core
//!
//! [`ExecutionCore::advance`] moves one flow node one step along its state
//! chain inside the caller's transaction:
//!
//! 1. leave only when the current state allows it (gateway fired, children
//!    done, waiting event consumed)
//! 2. ask the [`TransitionResolver`] for the next state
//! 3. run the entry behaviour of that state (operations, event registration,
//!    child creation, interruption of children)
//! 4. on a terminal state, notify the parent activity or emit the outgoing
//!    transitions, then settle the process once nothing is left open
//!
//! Anything that must happen next is pushed as a [`WorkDescriptor`]; nothing
//! is executed inline past the current node.

use std::sync::Arc;

use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::dispatch::WorkDescriptor;
use super::factory::FlowNodeFactory;
use super::registry::DefinitionRegistry;
use super::scope::{self, node_scope};
use crate::coordination::{GatewayCoordinator, LoopCoordinator, MultiInstanceCoordinator};
use crate::error::{EngineError, ErrorContext};
use crate::events::EventCorrelationEngine;
use crate::expression::{ExpressionEvaluator, Scope};
use crate::model::{
    EventTrigger, FlowNodeDefinition, FlowNodeDefinitionKind, FlowNodeInstance, FlowNodeKind,
    GatewayType, ProcessDefinition, StateCategory, TransitionDefinition,
};
use crate::persistence::{FlowNodeQuery, StoreTransaction};
use crate::state::{state_ids, BreakpointService, StateId, StateRegistry, TransitionResolver};

/// What one advance did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Transitioned { from: StateId, to: StateId },
    /// The node cannot leave its state yet
    Blocked { state: StateId },
    /// Stale work: the node is gone, terminal, or already moved on
    Skipped,
}

pub struct ExecutionCore {
    definitions: Arc<DefinitionRegistry>,
    resolver: TransitionResolver,
    evaluator: Arc<dyn ExpressionEvaluator>,
    factory: FlowNodeFactory,
    gateways: GatewayCoordinator,
    multi_instances: MultiInstanceCoordinator,
    loops: LoopCoordinator,
    correlation: EventCorrelationEngine,
}

impl ExecutionCore {
    pub fn new(
        definitions: Arc<DefinitionRegistry>,
        registry: Arc<StateRegistry>,
        breakpoints: Arc<dyn BreakpointService>,
        evaluator: Arc<dyn ExpressionEvaluator>,
    ) -> Self {
        Self {
            definitions,
            resolver: TransitionResolver::new(Arc::clone(&registry), breakpoints),
            factory: FlowNodeFactory::new(registry),
            gateways: GatewayCoordinator::new(Arc::clone(&evaluator)),
            multi_instances: MultiInstanceCoordinator::new(Arc::clone(&evaluator)),
            loops: LoopCoordinator::new(Arc::clone(&evaluator)),
            correlation: EventCorrelationEngine::new(Arc::clone(&evaluator)),
            evaluator,
        }
    }

    pub fn definitions(&self) -> &DefinitionRegistry {
        &self.definitions
    }

    pub fn factory(&self) -> &FlowNodeFactory {
        &self.factory
    }

    pub fn correlation(&self) -> &EventCorrelationEngine {
        &self.correlation
    }

    /// Advance flow node `id` by one state. With `expected` set, work that
    /// no longer applies is skipped instead of failing.
    #[instrument(skip(self, tx, followups))]
    pub async fn advance(
        &self,
        tx: &mut dyn StoreTransaction,
        id: Uuid,
        expected: Option<StateId>,
        followups: &mut Vec<WorkDescriptor>,
    ) -> Result<Advance, EngineError> {
        let node = match tx.get_flow_node(id).await {
            Ok(node) => node,
            Err(e) if e.is_not_found() && expected.is_some() => {
                debug!("flow node is gone, skipping");
                return Ok(Advance::Skipped);
            }
            Err(e) => return Err(e.into()),
        };
        if node.terminal || expected.is_some_and(|state| state != node.state_id) {
            debug!(state = node.state_id, "flow node already moved on, skipping");
            return Ok(Advance::Skipped);
        }

        let context = ErrorContext::for_node(&node);
        self.advance_node(tx, node, followups)
            .await
            .map_err(|e| e.with_context(context))
    }

    async fn advance_node(
        &self,
        tx: &mut dyn StoreTransaction,
        mut node: FlowNodeInstance,
        followups: &mut Vec<WorkDescriptor>,
    ) -> Result<Advance, EngineError> {
        let definition = self.definitions.get(node.process_definition_id)?;
        let node_def = definition.require_node(&node.name)?;
        let current = node.state_id;

        if !self.can_leave(tx, &node, node_def).await? {
            debug!(flow_node = %node.name, state = current, "flow node blocked");
            return Ok(Advance::Blocked { state: current });
        }

        let next = self.resolver.next_state(&node, current).await?;
        node.set_state(&next);
        debug!(
            flow_node = %node.name,
            flow_node_id = %node.id,
            from = current,
            to = %next,
            category = %node.state_category,
            "flow node transitioned"
        );

        self.on_enter(tx, &definition, node_def, &mut node, followups).await?;
        tx.update_flow_node(&node).await?;

        if node.terminal {
            self.on_terminal(tx, &definition, node_def, &node, followups).await?;
        } else if !node.stable {
            followups.push(WorkDescriptor::advance(node.id, node.state_id));
        }

        Ok(Advance::Transitioned {
            from: current,
            to: node.state_id,
        })
    }

    async fn can_leave(
        &self,
        tx: &mut dyn StoreTransaction,
        node: &FlowNodeInstance,
        node_def: &FlowNodeDefinition,
    ) -> Result<bool, EngineError> {
        let normal = node.state_category == StateCategory::Normal;
        match node.state_id {
            state_ids::GATEWAY_WAITING => {
                Ok(!normal || node.gateway().is_some_and(|g| g.is_finished()))
            }
            state_ids::EXECUTING_CHILDREN if normal => match &node.kind {
                FlowNodeKind::MultiInstance(_) => {
                    self.multi_instances
                        .completion_policy_holds(tx, node_def, node)
                        .await
                }
                FlowNodeKind::Loop(_) => Ok(LoopCoordinator::completion_policy_holds(node)),
                _ => Ok(true),
            },
            state_ids::EXECUTING_CHILDREN => Ok(Self::active_children(node) == 0),
            state_ids::WAITING if normal => Ok(!self.correlation.is_waiting(tx, node).await?),
            _ => Ok(true),
        }
    }

    fn active_children(node: &FlowNodeInstance) -> u32 {
        match &node.kind {
            FlowNodeKind::MultiInstance(p) => p.number_of_active_instances,
            FlowNodeKind::Loop(p) => p.number_of_active_instances,
            _ => 0,
        }
    }

    async fn on_enter(
        &self,
        tx: &mut dyn StoreTransaction,
        definition: &ProcessDefinition,
        node_def: &FlowNodeDefinition,
        node: &mut FlowNodeInstance,
        followups: &mut Vec<WorkDescriptor>,
    ) -> Result<(), EngineError> {
        let has_children = matches!(node.kind, FlowNodeKind::MultiInstance(_) | FlowNodeKind::Loop(_));
        match node.state_id {
            state_ids::EXECUTING => self.execute(tx, node_def, node, followups).await,
            state_ids::WAITING => {
                if let FlowNodeDefinitionKind::IntermediateCatchEvent { trigger } = &node_def.kind {
                    let scope = node_scope(tx, node).await?;
                    let event = self
                        .correlation
                        .waiting_event_for(definition, node, trigger, &scope)?;
                    self.correlation.register(tx, event).await?;
                }
                Ok(())
            }
            state_ids::EXECUTING_CHILDREN => match node.kind {
                FlowNodeKind::MultiInstance(_) => {
                    self.multi_instances
                        .start(tx, &self.factory, node_def, node, followups)
                        .await
                }
                FlowNodeKind::Loop(_) => {
                    self.loops
                        .start(tx, &self.factory, node_def, node, followups)
                        .await
                }
                _ => Ok(()),
            },
            state_ids::COMPLETING if has_children => {
                // Children still running when the completion condition held
                self.interrupt_children(tx, node, StateCategory::Aborting, followups)
                    .await
            }
            state_ids::ABORTING | state_ids::CANCELLING => {
                self.interrupt_children(tx, node, node.state_category, followups)
                    .await?;
                self.correlation.unregister_for(tx, node.id).await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Run data operations, then throw the node's event if it has one
    async fn execute(
        &self,
        tx: &mut dyn StoreTransaction,
        node_def: &FlowNodeDefinition,
        node: &FlowNodeInstance,
        followups: &mut Vec<WorkDescriptor>,
    ) -> Result<(), EngineError> {
        if !node_def.operations.is_empty() {
            let mut scope = node_scope(tx, node).await?;
            for operation in &node_def.operations {
                let value = self.evaluator.evaluate(&operation.expression, &scope)?;
                scope::assign(tx, node, &operation.target, value.clone()).await?;
                scope.insert(operation.target.clone(), value);
            }
        }

        let FlowNodeDefinitionKind::IntermediateThrowEvent { trigger } = &node_def.kind else {
            return Ok(());
        };
        match trigger {
            EventTrigger::Signal { signal_name } => {
                let subscribers = self.correlation.subscribers(tx, signal_name).await?;
                debug!(signal = %signal_name, subscribers = subscribers.len(), "throwing signal");
                followups.extend(subscribers.into_iter().map(|event| {
                    WorkDescriptor::TriggerSignal {
                        waiting_event_id: event.id,
                        signal_name: signal_name.clone(),
                    }
                }));
            }
            EventTrigger::Message(_) => {
                let scope = node_scope(tx, node).await?;
                let key = self.correlation.message_key_for(trigger, &scope)?;
                debug!(key = %key, "throwing message");
                followups.push(WorkDescriptor::TriggerMessage { key });
            }
        }
        Ok(())
    }

    async fn interrupt_children(
        &self,
        tx: &mut dyn StoreTransaction,
        parent: &FlowNodeInstance,
        category: StateCategory,
        followups: &mut Vec<WorkDescriptor>,
    ) -> Result<(), EngineError> {
        let query = FlowNodeQuery::new(parent.parent_process_instance_id)
            .children_of(parent.id)
            .non_terminal();
        let children = tx.find_flow_nodes(&query).await?;
        self.interrupt_all(tx, children, category, followups).await?;
        Ok(())
    }

    /// Switch every open flow node of a process to `category`
    pub async fn interrupt_process_nodes(
        &self,
        tx: &mut dyn StoreTransaction,
        process_instance_id: Uuid,
        category: StateCategory,
        followups: &mut Vec<WorkDescriptor>,
    ) -> Result<usize, EngineError> {
        let open = tx
            .find_flow_nodes(&FlowNodeQuery::new(process_instance_id).non_terminal())
            .await?;
        self.interrupt_all(tx, open, category, followups).await
    }

    async fn interrupt_all(
        &self,
        tx: &mut dyn StoreTransaction,
        nodes: Vec<FlowNodeInstance>,
        category: StateCategory,
        followups: &mut Vec<WorkDescriptor>,
    ) -> Result<usize, EngineError> {
        let mut interrupted = 0;
        for mut node in nodes {
            if !node.interrupt(category) {
                continue;
            }
            tx.update_flow_node(&node).await?;
            if node.kind.must_execute_on_abort_or_cancel(node.stable) {
                followups.push(WorkDescriptor::advance(node.id, node.state_id));
            }
            interrupted += 1;
        }
        Ok(interrupted)
    }

    async fn on_terminal(
        &self,
        tx: &mut dyn StoreTransaction,
        definition: &ProcessDefinition,
        node_def: &FlowNodeDefinition,
        node: &FlowNodeInstance,
        followups: &mut Vec<WorkDescriptor>,
    ) -> Result<(), EngineError> {
        self.correlation.unregister_for(tx, node.id).await?;

        if let Some(parent_id) = node.parent_activity_instance_id {
            let mut parent = tx.get_flow_node(parent_id).await?;
            let is_multi = matches!(parent.kind, FlowNodeKind::MultiInstance(_));
            let is_loop = matches!(parent.kind, FlowNodeKind::Loop(_));
            if is_multi {
                self.multi_instances
                    .on_child_terminal(tx, &self.factory, definition, node_def, &mut parent, node, followups)
                    .await?;
            } else if is_loop {
                self.loops
                    .on_child_terminal(tx, &self.factory, node_def, &mut parent, node, followups)
                    .await?;
            } else {
                return Err(EngineError::Consistency(format!(
                    "parent {} of '{}' has no children",
                    parent_id, node.name
                )));
            }
            tx.update_flow_node(&parent).await?;
        } else if node.state_id == state_ids::COMPLETED {
            if matches!(node_def.kind, FlowNodeDefinitionKind::EndEvent { terminate: true }) {
                let aborted = self
                    .interrupt_process_nodes(
                        tx,
                        node.parent_process_instance_id,
                        StateCategory::Aborting,
                        followups,
                    )
                    .await?;
                info!(
                    process_instance_id = %node.parent_process_instance_id,
                    aborted,
                    "terminate end event reached"
                );
            } else {
                self.emit_outgoing(tx, definition, node, followups).await?;
            }
        }

        self.check_process_completion(tx, node.parent_process_instance_id)
            .await
    }

    async fn emit_outgoing(
        &self,
        tx: &mut dyn StoreTransaction,
        definition: &ProcessDefinition,
        node: &FlowNodeInstance,
        followups: &mut Vec<WorkDescriptor>,
    ) -> Result<(), EngineError> {
        for transition in self.select_transitions(tx, definition, node).await? {
            let target = definition.require_node(&transition.target)?;
            if target.kind.gateway_type().is_some() {
                self.gateways
                    .arrive(tx, &self.factory, definition, node, target, transition, followups)
                    .await?;
                continue;
            }
            let next = self.factory.create(
                definition,
                node.root_process_instance_id,
                node.parent_process_instance_id,
                target,
            )?;
            followups.push(WorkDescriptor::advance(next.id, state_ids::INITIALIZING));
            tx.insert_flow_node(next).await?;
        }
        Ok(())
    }

    /// Outgoing transitions taken when `node` completes.
    ///
    /// Parallel gateways take all of them, exclusive gateways the first whose
    /// condition holds, everything else each one whose condition holds. The
    /// default transition is taken only when nothing else is.
    async fn select_transitions<'a>(
        &self,
        tx: &mut dyn StoreTransaction,
        definition: &'a ProcessDefinition,
        node: &FlowNodeInstance,
    ) -> Result<Vec<&'a TransitionDefinition>, EngineError> {
        let outgoing: Vec<&'a TransitionDefinition> = definition
            .transitions
            .iter()
            .filter(|t| t.source == node.name)
            .collect();
        let gateway_type = node.gateway().map(|g| g.gateway_type);
        if outgoing.is_empty() || gateway_type == Some(GatewayType::Parallel) {
            return Ok(outgoing);
        }

        let scope = if outgoing.iter().any(|t| t.condition.is_some()) {
            node_scope(tx, node).await?
        } else {
            Scope::new()
        };

        let mut selected = Vec::new();
        for transition in outgoing.iter().copied().filter(|t| !t.default) {
            if self.condition_holds(transition, &scope)? {
                selected.push(transition);
                if gateway_type == Some(GatewayType::Exclusive) {
                    break;
                }
            }
        }

        if selected.is_empty() {
            let default = outgoing.iter().copied().find(|t| t.default).ok_or_else(|| {
                EngineError::Definition(format!(
                    "no outgoing transition of '{}' can be taken",
                    node.name
                ))
            })?;
            selected.push(default);
        }
        Ok(selected)
    }

    fn condition_holds(
        &self,
        transition: &TransitionDefinition,
        scope: &Scope,
    ) -> Result<bool, EngineError> {
        match &transition.condition {
            Some(condition) => Ok(self.evaluator.evaluate_condition(condition, scope)?),
            None => Ok(true),
        }
    }

    /// Settle the process once none of its flow nodes is open
    pub async fn check_process_completion(
        &self,
        tx: &mut dyn StoreTransaction,
        process_instance_id: Uuid,
    ) -> Result<(), EngineError> {
        let open = tx
            .find_flow_nodes(&FlowNodeQuery::new(process_instance_id).non_terminal())
            .await?;
        if !open.is_empty() {
            return Ok(());
        }

        let mut process = tx.get_process_instance(process_instance_id).await?;
        if process.state.is_terminal() {
            return Ok(());
        }
        process.settle();
        tx.update_process_instance(&process).await?;
        info!(
            process_instance_id = %process_instance_id,
            process = %process.name,
            state = %process.state,
            "process instance finished"
        );
        Ok(())
    }
}
