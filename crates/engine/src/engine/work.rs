//! Units of work run by the process executor
//!
//! Each unit is re-run from scratch on an optimistic conflict, so units carry
//! every identifier they create (e.g. the new process instance id) instead of
//! generating it inside `run`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use super::core::{Advance, ExecutionCore};
use super::dispatch::WorkDescriptor;
use crate::error::{EngineError, ErrorContext};
use crate::events::CorrelationOutcome;
use crate::model::{
    BusinessDataRef, DataContainer, MessageKey, ProcessDefinition, ProcessInstance, ProcessState,
    StateCategory, WaitingEvent,
};
use crate::persistence::StoreTransaction;
use crate::reliability::WorkItem;
use crate::state::{state_ids, StateId};

/// Initial variables of a new process instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessInputs {
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
    #[serde(default)]
    pub business_data: BTreeMap<String, BusinessDataRef>,
}

impl ProcessInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(mut self, name: impl Into<String>, value: Value) -> Self {
        self.data.insert(name.into(), value);
        self
    }

    pub fn with_business_data(mut self, name: impl Into<String>, reference: BusinessDataRef) -> Self {
        self.business_data.insert(name.into(), reference);
        self
    }
}

pub(crate) struct StartProcessWork {
    pub core: Arc<ExecutionCore>,
    pub definition: Arc<ProcessDefinition>,
    pub inputs: ProcessInputs,
    pub process_instance_id: Uuid,
}

#[async_trait]
impl WorkItem for StartProcessWork {
    type Output = Uuid;

    fn description(&self) -> String {
        format!(
            "start process instance {} of '{}' {}",
            self.process_instance_id, self.definition.name, self.definition.version
        )
    }

    fn recovery_procedure(&self) -> String {
        "check the process inputs and start a new instance".to_string()
    }

    async fn run(
        &self,
        tx: &mut dyn StoreTransaction,
        followups: &mut Vec<WorkDescriptor>,
    ) -> Result<Uuid, EngineError> {
        let definition = &self.definition;
        let id = self.process_instance_id;
        let starts = definition.start_nodes();
        if starts.is_empty() {
            return Err(EngineError::Definition(format!(
                "process '{}' has no start node",
                definition.name
            )));
        }

        let mut process = ProcessInstance::new(definition.id, &definition.name);
        process.id = id;
        tx.insert_process_instance(process).await?;

        let container = DataContainer::Process(id);
        for data in &definition.data {
            if data.business {
                let reference = match (self.inputs.business_data.get(&data.name), &data.default_value) {
                    (Some(reference), _) => reference.clone(),
                    (None, Some(default)) => BusinessDataRef::from_value(&data.name, default)?,
                    (None, None) if data.multiple => BusinessDataRef::Multiple(Vec::new()),
                    (None, None) => BusinessDataRef::Single(None),
                };
                tx.set_business_data(container, &data.name, reference).await?;
            } else {
                let value = self
                    .inputs
                    .data
                    .get(&data.name)
                    .or(data.default_value.as_ref())
                    .cloned()
                    .unwrap_or(Value::Null);
                tx.set_data(container, &data.name, value).await?;
            }
        }
        for (name, value) in &self.inputs.data {
            if definition.data_definition(name).is_none() {
                tx.set_data(container, name, value.clone()).await?;
            }
        }
        for (name, reference) in &self.inputs.business_data {
            if definition.data_definition(name).is_none() {
                tx.set_business_data(container, name, reference.clone()).await?;
            }
        }

        for start in starts {
            let node = self.core.factory().create(definition, id, id, start)?;
            followups.push(WorkDescriptor::advance(node.id, state_ids::INITIALIZING));
            tx.insert_flow_node(node).await?;
        }

        info!(
            process_instance_id = %id,
            process = %definition.name,
            version = %definition.version,
            "started process instance"
        );
        Ok(id)
    }
}

pub(crate) struct AdvanceFlowNodeWork {
    pub core: Arc<ExecutionCore>,
    pub flow_node_instance_id: Uuid,
    pub expected_state: Option<StateId>,
}

#[async_trait]
impl WorkItem for AdvanceFlowNodeWork {
    type Output = Advance;

    fn description(&self) -> String {
        match self.expected_state {
            Some(state) => format!(
                "advance flow node {} from state {}",
                self.flow_node_instance_id, state
            ),
            None => format!("advance flow node {}", self.flow_node_instance_id),
        }
    }

    fn recovery_procedure(&self) -> String {
        format!("re-run: advance flow node {}", self.flow_node_instance_id)
    }

    async fn run(
        &self,
        tx: &mut dyn StoreTransaction,
        followups: &mut Vec<WorkDescriptor>,
    ) -> Result<Advance, EngineError> {
        self.core
            .advance(tx, self.flow_node_instance_id, self.expected_state, followups)
            .await
    }
}

/// Consumes one signal waiter and schedules its node
pub(crate) struct TriggerSignalWork {
    pub core: Arc<ExecutionCore>,
    pub waiting_event_id: Uuid,
    pub signal_name: String,
}

#[async_trait]
impl WorkItem for TriggerSignalWork {
    type Output = Uuid;

    fn description(&self) -> String {
        format!(
            "trigger signal '{}' on waiting event {}",
            self.signal_name, self.waiting_event_id
        )
    }

    fn describe_failure(&self, _context: &mut ErrorContext) -> Result<(), EngineError> {
        Err(EngineError::UnsupportedOperation(
            "trigger failures are surfaced unchanged".into(),
        ))
    }

    async fn run(
        &self,
        tx: &mut dyn StoreTransaction,
        followups: &mut Vec<WorkDescriptor>,
    ) -> Result<Uuid, EngineError> {
        let event = self
            .core
            .correlation()
            .trigger_signal(tx, self.waiting_event_id, &self.signal_name)
            .await?;
        followups.push(WorkDescriptor::advance(
            event.flow_node_instance_id,
            state_ids::WAITING,
        ));
        Ok(event.flow_node_instance_id)
    }
}

/// Delivers a message to the single waiter it correlates with
pub(crate) struct TriggerMessageWork {
    pub core: Arc<ExecutionCore>,
    pub key: MessageKey,
}

#[async_trait]
impl WorkItem for TriggerMessageWork {
    type Output = CorrelationOutcome;

    fn description(&self) -> String {
        format!("deliver {}", self.key)
    }

    fn describe_failure(&self, _context: &mut ErrorContext) -> Result<(), EngineError> {
        Err(EngineError::UnsupportedOperation(
            "trigger failures are surfaced unchanged".into(),
        ))
    }

    async fn run(
        &self,
        tx: &mut dyn StoreTransaction,
        followups: &mut Vec<WorkDescriptor>,
    ) -> Result<CorrelationOutcome, EngineError> {
        match self.core.correlation().trigger(tx, &self.key).await {
            Ok(event) => {
                followups.push(WorkDescriptor::advance(
                    event.flow_node_instance_id,
                    state_ids::WAITING,
                ));
                Ok(CorrelationOutcome::Delivered {
                    waiting_event_id: event.id,
                    flow_node_instance_id: event.flow_node_instance_id,
                })
            }
            Err(EngineError::CorrelationNotFound(_)) => Ok(CorrelationOutcome::NotFound),
            Err(e) => Err(e),
        }
    }
}

/// Active waiters of a signal
pub(crate) struct SignalSubscribersWork {
    pub core: Arc<ExecutionCore>,
    pub signal_name: String,
}

#[async_trait]
impl WorkItem for SignalSubscribersWork {
    type Output = Vec<WaitingEvent>;

    fn description(&self) -> String {
        format!("find subscribers of signal '{}'", self.signal_name)
    }

    async fn run(
        &self,
        tx: &mut dyn StoreTransaction,
        _followups: &mut Vec<WorkDescriptor>,
    ) -> Result<Vec<WaitingEvent>, EngineError> {
        self.core.correlation().subscribers(tx, &self.signal_name).await
    }
}

/// Moves a process into aborting or cancelling and interrupts its open nodes
pub(crate) struct InterruptProcessWork {
    pub core: Arc<ExecutionCore>,
    pub process_instance_id: Uuid,
    pub category: StateCategory,
}

#[async_trait]
impl WorkItem for InterruptProcessWork {
    type Output = usize;

    fn description(&self) -> String {
        format!(
            "{} process instance {}",
            self.category, self.process_instance_id
        )
    }

    async fn run(
        &self,
        tx: &mut dyn StoreTransaction,
        followups: &mut Vec<WorkDescriptor>,
    ) -> Result<usize, EngineError> {
        let target = match self.category {
            StateCategory::Aborting => ProcessState::Aborting,
            StateCategory::Cancelling => ProcessState::Cancelling,
            StateCategory::Normal => {
                return Err(EngineError::UnsupportedOperation(
                    "a process cannot be interrupted into the normal category".into(),
                ))
            }
        };

        let mut process = tx.get_process_instance(self.process_instance_id).await?;
        if process.state.node_category() == self.category {
            debug!(state = %process.state, "process instance already interrupted");
            return Ok(0);
        }
        if process.state != ProcessState::Started {
            return Err(EngineError::Consistency(format!(
                "process instance {} is already {}",
                process.id, process.state
            )));
        }
        process.state = target;
        tx.update_process_instance(&process).await?;

        let interrupted = self
            .core
            .interrupt_process_nodes(tx, process.id, self.category, followups)
            .await?;
        self.core.check_process_completion(tx, process.id).await?;

        info!(
            process_instance_id = %process.id,
            state = %target,
            interrupted,
            "process instance interrupted"
        );
        Ok(interrupted)
    }
}

pub(crate) struct DeleteProcessWork {
    pub process_instance_id: Uuid,
}

#[async_trait]
impl WorkItem for DeleteProcessWork {
    type Output = ();

    fn description(&self) -> String {
        format!("delete process instance {}", self.process_instance_id)
    }

    async fn run(
        &self,
        tx: &mut dyn StoreTransaction,
        _followups: &mut Vec<WorkDescriptor>,
    ) -> Result<(), EngineError> {
        let process = tx.get_process_instance(self.process_instance_id).await?;
        if !process.state.is_terminal() {
            return Err(EngineError::Consistency(format!(
                "process instance {} is {} and cannot be deleted",
                process.id, process.state
            )));
        }
        tx.delete_process_instance(process.id).await?;
        info!(process_instance_id = %process.id, "deleted process instance");
        Ok(())
    }
}
