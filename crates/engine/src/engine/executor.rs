//! Process executor
//!
//! The `ProcessExecutor` is the entry point of the engine. It is responsible for:
//! - Deploying process definitions
//! - Starting process instances
//! - Advancing flow nodes, on request or from dispatched work
//! - Delivering signals and messages
//! - Aborting, cancelling and deleting process instances
//!
//! Every operation runs as a unit of work on the [`RetryingWorkExecutor`];
//! follow-up work is submitted to the [`WorkScheduler`] once it has committed.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::core::{Advance, ExecutionCore};
use super::dispatch::{WorkDescriptor, WorkScheduler};
use super::registry::DefinitionRegistry;
use super::work::{
    AdvanceFlowNodeWork, DeleteProcessWork, InterruptProcessWork, ProcessInputs,
    SignalSubscribersWork, StartProcessWork, TriggerMessageWork, TriggerSignalWork,
};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::CorrelationOutcome;
use crate::expression::{ExpressionEvaluator, MinijinjaEvaluator};
use crate::model::{MessageKey, ProcessDefinition, ProcessInstance, StateCategory};
use crate::persistence::FlowNodeStore;
use crate::reliability::{RetryingWorkExecutor, WorkContext, WorkItem};
use crate::state::{BreakpointService, NoBreakpoints, StateId, StateRegistry};

/// Process executor
///
/// # Example
///
/// ```ignore
/// use flownode_engine::prelude::*;
///
/// let (queue, receiver) = WorkQueue::new();
/// let store = Arc::new(InMemoryFlowNodeStore::new());
/// let executor = ProcessExecutor::new(store, Arc::new(queue.clone()), EngineConfig::from_env());
///
/// let definition_id = executor.deploy(definition)?;
/// let process_id = executor
///     .create_and_start_process_instance(definition_id, ProcessInputs::new())
///     .await?;
/// ```
pub struct ProcessExecutor {
    store: Arc<dyn FlowNodeStore>,
    scheduler: Arc<dyn WorkScheduler>,
    definitions: Arc<DefinitionRegistry>,
    registry: Arc<StateRegistry>,
    breakpoints: Arc<dyn BreakpointService>,
    evaluator: Arc<dyn ExpressionEvaluator>,
    core: Arc<ExecutionCore>,
    work: RetryingWorkExecutor,
    config: EngineConfig,
}

impl ProcessExecutor {
    /// Create an executor with the standard state registry, no breakpoints
    /// and the minijinja evaluator
    pub fn new(
        store: Arc<dyn FlowNodeStore>,
        scheduler: Arc<dyn WorkScheduler>,
        config: EngineConfig,
    ) -> Self {
        let definitions = Arc::new(DefinitionRegistry::new());
        let registry = Arc::new(StateRegistry::standard());
        let breakpoints: Arc<dyn BreakpointService> = Arc::new(NoBreakpoints);
        let evaluator: Arc<dyn ExpressionEvaluator> = Arc::new(MinijinjaEvaluator::new());
        let core = Arc::new(ExecutionCore::new(
            Arc::clone(&definitions),
            Arc::clone(&registry),
            Arc::clone(&breakpoints),
            Arc::clone(&evaluator),
        ));
        let work = RetryingWorkExecutor::new(
            Arc::clone(&store),
            config.retry.clone(),
            WorkContext::new(config.tenant.clone()),
        );

        Self {
            store,
            scheduler,
            definitions,
            registry,
            breakpoints,
            evaluator,
            core,
            work,
            config,
        }
    }

    /// Use `breakpoints` when resolving transitions
    pub fn with_breakpoints(mut self, breakpoints: Arc<dyn BreakpointService>) -> Self {
        self.breakpoints = breakpoints;
        self.rebuild_core();
        self
    }

    /// Evaluate definition expressions with `evaluator`
    pub fn with_evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self.rebuild_core();
        self
    }

    fn rebuild_core(&mut self) {
        self.core = Arc::new(ExecutionCore::new(
            Arc::clone(&self.definitions),
            Arc::clone(&self.registry),
            Arc::clone(&self.breakpoints),
            Arc::clone(&self.evaluator),
        ));
    }

    /// Get a reference to the store
    pub fn store(&self) -> &Arc<dyn FlowNodeStore> {
        &self.store
    }

    /// Deployed process definitions
    pub fn definitions(&self) -> &DefinitionRegistry {
        &self.definitions
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate and deploy a process definition
    pub fn deploy(&self, definition: ProcessDefinition) -> Result<Uuid, EngineError> {
        self.definitions.deploy(definition)
    }

    /// Create a process instance, initialise its data and schedule its start
    /// nodes
    #[instrument(skip(self, inputs))]
    pub async fn create_and_start_process_instance(
        &self,
        definition_id: Uuid,
        inputs: ProcessInputs,
    ) -> Result<Uuid, EngineError> {
        let definition = self.definitions.get(definition_id)?;
        let work = StartProcessWork {
            core: Arc::clone(&self.core),
            definition,
            inputs,
            process_instance_id: Uuid::now_v7(),
        };
        self.run(&work).await
    }

    /// Advance a flow node by one state, whatever state it is in
    pub async fn advance_flow_node(&self, flow_node_instance_id: Uuid) -> Result<Advance, EngineError> {
        self.run(&AdvanceFlowNodeWork {
            core: Arc::clone(&self.core),
            flow_node_instance_id,
            expected_state: None,
        })
        .await
    }

    /// Advance a flow node only if it is still in `expected_state`
    pub async fn advance_flow_node_from(
        &self,
        flow_node_instance_id: Uuid,
        expected_state: StateId,
    ) -> Result<Advance, EngineError> {
        self.run(&AdvanceFlowNodeWork {
            core: Arc::clone(&self.core),
            flow_node_instance_id,
            expected_state: Some(expected_state),
        })
        .await
    }

    /// Consume one signal waiting event and schedule its node.
    ///
    /// Fails with `TriggerTargetMissing` when the event is gone or already
    /// consumed; store failures surface unchanged.
    #[instrument(skip(self))]
    pub async fn trigger_signal(
        &self,
        waiting_event_id: Uuid,
        signal_name: &str,
    ) -> Result<Uuid, EngineError> {
        self.run(&TriggerSignalWork {
            core: Arc::clone(&self.core),
            waiting_event_id,
            signal_name: signal_name.to_string(),
        })
        .await
    }

    /// Broadcast a signal: one targeted trigger per active waiter. Returns
    /// the number of triggers scheduled.
    #[instrument(skip(self))]
    pub async fn throw_signal(&self, signal_name: &str) -> Result<usize, EngineError> {
        let subscribers = self
            .run(&SignalSubscribersWork {
                core: Arc::clone(&self.core),
                signal_name: signal_name.to_string(),
            })
            .await?;

        let count = subscribers.len();
        for event in subscribers {
            self.scheduler
                .submit(WorkDescriptor::TriggerSignal {
                    waiting_event_id: event.id,
                    signal_name: signal_name.to_string(),
                })
                .await?;
        }
        info!(signal = %signal_name, subscribers = count, "signal thrown");
        Ok(count)
    }

    /// Deliver a message to the single waiter it correlates with
    #[instrument(skip(self, key), fields(key = %key))]
    pub async fn send_message(&self, key: MessageKey) -> Result<CorrelationOutcome, EngineError> {
        self.run(&TriggerMessageWork {
            core: Arc::clone(&self.core),
            key,
        })
        .await
    }

    /// Abort a process instance; returns the number of nodes interrupted
    pub async fn abort_process_instance(&self, process_instance_id: Uuid) -> Result<usize, EngineError> {
        self.interrupt_process(process_instance_id, StateCategory::Aborting)
            .await
    }

    /// Cancel a process instance; returns the number of nodes interrupted
    pub async fn cancel_process_instance(&self, process_instance_id: Uuid) -> Result<usize, EngineError> {
        self.interrupt_process(process_instance_id, StateCategory::Cancelling)
            .await
    }

    #[instrument(skip(self))]
    async fn interrupt_process(
        &self,
        process_instance_id: Uuid,
        category: StateCategory,
    ) -> Result<usize, EngineError> {
        self.run(&InterruptProcessWork {
            core: Arc::clone(&self.core),
            process_instance_id,
            category,
        })
        .await
    }

    /// Delete a finished process instance with everything it owns
    pub async fn delete_process_instance(&self, process_instance_id: Uuid) -> Result<(), EngineError> {
        self.run(&DeleteProcessWork {
            process_instance_id,
        })
        .await
    }

    /// Read a process instance
    pub async fn process_instance(&self, process_instance_id: Uuid) -> Result<ProcessInstance, EngineError> {
        let mut tx = self.store.begin().await?;
        let process = tx.get_process_instance(process_instance_id).await;
        tx.rollback().await?;
        Ok(process?)
    }

    /// Run one dispatched unit of work.
    ///
    /// Stale triggers (message without waiter, consumed signal waiter) are
    /// normal outcomes of racing work and succeed.
    pub async fn dispatch(&self, descriptor: &WorkDescriptor) -> Result<(), EngineError> {
        match descriptor {
            WorkDescriptor::AdvanceFlowNode {
                flow_node_instance_id,
                expected_state,
            } => {
                let advance = self
                    .advance_flow_node_from(*flow_node_instance_id, *expected_state)
                    .await?;
                debug!(%flow_node_instance_id, ?advance, "dispatched advance");
                Ok(())
            }
            WorkDescriptor::TriggerSignal {
                waiting_event_id,
                signal_name,
            } => match self.trigger_signal(*waiting_event_id, signal_name).await {
                Ok(_) => Ok(()),
                Err(EngineError::TriggerTargetMissing { .. }) => {
                    debug!(%waiting_event_id, signal = %signal_name, "signal waiter already consumed");
                    Ok(())
                }
                Err(e) => Err(e),
            },
            WorkDescriptor::TriggerMessage { key } => {
                if self.send_message(key.clone()).await? == CorrelationOutcome::NotFound {
                    debug!(key = %key, "message has no waiter");
                }
                Ok(())
            }
        }
    }

    /// Cut short every retry backoff in progress
    pub fn interrupt_retries(&self) {
        self.work.interrupt();
    }

    /// Execute `work` and submit its follow-ups once committed
    async fn run<W>(&self, work: &W) -> Result<W::Output, EngineError>
    where
        W: WorkItem + ?Sized,
    {
        let completed = self.work.execute(work).await?;
        if completed.attempts > 1 {
            debug!(work = %work.description(), attempts = completed.attempts, "committed after retries");
        }
        for followup in completed.followups {
            if let Err(e) = self.scheduler.submit(followup.clone()).await {
                warn!(work = %followup, error = %e, "failed to submit follow-up work");
                return Err(e);
            }
        }
        Ok(completed.output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FlowNodeKind, ProcessState};
    use crate::persistence::InMemoryFlowNodeStore;
    use crate::reliability::RetryPolicy;
    use crate::state::state_ids;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    /// Collects submitted work so tests can drive it by hand
    #[derive(Default)]
    struct Recorder {
        submitted: Mutex<Vec<WorkDescriptor>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<WorkDescriptor> {
            std::mem::take(&mut *self.submitted.lock())
        }
    }

    #[async_trait]
    impl WorkScheduler for Recorder {
        async fn submit(&self, descriptor: WorkDescriptor) -> Result<(), EngineError> {
            self.submitted.lock().push(descriptor);
            Ok(())
        }
    }

    fn executor() -> (ProcessExecutor, Arc<Recorder>, InMemoryFlowNodeStore) {
        let store = InMemoryFlowNodeStore::new();
        let recorder = Arc::new(Recorder::default());
        let config = EngineConfig::default()
            .with_retry(RetryPolicy::new(5, Duration::from_millis(1), 2.0));
        let executor = ProcessExecutor::new(Arc::new(store.clone()), recorder.clone(), config);
        (executor, recorder, store)
    }

    /// Dispatch submitted work until nothing is left
    async fn drain(executor: &ProcessExecutor, recorder: &Recorder) {
        loop {
            let batch = recorder.take();
            if batch.is_empty() {
                return;
            }
            for descriptor in batch {
                executor.dispatch(&descriptor).await.unwrap();
            }
        }
    }

    fn approval() -> ProcessDefinition {
        serde_json::from_value(json!({
            "name": "approval",
            "flow_nodes": [
                {"name": "start", "type": "start_event"},
                {"name": "review", "type": "human_task",
                    "operations": [{"target": "reviewed", "expression": "amount * 2"}]},
                {"name": "end", "type": "end_event"}
            ],
            "transitions": [
                {"name": "t1", "source": "start", "target": "review"},
                {"name": "t2", "source": "review", "target": "end"}
            ],
            "data": [{"name": "amount", "default_value": 21}]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_human_task_waits_in_ready_until_advanced() {
        let (executor, recorder, store) = executor();
        let definition_id = executor.deploy(approval()).unwrap();
        let process_id = executor
            .create_and_start_process_instance(definition_id, ProcessInputs::new())
            .await
            .unwrap();
        drain(&executor, &recorder).await;

        let review = store
            .flow_nodes_of(process_id)
            .into_iter()
            .find(|n| n.name == "review")
            .unwrap();
        assert_eq!(review.state_id, state_ids::READY);
        assert_eq!(review.kind, FlowNodeKind::HumanTask);

        let advance = executor.advance_flow_node(review.id).await.unwrap();
        assert_eq!(
            advance,
            Advance::Transitioned {
                from: state_ids::READY,
                to: state_ids::EXECUTING
            }
        );
        drain(&executor, &recorder).await;

        let process = executor.process_instance(process_id).await.unwrap();
        assert_eq!(process.state, ProcessState::Completed);
        assert_eq!(
            store.data(crate::model::DataContainer::Process(process_id), "reviewed"),
            Some(json!(42))
        );
    }

    #[tokio::test]
    async fn test_stale_advance_is_skipped() {
        let (executor, recorder, store) = executor();
        let definition_id = executor.deploy(approval()).unwrap();
        let process_id = executor
            .create_and_start_process_instance(definition_id, ProcessInputs::new())
            .await
            .unwrap();
        drain(&executor, &recorder).await;

        let start = store
            .flow_nodes_of(process_id)
            .into_iter()
            .find(|n| n.name == "start")
            .unwrap();
        assert!(start.terminal);
        let advance = executor
            .advance_flow_node_from(start.id, state_ids::INITIALIZING)
            .await
            .unwrap();
        assert_eq!(advance, Advance::Skipped);
        assert_eq!(
            executor
                .advance_flow_node_from(Uuid::now_v7(), state_ids::INITIALIZING)
                .await
                .unwrap(),
            Advance::Skipped
        );
    }

    #[tokio::test]
    async fn test_delete_requires_finished_process() {
        let (executor, recorder, store) = executor();
        let definition_id = executor.deploy(approval()).unwrap();
        let process_id = executor
            .create_and_start_process_instance(definition_id, ProcessInputs::new())
            .await
            .unwrap();
        drain(&executor, &recorder).await;

        let err = executor.delete_process_instance(process_id).await.unwrap_err();
        assert!(matches!(err.root_cause(), EngineError::Consistency(_)));

        executor.cancel_process_instance(process_id).await.unwrap();
        drain(&executor, &recorder).await;
        assert_eq!(
            executor.process_instance(process_id).await.unwrap().state,
            ProcessState::Cancelled
        );

        executor.delete_process_instance(process_id).await.unwrap();
        assert_eq!(store.process_instance_count(), 0);
        assert!(store.flow_nodes_of(process_id).is_empty());
    }

    #[tokio::test]
    async fn test_unknown_definition() {
        let (executor, _recorder, _store) = executor();
        let err = executor
            .create_and_start_process_instance(Uuid::now_v7(), ProcessInputs::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Definition(_)));
    }
}
