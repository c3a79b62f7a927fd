//! Shared harness for engine integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use flownode_engine::model::{FlowNodeInstance, ProcessDefinition};
use flownode_engine::{
    EngineConfig, InMemoryFlowNodeStore, ProcessExecutor, RetryPolicy, WorkQueue, WorkerPool,
    WorkerPoolConfig,
};
use uuid::Uuid;

pub struct Harness {
    pub store: InMemoryFlowNodeStore,
    pub executor: Arc<ProcessExecutor>,
    pub pool: WorkerPool,
}

impl Harness {
    /// Executor over a fresh store, pool not started
    pub fn new(workers: usize) -> Self {
        Self::with(workers, |executor| executor)
    }

    pub fn with(workers: usize, customize: impl FnOnce(ProcessExecutor) -> ProcessExecutor) -> Self {
        let store = InMemoryFlowNodeStore::new();
        let (queue, receiver) = WorkQueue::new();
        let config = EngineConfig::default()
            .with_tenant("integration")
            .with_retry(RetryPolicy::new(20, Duration::from_millis(1), 1.5));
        let executor = Arc::new(customize(ProcessExecutor::new(
            Arc::new(store.clone()),
            Arc::new(queue.clone()),
            config,
        )));
        let pool = WorkerPool::new(
            Arc::clone(&executor),
            queue,
            receiver,
            WorkerPoolConfig::default()
                .with_worker_id("integration-worker")
                .with_workers(workers),
        );
        Self {
            store,
            executor,
            pool,
        }
    }

    /// Started harness
    pub fn running(workers: usize) -> Self {
        let harness = Self::new(workers);
        harness.pool.start().unwrap();
        harness
    }

    pub async fn idle(&self) {
        tokio::time::timeout(Duration::from_secs(10), self.pool.wait_idle())
            .await
            .expect("engine did not go idle");
    }

    pub fn nodes_named(&self, process_id: Uuid, name: &str) -> Vec<FlowNodeInstance> {
        self.store
            .flow_nodes_of(process_id)
            .into_iter()
            .filter(|n| n.name == name)
            .collect()
    }

    pub fn node(&self, process_id: Uuid, name: &str) -> FlowNodeInstance {
        let mut nodes = self.nodes_named(process_id, name);
        assert_eq!(nodes.len(), 1, "expected exactly one '{name}' instance");
        nodes.remove(0)
    }
}

pub fn definition(value: serde_json::Value) -> ProcessDefinition {
    serde_json::from_value(value).unwrap()
}
