// Runs process instances of one definition to quiescence

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use flownode_engine::prelude::*;
use flownode_engine::worker::WorkerPoolStatus;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::Cli;

pub struct Runner {
    executor: Arc<ProcessExecutor>,
    pool: WorkerPool,
    definition_id: Uuid,
}

impl Runner {
    /// Load and deploy the definition, then build the pool
    pub fn new(cli: &Cli) -> Result<Self> {
        let source = std::fs::read_to_string(&cli.definition)
            .with_context(|| format!("Failed to read {}", cli.definition.display()))?;
        let definition: ProcessDefinition =
            serde_json::from_str(&source).context("Invalid process definition")?;

        let (queue, receiver) = WorkQueue::new();
        let store = Arc::new(InMemoryFlowNodeStore::new());
        let executor = Arc::new(ProcessExecutor::new(
            store,
            Arc::new(queue.clone()),
            EngineConfig::from_env(),
        ));
        let definition_id = executor
            .deploy(definition)
            .context("Failed to deploy process definition")?;

        let config = WorkerPoolConfig::from_env().with_workers(cli.workers);
        let pool = WorkerPool::new(Arc::clone(&executor), queue, receiver, config);

        Ok(Self {
            executor,
            pool,
            definition_id,
        })
    }

    pub async fn run(&self, cli: &Cli) -> Result<()> {
        let inputs = parse_inputs(cli.data.as_deref())?;
        self.pool.start()?;

        let mut instances = Vec::with_capacity(cli.instances);
        for _ in 0..cli.instances {
            let id = self
                .executor
                .create_and_start_process_instance(self.definition_id, inputs.clone())
                .await
                .context("Failed to start process instance")?;
            instances.push(id);
        }
        self.pool.wait_idle().await;

        for signal in &cli.signal {
            let scheduled = self.executor.throw_signal(signal).await?;
            info!(signal = %signal, scheduled, "Signal thrown");
            self.pool.wait_idle().await;
        }

        let mut by_state: BTreeMap<String, usize> = BTreeMap::new();
        for id in &instances {
            let process = self.executor.process_instance(*id).await?;
            *by_state.entry(process.state.to_string()).or_default() += 1;
        }
        let stats = self.pool.stats();
        info!(
            instances = instances.len(),
            states = ?by_state,
            processed = stats.processed,
            failed = stats.failed,
            requeued = stats.requeued,
            "Run finished"
        );
        if stats.failed > 0 {
            warn!(failed = stats.failed, "Some work units failed");
        }
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        if self.pool.status() == WorkerPoolStatus::Running {
            self.pool.shutdown().await?;
        }
        Ok(())
    }
}

fn parse_inputs(data: Option<&str>) -> Result<ProcessInputs> {
    let Some(data) = data else {
        return Ok(ProcessInputs::new());
    };
    let Value::Object(map) = serde_json::from_str(data).context("Invalid --data JSON")? else {
        bail!("--data must be a JSON object");
    };
    Ok(map
        .into_iter()
        .fold(ProcessInputs::new(), |inputs, (name, value)| {
            inputs.with_data(name, value)
        }))
}
