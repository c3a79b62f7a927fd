//! Worker pool for dispatched work
//!
//! Runs queued descriptors concurrently on tokio tasks with requeue on
//! transient store failures and graceful shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::queue::{QueuedWork, WorkQueue, WorkReceiver};
use crate::config::duration_millis;
use crate::engine::ProcessExecutor;
use crate::error::EngineError;

/// Environment variable for the number of workers
pub const WORKERS_ENV: &str = "FLOWNODE_WORKERS";
/// Environment variable for the worker id
pub const WORKER_ID_ENV: &str = "FLOWNODE_WORKER_ID";
/// Environment variable for the dispatch attempt limit
pub const MAX_DISPATCH_ATTEMPTS_ENV: &str = "FLOWNODE_MAX_DISPATCH_ATTEMPTS";

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Number of concurrent workers
    pub workers: usize,

    /// Dispatches of one descriptor before a transient failure is final
    pub max_dispatch_attempts: u32,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            workers: 4,
            max_dispatch_attempts: 3,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    /// Read `FLOWNODE_WORKERS`, `FLOWNODE_WORKER_ID` and
    /// `FLOWNODE_MAX_DISPATCH_ATTEMPTS`, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_id: std::env::var(WORKER_ID_ENV)
                .ok()
                .filter(|id| !id.is_empty())
                .unwrap_or(defaults.worker_id),
            workers: std::env::var(WORKERS_ENV)
                .ok()
                .and_then(|v| v.parse().ok())
                .map(|n: usize| n.max(1))
                .unwrap_or(defaults.workers),
            max_dispatch_attempts: std::env::var(MAX_DISPATCH_ATTEMPTS_ENV)
                .ok()
                .and_then(|v| v.parse().ok())
                .map(|n: u32| n.max(1))
                .unwrap_or(defaults.max_dispatch_attempts),
            shutdown_timeout: defaults.shutdown_timeout,
        }
    }

    /// Set the worker ID
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set the number of workers
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_max_dispatch_attempts(mut self, attempts: u32) -> Self {
        self.max_dispatch_attempts = attempts.max(1);
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Workers are pulling work
    Running,
    /// Workers are finishing their current unit
    Draining,
    /// No worker is running
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    /// Worker already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Worker not running
    #[error("worker pool is not running")]
    NotRunning,

    /// Shutdown timeout
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Counters since the pool was created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerPoolStats {
    pub processed: u64,
    pub failed: u64,
    pub requeued: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
}

/// Worker pool for executing dispatched work
///
/// # Example
///
/// ```ignore
/// let (queue, receiver) = WorkQueue::new();
/// let executor = Arc::new(ProcessExecutor::new(store, Arc::new(queue.clone()), config));
/// let pool = WorkerPool::new(executor, queue, receiver, WorkerPoolConfig::from_env());
///
/// pool.start()?;
/// pool.wait_idle().await;
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    executor: Arc<ProcessExecutor>,
    queue: WorkQueue,
    receiver: Arc<WorkReceiver>,
    config: WorkerPoolConfig,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<WorkerPoolStatus>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl WorkerPool {
    /// Create a new worker pool
    pub fn new(
        executor: Arc<ProcessExecutor>,
        queue: WorkQueue,
        receiver: WorkReceiver,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            executor,
            queue,
            receiver: Arc::new(receiver),
            config,
            shutdown_tx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            handles: Mutex::new(Vec::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Start the workers
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status != WorkerPoolStatus::Stopped {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }
        self.shutdown_tx.send_replace(false);

        info!(
            worker_id = %self.config.worker_id,
            workers = self.config.workers,
            max_dispatch_attempts = self.config.max_dispatch_attempts,
            "Starting worker pool"
        );

        let mut handles = self.handles.lock();
        for index in 0..self.config.workers {
            handles.push(self.spawn_worker(index));
        }
        Ok(())
    }

    /// Shutdown the worker pool gracefully
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            match *status {
                WorkerPoolStatus::Stopped => return Err(WorkerPoolError::NotRunning),
                WorkerPoolStatus::Draining => return Ok(()),
                WorkerPoolStatus::Running => *status = WorkerPoolStatus::Draining,
            }
        }

        info!(worker_id = %self.config.worker_id, "Initiating graceful shutdown");
        self.shutdown_tx.send_replace(true);
        self.executor.interrupt_retries();

        let handles = std::mem::take(&mut *self.handles.lock());
        let joined = tokio::time::timeout(self.config.shutdown_timeout, join_all(handles)).await;
        *self.status.write() = WorkerPoolStatus::Stopped;

        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "Worker task failed");
                    }
                }
                info!(worker_id = %self.config.worker_id, "Worker pool stopped");
                Ok(())
            }
            Err(_) => {
                warn!(worker_id = %self.config.worker_id, "Shutdown timeout reached");
                Err(WorkerPoolError::ShutdownTimeout)
            }
        }
    }

    /// Wait until the queue is drained and no unit is running
    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await
    }

    /// Get current status
    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Get the worker ID
    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            processed: self.counters.processed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            requeued: self.counters.requeued.load(Ordering::Relaxed),
        }
    }

    fn spawn_worker(&self, index: usize) -> JoinHandle<()> {
        let executor = Arc::clone(&self.executor);
        let queue = self.queue.clone();
        let receiver = Arc::clone(&self.receiver);
        let counters = Arc::clone(&self.counters);
        let max_attempts = self.config.max_dispatch_attempts;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        debug!(worker = index, "Worker: shutdown requested");
                        break;
                    }
                    next = receiver.recv() => next,
                };
                let Some(work) = next else {
                    debug!(worker = index, "Worker: queue closed");
                    break;
                };
                run_one(&executor, &queue, &counters, max_attempts, work).await;
            }
            debug!(worker = index, "Worker exited");
        })
    }
}

async fn run_one(
    executor: &ProcessExecutor,
    queue: &WorkQueue,
    counters: &Counters,
    max_attempts: u32,
    work: QueuedWork,
) {
    let QueuedWork {
        descriptor,
        attempt,
    } = work;

    match executor.dispatch(&descriptor).await {
        Ok(()) => {
            counters.processed.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) if e.is_transient() && attempt < max_attempts => {
            warn!(work = %descriptor, attempt, error = %e, "Store unavailable, requeueing work");
            match queue.enqueue(descriptor, attempt + 1) {
                Ok(()) => {
                    counters.requeued.fetch_add(1, Ordering::Relaxed);
                }
                Err(requeue) => {
                    error!(error = %requeue, "Failed to requeue work");
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        Err(e) => {
            error!(work = %descriptor, attempt, error = %e, "Work failed");
            counters.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
    queue.finished();
}
