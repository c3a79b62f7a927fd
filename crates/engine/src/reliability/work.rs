//! Retrying work executor
//!
//! Runs a unit of work inside one store transaction and commits it. When the
//! attempt fails with an optimistic conflict the transaction is rolled back,
//! the executor sleeps and tries again, up to the policy's retry budget.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::context::WorkContext;
use super::retry::RetryPolicy;
use crate::engine::WorkDescriptor;
use crate::error::{context_keys, EngineError, ErrorContext};
use crate::persistence::{FlowNodeStore, StoreTransaction};

/// A transactional unit of work
#[async_trait]
pub trait WorkItem: Send + Sync {
    type Output: Send;

    fn description(&self) -> String;

    fn recovery_procedure(&self) -> String {
        format!("re-run: {}", self.description())
    }

    /// Describe a failure of this unit. Units that surface their errors
    /// unchanged return `UnsupportedOperation`.
    fn describe_failure(&self, context: &mut ErrorContext) -> Result<(), EngineError> {
        context.insert(context_keys::DESCRIPTION, self.description());
        context.insert(context_keys::RECOVERY_PROCEDURE, self.recovery_procedure());
        Ok(())
    }

    /// Do the work. Descriptors pushed to `followups` are dispatched only
    /// once the transaction has committed.
    async fn run(
        &self,
        tx: &mut dyn StoreTransaction,
        followups: &mut Vec<WorkDescriptor>,
    ) -> Result<Self::Output, EngineError>;
}

/// Several units sharing one transaction, run in order
pub struct WorkSequence<O> {
    items: Vec<Box<dyn WorkItem<Output = O>>>,
}

impl<O: Send> WorkSequence<O> {
    pub fn new() -> Self {
        Self { items: Vec::new() }
    }

    pub fn push(mut self, item: impl WorkItem<Output = O> + 'static) -> Self {
        self.items.push(Box::new(item));
        self
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<O: Send> Default for WorkSequence<O> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<O: Send> WorkItem for WorkSequence<O> {
    type Output = Vec<O>;

    fn description(&self) -> String {
        let parts: Vec<_> = self.items.iter().map(|i| i.description()).collect();
        parts.join("; ")
    }

    async fn run(
        &self,
        tx: &mut dyn StoreTransaction,
        followups: &mut Vec<WorkDescriptor>,
    ) -> Result<Vec<O>, EngineError> {
        let mut outputs = Vec::with_capacity(self.items.len());
        for item in &self.items {
            outputs.push(item.run(tx, followups).await?);
        }
        Ok(outputs)
    }
}

/// Classified result of one attempt
#[derive(Debug)]
pub enum Attempt<T> {
    Committed(T),
    Retryable(EngineError),
    Fatal(EngineError),
}

impl<T> Attempt<T> {
    fn classify(error: EngineError) -> Self {
        if error.is_retryable() {
            Self::Retryable(error)
        } else {
            Self::Fatal(error)
        }
    }
}

/// Output of a committed unit together with its follow-up work
#[derive(Debug)]
pub struct Completed<T> {
    pub output: T,
    pub followups: Vec<WorkDescriptor>,
    pub attempts: u32,
}

/// Executes units of work with rollback and bounded retries
pub struct RetryingWorkExecutor {
    store: Arc<dyn FlowNodeStore>,
    policy: RetryPolicy,
    context: WorkContext,
    interrupt: Arc<Notify>,
}

impl RetryingWorkExecutor {
    pub fn new(store: Arc<dyn FlowNodeStore>, policy: RetryPolicy, context: WorkContext) -> Self {
        Self {
            store,
            policy,
            context,
            interrupt: Arc::new(Notify::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Cut short every backoff sleep in progress
    pub fn interrupt(&self) {
        self.interrupt.notify_waiters();
    }

    /// Run `work` until it commits, fails fatally, or exhausts its retries
    pub async fn execute<W>(&self, work: &W) -> Result<Completed<W::Output>, EngineError>
    where
        W: WorkItem + ?Sized,
    {
        let mut attempt = 1;

        loop {
            match self.attempt(work).await {
                Attempt::Committed((output, followups)) => {
                    return Ok(Completed {
                        output,
                        followups,
                        attempts: attempt,
                    });
                }
                Attempt::Fatal(error) => return Err(self.wrap(work, error)),
                Attempt::Retryable(error) => {
                    if attempt >= self.policy.max_attempts() {
                        warn!(
                            work = %work.description(),
                            attempts = attempt,
                            error = %error,
                            "Retries exhausted"
                        );
                        let exhausted = EngineError::RetriesExhausted {
                            attempts: attempt,
                            source: Box::new(error),
                        };
                        return Err(self.wrap(work, exhausted));
                    }

                    let delay = self.policy.delay_for_retry(attempt);
                    debug!(
                        work = %work.description(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying after conflict"
                    );
                    self.backoff(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// One transaction: begin, run, commit
    async fn attempt<W>(&self, work: &W) -> Attempt<(W::Output, Vec<WorkDescriptor>)>
    where
        W: WorkItem + ?Sized,
    {
        let mut tx = match self.store.begin().await {
            Ok(tx) => tx,
            Err(e) => return Attempt::classify(e.into()),
        };

        let mut followups = Vec::new();
        match work.run(tx.as_mut(), &mut followups).await {
            Ok(output) => match tx.commit().await {
                Ok(()) => Attempt::Committed((output, followups)),
                Err(e) => Attempt::classify(e.into()),
            },
            Err(error) => {
                if let Err(e) = tx.rollback().await {
                    warn!(error = %e, "Rollback failed");
                }
                Attempt::classify(error)
            }
        }
    }

    async fn backoff(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.interrupt.notified() => {
                warn!(
                    delay_ms = delay.as_millis() as u64,
                    "Retry backoff interrupted, retrying immediately"
                );
            }
        }
    }

    fn wrap<W>(&self, work: &W, error: EngineError) -> EngineError
    where
        W: WorkItem + ?Sized,
    {
        let mut context = ErrorContext::new();
        match work.describe_failure(&mut context) {
            Ok(()) => {
                self.context.attach(&mut context);
                error.with_context(context)
            }
            Err(rejected) => {
                debug!(reason = %rejected, "Failure wrapping declined");
                error
            }
        }
    }
}
