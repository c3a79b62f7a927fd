//! In-process work queue
//!
//! Every descriptor handed to the queue counts as in flight until a worker
//! reports it finished, so callers can wait for the engine to go quiet.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::trace;

use crate::engine::{WorkDescriptor, WorkScheduler};
use crate::error::EngineError;

/// A descriptor with the number of times it has been dispatched
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedWork {
    pub descriptor: WorkDescriptor,
    pub attempt: u32,
}

/// Sending half of the queue; also the engine's [`WorkScheduler`]
#[derive(Clone)]
pub struct WorkQueue {
    sender: mpsc::UnboundedSender<QueuedWork>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

/// Receiving half, shared by the pool's workers
pub struct WorkReceiver {
    receiver: Mutex<mpsc::UnboundedReceiver<QueuedWork>>,
}

impl WorkQueue {
    pub fn new() -> (WorkQueue, WorkReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue = WorkQueue {
            sender,
            in_flight: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        };
        let receiver = WorkReceiver {
            receiver: Mutex::new(receiver),
        };
        (queue, receiver)
    }

    /// Queue a descriptor for its `attempt`-th dispatch
    pub fn enqueue(&self, descriptor: WorkDescriptor, attempt: u32) -> Result<(), EngineError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        trace!(work = %descriptor, attempt, "queued work");
        if self
            .sender
            .send(QueuedWork {
                descriptor,
                attempt,
            })
            .is_err()
        {
            self.finished();
            return Err(EngineError::Dispatch("work queue is closed".into()));
        }
        Ok(())
    }

    /// Queued or running descriptors
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Mark one dequeued descriptor as done
    pub fn finished(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Wait until nothing is queued or running
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl WorkScheduler for WorkQueue {
    async fn submit(&self, descriptor: WorkDescriptor) -> Result<(), EngineError> {
        self.enqueue(descriptor, 1)
    }
}

impl WorkReceiver {
    /// Next descriptor; `None` once every sender is gone
    pub async fn recv(&self) -> Option<QueuedWork> {
        self.receiver.lock().await.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::state_ids;
    use std::time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_in_flight_accounting() {
        let (queue, receiver) = WorkQueue::new();
        let id = Uuid::now_v7();
        queue
            .submit(WorkDescriptor::advance(id, state_ids::INITIALIZING))
            .await
            .unwrap();
        assert_eq!(queue.in_flight(), 1);

        let work = receiver.recv().await.unwrap();
        assert_eq!(work.attempt, 1);
        assert_eq!(queue.in_flight(), 1);

        queue.finished();
        assert_eq!(queue.in_flight(), 0);
        tokio::time::timeout(Duration::from_secs(1), queue.wait_idle())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_idle_wakes_when_drained() {
        let (queue, receiver) = WorkQueue::new();
        tokio_test::assert_ok!(
            queue.enqueue(WorkDescriptor::advance(Uuid::now_v7(), state_ids::READY), 2)
        );

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_idle().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        let work = receiver.recv().await.unwrap();
        assert_eq!(work.attempt, 2);
        queue.finished();
        drop(receiver);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        tokio_test::assert_err!(
            queue.enqueue(WorkDescriptor::advance(Uuid::now_v7(), state_ids::READY), 1)
        );
        assert_eq!(queue.in_flight(), 0);
    }
}
