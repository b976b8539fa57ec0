//! Worker pool: the receive loops driving the bus
//!
//! Each worker is a cooperative loop bounded by a parallelism semaphore:
//! acquire a slot, create a transaction context, receive, run the incoming
//! pipeline, commit or abort, dispose, release. Unhandled errors are
//! logged; they never crash a worker.
//!
//! At parallelism 1 a worker receives and commits in transport order.
//! Higher parallelism (or several workers) trades that ordering for
//! throughput.

use crate::bus::{BusInner, HandlingScope, AMBIENT};
use crate::pipeline::StepContext;
use crate::transaction::TransactionContext;
use crate::transport::TransportMessage;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Polling delay policy for idle and failing receive loops
#[async_trait]
pub trait BackoffStrategy: Send + Sync {
    /// Called after a successful receive; clears any error escalation
    fn reset(&self);

    /// Wait applied when the input queue is empty
    async fn wait_idle(&self, cancel: &CancellationToken);

    /// Wait applied after a transport error, typically escalating
    async fn wait_error(&self, cancel: &CancellationToken);
}

/// Default policy: constant short waits when idle, capped exponential
/// escalation after transport errors. All waits abort on cancellation.
pub struct DefaultBackoffStrategy {
    idle_delay: Duration,
    error_base: Duration,
    error_cap: Duration,
    consecutive_errors: AtomicU32,
}

impl DefaultBackoffStrategy {
    /// Creates the canonical policy: 100 ms idle, 200 ms..5 s on errors
    pub fn new() -> Self {
        Self {
            idle_delay: Duration::from_millis(100),
            error_base: Duration::from_millis(200),
            error_cap: Duration::from_secs(5),
            consecutive_errors: AtomicU32::new(0),
        }
    }

    async fn wait(&self, delay: Duration, cancel: &CancellationToken) {
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            () = cancel.cancelled() => {}
        }
    }
}

impl Default for DefaultBackoffStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackoffStrategy for DefaultBackoffStrategy {
    fn reset(&self) {
        self.consecutive_errors.store(0, Ordering::Relaxed);
    }

    async fn wait_idle(&self, cancel: &CancellationToken) {
        self.wait(self.idle_delay, cancel).await;
    }

    async fn wait_error(&self, cancel: &CancellationToken) {
        let errors = self.consecutive_errors.fetch_add(1, Ordering::Relaxed);
        let exponent = errors.min(5);
        let delay = self
            .error_base
            .saturating_mul(1 << exponent)
            .min(self.error_cap);
        self.wait(delay, cancel).await;
    }
}

pub(crate) struct WorkerShared {
    pub(crate) bus: Weak<BusInner>,
    pub(crate) parallelism: usize,
    pub(crate) drain_deadline: Duration,
    pub(crate) backoff: Arc<dyn BackoffStrategy>,
}

struct WorkerHandle {
    name: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Fixed-count set of receive workers
pub(crate) struct WorkerPool {
    shared: Arc<WorkerShared>,
    cancel: CancellationToken,
    workers: Vec<WorkerHandle>,
    next_id: usize,
}

impl WorkerPool {
    /// Starts `count` workers; every worker token is a child of `cancel`
    pub(crate) fn start(shared: Arc<WorkerShared>, cancel: CancellationToken, count: usize) -> Self {
        let mut pool = Self {
            shared,
            cancel,
            workers: Vec::new(),
            next_id: 0,
        };
        pool.set_worker_count(count);
        pool
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Grows or shrinks the pool. A removed worker finishes its current
    /// message before exiting.
    pub(crate) fn set_worker_count(&mut self, desired: usize) {
        while self.workers.len() < desired {
            self.spawn_worker();
        }
        while self.workers.len() > desired {
            if let Some(worker) = self.workers.pop() {
                debug!(worker = %worker.name, "stopping worker");
                worker.token.cancel();
            }
        }
    }

    fn spawn_worker(&mut self) {
        let name = format!("omnibus-worker-{}", self.next_id);
        self.next_id += 1;
        let token = self.cancel.child_token();
        let handle = tokio::spawn(run_worker(
            name.clone(),
            Arc::clone(&self.shared),
            token.clone(),
        ));
        self.workers.push(WorkerHandle {
            name,
            token,
            handle,
        });
    }

    /// Stops every worker, waiting up to the drain deadline for in-flight
    /// messages to finish
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        let deadline = self.shared.drain_deadline + Duration::from_millis(500);
        for worker in self.workers {
            match tokio::time::timeout(deadline, worker.handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_error)) => error!(worker = %worker.name, %join_error, "worker task failed"),
                Err(_) => warn!(worker = %worker.name, "worker did not stop before the drain deadline"),
            }
        }
    }
}

async fn run_worker(name: String, shared: Arc<WorkerShared>, token: CancellationToken) {
    debug!(worker = %name, "worker started");
    let parallelism = Arc::new(Semaphore::new(shared.parallelism));

    loop {
        if token.is_cancelled() {
            break;
        }

        let permit = tokio::select! {
            permit = Arc::clone(&parallelism).acquire_owned() => {
                permit.expect("parallelism semaphore never closes")
            }
            () = token.cancelled() => break,
        };

        let Some(bus) = shared.bus.upgrade() else {
            break;
        };

        receive_one(&bus, &shared, &token, permit).await;
    }

    // Drain: wait for in-flight pipeline invocations to hand their
    // permits back before the worker exits.
    let drained = tokio::time::timeout(
        shared.drain_deadline,
        parallelism.acquire_many(shared.parallelism as u32),
    )
    .await;
    if drained.is_err() {
        warn!(worker = %name, "drain deadline elapsed with messages still in flight");
    }
    debug!(worker = %name, "worker stopped");
}

async fn receive_one(
    bus: &Arc<BusInner>,
    shared: &Arc<WorkerShared>,
    token: &CancellationToken,
    permit: tokio::sync::OwnedSemaphorePermit,
) {
    let transaction = Arc::new(TransactionContext::new());

    match bus.transport.receive(&transaction, token).await {
        Err(transport_error) => {
            warn!(%transport_error, "receive failed");
            if let Err(error) = transaction.abort().await {
                warn!(%error, "failed to abort context after receive error");
            }
            transaction.dispose().await;
            drop(permit);
            shared.backoff.wait_error(token).await;
        }
        Ok(None) => {
            // Empty queue: complete the no-op unit of work and back off
            if let Err(error) = transaction.complete().await {
                warn!(%error, "failed to complete empty receive context");
            }
            transaction.dispose().await;
            drop(permit);
            shared.backoff.wait_idle(token).await;
        }
        Ok(Some(message)) => {
            shared.backoff.reset();
            let bus = Arc::clone(bus);
            tokio::spawn(async move {
                process_message(bus, transaction, message).await;
                drop(permit);
            });
        }
    }
}

/// One receive -> pipeline -> commit cycle. Every outcome is logged;
/// nothing escapes to the worker loop.
async fn process_message(
    bus: Arc<BusInner>,
    transaction: Arc<TransactionContext>,
    message: TransportMessage,
) {
    let message_id = message
        .message_id()
        .unwrap_or("<no message-id>")
        .to_string();
    let scope = HandlingScope {
        transaction: Arc::clone(&transaction),
        headers: message.headers.clone(),
    };

    let outcome = AMBIENT
        .scope(scope, async {
            let mut ctx = StepContext::incoming(Arc::clone(&transaction), message);
            bus.invoker.invoke_incoming(&mut ctx).await
        })
        .await;

    match outcome {
        Ok(()) => {
            if let Err(error) = transaction.complete().await {
                error!(message_id, %error, "commit failed; message will be redelivered");
            }
        }
        Err(error) => {
            debug!(message_id, %error, "rolling back");
            if let Err(abort_error) = transaction.abort().await {
                error!(message_id, %abort_error, "rollback failed");
            }
        }
    }

    transaction.dispose().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn error_backoff_escalates_and_resets() {
        let backoff = DefaultBackoffStrategy {
            idle_delay: Duration::from_millis(1),
            error_base: Duration::from_millis(1),
            error_cap: Duration::from_millis(16),
            consecutive_errors: AtomicU32::new(0),
        };
        let cancel = CancellationToken::new();

        backoff.wait_error(&cancel).await;
        backoff.wait_error(&cancel).await;
        assert_eq!(backoff.consecutive_errors.load(Ordering::Relaxed), 2);

        backoff.reset();
        assert_eq!(backoff.consecutive_errors.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn waits_abort_on_cancellation() {
        let backoff = DefaultBackoffStrategy {
            idle_delay: Duration::from_secs(60),
            error_base: Duration::from_secs(60),
            error_cap: Duration::from_secs(60),
            consecutive_errors: AtomicU32::new(0),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();

        let start = Instant::now();
        backoff.wait_idle(&cancel).await;
        backoff.wait_error(&cancel).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
