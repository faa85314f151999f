//! Caller-visible operation futures.
//!
//! One `Operation` per `add`/`remove` invocation. Routing splits an
//! operation's entries across however many `(node, batch)` submissions are
//! needed — under `allow_overwrite=false` and replication factor N, a
//! single key fans out to N destinations, each of which must ack
//! independently. `Operation` therefore tracks a plain outstanding count of
//! routed submissions, not a deduplicated key set, and resolves its paired
//! [`OperationFuture`] exactly once: to success when the count drains to
//! zero, or to failure on the first non-retryable error. Modeled on
//! correlating a producer batch's completion via a map of
//! `oneshot::Sender`s under a lock.
//!
//! The count is kept from prematurely reaching zero mid-routing (or
//! mid-remap) by a "routing in progress" placeholder: `new` reserves one
//! unit up front, released by `routing_complete` once every destination
//! this invocation of routing produced has been `register`ed. A remap
//! retry reserves its own placeholder the same way before the old
//! submission's slot is released, so the count never dips to zero between
//! the old attempt failing and the retry's own submissions being counted.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::StreamerError;

struct Inner {
    pending: u64,
    sender: Option<oneshot::Sender<Result<(), StreamerError>>>,
}

/// The producer-side handle an operation's completion listeners resolve
/// against. Cloned and shared across every destination-node group the
/// operation's entries were routed to.
#[derive(Clone)]
pub struct Operation {
    inner: Arc<Mutex<Inner>>,
}

impl Operation {
    /// Begins a new operation with one outstanding "routing in progress"
    /// placeholder reserved; the caller's initial routing pass must
    /// eventually call [`Operation::routing_complete`] to release it.
    pub fn new() -> (Self, OperationFuture) {
        let (tx, rx) = oneshot::channel();
        let op = Operation {
            inner: Arc::new(Mutex::new(Inner {
                pending: 1,
                sender: Some(tx),
            })),
        };
        (op, OperationFuture { receiver: rx })
    }

    /// Reserve `n` additional outstanding acknowledgments: one per routed
    /// `(node, batch)` submission, or a single placeholder unit while a
    /// remap retry is being routed.
    pub fn register(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.inner.lock().pending += n;
    }

    /// Release `n` outstanding acknowledgments, resolving the operation
    /// successfully once none remain.
    pub fn ack(&self, n: u64) {
        let mut inner = self.inner.lock();
        inner.pending = inner.pending.saturating_sub(n);
        if inner.pending == 0 {
            if let Some(tx) = inner.sender.take() {
                let _ = tx.send(Ok(()));
            }
        }
    }

    /// Release the routing-in-progress placeholder reserved by `new` (or,
    /// for a remap retry, reserved by the caller just before spawning it).
    pub fn routing_complete(&self) {
        self.ack(1);
    }

    /// Resolve the operation with a terminal failure. A no-op if the
    /// operation has already resolved (first failure wins).
    pub fn fail(&self, err: StreamerError) {
        let mut inner = self.inner.lock();
        if let Some(tx) = inner.sender.take() {
            let _ = tx.send(Err(err));
        }
    }
}

/// Future returned to the caller of `add`/`remove`.
pub struct OperationFuture {
    receiver: oneshot::Receiver<Result<(), StreamerError>>,
}

impl Future for OperationFuture {
    type Output = Result<(), StreamerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The sender was dropped without resolving: treat as cancelled.
            Poll::Ready(Err(_)) => Poll::Ready(Err(StreamerError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolves_success_once_every_registered_batch_acks() {
        let (op, fut) = Operation::new();
        op.register(2);
        op.routing_complete();
        op.ack(1);
        op.ack(1);
        assert!(fut.await.is_ok());
    }

    #[tokio::test]
    async fn replicated_submissions_all_require_their_own_ack() {
        // One key fanned out to 3 replicas: 3 separate batch registrations,
        // none of which may be conflated with the others.
        let (op, fut) = Operation::new();
        op.register(3);
        op.routing_complete();
        op.ack(1);
        op.ack(1);
        let op_task = tokio::spawn(fut);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!op_task.is_finished(), "two of three replica acks must not resolve the operation");
        op.ack(1);
        assert!(op_task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn first_failure_wins() {
        let (op, fut) = Operation::new();
        op.register(1);
        op.routing_complete();
        op.fail(StreamerError::TopologyEmpty);
        op.fail(StreamerError::Cancelled);
        assert!(matches!(fut.await, Err(StreamerError::TopologyEmpty)));
    }

    #[tokio::test]
    async fn remap_retry_keeps_operation_pending_across_the_handoff() {
        let (op, fut) = Operation::new();
        op.register(1);
        op.routing_complete();

        // Simulate a remappable failure: reserve the retry's placeholder
        // before releasing the failed attempt's slot.
        op.register(1);
        op.ack(1);

        let op_task = tokio::spawn(fut);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!op_task.is_finished(), "operation must stay pending through a remap handoff");

        // The retry registers its own submission, then releases its
        // placeholder once routing for the retry completes.
        op.register(1);
        op.routing_complete();
        op.ack(1);
        assert!(op_task.await.unwrap().is_ok());
    }
}
