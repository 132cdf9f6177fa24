//! Completion handles for session operations.
//!
//! Every caller operation returns an [`Operation`] immediately. The session
//! task keeps the matching [`Completer`] and resolves it exactly once.
//! Cancellation is a flag: it stops the result from being delivered but
//! never recalls bytes already written to the wire. Operations created by a
//! session also tell the session task, so it can stop work that only the
//! cancelled operation was waiting for.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tether_platform::{TetherError, TetherResult};
use tokio::sync::{mpsc, oneshot};

use crate::ssh::channel::OpId;

/// Pending result of a session operation.
///
/// Resolves to the operation's result, or to `Cancelled` once
/// [`Operation::cancel`] has been called.
#[derive(Debug)]
#[must_use = "operations report their result only when awaited"]
pub struct Operation<T> {
    id: OpId,
    cancelled: Arc<AtomicBool>,
    rx: oneshot::Receiver<TetherResult<T>>,
    cancels: Option<mpsc::UnboundedSender<OpId>>,
}

/// Session-side half of an [`Operation`].
#[derive(Debug)]
pub(crate) struct Completer<T> {
    id: OpId,
    cancelled: Arc<AtomicBool>,
    tx: oneshot::Sender<TetherResult<T>>,
}

/// Creates a linked operation and completer.
pub(crate) fn operation<T>(id: OpId) -> (Operation<T>, Completer<T>) {
    let cancelled = Arc::new(AtomicBool::new(false));
    let (tx, rx) = oneshot::channel();
    (
        Operation {
            id,
            cancelled: Arc::clone(&cancelled),
            rx,
            cancels: None,
        },
        Completer { id, cancelled, tx },
    )
}

impl<T> Operation<T> {
    /// Operation id, unique within the session.
    pub fn id(&self) -> OpId {
        self.id
    }

    /// Reports the first [`Operation::cancel`] on `cancels`.
    pub(crate) fn notify_cancel(mut self, cancels: mpsc::UnboundedSender<OpId>) -> Self {
        self.cancels = Some(cancels);
        self
    }

    /// Marks the operation cancelled. No result is delivered afterwards.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(cancels) = &self.cancels {
            // The session may already be gone, which needs no notice
            let _ = cancels.send(self.id);
        }
    }

    /// True after [`Operation::cancel`].
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

impl<T> Future for Operation<T> {
    type Output = TetherResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.is_cancelled() {
            return Poll::Ready(Err(TetherError::cancelled()));
        }
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(TetherError::transport(
                "session ended before the operation completed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Completer<T> {
    /// Operation id.
    pub(crate) fn id(&self) -> OpId {
        self.id
    }

    /// Delivers the result unless the operation was cancelled. Returns
    /// whether it was delivered.
    pub(crate) fn complete(self, result: TetherResult<T>) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send(result).is_ok()
    }
}
