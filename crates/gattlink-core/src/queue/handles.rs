//! Handles given to a running operation and to its caller

use crate::error::GattError;
use crate::Result;
use core::pin::Pin;
use core::task::{Context, Poll};
use futures::Stream;
use tokio::sync::{mpsc, oneshot};

use super::PendingGuard;

// ----------------------------------------------------------------------------
// Queue Release
// ----------------------------------------------------------------------------

/// Obligation to hand the link back to the queue
///
/// Dropping the release also frees the queue, so a panicking or early
/// returning operation cannot stall it. Calling [`QueueRelease::release`]
/// makes the hand-over explicit and lets the operation keep emitting results
/// afterwards.
#[derive(Debug)]
pub struct QueueRelease {
    tx: Option<oneshot::Sender<()>>,
}

impl QueueRelease {
    pub(crate) fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn release(mut self) {
        self.signal();
    }

    pub fn is_released(&self) -> bool {
        self.tx.is_none()
    }

    fn signal(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for QueueRelease {
    fn drop(&mut self) {
        self.signal();
    }
}

// ----------------------------------------------------------------------------
// Operation Emitter
// ----------------------------------------------------------------------------

/// Sending side of an operation's result stream
#[derive(Debug)]
pub struct OperationEmitter<T> {
    tx: mpsc::UnboundedSender<Result<T>>,
}

impl<T> Clone for OperationEmitter<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<T> OperationEmitter<T> {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Result<T>>) -> Self {
        Self { tx }
    }

    /// Returns false once the caller stopped listening
    pub fn emit(&self, value: T) -> bool {
        self.tx.send(Ok(value)).is_ok()
    }

    pub fn fail(&self, error: GattError) -> bool {
        self.tx.send(Err(error)).is_ok()
    }

    pub fn send(&self, result: Result<T>) -> bool {
        self.tx.send(result).is_ok()
    }

    /// The caller dropped the result stream
    pub fn is_cancelled(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the caller dropped the result stream
    pub async fn cancelled(&self) {
        self.tx.closed().await
    }
}

// ----------------------------------------------------------------------------
// Operation Stream
// ----------------------------------------------------------------------------

/// Results of an enqueued operation
///
/// Dropping the stream before the operation started removes it from the
/// queue; dropping it later cancels the running operation.
pub struct OperationStream<T> {
    rx: mpsc::UnboundedReceiver<Result<T>>,
    _pending: Option<PendingGuard>,
}

impl<T> OperationStream<T> {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<Result<T>>, pending: Option<PendingGuard>) -> Self {
        Self {
            rx,
            _pending: pending,
        }
    }

    /// First result of a one-shot operation
    pub async fn single(mut self) -> Result<T> {
        match self.rx.recv().await {
            Some(result) => result,
            None => Err(GattError::QueueTerminated {
                reason: "operation finished without a result".into(),
            }),
        }
    }
}

impl<T> Unpin for OperationStream<T> {}

impl<T> Stream for OperationStream<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> core::fmt::Debug for OperationStream<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OperationStream").finish_non_exhaustive()
    }
}
