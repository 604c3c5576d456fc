use crate::error::{Error, Result};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Completion handle of a sequenced action.
///
/// Resolves with the action's own result. Dropping the handle does not cancel
/// the action; it still runs once its predecessors finish.
#[derive(Debug)]
pub struct ActionHandle<R> {
    rx: oneshot::Receiver<Result<R>>,
}

impl<R> ActionHandle<R> {
    pub(crate) fn new(rx: oneshot::Receiver<Result<R>>) -> Self {
        Self { rx }
    }
}

impl<R> Future for ActionHandle<R> {
    type Output = Result<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The action was dropped before producing a result (panic or shutdown).
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}
