use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use tessera_orchestrator::{ExecutionContext, ExecutionError, ExecutionErrorKind, ExecutionOutcome};

/// The pending outcome of a submitted request.
///
/// Dropping the future before it completed cancels the request.
pub struct ResponseFuture {
    id: u64,
    ctx: Weak<ExecutionContext>,
    rx: oneshot::Receiver<ExecutionOutcome>,
}

impl ResponseFuture {
    pub(crate) fn new(ctx: &Arc<ExecutionContext>, rx: oneshot::Receiver<ExecutionOutcome>) -> Self {
        Self {
            id: ctx.id(),
            ctx: Arc::downgrade(ctx),
            rx,
        }
    }

    pub fn request_id(&self) -> u64 {
        self.id
    }

    /// Cancels the request. Awaiting the future afterwards yields
    /// `Cancelled`, unless the request completed first.
    pub fn cancel(&self) {
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.cancel();
        }
    }
}

impl Future for ResponseFuture {
    type Output = ExecutionOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            // the request task was dropped without resolving, only on shutdown
            Poll::Ready(Err(_)) => Poll::Ready(Err(ExecutionError::untraced(ExecutionErrorKind::SessionClosed))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.upgrade() {
            if !ctx.is_resolved() {
                ctx.cancel();
            }
        }
    }
}

impl std::fmt::Debug for ResponseFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseFuture").field("id", &self.id).finish()
    }
}
