//! Per-request execution state.
//!
//! An [`ExecutionContext`] is created for every request the caller submits.
//! It owns the request's deadline, its cancellation signal and the trace of
//! attempts, and it is the only way to deliver the request's outcome: the
//! result channel can be completed once, every later completion is rejected
//! with [`AlreadyResolved`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

use tessera_common::protocol::Response;

use crate::error::{AttemptError, ExecutionError, ExecutionErrorKind};
use crate::retry::RetryDecision;

/// Where the request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExecutionPhase {
    Init = 0,
    AwaitingChannel = 1,
    InFlight = 2,
    Retrying = 3,
    Speculating = 4,
    Done = 5,
    Failed = 6,
}

impl ExecutionPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ExecutionPhase::Init,
            1 => ExecutionPhase::AwaitingChannel,
            2 => ExecutionPhase::InFlight,
            3 => ExecutionPhase::Retrying,
            4 => ExecutionPhase::Speculating,
            5 => ExecutionPhase::Done,
            _ => ExecutionPhase::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionPhase::Done | ExecutionPhase::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failed(AttemptError),
}

/// One attempt of a request on one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    /// 1 for the initial execution, 2 and up for speculative ones
    pub execution: usize,
    /// Position among all attempts of the request, from 1
    pub attempt: usize,
    pub node: SocketAddr,
    /// Offset from the start of the request
    pub started_after: Duration,
    pub latency: Duration,
    pub outcome: AttemptOutcome,
    /// Retry decision taken after a failure
    pub decision: Option<RetryDecision>,
}

/// Attempts of a request, in the order they completed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionTrace {
    pub attempts: Vec<AttemptRecord>,
    /// Executions started in addition to the first
    pub speculative_executions: usize,
    pub elapsed: Duration,
}

impl ExecutionTrace {
    /// Nodes attempted, in completion order.
    pub fn nodes(&self) -> Vec<SocketAddr> {
        self.attempts.iter().map(|a| a.node).collect()
    }
}

/// A successful request.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub response: Response,
    /// Node that answered
    pub coordinator: SocketAddr,
    /// The response is empty because the retry policy ignored an error
    pub ignored: bool,
    pub trace: ExecutionTrace,
}

pub type ExecutionOutcome = Result<ExecutionResult, ExecutionError>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Execution context already resolved")]
pub struct AlreadyResolved;

pub struct ExecutionContext {
    id: u64,
    started: Instant,
    deadline: Instant,
    timeout: Duration,
    phase: AtomicU8,
    attempts: Mutex<Vec<AttemptRecord>>,
    speculative: AtomicUsize,
    resolver: Mutex<Option<oneshot::Sender<ExecutionOutcome>>>,
    cancel: watch::Sender<bool>,
}

impl ExecutionContext {
    /// Creates a context whose deadline is `timeout` from now, and the
    /// receiver of its outcome.
    pub fn new(id: u64, timeout: Duration) -> (Arc<Self>, oneshot::Receiver<ExecutionOutcome>) {
        let (tx, rx) = oneshot::channel();
        let (cancel, _) = watch::channel(false);
        let started = Instant::now();

        let context = Arc::new(Self {
            id,
            started,
            deadline: started + timeout,
            timeout,
            phase: AtomicU8::new(ExecutionPhase::Init as u8),
            attempts: Mutex::new(Vec::new()),
            speculative: AtomicUsize::new(0),
            resolver: Mutex::new(Some(tx)),
            cancel,
        });
        (context, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn phase(&self) -> ExecutionPhase {
        ExecutionPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    /// Terminal phases are never left.
    pub(crate) fn set_phase(&self, next: ExecutionPhase) {
        let _ = self.phase.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            (!ExecutionPhase::from_u8(current).is_terminal()).then_some(next as u8)
        });
    }

    pub fn record_attempt(&self, record: AttemptRecord) {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner).push(record);
    }

    pub(crate) fn record_speculative_execution(&self) {
        self.speculative.fetch_add(1, Ordering::AcqRel);
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn trace(&self) -> ExecutionTrace {
        ExecutionTrace {
            attempts: self.attempts.lock().unwrap_or_else(PoisonError::into_inner).clone(),
            speculative_executions: self.speculative.load(Ordering::Acquire),
            elapsed: self.elapsed(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolver.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    pub fn succeed(&self, response: Response, coordinator: SocketAddr, ignored: bool) -> Result<(), AlreadyResolved> {
        let sender = self.take_resolver()?;
        self.set_phase(ExecutionPhase::Done);
        let _ = sender.send(Ok(ExecutionResult {
            response,
            coordinator,
            ignored,
            trace: self.trace(),
        }));
        Ok(())
    }

    pub fn fail(&self, kind: ExecutionErrorKind) -> Result<(), AlreadyResolved> {
        let sender = self.take_resolver()?;
        self.set_phase(ExecutionPhase::Failed);
        let _ = sender.send(Err(ExecutionError::new(kind, self.trace())));
        Ok(())
    }

    fn take_resolver(&self) -> Result<oneshot::Sender<ExecutionOutcome>, AlreadyResolved> {
        self.resolver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(AlreadyResolved)
    }

    /// Asks the running execution to stop and fail with `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once [`cancel`](Self::cancel) was called.
    pub fn cancelled(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.cancel.subscribe();
        async move {
            if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("phase", &self.phase())
            .field("timeout", &self.timeout)
            .field("attempts", &self.attempt_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_common::protocol::Opcode;

    fn addr() -> SocketAddr {
        "127.0.0.1:9042".parse().unwrap()
    }

    fn record(attempt: usize) -> AttemptRecord {
        AttemptRecord {
            execution: 1,
            attempt,
            node: addr(),
            started_after: Duration::ZERO,
            latency: Duration::from_millis(1),
            outcome: AttemptOutcome::Failed(AttemptError::Timeout(Duration::from_millis(1))),
            decision: Some(RetryDecision::RetryNextNode),
        }
    }

    #[tokio::test]
    async fn test_resolves_exactly_once() {
        let (ctx, rx) = ExecutionContext::new(1, Duration::from_secs(1));
        ctx.record_attempt(record(1));

        assert!(ctx.succeed(Response::new(Opcode::Result, "ok"), addr(), false).is_ok());
        assert_eq!(ctx.fail(ExecutionErrorKind::Cancelled), Err(AlreadyResolved));
        assert_eq!(
            ctx.succeed(Response::empty(), addr(), false),
            Err(AlreadyResolved)
        );
        assert!(ctx.is_resolved());
        assert_eq!(ctx.phase(), ExecutionPhase::Done);

        let result = rx.await.unwrap().unwrap();
        assert_eq!(&result.response.body[..], b"ok");
        assert_eq!(result.trace.attempts, vec![record(1)]);
    }

    #[tokio::test]
    async fn test_failure_carries_trace() {
        let (ctx, rx) = ExecutionContext::new(2, Duration::from_secs(1));
        ctx.record_attempt(record(1));
        ctx.record_attempt(record(2));
        ctx.record_speculative_execution();

        ctx.fail(ExecutionErrorKind::OverallTimeout(Duration::from_secs(1))).unwrap();
        ctx.set_phase(ExecutionPhase::InFlight);
        assert_eq!(ctx.phase(), ExecutionPhase::Failed);

        let error = rx.await.unwrap().unwrap_err();
        assert_eq!(error.trace.attempts.len(), 2);
        assert_eq!(error.trace.speculative_executions, 1);
        assert_eq!(error.trace.nodes(), vec![addr(), addr()]);
    }

    #[tokio::test]
    async fn test_resolving_without_receiver_still_counts() {
        let (ctx, rx) = ExecutionContext::new(3, Duration::from_secs(1));
        drop(rx);
        assert!(ctx.fail(ExecutionErrorKind::Cancelled).is_ok());
        assert!(ctx.fail(ExecutionErrorKind::Cancelled).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_and_cancellation() {
        let (ctx, _rx) = ExecutionContext::new(4, Duration::from_millis(100));
        assert!(!ctx.is_expired());
        assert_eq!(ctx.remaining(), Duration::from_millis(100));

        let cancelled = ctx.cancelled();
        ctx.cancel();
        cancelled.await;
        assert!(ctx.is_cancelled());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(ctx.is_expired());
        assert_eq!(ctx.remaining(), Duration::ZERO);
    }
}
