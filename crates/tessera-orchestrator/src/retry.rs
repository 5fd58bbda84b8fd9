use std::fmt;

use tessera_common::protocol::{ErrorClass, ServerErrorKind};

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryDecision {
    /// Resubmit to the node that failed
    RetrySameNode,
    /// Move on to the next node of the plan
    RetryNextNode,
    /// Fail the request with this error
    Rethrow,
    /// Complete the request with an empty result
    Ignore,
}

impl fmt::Display for RetryDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RetryDecision::RetrySameNode => "RETRY_SAME_NODE",
            RetryDecision::RetryNextNode => "RETRY_NEXT_NODE",
            RetryDecision::Rethrow => "RETHROW",
            RetryDecision::Ignore => "IGNORE",
        };
        f.write_str(name)
    }
}

/// Failure of one attempt, as presented to a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryErrorKind {
    /// No response within the attempt timeout
    ClientTimeout,
    /// The connection failed or the response could not be decoded
    Transport,
    Server(ServerErrorKind),
}

impl RetryErrorKind {
    /// Validation errors are rethrown without asking the policy.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RetryErrorKind::Server(kind) if kind.class() == ErrorClass::Validation)
    }
}

/// Decides whether and where a failed attempt is retried.
///
/// `retry_count` is the number of retries the request already went through.
pub trait RetryPolicy: Send + Sync + 'static {
    fn decide(&self, error: &RetryErrorKind, retry_count: u32, idempotent: bool) -> RetryDecision;
}

/// The default policy.
///
/// - read timeouts are retried on the same node
/// - unavailable, overloaded and server errors move to the next node when
///   the statement is idempotent
/// - bootstrapping nodes never executed the statement, so the next node is
///   always tried
/// - write timeouts are retried only when idempotent; otherwise they are
///   rethrown, or ignored if configured
/// - client timeouts and transport failures move to the next node when
///   idempotent
///
/// Every decision becomes `Rethrow` once `max_retries` is reached.
#[derive(Debug, Clone)]
pub struct DefaultRetryPolicy {
    pub max_retries: u32,
    pub ignore_write_timeout_for_non_idempotent: bool,
}

impl Default for DefaultRetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            ignore_write_timeout_for_non_idempotent: false,
        }
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn decide(&self, error: &RetryErrorKind, retry_count: u32, idempotent: bool) -> RetryDecision {
        if error.is_fatal() {
            return RetryDecision::Rethrow;
        }

        let decision = match error {
            RetryErrorKind::Server(ServerErrorKind::ReadTimeout) => RetryDecision::RetrySameNode,
            RetryErrorKind::Server(ServerErrorKind::Bootstrapping) => RetryDecision::RetryNextNode,
            RetryErrorKind::Server(ServerErrorKind::WriteTimeout) if !idempotent => {
                if self.ignore_write_timeout_for_non_idempotent {
                    return RetryDecision::Ignore;
                }
                RetryDecision::Rethrow
            }
            _ if idempotent => RetryDecision::RetryNextNode,
            _ => RetryDecision::Rethrow,
        };

        if decision != RetryDecision::Rethrow && retry_count >= self.max_retries {
            return RetryDecision::Rethrow;
        }
        decision
    }
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallthroughRetryPolicy;

impl RetryPolicy for FallthroughRetryPolicy {
    fn decide(&self, _error: &RetryErrorKind, _retry_count: u32, _idempotent: bool) -> RetryDecision {
        RetryDecision::Rethrow
    }
}
