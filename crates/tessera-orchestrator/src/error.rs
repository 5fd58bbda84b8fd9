use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use tessera_common::protocol::{ServerError, ServerErrorKind};

use crate::context::ExecutionTrace;
use crate::retry::RetryErrorKind;

/// Failure of a single attempt on one node.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Transport failure: {0}")]
    Transport(String),

    #[error("{0}")]
    Server(ServerError),
}

impl AttemptError {
    pub fn retry_kind(&self) -> RetryErrorKind {
        match self {
            AttemptError::Timeout(_) => RetryErrorKind::ClientTimeout,
            AttemptError::Transport(_) => RetryErrorKind::Transport,
            AttemptError::Server(error) => RetryErrorKind::Server(error.kind),
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, AttemptError::Transport(_))
    }
}

fn describe(errors: &[(SocketAddr, String)]) -> String {
    if errors.is_empty() {
        return "no node was tried".to_string();
    }
    errors
        .iter()
        .map(|(addr, error)| format!("{}: {}", addr, error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Why a request failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionErrorKind {
    /// Every node of the plan was tried or unusable; carries one entry per failure
    #[error("No node available ({})", describe(.0))]
    NoNodeAvailable(Vec<(SocketAddr, String)>),

    #[error("Request did not complete within {0:?}")]
    OverallTimeout(Duration),

    #[error("Node {node} answered {error}")]
    RethrownServerError { node: SocketAddr, error: ServerError },

    #[error("Attempt on {node} failed: {error}")]
    AttemptFailed { node: SocketAddr, error: AttemptError },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Session is closed")]
    SessionClosed,
}

impl ExecutionErrorKind {
    /// Stable name used as the metrics key.
    pub fn name(&self) -> &'static str {
        match self {
            ExecutionErrorKind::NoNodeAvailable(_) => "NoNodeAvailable",
            ExecutionErrorKind::OverallTimeout(_) => "OverallTimeout",
            ExecutionErrorKind::RethrownServerError { .. } => "RethrownServerError",
            ExecutionErrorKind::AttemptFailed { .. } => "AttemptFailed",
            ExecutionErrorKind::Cancelled => "Cancelled",
            ExecutionErrorKind::InvalidRequest(_) => "InvalidRequest",
            ExecutionErrorKind::SessionClosed => "SessionClosed",
        }
    }
}

/// A failed request with the attempts it went through.
#[derive(Error, Debug, Clone)]
#[error("{kind}")]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub trace: ExecutionTrace,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, trace: ExecutionTrace) -> Self {
        Self { kind, trace }
    }

    /// Error raised before any attempt was made.
    pub fn untraced(kind: ExecutionErrorKind) -> Self {
        Self::new(kind, ExecutionTrace::default())
    }

    /// Server error kind, when the request failed on a rethrown server error.
    pub fn server_error_kind(&self) -> Option<ServerErrorKind> {
        match &self.kind {
            ExecutionErrorKind::RethrownServerError { error, .. } => Some(error.kind),
            _ => None,
        }
    }
}
