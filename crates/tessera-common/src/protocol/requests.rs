use std::time::Duration;

use bytes::Bytes;

use super::frame::Opcode;

/// A statement submitted by the caller.
///
/// The body is opaque to the engine: it was produced by the payload codec of
/// the embedding application and is written to the wire untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub opcode: Opcode,
    pub body: Bytes,
    /// Whether the statement produces rows. Errors on statements that do not
    /// may be ignored by the retry policy.
    pub returns_rows: bool,
}

impl Request {
    /// A QUERY statement expected to return rows.
    pub fn query(body: impl Into<Bytes>) -> Self {
        Self {
            opcode: Opcode::Query,
            body: body.into(),
            returns_rows: true,
        }
    }

    /// An EXECUTE of a prepared statement.
    pub fn execute(body: impl Into<Bytes>) -> Self {
        Self {
            opcode: Opcode::Execute,
            body: body.into(),
            returns_rows: true,
        }
    }

    /// A BATCH of writes. Batches never return rows.
    pub fn batch(body: impl Into<Bytes>) -> Self {
        Self {
            opcode: Opcode::Batch,
            body: body.into(),
            returns_rows: false,
        }
    }

    /// A write issued as a QUERY (INSERT/UPDATE/DELETE without result rows).
    pub fn write(body: impl Into<Bytes>) -> Self {
        Self::query(body).with_returns_rows(false)
    }

    pub fn with_returns_rows(mut self, returns_rows: bool) -> Self {
        self.returns_rows = returns_rows;
        self
    }
}

/// Per-request execution options.
///
/// Unset fields fall back to the selected execution profile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Overall deadline for the request, across every attempt.
    pub timeout: Option<Duration>,
    pub idempotent: Option<bool>,
    /// Partition key bytes used for token-aware routing.
    pub routing_key: Option<Bytes>,
    /// Name of the execution profile; `None` selects the default profile.
    pub execution_profile: Option<String>,
    pub page_size: Option<u32>,
}

impl ExecutionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = Some(idempotent);
        self
    }

    pub fn with_routing_key(mut self, key: impl Into<Bytes>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    pub fn with_execution_profile(mut self, profile: impl Into<String>) -> Self {
        self.execution_profile = Some(profile.into());
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = Some(page_size);
        self
    }
}
