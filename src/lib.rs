//! Tessera
//!
//! A driver-side request execution engine for clustered databases: pooled,
//! multiplexed connections per node, token-aware query plans, retries and
//! speculative executions bounded by a per-request deadline.
//!
//! This crate re-exports the public surface of the workspace crates so an
//! application only needs one dependency.
//!
//! # Example
//!
//! ```rust,no_run
//! use tessera::{ContactPoint, DriverConfig, ExecutionOptions, Request, Session};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DriverConfig::new(vec![ContactPoint::new("127.0.0.1:9042".parse()?)]);
//! let session = Session::connect(config).await?;
//!
//! let result = session
//!     .execute(Request::query("SELECT 1"), ExecutionOptions::new().with_routing_key(&b"user:42"[..]))
//!     .await?;
//! println!("answered by {} after {} attempts", result.coordinator, result.trace.attempts.len());
//!
//! session.close().await;
//! # Ok(())
//! # }
//! ```

pub use tessera_client::{ResponseFuture, Session, SessionBuilder};
pub use tessera_common::auth::{AuthConfig, Authenticator, Credentials, PlainTextAuthenticator};
pub use tessera_common::config::{
    ConfigError, ContactPoint, DriverConfig, PoolSettings, ProfileSettings, SchedulerSettings,
};
pub use tessera_common::protocol::{
    ErrorClass, ExecutionOptions, Opcode, ProtocolError, Request, Response, Result, ServerError, ServerErrorKind,
    TesseraError,
};
pub use tessera_common::transport::{EncodeContext, PassThroughCodec, PayloadCodec};
pub use tessera_metrics::{LatencySummary, MetricsSnapshot, NodeMetrics, RequestMetrics};
pub use tessera_orchestrator::{
    AttemptError, AttemptOutcome, AttemptRecord, ConstantSpeculativeExecution, DefaultLoadBalancingPolicy,
    DefaultRetryPolicy, Distance, ExecutionError, ExecutionErrorKind, ExecutionOutcome, ExecutionPhase,
    ExecutionProfile, ExecutionResult, ExecutionTrace, FallthroughRetryPolicy, LoadBalancingPolicy,
    NoSpeculativeExecution, Node, NodeState, NodeStateEvent, PlanHint, QueryPlan, RetryDecision, RetryErrorKind,
    RetryPolicy, SpeculativeExecutionPolicy,
};
pub use tessera_runtime::ShutdownReport;

/// Lower-level building blocks, for embedding the engine without a session.
pub mod engine {
    pub use tessera_metrics::MetricsRegistry;
    pub use tessera_orchestrator::{ExecutionContext, NodeTracker, Orchestrator, ProfileRegistry, TokenMap};
    pub use tessera_pool::{Channel, ChannelConfig, ChannelError, ConnectionPool, PoolConfig, PoolEvent, PoolState};
    pub use tessera_runtime::{Scheduler, SchedulerConfig};
}
