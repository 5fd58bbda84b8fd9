pub mod context;
pub mod error;
pub mod load_balancer;
pub mod node;
pub mod node_tracker;
pub mod orchestrator;
pub mod profile;
pub mod retry;
pub mod speculative;
pub mod token;

pub use context::{
    AlreadyResolved, AttemptOutcome, AttemptRecord, ExecutionContext, ExecutionOutcome, ExecutionPhase,
    ExecutionResult, ExecutionTrace,
};
pub use error::{AttemptError, ExecutionError, ExecutionErrorKind};
pub use load_balancer::{DefaultLoadBalancingPolicy, LoadBalancingPolicy, PlanHint, QueryPlan};
pub use node::{Distance, Node, NodeState};
pub use node_tracker::{NodeStateEvent, NodeTracker};
pub use orchestrator::Orchestrator;
pub use profile::{ExecutionProfile, ProfileRegistry};
pub use retry::{DefaultRetryPolicy, FallthroughRetryPolicy, RetryDecision, RetryErrorKind, RetryPolicy};
pub use speculative::{ConstantSpeculativeExecution, NoSpeculativeExecution, SpeculativeExecutionPolicy};
pub use token::{murmur3_token, TokenMap};
