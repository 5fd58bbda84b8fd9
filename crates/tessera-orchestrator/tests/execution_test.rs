//! Request execution against in-process mock nodes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tessera_common::config::{ContactPoint, DriverConfig, DEFAULT_PROFILE};
use tessera_common::protocol::{ExecutionOptions, Request, ServerErrorKind};
use tessera_common::testing::{Behavior, MockNode};
use tessera_common::transport::PassThroughCodec;
use tessera_metrics::MetricsRegistry;
use tessera_orchestrator::{
    AttemptError, AttemptOutcome, ConstantSpeculativeExecution, DefaultLoadBalancingPolicy, DefaultRetryPolicy,
    ExecutionErrorKind, ExecutionPhase, ExecutionProfile, FallthroughRetryPolicy, NodeTracker, Orchestrator,
    ProfileRegistry, RetryDecision, RetryErrorKind, RetryPolicy,
};

/// Returns the same decision for every error and counts how often it was asked.
struct FixedPolicy {
    decision: RetryDecision,
    calls: AtomicUsize,
}

impl FixedPolicy {
    fn new(decision: RetryDecision) -> Arc<Self> {
        Arc::new(Self {
            decision,
            calls: AtomicUsize::new(0),
        })
    }
}

impl RetryPolicy for FixedPolicy {
    fn decide(&self, _error: &RetryErrorKind, _retry_count: u32, _idempotent: bool) -> RetryDecision {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.decision
    }
}

fn profile() -> ExecutionProfile {
    ExecutionProfile {
        name: DEFAULT_PROFILE.to_string(),
        request_timeout: Duration::from_secs(5),
        attempt_timeout: Duration::from_secs(5),
        idempotent: true,
        ..Default::default()
    }
}

fn orchestrator(nodes: &[&MockNode], profile: ExecutionProfile) -> Arc<Orchestrator> {
    let mut config = DriverConfig::new(nodes.iter().map(|n| ContactPoint::new(n.addr())).collect());
    config.pool.connect_timeout_ms = 1000;
    config.pool.reconnect_base_delay_ms = 50;
    config.pool.reconnect_max_delay_ms = 200;

    let mut profiles = ProfileRegistry::new();
    profiles.insert(profile);

    Orchestrator::new(
        NodeTracker::new(&config),
        Arc::new(DefaultLoadBalancingPolicy::new()),
        Arc::new(PassThroughCodec),
        profiles,
        Arc::new(MetricsRegistry::new()),
    )
}

async fn stopped_node() -> MockNode {
    let node = MockNode::start(Behavior::Echo).await.unwrap();
    node.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;
    node
}

#[tokio::test]
async fn test_timeout_moves_to_next_node() {
    let n1 = stopped_node().await;
    let n2 = MockNode::start(Behavior::NeverRespond).await.unwrap();
    let n3 = MockNode::start(Behavior::Echo).await.unwrap();

    let orchestrator = orchestrator(
        &[&n1, &n2, &n3],
        ExecutionProfile {
            attempt_timeout: Duration::from_millis(200),
            ..profile()
        },
    );

    let result = orchestrator
        .execute(Request::query(&b"SELECT 1"[..]), ExecutionOptions::new())
        .await
        .unwrap();

    assert_eq!(result.coordinator, n3.addr());
    assert_eq!(&result.response.body[..], b"SELECT 1");
    assert!(!result.ignored);

    // the unreachable node is skipped without an attempt
    let trace = result.trace;
    assert_eq!(trace.nodes(), vec![n2.addr(), n3.addr()]);
    assert_eq!(
        trace.attempts[0].outcome,
        AttemptOutcome::Failed(AttemptError::Timeout(Duration::from_millis(200)))
    );
    assert_eq!(trace.attempts[0].decision, Some(RetryDecision::RetryNextNode));
    assert_eq!(trace.attempts[1].outcome, AttemptOutcome::Success);
    assert_eq!(trace.attempts[1].attempt, 2);

    let snapshot = orchestrator.metrics().snapshot();
    assert_eq!(snapshot.requests.submitted, 1);
    assert_eq!(snapshot.requests.succeeded, 1);
    assert_eq!(snapshot.requests.attempts, 2);
    assert_eq!(snapshot.requests.retries, 1);
}

#[tokio::test]
async fn test_down_node_is_left_out_of_plans() {
    let n1 = MockNode::start(Behavior::Echo).await.unwrap();
    let n2 = MockNode::start(Behavior::Echo).await.unwrap();
    let orchestrator = orchestrator(&[&n1, &n2], profile());

    assert!(orchestrator.tracker().mark_down(n1.addr()));
    for _ in 0..4 {
        let result = orchestrator
            .execute(Request::query(&b"q"[..]), ExecutionOptions::new())
            .await
            .unwrap();
        assert_eq!(result.coordinator, n2.addr());
    }
    assert_eq!(n1.request_count(), 0);
}

#[tokio::test]
async fn test_speculative_execution_wins() {
    let n1 = MockNode::start(Behavior::NeverRespond).await.unwrap();
    let n2 = MockNode::start(Behavior::Echo).await.unwrap();
    let n3 = MockNode::start(Behavior::Echo).await.unwrap();

    let orchestrator = orchestrator(
        &[&n1, &n2, &n3],
        profile().with_speculative_policy(Arc::new(ConstantSpeculativeExecution::new(Duration::from_millis(100), 2))),
    );

    let started = Instant::now();
    let result = orchestrator
        .execute(Request::query(&b"q"[..]), ExecutionOptions::new())
        .await
        .unwrap();

    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(result.coordinator, n2.addr());
    assert_eq!(result.trace.speculative_executions, 1);
    assert_eq!(result.trace.attempts.len(), 1);
    assert_eq!(result.trace.attempts[0].execution, 2);

    // the cap of two executions leaves the third node untouched
    assert_eq!(n1.request_count(), 1);
    assert_eq!(n2.request_count(), 1);
    assert_eq!(n3.request_count(), 0);
    assert_eq!(orchestrator.metrics().snapshot().requests.speculative_executions, 1);
}

#[tokio::test]
async fn test_non_idempotent_request_never_speculates() {
    let n1 = MockNode::start(Behavior::NeverRespond).await.unwrap();
    let n2 = MockNode::start(Behavior::Echo).await.unwrap();

    let orchestrator = orchestrator(
        &[&n1, &n2],
        ExecutionProfile {
            idempotent: false,
            ..profile()
        }
        .with_speculative_policy(Arc::new(ConstantSpeculativeExecution::new(Duration::from_millis(20), 2))),
    );

    let error = orchestrator
        .execute(
            Request::query(&b"q"[..]),
            ExecutionOptions::new().with_timeout(Duration::from_millis(300)),
        )
        .await
        .unwrap_err();

    assert_eq!(error.kind, ExecutionErrorKind::OverallTimeout(Duration::from_millis(300)));
    assert_eq!(error.trace.speculative_executions, 0);
    assert_eq!(n2.request_count(), 0);
}

#[tokio::test]
async fn test_rethrow_stops_execution() {
    let n1 = MockNode::start(Behavior::Error(ServerErrorKind::Overloaded, "busy".into())).await.unwrap();
    let n2 = MockNode::start(Behavior::Echo).await.unwrap();
    let n3 = MockNode::start(Behavior::Echo).await.unwrap();

    let orchestrator = orchestrator(
        &[&n1, &n2, &n3],
        profile().with_retry_policy(Arc::new(FallthroughRetryPolicy)),
    );

    let error = orchestrator
        .execute(Request::query(&b"q"[..]), ExecutionOptions::new())
        .await
        .unwrap_err();

    match &error.kind {
        ExecutionErrorKind::RethrownServerError { node, error } => {
            assert_eq!(*node, n1.addr());
            assert_eq!(error.kind, ServerErrorKind::Overloaded);
            assert_eq!(error.message, "busy");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(error.server_error_kind(), Some(ServerErrorKind::Overloaded));
    assert_eq!(error.trace.attempts.len(), 1);
    assert_eq!(error.trace.attempts[0].decision, Some(RetryDecision::Rethrow));
    assert_eq!(n2.request_count(), 0);
    assert_eq!(n3.request_count(), 0);
}

#[tokio::test]
async fn test_deadline_overrides_retry_policy() {
    let n1 = MockNode::start(Behavior::NeverRespond).await.unwrap();
    let n2 = MockNode::start(Behavior::NeverRespond).await.unwrap();

    let orchestrator = orchestrator(
        &[&n1, &n2],
        ExecutionProfile {
            request_timeout: Duration::from_millis(100),
            attempt_timeout: Duration::from_millis(30),
            max_same_node_retries: u32::MAX,
            ..profile()
        }
        .with_retry_policy(FixedPolicy::new(RetryDecision::RetrySameNode)),
    );

    let started = Instant::now();
    let error = orchestrator
        .execute(Request::query(&b"q"[..]), ExecutionOptions::new())
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(error.kind, ExecutionErrorKind::OverallTimeout(Duration::from_millis(100)));
    assert!(elapsed >= Duration::from_millis(100), "failed early after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(500), "failed late after {:?}", elapsed);
    assert!(error.trace.attempts.len() >= 2);
    assert!(error.trace.nodes().iter().all(|addr| *addr == n1.addr()));

    let snapshot = orchestrator.metrics().snapshot();
    assert_eq!(snapshot.requests.overall_timeouts, 1);
    assert_eq!(snapshot.errors.get("OverallTimeout"), Some(&1));
}

#[tokio::test]
async fn test_no_node_available() {
    let n1 = stopped_node().await;
    let n2 = stopped_node().await;
    let orchestrator = orchestrator(&[&n1, &n2], profile());

    let error = orchestrator
        .execute(Request::query(&b"q"[..]), ExecutionOptions::new())
        .await
        .unwrap_err();

    match &error.kind {
        ExecutionErrorKind::NoNodeAvailable(errors) => {
            let nodes: Vec<_> = errors.iter().map(|(addr, _)| *addr).collect();
            assert_eq!(nodes, vec![n1.addr(), n2.addr()]);
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(error.trace.attempts.is_empty());
}

#[tokio::test]
async fn test_write_timeout_ignored_for_writes_only() {
    let n1 = MockNode::start(Behavior::Error(ServerErrorKind::WriteTimeout, "timed out".into()))
        .await
        .unwrap();

    let orchestrator = orchestrator(
        &[&n1],
        ExecutionProfile {
            idempotent: false,
            ..profile()
        }
        .with_retry_policy(Arc::new(DefaultRetryPolicy {
            max_retries: 1,
            ignore_write_timeout_for_non_idempotent: true,
        })),
    );

    let result = orchestrator
        .execute(Request::write(&b"INSERT"[..]), ExecutionOptions::new())
        .await
        .unwrap();
    assert!(result.ignored);
    assert!(result.response.is_empty());
    assert_eq!(result.coordinator, n1.addr());
    assert_eq!(result.trace.attempts[0].decision, Some(RetryDecision::Ignore));

    // a statement returning rows cannot be ignored
    let error = orchestrator
        .execute(Request::query(&b"SELECT"[..]), ExecutionOptions::new())
        .await
        .unwrap_err();
    assert_eq!(error.server_error_kind(), Some(ServerErrorKind::WriteTimeout));
    assert_eq!(error.trace.attempts[0].decision, Some(RetryDecision::Rethrow));

    let snapshot = orchestrator.metrics().snapshot();
    assert_eq!(snapshot.requests.ignored, 1);
    assert_eq!(snapshot.requests.failed, 1);
}

#[tokio::test]
async fn test_validation_errors_bypass_retry_policy() {
    let n1 = MockNode::start(Behavior::Error(ServerErrorKind::Syntax, "line 1:0".into())).await.unwrap();
    let n2 = MockNode::start(Behavior::Echo).await.unwrap();

    let policy = FixedPolicy::new(RetryDecision::RetryNextNode);
    let orchestrator = orchestrator(&[&n1, &n2], profile().with_retry_policy(policy.clone()));

    let error = orchestrator
        .execute(Request::query(&b"SELEC"[..]), ExecutionOptions::new())
        .await
        .unwrap_err();

    assert_eq!(error.server_error_kind(), Some(ServerErrorKind::Syntax));
    assert_eq!(policy.calls.load(Ordering::SeqCst), 0);
    assert_eq!(n2.request_count(), 0);
}

#[tokio::test]
async fn test_transport_error_never_retries_same_node() {
    let n1 = MockNode::start(Behavior::CloseConnection).await.unwrap();
    let n2 = MockNode::start(Behavior::Echo).await.unwrap();

    let orchestrator = orchestrator(
        &[&n1, &n2],
        profile().with_retry_policy(FixedPolicy::new(RetryDecision::RetrySameNode)),
    );

    let result = orchestrator
        .execute(Request::query(&b"q"[..]), ExecutionOptions::new())
        .await
        .unwrap();

    assert_eq!(result.coordinator, n2.addr());
    let first = &result.trace.attempts[0];
    assert_eq!(first.node, n1.addr());
    assert!(matches!(first.outcome, AttemptOutcome::Failed(AttemptError::Transport(_))));
    assert_eq!(first.decision, Some(RetryDecision::RetryNextNode));
}

#[tokio::test]
async fn test_same_node_retries_are_capped() {
    let n1 = MockNode::start(Behavior::Echo).await.unwrap();
    let n2 = MockNode::start(Behavior::Echo).await.unwrap();
    n1.enqueue(Behavior::Error(ServerErrorKind::ReadTimeout, "1".into()));
    n1.enqueue(Behavior::Error(ServerErrorKind::ReadTimeout, "2".into()));

    let orchestrator = orchestrator(
        &[&n1, &n2],
        ExecutionProfile {
            max_same_node_retries: 1,
            ..profile()
        }
        .with_retry_policy(FixedPolicy::new(RetryDecision::RetrySameNode)),
    );

    let result = orchestrator
        .execute(Request::query(&b"q"[..]), ExecutionOptions::new())
        .await
        .unwrap();

    assert_eq!(result.trace.nodes(), vec![n1.addr(), n1.addr(), n2.addr()]);
    let decisions: Vec<_> = result.trace.attempts.iter().map(|a| a.decision).collect();
    assert_eq!(
        decisions,
        vec![Some(RetryDecision::RetrySameNode), Some(RetryDecision::RetryNextNode), None]
    );
}

#[tokio::test]
async fn test_cancel_fails_request() {
    let n1 = MockNode::start(Behavior::NeverRespond).await.unwrap();
    let orchestrator = orchestrator(&[&n1], profile());

    let options = ExecutionOptions::new();
    let (ctx, rx) = orchestrator.begin(&options);
    let task = tokio::spawn(orchestrator.clone().run(ctx.clone(), Request::query(&b"q"[..]), options));

    tokio::time::sleep(Duration::from_millis(100)).await;
    ctx.cancel();

    let error = rx.await.unwrap().unwrap_err();
    assert_eq!(error.kind, ExecutionErrorKind::Cancelled);
    assert_eq!(ctx.phase(), ExecutionPhase::Failed);
    task.await.unwrap();
    assert_eq!(orchestrator.metrics().snapshot().requests.cancelled, 1);
}

#[tokio::test]
async fn test_unknown_profile_is_invalid() {
    let n1 = MockNode::start(Behavior::Echo).await.unwrap();
    let orchestrator = orchestrator(&[&n1], profile());

    let error = orchestrator
        .execute(
            Request::query(&b"q"[..]),
            ExecutionOptions::new().with_execution_profile("reporting"),
        )
        .await
        .unwrap_err();

    assert!(matches!(error.kind, ExecutionErrorKind::InvalidRequest(_)));
    assert_eq!(n1.request_count(), 0);
}

#[tokio::test]
async fn test_routing_key_targets_replica() {
    let n1 = MockNode::start(Behavior::Echo).await.unwrap();
    let n2 = MockNode::start(Behavior::Echo).await.unwrap();

    let key = b"user:42";
    let token = tessera_orchestrator::murmur3_token(key);
    let mut config = DriverConfig::new(vec![
        ContactPoint::new(n1.addr()).with_tokens(vec![token.wrapping_add(1000)]),
        ContactPoint::new(n2.addr()).with_tokens(vec![token]),
    ]);
    config.pool.connect_timeout_ms = 1000;

    let mut profiles = ProfileRegistry::new();
    profiles.insert(profile());
    let orchestrator = Orchestrator::new(
        NodeTracker::new(&config),
        Arc::new(DefaultLoadBalancingPolicy::new()),
        Arc::new(PassThroughCodec),
        profiles,
        Arc::new(MetricsRegistry::new()),
    );

    for _ in 0..3 {
        let result = orchestrator
            .execute(
                Request::query(&b"q"[..]),
                ExecutionOptions::new().with_routing_key(&key[..]),
            )
            .await
            .unwrap();
        assert_eq!(result.coordinator, n2.addr());
    }
}
