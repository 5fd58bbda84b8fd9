//! Session lifecycle against in-process mock nodes.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tessera_client::Session;
use tessera_common::config::{ContactPoint, DriverConfig};
use tessera_common::protocol::{ExecutionOptions, Request};
use tessera_common::testing::{Behavior, MockNode};
use tessera_orchestrator::{ExecutionErrorKind, NodeState};

fn config(nodes: &[&MockNode]) -> DriverConfig {
    let mut config = DriverConfig::new(nodes.iter().map(|n| ContactPoint::new(n.addr())).collect());
    config.pool.connect_timeout_ms = 500;
    config.pool.reconnect_base_delay_ms = 50;
    config.pool.reconnect_max_delay_ms = 200;
    config.scheduler.shutdown_quiet_period_ms = 100;
    config.scheduler.shutdown_timeout_ms = 1000;
    config
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn test_execute_round_trip() {
    let node = MockNode::start(Behavior::Respond(Bytes::from_static(b"rows"))).await.unwrap();
    let session = Session::connect(config(&[&node])).await.unwrap();

    assert_eq!(session.nodes()[0].state(), NodeState::Up);

    let result = session
        .execute(Request::query(&b"SELECT 1"[..]), ExecutionOptions::new())
        .await
        .unwrap();
    assert_eq!(&result.response.body[..], b"rows");
    assert_eq!(result.coordinator, node.addr());

    let metrics = session.metrics();
    assert_eq!(metrics.requests.submitted, 1);
    assert_eq!(metrics.requests.succeeded, 1);
    assert_eq!(metrics.nodes[&node.addr().to_string()].successes, 1);

    let report = session.close().await;
    assert!(report.is_clean(), "{:?}", report);
}

#[tokio::test]
async fn test_connect_fails_without_reachable_node() {
    let node = MockNode::start(Behavior::Echo).await.unwrap();
    node.stop();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let error = Session::connect(config(&[&node])).await.unwrap_err();
    assert!(error.to_string().contains("could be reached"));
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let error = Session::connect(DriverConfig::default()).await.unwrap_err();
    assert!(error.to_string().contains("contact point"));
}

#[tokio::test]
async fn test_submit_after_close_fails() {
    let node = MockNode::start(Behavior::Echo).await.unwrap();
    let session = Session::connect(config(&[&node])).await.unwrap();

    let first = session.close().await;
    let second = session.close().await;
    assert_eq!(first, second);
    assert!(session.is_closed());

    let error = session
        .execute(Request::query(&b"q"[..]), ExecutionOptions::new())
        .await
        .unwrap_err();
    assert_eq!(error.kind, ExecutionErrorKind::SessionClosed);
    assert_eq!(node.request_count(), 0);
}

#[tokio::test]
async fn test_cancel_and_drop() {
    let node = MockNode::start(Behavior::NeverRespond).await.unwrap();
    let session = Session::connect(config(&[&node])).await.unwrap();

    let pending = session.submit(Request::query(&b"q"[..]), ExecutionOptions::new());
    assert!(eventually(|| node.request_count() == 1).await);
    pending.cancel();
    let error = pending.await.unwrap_err();
    assert_eq!(error.kind, ExecutionErrorKind::Cancelled);

    let dropped = session.submit(Request::query(&b"q"[..]), ExecutionOptions::new());
    assert!(eventually(|| node.request_count() == 2).await);
    drop(dropped);
    assert!(eventually(|| session.metrics().requests.cancelled == 2).await);

    session.close().await;
}

#[tokio::test]
async fn test_close_respects_hard_timeout() {
    let node = MockNode::start(Behavior::NeverRespond).await.unwrap();
    let session = Session::connect(config(&[&node])).await.unwrap();

    let pending = session.submit(
        Request::query(&b"q"[..]),
        ExecutionOptions::new().with_timeout(Duration::from_secs(60)),
    );
    assert!(eventually(|| node.request_count() == 1).await);

    let started = Instant::now();
    let report = session.close().await;
    assert!(started.elapsed() < Duration::from_millis(1500), "close took {:?}", started.elapsed());

    // the request outlived the quiet period and was aborted
    assert!(!report.is_clean());
    assert_eq!(report.failed[0].0, "scheduler");

    let error = pending.await.unwrap_err();
    assert_eq!(error.kind, ExecutionErrorKind::SessionClosed);
}

#[tokio::test]
async fn test_node_administration() {
    let n1 = MockNode::start(Behavior::Echo).await.unwrap();
    let n2 = MockNode::start(Behavior::Echo).await.unwrap();
    let session = Session::connect(config(&[&n1, &n2])).await.unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    session.on_node_event(move |event| sink.lock().unwrap().push(event));

    assert!(session.mark_node_down(n1.addr()));
    for _ in 0..3 {
        let result = session
            .execute(Request::query(&b"q"[..]), ExecutionOptions::new())
            .await
            .unwrap();
        assert_eq!(result.coordinator, n2.addr());
    }

    // the pool is connected, so the node may come back
    assert!(session.mark_node_up(n1.addr()));

    assert!(session.remove_node(n2.addr()).await);
    assert!(!session.remove_node(n2.addr()).await);
    assert_eq!(session.nodes().len(), 1);
    assert!(!session.metrics().nodes.contains_key(&n2.addr().to_string()));

    let n3 = MockNode::start(Behavior::Echo).await.unwrap();
    session.add_node(ContactPoint::new(n3.addr()));
    assert_eq!(session.nodes().len(), 2);

    assert!(eventually(|| seen.lock().unwrap().len() >= 3).await);
    let states: Vec<NodeState> = seen.lock().unwrap().iter().map(|e| e.current).collect();
    assert_eq!(&states[..3], &[NodeState::Down, NodeState::Up, NodeState::Removed]);

    session.close().await;
}

#[tokio::test]
async fn test_deadline_holds_while_waiting_for_a_worker() {
    let node = MockNode::start(Behavior::NeverRespond).await.unwrap();
    let mut config = config(&[&node]);
    config.scheduler.worker_pool_size = 1;
    let session = Session::connect(config).await.unwrap();

    // holds the only worker
    let blocking = session.submit(
        Request::query(&b"q"[..]),
        ExecutionOptions::new().with_timeout(Duration::from_secs(2)),
    );
    assert!(eventually(|| node.request_count() == 1).await);

    let started = Instant::now();
    let error = session
        .execute(
            Request::query(&b"q"[..]),
            ExecutionOptions::new().with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert_eq!(error.kind, ExecutionErrorKind::OverallTimeout(Duration::from_millis(100)));
    assert!(started.elapsed() < Duration::from_millis(800), "took {:?}", started.elapsed());
    assert!(error.trace.attempts.is_empty());

    let queued = session.submit(
        Request::query(&b"q"[..]),
        ExecutionOptions::new().with_timeout(Duration::from_secs(30)),
    );
    queued.cancel();
    let started = Instant::now();
    assert_eq!(queued.await.unwrap_err().kind, ExecutionErrorKind::Cancelled);
    assert!(started.elapsed() < Duration::from_millis(800));

    // neither queued request reached the node
    assert_eq!(node.request_count(), 1);
    let metrics = session.metrics();
    assert_eq!(metrics.requests.submitted, 3);
    assert_eq!(metrics.requests.overall_timeouts, 1);
    assert_eq!(metrics.requests.cancelled, 1);

    blocking.cancel();
    session.close().await;
}
