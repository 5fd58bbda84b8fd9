//! Connection pool lifecycle against an in-process mock node.

use std::time::Duration;

use bytes::Bytes;
use tessera_common::auth::AuthConfig;
use tessera_common::protocol::Opcode;
use tessera_common::testing::{Behavior, MockNode};
use tessera_pool::{ChannelConfig, ConnectionPool, PoolConfig, PoolError, PoolEvent, PoolState};
use tokio::sync::mpsc;

fn config(size: usize) -> PoolConfig {
    PoolConfig {
        size,
        channel: ChannelConfig {
            connect_timeout: Duration::from_secs(1),
            ..Default::default()
        },
        reconnect_base_delay: Duration::from_millis(20),
        reconnect_max_delay: Duration::from_millis(100),
    }
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
async fn test_pool_fills_to_target_size() {
    let node = MockNode::start(Behavior::Echo).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let pool = ConnectionPool::new(node.addr(), config(3), None, Some(tx));

    let channel = pool.acquire().await.unwrap();
    let reply = channel.send(Opcode::Query, Bytes::from_static(b"hi")).unwrap();
    assert_eq!(&reply.wait(Duration::from_secs(1)).await.unwrap().body[..], b"hi");

    assert!(eventually(|| pool.size() == 3).await);
    assert_eq!(pool.state(), PoolState::Ready);
    assert_eq!(node.connection_count(), 3);

    // only the first channel crosses zero
    assert_eq!(rx.recv().await, Some(PoolEvent::Up(node.addr())));
    assert!(rx.try_recv().is_err());

    pool.close().await;
}

#[tokio::test]
async fn test_acquire_prefers_least_busy_channel() {
    let node = MockNode::start(Behavior::NeverRespond).await.unwrap();
    let pool = ConnectionPool::new(node.addr(), config(2), None, None);
    assert!(eventually(|| pool.size() == 2).await);

    let first = pool.acquire().await.unwrap();
    let _held = [
        first.send(Opcode::Query, Bytes::new()).unwrap(),
        first.send(Opcode::Query, Bytes::new()).unwrap(),
    ];

    let second = pool.acquire().await.unwrap();
    assert_ne!(first.id(), second.id());
    assert_eq!(second.in_flight(), 0);

    pool.force_close();
}

#[tokio::test]
async fn test_saturated_pool_is_busy() {
    let node = MockNode::start(Behavior::NeverRespond).await.unwrap();
    let mut pool_config = config(1);
    pool_config.channel.max_streams = 1;
    let pool = ConnectionPool::new(node.addr(), pool_config, None, None);

    let channel = pool.acquire().await.unwrap();
    let _held = channel.send(Opcode::Query, Bytes::new()).unwrap();

    assert_eq!(pool.acquire().await.unwrap_err(), PoolError::Busy(node.addr()));
    assert_eq!(pool.in_flight(), 1);

    pool.force_close();
}

#[tokio::test]
async fn test_down_once_then_up_once_after_reconnect() {
    let node = MockNode::start(Behavior::Echo).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let pool = ConnectionPool::new(node.addr(), config(2), None, Some(tx));

    assert_eq!(rx.recv().await, Some(PoolEvent::Up(node.addr())));
    assert!(eventually(|| pool.size() == 2).await);

    node.stop();
    assert_eq!(rx.recv().await, Some(PoolEvent::Down(node.addr())));
    assert_eq!(pool.state(), PoolState::Unavailable);
    assert!(matches!(pool.acquire().await, Err(PoolError::Unavailable { .. })));

    // several failed reconnection attempts pass without another event
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(rx.try_recv().is_err());

    node.restart().await.unwrap();
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap(),
        Some(PoolEvent::Up(node.addr()))
    );
    assert!(eventually(|| pool.size() == 2).await);
    assert!(rx.try_recv().is_err());
    assert!(pool.acquire().await.is_ok());

    pool.close().await;
}

#[tokio::test]
async fn test_authentication_failure_keeps_pool_unusable() {
    let node = MockNode::start_with_auth(Behavior::Echo, AuthConfig::with_credentials("app", "secret"))
        .await
        .unwrap();
    let credentials = AuthConfig::with_credentials("app", "guess");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let pool = ConnectionPool::new(node.addr(), config(1), credentials.authenticator(), Some(tx));

    assert_eq!(pool.ready().await, PoolState::Unavailable);
    assert_eq!(rx.recv().await, Some(PoolEvent::Down(node.addr())));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.size(), 0);
    match pool.acquire().await {
        Err(PoolError::Unavailable { reason, .. }) => assert!(reason.contains("Authentication")),
        other => panic!("expected Unavailable, got {:?}", other),
    }
    assert!(rx.try_recv().is_err());

    pool.close().await;
}

#[tokio::test]
async fn test_close_waits_for_every_channel() {
    let node = MockNode::start(Behavior::Delay(Duration::from_millis(50), Bytes::new()))
        .await
        .unwrap();
    let pool = ConnectionPool::new(node.addr(), config(2), None, None);
    assert!(eventually(|| pool.size() == 2).await);

    let channel = pool.acquire().await.unwrap();
    let pending = channel.send(Opcode::Query, Bytes::new()).unwrap();

    tokio::time::timeout(Duration::from_secs(2), pool.close()).await.unwrap();
    assert!(channel.is_closed());
    assert_eq!(pool.state(), PoolState::Closed);
    assert!(pending.wait(Duration::from_secs(1)).await.is_ok());

    // closing again is a no-op
    pool.close().await;
    assert_eq!(pool.acquire().await.unwrap_err(), PoolError::Closed(node.addr()));
}
