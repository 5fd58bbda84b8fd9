use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tessera_common::auth::Authenticator;
use tessera_common::config::{ContactPoint, DriverConfig, PoolSettings};
use tessera_pool::{ConnectionPool, PoolConfig, PoolEvent, PoolState};

use crate::node::{Distance, Node, NodeState};
use crate::token::TokenMap;

/// A node changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStateEvent {
    pub addr: SocketAddr,
    pub previous: NodeState,
    pub current: NodeState,
}

/// Registry of known nodes and their health.
///
/// Nodes go `UNKNOWN -> UP` on their first successful connection, `UP ->
/// DOWN` when their pool loses its last channel or on an external signal,
/// and `DOWN -> UP` once the pool reconnects. `REMOVED` is terminal. Pools
/// are created lazily, the first time a node is used.
pub struct NodeTracker {
    nodes: RwLock<Vec<Arc<Node>>>,
    tokens: RwLock<Arc<TokenMap>>,
    local_datacenter: Option<String>,
    allow_remote: bool,
    replication_factor: usize,
    pool_settings: PoolSettings,
    authenticator: Option<Arc<dyn Authenticator>>,
    pool_events: mpsc::UnboundedSender<PoolEvent>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<NodeStateEvent>>>,
    /// Pool events applied so far
    applied: watch::Sender<u64>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl NodeTracker {
    /// Registers the contact points of `config`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: &DriverConfig) -> Arc<Self> {
        let (pool_events, events_rx) = mpsc::unbounded_channel();

        let tracker = Arc::new(Self {
            nodes: RwLock::new(Vec::new()),
            tokens: RwLock::new(Arc::new(TokenMap::default())),
            local_datacenter: config.local_datacenter.clone(),
            allow_remote: config.allow_remote_datacenters,
            replication_factor: config.replication_factor,
            pool_settings: config.pool.clone(),
            authenticator: config.auth.authenticator(),
            pool_events,
            listeners: Mutex::new(Vec::new()),
            applied: watch::channel(0).0,
            event_loop: Mutex::new(None),
        });

        for contact in &config.contact_points {
            tracker.add_node(contact.clone());
        }

        let handle = tokio::spawn(event_loop(Arc::downgrade(&tracker), events_rx));
        *tracker.event_loop.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
        tracker
    }

    fn distance_of(&self, datacenter: Option<&str>) -> Distance {
        match (&self.local_datacenter, datacenter) {
            (None, _) => Distance::Local,
            (Some(local), Some(dc)) if local == dc => Distance::Local,
            _ if self.allow_remote => Distance::Remote,
            _ => Distance::Ignored,
        }
    }

    fn rebuild_tokens(&self, nodes: &[Arc<Node>]) {
        let map = TokenMap::new(nodes.iter().map(|n| (n.addr(), n.tokens())), self.replication_factor);
        *self.tokens.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(map);
    }

    /// Adds a node, or returns the existing one with the same address.
    pub fn add_node(&self, contact: ContactPoint) -> Arc<Node> {
        let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = nodes.iter().find(|n| n.addr() == contact.address) {
            return existing.clone();
        }

        let distance = self.distance_of(contact.datacenter.as_deref());
        let node = Arc::new(Node::new(contact.address, contact.datacenter, contact.tokens, distance));
        nodes.push(node.clone());
        self.rebuild_tokens(&nodes);

        info!(node = %node.addr(), ?distance, "Node added");
        node
    }

    /// Removes a node and closes its pool. Later events for it are ignored.
    pub async fn remove_node(&self, addr: SocketAddr) -> bool {
        let removed = {
            let mut nodes = self.nodes.write().unwrap_or_else(PoisonError::into_inner);
            let Some(index) = nodes.iter().position(|n| n.addr() == addr) else {
                return false;
            };
            let node = nodes.remove(index);
            self.rebuild_tokens(&nodes);
            node
        };

        self.transition(&removed, NodeState::Removed);
        if let Some(pool) = removed.pool() {
            pool.close().await;
        }
        true
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn node(&self, addr: SocketAddr) -> Option<Arc<Node>> {
        self.nodes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|n| n.addr() == addr)
            .cloned()
    }

    pub fn token_map(&self) -> Arc<TokenMap> {
        self.tokens.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// The node's pool, created on first use. `None` for removed or ignored
    /// nodes.
    pub fn pool(&self, node: &Node) -> Option<ConnectionPool> {
        if node.distance() == Distance::Ignored || node.state() == NodeState::Removed {
            return None;
        }
        let pool = node.pool_or_init(|| {
            let config = PoolConfig::from_settings(&self.pool_settings, node.distance() == Distance::Local);
            ConnectionPool::new(
                node.addr(),
                config,
                self.authenticator.clone(),
                Some(self.pool_events.clone()),
            )
        });
        Some(pool.clone())
    }

    /// Opens the pools of every known node and waits until each has
    /// connected or failed, and its node state reflects it, up to `timeout`.
    /// Returns the number of nodes up.
    pub async fn connect_all(&self, timeout: Duration) -> usize {
        let pools: Vec<ConnectionPool> = self.nodes().iter().filter_map(|n| self.pool(n)).collect();
        let mut applied = self.applied.subscribe();

        let settled = async {
            join_all(pools.iter().map(ConnectionPool::ready)).await;
            loop {
                applied.borrow_and_update();
                if self.states_match_pools() || applied.changed().await.is_err() {
                    return;
                }
            }
        };
        let _ = tokio::time::timeout(timeout, settled).await;

        self.nodes().iter().filter(|n| n.state() == NodeState::Up).count()
    }

    /// Every pool event emitted so far has been applied to its node.
    fn states_match_pools(&self) -> bool {
        self.nodes().iter().all(|node| match node.pool().map(ConnectionPool::state) {
            Some(PoolState::Ready) => node.state() != NodeState::Unknown,
            Some(PoolState::Unavailable) => matches!(node.state(), NodeState::Down | NodeState::Removed),
            _ => true,
        })
    }

    /// External signal that a node is down. Honoured until its pool
    /// reconnects or [`mark_up`](Self::mark_up) is called.
    pub fn mark_down(&self, addr: SocketAddr) -> bool {
        match self.node(addr) {
            Some(node) => {
                self.transition(&node, NodeState::Down);
                node.state() == NodeState::Down
            }
            None => false,
        }
    }

    /// External signal that a node is back. Refused while its pool has no
    /// usable channel.
    pub fn mark_up(&self, addr: SocketAddr) -> bool {
        let Some(node) = self.node(addr) else {
            return false;
        };
        if let Some(pool) = node.pool() {
            if pool.state() != PoolState::Ready {
                warn!(node = %addr, state = ?pool.state(), "Ignoring up signal, pool has no usable channel");
                return false;
            }
        }
        self.transition(&node, NodeState::Up);
        node.state() == NodeState::Up
    }

    /// Receives every state transition from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<NodeStateEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).push(tx);
        rx
    }

    /// Pools created so far.
    pub fn pools(&self) -> Vec<ConnectionPool> {
        self.nodes().iter().filter_map(|n| n.pool().cloned()).collect()
    }

    /// Stops processing pool events.
    pub fn shutdown(&self) {
        if let Some(handle) = self.event_loop.lock().unwrap_or_else(PoisonError::into_inner).take() {
            handle.abort();
        }
    }

    fn transition(&self, node: &Node, next: NodeState) {
        let Some(previous) = node.transition(next) else {
            return;
        };

        match next {
            NodeState::Down => warn!(node = %node.addr(), %previous, "Node is DOWN"),
            _ => info!(node = %node.addr(), %previous, current = %next, "Node state changed"),
        }

        let event = NodeStateEvent {
            addr: node.addr(),
            previous,
            current: next,
        };
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|listener| listener.send(event).is_ok());
    }

    fn on_pool_event(&self, event: PoolEvent) {
        let (addr, next) = match event {
            PoolEvent::Up(addr) => (addr, NodeState::Up),
            PoolEvent::Down(addr) => (addr, NodeState::Down),
        };
        match self.node(addr) {
            Some(node) => self.transition(&node, next),
            None => debug!(node = %addr, ?event, "Pool event for unknown node"),
        }
        self.applied.send_modify(|count| *count += 1);
    }
}

impl std::fmt::Debug for NodeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeTracker")
            .field("nodes", &self.nodes())
            .field("local_datacenter", &self.local_datacenter)
            .finish()
    }
}

async fn event_loop(tracker: Weak<NodeTracker>, mut events: mpsc::UnboundedReceiver<PoolEvent>) {
    while let Some(event) = events.recv().await {
        let Some(tracker) = tracker.upgrade() else {
            return;
        };
        tracker.on_pool_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn config() -> DriverConfig {
        let mut config = DriverConfig::new(vec![
            ContactPoint::new(addr(1)).with_datacenter("dc1").with_tokens(vec![0]),
            ContactPoint::new(addr(2)).with_datacenter("dc2").with_tokens(vec![100]),
            ContactPoint::new(addr(3)),
        ]);
        config.local_datacenter = Some("dc1".to_string());
        config
    }

    #[tokio::test]
    async fn test_distances() {
        let tracker = NodeTracker::new(&config());
        assert_eq!(tracker.node(addr(1)).unwrap().distance(), Distance::Local);
        assert_eq!(tracker.node(addr(2)).unwrap().distance(), Distance::Remote);
        assert_eq!(tracker.node(addr(3)).unwrap().distance(), Distance::Remote);

        let mut local_only = config();
        local_only.allow_remote_datacenters = false;
        let tracker = NodeTracker::new(&local_only);
        let ignored = tracker.node(addr(2)).unwrap();
        assert_eq!(ignored.distance(), Distance::Ignored);
        assert!(tracker.pool(&ignored).is_none());
    }

    #[tokio::test]
    async fn test_add_and_remove() {
        let tracker = NodeTracker::new(&config());
        assert_eq!(tracker.nodes().len(), 3);
        assert_eq!(tracker.token_map().replicas(50), vec![addr(2)]);

        let again = tracker.add_node(ContactPoint::new(addr(1)));
        assert_eq!(again.datacenter(), Some("dc1"));
        assert_eq!(tracker.nodes().len(), 3);

        let mut events = tracker.subscribe();
        assert!(tracker.remove_node(addr(2)).await);
        assert!(!tracker.remove_node(addr(2)).await);
        assert_eq!(tracker.nodes().len(), 2);
        assert_eq!(tracker.token_map().replicas(50), vec![addr(1)]);

        assert_eq!(
            events.recv().await,
            Some(NodeStateEvent {
                addr: addr(2),
                previous: NodeState::Unknown,
                current: NodeState::Removed
            })
        );
    }

    #[tokio::test]
    async fn test_pool_events_drive_state() {
        let tracker = NodeTracker::new(&config());
        let mut events = tracker.subscribe();

        tracker.on_pool_event(PoolEvent::Up(addr(1)));
        tracker.on_pool_event(PoolEvent::Down(addr(1)));
        tracker.on_pool_event(PoolEvent::Down(addr(1)));
        tracker.on_pool_event(PoolEvent::Up(addr(1)));

        let states: Vec<NodeState> = std::iter::from_fn(|| events.try_recv().ok()).map(|e| e.current).collect();
        assert_eq!(states, vec![NodeState::Up, NodeState::Down, NodeState::Up]);
    }

    #[tokio::test]
    async fn test_external_signals() {
        let tracker = NodeTracker::new(&config());
        tracker.on_pool_event(PoolEvent::Up(addr(1)));

        assert!(tracker.mark_down(addr(1)));
        assert_eq!(tracker.node(addr(1)).unwrap().state(), NodeState::Down);
        // no pool yet, so nothing contradicts the signal
        assert!(tracker.mark_up(addr(1)));
        assert!(!tracker.mark_down(addr(9)));
    }

    #[tokio::test]
    async fn test_removed_node_ignores_events() {
        let tracker = NodeTracker::new(&config());
        let node = tracker.node(addr(3)).unwrap();
        tracker.remove_node(addr(3)).await;

        tracker.transition(&node, NodeState::Up);
        assert_eq!(node.state(), NodeState::Removed);
        assert!(tracker.pool(&node).is_none());
    }
}
