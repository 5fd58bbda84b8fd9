use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use tessera_pool::ConnectionPool;

/// Lifecycle state of a node as seen by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeState {
    /// Not connected yet
    Unknown = 0,
    Up = 1,
    Down = 2,
    /// Left the topology; terminal
    Removed = 3,
}

impl NodeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => NodeState::Unknown,
            1 => NodeState::Up,
            2 => NodeState::Down,
            _ => NodeState::Removed,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Unknown => "UNKNOWN",
            NodeState::Up => "UP",
            NodeState::Down => "DOWN",
            NodeState::Removed => "REMOVED",
        };
        f.write_str(name)
    }
}

/// How a node relates to the client's datacenter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Distance {
    Local,
    Remote,
    /// Never queried and never connected to
    Ignored,
}

/// A server node with its state and lazily created connection pool.
pub struct Node {
    addr: SocketAddr,
    datacenter: Option<String>,
    tokens: Vec<i64>,
    distance: Distance,
    state: AtomicU8,
    pool: OnceLock<ConnectionPool>,
}

impl Node {
    pub fn new(addr: SocketAddr, datacenter: Option<String>, tokens: Vec<i64>, distance: Distance) -> Self {
        Self {
            addr,
            datacenter,
            tokens,
            distance,
            state: AtomicU8::new(NodeState::Unknown as u8),
            pool: OnceLock::new(),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn datacenter(&self) -> Option<&str> {
        self.datacenter.as_deref()
    }

    pub fn tokens(&self) -> &[i64] {
        &self.tokens
    }

    pub fn distance(&self) -> Distance {
        self.distance
    }

    pub fn state(&self) -> NodeState {
        NodeState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether plans may include this node.
    pub fn is_queryable(&self) -> bool {
        self.distance != Distance::Ignored && matches!(self.state(), NodeState::Unknown | NodeState::Up)
    }

    /// Moves to `next`, returning the previous state if it changed.
    ///
    /// `Removed` is terminal: once there, every transition is refused.
    pub(crate) fn transition(&self, next: NodeState) -> Option<NodeState> {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let current = NodeState::from_u8(current);
                (current != next && current != NodeState::Removed).then_some(next as u8)
            })
            .ok()
            .map(NodeState::from_u8)
    }

    pub fn pool(&self) -> Option<&ConnectionPool> {
        self.pool.get()
    }

    pub(crate) fn pool_or_init(&self, init: impl FnOnce() -> ConnectionPool) -> &ConnectionPool {
        self.pool.get_or_init(init)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("addr", &self.addr)
            .field("datacenter", &self.datacenter)
            .field("distance", &self.distance)
            .field("state", &self.state())
            .finish()
    }
}
