use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::node::{Distance, Node};
use crate::token::TokenMap;

/// What the policy may know about a request when planning.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlanHint<'a> {
    pub routing_key: Option<&'a [u8]>,
}

/// Candidate nodes for one request, in the order they should be tried.
///
/// A plan is a snapshot taken at creation: nodes that go down afterwards are
/// still yielded. It is consumed once and never restarts.
#[derive(Debug, Default)]
pub struct QueryPlan {
    nodes: Vec<Arc<Node>>,
    next: usize,
}

impl QueryPlan {
    pub fn new(nodes: Vec<Arc<Node>>) -> Self {
        Self { nodes, next: 0 }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Nodes not yet yielded.
    pub fn remaining(&self) -> usize {
        self.nodes.len() - self.next
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }
}

impl Iterator for QueryPlan {
    type Item = Arc<Node>;

    fn next(&mut self) -> Option<Arc<Node>> {
        let node = self.nodes.get(self.next)?.clone();
        self.next += 1;
        Some(node)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining(), Some(self.remaining()))
    }
}

/// Produces query plans.
pub trait LoadBalancingPolicy: Send + Sync + 'static {
    fn plan(&self, hint: &PlanHint<'_>, nodes: &[Arc<Node>], tokens: &TokenMap) -> QueryPlan;
}

/// Token-aware, datacenter-aware round robin.
///
/// With a routing key, live replicas of its token come first in replication
/// order, local before remote. The remaining live nodes follow, local ones
/// first, each group rotated by a cursor shared by every plan.
#[derive(Debug, Default)]
pub struct DefaultLoadBalancingPolicy {
    cursor: AtomicUsize,
}

impl DefaultLoadBalancingPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

fn rotated(nodes: Vec<Arc<Node>>, by: usize) -> impl Iterator<Item = Arc<Node>> {
    let len = nodes.len();
    let shift = if len == 0 { 0 } else { by % len };
    nodes.into_iter().cycle().skip(shift).take(len)
}

impl LoadBalancingPolicy for DefaultLoadBalancingPolicy {
    fn plan(&self, hint: &PlanHint<'_>, nodes: &[Arc<Node>], tokens: &TokenMap) -> QueryPlan {
        let live: Vec<Arc<Node>> = nodes.iter().filter(|n| n.is_queryable()).cloned().collect();
        let rotation = self.cursor.fetch_add(1, Ordering::Relaxed);

        let mut ordered = Vec::with_capacity(live.len());
        let mut placed: HashSet<SocketAddr> = HashSet::new();

        if let Some(key) = hint.routing_key {
            let replicas = tokens.replicas_for_key(key);
            for distance in [Distance::Local, Distance::Remote] {
                for addr in &replicas {
                    if let Some(node) = live.iter().find(|n| n.addr() == *addr && n.distance() == distance) {
                        placed.insert(node.addr());
                        ordered.push(node.clone());
                    }
                }
            }
        }

        for distance in [Distance::Local, Distance::Remote] {
            let group: Vec<Arc<Node>> = live
                .iter()
                .filter(|n| n.distance() == distance && !placed.contains(&n.addr()))
                .cloned()
                .collect();
            ordered.extend(rotated(group, rotation));
        }

        QueryPlan::new(ordered)
    }
}
