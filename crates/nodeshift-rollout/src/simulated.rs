//! In-process provisioner and router.
//!
//! `SimulatedProvisioner` keeps its nodes in memory: a new node answers
//! `NotReady` for a configurable number of probes and `Ready` afterwards.
//! Failures can be injected per version. Every change to a pool's node set
//! appends a [`PoolSnapshot`], so availability can be checked after the fact.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use nodeshift_health::{NodeProbe, ProbeFuture, ProbeResult};
use nodeshift_state::{Node, NodeHealth, NodeId, PoolId};

use crate::provider::{
    NodeProvisioner, NodeRequest, ProviderFuture, ProvisionError, TrafficRouter, TrafficSplit,
};

/// Node counts of one pool at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSnapshot {
    /// Nodes that exist, including draining ones.
    pub total: u32,
    /// Nodes currently serving.
    pub ready: u32,
}

#[derive(Debug)]
struct SimNode {
    pool_id: PoolId,
    version: String,
    boot_left: u32,
    ready: bool,
    draining: bool,
    never_ready: bool,
    /// Ready probes left before the node turns unhealthy.
    degrade_after: Option<u32>,
}

#[derive(Debug, Default)]
struct SimState {
    seq: u64,
    nodes: HashMap<NodeId, SimNode>,
    create_failures: HashMap<String, u32>,
    drain_failures: u32,
    never_ready: HashSet<String>,
    degrade: HashMap<String, u32>,
    snapshots: HashMap<PoolId, Vec<PoolSnapshot>>,
}

impl SimState {
    fn snapshot(&mut self, pool_id: &str) {
        let (total, ready) = self
            .nodes
            .values()
            .filter(|n| n.pool_id == pool_id)
            .fold((0, 0), |(total, ready), n| {
                (total + 1, ready + u32::from(n.ready && !n.draining))
            });
        self.snapshots
            .entry(pool_id.to_string())
            .or_default()
            .push(PoolSnapshot { total, ready });
    }
}

/// Provisioner that simulates node boot, readiness and failures in memory.
#[derive(Debug)]
pub struct SimulatedProvisioner {
    boot_probes: u32,
    state: Mutex<SimState>,
}

impl Default for SimulatedProvisioner {
    fn default() -> Self {
        Self::new(1)
    }
}

impl SimulatedProvisioner {
    /// New nodes answer `NotReady` to their first `boot_probes` probes.
    pub fn new(boot_probes: u32) -> Self {
        Self {
            boot_probes,
            state: Mutex::new(SimState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take over a node created by an earlier process as Ready.
    pub fn adopt(&self, node: &Node) {
        let mut state = self.lock();
        if let Some(seq) = node.id.rsplit('-').next().and_then(|s| s.parse::<u64>().ok()) {
            state.seq = state.seq.max(seq);
        }
        state.nodes.insert(
            node.id.clone(),
            SimNode {
                pool_id: node.pool_id.clone(),
                version: node.version.clone(),
                boot_left: 0,
                ready: true,
                draining: false,
                never_ready: false,
                degrade_after: None,
            },
        );
        state.snapshot(&node.pool_id);
    }

    /// Fail the next `count` creations of nodes at `version`.
    pub fn fail_creates(&self, version: &str, count: u32) {
        *self.lock().create_failures.entry(version.to_string()).or_default() += count;
    }

    /// Fail the next `count` drains, leaving those nodes serving.
    pub fn fail_drains(&self, count: u32) {
        self.lock().drain_failures += count;
    }

    /// Nodes created at `version` from now on never become Ready.
    pub fn never_ready(&self, version: &str) {
        self.lock().never_ready.insert(version.to_string());
    }

    /// The next node created at `version` turns unhealthy after answering
    /// `Ready` to `ready_probes` probes.
    pub fn degrade_after(&self, version: &str, ready_probes: u32) {
        self.lock().degrade.insert(version.to_string(), ready_probes);
    }

    /// Ids and versions of the nodes that currently exist in `pool_id`.
    pub fn live_nodes(&self, pool_id: &str) -> Vec<(NodeId, String)> {
        let state = self.lock();
        let mut nodes: Vec<_> = state
            .nodes
            .iter()
            .filter(|(_, n)| n.pool_id == pool_id)
            .map(|(id, n)| (id.clone(), n.version.clone()))
            .collect();
        nodes.sort();
        nodes
    }

    /// Every recorded snapshot of `pool_id`, oldest first.
    pub fn snapshots(&self, pool_id: &str) -> Vec<PoolSnapshot> {
        self.lock().snapshots.get(pool_id).cloned().unwrap_or_default()
    }
}

impl NodeProbe for SimulatedProvisioner {
    fn probe<'a>(&'a self, node: &'a Node) -> ProbeFuture<'a> {
        let mut state = self.lock();
        let result = match state.nodes.get_mut(&node.id) {
            None => ProbeResult::Unhealthy,
            Some(n) if n.draining || n.never_ready => ProbeResult::NotReady,
            Some(n) if n.boot_left > 0 => {
                n.boot_left -= 1;
                ProbeResult::NotReady
            }
            Some(n) => {
                let degraded = match n.degrade_after {
                    Some(0) => true,
                    Some(left) => {
                        n.degrade_after = Some(left - 1);
                        false
                    }
                    None => false,
                };
                let was_ready = n.ready;
                n.ready = !degraded;
                let pool_id = n.pool_id.clone();
                if was_ready != !degraded {
                    state.snapshot(&pool_id);
                }
                if degraded {
                    ProbeResult::Unhealthy
                } else {
                    ProbeResult::Ready
                }
            }
        };
        Box::pin(async move { result })
    }
}

impl NodeProvisioner for SimulatedProvisioner {
    fn create_node<'a>(&'a self, request: &'a NodeRequest) -> ProviderFuture<'a, Node> {
        let result = {
            let mut state = self.lock();
            let failures = state
                .create_failures
                .get_mut(&request.version)
                .filter(|left| **left > 0);
            if let Some(left) = failures {
                *left -= 1;
                Err(ProvisionError::new(format!(
                    "injected create failure for {} at {}",
                    request.pool_id, request.version
                )))
            } else {
                state.seq += 1;
                let id = format!("{}-{:05}", request.pool_id, state.seq);
                let never_ready = state.never_ready.contains(&request.version);
                let degrade_after = state.degrade.remove(&request.version);
                state.nodes.insert(
                    id.clone(),
                    SimNode {
                        pool_id: request.pool_id.clone(),
                        version: request.version.clone(),
                        boot_left: self.boot_probes,
                        ready: false,
                        draining: false,
                        never_ready,
                        degrade_after,
                    },
                );
                state.snapshot(&request.pool_id);
                debug!(node = %id, pool = %request.pool_id, version = %request.version, "node created");
                Ok(Node {
                    id,
                    pool_id: request.pool_id.clone(),
                    version: request.version.clone(),
                    health: NodeHealth::Pending,
                    color: request.color,
                    created_at: 0,
                    updated_at: 0,
                })
            }
        };
        Box::pin(async move { result })
    }

    fn drain_node<'a>(&'a self, node: &'a Node) -> ProviderFuture<'a, ()> {
        let result = {
            let mut state = self.lock();
            if state.drain_failures > 0 {
                state.drain_failures -= 1;
                Err(ProvisionError::new(format!("injected drain failure for {}", node.id)))
            } else {
                match state.nodes.get_mut(&node.id) {
                    Some(n) => {
                        n.draining = true;
                        state.snapshot(&node.pool_id);
                        debug!(node = %node.id, "node drained");
                        Ok(())
                    }
                    None => Err(ProvisionError::new(format!("unknown node {}", node.id))),
                }
            }
        };
        Box::pin(async move { result })
    }

    fn terminate_node<'a>(&'a self, node: &'a Node) -> ProviderFuture<'a, ()> {
        {
            let mut state = self.lock();
            if state.nodes.remove(&node.id).is_some() {
                state.snapshot(&node.pool_id);
                debug!(node = %node.id, "node terminated");
            }
        }
        Box::pin(async { Ok(()) })
    }
}

/// Router that logs each change and remembers it per pool.
#[derive(Debug, Default)]
pub struct LoggingRouter {
    routes: Mutex<HashMap<PoolId, Vec<TrafficSplit>>>,
}

impl LoggingRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Splits applied to `pool_id`, oldest first.
    pub fn history(&self, pool_id: &str) -> Vec<TrafficSplit> {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(pool_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn current(&self, pool_id: &str) -> Option<TrafficSplit> {
        self.history(pool_id).last().copied()
    }
}

impl TrafficRouter for LoggingRouter {
    fn route(&self, pool_id: &str, split: TrafficSplit) -> Result<(), ProvisionError> {
        info!(pool = %pool_id, ?split, "traffic routed");
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(pool_id.to_string())
            .or_default()
            .push(split);
        Ok(())
    }
}
