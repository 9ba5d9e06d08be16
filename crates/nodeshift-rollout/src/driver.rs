//! Background task that carries one upgrade operation through its batches.
//!
//! Every phase change is persisted while the operation lock is held, so the
//! store and the in-memory copy never disagree. Abort requests are observed
//! at batch boundaries and, for blue-green, during the soak window.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use nodeshift_health::{Readiness, SoakOutcome, await_ready, watch_soak};
use nodeshift_state::{
    BatchOutcome, ErrorKind, Node, NodeColor, NodeHealth, NodePool, OperationPhase,
    OperationResult, StateError, StateResult, StateStore, UpgradeOperation, UpgradeStrategy,
};

use crate::controller::OperationStateMachine;
use crate::error::{UpgradeError, UpgradeResult};
use crate::orchestrator::Shared;
use crate::provider::{NodeRequest, TrafficSplit};
use crate::strategy::{SurgeMode, batch_count, plan_blue_green_batch, plan_surge_step};

/// Upper bound for the creation retry backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Why a driver stopped before finishing every batch.
enum Halt {
    Abort,
    Fail(UpgradeError),
}

impl From<UpgradeError> for Halt {
    fn from(e: UpgradeError) -> Self {
        Halt::Fail(e)
    }
}

impl From<StateError> for Halt {
    fn from(e: StateError) -> Self {
        Halt::Fail(e.into())
    }
}

type Step<T> = Result<T, Halt>;

/// Nodes of the pool as seen at a batch boundary.
struct PoolView {
    /// Nodes not yet at the target version, non-serving ones first.
    outdated: Vec<Node>,
    /// Target-version nodes still missing: `desired - ready at target`.
    remaining: u32,
    /// `desired - ready`.
    unavailable: u32,
}

pub(crate) struct Driver {
    shared: Arc<Shared>,
    pool: NodePool,
    target: String,
    op: Arc<Mutex<UpgradeOperation>>,
    abort: watch::Receiver<bool>,
}

impl Driver {
    pub(crate) fn new(
        shared: Arc<Shared>,
        pool: NodePool,
        target: String,
        op: Arc<Mutex<UpgradeOperation>>,
        abort: watch::Receiver<bool>,
    ) -> Self {
        Self {
            shared,
            pool,
            target,
            op,
            abort,
        }
    }

    pub(crate) async fn run(self) {
        debug!(pool = %self.pool.id, target = %self.target, "upgrade driver running");
        let outcome = match self.pool.strategy {
            UpgradeStrategy::Surge => self.run_surge().await,
            UpgradeStrategy::BlueGreen => self.run_blue_green().await,
        };
        self.finish(outcome).await;
    }

    fn now(&self) -> u64 {
        self.shared.clock.now_epoch_secs()
    }

    /// Apply a bookkeeping change and persist it.
    async fn update<T>(
        &self,
        f: impl FnOnce(&mut UpgradeOperation) -> UpgradeResult<T>,
    ) -> UpgradeResult<T> {
        let mut op = self.op.lock().await;
        let value = f(&mut op)?;
        self.shared.store.put_operation(&op)?;
        Ok(value)
    }

    /// Like [`Driver::update`], but yields to a pending abort instead of
    /// starting new work.
    async fn advance<T>(
        &self,
        f: impl FnOnce(&mut UpgradeOperation) -> UpgradeResult<T>,
    ) -> Step<T> {
        let mut op = self.op.lock().await;
        if op.phase == OperationPhase::Aborting {
            return Err(Halt::Abort);
        }
        let value = f(&mut op)?;
        self.shared.store.put_operation(&op)?;
        Ok(value)
    }

    async fn check_abort(&self) -> Step<()> {
        self.advance(|_| Ok(())).await
    }

    fn view(&self) -> StateResult<PoolView> {
        let nodes = self.shared.store.list_nodes_for_pool(&self.pool.id)?;
        let ready = nodes.iter().filter(|n| n.is_ready()).count() as u32;
        let ready_target = nodes
            .iter()
            .filter(|n| n.is_ready() && n.version == self.target)
            .count() as u32;
        let mut outdated: Vec<Node> = nodes
            .into_iter()
            .filter(|n| n.version != self.target)
            .collect();
        outdated.sort_by_key(Node::is_ready);
        Ok(PoolView {
            outdated,
            remaining: self.pool.desired_count.saturating_sub(ready_target),
            unavailable: self.pool.desired_count.saturating_sub(ready),
        })
    }

    fn route(&self, split: TrafficSplit) -> UpgradeResult<()> {
        self.shared
            .router
            .route(&self.pool.id, split)
            .map_err(|e| UpgradeError::Router(e.message))
    }

    // ── Surge ──────────────────────────────────────────────────────

    async fn run_surge(&self) -> Step<()> {
        reconcile(&self.shared, &self.pool, &self.target).await?;
        loop {
            let view = self.view()?;
            if view.remaining == 0 {
                return Ok(());
            }
            self.check_abort().await?;

            let remaining = view.remaining;
            let step = plan_surge_step(&self.pool, remaining, view.unavailable)?;
            let now = self.now();
            let batch = self.advance(|op| op.begin_batch(step.size, now)).await?;
            let victims: Vec<Node> = view.outdated.into_iter().take(step.size as usize).collect();
            debug!(
                pool = %self.pool.id,
                batch,
                size = step.size,
                remaining,
                mode = ?step.mode,
                "surge batch planned"
            );

            match step.mode {
                SurgeMode::CreateFirst => {
                    self.create_batch(step.size, None).await?;
                    self.retire(&victims).await?;
                }
                SurgeMode::DrainFirst => {
                    self.retire(&victims).await?;
                    self.create_batch(step.size, None).await?;
                }
            }

            let now = self.now();
            self.update(|op| op.complete_batch(now)).await?;
        }
    }

    // ── Blue-green ─────────────────────────────────────────────────

    async fn run_blue_green(&self) -> Step<()> {
        reconcile(&self.shared, &self.pool, &self.target).await?;
        self.tag_blue()?;
        self.route(TrafficSplit::BlueOnly)?;
        let mut cut_over = false;

        loop {
            let view = self.view()?;
            if view.remaining == 0 {
                break;
            }
            self.check_abort().await?;
            // Where traffic goes if this batch is abandoned.
            let fallback = if cut_over {
                TrafficSplit::Both
            } else {
                TrafficSplit::BlueOnly
            };

            let remaining = view.remaining;
            let size = plan_blue_green_batch(&self.pool, remaining, view.unavailable)?;
            let now = self.now();
            let batch = self.advance(|op| op.begin_batch(size, now)).await?;
            debug!(
                pool = %self.pool.id,
                batch,
                size,
                remaining,
                batches_left = batch_count(remaining, size),
                "green batch planned"
            );

            // A failed batch is already removed; traffic never left `fallback`.
            let greens = match self.create_batch(size, Some(NodeColor::Green)).await {
                Ok(greens) => greens,
                Err(e) => {
                    let now = self.now();
                    self.update(|op| {
                        op.close_batch(BatchOutcome::TornDown, now);
                        Ok(())
                    })
                    .await?;
                    return Err(e.into());
                }
            };
            if let Err(e) = self.route(TrafficSplit::Both) {
                self.abandon(&greens, fallback).await?;
                return Err(e.into());
            }

            let until = self.now() + self.pool.soak_secs;
            if let Err(halt) = self.advance(|op| op.start_soak(until)).await {
                self.abandon(&greens, fallback).await?;
                return Err(halt);
            }

            let mut abort = self.abort.clone();
            let outcome = watch_soak(
                self.shared.provisioner.as_ref(),
                self.shared.clock.as_ref(),
                &greens,
                self.pool.soak(),
                &self.shared.policy,
                &mut abort,
            )
            .await;

            match outcome {
                SoakOutcome::Elapsed => {}
                SoakOutcome::NodeFailed(node) => {
                    self.abandon(&greens, fallback).await?;
                    return Err(Halt::Fail(UpgradeError::NodeUnhealthy(format!(
                        "node {node} failed during soak of batch {batch}"
                    ))));
                }
                SoakOutcome::Aborted => {
                    self.abandon(&greens, fallback).await?;
                    return Err(Halt::Abort);
                }
            }

            let victims: Vec<Node> = view.outdated.into_iter().take(size as usize).collect();
            self.retire(&victims).await?;
            let now = self.now();
            self.update(|op| op.complete_batch(now)).await?;
            cut_over = true;
        }

        self.route(TrafficSplit::GreenOnly)?;
        Ok(())
    }

    fn tag_blue(&self) -> StateResult<()> {
        let store = &self.shared.store;
        let now = self.now();
        for mut node in store.list_nodes_for_pool(&self.pool.id)? {
            if node.version != self.target && node.color != Some(NodeColor::Blue) {
                node.color = Some(NodeColor::Blue);
                node.updated_at = now;
                store.put_node(&node)?;
            }
        }
        Ok(())
    }

    /// Route traffic away from a green batch and remove it. Blue nodes are
    /// not touched.
    async fn abandon(&self, greens: &[Node], fallback: TrafficSplit) -> UpgradeResult<()> {
        let routed = self.route(fallback);
        teardown(&self.shared, greens).await;
        let now = self.now();
        self.update(|op| {
            op.close_batch(BatchOutcome::TornDown, now);
            Ok(())
        })
        .await?;
        info!(pool = %self.pool.id, nodes = greens.len(), ?fallback, "green batch torn down");
        routed
    }

    // ── Node work ──────────────────────────────────────────────────

    /// Bring up `size` target-version nodes and wait for all of them.
    async fn create_batch(&self, size: u32, color: Option<NodeColor>) -> UpgradeResult<Vec<Node>> {
        let request = NodeRequest {
            pool_id: self.pool.id.clone(),
            version: self.target.clone(),
            color,
        };
        let nodes = provision_batch(&self.shared, &request, size).await?;
        let ids: Vec<String> = nodes.iter().map(|n| n.id.clone()).collect();
        self.update(|op| {
            if let Some(batch) = op.current_batch_mut() {
                batch.created.extend(ids);
            }
            Ok(())
        })
        .await?;
        Ok(nodes)
    }

    /// Drain and terminate old nodes concurrently.
    async fn retire(&self, victims: &[Node]) -> UpgradeResult<()> {
        let results = join_all(victims.iter().map(|n| self.retire_node(n))).await;
        let mut retired = Vec::with_capacity(victims.len());
        let mut first_err = None;
        for (node, result) in victims.iter().zip(results) {
            match result {
                Ok(()) => retired.push(node.id.clone()),
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        self.update(|op| {
            if let Some(batch) = op.current_batch_mut() {
                batch.retired.extend(retired);
            }
            Ok(())
        })
        .await?;
        first_err.map_or(Ok(()), Err)
    }

    async fn retire_node(&self, node: &Node) -> UpgradeResult<()> {
        let shared = &self.shared;
        let mut draining = node.clone();
        draining.health = NodeHealth::Draining;
        draining.updated_at = self.now();
        shared.store.put_node(&draining)?;

        if let Err(e) = shared.provisioner.drain_node(node).await {
            // Still serving.
            shared.store.put_node(node)?;
            return Err(e.into());
        }
        // A failed terminate leaves the Draining record for `reconcile`.
        shared.provisioner.terminate_node(node).await?;
        shared.store.delete_node(&node.pool_id, &node.id)?;
        debug!(node = %node.id, version = %node.version, "node retired");
        Ok(())
    }

    // ── Completion ─────────────────────────────────────────────────

    async fn finish(&self, outcome: Step<()>) {
        let now = self.now();
        let mut op = self.op.lock().await;
        let settled = match outcome {
            // Every batch ran, so an abort that arrived late changes nothing.
            Ok(()) => op.complete(now),
            Err(Halt::Abort) => op.finish_abort(now),
            Err(Halt::Fail(e)) => op.fail(e.kind(), e.to_string(), now),
        };
        if let Err(e) = settled {
            error!(operation = %op.id, error = %e, "could not settle operation");
            op.phase = OperationPhase::Failed;
            op.result = Some(OperationResult::Failed {
                kind: ErrorKind::State,
                message: e.to_string(),
            });
            op.finished_at = Some(now);
        }

        if let Err(e) = self.settle_pool(&op, now) {
            error!(pool = %self.pool.id, error = %e, "could not update pool after upgrade");
        }
        if let Err(e) = self.shared.store.archive_operation(&op) {
            error!(operation = %op.id, error = %e, "could not archive operation");
        }
        drop(op);

        let mut registry = self.shared.in_flight.lock().await;
        if registry
            .get(&self.pool.id)
            .is_some_and(|entry| Arc::ptr_eq(&entry.op, &self.op))
        {
            registry.remove(&self.pool.id);
        }
    }

    fn settle_pool(&self, op: &UpgradeOperation, now: u64) -> StateResult<()> {
        let store = &self.shared.store;
        let Some(mut pool) = store.get_pool(&op.pool_id)? else {
            return Ok(());
        };
        if op.phase == OperationPhase::Completed {
            pool.current_version = op.target_version.clone();
        }
        pool.target_version = None;
        pool.updated_at = now;
        store.put_pool(&pool)?;
        clear_colors(store, &pool.id, now)
    }
}

pub(crate) fn clear_colors(store: &StateStore, pool_id: &str, now: u64) -> StateResult<()> {
    for mut node in store.list_nodes_for_pool(pool_id)? {
        if node.color.is_some() {
            node.color = None;
            node.updated_at = now;
            store.put_node(&node)?;
        }
    }
    Ok(())
}

/// Bring the pool's node records back to serving nodes only, at most
/// `desired_count` of them.
///
/// Removes records an earlier operation left behind (Pending, Draining,
/// Unhealthy). If more nodes are Ready than desired, the surplus is drained
/// and terminated, outdated ones first.
pub(crate) async fn reconcile(shared: &Shared, pool: &NodePool, target: &str) -> UpgradeResult<()> {
    let nodes = shared.store.list_nodes_for_pool(&pool.id)?;
    let (mut ready, stale): (Vec<Node>, Vec<Node>) = nodes.into_iter().partition(Node::is_ready);

    if !stale.is_empty() {
        info!(pool = %pool.id, nodes = stale.len(), "removing leftover node records");
        teardown(shared, &stale).await;
    }

    let surplus = ready.len().saturating_sub(pool.desired_count as usize);
    if surplus > 0 {
        ready.sort_by_key(|n| n.version == target);
        let extra = &ready[..surplus];
        info!(pool = %pool.id, nodes = surplus, "retiring nodes above desired count");
        join_all(extra.iter().map(|n| drain_and_remove(shared, n))).await;
    }
    Ok(())
}

async fn drain_and_remove(shared: &Shared, node: &Node) {
    if let Err(e) = shared.provisioner.drain_node(node).await {
        warn!(node = %node.id, error = %e, "drain failed, terminating anyway");
    }
    remove_node(shared, node).await;
}

/// Create `count` nodes concurrently and wait until every one is Ready.
///
/// If any node cannot be brought up, the ones that did are removed again.
pub(crate) async fn provision_batch(
    shared: &Shared,
    request: &NodeRequest,
    count: u32,
) -> UpgradeResult<Vec<Node>> {
    let results = join_all((0..count).map(|_| provision_ready(shared, request))).await;
    let mut nodes = Vec::with_capacity(results.len());
    let mut first_err = None;
    for result in results {
        match result {
            Ok(node) => nodes.push(node),
            Err(e) => {
                first_err.get_or_insert(e);
            }
        }
    }
    match first_err {
        None => Ok(nodes),
        Some(e) => {
            warn!(pool = %request.pool_id, ready = nodes.len(), error = %e, "batch failed, removing its nodes");
            teardown(shared, &nodes).await;
            Err(e)
        }
    }
}

/// Create one node and wait for it to become Ready, retrying with
/// exponential backoff up to the configured limit.
pub(crate) async fn provision_ready(shared: &Shared, request: &NodeRequest) -> UpgradeResult<Node> {
    let limit = shared.settings.retry_limit;
    let mut backoff = shared.settings.retry_backoff;
    let mut attempt = 0;
    loop {
        match try_provision(shared, request).await {
            Ok(node) => return Ok(node),
            Err(e) if attempt < limit => {
                attempt += 1;
                warn!(
                    pool = %request.pool_id,
                    version = %request.version,
                    attempt,
                    limit,
                    ?backoff,
                    error = %e,
                    "node not provisioned, retrying"
                );
                shared.clock.sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Err(e) => return Err(e),
        }
    }
}

async fn try_provision(shared: &Shared, request: &NodeRequest) -> UpgradeResult<Node> {
    let mut node = shared.provisioner.create_node(request).await?;
    let now = shared.clock.now_epoch_secs();
    node.created_at = now;
    node.updated_at = now;
    shared.store.put_node(&node)?;

    let verdict = await_ready(
        shared.provisioner.as_ref(),
        shared.clock.as_ref(),
        &node,
        &shared.policy,
    )
    .await;

    if verdict == Readiness::Ready {
        node.health = NodeHealth::Ready;
        node.updated_at = shared.clock.now_epoch_secs();
        shared.store.put_node(&node)?;
        return Ok(node);
    }

    remove_node(shared, &node).await;
    Err(match verdict {
        Readiness::TimedOut => UpgradeError::HealthCheckTimeout(format!(
            "node {} not ready within {:?}",
            node.id, shared.policy.timeout
        )),
        _ => UpgradeError::NodeUnhealthy(format!(
            "node {} failed {} consecutive probes",
            node.id, shared.policy.unhealthy_threshold
        )),
    })
}

async fn teardown(shared: &Shared, nodes: &[Node]) {
    join_all(nodes.iter().map(|n| remove_node(shared, n))).await;
}

async fn remove_node(shared: &Shared, node: &Node) {
    if let Err(e) = shared.provisioner.terminate_node(node).await {
        warn!(node = %node.id, error = %e, "terminate failed");
    }
    if let Err(e) = shared.store.delete_node(&node.pool_id, &node.id) {
        warn!(node = %node.id, error = %e, "could not delete node record");
    }
}
