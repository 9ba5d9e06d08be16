//! Upgrade orchestrator: the public entry point.
//!
//! One background task drives each in-flight operation; the registry below
//! guarantees there is at most one per pool. The operation itself lives
//! behind its own lock so status reads and abort requests never wait on a
//! batch in progress.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use nodeshift_core::{Clock, OrchestratorSettings};
use nodeshift_health::ReadinessPolicy;
use nodeshift_state::{
    ErrorKind, Node, NodePool, PoolId, StateError, StateStore, UpgradeOperation,
};

use crate::controller::{OperationStateMachine, plan_operation};
use crate::driver::{Driver, clear_colors, provision_batch, reconcile};
use crate::error::{UpgradeError, UpgradeResult};
use crate::provider::{NodeProvisioner, NodeRequest, TrafficRouter};

/// Collaborators and settings shared by the orchestrator and its drivers.
pub(crate) struct Shared {
    pub(crate) store: StateStore,
    pub(crate) provisioner: Arc<dyn NodeProvisioner>,
    pub(crate) router: Arc<dyn TrafficRouter>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) settings: OrchestratorSettings,
    pub(crate) policy: ReadinessPolicy,
    pub(crate) in_flight: Mutex<HashMap<PoolId, InFlight>>,
}

/// Registry entry for a running operation.
pub(crate) struct InFlight {
    pub(crate) op: Arc<Mutex<UpgradeOperation>>,
    abort_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Drives node-pool upgrades. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(
        store: StateStore,
        provisioner: Arc<dyn NodeProvisioner>,
        router: Arc<dyn TrafficRouter>,
        clock: Arc<dyn Clock>,
        settings: OrchestratorSettings,
    ) -> Self {
        let policy = ReadinessPolicy::from(&settings);
        Self {
            shared: Arc::new(Shared {
                store,
                provisioner,
                router,
                clock,
                settings,
                policy,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.shared.store
    }

    fn require_pool(&self, pool_id: &str) -> UpgradeResult<NodePool> {
        self.shared
            .store
            .get_pool(pool_id)?
            .ok_or_else(|| UpgradeError::PoolNotFound(pool_id.to_string()))
    }

    // ── Upgrades ───────────────────────────────────────────────────

    /// Start moving `pool_id` to `target_version`.
    ///
    /// Returns the new operation in phase `Planning`; a background task
    /// drives it from there.
    pub async fn start_upgrade(
        &self,
        pool_id: &str,
        target_version: &str,
    ) -> UpgradeResult<UpgradeOperation> {
        let target = target_version.trim();
        if target.is_empty() {
            return Err(UpgradeError::InvalidRequest("target_version must not be empty".into()));
        }

        let store = &self.shared.store;
        let mut registry = self.shared.in_flight.lock().await;

        if let Some(existing) = registry.get(pool_id) {
            let op = existing.op.lock().await;
            if !op.is_terminal() {
                return Err(UpgradeError::Conflict {
                    pool: pool_id.to_string(),
                    operation: op.id.clone(),
                });
            }
        }
        if let Some(op) = store.get_operation(pool_id)? {
            return Err(UpgradeError::Conflict {
                pool: pool_id.to_string(),
                operation: op.id,
            });
        }

        let mut pool = self.require_pool(pool_id)?;
        if pool.current_version == target {
            return Err(UpgradeError::InvalidRequest(format!(
                "pool {pool_id} already runs {target}"
            )));
        }

        let now = self.shared.clock.now_epoch_secs();
        let sequence = store.next_sequence(pool_id)?;
        let op = plan_operation(&pool, target, sequence, now);

        pool.target_version = Some(target.to_string());
        pool.updated_at = now;
        store.put_pool(&pool)?;
        store.put_operation(&op)?;

        let (abort_tx, abort_rx) = watch::channel(false);
        let shared_op = Arc::new(Mutex::new(op.clone()));
        let driver = Driver::new(
            self.shared.clone(),
            pool,
            target.to_string(),
            shared_op.clone(),
            abort_rx,
        );
        let handle = tokio::spawn(driver.run());

        registry.insert(
            pool_id.to_string(),
            InFlight {
                op: shared_op,
                abort_tx,
                handle,
            },
        );

        info!(
            pool = %pool_id,
            operation = %op.id,
            from = %op.source_version,
            to = %op.target_version,
            strategy = ?op.strategy,
            "upgrade started"
        );
        Ok(op)
    }

    /// Request cancellation of the pool's in-flight operation.
    ///
    /// The phase becomes `Aborting` immediately; the driver reaches
    /// `Aborted` once work already under way has settled.
    pub async fn abort_upgrade(&self, pool_id: &str) -> UpgradeResult<UpgradeOperation> {
        self.require_pool(pool_id)?;
        let registry = self.shared.in_flight.lock().await;
        let Some(entry) = registry.get(pool_id) else {
            return Err(UpgradeError::NoOperation(pool_id.to_string()));
        };

        let mut op = entry.op.lock().await;
        if op.is_terminal() {
            return Err(UpgradeError::NoOperation(pool_id.to_string()));
        }
        if op.request_abort()? {
            self.shared.store.put_operation(&op)?;
            entry.abort_tx.send_replace(true);
            info!(pool = %pool_id, operation = %op.id, "abort signalled");
        } else {
            debug!(pool = %pool_id, operation = %op.id, "abort already pending");
        }
        Ok(op.clone())
    }

    /// The in-flight operation, else the most recently finished one.
    pub async fn get_operation_status(&self, pool_id: &str) -> UpgradeResult<UpgradeOperation> {
        self.require_pool(pool_id)?;
        {
            let registry = self.shared.in_flight.lock().await;
            if let Some(entry) = registry.get(pool_id) {
                return Ok(entry.op.lock().await.clone());
            }
        }
        let store = &self.shared.store;
        if let Some(op) = store.get_operation(pool_id)? {
            return Ok(op);
        }
        store
            .latest_history(pool_id)?
            .ok_or_else(|| UpgradeError::NoOperation(pool_id.to_string()))
    }

    /// Every operation still in flight.
    pub fn list_operations(&self) -> UpgradeResult<Vec<UpgradeOperation>> {
        Ok(self.shared.store.list_operations()?)
    }

    /// Finished operations of a pool, oldest first.
    pub fn history(&self, pool_id: &str) -> UpgradeResult<Vec<UpgradeOperation>> {
        self.require_pool(pool_id)?;
        Ok(self.shared.store.list_history(pool_id)?)
    }

    /// Archive operations left in flight by a previous process as failed.
    ///
    /// Node records the interrupted batch left behind are removed and the
    /// pool is trimmed back to its desired count.
    ///
    /// Nothing is resumed; re-issuing `start_upgrade` continues from the
    /// nodes that are not yet at the target version.
    pub async fn recover(&self) -> UpgradeResult<Vec<UpgradeOperation>> {
        let store = &self.shared.store;
        let registry = self.shared.in_flight.lock().await;
        let now = self.shared.clock.now_epoch_secs();
        let mut recovered = Vec::new();

        for mut op in store.list_operations()? {
            if registry.contains_key(&op.pool_id) {
                continue;
            }
            if !op.is_terminal() {
                let message = format!("process restarted during {}", op.phase.name());
                op.fail(ErrorKind::Interrupted, message, now)?;
            }
            if let Some(mut pool) = store.get_pool(&op.pool_id)? {
                pool.target_version = None;
                pool.updated_at = now;
                store.put_pool(&pool)?;
                reconcile(&self.shared, &pool, &op.target_version).await?;
                clear_colors(store, &pool.id, now)?;
            }
            store.archive_operation(&op)?;
            warn!(pool = %op.pool_id, operation = %op.id, "interrupted upgrade archived as failed");
            recovered.push(op);
        }
        Ok(recovered)
    }

    /// Stop every driver task without touching persisted state.
    ///
    /// Operations stay in flight in the store and are archived by
    /// [`Orchestrator::recover`] on the next start.
    pub async fn shutdown(&self) {
        let mut registry = self.shared.in_flight.lock().await;
        for (pool_id, entry) in registry.drain() {
            entry.handle.abort();
            debug!(pool = %pool_id, "upgrade driver stopped");
        }
    }

    // ── Pools ──────────────────────────────────────────────────────

    /// Persist a new pool and bring up its nodes at the current version.
    ///
    /// If any node fails to become Ready the pool is removed again.
    pub async fn register_pool(&self, mut pool: NodePool) -> UpgradeResult<NodePool> {
        pool.validate()
            .map_err(|e| UpgradeError::InvalidRequest(e.to_string()))?;
        let now = self.shared.clock.now_epoch_secs();
        pool.target_version = None;
        pool.created_at = now;
        pool.updated_at = now;

        let store = &self.shared.store;
        store.insert_pool(&pool).map_err(|e| match e {
            StateError::AlreadyExists(_) => UpgradeError::PoolExists(pool.id.clone()),
            other => UpgradeError::State(other),
        })?;

        let request = NodeRequest {
            pool_id: pool.id.clone(),
            version: pool.current_version.clone(),
            color: None,
        };
        let nodes = match provision_batch(&self.shared, &request, pool.desired_count).await {
            Ok(nodes) => nodes,
            Err(err) => {
                warn!(pool = %pool.id, error = %err, "pool registration failed, removing pool");
                store.delete_nodes_for_pool(&pool.id)?;
                store.delete_pool(&pool.id)?;
                return Err(err);
            }
        };

        info!(
            pool = %pool.id,
            nodes = nodes.len(),
            version = %pool.current_version,
            strategy = ?pool.strategy,
            "pool registered"
        );
        Ok(pool)
    }

    pub fn list_pools(&self) -> UpgradeResult<Vec<NodePool>> {
        Ok(self.shared.store.list_pools()?)
    }

    pub fn get_pool(&self, pool_id: &str) -> UpgradeResult<NodePool> {
        self.require_pool(pool_id)
    }

    pub fn list_nodes(&self, pool_id: &str) -> UpgradeResult<Vec<Node>> {
        self.require_pool(pool_id)?;
        Ok(self.shared.store.list_nodes_for_pool(pool_id)?)
    }
}

