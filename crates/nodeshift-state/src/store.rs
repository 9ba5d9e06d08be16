//! StateStore — redb-backed state persistence for nodeshift.
//!
//! Provides typed CRUD operations over pools, nodes, in-flight operations
//! and operation history. All values are JSON-serialized into redb's
//! `&[u8]` value columns. The store supports both on-disk and in-memory
//! backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(POOLS).map_err(map_err!(Table))?;
        txn.open_table(NODES).map_err(map_err!(Table))?;
        txn.open_table(OPERATIONS).map_err(map_err!(Table))?;
        txn.open_table(HISTORY).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// All values whose key starts with `prefix`, in key order.
    fn scan<T: DeserializeOwned>(&self, table: Table, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
            }
        }
        Ok(results)
    }

    fn remove(&self, table: Table, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Pools ──────────────────────────────────────────────────────

    /// Insert a new pool. Fails with `AlreadyExists` if the id is taken.
    pub fn insert_pool(&self, pool: &NodePool) -> StateResult<()> {
        let key = pool.table_key();
        let value = serde_json::to_vec(pool).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(POOLS).map_err(map_err!(Table))?;
            let exists = table.get(key.as_str()).map_err(map_err!(Read))?.is_some();
            if exists {
                return Err(StateError::AlreadyExists(format!("pool {key}")));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "pool inserted");
        Ok(())
    }

    /// Insert or update a pool.
    pub fn put_pool(&self, pool: &NodePool) -> StateResult<()> {
        self.put(POOLS, &pool.table_key(), pool)?;
        debug!(pool = %pool.id, "pool stored");
        Ok(())
    }

    pub fn get_pool(&self, pool_id: &str) -> StateResult<Option<NodePool>> {
        self.get(POOLS, pool_id)
    }

    pub fn list_pools(&self) -> StateResult<Vec<NodePool>> {
        self.scan(POOLS, "")
    }

    /// Delete a pool by id. Returns true if it existed.
    pub fn delete_pool(&self, pool_id: &str) -> StateResult<bool> {
        let existed = self.remove(POOLS, pool_id)?;
        debug!(pool = %pool_id, existed, "pool deleted");
        Ok(existed)
    }

    // ── Nodes ──────────────────────────────────────────────────────

    /// Insert or update a node.
    pub fn put_node(&self, node: &Node) -> StateResult<()> {
        self.put(NODES, &node.table_key(), node)
    }

    pub fn get_node(&self, pool_id: &str, node_id: &str) -> StateResult<Option<Node>> {
        self.get(NODES, &node_key(pool_id, node_id))
    }

    /// List all nodes belonging to a pool.
    pub fn list_nodes_for_pool(&self, pool_id: &str) -> StateResult<Vec<Node>> {
        self.scan(NODES, &format!("{pool_id}:"))
    }

    /// Delete a node. Returns true if it existed.
    pub fn delete_node(&self, pool_id: &str, node_id: &str) -> StateResult<bool> {
        self.remove(NODES, &node_key(pool_id, node_id))
    }

    /// Delete all nodes for a pool. Returns number deleted.
    pub fn delete_nodes_for_pool(&self, pool_id: &str) -> StateResult<u32> {
        let prefix = format!("{pool_id}:");
        // Collect keys in a read transaction first.
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(NODES).map_err(map_err!(Table))?;
            table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value().to_string();
                    k.starts_with(&prefix).then_some(k)
                })
                .collect()
        };

        let count = keys.len() as u32;
        if count == 0 {
            return Ok(0);
        }

        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(NODES).map_err(map_err!(Table))?;
            for key in &keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(pool = %pool_id, count, "nodes deleted for pool");
        Ok(count)
    }

    // ── In-flight operations ───────────────────────────────────────

    /// Insert or update the in-flight operation for its pool.
    pub fn put_operation(&self, op: &UpgradeOperation) -> StateResult<()> {
        self.put(OPERATIONS, &op.pool_id, op)
    }

    /// The in-flight operation of a pool, if any.
    pub fn get_operation(&self, pool_id: &str) -> StateResult<Option<UpgradeOperation>> {
        self.get(OPERATIONS, pool_id)
    }

    pub fn list_operations(&self) -> StateResult<Vec<UpgradeOperation>> {
        self.scan(OPERATIONS, "")
    }

    // ── History ────────────────────────────────────────────────────

    /// Move a finished operation into the history table.
    ///
    /// The history insert and the removal from the in-flight table commit
    /// in the same transaction.
    pub fn archive_operation(&self, op: &UpgradeOperation) -> StateResult<()> {
        if !op.is_terminal() {
            return Err(StateError::Invalid(format!(
                "operation {} is still {}",
                op.id,
                op.phase.name()
            )));
        }
        let key = op.history_key();
        let value = serde_json::to_vec(op).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut history = txn.open_table(HISTORY).map_err(map_err!(Table))?;
            history
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            let mut ops = txn.open_table(OPERATIONS).map_err(map_err!(Table))?;
            ops.remove(op.pool_id.as_str()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(operation = %op.id, %key, "operation archived");
        Ok(())
    }

    /// Archived operations of a pool, oldest first.
    pub fn list_history(&self, pool_id: &str) -> StateResult<Vec<UpgradeOperation>> {
        self.scan(HISTORY, &format!("{pool_id}:"))
    }

    /// Most recently archived operation of a pool.
    pub fn latest_history(&self, pool_id: &str) -> StateResult<Option<UpgradeOperation>> {
        Ok(self.list_history(pool_id)?.pop())
    }

    /// Sequence number the next operation on this pool should use.
    pub fn next_sequence(&self, pool_id: &str) -> StateResult<u64> {
        let last = self.latest_history(pool_id)?.map_or(0, |op| op.sequence);
        let in_flight = self.get_operation(pool_id)?.map_or(0, |op| op.sequence);
        Ok(last.max(in_flight) + 1)
    }
}
