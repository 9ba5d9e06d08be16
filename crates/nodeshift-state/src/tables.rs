//! redb table definitions for the nodeshift state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Node pools keyed by `{pool_id}`.
pub const POOLS: TableDefinition<&str, &[u8]> = TableDefinition::new("pools");

/// Nodes keyed by `{pool_id}:{node_id}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// In-flight upgrade operations keyed by `{pool_id}` (at most one per pool).
pub const OPERATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("operations");

/// Finished operations keyed by `{pool_id}:{sequence:010}`.
pub const HISTORY: TableDefinition<&str, &[u8]> = TableDefinition::new("history");
