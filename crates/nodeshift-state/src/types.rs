//! Domain types for the nodeshift state store.
//!
//! These types represent the persisted state of node pools, their nodes,
//! and the upgrade operations that move a pool between versions. All types
//! are serializable to/from JSON for storage in redb tables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use nodeshift_core::config::PoolConfig;
use nodeshift_core::parse_duration;

use crate::error::{StateError, StateResult};

/// Unique identifier for a node pool.
pub type PoolId = String;

/// Unique identifier for a node.
pub type NodeId = String;

/// Unique identifier for an upgrade operation (`{pool_id}-{sequence}`).
pub type OperationId = String;

// ── Pool ──────────────────────────────────────────────────────────

/// How a pool moves from one node version to the next.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeStrategy {
    /// Stand up a parallel green batch, soak it, then retire blue nodes.
    BlueGreen,
    /// Add a few extra new-version nodes at a time, then retire old ones.
    #[default]
    Surge,
}

/// A managed, homogeneous set of worker nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodePool {
    pub id: PoolId,
    pub desired_count: u32,
    /// Version every node ran before the last requested upgrade.
    pub current_version: String,
    /// Version the pool is being moved to. Cleared once it converges.
    pub target_version: Option<String>,
    pub strategy: UpgradeStrategy,
    /// Extra nodes that may exist above `desired_count` during surge.
    pub max_surge: u32,
    /// Nodes that may be unavailable at once.
    pub max_unavailable: u32,
    /// Share of `desired_count` replaced per batch (1-100).
    pub batch_percentage: u32,
    /// Observation window after a blue-green batch becomes Ready.
    pub soak_secs: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl NodePool {
    /// Check the pool invariants.
    pub fn validate(&self) -> StateResult<()> {
        if self.id.is_empty() || self.id.contains(':') || self.id.contains('/') {
            return Err(StateError::Invalid(format!(
                "pool id {:?} must be non-empty and contain no ':' or '/'",
                self.id
            )));
        }
        if self.desired_count == 0 {
            return Err(StateError::Invalid("desired_count must be at least 1".into()));
        }
        if self.current_version.is_empty() {
            return Err(StateError::Invalid("current_version must not be empty".into()));
        }
        if self.max_unavailable > self.desired_count {
            return Err(StateError::Invalid(format!(
                "max_unavailable ({}) exceeds desired_count ({})",
                self.max_unavailable, self.desired_count
            )));
        }
        if !(1..=100).contains(&self.batch_percentage) {
            return Err(StateError::Invalid(format!(
                "batch_percentage ({}) must be within 1..=100",
                self.batch_percentage
            )));
        }
        Ok(())
    }

    pub fn soak(&self) -> Duration {
        Duration::from_secs(self.soak_secs)
    }

    pub fn table_key(&self) -> String {
        self.id.clone()
    }
}

impl TryFrom<&PoolConfig> for NodePool {
    type Error = StateError;

    fn try_from(cfg: &PoolConfig) -> StateResult<Self> {
        let strategy = match cfg.strategy.as_deref() {
            None | Some("surge") => UpgradeStrategy::Surge,
            Some("blue_green") | Some("blue-green") => UpgradeStrategy::BlueGreen,
            Some(other) => {
                return Err(StateError::Invalid(format!(
                    "pool {}: unknown strategy {other:?}",
                    cfg.id
                )));
            }
        };
        let soak_secs = match cfg.soak.as_deref() {
            None => 0,
            Some(s) => {
                let soak = parse_duration(s).ok_or_else(|| {
                    StateError::Invalid(format!("pool {}: invalid soak {s:?}", cfg.id))
                })?;
                if soak.subsec_nanos() != 0 {
                    return Err(StateError::Invalid(format!(
                        "pool {}: soak {s:?} must be a whole number of seconds",
                        cfg.id
                    )));
                }
                soak.as_secs()
            }
        };
        let pool = NodePool {
            id: cfg.id.clone(),
            desired_count: cfg.desired_count,
            current_version: cfg.version.clone(),
            target_version: None,
            strategy,
            max_surge: cfg.max_surge.unwrap_or(1),
            max_unavailable: cfg.max_unavailable.unwrap_or(0),
            batch_percentage: cfg.batch_percentage.unwrap_or(100),
            soak_secs,
            created_at: 0,
            updated_at: 0,
        };
        pool.validate()?;
        Ok(pool)
    }
}

// ── Node ──────────────────────────────────────────────────────────

/// Lifecycle / health state of a worker node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    Pending,
    Ready,
    Draining,
    Terminated,
    Unhealthy,
}

/// Blue-green color tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeColor {
    Blue,
    Green,
}

/// A single worker node in a pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub pool_id: PoolId,
    pub version: String,
    pub health: NodeHealth,
    /// Only set while the pool is upgraded blue-green.
    pub color: Option<NodeColor>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Node {
    pub fn table_key(&self) -> String {
        node_key(&self.pool_id, &self.id)
    }

    pub fn is_ready(&self) -> bool {
        self.health == NodeHealth::Ready
    }
}

/// Composite key for the nodes table.
pub fn node_key(pool_id: &str, node_id: &str) -> String {
    format!("{pool_id}:{node_id}")
}

// ── Upgrade operation ─────────────────────────────────────────────

/// Phase of an upgrade operation.
///
/// `Planning → BatchInProgress → Soaking (blue-green) → BatchComplete →
/// {BatchInProgress | Completed}`, any live phase → `Aborting → Aborted`,
/// any live phase → `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum OperationPhase {
    Planning,
    BatchInProgress { batch: u32 },
    /// Green batch is Ready and under observation until `until` (unix secs).
    Soaking { batch: u32, until: u64 },
    BatchComplete { batch: u32 },
    Aborting,
    Completed,
    Failed,
    Aborted,
}

impl OperationPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// Short name used in logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::BatchInProgress { .. } => "batch_in_progress",
            Self::Soaking { .. } => "soaking",
            Self::BatchComplete { .. } => "batch_complete",
            Self::Aborting => "aborting",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

/// Why an operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Node creation kept failing past the retry limit.
    ProvisionError,
    /// A node never became Ready within the health timeout.
    HealthCheckTimeout,
    /// A planned batch would breach max-unavailable.
    AvailabilityViolation,
    /// A node reported unhealthy during readiness or soak.
    NodeUnhealthy,
    /// The traffic router rejected a routing change.
    Router,
    /// The daemon restarted while the operation was in flight.
    Interrupted,
    /// Persisting operation state failed.
    State,
}

/// Terminal outcome of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum OperationResult {
    Succeeded,
    Failed { kind: ErrorKind, message: String },
    Aborted,
}

/// What happened to a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    InProgress,
    Completed,
    /// Green batch removed without touching blue nodes.
    TornDown,
    Failed,
}

/// One batch executed by an operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchRecord {
    /// 1-based batch number.
    pub index: u32,
    /// Nodes planned for replacement in this batch.
    pub size: u32,
    /// New-version nodes created (including retries).
    pub created: Vec<NodeId>,
    /// Old-version nodes drained and terminated.
    pub retired: Vec<NodeId>,
    pub outcome: BatchOutcome,
    pub started_at: u64,
    pub finished_at: Option<u64>,
}

/// A single upgrade of one pool from `source_version` to `target_version`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpgradeOperation {
    pub id: OperationId,
    pub pool_id: PoolId,
    /// Per-pool sequence number, 1-based.
    pub sequence: u64,
    pub strategy: UpgradeStrategy,
    pub source_version: String,
    pub target_version: String,
    pub phase: OperationPhase,
    pub batches: Vec<BatchRecord>,
    pub result: Option<OperationResult>,
    pub started_at: u64,
    pub finished_at: Option<u64>,
}

impl UpgradeOperation {
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Key in the history table; zero-padded so keys sort by sequence.
    pub fn history_key(&self) -> String {
        history_key(&self.pool_id, self.sequence)
    }

    pub fn current_batch_mut(&mut self) -> Option<&mut BatchRecord> {
        self.batches.last_mut()
    }
}

pub fn history_key(pool_id: &str, sequence: u64) -> String {
    format!("{pool_id}:{sequence:010}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> NodePool {
        NodePool {
            id: "workers".into(),
            desired_count: 3,
            current_version: "1.29".into(),
            target_version: None,
            strategy: UpgradeStrategy::Surge,
            max_surge: 1,
            max_unavailable: 0,
            batch_percentage: 100,
            soak_secs: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn valid_pool_passes() {
        pool().validate().unwrap();
    }

    #[test]
    fn max_unavailable_above_desired_rejected() {
        let p = NodePool {
            max_unavailable: 4,
            ..pool()
        };
        assert!(matches!(p.validate(), Err(StateError::Invalid(_))));
    }

    #[test]
    fn batch_percentage_bounds() {
        for bad in [0, 101] {
            let p = NodePool {
                batch_percentage: bad,
                ..pool()
            };
            assert!(p.validate().is_err(), "{bad} accepted");
        }
        let p = NodePool {
            batch_percentage: 1,
            ..pool()
        };
        assert!(p.validate().is_ok());
    }

    #[test]
    fn pool_id_must_be_key_safe() {
        let p = NodePool {
            id: "a:b".into(),
            ..pool()
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn pool_from_config_defaults() {
        let cfg = PoolConfig {
            id: "workers".into(),
            desired_count: 3,
            version: "1.29".into(),
            strategy: None,
            max_surge: None,
            max_unavailable: None,
            batch_percentage: None,
            soak: Some("5m".into()),
        };
        let p = NodePool::try_from(&cfg).unwrap();
        assert_eq!(p.strategy, UpgradeStrategy::Surge);
        assert_eq!(p.max_surge, 1);
        assert_eq!(p.batch_percentage, 100);
        assert_eq!(p.soak(), Duration::from_secs(300));
    }

    #[test]
    fn pool_from_config_rejects_fractional_soak() {
        let mut cfg = PoolConfig {
            id: "workers".into(),
            desired_count: 3,
            version: "1.29".into(),
            strategy: Some("blue_green".into()),
            max_surge: None,
            max_unavailable: None,
            batch_percentage: None,
            soak: Some("500ms".into()),
        };
        let err = NodePool::try_from(&cfg).unwrap_err();
        assert!(err.to_string().contains("whole number of seconds"), "{err}");

        cfg.soak = Some("1500ms".into());
        assert!(NodePool::try_from(&cfg).is_err());

        cfg.soak = Some("2000ms".into());
        assert_eq!(NodePool::try_from(&cfg).unwrap().soak_secs, 2);
    }

    #[test]
    fn pool_from_config_unknown_strategy() {
        let cfg = PoolConfig {
            id: "workers".into(),
            desired_count: 3,
            version: "1.29".into(),
            strategy: Some("canary".into()),
            max_surge: None,
            max_unavailable: None,
            batch_percentage: None,
            soak: None,
        };
        assert!(NodePool::try_from(&cfg).is_err());
    }

    #[test]
    fn phase_serializes_tagged() {
        let json = serde_json::to_value(OperationPhase::Soaking { batch: 2, until: 99 }).unwrap();
        assert_eq!(json["phase"], "soaking");
        assert_eq!(json["batch"], 2);
        assert!(OperationPhase::Aborted.is_terminal());
        assert!(!OperationPhase::Aborting.is_terminal());
    }

    #[test]
    fn history_keys_sort_by_sequence() {
        assert!(history_key("p", 9) < history_key("p", 10));
    }
}
