//! Batch sizing for surge and blue-green upgrades.
//!
//! Everything here is pure arithmetic over the pool parameters; the
//! orchestrator calls it before each batch with the live node counts.

use nodeshift_state::NodePool;

use crate::error::{UpgradeError, UpgradeResult};

/// Shared batch size: `ceil(desired * batch_percentage / 100)`, clamped to
/// `[1, desired - in_flight_unavailable]`.
pub fn batch_size(desired: u32, batch_percentage: u32, in_flight_unavailable: u32) -> u32 {
    let raw = (u64::from(desired) * u64::from(batch_percentage)).div_ceil(100);
    let raw = u32::try_from(raw).unwrap_or(u32::MAX);
    let upper = desired.saturating_sub(in_flight_unavailable).max(1);
    raw.clamp(1, upper)
}

/// Number of batches needed to replace `remaining` nodes.
pub fn batch_count(remaining: u32, batch_size: u32) -> u32 {
    if batch_size == 0 {
        return 1;
    }
    remaining.div_ceil(batch_size)
}

/// Order of operations within a surge batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurgeMode {
    /// Create new nodes above the desired count, then retire old ones.
    CreateFirst,
    /// max-surge is 0: retire old nodes first (within max-unavailable), then replace.
    DrainFirst,
}

/// One planned surge batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurgeStep {
    pub size: u32,
    pub mode: SurgeMode,
}

impl SurgeStep {
    /// Nodes this step takes out of service before replacements are Ready.
    pub fn planned_unavailable(&self) -> u32 {
        match self.mode {
            SurgeMode::CreateFirst => 0,
            SurgeMode::DrainFirst => self.size,
        }
    }

    /// Nodes this step adds above the desired count.
    pub fn planned_surge(&self) -> u32 {
        match self.mode {
            SurgeMode::CreateFirst => self.size,
            SurgeMode::DrainFirst => 0,
        }
    }
}

/// Plan the next surge batch.
///
/// `remaining` is the number of nodes not yet at the target version and
/// `unavailable` is `desired - ready` right now.
pub fn plan_surge_step(pool: &NodePool, remaining: u32, unavailable: u32) -> UpgradeResult<SurgeStep> {
    let shared = batch_size(pool.desired_count, pool.batch_percentage, unavailable);

    let step = if pool.max_surge > 0 {
        SurgeStep {
            size: pool.max_surge.min(remaining).min(shared),
            mode: SurgeMode::CreateFirst,
        }
    } else {
        SurgeStep {
            size: pool.max_unavailable.min(remaining).min(shared),
            mode: SurgeMode::DrainFirst,
        }
    };

    if step.size == 0 {
        return Err(UpgradeError::AvailabilityViolation(format!(
            "pool {} has max_surge=0 and max_unavailable=0; no node can be replaced",
            pool.id
        )));
    }
    check_availability(pool, unavailable, step.planned_unavailable())?;
    Ok(step)
}

/// Plan the next blue-green batch: the number of green nodes to create.
pub fn plan_blue_green_batch(pool: &NodePool, remaining: u32, unavailable: u32) -> UpgradeResult<u32> {
    // Blue nodes are only retired after their green replacements are Ready.
    check_availability(pool, unavailable, 0)?;
    let size = batch_size(pool.desired_count, pool.batch_percentage, unavailable);
    Ok(size.min(remaining).max(1))
}

/// Reject a batch that would push unavailable nodes past max-unavailable.
pub fn check_availability(pool: &NodePool, unavailable: u32, planned: u32) -> UpgradeResult<()> {
    let total = unavailable.saturating_add(planned);
    if total > pool.max_unavailable {
        return Err(UpgradeError::AvailabilityViolation(format!(
            "pool {}: {unavailable} unavailable + {planned} planned exceeds max_unavailable={}",
            pool.id, pool.max_unavailable
        )));
    }
    Ok(())
}
