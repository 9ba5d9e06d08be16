//! Upgrade state machine.
//!
//! Phase changes on an [`UpgradeOperation`] go through
//! [`OperationStateMachine`], which rejects anything outside
//!
//! ```text
//! Planning → BatchInProgress → [Soaking] → BatchComplete → {BatchInProgress | Completed}
//! any live phase → Aborting → Aborted
//! Aborting → Completed (only once no batch is in progress)
//! any live phase → Failed
//! ```

use tracing::{debug, info, warn};

use nodeshift_state::{
    BatchOutcome, BatchRecord, ErrorKind, NodePool, OperationPhase, OperationResult,
    UpgradeOperation,
};

use crate::error::{UpgradeError, UpgradeResult};

/// Build a new operation for `pool` in phase `Planning`.
pub fn plan_operation(pool: &NodePool, target_version: &str, sequence: u64, now: u64) -> UpgradeOperation {
    UpgradeOperation {
        id: format!("{}-{sequence}", pool.id),
        pool_id: pool.id.clone(),
        sequence,
        strategy: pool.strategy,
        source_version: pool.current_version.clone(),
        target_version: target_version.to_string(),
        phase: OperationPhase::Planning,
        batches: Vec::new(),
        result: None,
        started_at: now,
        finished_at: None,
    }
}

/// Whether `from → to` is a legal phase change.
pub fn can_transition(from: &OperationPhase, to: &OperationPhase) -> bool {
    use OperationPhase::*;

    if from.is_terminal() {
        return false;
    }
    match (from, to) {
        (Planning, BatchInProgress { batch }) => *batch == 1,
        (Planning, Completed) => true,
        (BatchInProgress { batch: a }, Soaking { batch: b, .. }) => a == b,
        (BatchInProgress { batch: a }, BatchComplete { batch: b }) => a == b,
        (Soaking { batch: a, .. }, BatchComplete { batch: b }) => a == b,
        (BatchComplete { batch: a }, BatchInProgress { batch: b }) => *b == a + 1,
        (BatchComplete { .. }, Completed) => true,
        (Aborting, Aborting) => false,
        (Aborting, Aborted) => true,
        (Aborting, Completed) => true,
        (_, Aborting) => true,
        (_, Failed) => true,
        _ => false,
    }
}

/// Phase transitions and batch bookkeeping for an upgrade operation.
pub trait OperationStateMachine {
    /// Move to `to`, or fail with `InvalidTransition`.
    fn transition(&mut self, to: OperationPhase) -> UpgradeResult<()>;

    /// Start the next batch and return its 1-based index.
    fn begin_batch(&mut self, size: u32, now: u64) -> UpgradeResult<u32>;

    /// Enter the soak window of the current batch.
    fn start_soak(&mut self, until: u64) -> UpgradeResult<()>;

    /// Record the outcome of the current batch without changing phase.
    fn close_batch(&mut self, outcome: BatchOutcome, now: u64);

    /// Close the current batch as completed. While `Aborting` the phase is kept.
    fn complete_batch(&mut self, now: u64) -> UpgradeResult<()>;

    /// Finish successfully. Allowed while `Aborting` once every batch is closed.
    fn complete(&mut self, now: u64) -> UpgradeResult<()>;

    fn fail(&mut self, kind: ErrorKind, message: String, now: u64) -> UpgradeResult<()>;

    /// Move to `Aborting`. Returns `false` if it already was.
    fn request_abort(&mut self) -> UpgradeResult<bool>;

    fn finish_abort(&mut self, now: u64) -> UpgradeResult<()>;
}

impl OperationStateMachine for UpgradeOperation {
    fn transition(&mut self, to: OperationPhase) -> UpgradeResult<()> {
        if !can_transition(&self.phase, &to) {
            warn!(
                operation = %self.id,
                from = self.phase.name(),
                to = to.name(),
                "rejected phase transition"
            );
            return Err(UpgradeError::InvalidTransition {
                from: self.phase.name(),
                to: to.name(),
            });
        }
        debug!(operation = %self.id, from = self.phase.name(), to = to.name(), "phase transition");
        self.phase = to;
        Ok(())
    }

    fn begin_batch(&mut self, size: u32, now: u64) -> UpgradeResult<u32> {
        let index = self.batches.len() as u32 + 1;
        self.transition(OperationPhase::BatchInProgress { batch: index })?;
        self.batches.push(BatchRecord {
            index,
            size,
            created: Vec::new(),
            retired: Vec::new(),
            outcome: BatchOutcome::InProgress,
            started_at: now,
            finished_at: None,
        });
        info!(operation = %self.id, batch = index, size, "batch started");
        Ok(index)
    }

    fn start_soak(&mut self, until: u64) -> UpgradeResult<()> {
        let batch = self.batches.len() as u32;
        self.transition(OperationPhase::Soaking { batch, until })
    }

    fn close_batch(&mut self, outcome: BatchOutcome, now: u64) {
        if let Some(record) = self.current_batch_mut()
            && record.outcome == BatchOutcome::InProgress
        {
            record.outcome = outcome;
            record.finished_at = Some(now);
        }
    }

    fn complete_batch(&mut self, now: u64) -> UpgradeResult<()> {
        self.close_batch(BatchOutcome::Completed, now);
        if self.phase == OperationPhase::Aborting {
            return Ok(());
        }
        let batch = self.batches.len() as u32;
        self.transition(OperationPhase::BatchComplete { batch })?;
        info!(operation = %self.id, batch, "batch complete");
        Ok(())
    }

    fn complete(&mut self, now: u64) -> UpgradeResult<()> {
        let batch_open = self
            .batches
            .last()
            .is_some_and(|b| b.outcome == BatchOutcome::InProgress);
        if self.phase == OperationPhase::Aborting && batch_open {
            return Err(UpgradeError::InvalidTransition {
                from: self.phase.name(),
                to: OperationPhase::Completed.name(),
            });
        }
        self.transition(OperationPhase::Completed)?;
        self.result = Some(OperationResult::Succeeded);
        self.finished_at = Some(now);
        info!(
            operation = %self.id,
            version = %self.target_version,
            batches = self.batches.len(),
            "upgrade completed"
        );
        Ok(())
    }

    fn fail(&mut self, kind: ErrorKind, message: String, now: u64) -> UpgradeResult<()> {
        self.transition(OperationPhase::Failed)?;
        self.close_batch(BatchOutcome::Failed, now);
        warn!(operation = %self.id, ?kind, %message, "upgrade failed");
        self.result = Some(OperationResult::Failed { kind, message });
        self.finished_at = Some(now);
        Ok(())
    }

    fn request_abort(&mut self) -> UpgradeResult<bool> {
        if self.phase == OperationPhase::Aborting {
            return Ok(false);
        }
        self.transition(OperationPhase::Aborting)?;
        info!(operation = %self.id, "abort requested");
        Ok(true)
    }

    fn finish_abort(&mut self, now: u64) -> UpgradeResult<()> {
        self.transition(OperationPhase::Aborted)?;
        self.result = Some(OperationResult::Aborted);
        self.finished_at = Some(now);
        info!(operation = %self.id, batches = self.batches.len(), "upgrade aborted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use nodeshift_state::UpgradeStrategy;

    use super::*;

    fn pool() -> NodePool {
        NodePool {
            id: "workers".into(),
            desired_count: 4,
            current_version: "v1".into(),
            target_version: None,
            strategy: UpgradeStrategy::BlueGreen,
            max_surge: 1,
            max_unavailable: 0,
            batch_percentage: 50,
            soak_secs: 300,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn op() -> UpgradeOperation {
        plan_operation(&pool(), "v2", 7, 100)
    }

    #[test]
    fn planned_operation_shape() {
        let op = op();
        assert_eq!(op.id, "workers-7");
        assert_eq!(op.phase, OperationPhase::Planning);
        assert_eq!(op.source_version, "v1");
        assert_eq!(op.target_version, "v2");
        assert_eq!(op.strategy, UpgradeStrategy::BlueGreen);
        assert!(op.result.is_none());
    }

    #[test]
    fn blue_green_happy_path() {
        let mut op = op();
        assert_eq!(op.begin_batch(2, 110).unwrap(), 1);
        op.start_soak(410).unwrap();
        assert_eq!(op.phase, OperationPhase::Soaking { batch: 1, until: 410 });
        op.complete_batch(420).unwrap();
        assert_eq!(op.begin_batch(2, 430).unwrap(), 2);
        op.start_soak(730).unwrap();
        op.complete_batch(740).unwrap();
        op.complete(750).unwrap();

        assert_eq!(op.phase, OperationPhase::Completed);
        assert_eq!(op.result, Some(OperationResult::Succeeded));
        assert_eq!(op.batches.len(), 2);
        assert!(op.batches.iter().all(|b| b.outcome == BatchOutcome::Completed));
        assert_eq!(op.batches[1].finished_at, Some(740));
    }

    #[test]
    fn nothing_to_do_completes_from_planning() {
        let mut op = op();
        op.complete(100).unwrap();
        assert_eq!(op.phase, OperationPhase::Completed);
    }

    #[test]
    fn cannot_complete_mid_batch() {
        let mut op = op();
        op.begin_batch(1, 100).unwrap();
        let err = op.complete(101).unwrap_err();
        assert!(matches!(
            err,
            UpgradeError::InvalidTransition { from: "batch_in_progress", to: "completed" }
        ));
        assert_eq!(op.phase, OperationPhase::BatchInProgress { batch: 1 });
    }

    #[test]
    fn cannot_skip_batches() {
        assert!(!can_transition(
            &OperationPhase::BatchComplete { batch: 1 },
            &OperationPhase::BatchInProgress { batch: 3 }
        ));
        assert!(!can_transition(
            &OperationPhase::Planning,
            &OperationPhase::BatchInProgress { batch: 2 }
        ));
        assert!(!can_transition(
            &OperationPhase::Planning,
            &OperationPhase::Soaking { batch: 1, until: 0 }
        ));
    }

    #[test]
    fn terminal_phases_are_final() {
        for terminal in [
            OperationPhase::Completed,
            OperationPhase::Failed,
            OperationPhase::Aborted,
        ] {
            for to in [
                OperationPhase::Planning,
                OperationPhase::BatchInProgress { batch: 1 },
                OperationPhase::Aborting,
                OperationPhase::Failed,
                OperationPhase::Completed,
            ] {
                assert!(!can_transition(&terminal, &to), "{terminal:?} -> {to:?}");
            }
        }
    }

    #[test]
    fn abort_is_idempotent() {
        let mut op = op();
        op.begin_batch(2, 100).unwrap();
        assert!(op.request_abort().unwrap());
        assert!(!op.request_abort().unwrap());
        assert_eq!(op.phase, OperationPhase::Aborting);
    }

    #[test]
    fn batch_finishing_while_aborting_keeps_phase() {
        let mut op = op();
        op.begin_batch(2, 100).unwrap();
        op.request_abort().unwrap();
        op.complete_batch(120).unwrap();
        assert_eq!(op.phase, OperationPhase::Aborting);
        assert_eq!(op.batches[0].outcome, BatchOutcome::Completed);

        op.finish_abort(130).unwrap();
        assert_eq!(op.result, Some(OperationResult::Aborted));
        assert_eq!(op.finished_at, Some(130));
    }

    #[test]
    fn abort_after_last_batch_can_still_complete() {
        let mut op = op();
        op.begin_batch(2, 100).unwrap();
        op.request_abort().unwrap();
        op.complete_batch(120).unwrap();
        op.complete(130).unwrap();
        assert_eq!(op.phase, OperationPhase::Completed);
        assert_eq!(op.result, Some(OperationResult::Succeeded));
    }

    #[test]
    fn aborting_cannot_start_new_work() {
        let mut op = op();
        op.begin_batch(2, 100).unwrap();
        op.request_abort().unwrap();
        assert!(op.start_soak(400).is_err());
        assert!(op.complete(401).is_err());
    }

    #[test]
    fn fail_marks_open_batch() {
        let mut op = op();
        op.begin_batch(2, 100).unwrap();
        op.start_soak(400).unwrap();
        op.fail(ErrorKind::NodeUnhealthy, "node n1 unhealthy".into(), 150)
            .unwrap();

        assert_eq!(op.phase, OperationPhase::Failed);
        assert_eq!(op.batches[0].outcome, BatchOutcome::Failed);
        assert!(matches!(
            op.result,
            Some(OperationResult::Failed { kind: ErrorKind::NodeUnhealthy, .. })
        ));
    }

    #[test]
    fn closed_batch_outcome_is_not_overwritten() {
        let mut op = op();
        op.begin_batch(2, 100).unwrap();
        op.close_batch(BatchOutcome::TornDown, 110);
        op.fail(ErrorKind::NodeUnhealthy, "n1".into(), 120).unwrap();
        assert_eq!(op.batches[0].outcome, BatchOutcome::TornDown);
        assert_eq!(op.batches[0].finished_at, Some(110));
    }
}
