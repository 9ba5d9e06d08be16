//! REST API handlers for upgrade operations.
//!
//! Provides endpoints to start, inspect and abort a pool's upgrade and to
//! read its history.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use nodeshift_state::{BatchRecord, OperationPhase, OperationResult, UpgradeOperation, UpgradeStrategy};

use crate::ApiState;
use crate::handlers::{ApiResponse, upgrade_error};

/// Serializable upgrade status for API responses.
#[derive(serde::Serialize)]
pub struct UpgradeStatus {
    pub id: String,
    pub pool_id: String,
    pub strategy: UpgradeStrategy,
    pub source_version: String,
    pub target_version: String,
    #[serde(flatten)]
    pub phase: OperationPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<OperationResult>,
    pub batches: Vec<BatchRecord>,
    pub started_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<u64>,
}

impl From<UpgradeOperation> for UpgradeStatus {
    fn from(op: UpgradeOperation) -> Self {
        Self {
            id: op.id,
            pool_id: op.pool_id,
            strategy: op.strategy,
            source_version: op.source_version,
            target_version: op.target_version,
            phase: op.phase,
            result: op.result,
            batches: op.batches,
            started_at: op.started_at,
            finished_at: op.finished_at,
        }
    }
}

/// Request body to start an upgrade.
#[derive(serde::Deserialize)]
pub struct StartUpgradeRequest {
    pub target_version: String,
}

/// POST /api/v1/pools/{id}/upgrade
pub async fn start_upgrade(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<StartUpgradeRequest>,
) -> Response {
    match state.orchestrator.start_upgrade(&id, &req.target_version).await {
        Ok(op) => (StatusCode::CREATED, ApiResponse::ok(UpgradeStatus::from(op))).into_response(),
        Err(e) => upgrade_error(e),
    }
}

/// GET /api/v1/pools/{id}/upgrade
pub async fn get_upgrade(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.get_operation_status(&id).await {
        Ok(op) => ApiResponse::ok(UpgradeStatus::from(op)).into_response(),
        Err(e) => upgrade_error(e),
    }
}

/// POST /api/v1/pools/{id}/upgrade/abort
pub async fn abort_upgrade(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.abort_upgrade(&id).await {
        Ok(op) => ApiResponse::ok(UpgradeStatus::from(op)).into_response(),
        Err(e) => upgrade_error(e),
    }
}

/// GET /api/v1/pools/{id}/upgrades
pub async fn list_history(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.history(&id) {
        Ok(ops) => {
            let statuses: Vec<UpgradeStatus> = ops.into_iter().map(UpgradeStatus::from).collect();
            ApiResponse::ok(statuses).into_response()
        }
        Err(e) => upgrade_error(e),
    }
}

/// GET /api/v1/upgrades
pub async fn list_upgrades(State(state): State<ApiState>) -> Response {
    match state.orchestrator.list_operations() {
        Ok(ops) => {
            let statuses: Vec<UpgradeStatus> = ops.into_iter().map(UpgradeStatus::from).collect();
            ApiResponse::ok(statuses).into_response()
        }
        Err(e) => upgrade_error(e),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use nodeshift_core::{OrchestratorSettings, TokioClock};
    use nodeshift_rollout::{LoggingRouter, Orchestrator, SimulatedProvisioner};
    use nodeshift_state::{NodePool, StateStore};

    use super::*;

    async fn state_with_pool(soak_secs: u64) -> ApiState {
        let orchestrator = Orchestrator::new(
            StateStore::open_in_memory().unwrap(),
            Arc::new(SimulatedProvisioner::new(0)),
            Arc::new(LoggingRouter::new()),
            Arc::new(TokioClock),
            OrchestratorSettings::default(),
        );
        orchestrator
            .register_pool(NodePool {
                id: "web".into(),
                desired_count: 2,
                current_version: "v1".into(),
                target_version: None,
                strategy: UpgradeStrategy::BlueGreen,
                max_surge: 0,
                max_unavailable: 0,
                batch_percentage: 100,
                soak_secs,
                created_at: 0,
                updated_at: 0,
            })
            .await
            .unwrap();
        ApiState { orchestrator }
    }

    fn start_req(target: &str) -> Json<StartUpgradeRequest> {
        Json(StartUpgradeRequest {
            target_version: target.to_string(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn start_then_conflict() {
        let state = state_with_pool(600).await;

        let resp = start_upgrade(State(state.clone()), Path("web".into()), start_req("v2")).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = start_upgrade(State(state.clone()), Path("web".into()), start_req("v3")).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = list_upgrades(State(state)).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn start_on_unknown_pool() {
        let state = state_with_pool(0).await;
        let resp = start_upgrade(State(state), Path("nope".into()), start_req("v2")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn start_to_current_version_is_bad_request() {
        let state = state_with_pool(0).await;
        let resp = start_upgrade(State(state), Path("web".into()), start_req("v1")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test(start_paused = true)]
    async fn status_before_any_upgrade_is_not_found() {
        let state = state_with_pool(0).await;
        let resp = get_upgrade(State(state.clone()), Path("web".into())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = abort_upgrade(State(state), Path("web".into())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_then_history() {
        let state = state_with_pool(600).await;
        start_upgrade(State(state.clone()), Path("web".into()), start_req("v2")).await;

        let resp = abort_upgrade(State(state.clone()), Path("web".into())).await;
        assert_eq!(resp.status(), StatusCode::OK);

        loop {
            let op = state.orchestrator.get_operation_status("web").await.unwrap();
            if op.is_terminal() {
                assert_eq!(op.phase, OperationPhase::Aborted);
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        let resp = list_history(State(state.clone()), Path("web".into())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.orchestrator.history("web").unwrap().len(), 1);
    }

    #[test]
    fn status_flattens_phase() {
        let op = UpgradeOperation {
            id: "web-1".into(),
            pool_id: "web".into(),
            sequence: 1,
            strategy: UpgradeStrategy::BlueGreen,
            source_version: "v1".into(),
            target_version: "v2".into(),
            phase: OperationPhase::Soaking { batch: 1, until: 500 },
            batches: Vec::new(),
            result: None,
            started_at: 100,
            finished_at: None,
        };
        let json = serde_json::to_value(UpgradeStatus::from(op)).unwrap();
        assert_eq!(json["phase"], "soaking");
        assert_eq!(json["batch"], 1);
        assert_eq!(json["until"], 500);
        assert!(json.get("result").is_none());
    }
}
