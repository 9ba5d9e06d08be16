//! REST API handlers for pools and nodes.
//!
//! Handlers call into the `Orchestrator` and return JSON responses.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::warn;

use nodeshift_core::config::PoolConfig;
use nodeshift_rollout::UpgradeError;
use nodeshift_state::NodePool;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// Map an orchestrator error onto an HTTP status.
pub(crate) fn upgrade_error(e: UpgradeError) -> Response {
    let status = match &e {
        UpgradeError::Conflict { .. } | UpgradeError::PoolExists(_) => StatusCode::CONFLICT,
        UpgradeError::PoolNotFound(_) | UpgradeError::NoOperation(_) => StatusCode::NOT_FOUND,
        UpgradeError::InvalidRequest(_) | UpgradeError::InvalidTransition { .. } => {
            StatusCode::BAD_REQUEST
        }
        UpgradeError::AvailabilityViolation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        warn!(error = %e, "request failed");
    }
    error_response(&e.to_string(), status)
}

// ── Pools ──────────────────────────────────────────────────────

/// GET /api/v1/pools
pub async fn list_pools(State(state): State<ApiState>) -> Response {
    match state.orchestrator.list_pools() {
        Ok(pools) => ApiResponse::ok(pools).into_response(),
        Err(e) => upgrade_error(e),
    }
}

/// POST /api/v1/pools
///
/// The body has the same shape as a `[[pools]]` entry in nodeshift.toml.
/// Responds once every node of the pool is Ready.
pub async fn register_pool(
    State(state): State<ApiState>,
    Json(req): Json<PoolConfig>,
) -> Response {
    let pool = match NodePool::try_from(&req) {
        Ok(pool) => pool,
        Err(e) => return error_response(&e.to_string(), StatusCode::BAD_REQUEST),
    };
    match state.orchestrator.register_pool(pool).await {
        Ok(pool) => (StatusCode::CREATED, ApiResponse::ok(pool)).into_response(),
        Err(e) => upgrade_error(e),
    }
}

/// GET /api/v1/pools/{id}
pub async fn get_pool(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.get_pool(&id) {
        Ok(pool) => ApiResponse::ok(pool).into_response(),
        Err(e) => upgrade_error(e),
    }
}

// ── Nodes ──────────────────────────────────────────────────────

/// GET /api/v1/pools/{id}/nodes
pub async fn list_nodes(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.orchestrator.list_nodes(&id) {
        Ok(nodes) => ApiResponse::ok(nodes).into_response(),
        Err(e) => upgrade_error(e),
    }
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use nodeshift_core::{OrchestratorSettings, TokioClock};
    use nodeshift_rollout::{LoggingRouter, Orchestrator, SimulatedProvisioner};
    use nodeshift_state::StateStore;

    use super::*;

    fn test_state() -> ApiState {
        let orchestrator = Orchestrator::new(
            StateStore::open_in_memory().unwrap(),
            Arc::new(SimulatedProvisioner::new(0)),
            Arc::new(LoggingRouter::new()),
            Arc::new(TokioClock),
            OrchestratorSettings::default(),
        );
        ApiState { orchestrator }
    }

    fn pool_config(id: &str) -> PoolConfig {
        PoolConfig {
            id: id.to_string(),
            desired_count: 2,
            version: "1.29".to_string(),
            strategy: Some("surge".to_string()),
            max_surge: Some(1),
            max_unavailable: Some(0),
            batch_percentage: None,
            soak: None,
        }
    }

    #[tokio::test]
    async fn list_pools_empty() {
        let resp = list_pools(State(test_state())).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn register_then_get_pool() {
        let state = test_state();
        let resp = register_pool(State(state.clone()), Json(pool_config("workers"))).await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = get_pool(State(state.clone()), Path("workers".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let nodes = state.orchestrator.list_nodes("workers").unwrap();
        assert_eq!(nodes.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_pool_conflicts() {
        let state = test_state();
        let resp = register_pool(State(state.clone()), Json(pool_config("workers"))).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let resp = register_pool(State(state), Json(pool_config("workers"))).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn invalid_pool_rejected() {
        let mut cfg = pool_config("workers");
        cfg.strategy = Some("canary".to_string());
        let resp = register_pool(State(test_state()), Json(cfg)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let mut cfg = pool_config("workers");
        cfg.max_unavailable = Some(5);
        let resp = register_pool(State(test_state()), Json(cfg)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_pool_is_not_found() {
        let state = test_state();
        let resp = get_pool(State(state.clone()), Path("nope".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = list_nodes(State(state), Path("nope".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn error_status_mapping() {
        let cases = [
            (
                UpgradeError::Conflict {
                    pool: "p".into(),
                    operation: "p-1".into(),
                },
                StatusCode::CONFLICT,
            ),
            (UpgradeError::NoOperation("p".into()), StatusCode::NOT_FOUND),
            (UpgradeError::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
            (UpgradeError::Router("down".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(upgrade_error(err).status(), status);
        }
    }
}
