//! nodeshift-api — REST API for nodeshift.
//!
//! Provides axum route handlers for registering node pools and for
//! starting, inspecting and aborting their upgrades. Every response uses
//! the `{success, data?, error?}` envelope.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/pools` | List pools |
//! | POST | `/api/v1/pools` | Register a pool and provision its nodes |
//! | GET | `/api/v1/pools/{id}` | Get a pool |
//! | GET | `/api/v1/pools/{id}/nodes` | List a pool's nodes |
//! | POST | `/api/v1/pools/{id}/upgrade` | Start an upgrade |
//! | GET | `/api/v1/pools/{id}/upgrade` | Current or latest upgrade |
//! | POST | `/api/v1/pools/{id}/upgrade/abort` | Abort the in-flight upgrade |
//! | GET | `/api/v1/pools/{id}/upgrades` | Upgrade history |
//! | GET | `/api/v1/upgrades` | All in-flight upgrades |
//! | GET | `/healthz` | Liveness |

pub mod handlers;
pub mod upgrade_handlers;

use axum::Router;
use axum::routing::{get, post};
use nodeshift_rollout::Orchestrator;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Orchestrator,
}

/// Build the complete API router.
pub fn build_router(orchestrator: Orchestrator) -> Router {
    let state = ApiState { orchestrator };

    let api_routes = Router::new()
        .route("/pools", get(handlers::list_pools).post(handlers::register_pool))
        .route("/pools/{id}", get(handlers::get_pool))
        .route("/pools/{id}/nodes", get(handlers::list_nodes))
        .route(
            "/pools/{id}/upgrade",
            get(upgrade_handlers::get_upgrade).post(upgrade_handlers::start_upgrade),
        )
        .route("/pools/{id}/upgrade/abort", post(upgrade_handlers::abort_upgrade))
        .route("/pools/{id}/upgrades", get(upgrade_handlers::list_history))
        .route("/upgrades", get(upgrade_handlers::list_upgrades))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(handlers::healthz))
}
