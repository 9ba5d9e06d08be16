//! Error types for the upgrade orchestrator.

use thiserror::Error;

use nodeshift_state::{ErrorKind, StateError};

use crate::provider::ProvisionError;

/// Result type alias for orchestrator operations.
pub type UpgradeResult<T> = Result<T, UpgradeError>;

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("pool {pool} already has upgrade {operation} in flight")]
    Conflict { pool: String, operation: String },

    #[error("pool not found: {0}")]
    PoolNotFound(String),

    #[error("pool already exists: {0}")]
    PoolExists(String),

    #[error("no upgrade operation for pool {0}")]
    NoOperation(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid phase transition {from} -> {to}")]
    InvalidTransition { from: &'static str, to: &'static str },

    #[error("availability violation: {0}")]
    AvailabilityViolation(String),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error("health check timeout: {0}")]
    HealthCheckTimeout(String),

    #[error("node unhealthy: {0}")]
    NodeUnhealthy(String),

    #[error("traffic router: {0}")]
    Router(String),

    #[error("state store: {0}")]
    State(#[from] StateError),
}

impl UpgradeError {
    /// Kind recorded on an operation that failed with this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Provision(_) => ErrorKind::ProvisionError,
            Self::HealthCheckTimeout(_) => ErrorKind::HealthCheckTimeout,
            Self::AvailabilityViolation(_) => ErrorKind::AvailabilityViolation,
            Self::NodeUnhealthy(_) => ErrorKind::NodeUnhealthy,
            Self::Router(_) => ErrorKind::Router,
            _ => ErrorKind::State,
        }
    }
}
