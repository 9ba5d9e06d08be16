//! Collaborators the orchestrator drives: node provisioning and traffic routing.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use nodeshift_health::NodeProbe;
use nodeshift_state::{Node, NodeColor, PoolId};

/// Failure reported by a provisioner or router.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("provisioning failed: {message}")]
pub struct ProvisionError {
    pub message: String,
}

impl ProvisionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Boxed future returned by [`NodeProvisioner`] methods.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProvisionError>> + Send + 'a>>;

/// What to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRequest {
    pub pool_id: PoolId,
    pub version: String,
    pub color: Option<NodeColor>,
}

/// Creates, drains and terminates worker nodes.
///
/// A newly created node is returned `Pending`; readiness is observed through
/// the inherited [`NodeProbe`].
pub trait NodeProvisioner: NodeProbe {
    fn create_node<'a>(&'a self, request: &'a NodeRequest) -> ProviderFuture<'a, Node>;

    /// Cordon the node and evict its workloads.
    fn drain_node<'a>(&'a self, node: &'a Node) -> ProviderFuture<'a, ()>;

    /// Release the node. Terminating an unknown node is not an error.
    fn terminate_node<'a>(&'a self, node: &'a Node) -> ProviderFuture<'a, ()>;
}

/// Which colors receive a pool's traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficSplit {
    BlueOnly,
    Both,
    GreenOnly,
}

/// Moves a pool's traffic between blue and green nodes. Must be idempotent.
pub trait TrafficRouter: Send + Sync {
    fn route(&self, pool_id: &str, split: TrafficSplit) -> Result<(), ProvisionError>;
}
