//! nodeshift-rollout — the node-pool upgrade orchestrator.
//!
//! Moves a pool from its current node version to a target version in
//! batches, using either a surge strategy (add new nodes above the desired
//! count, then retire old ones) or blue-green (stand up a green batch, soak
//! it, then retire the matching blue nodes).
//!
//! # Components
//!
//! - **`strategy`**: batch sizing and availability checks
//! - **`controller`**: the operation state machine
//! - **`provider`**: `NodeProvisioner` and `TrafficRouter` collaborator traits
//! - **`simulated`**: in-process provisioner and router
//! - **`orchestrator`**: start, abort and inspect upgrades; register pools
//! - **`driver`**: the per-operation background task

mod driver;

pub mod controller;
pub mod error;
pub mod orchestrator;
pub mod provider;
pub mod simulated;
pub mod strategy;

pub use controller::{OperationStateMachine, can_transition, plan_operation};
pub use error::{UpgradeError, UpgradeResult};
pub use orchestrator::Orchestrator;
pub use provider::{
    NodeProvisioner, NodeRequest, ProviderFuture, ProvisionError, TrafficRouter, TrafficSplit,
};
pub use simulated::{LoggingRouter, PoolSnapshot, SimulatedProvisioner};
pub use strategy::{SurgeMode, SurgeStep, batch_size};
