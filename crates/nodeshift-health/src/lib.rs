//! nodeshift-health — node readiness and soak monitoring.
//!
//! Nodes are probed through the [`NodeProbe`] trait (implemented by the node
//! provisioner). A [`HealthTracker`] turns raw probe results into a verdict
//! using consecutive-result thresholds.
//!
//! # Architecture
//!
//! ```text
//! await_ready (one new node)
//!   ├── HealthTracker (consecutive ready / failures)
//!   └── deadline from Clock::sleep(health_timeout)
//! watch_soak
//!   ├── soak window timer
//!   ├── periodic probe of every node in the batch
//!   └── abort channel
//! ```

pub mod checker;
pub mod monitor;

pub use checker::{HealthTracker, NodeProbe, ProbeFuture, ProbeResult};
pub use monitor::{
    Readiness, ReadinessPolicy, SoakOutcome, abort_requested, await_ready, watch_soak,
};
