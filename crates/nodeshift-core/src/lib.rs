//! nodeshift-core — configuration and shared primitives.
//!
//! Everything process-wide (cluster identity, orchestrator tunables, seed
//! pools) is parsed into an explicit [`NodeshiftConfig`] and handed to the
//! orchestrator; nothing below this crate reads the environment.

pub mod clock;
pub mod config;
pub mod duration;

pub use clock::{Clock, SleepFuture, TokioClock};
pub use config::{NodeshiftConfig, OrchestratorSettings};
pub use duration::parse_duration;
