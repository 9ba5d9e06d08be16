//! nodeshift-state — embedded state store for nodeshift.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state management for node pools, nodes, in-flight upgrade operations and
//! the archive of finished operations.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{pool_id}:{node_id}`, `{pool_id}:{sequence}`) enable
//! prefix scans for the records belonging to one pool.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
