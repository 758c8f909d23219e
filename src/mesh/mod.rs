//! The bulk mesh database and its modification cycle.
//!
//! - [`bulk_data`]: storage, queries and the cycle state machine
//! - [`modification`]: local edits inside a cycle
//! - [`sharing`]: sharing, ownership and part reconciliation at `end_modification`
//! - [`ghosting`]: aura and custom ghosting channels
//! - [`verify`]: parallel consistency and local invariant checks

pub mod bulk_data;
pub mod config;
pub mod ghosting;
pub mod modification;
pub mod sharing;
pub mod verify;

pub use bulk_data::{BulkData, ModificationState};
pub use config::{ConnectivityPolicy, MeshConfig, VerifyMode};
