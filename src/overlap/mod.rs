//! Overlap module: who else holds a copy of an entity.
//!
//! - [`comm_map`]: per-entity comm lists and the global sorted comm list
//! - [`ghosting`]: named replication channels and their generation stamps

pub mod comm_map;
pub mod ghosting;

pub use comm_map::{CommList, CommMapEntry, GhostId};
pub use ghosting::Ghosting;
