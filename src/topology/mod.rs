//! Top-level module for mesh topology abstractions.
//!
//! This module provides the identity and connectivity vocabulary of the mesh:
//! - `EntityRank` / `EntityKey`: global `(rank, id)` identities
//! - `Entity`: process-local generational handles and per-cycle state
//! - `Topology`: node counts and side tables
//! - `Relation`: ranked, ordinal- and permutation-tagged incidences
//! - permutation resolution for sides seen from higher-rank entities

pub mod cell_type;
pub mod entity;
pub mod entity_key;
pub mod orientation;
pub mod relation;

pub use cell_type::Topology;
pub use entity::{Entity, EntityState};
pub use entity_key::{EntityKey, EntityRank};
pub use relation::Relation;
