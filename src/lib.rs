#![cfg_attr(docsrs, feature(doc_cfg))]
//! # mesh-bulk
//!
//! mesh-bulk is a distributed, in-memory database for unstructured mesh
//! entities (nodes, edges, faces, elements, constraints), the ranked relations
//! between them, their membership in named parts, and the bookkeeping that
//! keeps replicated copies coherent across processes.
//!
//! ## Features
//! - Global `(rank, id)` entity keys with process-local generational handles
//! - Ranked relations with ordinals and side permutations, and a configurable
//!   policy for which upward back-relations are stored
//! - Part membership with superset closure and downward part induction
//! - Bucketed storage by `(rank, part signature)` with field-data observers
//! - A collective modification cycle that resolves sharing, ownership and
//!   part membership, and maintains the one-hop aura and custom ghostings
//! - Pluggable communication: single process, in-process thread worlds for
//!   testing, and MPI behind the `mpi-support` feature
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! mesh-bulk = "0.3"
//! # features = ["mpi-support", "rayon"]
//! ```
//!
//! ```
//! use std::sync::Arc;
//! use mesh_bulk::prelude::*;
//!
//! let mut meta = MetaData::new();
//! let block = meta.declare_part("block_1", Some(EntityRank::ELEMENT)).unwrap();
//! meta.commit();
//!
//! let mut mesh = BulkData::new(Arc::new(meta), NoComm, MeshConfig::default()).unwrap();
//! mesh.begin_modification().unwrap();
//! let quad = mesh
//!     .declare_element(1, Topology::Quadrilateral2D, &[1, 2, 3, 4], &[block])
//!     .unwrap();
//! mesh.end_modification().unwrap();
//!
//! assert_eq!(mesh.downward(quad, EntityRank::NODE).unwrap().len(), 4);
//! ```
//!
//! ## Collective operations
//!
//! `end_modification`, `generate_new_ids`, `generate_new_entities` and
//! `verify_parallel_consistency` must be called by every process of the
//! communicator in the same order.

pub mod algs;
pub mod data;
pub mod debug_invariants;
pub mod mesh;
pub mod mesh_error;
pub mod overlap;
pub mod topology;

pub use debug_invariants::DebugInvariants;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{Communicator, LocalComm, LocalWorld, NoComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::data::bucket::FieldDataObserver;
    pub use crate::data::meta::{MetaData, PartOrdinal};
    pub use crate::data::selector::Selector;
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::mesh::{BulkData, ConnectivityPolicy, MeshConfig, ModificationState, VerifyMode};
    pub use crate::mesh_error::MeshError;
    pub use crate::overlap::comm_map::{CommMapEntry, GhostId};
    pub use crate::topology::cell_type::Topology;
    pub use crate::topology::entity::{Entity, EntityState};
    pub use crate::topology::entity_key::{EntityKey, EntityRank};
}
