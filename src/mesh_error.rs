//! MeshError: Unified error type for mesh-bulk public APIs
//!
//! Every fallible operation of the mesh database returns this type. Variants
//! in the "precondition" group indicate a caller bug; none of them is ever
//! retried internally.

use crate::topology::entity::Entity;
use crate::topology::entity_key::{EntityKey, EntityRank};
use thiserror::Error;

/// Unified error type for mesh-bulk operations.
#[derive(Debug, Error)]
pub enum MeshError {
    // ----- keys and handles ------------------------------------------------
    /// Entity ids are 1-based; 0 is reserved as invalid.
    #[error("entity id must be in 1..={max} (got {id})")]
    InvalidEntityId { id: u64, max: u64 },
    /// Rank outside of the supported rank range.
    #[error("entity rank {0} is out of range")]
    InvalidRank(u8),
    /// Handle does not refer to a live entity on this process.
    #[error("stale or destroyed entity handle {0:?}")]
    StaleEntity(Entity),
    /// No entity with this key exists on this process.
    #[error("no entity with key {0}")]
    UnknownKey(EntityKey),

    // ----- modification state machine -------------------------------------
    #[error("`{op}` requires the mesh to be in the modifiable state")]
    NotModifiable { op: &'static str },
    #[error("begin_modification called while already modifiable")]
    AlreadyModifiable,

    // ----- relations ------------------------------------------------------
    #[error("relation from {from} to {to} must point from higher to lower rank")]
    RelationRankOrder { from: EntityKey, to: EntityKey },
    #[error("ordinal {ordinal} of {from} already relates to {existing} (requested {requested})")]
    RelationOrdinalInUse {
        from: EntityKey,
        ordinal: u16,
        existing: EntityKey,
        requested: EntityKey,
    },
    #[error("relation from {from} to ghost {to} is not allowed; declare the ghost locally first")]
    RelationToGhost { from: EntityKey, to: EntityKey },
    #[error("no permutation of {candidate} matches side {side} of {parent}")]
    PermutationNotFound {
        parent: EntityKey,
        side: u16,
        candidate: EntityKey,
    },
    #[error("topology error: {0}")]
    Topology(String),

    // ----- parts ----------------------------------------------------------
    #[error("part `{part}` has primary rank {part_rank} and cannot hold {entity}")]
    PartRankMismatch {
        part: String,
        part_rank: EntityRank,
        entity: EntityKey,
    },
    #[error("part `{0}` is maintained by the mesh and cannot be changed directly")]
    BookkeepingPart(String),
    #[error("unknown part `{0}`")]
    UnknownPart(String),
    #[error("part `{0}` is already declared")]
    DuplicatePart(String),
    #[error("metadata is committed; no further parts can be declared")]
    MetaDataCommitted,
    #[error("metadata must be committed before a mesh can be built on it")]
    MetaDataNotCommitted,

    // ----- ownership and ghosting ----------------------------------------
    #[error("cannot mutate ghost entity {0}")]
    GhostMutation(EntityKey),
    #[error("cannot re-key {0}: entity is shared or ghosted")]
    RekeyShared(EntityKey),
    #[error("cannot re-key {from} to {to}: key already in use")]
    RekeyCollision { from: EntityKey, to: EntityKey },
    #[error("cannot ghost {key} from rank {rank}: entity is not locally owned")]
    NotOwned { key: EntityKey, rank: usize },
    #[error("cannot change parts of {key} on rank {rank}: it is shared and owned by rank {owner}")]
    PartChangeNotOwned {
        key: EntityKey,
        rank: usize,
        owner: usize,
    },
    #[error("unknown ghosting id {0}")]
    UnknownGhosting(u32),
    #[error("ghosting `{0}` is built in and cannot be changed directly")]
    BuiltInGhosting(String),
    #[error("destination rank {proc} is outside the communicator (size {size})")]
    InvalidProc { proc: usize, size: usize },

    // ----- collective id generation --------------------------------------
    #[error("global id space exhausted for rank {rank}")]
    IdSpaceExhausted { rank: EntityRank },

    // ----- communication ---------------------------------------------------
    #[error("communication with rank {neighbor} failed: {source}")]
    CommError {
        neighbor: usize,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("rank {neighbor}: expected {expected} bytes, got {got}")]
    BufferSizeMismatch {
        neighbor: usize,
        expected: usize,
        got: usize,
    },
    #[error("malformed message: {0}")]
    Wire(String),
    #[error("relation target {0} of a received entity is unknown on this process")]
    MissingRelationTarget(EntityKey),

    // ----- verification ---------------------------------------------------
    #[error("parallel consistency check failed:\n{report}")]
    ParallelInconsistency { report: String },
    #[error("local invariant violated: {0}")]
    Invariant(String),
}
