//! `BulkData`: the per-process mesh database.
//!
//! Owns the entity registry, the bucket repository, the ghosting channels
//! and the global comm list, and drives the modification cycle:
//!
//! ```text
//! SYNCHRONIZED --begin--> MODIFIABLE --(local edits)*--> MODIFIABLE --end--> SYNCHRONIZED
//! ```
//!
//! `end_modification` is collective: every process of the communicator must
//! call it, in the same cycle, or the run hangs.

use std::sync::Arc;

use hashbrown::HashMap;

use crate::algs::communicator::{Communicator, NoComm};
use crate::data::bucket::{Bucket, BucketLocation, BucketRepository, FieldDataObserver, Observers};
use crate::data::meta::{MetaData, PartOrdinal};
use crate::data::registry::{EntityRegistry, EntitySlot};
use crate::data::selector::Selector;
use crate::debug_invariants::DebugInvariants;
use crate::mesh::config::MeshConfig;
use crate::mesh_error::MeshError;
use crate::overlap::comm_map::{self, CommList, CommMapEntry, GhostId};
use crate::overlap::ghosting::Ghosting;
use crate::topology::cell_type::Topology;
use crate::topology::entity::{Entity, EntityState};
use crate::topology::entity_key::{EntityKey, EntityRank};
use crate::topology::relation::{self, Relation};

/// Message tags of the synchronization protocol. Each exchange uses its tag
/// and the one after it.
pub(super) mod tags {
    use crate::algs::communicator::CommTag;

    pub const SHARING_RETRACT: CommTag = CommTag::new(100);
    pub const KEY_DIRECTORY: CommTag = CommTag::new(102);
    pub const KEY_HOLDERS: CommTag = CommTag::new(104);
    pub const SIDE_CANDIDATES: CommTag = CommTag::new(106);
    pub const SIDE_MATCHES: CommTag = CommTag::new(108);
    pub const REKEY: CommTag = CommTag::new(110);
    pub const PART_NOTICE: CommTag = CommTag::new(112);
    pub const PART_REQUEST: CommTag = CommTag::new(114);
    pub const PART_REPLY: CommTag = CommTag::new(116);
    pub const GHOST_REMOVE: CommTag = CommTag::new(118);
    pub const GHOST_FORWARD: CommTag = CommTag::new(120);
    pub const GHOST_FORWARD_DONE: CommTag = CommTag::new(122);
    pub const GHOST_RECORDS: CommTag = CommTag::new(124);
    pub const GHOST_CHANGED: CommTag = CommTag::new(126);
    pub const VERIFY: CommTag = CommTag::new(128);
    pub const VERIFY_FLAG: CommTag = CommTag::new(130);
    pub const ID_GEN: CommTag = CommTag::new(132);
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ModificationState {
    Synchronized,
    Modifiable,
}

/// What the protocol still needs to know about an entity destroyed this cycle.
#[derive(Clone, Debug)]
pub(super) struct DeletedEntity {
    pub key: EntityKey,
    pub was_ghost: bool,
    pub comm: Vec<CommMapEntry>,
}

/// The mesh database of one process.
pub struct BulkData<C: Communicator = NoComm> {
    pub(super) meta: Arc<MetaData>,
    pub(super) comm: C,
    pub(super) config: MeshConfig,
    pub(super) registry: EntityRegistry,
    pub(super) buckets: BucketRepository,
    pub(super) observers: Observers,
    pub(super) ghostings: Vec<Ghosting>,
    pub(super) comm_list: CommList,
    pub(super) mod_state: ModificationState,
    pub(super) sync_count: u64,
    /// Destroyed this cycle.
    pub(super) deleted: Vec<DeletedEntity>,
    /// Entities re-keyed by the application this cycle, with their old key.
    pub(super) renamed: Vec<(EntityKey, Entity)>,
    /// Holder sets of the keys this process is the directory for.
    pub(super) directory: HashMap<EntityKey, Vec<usize>>,
}

impl<C: Communicator> BulkData<C> {
    /// Build an empty mesh on committed metadata.
    pub fn new(meta: Arc<MetaData>, comm: C, config: MeshConfig) -> Result<Self, MeshError> {
        Self::with_observers(meta, comm, config, Vec::new())
    }

    /// Build an empty mesh that reports bucket and entity placement to
    /// `observers`.
    pub fn with_observers(
        meta: Arc<MetaData>,
        comm: C,
        config: MeshConfig,
        observers: Vec<Box<dyn FieldDataObserver>>,
    ) -> Result<Self, MeshError> {
        if !meta.is_committed() {
            return Err(MeshError::MetaDataNotCommitted);
        }
        let buckets = BucketRepository::new(config.bucket_capacity);
        Ok(Self {
            meta,
            comm,
            config,
            registry: EntityRegistry::new(),
            buckets,
            observers,
            ghostings: vec![
                Ghosting::new(GhostId::SHARED, "shared"),
                Ghosting::new(GhostId::AURA, "aura"),
            ],
            comm_list: CommList::new(),
            mod_state: ModificationState::Synchronized,
            sync_count: 0,
            deleted: Vec::new(),
            renamed: Vec::new(),
            directory: HashMap::new(),
        })
    }

    // ----- state machine --------------------------------------------------

    pub fn begin_modification(&mut self) -> Result<(), MeshError> {
        if self.mod_state == ModificationState::Modifiable {
            return Err(MeshError::AlreadyModifiable);
        }
        self.mod_state = ModificationState::Modifiable;
        Ok(())
    }

    /// Resolve this cycle's local edits into a globally consistent mesh.
    ///
    /// Returns `Ok(false)` without communicating when the mesh is already
    /// synchronized. On error the mesh is left modifiable and its parallel
    /// state is unspecified.
    pub fn end_modification(&mut self) -> Result<bool, MeshError> {
        if self.mod_state == ModificationState::Synchronized {
            return Ok(false);
        }
        if self.comm.size() > 1 {
            self.resolve_sharing()?;
            self.resolve_ownership()?;
            self.reclassify_bookkeeping()?;
            self.reconcile_shared_parts()?;
            self.update_ghosting()?;
            self.reclassify_bookkeeping()?;
            if self.config.verify.enabled() {
                self.verify_parallel_consistency()?;
            }
        } else {
            self.update_local_ghostings();
            self.reclassify_bookkeeping()?;
        }
        self.finish_cycle()?;
        self.debug_assert_invariants();
        Ok(true)
    }

    fn finish_cycle(&mut self) -> Result<(), MeshError> {
        let reclaimed = self.registry.reclaim_deleted();
        self.deleted.clear();
        self.renamed.clear();
        let live: Vec<Entity> = self.registry.live().collect();
        let mut communicated = Vec::new();
        for e in live {
            let slot = self.registry.slot_mut(e)?;
            slot.state = EntityState::Unchanged;
            if let (Some(key), false) = (slot.key, slot.comm.is_empty()) {
                communicated.push((key, e));
            }
        }
        self.comm_list.rebuild(communicated);
        self.mod_state = ModificationState::Synchronized;
        self.sync_count += 1;
        log::debug!(
            "rank {}: cycle {} done, {} entities, {} communicated, {} slots reclaimed",
            self.parallel_rank(),
            self.sync_count,
            self.registry.len(),
            self.comm_list.len(),
            reclaimed
        );
        Ok(())
    }

    pub(super) fn require_modifiable(&self, op: &'static str) -> Result<(), MeshError> {
        if self.mod_state == ModificationState::Modifiable {
            Ok(())
        } else {
            Err(MeshError::NotModifiable { op })
        }
    }

    // ----- queries --------------------------------------------------------

    pub fn meta(&self) -> &MetaData {
        &self.meta
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn parallel_rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn parallel_size(&self) -> usize {
        self.comm.size()
    }

    pub fn modification_state(&self) -> ModificationState {
        self.mod_state
    }

    pub fn in_synchronized_state(&self) -> bool {
        self.mod_state == ModificationState::Synchronized
    }

    pub fn in_modifiable_state(&self) -> bool {
        self.mod_state == ModificationState::Modifiable
    }

    /// Number of completed modification cycles.
    pub fn synchronized_count(&self) -> u64 {
        self.sync_count
    }

    pub fn entity(&self, key: EntityKey) -> Option<Entity> {
        self.registry.lookup(key)
    }

    pub fn is_valid(&self, e: Entity) -> bool {
        self.registry.is_valid(e)
    }

    pub fn entity_key(&self, e: Entity) -> Result<EntityKey, MeshError> {
        self.registry.key(e)
    }

    pub fn entity_rank(&self, e: Entity) -> Result<EntityRank, MeshError> {
        Ok(self.registry.key(e)?.rank())
    }

    pub fn state(&self, e: Entity) -> Result<EntityState, MeshError> {
        Ok(self.registry.slot(e)?.state)
    }

    pub fn topology(&self, e: Entity) -> Result<Topology, MeshError> {
        Ok(self.registry.slot(e)?.topology)
    }

    /// Owning process of `e`.
    pub fn parallel_owner_rank(&self, e: Entity) -> Result<usize, MeshError> {
        Ok(self.registry.slot(e)?.owner)
    }

    pub fn owner(&self, e: Entity) -> Result<usize, MeshError> {
        self.parallel_owner_rank(e)
    }

    pub fn is_locally_owned(&self, e: Entity) -> Result<bool, MeshError> {
        Ok(self.registry.slot(e)?.owner == self.parallel_rank())
    }

    pub fn is_shared(&self, e: Entity) -> Result<bool, MeshError> {
        Ok(comm_map::is_shared(&self.registry.slot(e)?.comm))
    }

    /// Whether `e` is a ghost received from another process.
    pub fn is_ghost(&self, e: Entity) -> Result<bool, MeshError> {
        Ok(self.slot_is_ghost(self.registry.slot(e)?))
    }

    pub fn location(&self, e: Entity) -> Result<BucketLocation, MeshError> {
        self.registry
            .slot(e)?
            .location
            .ok_or_else(|| MeshError::Invariant(format!("{e:?} has no bucket")))
    }

    pub fn bucket_of(&self, e: Entity) -> Result<&Bucket, MeshError> {
        let rank = self.entity_rank(e)?;
        let loc = self.location(e)?;
        self.buckets
            .bucket(rank, loc.bucket)
            .ok_or_else(|| MeshError::Invariant(format!("{e:?} points at a missing bucket")))
    }

    /// Sorted part ordinals of `e`, bookkeeping parts included.
    pub fn parts(&self, e: Entity) -> Result<&[PartOrdinal], MeshError> {
        Ok(&self.registry.slot(e)?.parts)
    }

    pub fn has_part(&self, e: Entity, part: PartOrdinal) -> Result<bool, MeshError> {
        Ok(self.parts(e)?.binary_search(&part).is_ok())
    }

    /// All stored relations of `e`: downward first, then stored upward ones.
    pub fn relations(&self, e: Entity) -> Result<&[Relation], MeshError> {
        Ok(&self.registry.slot(e)?.relations)
    }

    /// Downward relations of `e` to entities of `rank`, ordered by ordinal.
    pub fn downward(&self, e: Entity, rank: EntityRank) -> Result<&[Relation], MeshError> {
        let slot = self.registry.slot(e)?;
        let own = slot.key.map(|k| k.rank()).unwrap_or_default();
        if rank >= own {
            return Ok(&[]);
        }
        Ok(relation::of_rank(&slot.relations, rank))
    }

    /// Upward relations of `e` from entities of `rank`. Stored or scanned
    /// depending on the connectivity policy.
    pub fn upward(&self, e: Entity, rank: EntityRank) -> Result<Vec<Relation>, MeshError> {
        Ok(self
            .upward_relations(e)?
            .into_iter()
            .filter(|r| r.rank == rank)
            .collect())
    }

    /// Processes `e` is shared with, ascending.
    pub fn sharing_procs(&self, e: Entity) -> Result<Vec<usize>, MeshError> {
        Ok(comm_map::sharing_procs(&self.registry.slot(e)?.comm).collect())
    }

    pub fn comm_map(&self, e: Entity) -> Result<&[CommMapEntry], MeshError> {
        Ok(&self.registry.slot(e)?.comm)
    }

    /// Key-sorted list of entities with a non-empty comm map, as of the last
    /// completed cycle.
    pub fn comm_list(&self) -> &CommList {
        &self.comm_list
    }

    /// Processes on channel `ghost` for `e`: receivers on the owner, the
    /// owner on a receiver.
    pub fn ghosting_procs(&self, e: Entity, ghost: GhostId) -> Result<Vec<usize>, MeshError> {
        Ok(comm_map::channel(&self.registry.slot(e)?.comm, ghost)
            .iter()
            .map(|c| c.proc())
            .collect())
    }

    pub fn ghostings(&self) -> &[Ghosting] {
        &self.ghostings
    }

    pub fn ghosting(&self, id: GhostId) -> Result<&Ghosting, MeshError> {
        self.ghostings
            .get(id.get() as usize)
            .ok_or(MeshError::UnknownGhosting(id.get()))
    }

    pub fn buckets(&self, rank: EntityRank) -> impl Iterator<Item = &Bucket> + '_ {
        self.buckets.buckets(rank)
    }

    /// Live entities of `rank`, sorted by key.
    pub fn entities(&self, rank: EntityRank) -> Vec<Entity> {
        let mut out: Vec<(EntityKey, Entity)> = self
            .buckets
            .buckets(rank)
            .flat_map(|b| b.entities().iter().copied())
            .filter_map(|e| self.registry.key(e).ok().map(|k| (k, e)))
            .collect();
        out.sort_unstable();
        out.into_iter().map(|(_, e)| e).collect()
    }

    pub fn count_entities(&self, rank: EntityRank, selector: &Selector) -> usize {
        self.buckets
            .buckets(rank)
            .filter(|b| selector.matches(b.parts()))
            .map(|b| b.len())
            .sum()
    }

    /// Number of live entities of every rank.
    pub fn entity_count(&self) -> usize {
        self.registry.len()
    }

    pub fn observers(&self) -> &[Box<dyn FieldDataObserver>] {
        &self.observers
    }

    // ----- internal helpers shared by the protocol modules ----------------

    pub(super) fn slot_is_ghost(&self, slot: &EntitySlot) -> bool {
        slot.owner != self.parallel_rank()
            && !comm_map::is_shared(&slot.comm)
            && slot.comm.iter().any(|c| c.ghost.is_ghosting())
    }

    /// Owned or shared here: the process holds a real copy.
    pub(super) fn slot_is_held(&self, slot: &EntitySlot) -> bool {
        slot.owner == self.parallel_rank() || comm_map::is_shared(&slot.comm)
    }

    /// Reject part ordinals received from another process that this
    /// metadata does not know.
    pub(super) fn check_parts(&self, parts: &[PartOrdinal]) -> Result<(), MeshError> {
        for &p in parts {
            self.meta
                .check(p)
                .map_err(|_| MeshError::Wire(format!("unknown part ordinal {}", p.get())))?;
        }
        Ok(())
    }

    /// Non-bookkeeping parts of `e`.
    pub(super) fn app_parts(&self, e: Entity) -> Result<Vec<PartOrdinal>, MeshError> {
        Ok(self
            .registry
            .slot(e)?
            .parts
            .iter()
            .copied()
            .filter(|&p| !self.meta.is_bookkeeping(p))
            .collect())
    }

    pub(super) fn touch(&mut self, e: Entity) -> Result<(), MeshError> {
        let slot = self.registry.slot_mut(e)?;
        slot.state = slot.state.touched();
        Ok(())
    }

    /// Mark every entity above `e` as modified.
    pub(super) fn mark_upward_closure(&mut self, e: Entity) -> Result<(), MeshError> {
        let mut stack = vec![e];
        let mut seen = hashbrown::HashSet::new();
        while let Some(x) = stack.pop() {
            for r in self.upward_relations(x)? {
                if seen.insert(r.entity) {
                    self.touch(r.entity)?;
                    stack.push(r.entity);
                }
            }
        }
        Ok(())
    }

    /// Upward relations of `e` from every higher rank, read from storage
    /// where the policy keeps them and scanned otherwise.
    pub(super) fn upward_relations(&self, e: Entity) -> Result<Vec<Relation>, MeshError> {
        let slot = self.registry.slot(e)?;
        let rank = self.registry.key(e)?.rank();
        let mut out = Vec::new();
        for hi in EntityRank::all().filter(|&r| r > rank) {
            if self.config.connectivity.stores_upward(rank, hi) {
                out.extend_from_slice(relation::of_rank(&slot.relations, hi));
                continue;
            }
            for bucket in self.buckets.buckets(hi) {
                for &u in bucket.entities() {
                    let us = self.registry.slot(u)?;
                    for r in relation::of_rank(&us.relations, rank) {
                        if r.entity == e {
                            out.push(Relation::new(hi, r.ordinal, r.permutation, u));
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    /// `e` and everything reachable from it through downward relations.
    pub(super) fn downward_closure(&self, e: Entity) -> Result<Vec<Entity>, MeshError> {
        let mut out = vec![e];
        let mut i = 0;
        while i < out.len() {
            let x = out[i];
            let rank = self.registry.key(x)?.rank();
            for r in relation::below(&self.registry.slot(x)?.relations, rank) {
                if !out.contains(&r.entity) {
                    out.push(r.entity);
                }
            }
            i += 1;
        }
        Ok(out)
    }

    /// Put `e` into the bucket matching its current parts, leaving its old
    /// bucket if it had one.
    pub(super) fn place(&mut self, e: Entity) -> Result<(), MeshError> {
        let rank = self.registry.key(e)?.rank();
        self.unplace(e)?;
        let parts = self.registry.slot(e)?.parts.clone();
        let loc = self.buckets.insert(rank, &parts, e, &mut self.observers);
        self.registry.slot_mut(e)?.location = Some(loc);
        Ok(())
    }

    /// Remove `e` from its bucket, fixing up the entity swapped into its spot.
    pub(super) fn unplace(&mut self, e: Entity) -> Result<(), MeshError> {
        let rank = self.registry.key(e)?.rank();
        let Some(loc) = self.registry.slot_mut(e)?.location.take() else {
            return Ok(());
        };
        if let Some(moved) = self.buckets.remove(rank, loc, &mut self.observers) {
            self.registry.slot_mut(moved)?.location = Some(loc);
        }
        Ok(())
    }

    /// Replace the full part list of `e` and relocate it. Returns whether
    /// anything changed.
    pub(super) fn replace_parts(
        &mut self,
        e: Entity,
        mut parts: Vec<PartOrdinal>,
    ) -> Result<bool, MeshError> {
        parts.sort_unstable();
        parts.dedup();
        if self.registry.slot(e)?.parts == parts {
            return Ok(false);
        }
        self.registry.slot_mut(e)?.parts = parts;
        self.place(e)?;
        Ok(true)
    }
}

impl<C: Communicator> std::fmt::Debug for BulkData<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkData")
            .field("rank", &self.parallel_rank())
            .field("size", &self.parallel_size())
            .field("state", &self.mod_state)
            .field("entities", &self.registry.len())
            .field("sync_count", &self.sync_count)
            .finish()
    }
}
