//! Local mutators: entity creation and destruction, relations, part changes
//! and induced-part propagation.
//!
//! Every operation here is process-local and requires the modifiable state.
//! Nothing is communicated until `end_modification`.

use std::sync::Arc;

use crate::algs::communicator::Communicator;
use crate::algs::id_gen::generate_ids;
use crate::data::meta::{MetaData, PartOrdinal};
use crate::mesh::bulk_data::{BulkData, DeletedEntity, tags};
use crate::mesh_error::MeshError;
use crate::overlap::comm_map::{self, GhostId};
use crate::topology::cell_type::Topology;
use crate::topology::entity::{Entity, EntityState};
use crate::topology::entity_key::{EntityKey, EntityRank};
use crate::topology::orientation::find_permutation;
use crate::topology::relation::{self, Relation};

impl<C: Communicator> BulkData<C> {
    /// Declare the entity `(rank, id)` with the given explicit parts.
    ///
    /// An existing key returns its handle and merges `parts` into it. A key
    /// currently held as a ghost is converted into a locally created entity.
    pub fn declare_entity(
        &mut self,
        rank: EntityRank,
        id: u64,
        parts: &[PartOrdinal],
    ) -> Result<Entity, MeshError> {
        self.require_modifiable("declare_entity")?;
        let key = EntityKey::new(rank, id)?;
        let add = self.explicit_closure(key, parts)?;

        if let Some(e) = self.registry.lookup(key) {
            let slot = self.registry.slot(e)?;
            if self.slot_is_ghost(slot) {
                self.convert_ghost(e)?;
            } else if add.iter().any(|p| slot.parts.binary_search(p).is_err()) {
                self.require_part_owner(e)?;
            }
            self.apply_part_change(e, &add, &[])?;
            return Ok(e);
        }

        let me = self.parallel_rank();
        let (e, _) = self.registry.create(key, me);
        let slot = self.registry.slot_mut(e)?;
        slot.topology = if rank == EntityRank::NODE {
            Topology::Vertex
        } else {
            Topology::Unspecified
        };
        let mut initial = Vec::with_capacity(add.len() + 2);
        initial.push(MetaData::UNIVERSAL);
        initial.push(MetaData::LOCALLY_OWNED);
        initial.extend_from_slice(&add);
        initial.sort_unstable();
        initial.dedup();
        slot.parts = initial;
        self.place(e)?;
        log::trace!("rank {me}: declared {key}");
        Ok(e)
    }

    /// Turn a received ghost into an entity created here this cycle. Its
    /// explicit parts and relations are kept; its ghost entries are dropped.
    fn convert_ghost(&mut self, e: Entity) -> Result<(), MeshError> {
        let me = self.parallel_rank();
        let meta = Arc::clone(&self.meta);
        let rank = self.registry.key(e)?.rank();
        let slot = self.registry.slot_mut(e)?;
        slot.comm.clear();
        slot.owner = me;
        slot.state = EntityState::Created;
        let mut parts: Vec<PartOrdinal> = slot
            .parts
            .iter()
            .copied()
            .filter(|&p| !meta.is_bookkeeping(p))
            .collect();
        parts.push(MetaData::UNIVERSAL);
        parts.push(MetaData::LOCALLY_OWNED);
        self.replace_parts(e, parts)?;
        self.refresh_induced(e)?;
        log::debug!(
            "rank {me}: ghost {} of rank {rank} declared locally",
            self.registry.key(e)?
        );
        Ok(())
    }

    /// Declare an element of `topology` over the nodes `node_ids`, creating
    /// missing nodes and relating them with ordinals `0..n`.
    pub fn declare_element(
        &mut self,
        id: u64,
        topology: Topology,
        node_ids: &[u64],
        parts: &[PartOrdinal],
    ) -> Result<Entity, MeshError> {
        self.require_modifiable("declare_element")?;
        if topology.rank() != Some(EntityRank::ELEMENT) {
            return Err(MeshError::Topology(format!(
                "{topology:?} is not an element topology"
            )));
        }
        if node_ids.len() != topology.node_count() {
            return Err(MeshError::Topology(format!(
                "{topology:?} needs {} nodes, got {}",
                topology.node_count(),
                node_ids.len()
            )));
        }
        let elem = self.declare_entity(EntityRank::ELEMENT, id, parts)?;
        self.registry.slot_mut(elem)?.topology = topology;
        for (ordinal, &nid) in node_ids.iter().enumerate() {
            let node = self.declare_entity(EntityRank::NODE, nid, &[])?;
            self.declare_relation(elem, node, ordinal as u16, 0)?;
        }
        Ok(elem)
    }

    /// Create (or reuse) side `side_ordinal` of `elem` with id `side_id`.
    ///
    /// A fresh side gets the element's side nodes in the side's own order.
    /// An existing side is related under the permutation that maps its node
    /// order onto the element's view of it.
    pub fn declare_element_side(
        &mut self,
        elem: Entity,
        side_ordinal: u16,
        side_id: u64,
        parts: &[PartOrdinal],
    ) -> Result<Entity, MeshError> {
        self.require_modifiable("declare_element_side")?;
        let elem_key = self.registry.key(elem)?;
        if self.slot_is_ghost(self.registry.slot(elem)?) {
            return Err(MeshError::GhostMutation(elem_key));
        }
        let topo = self.registry.slot(elem)?.topology;
        let side_rank = topo
            .side_rank()
            .ok_or_else(|| MeshError::Topology(format!("{topo:?} has no sides")))?;
        let side_topo = topo.side_topology(side_ordinal as usize)?;
        let local = topo.side_nodes(side_ordinal as usize)?;

        let elem_nodes = relation::of_rank(&self.registry.slot(elem)?.relations, EntityRank::NODE);
        let mut expected = Vec::with_capacity(local.len());
        for &li in local {
            let node = elem_nodes
                .iter()
                .find(|r| r.ordinal == li as u16)
                .map(|r| r.entity)
                .ok_or_else(|| {
                    MeshError::Topology(format!("{elem_key} has no node at ordinal {li}"))
                })?;
            expected.push(node);
        }

        let side = self.declare_entity(side_rank, side_id, parts)?;
        let side_key = self.registry.key(side)?;
        let existing: Vec<Entity> = {
            let mut nodes: Vec<Relation> =
                relation::of_rank(&self.registry.slot(side)?.relations, EntityRank::NODE).to_vec();
            nodes.sort_by_key(|r| r.ordinal);
            nodes.into_iter().map(|r| r.entity).collect()
        };

        let permutation = if existing.is_empty() {
            self.registry.slot_mut(side)?.topology = side_topo;
            for (i, &node) in expected.iter().enumerate() {
                self.declare_relation(side, node, i as u16, 0)?;
            }
            0
        } else {
            find_permutation(side_topo, &expected, &existing).ok_or(
                MeshError::PermutationNotFound {
                    parent: elem_key,
                    side: side_ordinal,
                    candidate: side_key,
                },
            )?
        };
        self.declare_relation(elem, side, side_ordinal, permutation)?;
        Ok(side)
    }

    /// Destroy `e`. Returns `Ok(false)` and changes nothing when a
    /// higher-rank entity still relates to it.
    pub fn destroy_entity(&mut self, e: Entity) -> Result<bool, MeshError> {
        self.require_modifiable("destroy_entity")?;
        let key = self.registry.key(e)?;
        if self.slot_is_ghost(self.registry.slot(e)?) {
            return Err(MeshError::GhostMutation(key));
        }
        self.destroy_internal(e)
    }

    /// Destroy without the ghost check; used when tearing down ghosts.
    pub(super) fn destroy_internal(&mut self, e: Entity) -> Result<bool, MeshError> {
        if !self.upward_relations(e)?.is_empty() {
            return Ok(false);
        }
        let key = self.registry.key(e)?;
        let was_ghost = !self.slot_is_held(self.registry.slot(e)?);
        let comm = self.registry.slot(e)?.comm.clone();

        let mut downward = std::mem::take(&mut self.registry.slot_mut(e)?.relations);
        // back-relations of the highest ranks go first
        downward.sort_by(|a, b| b.rank.cmp(&a.rank).then(a.ordinal.cmp(&b.ordinal)));
        for r in &downward {
            if self.config.connectivity.stores_upward(r.rank, key.rank()) {
                let target = self.registry.slot_mut(r.entity)?;
                relation::remove_sorted(&mut target.relations, key.rank(), r.ordinal, e);
            }
            self.touch(r.entity)?;
        }

        self.unplace(e)?;
        self.registry.mark_deleted(e, was_ghost)?;
        for g in self.ghostings.iter_mut() {
            if g.roots().iter().any(|&(root, _)| root == e) {
                let kept = g.roots().iter().copied().filter(|&(root, _)| root != e).collect();
                g.set_roots(kept);
            }
            g.forget_pending(e);
        }
        self.deleted.push(DeletedEntity {
            key,
            was_ghost,
            comm,
        });

        // ghosts never induce, so their targets keep what they have
        if !was_ghost {
            for r in &downward {
                if self.registry.is_valid(r.entity) {
                    self.refresh_induced(r.entity)?;
                }
            }
        }
        log::trace!("rank {}: destroyed {key}", self.parallel_rank());
        Ok(true)
    }

    /// Declare the relation `from -> to` at `ordinal` with `permutation`.
    ///
    /// `from` must have the higher rank. The back-relation is stored when
    /// the connectivity policy keeps that rank pair. Induced parts of `from`
    /// propagate onto `to`.
    pub fn declare_relation(
        &mut self,
        from: Entity,
        to: Entity,
        ordinal: u16,
        permutation: u8,
    ) -> Result<(), MeshError> {
        self.require_modifiable("declare_relation")?;
        let fk = self.registry.key(from)?;
        let tk = self.registry.key(to)?;
        if fk.rank() <= tk.rank() {
            return Err(MeshError::RelationRankOrder { from: fk, to: tk });
        }
        if self.slot_is_ghost(self.registry.slot(from)?) {
            return Err(MeshError::GhostMutation(fk));
        }
        if self.slot_is_ghost(self.registry.slot(to)?) {
            return Err(MeshError::RelationToGhost { from: fk, to: tk });
        }
        let taken = relation::of_rank(&self.registry.slot(from)?.relations, tk.rank())
            .iter()
            .find(|r| r.ordinal == ordinal && r.entity != to)
            .map(|r| r.entity);
        if let Some(other) = taken {
            return Err(MeshError::RelationOrdinalInUse {
                from: fk,
                ordinal,
                existing: self.registry.key(other)?,
                requested: tk,
            });
        }

        if self.link(from, to, ordinal, permutation)? {
            self.touch(from)?;
            self.touch(to)?;
            self.mark_upward_closure(to)?;
            self.refresh_induced(to)?;
        }
        Ok(())
    }

    /// Remove the relation `from -> to` at `ordinal`. Returns whether it
    /// existed. Parts of `to` still induced by other relations survive.
    pub fn destroy_relation(
        &mut self,
        from: Entity,
        to: Entity,
        ordinal: u16,
    ) -> Result<bool, MeshError> {
        self.require_modifiable("destroy_relation")?;
        let fk = self.registry.key(from)?;
        if self.slot_is_ghost(self.registry.slot(from)?) {
            return Err(MeshError::GhostMutation(fk));
        }
        if !self.unlink(from, to, ordinal)? {
            return Ok(false);
        }
        self.touch(from)?;
        self.touch(to)?;
        self.mark_upward_closure(from)?;
        self.refresh_induced(to)?;
        Ok(true)
    }

    /// Store `from -> to` and, per policy, its back-relation. No state marks.
    pub(super) fn link(
        &mut self,
        from: Entity,
        to: Entity,
        ordinal: u16,
        permutation: u8,
    ) -> Result<bool, MeshError> {
        let from_rank = self.registry.key(from)?.rank();
        let to_rank = self.registry.key(to)?.rank();
        let fresh = relation::insert_sorted(
            &mut self.registry.slot_mut(from)?.relations,
            Relation::new(to_rank, ordinal, permutation, to),
        );
        if self.config.connectivity.stores_upward(to_rank, from_rank) {
            relation::insert_sorted(
                &mut self.registry.slot_mut(to)?.relations,
                Relation::new(from_rank, ordinal, permutation, from),
            );
        }
        Ok(fresh)
    }

    pub(super) fn unlink(&mut self, from: Entity, to: Entity, ordinal: u16) -> Result<bool, MeshError> {
        let from_rank = self.registry.key(from)?.rank();
        let to_rank = self.registry.key(to)?.rank();
        let removed = relation::remove_sorted(
            &mut self.registry.slot_mut(from)?.relations,
            to_rank,
            ordinal,
            to,
        );
        if self.config.connectivity.stores_upward(to_rank, from_rank) {
            relation::remove_sorted(
                &mut self.registry.slot_mut(to)?.relations,
                from_rank,
                ordinal,
                from,
            );
        }
        Ok(removed)
    }

    /// Add and remove explicit parts of `e`.
    ///
    /// `add` is closed under supersets; `remove` under subsets not implied
    /// by `add`. Bookkeeping parts are rejected, and a shared entity can
    /// only be changed on its owner.
    pub fn change_parts(
        &mut self,
        e: Entity,
        add: &[PartOrdinal],
        remove: &[PartOrdinal],
    ) -> Result<(), MeshError> {
        self.require_modifiable("change_parts")?;
        let key = self.registry.key(e)?;
        if self.slot_is_ghost(self.registry.slot(e)?) {
            return Err(MeshError::GhostMutation(key));
        }
        self.require_part_owner(e)?;
        let add = self.explicit_closure(key, add)?;
        for &p in remove {
            self.check_explicit(key, p)?;
        }
        let mut drop: Vec<PartOrdinal> = remove.to_vec();
        for &p in remove {
            drop.extend_from_slice(self.meta.part(p).subsets());
        }
        drop.sort_unstable();
        drop.dedup();
        drop.retain(|p| add.binary_search(p).is_err() && self.is_explicit_on(*p, key.rank()));
        self.apply_part_change(e, &add, &drop)
    }

    /// Explicit parts of a shared entity follow its owner, so only the owner
    /// may change them.
    fn require_part_owner(&self, e: Entity) -> Result<(), MeshError> {
        let slot = self.registry.slot(e)?;
        let me = self.parallel_rank();
        if slot.owner != me && comm_map::is_shared(&slot.comm) {
            return Err(MeshError::PartChangeNotOwned {
                key: self.registry.key(e)?,
                rank: me,
                owner: slot.owner,
            });
        }
        Ok(())
    }

    /// Apply already expanded part lists and propagate to downward entities.
    pub(super) fn apply_part_change(
        &mut self,
        e: Entity,
        add: &[PartOrdinal],
        remove: &[PartOrdinal],
    ) -> Result<(), MeshError> {
        let current = &self.registry.slot(e)?.parts;
        let mut parts: Vec<PartOrdinal> = current
            .iter()
            .copied()
            .filter(|p| !remove.contains(p))
            .collect();
        parts.extend_from_slice(add);
        if !self.replace_parts(e, parts)? {
            return Ok(());
        }
        self.touch(e)?;
        self.mark_upward_closure(e)?;
        let rank = self.registry.key(e)?.rank();
        let below: Vec<Entity> = relation::below(&self.registry.slot(e)?.relations, rank)
            .iter()
            .map(|r| r.entity)
            .collect();
        for t in below {
            self.refresh_induced(t)?;
        }
        Ok(())
    }

    /// Recompute the induced parts of `t` from its non-ghost upward
    /// relations. Ghosts keep the parts their owner sent.
    pub(super) fn refresh_induced(&mut self, t: Entity) -> Result<(), MeshError> {
        if self.slot_is_ghost(self.registry.slot(t)?) {
            return Ok(());
        }
        let rank = self.registry.key(t)?.rank();
        let induced = self.locally_justified_induced(t)?;
        let meta = Arc::clone(&self.meta);
        let mut parts: Vec<PartOrdinal> = self
            .registry
            .slot(t)?
            .parts
            .iter()
            .copied()
            .filter(|&p| !meta.part(p).is_induced_on(rank))
            .collect();
        parts.extend(induced);
        if self.replace_parts(t, parts)? {
            self.touch(t)?;
        }
        Ok(())
    }

    /// Union of the parts induced on `t` by its non-ghost upward relations.
    pub(super) fn locally_justified_induced(&self, t: Entity) -> Result<Vec<PartOrdinal>, MeshError> {
        let mut out = Vec::new();
        for r in self.upward_relations(t)? {
            let us = self.registry.slot(r.entity)?;
            if self.slot_is_ghost(us) {
                continue;
            }
            out.extend(self.meta.induced_by(&us.parts, r.rank));
        }
        out.sort_unstable();
        out.dedup();
        Ok(out)
    }

    /// Re-key a purely local entity. Shared or ghosted entities are refused.
    pub fn change_entity_key(&mut self, e: Entity, new_key: EntityKey) -> Result<(), MeshError> {
        self.require_modifiable("change_entity_key")?;
        let old = self.registry.key(e)?;
        if old.rank() != new_key.rank() {
            return Err(MeshError::InvalidRank(new_key.rank().get()));
        }
        if self.is_communicated(e)? {
            return Err(MeshError::RekeyShared(old));
        }
        self.registry.rekey(e, new_key)?;
        if old != new_key {
            self.renamed.push((old, e));
            self.touch(e)?;
            self.mark_upward_closure(e)?;
        }
        Ok(())
    }

    /// Collectively generate `count` fresh ids of `rank`. Every process must
    /// call this in the same order, with its own count (possibly zero).
    pub fn generate_new_ids(&mut self, rank: EntityRank, count: usize) -> Result<Vec<u64>, MeshError> {
        let mut requests = [0usize; EntityRank::COUNT];
        requests[rank.index()] = count;
        let mut ids = self.generate_id_blocks(&requests)?;
        Ok(std::mem::take(&mut ids[rank.index()]))
    }

    /// Collectively generate and declare new entities, `count` per rank.
    pub fn generate_new_entities(
        &mut self,
        requests: &[(EntityRank, usize)],
    ) -> Result<Vec<Entity>, MeshError> {
        let mut counts = [0usize; EntityRank::COUNT];
        for &(rank, n) in requests {
            counts[rank.index()] += n;
        }
        let mut blocks = self.generate_id_blocks(&counts)?;
        let mut out = Vec::with_capacity(counts.iter().sum());
        for &(rank, n) in requests {
            let ids: Vec<u64> = blocks[rank.index()].drain(..n).collect();
            for id in ids {
                out.push(self.declare_entity(rank, id, &[])?);
            }
        }
        Ok(out)
    }

    fn generate_id_blocks(
        &mut self,
        counts: &[usize; EntityRank::COUNT],
    ) -> Result<Vec<Vec<u64>>, MeshError> {
        self.require_modifiable("generate_new_ids")?;
        let mut max_in_use = [0u64; EntityRank::COUNT];
        let mut requests = [0u64; EntityRank::COUNT];
        for rank in EntityRank::all() {
            max_in_use[rank.index()] = self.registry.max_id(rank);
            requests[rank.index()] = counts[rank.index()] as u64;
        }
        let ranges = generate_ids(&self.comm, tags::ID_GEN, &max_in_use, &requests)?;
        Ok(ranges.into_iter().map(|r| r.collect()).collect())
    }

    // ----- part validation ------------------------------------------------

    fn is_explicit_on(&self, p: PartOrdinal, rank: EntityRank) -> bool {
        let part = self.meta.part(p);
        !part.is_bookkeeping() && part.primary_rank().is_none_or(|r| r == rank)
    }

    fn check_explicit(&self, key: EntityKey, p: PartOrdinal) -> Result<(), MeshError> {
        self.meta.check(p)?;
        let part = self.meta.part(p);
        if part.is_bookkeeping() {
            return Err(MeshError::BookkeepingPart(part.name().to_string()));
        }
        match part.primary_rank() {
            Some(r) if r != key.rank() => Err(MeshError::PartRankMismatch {
                part: part.name().to_string(),
                part_rank: r,
                entity: key,
            }),
            _ => Ok(()),
        }
    }

    /// Validate `parts` for `key` and close them under same-rank supersets.
    fn explicit_closure(&self, key: EntityKey, parts: &[PartOrdinal]) -> Result<Vec<PartOrdinal>, MeshError> {
        for &p in parts {
            self.check_explicit(key, p)?;
        }
        let mut out = self.meta.with_supersets(parts);
        out.retain(|&p| self.is_explicit_on(p, key.rank()));
        Ok(out)
    }

    /// Whether `e` is shared with or ghosted to any other process.
    pub fn is_communicated(&self, e: Entity) -> Result<bool, MeshError> {
        Ok(!self.registry.slot(e)?.comm.is_empty())
    }

    /// Bookkeeping part list `e` should carry given its parallel state.
    pub(super) fn bookkeeping_parts(&self, e: Entity) -> Result<Vec<PartOrdinal>, MeshError> {
        let slot = self.registry.slot(e)?;
        let mut out = vec![MetaData::UNIVERSAL];
        if slot.owner == self.parallel_rank() {
            out.push(MetaData::LOCALLY_OWNED);
        }
        if comm_map::is_shared(&slot.comm) {
            out.push(MetaData::GLOBALLY_SHARED);
        }
        if self.slot_is_ghost(slot) && !comm_map::channel(&slot.comm, GhostId::AURA).is_empty() {
            out.push(MetaData::AURA);
        }
        Ok(out)
    }
}
