//! Ghosting: the custom-channel API and the end-of-cycle replication pass.
//!
//! Only owners send ghosts. For every active channel the owner computes its
//! send set (downward closure of the channel roots, minus what the
//! destination already holds), diffs it against the ghosting entries it has
//! from the previous cycle, and ships removals plus full entity records.
//! Closure members owned elsewhere are forwarded to their owner until no
//! process forwards anything.
//!
//! Receivers drop ghosts whose last ghosting entry went away (or whose owner
//! destroyed them), then create or refresh ghosts from the records, lowest
//! rank first so relation targets exist when a record refers to them.

use std::collections::{BTreeMap, BTreeSet};

use hashbrown::HashSet;

use crate::algs::collectives::{ReduceOp, all_reduce, all_reduce_or};
use crate::algs::communicator::Communicator;
use crate::algs::exchange::{Buffers, exchange};
use crate::algs::wire::{EntityRecord, WireReader, WireRelation, WireWriter, kind};
use crate::data::meta::{MetaData, PartOrdinal};
use crate::mesh::bulk_data::{BulkData, tags};
use crate::mesh::sharing::finish_counted;
use crate::mesh_error::MeshError;
use crate::overlap::comm_map::{self, CommMapEntry, GhostId};
use crate::overlap::ghosting::Ghosting;
use crate::topology::entity::{Entity, EntityState};
use crate::topology::entity_key::EntityKey;
use crate::topology::relation;

/// `(channel, entity, destination)`
type SendPair = (GhostId, Entity, usize);

/// A closure member forwarded to its owner.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Forward {
    ghost: GhostId,
    key: EntityKey,
    dest: usize,
    /// A custom root migrating to the new owner, not just a closure member.
    root: bool,
}

impl<C: Communicator> BulkData<C> {
    // ----- public API -----------------------------------------------------

    /// Declare a custom ghosting channel. Every process must create the same
    /// channels in the same order.
    pub fn create_ghosting(&mut self, name: &str) -> Result<GhostId, MeshError> {
        self.require_modifiable("create_ghosting")?;
        let id = GhostId(self.ghostings.len() as u32);
        self.ghostings.push(Ghosting::new(id, name));
        log::debug!("rank {}: created ghosting `{name}` as {id:?}", self.parallel_rank());
        Ok(id)
    }

    /// Request that `add_send` entities (with their downward closure) be
    /// ghosted to the given processes, and that the ghosts `remove_receive`
    /// stop being received here on this channel. Applied in
    /// `end_modification`.
    pub fn change_ghosting(
        &mut self,
        ghost: GhostId,
        add_send: &[(Entity, usize)],
        remove_receive: &[EntityKey],
    ) -> Result<(), MeshError> {
        self.require_modifiable("change_ghosting")?;
        self.custom_ghosting(ghost)?;
        let (me, size) = (self.parallel_rank(), self.parallel_size());
        for &(e, proc) in add_send {
            let key = self.registry.key(e)?;
            if proc >= size {
                return Err(MeshError::InvalidProc { proc, size });
            }
            if !self.slot_is_held(self.registry.slot(e)?) {
                return Err(MeshError::NotOwned { key, rank: me });
            }
        }
        let g = &mut self.ghostings[ghost.get() as usize];
        for &(e, proc) in add_send {
            g.request_add(e, proc);
        }
        for &key in remove_receive {
            g.request_remove_receive(key);
        }
        Ok(())
    }

    /// Tear down a custom channel: all of its ghosts not justified otherwise
    /// disappear at the end of the cycle.
    pub fn destroy_ghosting(&mut self, ghost: GhostId) -> Result<(), MeshError> {
        self.require_modifiable("destroy_ghosting")?;
        self.custom_ghosting(ghost)?;
        self.ghostings[ghost.get() as usize].request_clear();
        Ok(())
    }

    fn custom_ghosting(&self, ghost: GhostId) -> Result<&Ghosting, MeshError> {
        let g = self
            .ghostings
            .get(ghost.get() as usize)
            .filter(|g| !g.is_destroyed())
            .ok_or(MeshError::UnknownGhosting(ghost.get()))?;
        if !g.is_custom() {
            return Err(MeshError::BuiltInGhosting(g.name().to_string()));
        }
        Ok(g)
    }

    /// Ghost handles received on `ghost`.
    pub fn ghosts_received(&self, ghost: GhostId) -> Vec<Entity> {
        self.comm_list
            .iter()
            .filter_map(|&(_, e)| {
                let slot = self.registry.slot(e).ok()?;
                (self.slot_is_ghost(slot) && !comm_map::channel(&slot.comm, ghost).is_empty())
                    .then_some(e)
            })
            .collect()
    }

    // ----- single process -------------------------------------------------

    /// With one process there is nobody to ghost to: requests are consumed
    /// and cleared channels are retired.
    pub(super) fn update_local_ghostings(&mut self) {
        for g in self.ghostings.iter_mut().filter(|g| g.is_custom() && !g.is_destroyed()) {
            if g.has_pending() {
                log::debug!("ghosting `{}`: requests dropped on a single process", g.name());
            }
            g.apply_pending_roots();
            g.take_remove_receive();
            g.set_roots(Vec::new());
            g.finish_cycle(false);
        }
    }

    // ----- parallel -------------------------------------------------------

    /// Bring every channel up to date: forward receiver removals to owners,
    /// compute each channel's send set and its closure, ship new and
    /// refreshed records, and tear down ghosts nobody sends anymore.
    pub(super) fn update_ghosting(&mut self) -> Result<(), MeshError> {
        let me = self.parallel_rank();
        let channels: Vec<GhostId> = self
            .ghostings
            .iter()
            .filter(|g| {
                (g.id() == GhostId::AURA && self.config.auto_aura)
                    || (g.is_custom() && !g.is_destroyed())
            })
            .map(|g| g.id())
            .collect();

        self.forward_remove_receive()?;

        let mut new_send: BTreeSet<SendPair> = BTreeSet::new();
        let mut forwards: BTreeMap<usize, BTreeSet<Forward>> = BTreeMap::new();
        let mut visited: HashSet<SendPair> = HashSet::new();

        for &ghost in &channels {
            let roots = if ghost == GhostId::AURA {
                self.aura_roots()?
            } else {
                self.custom_roots(ghost, &mut forwards)?
            };
            for (root, dest) in roots {
                self.expand_closure(ghost, root, dest, &mut new_send, &mut forwards, &mut visited)?;
            }
        }

        // forwarded closure members land on their owner; repeat until quiet
        loop {
            let outgoing = std::mem::take(&mut forwards);
            let any = all_reduce_or(&self.comm, tags::GHOST_FORWARD_DONE, !outgoing.is_empty())?;
            if !any {
                break;
            }
            let bufs: Buffers = outgoing
                .into_iter()
                .map(|(p, list)| {
                    let mut w = WireWriter::with_header(kind::GHOST_FORWARD, list.len());
                    for f in list {
                        w.u32(f.ghost.get()).key(f.key).u32(f.dest as u32).u8(f.root as u8);
                    }
                    (p, w.finish())
                })
                .collect();
            let incoming = exchange(&self.comm, tags::GHOST_FORWARD, bufs)?;
            for (_, data) in incoming {
                let mut r = WireReader::new(&data);
                for _ in 0..r.header(kind::GHOST_FORWARD)? {
                    let ghost = GhostId(r.u32()?);
                    let key = r.key()?;
                    let dest = r.u32()? as usize;
                    let root = r.u8()? != 0;
                    if !channels.contains(&ghost) {
                        continue;
                    }
                    let Some(e) = self.registry.lookup(key) else {
                        continue;
                    };
                    let slot = self.registry.slot(e)?;
                    if !self.slot_is_held(slot) || dest == me {
                        continue;
                    }
                    if root {
                        if slot.owner == me {
                            self.ghostings[ghost.get() as usize].request_add(e, dest);
                            self.ghostings[ghost.get() as usize].apply_pending_roots();
                        }
                        self.expand_closure(ghost, e, dest, &mut new_send, &mut forwards, &mut visited)?;
                    } else {
                        self.visit(ghost, e, dest, &mut new_send, &mut forwards, &mut visited)?;
                    }
                }
            }
        }

        let changed = self.ship_ghosts(&channels, &new_send)?;

        let mut flags = vec![0u64; self.ghostings.len()];
        for g in &changed {
            flags[g.get() as usize] = 1;
        }
        let flags = all_reduce(&self.comm, tags::GHOST_CHANGED, &flags, ReduceOp::Max)?;
        for (g, flag) in self.ghostings.iter_mut().zip(flags) {
            if g.is_destroyed() {
                continue;
            }
            if g.id() == GhostId::AURA || g.is_custom() {
                g.finish_cycle(flag != 0);
            }
        }
        Ok(())
    }

    /// Receivers ask the owner to drop the roots behind ghosts they no
    /// longer want on a channel.
    fn forward_remove_receive(&mut self) -> Result<(), MeshError> {
        let mut out: BTreeMap<usize, (WireWriter, usize)> = BTreeMap::new();
        for gi in 0..self.ghostings.len() {
            let ghost = self.ghostings[gi].id();
            let keys = self.ghostings[gi].take_remove_receive();
            for key in keys {
                let Some(e) = self.registry.lookup(key) else {
                    continue;
                };
                let slot = self.registry.slot(e)?;
                if !self.slot_is_ghost(slot) {
                    continue;
                }
                for c in comm_map::channel(&slot.comm, ghost) {
                    let (w, n) = out.entry(c.proc()).or_default();
                    w.u32(ghost.get()).key(key);
                    *n += 1;
                }
            }
        }
        let incoming = exchange(
            &self.comm,
            tags::GHOST_REMOVE,
            finish_counted(kind::GHOST_NOTICE, out),
        )?;
        for (sender, data) in incoming {
            let mut r = WireReader::new(&data);
            for _ in 0..r.header(kind::GHOST_NOTICE)? {
                let gi = r.u32()? as usize;
                let key = r.key()?;
                let (Some(g), Some(e)) = (self.ghostings.get(gi), self.registry.lookup(key)) else {
                    continue;
                };
                let kept: Vec<(Entity, usize)> = g
                    .roots()
                    .iter()
                    .copied()
                    .filter(|&root| root != (e, sender))
                    .collect();
                self.ghostings[gi].set_roots(kept);
            }
        }
        Ok(())
    }

    /// One-hop aura: every locally owned entity above a shared entity goes
    /// to each process the shared entity is shared with.
    fn aura_roots(&self) -> Result<Vec<(Entity, usize)>, MeshError> {
        let me = self.parallel_rank();
        let mut roots = BTreeSet::new();
        for &(_, e) in self.shared_entities()?.iter() {
            let procs: Vec<usize> = comm_map::sharing_procs(&self.registry.slot(e)?.comm).collect();
            for r in self.upward_relations(e)? {
                if self.registry.slot(r.entity)?.owner != me {
                    continue;
                }
                for &p in &procs {
                    roots.insert((r.entity, p));
                }
            }
        }
        Ok(roots.into_iter().collect())
    }

    fn shared_entities(&self) -> Result<Vec<(EntityKey, Entity)>, MeshError> {
        let mut out = Vec::new();
        for e in self.registry.live() {
            let slot = self.registry.slot(e)?;
            if let (Some(k), true) = (slot.key, comm_map::is_shared(&slot.comm)) {
                out.push((k, e));
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    /// Persistent roots of a custom channel. Roots this process no longer
    /// owns migrate to the owner.
    fn custom_roots(
        &mut self,
        ghost: GhostId,
        forwards: &mut BTreeMap<usize, BTreeSet<Forward>>,
    ) -> Result<Vec<(Entity, usize)>, MeshError> {
        let me = self.parallel_rank();
        let gi = ghost.get() as usize;
        self.ghostings[gi].apply_pending_roots();
        let mut kept = Vec::new();
        for &(e, dest) in self.ghostings[gi].roots() {
            let Ok(slot) = self.registry.slot(e) else {
                continue;
            };
            if dest == me || !self.slot_is_held(slot) {
                continue;
            }
            if slot.owner == me {
                kept.push((e, dest));
            } else if let Some(key) = slot.key {
                forwards.entry(slot.owner).or_default().insert(Forward {
                    ghost,
                    key,
                    dest,
                    root: true,
                });
            }
        }
        self.ghostings[gi].set_roots(kept.clone());
        Ok(kept)
    }

    fn expand_closure(
        &self,
        ghost: GhostId,
        root: Entity,
        dest: usize,
        new_send: &mut BTreeSet<SendPair>,
        forwards: &mut BTreeMap<usize, BTreeSet<Forward>>,
        visited: &mut HashSet<SendPair>,
    ) -> Result<(), MeshError> {
        for y in self.downward_closure(root)? {
            self.visit(ghost, y, dest, new_send, forwards, visited)?;
        }
        Ok(())
    }

    /// Decide what happens to one closure member: send it, skip it, or hand
    /// it to its owner.
    fn visit(
        &self,
        ghost: GhostId,
        y: Entity,
        dest: usize,
        new_send: &mut BTreeSet<SendPair>,
        forwards: &mut BTreeMap<usize, BTreeSet<Forward>>,
        visited: &mut HashSet<SendPair>,
    ) -> Result<(), MeshError> {
        if !visited.insert((ghost, y, dest)) {
            return Ok(());
        }
        let me = self.parallel_rank();
        let slot = self.registry.slot(y)?;
        if dest == me || dest == slot.owner || comm_map::is_shared_with(&slot.comm, dest) {
            return Ok(());
        }
        if slot.owner == me {
            new_send.insert((ghost, y, dest));
        } else if self.slot_is_held(slot) {
            if let Some(key) = slot.key {
                forwards.entry(slot.owner).or_default().insert(Forward {
                    ghost,
                    key,
                    dest,
                    root: false,
                });
            }
        }
        Ok(())
    }

    /// Diff the send set against last cycle's entries, exchange removals and
    /// records, and apply what arrives. Returns the channels whose
    /// membership this process changed as a sender.
    fn ship_ghosts(
        &mut self,
        channels: &[GhostId],
        new_send: &BTreeSet<SendPair>,
    ) -> Result<BTreeSet<GhostId>, MeshError> {
        let me = self.parallel_rank();

        let mut old_send: BTreeSet<SendPair> = BTreeSet::new();
        for e in self.registry.live() {
            let slot = self.registry.slot(e)?;
            if self.slot_is_ghost(slot) {
                continue;
            }
            for c in slot.comm.iter().filter(|c| c.ghost.is_ghosting()) {
                old_send.insert((c.ghost, e, c.proc()));
            }
        }

        let mut removals: BTreeMap<usize, Vec<(GhostId, EntityKey, bool)>> = BTreeMap::new();
        let mut records: BTreeMap<usize, Vec<(GhostId, Entity)>> = BTreeMap::new();
        let mut changed: BTreeSet<GhostId> = BTreeSet::new();

        for &(g, e, p) in old_send.difference(new_send) {
            let key = self.registry.key(e)?;
            removals.entry(p).or_default().push((g, key, false));
            comm_map::erase(&mut self.registry.slot_mut(e)?.comm, CommMapEntry::new(g, p));
            changed.insert(g);
        }
        for &(g, e, p) in new_send {
            let fresh = !old_send.contains(&(g, e, p));
            let state = self.registry.slot(e)?.state;
            if fresh {
                comm_map::insert(&mut self.registry.slot_mut(e)?.comm, CommMapEntry::new(g, p));
                changed.insert(g);
            }
            if fresh || state != EntityState::Unchanged {
                records.entry(p).or_default().push((g, e));
            }
        }
        for d in self.deleted.iter().filter(|d| !d.was_ghost) {
            for c in d.comm.iter().filter(|c| c.ghost.is_ghosting()) {
                removals.entry(c.proc()).or_default().push((c.ghost, d.key, true));
                changed.insert(c.ghost);
            }
        }

        let mut dests: BTreeSet<usize> = removals.keys().copied().collect();
        dests.extend(records.keys().copied());
        let mut bufs = Buffers::new();
        for p in dests {
            let rem = removals.remove(&p).unwrap_or_default();
            let recs = records.remove(&p).unwrap_or_default();
            let mut w = WireWriter::with_header(kind::GHOST_RECORDS, rem.len());
            for (g, key, owner_deleted) in rem {
                w.u32(g.get()).key(key).u8(owner_deleted as u8);
            }
            w.u32(recs.len() as u32);
            for (g, e) in recs {
                w.u32(g.get());
                self.entity_record(e)?.pack(&mut w);
            }
            bufs.insert(p, w.finish());
        }
        log::debug!(
            "rank {me}: ghosting sends to {} processes over {} channels",
            bufs.len(),
            channels.len()
        );
        let incoming = exchange(&self.comm, tags::GHOST_RECORDS, bufs)?;
        self.receive_ghosts(incoming)?;
        Ok(changed)
    }

    /// Snapshot of `e` as a ghost receiver needs it.
    fn entity_record(&self, e: Entity) -> Result<EntityRecord, MeshError> {
        let slot = self.registry.slot(e)?;
        let key = self.registry.key(e)?;
        let mut relations = Vec::new();
        for r in relation::below(&slot.relations, key.rank()) {
            relations.push(WireRelation {
                key: self.registry.key(r.entity)?,
                ordinal: r.ordinal,
                permutation: r.permutation,
            });
        }
        let mut fields = WireWriter::default();
        if let Some(loc) = slot.location {
            for obs in &self.observers {
                fields.bytes(&obs.pack_fields(key.rank(), loc.bucket, loc.ordinal));
            }
        }
        Ok(EntityRecord {
            key,
            owner: slot.owner as u32,
            topology: slot.topology,
            parts: self.app_parts(e)?,
            relations,
            fields: fields.finish(),
        })
    }

    fn receive_ghosts(&mut self, incoming: Buffers) -> Result<(), MeshError> {
        let me = self.parallel_rank();
        let mut removals = Vec::new();
        let mut adds: Vec<(usize, GhostId, EntityRecord)> = Vec::new();
        for (sender, data) in &incoming {
            let mut r = WireReader::new(data);
            for _ in 0..r.header(kind::GHOST_RECORDS)? {
                let g = GhostId(r.u32()?);
                let key = r.key()?;
                let owner_deleted = r.u8()? != 0;
                removals.push((*sender, g, key, owner_deleted));
            }
            for _ in 0..r.u32()? {
                let g = GhostId(r.u32()?);
                let rec = EntityRecord::unpack(&mut r)?;
                self.check_parts(&rec.parts)?;
                adds.push((*sender, g, rec));
            }
        }
        let arriving: HashSet<EntityKey> = adds.iter().map(|(_, _, rec)| rec.key).collect();

        let mut doomed: Vec<(EntityKey, Entity)> = Vec::new();
        for (sender, g, key, owner_deleted) in removals {
            let Some(e) = self.registry.lookup(key) else {
                continue;
            };
            let slot = self.registry.slot_mut(e)?;
            if owner_deleted {
                slot.comm.retain(|c| !(c.ghost.is_ghosting() && c.proc() == sender));
            } else {
                comm_map::erase(&mut slot.comm, CommMapEntry::new(g, sender));
            }
            let slot = self.registry.slot(e)?;
            if !self.slot_is_held(slot)
                && !slot.comm.iter().any(|c| c.ghost.is_ghosting())
                && !arriving.contains(&key)
            {
                doomed.push((key, e));
            }
        }
        doomed.sort_unstable();
        doomed.dedup();
        let mut destroyed = 0usize;
        for &(key, e) in doomed.iter().rev() {
            if !self.registry.is_valid(e) {
                continue;
            }
            if self.destroy_internal(e)? {
                destroyed += 1;
            } else {
                log::warn!("rank {me}: ghost {key} is still referenced and was not removed");
            }
        }

        adds.sort_by(|a, b| a.2.key.cmp(&b.2.key).then(a.0.cmp(&b.0)));
        let received = adds.len();
        for (sender, g, rec) in adds {
            self.install_ghost(sender, g, rec)?;
        }
        log::debug!("rank {me}: received {received} ghost records, removed {destroyed} ghosts");
        Ok(())
    }

    /// Create or refresh a ghost from its owner's record.
    fn install_ghost(&mut self, sender: usize, g: GhostId, rec: EntityRecord) -> Result<(), MeshError> {
        if let Some(e) = self.registry.lookup(rec.key) {
            if self.slot_is_held(self.registry.slot(e)?) {
                return Ok(());
            }
        }
        let (e, fresh) = self.registry.create(rec.key, rec.owner as usize);
        if !fresh {
            self.touch(e)?;
        }
        let rank = rec.key.rank();
        {
            let slot = self.registry.slot_mut(e)?;
            slot.owner = rec.owner as usize;
            slot.topology = rec.topology;
            comm_map::insert(&mut slot.comm, CommMapEntry::new(g, sender));
        }

        let mut parts: Vec<PartOrdinal> = rec.parts;
        parts.push(MetaData::UNIVERSAL);
        self.replace_parts(e, parts)?;

        let old: Vec<(Entity, u16)> = relation::below(&self.registry.slot(e)?.relations, rank)
            .iter()
            .map(|r| (r.entity, r.ordinal))
            .collect();
        for (target, ordinal) in old {
            self.unlink(e, target, ordinal)?;
        }
        for r in &rec.relations {
            let target = self
                .registry
                .lookup(r.key)
                .ok_or(MeshError::MissingRelationTarget(r.key))?;
            self.link(e, target, r.ordinal, r.permutation)?;
        }

        if !self.observers.is_empty() {
            let loc = self.location(e)?;
            let mut fields = WireReader::new(&rec.fields);
            for obs in self.observers.iter_mut() {
                let bytes = fields.bytes()?;
                obs.unpack_fields(rank, loc.bucket, loc.ordinal, bytes);
            }
        }
        Ok(())
    }
}
