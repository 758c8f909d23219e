//! Shared-entity identity, ownership and part reclassification.
//!
//! Runs inside `end_modification`, in this order on every process:
//!
//! 1. retract sharing of destroyed entities,
//! 2. key directory for nodes, elements and constraints,
//! 3. structural matching of edges and faces over shared nodes (with
//!    re-keying to the minimum matched key),
//! 4. owner = minimum rank among the sharing processes and self,
//! 5. bookkeeping parts, then reconciliation of application parts on shared
//!    entities with their owner.
//!
//! Every step is one or more sparse exchanges; all of them are collective.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};

use crate::algs::communicator::Communicator;
use crate::algs::exchange::{Buffers, exchange};
use crate::algs::wire::{WireReader, WireWriter, kind};
use crate::data::meta::PartOrdinal;
use crate::mesh::bulk_data::{BulkData, tags};
use crate::mesh_error::MeshError;
use crate::overlap::comm_map::{self, CommMapEntry, GhostId};
use crate::topology::entity::{Entity, EntityState};
use crate::topology::entity_key::{EntityKey, EntityRank};
use crate::topology::relation;

const UNREGISTER: u8 = 0;
const REGISTER: u8 = 1;

/// Ranks whose sharing is resolved by key through the directory. Edges and
/// faces are matched by their nodes instead.
fn uses_directory(rank: EntityRank) -> bool {
    rank != EntityRank::EDGE && rank != EntityRank::FACE
}

fn key_buffers(msg_kind: u16, lists: BTreeMap<usize, Vec<EntityKey>>) -> Buffers {
    lists
        .into_iter()
        .map(|(p, keys)| {
            let mut w = WireWriter::with_header(msg_kind, keys.len());
            for k in keys {
                w.key(k);
            }
            (p, w.finish())
        })
        .collect()
}

/// One side's structural description: sorted node keys and topology tag.
type SideSignature = (Vec<EntityKey>, u8);

impl<C: Communicator> BulkData<C> {
    /// Settle which processes share each entity: retract destroyed copies,
    /// run the key directory, then match sides over shared nodes.
    pub(super) fn resolve_sharing(&mut self) -> Result<(), MeshError> {
        let mut changed: HashSet<Entity> = HashSet::new();
        self.retract_deleted_sharing(&mut changed)?;
        self.update_key_directory(&mut changed)?;
        self.resolve_sides(&mut changed)?;
        log::debug!(
            "rank {}: sharing changed on {} entities",
            self.parallel_rank(),
            changed.len()
        );
        Ok(())
    }

    /// Tell the sharers of every destroyed entity to drop this process.
    fn retract_deleted_sharing(&mut self, changed: &mut HashSet<Entity>) -> Result<(), MeshError> {
        let mut out: BTreeMap<usize, Vec<EntityKey>> = BTreeMap::new();
        for d in self.deleted.iter().filter(|d| !d.was_ghost) {
            for p in comm_map::sharing_procs(&d.comm) {
                out.entry(p).or_default().push(d.key);
            }
        }
        let incoming = exchange(
            &self.comm,
            tags::SHARING_RETRACT,
            key_buffers(kind::SHARING_RETRACT, out),
        )?;
        for (sender, data) in incoming {
            let mut r = WireReader::new(&data);
            for _ in 0..r.header(kind::SHARING_RETRACT)? {
                let key = r.key()?;
                let Some(e) = self.registry.lookup(key) else {
                    continue;
                };
                let entry = CommMapEntry::new(GhostId::SHARED, sender);
                if comm_map::erase(&mut self.registry.slot_mut(e)?.comm, entry) {
                    self.touch(e)?;
                    changed.insert(e);
                }
            }
        }
        Ok(())
    }

    /// Register created keys and unregister destroyed ones with their
    /// directory process, which answers every holder of a changed key with
    /// the full holder set.
    fn update_key_directory(&mut self, changed: &mut HashSet<Entity>) -> Result<(), MeshError> {
        let np = self.parallel_size() as u64;
        let home = |k: EntityKey| (k.id() % np) as usize;

        let mut ops: BTreeMap<usize, BTreeSet<(u8, EntityKey)>> = BTreeMap::new();
        for d in self.deleted.iter().filter(|d| !d.was_ghost) {
            if uses_directory(d.key.rank()) {
                ops.entry(home(d.key)).or_default().insert((UNREGISTER, d.key));
            }
        }
        for &(old, e) in &self.renamed {
            if uses_directory(old.rank()) {
                ops.entry(home(old)).or_default().insert((UNREGISTER, old));
            }
            if let Ok(slot) = self.registry.slot(e) {
                if let (Some(k), false) = (slot.key, self.slot_is_ghost(slot)) {
                    if uses_directory(k.rank()) {
                        ops.entry(home(k)).or_default().insert((REGISTER, k));
                    }
                }
            }
        }
        for e in self.registry.live() {
            let slot = self.registry.slot(e)?;
            let Some(k) = slot.key else { continue };
            if slot.state == EntityState::Created && uses_directory(k.rank()) && !self.slot_is_ghost(slot) {
                ops.entry(home(k)).or_default().insert((REGISTER, k));
            }
        }

        let bufs: Buffers = ops
            .into_iter()
            .map(|(p, list)| {
                let mut w = WireWriter::with_header(kind::KEY_DIRECTORY, list.len());
                for (op, k) in list {
                    w.u8(op).key(k);
                }
                (p, w.finish())
            })
            .collect();
        let incoming = exchange(&self.comm, tags::KEY_DIRECTORY, bufs)?;

        let mut registers = Vec::new();
        let mut unregisters = Vec::new();
        for (sender, data) in &incoming {
            let mut r = WireReader::new(data);
            for _ in 0..r.header(kind::KEY_DIRECTORY)? {
                let op = r.u8()?;
                let key = r.key()?;
                match op {
                    REGISTER => registers.push((*sender, key)),
                    UNREGISTER => unregisters.push((*sender, key)),
                    other => return Err(MeshError::Wire(format!("unknown directory op {other}"))),
                }
            }
        }

        let mut touched: BTreeSet<EntityKey> = BTreeSet::new();
        for (p, key) in unregisters {
            if let Some(holders) = self.directory.get_mut(&key) {
                if let Ok(i) = holders.binary_search(&p) {
                    holders.remove(i);
                }
                if holders.is_empty() {
                    self.directory.remove(&key);
                }
            }
            touched.insert(key);
        }
        for (p, key) in registers {
            let holders = self.directory.entry(key).or_default();
            if let Err(i) = holders.binary_search(&p) {
                holders.insert(i, p);
            }
            touched.insert(key);
        }

        let mut replies: BTreeMap<usize, Vec<(EntityKey, &[usize])>> = BTreeMap::new();
        for key in &touched {
            if let Some(holders) = self.directory.get(key) {
                for &h in holders {
                    replies.entry(h).or_default().push((*key, holders.as_slice()));
                }
            }
        }
        let bufs: Buffers = replies
            .into_iter()
            .map(|(p, list)| {
                let mut w = WireWriter::with_header(kind::KEY_HOLDERS, list.len());
                for (k, holders) in list {
                    w.key(k).u32(holders.len() as u32);
                    for &h in holders {
                        w.u32(h as u32);
                    }
                }
                (p, w.finish())
            })
            .collect();
        log::trace!(
            "rank {}: directory updated {} keys",
            self.parallel_rank(),
            touched.len()
        );
        let incoming = exchange(&self.comm, tags::KEY_HOLDERS, bufs)?;

        let me = self.parallel_rank();
        for (_, data) in incoming {
            let mut r = WireReader::new(&data);
            for _ in 0..r.header(kind::KEY_HOLDERS)? {
                let key = r.key()?;
                let n = r.u32()? as usize;
                let mut others = Vec::with_capacity(n);
                let mut holds = false;
                for _ in 0..n {
                    let h = r.u32()? as usize;
                    if h == me {
                        holds = true;
                    } else {
                        others.push(h);
                    }
                }
                let Some(e) = self.registry.lookup(key) else {
                    continue;
                };
                if !holds || self.slot_is_ghost(self.registry.slot(e)?) {
                    continue;
                }
                if comm_map::set_sharing(&mut self.registry.slot_mut(e)?.comm, &others) {
                    self.touch(e)?;
                    changed.insert(e);
                }
            }
        }
        Ok(())
    }

    /// Match edges and faces whose nodes are shared against the sides of
    /// the candidate processes, by sorted node keys and topology.
    fn resolve_sides(&mut self, changed: &mut HashSet<Entity>) -> Result<(), MeshError> {
        let mut index: Vec<(SideSignature, EntityKey, Entity)> = Vec::new();
        let mut candidates: Vec<(Entity, Vec<usize>)> = Vec::new();
        let mut out: BTreeMap<usize, (WireWriter, usize)> = BTreeMap::new();

        for rank in [EntityRank::EDGE, EntityRank::FACE] {
            for e in self.entities(rank) {
                let slot = self.registry.slot(e)?;
                if self.slot_is_ghost(slot) {
                    continue;
                }
                let nodes: Vec<Entity> = relation::of_rank(&slot.relations, EntityRank::NODE)
                    .iter()
                    .map(|r| r.entity)
                    .collect();
                if nodes.is_empty() {
                    continue;
                }
                let mut node_keys = Vec::with_capacity(nodes.len());
                for &n in &nodes {
                    node_keys.push(self.registry.key(n)?);
                }
                node_keys.sort_unstable();
                let key = self.registry.key(e)?;
                let topo = slot.topology.to_wire();
                let is_candidate =
                    slot.state == EntityState::Created || nodes.iter().any(|n| changed.contains(n));
                if is_candidate {
                    let mut procs: Option<Vec<usize>> = None;
                    for &n in &nodes {
                        let sharing: Vec<usize> =
                            comm_map::sharing_procs(&self.registry.slot(n)?.comm).collect();
                        procs = Some(match procs {
                            None => sharing,
                            Some(acc) => acc.into_iter().filter(|p| sharing.contains(p)).collect(),
                        });
                    }
                    let procs = procs.unwrap_or_default();
                    for &p in &procs {
                        let (w, n) = out.entry(p).or_default();
                        w.key(key).u8(topo).keys(&node_keys);
                        *n += 1;
                    }
                    candidates.push((e, procs));
                }
                index.push(((node_keys, topo), key, e));
            }
        }
        index.sort_unstable();

        let bufs = finish_counted(kind::SIDE_CANDIDATES, out);
        let incoming = exchange(&self.comm, tags::SIDE_CANDIDATES, bufs)?;

        // remote copies that matched one of our sides
        let mut matched_in: HashMap<Entity, Vec<(usize, EntityKey)>> = HashMap::new();
        let mut reply: BTreeMap<usize, Vec<(EntityKey, EntityKey)>> = BTreeMap::new();
        for (sender, data) in &incoming {
            let mut r = WireReader::new(data);
            for _ in 0..r.header(kind::SIDE_CANDIDATES)? {
                let remote_key = r.key()?;
                let topo = r.u8()?;
                let nodes = r.keys()?;
                let sig: SideSignature = (nodes, topo);
                let i = index.partition_point(|(s, _, _)| *s < sig);
                if let Some((s, local_key, local)) = index.get(i) {
                    if *s == sig {
                        reply.entry(*sender).or_default().push((remote_key, *local_key));
                        matched_in.entry(*local).or_default().push((*sender, remote_key));
                    }
                }
            }
        }

        let bufs: Buffers = reply
            .into_iter()
            .map(|(p, list)| {
                let mut w = WireWriter::with_header(kind::SIDE_MATCHES, list.len());
                for (theirs, ours) in list {
                    w.key(theirs).key(ours);
                }
                (p, w.finish())
            })
            .collect();
        let incoming = exchange(&self.comm, tags::SIDE_MATCHES, bufs)?;
        let mut matched_out: HashMap<Entity, Vec<(usize, EntityKey)>> = HashMap::new();
        for (sender, data) in &incoming {
            let mut r = WireReader::new(data);
            for _ in 0..r.header(kind::SIDE_MATCHES)? {
                let ours = r.key()?;
                let theirs = r.key()?;
                if let Some(e) = self.registry.lookup(ours) {
                    matched_out.entry(e).or_default().push((*sender, theirs));
                }
            }
        }

        // sharing: candidates take exactly what matched, others only gain
        let candidate_set: HashSet<Entity> = candidates.iter().map(|(e, _)| *e).collect();
        let mut all: Vec<Entity> = candidate_set.iter().copied().collect();
        all.extend(matched_in.keys().copied().filter(|e| !candidate_set.contains(e)));
        all.sort_unstable();

        let mut rekeys: Vec<(EntityKey, Entity)> = Vec::new();
        for e in all {
            let remote: Vec<(usize, EntityKey)> = matched_out
                .get(&e)
                .into_iter()
                .chain(matched_in.get(&e))
                .flatten()
                .copied()
                .collect();
            let mut procs: Vec<usize> = if candidate_set.contains(&e) {
                Vec::new()
            } else {
                comm_map::sharing_procs(&self.registry.slot(e)?.comm).collect()
            };
            procs.extend(remote.iter().map(|&(p, _)| p));
            procs.sort_unstable();
            procs.dedup();
            if comm_map::set_sharing(&mut self.registry.slot_mut(e)?.comm, &procs) {
                self.touch(e)?;
                changed.insert(e);
            }
            let own = self.registry.key(e)?;
            if let Some(min) = remote.iter().map(|&(_, k)| k).min() {
                if min < own {
                    rekeys.push((min, e));
                }
            }
        }
        self.apply_side_rekeys(rekeys)
    }

    /// Adopt the minimum matched key, telling ghost receivers of each
    /// re-keyed side about the new key.
    fn apply_side_rekeys(&mut self, mut rekeys: Vec<(EntityKey, Entity)>) -> Result<(), MeshError> {
        // ascending new keys free each target before it is taken
        rekeys.sort_unstable();
        let mut notices: BTreeMap<usize, Vec<(EntityKey, EntityKey)>> = BTreeMap::new();
        for &(new, e) in &rekeys {
            let old = self.registry.key(e)?;
            for c in self.registry.slot(e)?.comm.iter().filter(|c| c.ghost.is_ghosting()) {
                notices.entry(c.proc()).or_default().push((old, new));
            }
            // a ghost of the copy we are merging with already holds the key
            if let Some(z) = self.registry.lookup(new) {
                if z != e && self.slot_is_ghost(self.registry.slot(z)?) {
                    self.merge_ghost_into(z, e)?;
                }
            }
            self.registry.rekey(e, new)?;
            self.touch(e)?;
            self.mark_upward_closure(e)?;
        }
        if !rekeys.is_empty() {
            log::debug!(
                "rank {}: re-keyed {} sides to their minimum matched key",
                self.parallel_rank(),
                rekeys.len()
            );
        }

        let bufs: Buffers = notices
            .into_iter()
            .map(|(p, mut list)| {
                list.sort_unstable();
                list.dedup();
                let mut w = WireWriter::with_header(kind::REKEY, list.len());
                for (old, new) in list {
                    w.key(old).key(new);
                }
                (p, w.finish())
            })
            .collect();
        let incoming = exchange(&self.comm, tags::REKEY, bufs)?;
        let mut received = Vec::new();
        for (_, data) in incoming {
            let mut r = WireReader::new(&data);
            for _ in 0..r.header(kind::REKEY)? {
                let old = r.key()?;
                let new = r.key()?;
                received.push((new, old));
            }
        }
        received.sort_unstable();
        received.dedup();
        for (new, old) in received {
            let Some(g) = self.registry.lookup(old) else {
                continue;
            };
            if !self.slot_is_ghost(self.registry.slot(g)?) {
                continue;
            }
            match self.registry.lookup(new) {
                Some(existing) => self.merge_ghost_into(g, existing)?,
                None => self.registry.rekey(g, new)?,
            }
        }
        Ok(())
    }

    /// A ghost turned out to be a copy of `keep`: move the upward relations
    /// of `stale` onto `keep` and tear `stale` down.
    fn merge_ghost_into(&mut self, stale: Entity, keep: Entity) -> Result<(), MeshError> {
        for r in self.upward_relations(stale)? {
            self.unlink(r.entity, stale, r.ordinal)?;
            self.link(r.entity, keep, r.ordinal, r.permutation)?;
        }
        if !self.destroy_internal(stale)? {
            log::warn!(
                "rank {}: stale ghost {} is still referenced after merge",
                self.parallel_rank(),
                self.registry.key(stale)?
            );
        }
        Ok(())
    }

    /// The owner of every held entity is the lowest rank among its sharers
    /// and this process.
    pub(super) fn resolve_ownership(&mut self) -> Result<(), MeshError> {
        let me = self.parallel_rank();
        let live: Vec<Entity> = self.registry.live().collect();
        let mut moved = 0usize;
        for e in live {
            let slot = self.registry.slot(e)?;
            if self.slot_is_ghost(slot) {
                continue;
            }
            let owner = comm_map::sharing_procs(&slot.comm)
                .chain(std::iter::once(me))
                .min()
                .unwrap_or(me);
            if owner != slot.owner {
                self.registry.slot_mut(e)?.owner = owner;
                self.touch(e)?;
                moved += 1;
            }
        }
        log::debug!("rank {me}: ownership changed on {moved} entities");
        Ok(())
    }

    /// Bookkeeping parts follow ownership, sharing and aura membership.
    pub(super) fn reclassify_bookkeeping(&mut self) -> Result<(), MeshError> {
        let meta = Arc::clone(&self.meta);
        let live: Vec<Entity> = self.registry.live().collect();
        for e in live {
            let mut parts = self.bookkeeping_parts(e)?;
            parts.extend(
                self.registry
                    .slot(e)?
                    .parts
                    .iter()
                    .copied()
                    .filter(|&p| !meta.is_bookkeeping(p)),
            );
            self.replace_parts(e, parts)?;
        }
        Ok(())
    }

    /// Make application parts of shared entities agree with their owner.
    ///
    /// Any sharer that touched a shared entity this cycle notifies the other
    /// sharers. Non-owners then send the owner their explicit parts and the
    /// induced parts their own upward relations justify. The owner keeps its
    /// explicit parts plus those of sharers that created their copy this
    /// cycle, takes the union of the induced parts, and sends the result back.
    pub(super) fn reconcile_shared_parts(&mut self) -> Result<(), MeshError> {
        let me = self.parallel_rank();

        let mut participating: BTreeSet<(EntityKey, Entity)> = BTreeSet::new();
        let mut notices: BTreeMap<usize, Vec<EntityKey>> = BTreeMap::new();
        for e in self.registry.live() {
            let slot = self.registry.slot(e)?;
            let Some(k) = slot.key else { continue };
            if slot.state == EntityState::Unchanged || !comm_map::is_shared(&slot.comm) {
                continue;
            }
            participating.insert((k, e));
            for p in comm_map::sharing_procs(&slot.comm) {
                notices.entry(p).or_default().push(k);
            }
        }
        let incoming = exchange(
            &self.comm,
            tags::PART_NOTICE,
            key_buffers(kind::PART_NOTICE, notices),
        )?;
        for (_, data) in incoming {
            let mut r = WireReader::new(&data);
            for _ in 0..r.header(kind::PART_NOTICE)? {
                let k = r.key()?;
                if let Some(e) = self.registry.lookup(k) {
                    if comm_map::is_shared(&self.registry.slot(e)?.comm) {
                        participating.insert((k, e));
                    }
                }
            }
        }

        // non-owners report to the owner
        let mut requests: BTreeMap<usize, (WireWriter, usize)> = BTreeMap::new();
        for &(k, e) in &participating {
            let owner = self.registry.slot(e)?.owner;
            if owner == me {
                continue;
            }
            let created = self.registry.slot(e)?.state == EntityState::Created;
            let (explicit, _) = self.split_app_parts(e)?;
            let induced = self.locally_justified_induced(e)?;
            let (w, n) = requests.entry(owner).or_default();
            w.key(k).u8(created as u8).parts(&explicit).parts(&induced);
            *n += 1;
        }
        let bufs = finish_counted(kind::PART_REQUEST, requests);
        let incoming = exchange(&self.comm, tags::PART_REQUEST, bufs)?;

        let mut contributions: HashMap<Entity, Vec<(bool, Vec<PartOrdinal>, Vec<PartOrdinal>)>> =
            HashMap::new();
        for (_, data) in &incoming {
            let mut r = WireReader::new(data);
            for _ in 0..r.header(kind::PART_REQUEST)? {
                let k = r.key()?;
                let created = r.u8()? != 0;
                let explicit = r.parts()?;
                let induced = r.parts()?;
                self.check_parts(&explicit)?;
                self.check_parts(&induced)?;
                if let Some(e) = self.registry.lookup(k) {
                    contributions.entry(e).or_default().push((created, explicit, induced));
                }
            }
        }

        // owner decides, applies, and answers every sharer
        let mut results: Vec<(EntityKey, Entity, Vec<PartOrdinal>, Vec<PartOrdinal>)> = Vec::new();
        let mut replies: BTreeMap<usize, (WireWriter, usize)> = BTreeMap::new();
        for &(k, e) in &participating {
            if self.registry.slot(e)?.owner != me {
                continue;
            }
            let (mut explicit, _) = self.split_app_parts(e)?;
            let mut induced = self.locally_justified_induced(e)?;
            for (created, ex, ind) in contributions.get(&e).into_iter().flatten() {
                if *created {
                    explicit.extend_from_slice(ex);
                }
                induced.extend_from_slice(ind);
            }
            explicit.sort_unstable();
            explicit.dedup();
            induced.sort_unstable();
            induced.dedup();
            for p in comm_map::sharing_procs(&self.registry.slot(e)?.comm) {
                let (w, n) = replies.entry(p).or_default();
                w.key(k).parts(&explicit).parts(&induced);
                *n += 1;
            }
            results.push((k, e, explicit, induced));
        }
        let bufs = finish_counted(kind::PART_REPLY, replies);
        let incoming = exchange(&self.comm, tags::PART_REPLY, bufs)?;
        for (_, data) in &incoming {
            let mut r = WireReader::new(data);
            for _ in 0..r.header(kind::PART_REPLY)? {
                let k = r.key()?;
                let explicit = r.parts()?;
                let induced = r.parts()?;
                self.check_parts(&explicit)?;
                self.check_parts(&induced)?;
                if let Some(e) = self.registry.lookup(k) {
                    results.push((k, e, explicit, induced));
                }
            }
        }

        // higher ranks first so their induction reaches lower ones before
        // those are overwritten with their own result
        results.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        let mut changed = 0usize;
        for (_, e, explicit, induced) in results {
            if self.set_app_parts(e, explicit, induced)? {
                changed += 1;
            }
        }
        log::debug!(
            "rank {me}: reconciled parts of {} shared entities, {changed} changed",
            participating.len()
        );
        Ok(())
    }

    /// Split the application parts of `e` into explicit and induced ones.
    fn split_app_parts(&self, e: Entity) -> Result<(Vec<PartOrdinal>, Vec<PartOrdinal>), MeshError> {
        let rank = self.registry.key(e)?.rank();
        Ok(self
            .app_parts(e)?
            .into_iter()
            .partition(|&p| !self.meta.part(p).is_induced_on(rank)))
    }

    /// Replace the application parts of `e`, keeping its bookkeeping parts.
    fn set_app_parts(
        &mut self,
        e: Entity,
        explicit: Vec<PartOrdinal>,
        induced: Vec<PartOrdinal>,
    ) -> Result<bool, MeshError> {
        let mut parts: Vec<PartOrdinal> = self
            .registry
            .slot(e)?
            .parts
            .iter()
            .copied()
            .filter(|&p| self.meta.is_bookkeeping(p))
            .collect();
        parts.extend(explicit);
        parts.extend(induced);
        if !self.replace_parts(e, parts)? {
            return Ok(false);
        }
        self.touch(e)?;
        let rank = self.registry.key(e)?.rank();
        let below: Vec<Entity> = relation::below(&self.registry.slot(e)?.relations, rank)
            .iter()
            .map(|r| r.entity)
            .collect();
        for t in below {
            // shared targets carry the union their owner settled on
            if comm_map::is_shared(&self.registry.slot(t)?.comm) {
                continue;
            }
            self.refresh_induced(t)?;
        }
        Ok(true)
    }
}

/// Prefix each writer's records with a header carrying their count.
pub(super) fn finish_counted(msg_kind: u16, bodies: BTreeMap<usize, (WireWriter, usize)>) -> Buffers {
    bodies
        .into_iter()
        .map(|(p, (body, n))| {
            let body = body.finish();
            let mut w = WireWriter::with_header(msg_kind, n);
            w.raw(&body);
            (p, w.finish())
        })
        .collect()
}
