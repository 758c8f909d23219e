//! Parallel consistency check and local invariant validation.
//!
//! Every owner describes each communicated entity to each peer that holds a
//! copy, from the peer's point of view. The peer builds the same description
//! from its own state and compares bytes. Shared copies compare owner, parts,
//! the set of downward relation keys and the full sharing set; ghosts compare
//! owner, parts, the exact downward relations and the channels they arrive on.

use std::collections::BTreeMap;

#[cfg(feature = "rayon")]
use rayon::prelude::*;

use hashbrown::HashSet;

use crate::algs::collectives::all_reduce_or;
use crate::algs::communicator::Communicator;
use crate::algs::exchange::exchange;
use crate::algs::wire::{WireReader, WireWriter, kind};
use crate::data::meta::{MetaData, PartOrdinal};
use crate::data::registry::EntityRegistry;
use crate::debug_invariants::DebugInvariants;
use crate::mesh::bulk_data::{BulkData, tags};
use crate::mesh::sharing::finish_counted;
use crate::mesh_error::MeshError;
use crate::overlap::comm_map;
use crate::topology::entity::Entity;
use crate::topology::entity_key::{EntityKey, EntityRank};
use crate::topology::relation;

const SHARED_VIEW: u8 = 0;
const GHOST_VIEW: u8 = 1;

/// Canonical description of `e` as seen by the pair `(me, peer)`.
fn describe(
    registry: &EntityRegistry,
    meta: &MetaData,
    me: usize,
    e: Entity,
    mode: u8,
    peer: usize,
) -> Result<Vec<u8>, MeshError> {
    let slot = registry.slot(e)?;
    let rank = registry.key(e)?.rank();
    let parts: Vec<PartOrdinal> = slot
        .parts
        .iter()
        .copied()
        .filter(|&p| !meta.is_bookkeeping(p))
        .collect();
    let mut w = WireWriter::default();
    w.u32(slot.owner as u32).parts(&parts);
    let below = relation::below(&slot.relations, rank);
    if mode == SHARED_VIEW {
        let mut keys = below
            .iter()
            .map(|r| registry.key(r.entity))
            .collect::<Result<Vec<_>, _>>()?;
        keys.sort_unstable();
        keys.dedup();
        w.keys(&keys);
        let mut procs: Vec<usize> = comm_map::sharing_procs(&slot.comm).collect();
        procs.push(me);
        procs.sort_unstable();
        w.u32(procs.len() as u32);
        for p in procs {
            w.u32(p as u32);
        }
    } else {
        w.u32(below.len() as u32);
        for r in below {
            w.key(registry.key(r.entity)?).u16(r.ordinal).u8(r.permutation);
        }
        let channels: Vec<u32> = slot
            .comm
            .iter()
            .filter(|c| c.ghost.is_ghosting() && c.proc() == peer)
            .map(|c| c.ghost.get())
            .collect();
        w.u32(channels.len() as u32);
        for g in channels {
            w.u32(g);
        }
    }
    Ok(w.finish())
}

/// `(peer, key, mode, description)` for every copy of an owned entity.
type Report = (usize, EntityKey, u8, Vec<u8>);

fn owner_reports(
    registry: &EntityRegistry,
    meta: &MetaData,
    me: usize,
    e: Entity,
) -> Result<Vec<Report>, MeshError> {
    let slot = registry.slot(e)?;
    let key = registry.key(e)?;
    let mut out = Vec::new();
    for p in comm_map::sharing_procs(&slot.comm) {
        out.push((p, key, SHARED_VIEW, describe(registry, meta, me, e, SHARED_VIEW, p)?));
    }
    let mut ghost_peers: Vec<usize> = slot
        .comm
        .iter()
        .filter(|c| c.ghost.is_ghosting())
        .map(|c| c.proc())
        .collect();
    ghost_peers.sort_unstable();
    ghost_peers.dedup();
    for p in ghost_peers {
        out.push((p, key, GHOST_VIEW, describe(registry, meta, me, e, GHOST_VIEW, p)?));
    }
    Ok(out)
}

impl<C: Communicator> BulkData<C> {
    /// Collective check that every copy of every communicated entity agrees
    /// with its owner. Fails on every process if any process finds a
    /// mismatch.
    pub fn verify_parallel_consistency(&self) -> Result<(), MeshError> {
        let me = self.parallel_rank();
        // the comm list is only rebuilt once the cycle closes
        let mut communicated: Vec<(EntityKey, Entity)> = Vec::new();
        for e in self.registry.live() {
            let slot = self.registry.slot(e)?;
            if let (Some(key), false) = (slot.key, slot.comm.is_empty()) {
                communicated.push((key, e));
            }
        }
        let owned: Vec<Entity> = communicated
            .iter()
            .filter(|&&(_, e)| self.registry.slot(e).is_ok_and(|s| s.owner == me))
            .map(|&(_, e)| e)
            .collect();

        #[cfg(feature = "rayon")]
        let reports: Vec<Vec<Report>> = owned
            .par_iter()
            .map(|&e| owner_reports(&self.registry, &self.meta, me, e))
            .collect::<Result<_, _>>()?;
        #[cfg(not(feature = "rayon"))]
        let reports: Vec<Vec<Report>> = owned
            .iter()
            .map(|&e| owner_reports(&self.registry, &self.meta, me, e))
            .collect::<Result<_, _>>()?;

        let mut out: BTreeMap<usize, (WireWriter, usize)> = BTreeMap::new();
        for (p, key, mode, bytes) in reports.into_iter().flatten() {
            let (w, n) = out.entry(p).or_default();
            w.key(key).u8(mode).bytes(&bytes);
            *n += 1;
        }
        let incoming = exchange(&self.comm, tags::VERIFY, finish_counted(kind::VERIFY, out))?;

        let mut problems = Vec::new();
        let mut seen: HashSet<(EntityKey, u8)> = HashSet::new();
        for (sender, data) in &incoming {
            let mut r = WireReader::new(data);
            for _ in 0..r.header(kind::VERIFY)? {
                let key = r.key()?;
                let mode = r.u8()?;
                let theirs = r.bytes()?;
                seen.insert((key, mode));
                let Some(e) = self.registry.lookup(key) else {
                    problems.push(format!("owner {sender} reports {key}, which is missing here"));
                    continue;
                };
                let ours = describe(&self.registry, &self.meta, me, e, mode, *sender)?;
                if ours != theirs {
                    let what = if mode == SHARED_VIEW { "shared copy" } else { "ghost" };
                    problems.push(format!("{what} {key} disagrees with owner {sender}"));
                }
            }
        }
        for &(key, e) in &communicated {
            let slot = self.registry.slot(e)?;
            if slot.owner == me {
                continue;
            }
            let mode = if comm_map::is_shared(&slot.comm) { SHARED_VIEW } else { GHOST_VIEW };
            if !seen.contains(&(key, mode)) {
                problems.push(format!("{key} is not known to its owner {}", slot.owner));
            }
        }

        for p in &problems {
            log::warn!("rank {me}: {p}");
        }
        let failed = all_reduce_or(&self.comm, tags::VERIFY_FLAG, !problems.is_empty())?;
        if failed {
            let report = if problems.is_empty() {
                "inconsistency detected on another process".to_string()
            } else {
                format!("rank {me}: {}", problems.join("; "))
            };
            return Err(MeshError::ParallelInconsistency { report });
        }
        Ok(())
    }
}

impl<C: Communicator> DebugInvariants for BulkData<C> {
    fn validate_invariants(&self) -> Result<(), MeshError> {
        let fail = |msg: String| Err(MeshError::Invariant(msg));
        for e in self.registry.live() {
            let slot = self.registry.slot(e)?;
            let key = self.registry.key(e)?;
            let rank = key.rank();

            if !slot.parts.windows(2).all(|w| w[0] < w[1]) {
                return fail(format!("{key}: parts not sorted"));
            }
            if slot.parts.binary_search(&MetaData::UNIVERSAL).is_err() {
                return fail(format!("{key}: missing the universal part"));
            }
            if !slot.comm.windows(2).all(|w| w[0] < w[1]) {
                return fail(format!("{key}: comm entries not sorted"));
            }

            let loc = self.location(e)?;
            let bucket = self
                .buckets
                .bucket(rank, loc.bucket)
                .ok_or_else(|| MeshError::Invariant(format!("{key}: bucket {} missing", loc.bucket)))?;
            if bucket.entities().get(loc.ordinal) != Some(&e) {
                return fail(format!("{key}: bucket slot holds another entity"));
            }
            if bucket.parts() != slot.parts.as_slice() {
                return fail(format!("{key}: bucket signature differs from its parts"));
            }

            for r in relation::below(&slot.relations, rank) {
                if !self.registry.is_valid(r.entity) {
                    return fail(format!("{key}: relation to a destroyed entity"));
                }
                let to_rank = self.registry.key(r.entity)?.rank();
                if self.config.connectivity.stores_upward(to_rank, rank) {
                    let back = &self.registry.slot(r.entity)?.relations;
                    let found = relation::of_rank(back, rank)
                        .iter()
                        .any(|b| b.entity == e && b.ordinal == r.ordinal);
                    if !found {
                        return fail(format!("{key}: missing back-relation"));
                    }
                }
            }
            for r in relation::above(&slot.relations, rank) {
                let from = self.registry.slot(r.entity)?;
                let found = relation::of_rank(&from.relations, rank)
                    .iter()
                    .any(|d| d.entity == e && d.ordinal == r.ordinal);
                if !found {
                    return fail(format!("{key}: back-relation without a forward relation"));
                }
            }
        }
        for rank in EntityRank::all() {
            for bucket in self.buckets.buckets(rank) {
                for &e in bucket.entities() {
                    if !self.registry.is_valid(e) {
                        return fail(format!("bucket {} holds a destroyed entity", bucket.id()));
                    }
                }
            }
        }
        Ok(())
    }
}
