//! Entity registry: the arena behind every `Entity` handle.
//!
//! Slots live in one flat vector. A global `EntityKey` maps to the slot that
//! currently holds it. Destroyed slots are not reusable until the end of the
//! modification cycle; at that point non-ghost slots go back to the general
//! free list with a bumped generation (stale handles stop validating), while
//! ghost slots are parked in the ghost-reuse map under their key so that the
//! same ghost arriving in a later cycle comes back under the identical
//! handle.

use hashbrown::HashMap;

use crate::data::bucket::BucketLocation;
use crate::data::meta::PartOrdinal;
use crate::mesh_error::MeshError;
use crate::overlap::comm_map::CommMapEntry;
use crate::topology::cell_type::Topology;
use crate::topology::entity::{Entity, EntityState};
use crate::topology::entity_key::{EntityKey, EntityRank};
use crate::topology::relation::Relation;

/// Everything the mesh stores about one entity on this process.
#[derive(Clone, Debug, Default)]
pub struct EntitySlot {
    pub key: Option<EntityKey>,
    pub generation: u32,
    pub state: EntityState,
    pub owner: usize,
    pub topology: Topology,
    /// Sorted part ordinals, always including `universal`.
    pub parts: Vec<PartOrdinal>,
    /// Sorted by `(rank, ordinal, entity)`; downward relations first.
    pub relations: Vec<Relation>,
    /// Sorted comm map entries.
    pub comm: Vec<CommMapEntry>,
    pub location: Option<BucketLocation>,
    live: bool,
}

impl EntitySlot {
    pub fn is_live(&self) -> bool {
        self.live
    }
}

#[derive(Clone, Debug)]
struct PendingReclaim {
    entity: Entity,
    key: EntityKey,
    was_ghost: bool,
}

/// Key map, arena, free list and ghost-reuse map.
#[derive(Clone, Debug, Default)]
pub struct EntityRegistry {
    slots: Vec<EntitySlot>,
    by_key: HashMap<EntityKey, Entity>,
    free: Vec<u32>,
    ghost_reuse: HashMap<EntityKey, Entity>,
    pending: Vec<PendingReclaim>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `key`, returning its handle and whether it was newly created.
    ///
    /// An existing key returns its current handle. A key parked in the
    /// ghost-reuse map gets its old handle back; otherwise a slot comes from
    /// the free list or the arena grows.
    pub fn create(&mut self, key: EntityKey, owner: usize) -> (Entity, bool) {
        if let Some(&existing) = self.by_key.get(&key) {
            return (existing, false);
        }
        let entity = if let Some(reused) = self.ghost_reuse.remove(&key) {
            reused
        } else if let Some(index) = self.free.pop() {
            Entity::new(index, self.slots[index as usize].generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(EntitySlot::default());
            Entity::new(index, 0)
        };
        let slot = &mut self.slots[entity.index()];
        *slot = EntitySlot {
            key: Some(key),
            generation: entity.generation(),
            state: EntityState::Created,
            owner,
            live: true,
            ..EntitySlot::default()
        };
        self.by_key.insert(key, entity);
        (entity, true)
    }

    pub fn lookup(&self, key: EntityKey) -> Option<Entity> {
        self.by_key.get(&key).copied()
    }

    /// Whether `entity` refers to a live slot with a matching generation.
    pub fn is_valid(&self, entity: Entity) -> bool {
        self.slots
            .get(entity.index())
            .is_some_and(|s| s.live && s.generation == entity.generation())
    }

    pub fn slot(&self, entity: Entity) -> Result<&EntitySlot, MeshError> {
        match self.slots.get(entity.index()) {
            Some(s) if s.live && s.generation == entity.generation() => Ok(s),
            _ => Err(MeshError::StaleEntity(entity)),
        }
    }

    pub fn slot_mut(&mut self, entity: Entity) -> Result<&mut EntitySlot, MeshError> {
        match self.slots.get_mut(entity.index()) {
            Some(s) if s.live && s.generation == entity.generation() => Ok(s),
            _ => Err(MeshError::StaleEntity(entity)),
        }
    }

    pub fn key(&self, entity: Entity) -> Result<EntityKey, MeshError> {
        self.slot(entity)?
            .key
            .ok_or(MeshError::StaleEntity(entity))
    }

    /// Unregister a destroyed entity. Its key becomes free immediately, its
    /// slot only when `reclaim_deleted` runs at the end of the cycle.
    pub fn mark_deleted(&mut self, entity: Entity, was_ghost: bool) -> Result<EntityKey, MeshError> {
        let slot = self.slot_mut(entity)?;
        let key = slot.key.ok_or(MeshError::StaleEntity(entity))?;
        slot.live = false;
        slot.state = EntityState::Deleted;
        slot.relations.clear();
        slot.comm.clear();
        slot.parts.clear();
        slot.location = None;
        self.by_key.remove(&key);
        self.pending.push(PendingReclaim {
            entity,
            key,
            was_ghost,
        });
        Ok(key)
    }

    /// Change the key of a live entity.
    pub fn rekey(&mut self, entity: Entity, new_key: EntityKey) -> Result<(), MeshError> {
        let old = self.key(entity)?;
        if old == new_key {
            return Ok(());
        }
        if self.by_key.contains_key(&new_key) {
            return Err(MeshError::RekeyCollision {
                from: old,
                to: new_key,
            });
        }
        self.by_key.remove(&old);
        self.by_key.insert(new_key, entity);
        self.slot_mut(entity)?.key = Some(new_key);
        Ok(())
    }

    /// Keys destroyed during the current cycle, not yet reclaimed.
    pub fn pending_deleted_keys(&self) -> impl Iterator<Item = EntityKey> + '_ {
        self.pending.iter().map(|p| p.key)
    }

    /// Return this cycle's destroyed slots to the free list or ghost-reuse map.
    pub fn reclaim_deleted(&mut self) -> usize {
        let n = self.pending.len();
        for p in self.pending.drain(..) {
            let slot = &mut self.slots[p.entity.index()];
            slot.key = None;
            slot.state = EntityState::Unchanged;
            if p.was_ghost && !self.by_key.contains_key(&p.key) {
                if let Some(previous) = self.ghost_reuse.insert(p.key, p.entity) {
                    if previous.index() != p.entity.index() {
                        let prev = &mut self.slots[previous.index()];
                        prev.generation = prev.generation.wrapping_add(1);
                        self.free.push(previous.index() as u32);
                    }
                }
            } else {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(p.entity.index() as u32);
            }
        }
        n
    }

    /// Largest id in use for `rank`, counting keys pending deletion.
    pub fn max_id(&self, rank: EntityRank) -> u64 {
        self.by_key
            .keys()
            .copied()
            .chain(self.pending_deleted_keys())
            .filter(|k| k.rank() == rank)
            .map(|k| k.id())
            .max()
            .unwrap_or(0)
    }

    /// Live entities in slot order.
    pub fn live(&self) -> impl Iterator<Item = Entity> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.live)
            .map(|(i, s)| Entity::new(i as u32, s.generation))
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    pub fn ghost_reuse_len(&self) -> usize {
        self.ghost_reuse.len()
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }
}
