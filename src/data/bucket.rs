//! Buckets: homogeneous storage groups of entities sharing a rank and an
//! exact part signature, plus the observer hooks the field-data layer uses to
//! keep per-entity data allocated in step with topology changes.
//!
//! The core never looks at field bytes. It only announces where entities
//! land (`entity_added`), where they leave (`entity_removed`), and when a
//! bucket appears or disappears.

use std::collections::HashMap;

use crate::data::meta::PartOrdinal;
use crate::topology::entity::Entity;
use crate::topology::entity_key::EntityRank;

/// Callbacks from the mesh into an external field-data subsystem.
///
/// Registered once at mesh construction. All methods default to no-ops.
pub trait FieldDataObserver: Send {
    fn bucket_created(
        &mut self,
        _rank: EntityRank,
        _bucket: usize,
        _parts: &[PartOrdinal],
        _capacity: usize,
    ) {
    }

    fn bucket_destroyed(&mut self, _rank: EntityRank, _bucket: usize) {}

    /// An entity was appended to `bucket` at `ordinal`.
    fn entity_added(&mut self, _rank: EntityRank, _bucket: usize, _ordinal: usize) {}

    /// The entity at `ordinal` left `bucket`. Removal is a swap-remove: the
    /// bucket's last entity (if it was not the removed one) now sits at
    /// `ordinal`, exactly like `Vec::swap_remove`.
    fn entity_removed(&mut self, _rank: EntityRank, _bucket: usize, _ordinal: usize) {}

    /// Opaque field payload of an entity about to be sent as a ghost.
    fn pack_fields(&self, _rank: EntityRank, _bucket: usize, _ordinal: usize) -> Vec<u8> {
        Vec::new()
    }

    /// Field payload received with a ghost, delivered after it is placed.
    fn unpack_fields(&mut self, _rank: EntityRank, _bucket: usize, _ordinal: usize, _bytes: &[u8]) {}
}

/// Position of an entity inside the bucket repository.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BucketLocation {
    pub bucket: usize,
    pub ordinal: usize,
}

/// A homogeneous group of entities.
#[derive(Clone, Debug)]
pub struct Bucket {
    id: usize,
    rank: EntityRank,
    parts: Vec<PartOrdinal>,
    entities: Vec<Entity>,
    capacity: usize,
}

impl Bucket {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn rank(&self) -> EntityRank {
        self.rank
    }

    /// Sorted part signature shared by every entity in the bucket.
    pub fn parts(&self) -> &[PartOrdinal] {
        &self.parts
    }

    pub fn member(&self, part: PartOrdinal) -> bool {
        self.parts.binary_search(&part).is_ok()
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Clone, Debug, Default)]
struct RankBuckets {
    buckets: Vec<Option<Bucket>>,
    free_ids: Vec<usize>,
    by_parts: HashMap<Vec<PartOrdinal>, Vec<usize>>,
}

/// All buckets of a mesh, grouped per rank.
#[derive(Clone, Debug)]
pub struct BucketRepository {
    ranks: Vec<RankBuckets>,
    capacity: usize,
}

pub type Observers = Vec<Box<dyn FieldDataObserver>>;

impl BucketRepository {
    pub fn new(capacity: usize) -> Self {
        Self {
            ranks: vec![RankBuckets::default(); EntityRank::COUNT],
            capacity: capacity.max(1),
        }
    }

    /// Place `entity` into a bucket matching `parts` (which must be sorted),
    /// creating a bucket when none has room.
    pub fn insert(
        &mut self,
        rank: EntityRank,
        parts: &[PartOrdinal],
        entity: Entity,
        observers: &mut Observers,
    ) -> BucketLocation {
        let capacity = self.capacity;
        let rb = &mut self.ranks[rank.index()];
        let candidates = rb.by_parts.entry(parts.to_vec()).or_default();
        let open = candidates.iter().copied().find(|&id| {
            rb.buckets[id]
                .as_ref()
                .is_some_and(|b| b.entities.len() < b.capacity)
        });
        let id = match open {
            Some(id) => id,
            None => {
                let id = rb.free_ids.pop().unwrap_or(rb.buckets.len());
                if id >= rb.buckets.len() {
                    rb.buckets.resize_with(id + 1, || None);
                }
                candidates.push(id);
                for obs in observers.iter_mut() {
                    obs.bucket_created(rank, id, parts, capacity);
                }
                id
            }
        };
        let bucket = rb.buckets[id].get_or_insert_with(|| Bucket {
            id,
            rank,
            parts: parts.to_vec(),
            entities: Vec::with_capacity(capacity),
            capacity,
        });
        bucket.entities.push(entity);
        let ordinal = bucket.entities.len() - 1;
        for obs in observers.iter_mut() {
            obs.entity_added(rank, id, ordinal);
        }
        BucketLocation {
            bucket: id,
            ordinal,
        }
    }

    /// Swap-remove the entity at `loc`. Returns the entity that moved into
    /// `loc.ordinal`, if any, so the caller can update its location.
    pub fn remove(
        &mut self,
        rank: EntityRank,
        loc: BucketLocation,
        observers: &mut Observers,
    ) -> Option<Entity> {
        let rb = &mut self.ranks[rank.index()];
        let bucket = rb.buckets.get_mut(loc.bucket)?.as_mut()?;
        if loc.ordinal >= bucket.entities.len() {
            return None;
        }
        bucket.entities.swap_remove(loc.ordinal);
        for obs in observers.iter_mut() {
            obs.entity_removed(rank, loc.bucket, loc.ordinal);
        }
        let moved = bucket.entities.get(loc.ordinal).copied();
        if bucket.entities.is_empty() {
            let parts = bucket.parts.clone();
            rb.buckets[loc.bucket] = None;
            rb.free_ids.push(loc.bucket);
            if let Some(ids) = rb.by_parts.get_mut(&parts) {
                ids.retain(|&id| id != loc.bucket);
                if ids.is_empty() {
                    rb.by_parts.remove(&parts);
                }
            }
            for obs in observers.iter_mut() {
                obs.bucket_destroyed(rank, loc.bucket);
            }
        }
        moved
    }

    pub fn bucket(&self, rank: EntityRank, id: usize) -> Option<&Bucket> {
        self.ranks[rank.index()].buckets.get(id)?.as_ref()
    }

    /// Live buckets of `rank` in id order.
    pub fn buckets(&self, rank: EntityRank) -> impl Iterator<Item = &Bucket> + '_ {
        self.ranks[rank.index()].buckets.iter().flatten()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl FieldDataObserver for Recorder {
        fn bucket_created(&mut self, r: EntityRank, b: usize, _p: &[PartOrdinal], c: usize) {
            self.0.lock().unwrap().push(format!("create {r} {b} {c}"));
        }
        fn bucket_destroyed(&mut self, r: EntityRank, b: usize) {
            self.0.lock().unwrap().push(format!("destroy {r} {b}"));
        }
        fn entity_added(&mut self, r: EntityRank, b: usize, o: usize) {
            self.0.lock().unwrap().push(format!("add {r} {b} {o}"));
        }
        fn entity_removed(&mut self, r: EntityRank, b: usize, o: usize) {
            self.0.lock().unwrap().push(format!("remove {r} {b} {o}"));
        }
    }

    fn e(i: u32) -> Entity {
        Entity::new(i, 0)
    }

    #[test]
    fn buckets_split_at_capacity_and_are_reclaimed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut observers: Observers = vec![Box::new(Recorder(log.clone()))];
        let mut repo = BucketRepository::new(2);
        let parts = [PartOrdinal::from_raw(0)];

        let a = repo.insert(EntityRank::NODE, &parts, e(0), &mut observers);
        let b = repo.insert(EntityRank::NODE, &parts, e(1), &mut observers);
        let c = repo.insert(EntityRank::NODE, &parts, e(2), &mut observers);
        assert_eq!(a.bucket, b.bucket);
        assert_ne!(a.bucket, c.bucket);

        let moved = repo.remove(EntityRank::NODE, a, &mut observers);
        assert_eq!(moved, Some(e(1)));
        assert_eq!(repo.remove(EntityRank::NODE, c, &mut observers), None);
        assert_eq!(repo.buckets(EntityRank::NODE).count(), 1);

        let log = log.lock().unwrap();
        assert_eq!(log.first().unwrap(), "create NODE 0 2");
        assert_eq!(log.last().unwrap(), "destroy NODE 1");
    }

    #[test]
    fn signatures_do_not_mix() {
        let mut observers: Observers = Vec::new();
        let mut repo = BucketRepository::new(8);
        let a = repo.insert(EntityRank::NODE, &[PartOrdinal::from_raw(0)], e(0), &mut observers);
        let b = repo.insert(
            EntityRank::NODE,
            &[PartOrdinal::from_raw(0), PartOrdinal::from_raw(4)],
            e(1),
            &mut observers,
        );
        assert_ne!(a.bucket, b.bucket);
        assert!(repo.bucket(EntityRank::NODE, b.bucket).unwrap().member(PartOrdinal::from_raw(4)));
    }
}
