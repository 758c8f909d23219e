//! Relation: a directed, ranked incidence between two entities, tagged with
//! the ordinal of the target in the source's local numbering and the
//! permutation under which the source sees the target.
//!
//! Each entity stores a single relation list holding both its downward
//! relations (targets of lower rank) and, where the connectivity policy keeps
//! them, its upward back-relations. The list is kept sorted by
//! `(rank, ordinal, entity)` so that downward relations come first and
//! lookups are binary searches.

use crate::topology::entity::Entity;
use crate::topology::entity_key::EntityRank;

/// One stored relation as seen from the entity that owns the list.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Relation {
    /// Rank of the related entity.
    pub rank: EntityRank,
    /// Ordinal of the lower-rank entity in the higher-rank one's numbering.
    pub ordinal: u16,
    /// Which rotation/reflection of the lower-rank node order matches.
    pub permutation: u8,
    /// The related entity.
    pub entity: Entity,
}

impl Relation {
    #[inline]
    pub fn new(rank: EntityRank, ordinal: u16, permutation: u8, entity: Entity) -> Self {
        Self {
            rank,
            ordinal,
            permutation,
            entity,
        }
    }

    #[inline]
    fn sort_key(&self) -> (EntityRank, u16, Entity) {
        (self.rank, self.ordinal, self.entity)
    }
}

/// Insert `rel` keeping `list` sorted. Returns `false` if an identical
/// `(rank, ordinal, entity)` entry already existed; its permutation is
/// overwritten in that case.
pub fn insert_sorted(list: &mut Vec<Relation>, rel: Relation) -> bool {
    match list.binary_search_by(|r| r.sort_key().cmp(&rel.sort_key())) {
        Ok(i) => {
            list[i].permutation = rel.permutation;
            false
        }
        Err(i) => {
            list.insert(i, rel);
            true
        }
    }
}

/// Remove the `(rank, ordinal, entity)` entry. Returns whether it existed.
pub fn remove_sorted(list: &mut Vec<Relation>, rank: EntityRank, ordinal: u16, entity: Entity) -> bool {
    match list.binary_search_by(|r| r.sort_key().cmp(&(rank, ordinal, entity))) {
        Ok(i) => {
            list.remove(i);
            true
        }
        Err(_) => false,
    }
}

/// Relations of `list` to entities of exactly `rank`.
pub fn of_rank(list: &[Relation], rank: EntityRank) -> &[Relation] {
    let lo = list.partition_point(|r| r.rank < rank);
    let hi = list.partition_point(|r| r.rank <= rank);
    &list[lo..hi]
}

/// Relations in `list` whose target rank is strictly below `rank`.
pub fn below(list: &[Relation], rank: EntityRank) -> &[Relation] {
    let hi = list.partition_point(|r| r.rank < rank);
    &list[..hi]
}

/// Relations in `list` whose target rank is strictly above `rank`.
pub fn above(list: &[Relation], rank: EntityRank) -> &[Relation] {
    let lo = list.partition_point(|r| r.rank <= rank);
    &list[lo..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e(i: u32) -> Entity {
        Entity::new(i, 0)
    }

    #[test]
    fn insert_keeps_rank_then_ordinal_order() {
        let mut list = Vec::new();
        assert!(insert_sorted(&mut list, Relation::new(EntityRank::ELEMENT, 0, 0, e(9))));
        assert!(insert_sorted(&mut list, Relation::new(EntityRank::NODE, 1, 0, e(2))));
        assert!(insert_sorted(&mut list, Relation::new(EntityRank::NODE, 0, 0, e(1))));
        let ranks: Vec<_> = list.iter().map(|r| (r.rank, r.ordinal)).collect();
        assert_eq!(
            ranks,
            vec![
                (EntityRank::NODE, 0),
                (EntityRank::NODE, 1),
                (EntityRank::ELEMENT, 0)
            ]
        );
        assert!(!insert_sorted(&mut list, Relation::new(EntityRank::NODE, 0, 3, e(1))));
        assert_eq!(list[0].permutation, 3);
    }

    #[test]
    fn rank_slices() {
        let mut list = Vec::new();
        insert_sorted(&mut list, Relation::new(EntityRank::NODE, 0, 0, e(1)));
        insert_sorted(&mut list, Relation::new(EntityRank::EDGE, 0, 0, e(2)));
        insert_sorted(&mut list, Relation::new(EntityRank::ELEMENT, 2, 0, e(3)));
        assert_eq!(of_rank(&list, EntityRank::EDGE).len(), 1);
        assert_eq!(below(&list, EntityRank::FACE).len(), 2);
        assert_eq!(above(&list, EntityRank::FACE).len(), 1);
        assert!(remove_sorted(&mut list, EntityRank::EDGE, 0, e(2)));
        assert!(!remove_sorted(&mut list, EntityRank::EDGE, 0, e(2)));
    }
}
