//! Part declarations: named, optionally rank-scoped classifications of
//! entities, with subset/superset closure and induction flags.
//!
//! Four parts are always present and maintained by the mesh itself:
//! `universal`, `locally_owned`, `globally_shared` and `aura`. User code may
//! query them but never adds or removes them directly.

use std::collections::HashMap;
use std::fmt;

use crate::mesh_error::MeshError;
use crate::topology::entity_key::EntityRank;

/// Index of a part in its `MetaData`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[repr(transparent)]
pub struct PartOrdinal(u32);

impl PartOrdinal {
    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    pub(crate) const fn from_raw(raw: u32) -> Self {
        PartOrdinal(raw)
    }
}

impl fmt::Debug for PartOrdinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Part#{}", self.0)
    }
}

/// A declared part.
#[derive(Clone, Debug)]
pub struct Part {
    name: String,
    ordinal: PartOrdinal,
    primary_rank: Option<EntityRank>,
    /// Transitive supersets, sorted.
    supersets: Vec<PartOrdinal>,
    /// Transitive subsets, sorted.
    subsets: Vec<PartOrdinal>,
    force_no_induce: bool,
    bookkeeping: bool,
}

impl Part {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ordinal(&self) -> PartOrdinal {
        self.ordinal
    }

    /// Rank the part is scoped to; `None` for rank-agnostic parts.
    pub fn primary_rank(&self) -> Option<EntityRank> {
        self.primary_rank
    }

    pub fn supersets(&self) -> &[PartOrdinal] {
        &self.supersets
    }

    pub fn subsets(&self) -> &[PartOrdinal] {
        &self.subsets
    }

    pub fn is_bookkeeping(&self) -> bool {
        self.bookkeeping
    }

    /// Whether membership of an entity of rank `from_rank` in this part is
    /// induced onto the lower-rank entities it relates to.
    pub fn should_induce(&self, from_rank: EntityRank) -> bool {
        !self.force_no_induce && !self.bookkeeping && self.primary_rank == Some(from_rank)
    }

    /// Whether this part can only be held by an entity of `rank` through
    /// induction.
    pub fn is_induced_on(&self, rank: EntityRank) -> bool {
        !self.bookkeeping && self.primary_rank.is_some_and(|r| r > rank)
    }
}

/// Registry of parts shared by every process of a mesh.
#[derive(Clone, Debug)]
pub struct MetaData {
    parts: Vec<Part>,
    by_name: HashMap<String, PartOrdinal>,
    committed: bool,
}

impl Default for MetaData {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaData {
    pub const UNIVERSAL: PartOrdinal = PartOrdinal(0);
    pub const LOCALLY_OWNED: PartOrdinal = PartOrdinal(1);
    pub const GLOBALLY_SHARED: PartOrdinal = PartOrdinal(2);
    pub const AURA: PartOrdinal = PartOrdinal(3);

    /// Empty metadata holding only the built-in bookkeeping parts.
    pub fn new() -> Self {
        let mut meta = Self {
            parts: Vec::new(),
            by_name: HashMap::new(),
            committed: false,
        };
        for name in ["universal", "locally_owned", "globally_shared", "aura"] {
            let ordinal = PartOrdinal(meta.parts.len() as u32);
            meta.parts.push(Part {
                name: name.to_string(),
                ordinal,
                primary_rank: None,
                supersets: Vec::new(),
                subsets: Vec::new(),
                force_no_induce: true,
                bookkeeping: true,
            });
            meta.by_name.insert(name.to_string(), ordinal);
        }
        meta
    }

    /// Declare a part, or return the existing one if `name` is already
    /// declared with the same primary rank.
    pub fn declare_part(
        &mut self,
        name: &str,
        primary_rank: Option<EntityRank>,
    ) -> Result<PartOrdinal, MeshError> {
        if let Some(&existing) = self.by_name.get(name) {
            if self.parts[existing.0 as usize].primary_rank == primary_rank {
                return Ok(existing);
            }
            return Err(MeshError::DuplicatePart(name.to_string()));
        }
        if self.committed {
            return Err(MeshError::MetaDataCommitted);
        }
        let ordinal = PartOrdinal(self.parts.len() as u32);
        self.parts.push(Part {
            name: name.to_string(),
            ordinal,
            primary_rank,
            supersets: Vec::new(),
            subsets: Vec::new(),
            force_no_induce: false,
            bookkeeping: false,
        });
        self.by_name.insert(name.to_string(), ordinal);
        Ok(ordinal)
    }

    /// Make `subset` a subset of `superset`, maintaining the transitive
    /// closure in both directions.
    pub fn declare_part_subset(
        &mut self,
        superset: PartOrdinal,
        subset: PartOrdinal,
    ) -> Result<(), MeshError> {
        if self.committed {
            return Err(MeshError::MetaDataCommitted);
        }
        self.check(superset)?;
        self.check(subset)?;
        if self.part(superset).bookkeeping || self.part(subset).bookkeeping {
            return Err(MeshError::BookkeepingPart(self.part(superset).name.clone()));
        }
        if superset == subset || self.part(superset).supersets.contains(&subset) {
            return Err(MeshError::Topology(format!(
                "part subset cycle between `{}` and `{}`",
                self.part(superset).name,
                self.part(subset).name
            )));
        }

        let mut uppers = self.part(superset).supersets.clone();
        uppers.push(superset);
        let mut lowers = self.part(subset).subsets.clone();
        lowers.push(subset);

        for &lo in &lowers {
            let p = &mut self.parts[lo.0 as usize];
            p.supersets.extend_from_slice(&uppers);
            p.supersets.sort_unstable();
            p.supersets.dedup();
        }
        for &up in &uppers {
            let p = &mut self.parts[up.0 as usize];
            p.subsets.extend_from_slice(&lowers);
            p.subsets.sort_unstable();
            p.subsets.dedup();
        }
        Ok(())
    }

    /// Disable induction for `part`.
    pub fn set_force_no_induce(&mut self, part: PartOrdinal, value: bool) -> Result<(), MeshError> {
        if self.committed {
            return Err(MeshError::MetaDataCommitted);
        }
        self.check(part)?;
        if !self.parts[part.0 as usize].bookkeeping {
            self.parts[part.0 as usize].force_no_induce = value;
        }
        Ok(())
    }

    /// Freeze the part set. A mesh can only be built on committed metadata.
    pub fn commit(&mut self) {
        self.committed = true;
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn part(&self, ordinal: PartOrdinal) -> &Part {
        &self.parts[ordinal.0 as usize]
    }

    pub fn get_part(&self, name: &str) -> Option<&Part> {
        self.by_name.get(name).map(|&o| self.part(o))
    }

    pub fn part_ordinal(&self, name: &str) -> Result<PartOrdinal, MeshError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| MeshError::UnknownPart(name.to_string()))
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    pub fn check(&self, ordinal: PartOrdinal) -> Result<(), MeshError> {
        if (ordinal.0 as usize) < self.parts.len() {
            Ok(())
        } else {
            Err(MeshError::UnknownPart(format!("#{}", ordinal.0)))
        }
    }

    pub fn is_bookkeeping(&self, ordinal: PartOrdinal) -> bool {
        self.part(ordinal).bookkeeping
    }

    /// `parts` plus all of their supersets, sorted and deduplicated.
    pub fn with_supersets(&self, parts: &[PartOrdinal]) -> Vec<PartOrdinal> {
        let mut out: Vec<PartOrdinal> = parts.to_vec();
        for &p in parts {
            out.extend_from_slice(&self.part(p).supersets);
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Parts of an entity of `from_rank` that it induces on lower-rank
    /// entities it relates to, closed under supersets of the same rank.
    pub fn induced_by(&self, from_parts: &[PartOrdinal], from_rank: EntityRank) -> Vec<PartOrdinal> {
        let mut out = Vec::new();
        for &p in from_parts {
            let part = self.part(p);
            if part.should_induce(from_rank) {
                out.push(p);
                out.extend(
                    part.supersets
                        .iter()
                        .copied()
                        .filter(|&s| self.part(s).should_induce(from_rank)),
                );
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_bookkeeping() {
        let meta = MetaData::new();
        assert!(meta.is_bookkeeping(MetaData::UNIVERSAL));
        assert!(meta.is_bookkeeping(MetaData::AURA));
        assert_eq!(meta.part_ordinal("globally_shared").unwrap(), MetaData::GLOBALLY_SHARED);
    }

    #[test]
    fn subset_closure_is_transitive() {
        let mut meta = MetaData::new();
        let a = meta.declare_part("a", None).unwrap();
        let b = meta.declare_part("b", None).unwrap();
        let c = meta.declare_part("c", None).unwrap();
        meta.declare_part_subset(a, b).unwrap();
        meta.declare_part_subset(b, c).unwrap();
        assert_eq!(meta.part(c).supersets(), &[a, b]);
        assert_eq!(meta.part(a).subsets(), &[b, c]);
        assert!(meta.declare_part_subset(c, a).is_err());
    }

    #[test]
    fn redeclare_same_rank_is_idempotent() {
        let mut meta = MetaData::new();
        let a = meta.declare_part("block_1", Some(EntityRank::ELEMENT)).unwrap();
        assert_eq!(meta.declare_part("block_1", Some(EntityRank::ELEMENT)).unwrap(), a);
        assert!(meta.declare_part("block_1", None).is_err());
        meta.commit();
        assert!(matches!(
            meta.declare_part("late", None),
            Err(MeshError::MetaDataCommitted)
        ));
    }

    #[test]
    fn induction_follows_primary_rank() {
        let mut meta = MetaData::new();
        let block = meta.declare_part("block_1", Some(EntityRank::ELEMENT)).unwrap();
        let all_blocks = meta.declare_part("all_blocks", Some(EntityRank::ELEMENT)).unwrap();
        let tagged = meta.declare_part("tagged", None).unwrap();
        meta.declare_part_subset(all_blocks, block).unwrap();
        meta.declare_part_subset(tagged, block).unwrap();

        let induced = meta.induced_by(&[block, all_blocks, tagged], EntityRank::ELEMENT);
        assert_eq!(induced, vec![block, all_blocks]);
        assert!(meta.induced_by(&[block], EntityRank::FACE).is_empty());
        assert!(meta.part(block).is_induced_on(EntityRank::NODE));
        assert!(!meta.part(tagged).is_induced_on(EntityRank::NODE));
    }

    #[test]
    fn force_no_induce() {
        let mut meta = MetaData::new();
        let block = meta.declare_part("block_1", Some(EntityRank::ELEMENT)).unwrap();
        meta.set_force_no_induce(block, true).unwrap();
        assert!(!meta.part(block).should_induce(EntityRank::ELEMENT));
    }
}
