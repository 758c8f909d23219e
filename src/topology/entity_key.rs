//! `EntityRank` and `EntityKey`: the global, process-independent identity of
//! a mesh entity.
//!
//! An `EntityKey` packs `(rank, id)` into a single non-zero `u64`: the rank
//! lives in the top 8 bits and the id in the low 56 bits. Because the rank
//! occupies the most significant bits, the natural integer order of the
//! packed value is the lexicographic `(rank, id)` order, which is the order
//! every sorted comm list and wire message relies on.
//!
//! Id `0` is reserved as an invalid sentinel, so every valid key is non-zero
//! and `Option<EntityKey>` costs nothing extra.

use std::{fmt, num::NonZeroU64};

use crate::mesh_error::MeshError;

/// Topological rank of an entity (node < edge < face < element < constraint).
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct EntityRank(u8);

impl EntityRank {
    pub const NODE: EntityRank = EntityRank(0);
    pub const EDGE: EntityRank = EntityRank(1);
    pub const FACE: EntityRank = EntityRank(2);
    pub const ELEMENT: EntityRank = EntityRank(3);
    pub const CONSTRAINT: EntityRank = EntityRank(4);

    /// Number of ranks a mesh stores.
    pub const COUNT: usize = 5;

    /// Build a rank from its raw value.
    pub fn new(raw: u8) -> Result<Self, MeshError> {
        if (raw as usize) < Self::COUNT {
            Ok(EntityRank(raw))
        } else {
            Err(MeshError::InvalidRank(raw))
        }
    }

    #[inline]
    pub const fn get(self) -> u8 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// All ranks in ascending order.
    pub fn all() -> impl Iterator<Item = EntityRank> {
        (0..Self::COUNT as u8).map(EntityRank)
    }
}

impl fmt::Debug for EntityRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for EntityRank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0 => f.write_str("NODE"),
            1 => f.write_str("EDGE"),
            2 => f.write_str("FACE"),
            3 => f.write_str("ELEMENT"),
            4 => f.write_str("CONSTRAINT"),
            r => write!(f, "RANK{r}"),
        }
    }
}

/// Global `(rank, id)` identity, totally ordered, used as the wire identity.
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct EntityKey(NonZeroU64);

const ID_BITS: u32 = 56;
const ID_MASK: u64 = (1u64 << ID_BITS) - 1;

impl EntityKey {
    /// Largest id representable in a key.
    pub const MAX_ID: u64 = ID_MASK;

    /// Creates a key, rejecting id `0` and ids that do not fit in 56 bits.
    ///
    /// ```rust
    /// # use mesh_bulk::topology::entity_key::{EntityKey, EntityRank};
    /// let k = EntityKey::new(EntityRank::ELEMENT, 7).unwrap();
    /// assert_eq!(k.rank(), EntityRank::ELEMENT);
    /// assert_eq!(k.id(), 7);
    /// ```
    pub fn new(rank: EntityRank, id: u64) -> Result<Self, MeshError> {
        if id == 0 || id > ID_MASK {
            return Err(MeshError::InvalidEntityId { id, max: ID_MASK });
        }
        let raw = ((rank.get() as u64) << ID_BITS) | id;
        NonZeroU64::new(raw)
            .map(EntityKey)
            .ok_or(MeshError::InvalidEntityId { id, max: ID_MASK })
    }

    #[inline]
    pub fn rank(self) -> EntityRank {
        EntityRank((self.0.get() >> ID_BITS) as u8)
    }

    #[inline]
    pub fn id(self) -> u64 {
        self.0.get() & ID_MASK
    }

    /// Packed representation used on the wire.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0.get()
    }

    /// Decode a packed key, validating rank and id.
    pub fn from_raw(raw: u64) -> Result<Self, MeshError> {
        let rank = EntityRank::new((raw >> ID_BITS) as u8)?;
        Self::new(rank, raw & ID_MASK)
    }
}

impl fmt::Debug for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EntityKey")
            .field(&self.rank())
            .field(&self.id())
            .finish()
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.rank(), self.id())
    }
}



#[cfg(test)]
mod serde_tests {
    use super::*;

    #[test]
    fn json_roundtrip() {
        let k = EntityKey::new(EntityRank::EDGE, 123).unwrap();
        let s = serde_json::to_string(&k).unwrap();
        let k2: EntityKey = serde_json::from_str(&s).unwrap();
        assert_eq!(k2, k);
    }

    #[test]
    fn bincode_roundtrip() {
        let k = EntityKey::new(EntityRank::NODE, 456).unwrap();
        let bytes = bincode::serialize(&k).unwrap();
        let k2: EntityKey = bincode::deserialize(&bytes).unwrap();
        assert_eq!(k2, k);
    }
}
