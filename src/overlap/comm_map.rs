//! Comm maps: which other processes hold a copy of an entity, and why.
//!
//! Every entity carries a sorted list of `CommMapEntry { ghost, proc }`.
//! Entries with `ghost == GhostId::SHARED` form the sharing list; entries with
//! any other id are ghosting entries (on the owner they name the receivers,
//! on a receiver they name the owner it got the ghost from).
//!
//! The mesh also keeps a global comm list of all entities with a non-empty
//! comm map, sorted by key and rebuilt with sort + dedup after each batch of
//! insertions.

use std::fmt;

use crate::topology::entity::Entity;
use crate::topology::entity_key::EntityKey;

/// Id of a ghosting channel. `0` is the sharing relation, `1` the aura.
#[derive(
    Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct GhostId(pub(crate) u32);

impl GhostId {
    pub const SHARED: GhostId = GhostId(0);
    pub const AURA: GhostId = GhostId(1);

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Whether this id names a replication channel rather than sharing.
    #[inline]
    pub const fn is_ghosting(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for GhostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            0 => f.write_str("Ghost(shared)"),
            1 => f.write_str("Ghost(aura)"),
            n => write!(f, "Ghost({n})"),
        }
    }
}

/// One `(channel, process)` record of an entity's comm map.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommMapEntry {
    pub ghost: GhostId,
    pub proc: u32,
}

impl CommMapEntry {
    #[inline]
    pub fn new(ghost: GhostId, proc: usize) -> Self {
        Self {
            ghost,
            proc: proc as u32,
        }
    }

    #[inline]
    pub fn proc(&self) -> usize {
        self.proc as usize
    }
}

/// Insert keeping the list sorted. Returns whether the entry was new.
pub fn insert(list: &mut Vec<CommMapEntry>, entry: CommMapEntry) -> bool {
    match list.binary_search(&entry) {
        Ok(_) => false,
        Err(i) => {
            list.insert(i, entry);
            true
        }
    }
}

/// Remove an entry. Returns whether it was present.
pub fn erase(list: &mut Vec<CommMapEntry>, entry: CommMapEntry) -> bool {
    match list.binary_search(&entry) {
        Ok(i) => {
            list.remove(i);
            true
        }
        Err(_) => false,
    }
}

/// Remove every entry of channel `ghost`. Returns whether anything was removed.
pub fn erase_channel(list: &mut Vec<CommMapEntry>, ghost: GhostId) -> bool {
    let before = list.len();
    list.retain(|e| e.ghost != ghost);
    before != list.len()
}

/// Entries of channel `ghost`, as a contiguous slice.
pub fn channel(list: &[CommMapEntry], ghost: GhostId) -> &[CommMapEntry] {
    let lo = list.partition_point(|e| e.ghost < ghost);
    let hi = list.partition_point(|e| e.ghost <= ghost);
    &list[lo..hi]
}

/// Processes the entity is shared with, ascending.
pub fn sharing_procs(list: &[CommMapEntry]) -> impl Iterator<Item = usize> + '_ {
    channel(list, GhostId::SHARED).iter().map(|e| e.proc())
}

pub fn is_shared(list: &[CommMapEntry]) -> bool {
    list.first().is_some_and(|e| e.ghost == GhostId::SHARED)
}

pub fn is_shared_with(list: &[CommMapEntry], proc: usize) -> bool {
    list.binary_search(&CommMapEntry::new(GhostId::SHARED, proc)).is_ok()
}

/// Replace the sharing sub-list with `procs` (sorted, without self).
/// Returns whether the sharing list changed.
pub fn set_sharing(list: &mut Vec<CommMapEntry>, procs: &[usize]) -> bool {
    let current: Vec<usize> = sharing_procs(list).collect();
    if current == procs {
        return false;
    }
    erase_channel(list, GhostId::SHARED);
    let shared: Vec<CommMapEntry> = procs
        .iter()
        .map(|&p| CommMapEntry::new(GhostId::SHARED, p))
        .collect();
    list.splice(0..0, shared);
    true
}

/// Global, key-sorted list of communicated entities.
#[derive(Clone, Debug, Default)]
pub struct CommList {
    entries: Vec<(EntityKey, Entity)>,
}

impl CommList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents, sorting by key and dropping duplicates.
    pub fn rebuild(&mut self, mut entries: Vec<(EntityKey, Entity)>) {
        entries.sort_unstable_by_key(|&(k, _)| k);
        entries.dedup_by_key(|&mut (k, _)| k);
        self.entries = entries;
    }

    pub fn find(&self, key: EntityKey) -> Option<Entity> {
        self.entries
            .binary_search_by_key(&key, |&(k, _)| k)
            .ok()
            .map(|i| self.entries[i].1)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(EntityKey, Entity)> + '_ {
        self.entries.iter()
    }

    pub fn as_slice(&self) -> &[(EntityKey, Entity)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
