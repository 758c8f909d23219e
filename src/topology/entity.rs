//! Process-local entity handles and per-cycle entity state.

use std::fmt;

/// Process-local handle: an index into the registry arena plus the
/// generation the slot had when the handle was issued.
///
/// Handles are meaningless on other processes. A handle goes stale when its
/// slot is recycled through the general free list; ghost slots keep their
/// generation so a ghost re-created with the same key gets back the same
/// handle.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Entity {
    index: u32,
    generation: u32,
}

impl Entity {
    #[inline]
    pub(crate) const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index in the per-process arrays.
    #[inline]
    pub const fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({}v{})", self.index, self.generation)
    }
}

/// Per-cycle modification state of an entity.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub enum EntityState {
    /// Untouched since the last `end_modification`.
    #[default]
    Unchanged,
    /// Declared during the current cycle.
    Created,
    /// Relations, parts or ownership changed during the current cycle.
    Modified,
    /// Destroyed during the current cycle; the slot is reclaimed at the end of it.
    Deleted,
}

impl EntityState {
    /// Promote to `Modified` unless the entity is new or gone.
    #[inline]
    pub fn touched(self) -> Self {
        match self {
            EntityState::Unchanged => EntityState::Modified,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn touched_keeps_created() {
        assert_eq!(EntityState::Unchanged.touched(), EntityState::Modified);
        assert_eq!(EntityState::Created.touched(), EntityState::Created);
        assert_eq!(EntityState::Deleted.touched(), EntityState::Deleted);
    }

    #[test]
    fn handles_compare_by_generation() {
        let a = Entity::new(3, 0);
        let b = Entity::new(3, 1);
        assert_ne!(a, b);
        assert_eq!(a.index(), b.index());
        assert_eq!(format!("{b:?}"), "Entity(3v1)");
    }
}
