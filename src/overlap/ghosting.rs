//! Ghosting channels.
//!
//! A `Ghosting` is a named replication channel. The mesh always has two
//! built-in ones: `shared` (id 0, never carries ghosts, only stands for the
//! sharing relation) and `aura` (id 1, recomputed from sharing every cycle).
//! Custom channels keep an explicit list of `(entity, destination)` roots on
//! the owning process; the downward closure of those roots is what gets sent.
//!
//! Requests made while the mesh is modifiable are only recorded here. They
//! are applied collectively in `end_modification`.

use crate::overlap::comm_map::GhostId;
use crate::topology::entity::Entity;
use crate::topology::entity_key::EntityKey;

#[derive(Clone, Debug)]
pub struct Ghosting {
    id: GhostId,
    name: String,
    sync_count: u64,
    /// Persistent send roots (custom channels only), sorted.
    roots: Vec<(Entity, usize)>,
    pending_add: Vec<(Entity, usize)>,
    pending_remove_receive: Vec<EntityKey>,
    pending_clear: bool,
    destroyed: bool,
}

impl Ghosting {
    pub(crate) fn new(id: GhostId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            sync_count: 0,
            roots: Vec::new(),
            pending_add: Vec::new(),
            pending_remove_receive: Vec::new(),
            pending_clear: false,
            destroyed: false,
        }
    }

    pub fn id(&self) -> GhostId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Generation stamp, bumped each cycle the channel's membership changed.
    pub fn sync_count(&self) -> u64 {
        self.sync_count
    }

    pub fn is_custom(&self) -> bool {
        self.id > GhostId::AURA
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn roots(&self) -> &[(Entity, usize)] {
        &self.roots
    }

    pub(crate) fn request_add(&mut self, entity: Entity, proc: usize) {
        self.pending_add.push((entity, proc));
    }

    pub(crate) fn request_remove_receive(&mut self, key: EntityKey) {
        self.pending_remove_receive.push(key);
    }

    pub(crate) fn request_clear(&mut self) {
        self.pending_clear = true;
        self.pending_add.clear();
    }

    /// Drop pending send requests for a destroyed entity.
    pub(crate) fn forget_pending(&mut self, entity: Entity) {
        self.pending_add.retain(|&(e, _)| e != entity);
    }

    /// Whether requests are queued for the next `end_modification`.
    pub fn has_pending(&self) -> bool {
        self.pending_clear || !self.pending_add.is_empty() || !self.pending_remove_receive.is_empty()
    }

    /// Fold pending send requests into the persistent roots.
    pub(crate) fn apply_pending_roots(&mut self) {
        if self.pending_clear {
            self.roots.clear();
        }
        self.roots.append(&mut self.pending_add);
        self.roots.sort_unstable();
        self.roots.dedup();
    }

    pub(crate) fn take_remove_receive(&mut self) -> Vec<EntityKey> {
        let mut keys = std::mem::take(&mut self.pending_remove_receive);
        keys.sort_unstable();
        keys.dedup();
        keys
    }

    pub(crate) fn set_roots(&mut self, roots: Vec<(Entity, usize)>) {
        self.roots = roots;
        self.roots.sort_unstable();
        self.roots.dedup();
    }

    /// Close out the cycle for this channel.
    pub(crate) fn finish_cycle(&mut self, changed: bool) {
        if changed {
            self.sync_count += 1;
        }
        if self.pending_clear {
            self.destroyed = true;
            self.pending_clear = false;
        }
    }
}
