//! Construction-time configuration of a mesh. Immutable once the mesh exists.

use serde::{Deserialize, Serialize};

use crate::topology::entity_key::EntityRank;

/// Which upward (lower rank to higher rank) back-relations are stored.
///
/// Downward relations are always stored. An upward pair that is not stored
/// is computed on demand by scanning the entities of the higher rank.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityPolicy {
    /// `upward[lower][higher]`
    upward: [[bool; EntityRank::COUNT]; EntityRank::COUNT],
}

impl Default for ConnectivityPolicy {
    fn default() -> Self {
        let mut upward = [[false; EntityRank::COUNT]; EntityRank::COUNT];
        for (lo, row) in upward.iter_mut().enumerate() {
            for (hi, stored) in row.iter_mut().enumerate() {
                *stored = hi > lo;
            }
        }
        Self { upward }
    }
}

impl ConnectivityPolicy {
    /// Store no upward relations at all.
    pub fn downward_only() -> Self {
        Self {
            upward: [[false; EntityRank::COUNT]; EntityRank::COUNT],
        }
    }

    pub fn stores_upward(&self, lower: EntityRank, higher: EntityRank) -> bool {
        self.upward[lower.index()][higher.index()]
    }

    pub fn with_upward(mut self, lower: EntityRank, higher: EntityRank, stored: bool) -> Self {
        if higher > lower {
            self.upward[lower.index()][higher.index()] = stored;
        }
        self
    }
}

/// When the parallel consistency check runs at the end of a cycle.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerifyMode {
    /// Only in builds with `debug_assertions`.
    #[default]
    DebugOnly,
    Always,
    Never,
}

impl VerifyMode {
    pub fn enabled(self) -> bool {
        match self {
            VerifyMode::DebugOnly => cfg!(debug_assertions),
            VerifyMode::Always => true,
            VerifyMode::Never => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub connectivity: ConnectivityPolicy,
    /// Maintain the built-in one-hop aura ghosting.
    pub auto_aura: bool,
    pub verify: VerifyMode,
    /// Maximum number of entities per bucket.
    pub bucket_capacity: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            connectivity: ConnectivityPolicy::default(),
            auto_aura: true,
            verify: VerifyMode::default(),
            bucket_capacity: 512,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stores_every_upward_pair() {
        let p = ConnectivityPolicy::default();
        assert!(p.stores_upward(EntityRank::NODE, EntityRank::ELEMENT));
        assert!(!p.stores_upward(EntityRank::ELEMENT, EntityRank::NODE));
        let p = p.with_upward(EntityRank::NODE, EntityRank::ELEMENT, false);
        assert!(!p.stores_upward(EntityRank::NODE, EntityRank::ELEMENT));
        assert!(p.stores_upward(EntityRank::NODE, EntityRank::EDGE));
    }

    #[test]
    fn config_roundtrips_through_json() {
        let cfg = MeshConfig {
            auto_aura: false,
            verify: VerifyMode::Always,
            ..MeshConfig::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: MeshConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
        let partial: MeshConfig = serde_json::from_str(r#"{"bucket_capacity": 8}"#).unwrap();
        assert_eq!(partial.bucket_capacity, 8);
        assert!(partial.auto_aura);
    }
}
