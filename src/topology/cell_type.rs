//! Topology tags for mesh entities.
//!
//! Only the connectivity-relevant facts are modelled here: the rank a
//! topology lives at, its node count, and the local node ordinals of its
//! sides and edges. Shape functions and geometry belong to other crates.

use crate::mesh_error::MeshError;
use crate::topology::entity_key::EntityRank;

/// Common topologies for mesh entities.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Topology {
    /// No topology attached (constraints, bare declared entities).
    #[default]
    Unspecified,
    /// 0D node.
    Vertex,
    /// 2-node edge.
    Segment,
    /// 3-node face.
    Triangle,
    /// 4-node face.
    Quadrilateral,
    /// 3-node element of a 2D mesh.
    Triangle2D,
    /// 4-node element of a 2D mesh.
    Quadrilateral2D,
    /// 4-node tetrahedral element.
    Tetrahedron,
    /// 8-node hexahedral element.
    Hexahedron,
    /// Single-node element.
    Particle,
}

const LINE_EDGES: &[&[u8]] = &[&[0, 1]];
const TRI_EDGES: &[&[u8]] = &[&[0, 1], &[1, 2], &[2, 0]];
const QUAD_EDGES: &[&[u8]] = &[&[0, 1], &[1, 2], &[2, 3], &[3, 0]];
const TET_FACES: &[&[u8]] = &[&[0, 1, 3], &[1, 2, 3], &[0, 3, 2], &[0, 2, 1]];
const TET_EDGES: &[&[u8]] = &[&[0, 1], &[1, 2], &[2, 0], &[0, 3], &[1, 3], &[2, 3]];
const HEX_FACES: &[&[u8]] = &[
    &[0, 1, 5, 4],
    &[1, 2, 6, 5],
    &[2, 3, 7, 6],
    &[0, 4, 7, 3],
    &[0, 3, 2, 1],
    &[4, 5, 6, 7],
];
const HEX_EDGES: &[&[u8]] = &[
    &[0, 1],
    &[1, 2],
    &[2, 3],
    &[3, 0],
    &[4, 5],
    &[5, 6],
    &[6, 7],
    &[7, 4],
    &[0, 4],
    &[1, 5],
    &[2, 6],
    &[3, 7],
];

impl Topology {
    /// Rank at which entities of this topology are stored.
    pub fn rank(self) -> Option<EntityRank> {
        match self {
            Topology::Unspecified => None,
            Topology::Vertex => Some(EntityRank::NODE),
            Topology::Segment => Some(EntityRank::EDGE),
            Topology::Triangle | Topology::Quadrilateral => Some(EntityRank::FACE),
            Topology::Triangle2D
            | Topology::Quadrilateral2D
            | Topology::Tetrahedron
            | Topology::Hexahedron
            | Topology::Particle => Some(EntityRank::ELEMENT),
        }
    }

    pub fn node_count(self) -> usize {
        match self {
            Topology::Unspecified => 0,
            Topology::Vertex | Topology::Particle => 1,
            Topology::Segment => 2,
            Topology::Triangle | Topology::Triangle2D => 3,
            Topology::Quadrilateral | Topology::Quadrilateral2D | Topology::Tetrahedron => 4,
            Topology::Hexahedron => 8,
        }
    }

    /// Rank of the sides of an element (edges in 2D, faces in 3D).
    pub fn side_rank(self) -> Option<EntityRank> {
        match self {
            Topology::Triangle2D | Topology::Quadrilateral2D => Some(EntityRank::EDGE),
            Topology::Tetrahedron | Topology::Hexahedron => Some(EntityRank::FACE),
            Topology::Triangle | Topology::Quadrilateral => Some(EntityRank::EDGE),
            Topology::Segment => Some(EntityRank::NODE),
            _ => None,
        }
    }

    fn side_table(self) -> &'static [&'static [u8]] {
        match self {
            Topology::Segment => &[&[0], &[1]],
            Topology::Triangle | Topology::Triangle2D => TRI_EDGES,
            Topology::Quadrilateral | Topology::Quadrilateral2D => QUAD_EDGES,
            Topology::Tetrahedron => TET_FACES,
            Topology::Hexahedron => HEX_FACES,
            _ => &[],
        }
    }

    pub fn side_count(self) -> usize {
        self.side_table().len()
    }

    /// Local node ordinals of side `ordinal`, in the order the side expects.
    pub fn side_nodes(self, ordinal: usize) -> Result<&'static [u8], MeshError> {
        self.side_table().get(ordinal).copied().ok_or_else(|| {
            MeshError::Topology(format!("{self:?} has no side with ordinal {ordinal}"))
        })
    }

    /// Topology of side `ordinal`.
    pub fn side_topology(self, ordinal: usize) -> Result<Topology, MeshError> {
        let nodes = self.side_nodes(ordinal)?;
        Ok(match nodes.len() {
            1 => Topology::Vertex,
            2 => Topology::Segment,
            3 => Topology::Triangle,
            4 => Topology::Quadrilateral,
            n => {
                return Err(MeshError::Topology(format!(
                    "unsupported side with {n} nodes on {self:?}"
                )));
            }
        })
    }

    /// Local node ordinals of the edges of a 3D element (or of a face).
    pub fn edge_nodes(self) -> &'static [&'static [u8]] {
        match self {
            Topology::Segment => LINE_EDGES,
            Topology::Triangle | Topology::Triangle2D => TRI_EDGES,
            Topology::Quadrilateral | Topology::Quadrilateral2D => QUAD_EDGES,
            Topology::Tetrahedron => TET_EDGES,
            Topology::Hexahedron => HEX_EDGES,
            _ => &[],
        }
    }

    /// Stable one-byte tag for the wire.
    pub fn to_wire(self) -> u8 {
        match self {
            Topology::Unspecified => 0,
            Topology::Vertex => 1,
            Topology::Segment => 2,
            Topology::Triangle => 3,
            Topology::Quadrilateral => 4,
            Topology::Triangle2D => 5,
            Topology::Quadrilateral2D => 6,
            Topology::Tetrahedron => 7,
            Topology::Hexahedron => 8,
            Topology::Particle => 9,
        }
    }

    pub fn from_wire(tag: u8) -> Result<Self, MeshError> {
        Ok(match tag {
            0 => Topology::Unspecified,
            1 => Topology::Vertex,
            2 => Topology::Segment,
            3 => Topology::Triangle,
            4 => Topology::Quadrilateral,
            5 => Topology::Triangle2D,
            6 => Topology::Quadrilateral2D,
            7 => Topology::Tetrahedron,
            8 => Topology::Hexahedron,
            9 => Topology::Particle,
            t => return Err(MeshError::Wire(format!("unknown topology tag {t}"))),
        })
    }
}
