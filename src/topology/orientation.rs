//! Node-ordinal permutation groups of side topologies, and the search that
//! resolves the permutation a higher-rank entity sees a side under.
//!
//! Permutation `p` of topology `T` is a map `[0..n) -> [0..n)`; a candidate
//! node sequence `c` matches an expected sequence `e` under `p` when
//! `c[perm[p][i]] == e[i]` for every `i`. Rotations come first (positive
//! polarity), reflections after, so `p < positive_permutation_count(T)` means
//! the side is seen with the same orientation.

use crate::topology::cell_type::Topology;

const VERTEX_PERMS: &[&[u8]] = &[&[0]];
const SEGMENT_PERMS: &[&[u8]] = &[&[0, 1], &[1, 0]];
const TRI_PERMS: &[&[u8]] = &[
    &[0, 1, 2],
    &[2, 0, 1],
    &[1, 2, 0],
    &[0, 2, 1],
    &[2, 1, 0],
    &[1, 0, 2],
];
const QUAD_PERMS: &[&[u8]] = &[
    &[0, 1, 2, 3],
    &[3, 0, 1, 2],
    &[2, 3, 0, 1],
    &[1, 2, 3, 0],
    &[0, 3, 2, 1],
    &[3, 2, 1, 0],
    &[2, 1, 0, 3],
    &[1, 0, 3, 2],
];

/// All valid node permutations of `topo` (empty for element topologies).
pub fn permutations(topo: Topology) -> &'static [&'static [u8]] {
    match topo {
        Topology::Vertex => VERTEX_PERMS,
        Topology::Segment => SEGMENT_PERMS,
        Topology::Triangle => TRI_PERMS,
        Topology::Quadrilateral => QUAD_PERMS,
        _ => &[],
    }
}

/// Number of permutations that preserve orientation.
pub fn positive_permutation_count(topo: Topology) -> usize {
    let n = permutations(topo).len();
    if n <= 1 { n } else { n / 2 }
}

/// Whether permutation `p` of `topo` preserves orientation.
pub fn is_positive_polarity(topo: Topology, p: u8) -> bool {
    (p as usize) < positive_permutation_count(topo)
}

/// Search the permutation group of `topo` for the permutation under which
/// `candidate` matches `expected`.
///
/// The groups are unambiguous for distinct node keys, so the first match is
/// the only one.
pub fn find_permutation<T: Copy + Eq>(topo: Topology, expected: &[T], candidate: &[T]) -> Option<u8> {
    if expected.len() != candidate.len() || expected.len() != topo.node_count() {
        return None;
    }
    permutations(topo).iter().position(|perm| {
        perm.iter()
            .zip(expected)
            .all(|(&ci, e)| candidate[ci as usize] == *e)
    })
    .map(|p| p as u8)
}
