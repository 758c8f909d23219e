#![allow(dead_code)]
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mesh_bulk::prelude::*;

pub fn key(rank: EntityRank, id: u64) -> EntityKey {
    EntityKey::new(rank, id).unwrap()
}

/// Committed metadata with the given application parts, in order.
pub fn meta_with(parts: &[(&str, Option<EntityRank>)]) -> (Arc<MetaData>, Vec<PartOrdinal>) {
    let mut meta = MetaData::new();
    let ordinals = parts
        .iter()
        .map(|&(name, rank)| meta.declare_part(name, rank).unwrap())
        .collect();
    meta.commit();
    (Arc::new(meta), ordinals)
}

/// Config used by the parallel tests: every cycle is checked for
/// consistency, whatever the build profile.
pub fn checked_config() -> MeshConfig {
    MeshConfig {
        verify: VerifyMode::Always,
        ..MeshConfig::default()
    }
}

pub fn serial_mesh(meta: &Arc<MetaData>) -> BulkData {
    BulkData::new(Arc::clone(meta), NoComm, checked_config()).unwrap()
}

pub fn world(size: usize) -> LocalWorld {
    LocalWorld::with_timeout(size, Duration::from_secs(20))
}

/// Run `f` once per rank of `world`, each on its own thread, and collect
/// the results in rank order.
pub fn run_on<T, F>(world: &LocalWorld, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(LocalComm) -> T + Sync,
{
    let f = &f;
    thread::scope(|s| {
        let handles: Vec<_> = world
            .comms()
            .into_iter()
            .map(|comm| s.spawn(move || f(comm)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank panicked"))
            .collect()
    })
}

pub fn run_ranks<T, F>(size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(LocalComm) -> T + Sync,
{
    run_on(&world(size), f)
}

/// Two unit quads side by side, one per rank:
///
/// ```text
/// 4---5---6
/// | 1 | 2 |
/// 1---2---3
/// ```
///
/// Rank 0 declares element 1 in `parts[0]`, rank 1 declares element 2 in
/// `parts[1]`. Returns the local element.
pub fn declare_two_quads(mesh: &mut BulkData<LocalComm>, parts: &[PartOrdinal]) -> Entity {
    match mesh.parallel_rank() {
        0 => mesh
            .declare_element(1, Topology::Quadrilateral2D, &[1, 2, 5, 4], &[parts[0]])
            .unwrap(),
        _ => mesh
            .declare_element(2, Topology::Quadrilateral2D, &[2, 3, 6, 5], &[parts[1]])
            .unwrap(),
    }
}

pub fn sorted<T: Ord + Copy>(v: &[T]) -> Vec<T> {
    let mut out = v.to_vec();
    out.sort_unstable();
    out
}
