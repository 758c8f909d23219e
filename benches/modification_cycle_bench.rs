use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use mesh_bulk::prelude::*;

fn meta() -> Arc<MetaData> {
    let mut meta = MetaData::new();
    meta.declare_part("block", Some(EntityRank::ELEMENT))
        .expect("fresh metadata");
    meta.commit();
    Arc::new(meta)
}

/// `n x n` structured quads, node ids row-major from 1.
fn declare_grid<C: Communicator>(mesh: &mut BulkData<C>, n: u64, block: PartOrdinal) {
    let node = |i: u64, j: u64| j * (n + 1) + i + 1;
    for j in 0..n {
        for i in 0..n {
            let nodes = [node(i, j), node(i + 1, j), node(i + 1, j + 1), node(i, j + 1)];
            mesh.declare_element(j * n + i + 1, Topology::Quadrilateral2D, &nodes, &[block])
                .expect("grid element");
        }
    }
}

fn bench_serial_cycle(c: &mut Criterion) {
    let meta = meta();
    let block = meta.part_ordinal("block").expect("declared");
    let mut group = c.benchmark_group("serial_cycle");

    for &n in &[16u64, 64] {
        group.bench_with_input(BenchmarkId::new("declare_grid", n), &n, |b, &n| {
            b.iter(|| {
                let mut mesh = BulkData::new(Arc::clone(&meta), NoComm, MeshConfig::default())
                    .expect("committed metadata");
                mesh.begin_modification().expect("synchronized");
                declare_grid(&mut mesh, n, block);
                mesh.end_modification().expect("serial cycle");
                black_box(mesh.entity_count());
            });
        });

        group.bench_with_input(BenchmarkId::new("empty_cycle", n), &n, |b, &n| {
            let mut mesh = BulkData::new(Arc::clone(&meta), NoComm, MeshConfig::default())
                .expect("committed metadata");
            mesh.begin_modification().expect("synchronized");
            declare_grid(&mut mesh, n, block);
            mesh.end_modification().expect("serial cycle");
            b.iter(|| {
                mesh.begin_modification().expect("synchronized");
                black_box(mesh.end_modification().expect("serial cycle"));
            });
        });
    }
    group.finish();
}

fn bench_two_rank_cycle(c: &mut Criterion) {
    let meta = meta();
    let block = meta.part_ordinal("block").expect("declared");
    let mut group = c.benchmark_group("two_rank_cycle");
    group.sample_size(10);

    for &n in &[8u64, 32] {
        group.bench_with_input(BenchmarkId::new("strip_halves", n), &n, |b, &n| {
            b.iter(|| {
                let world = LocalWorld::new(2);
                std::thread::scope(|s| {
                    for comm in world.comms() {
                        let meta = Arc::clone(&meta);
                        s.spawn(move || {
                            let me = comm.rank() as u64;
                            let mut mesh = BulkData::new(meta, comm, MeshConfig::default())
                                .expect("committed metadata");
                            mesh.begin_modification().expect("synchronized");
                            // each rank takes half the columns; the middle column of nodes is shared
                            let node = |i: u64, j: u64| j * (n + 1) + i + 1;
                            for j in 0..n {
                                for i in (me * n / 2)..((me + 1) * n / 2) {
                                    let nodes =
                                        [node(i, j), node(i + 1, j), node(i + 1, j + 1), node(i, j + 1)];
                                    mesh.declare_element(
                                        j * n + i + 1,
                                        Topology::Quadrilateral2D,
                                        &nodes,
                                        &[block],
                                    )
                                    .expect("grid element");
                                }
                            }
                            mesh.end_modification().expect("parallel cycle");
                            black_box(mesh.comm_list().len());
                        });
                    }
                });
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_serial_cycle, bench_two_rank_cycle);
criterion_main!(benches);
