mod util;

use std::collections::HashMap;
use std::sync::Arc;

use mesh_bulk::prelude::*;
use parking_lot::Mutex;
use util::*;

/// One `u64` per entity, stored bucket by bucket the way a field layer would.
#[derive(Clone, Default)]
struct Scalars(Arc<Mutex<HashMap<(EntityRank, usize), Vec<u64>>>>);

impl Scalars {
    fn get(&self, mesh: &BulkData<impl Communicator>, e: Entity) -> u64 {
        let loc = mesh.location(e).unwrap();
        self.0.lock()[&(mesh.entity_rank(e).unwrap(), loc.bucket)][loc.ordinal]
    }

    fn set(&self, mesh: &BulkData<impl Communicator>, e: Entity, value: u64) {
        let loc = mesh.location(e).unwrap();
        self.0
            .lock()
            .get_mut(&(mesh.entity_rank(e).unwrap(), loc.bucket))
            .unwrap()[loc.ordinal] = value;
    }

    fn in_step_with(&self, mesh: &BulkData<impl Communicator>) -> bool {
        let data = self.0.lock();
        let mut buckets = 0;
        for rank in EntityRank::all() {
            for b in mesh.buckets(rank) {
                buckets += 1;
                if data.get(&(rank, b.id())).map(Vec::len) != Some(b.len()) {
                    return false;
                }
            }
        }
        buckets == data.len()
    }
}

impl FieldDataObserver for Scalars {
    fn bucket_created(&mut self, rank: EntityRank, bucket: usize, _: &[PartOrdinal], cap: usize) {
        self.0.lock().insert((rank, bucket), Vec::with_capacity(cap));
    }

    fn bucket_destroyed(&mut self, rank: EntityRank, bucket: usize) {
        self.0.lock().remove(&(rank, bucket));
    }

    fn entity_added(&mut self, rank: EntityRank, bucket: usize, ordinal: usize) {
        let mut data = self.0.lock();
        let values = data.entry((rank, bucket)).or_default();
        values.push(0);
        assert_eq!(values.len(), ordinal + 1);
    }

    fn entity_removed(&mut self, rank: EntityRank, bucket: usize, ordinal: usize) {
        self.0.lock().get_mut(&(rank, bucket)).unwrap().swap_remove(ordinal);
    }

    fn pack_fields(&self, rank: EntityRank, bucket: usize, ordinal: usize) -> Vec<u8> {
        self.0.lock()[&(rank, bucket)][ordinal].to_le_bytes().to_vec()
    }

    fn unpack_fields(&mut self, rank: EntityRank, bucket: usize, ordinal: usize, bytes: &[u8]) {
        let value = u64::from_le_bytes(bytes.try_into().unwrap());
        self.0.lock().get_mut(&(rank, bucket)).unwrap()[ordinal] = value;
    }
}

#[test]
fn observers_track_swap_removal() {
    let (meta, p) = meta_with(&[("block", Some(EntityRank::ELEMENT))]);
    let scalars = Scalars::default();
    let config = MeshConfig {
        bucket_capacity: 2,
        ..MeshConfig::default()
    };
    let mut mesh =
        BulkData::with_observers(meta, NoComm, config, vec![Box::new(scalars.clone())]).unwrap();

    mesh.begin_modification().unwrap();
    let nodes: Vec<Entity> = (1..=5)
        .map(|id| mesh.declare_entity(EntityRank::NODE, id, &[]).unwrap())
        .collect();
    mesh.end_modification().unwrap();
    for (i, &n) in nodes.iter().enumerate() {
        scalars.set(&mesh, n, 100 + i as u64);
    }

    mesh.begin_modification().unwrap();
    mesh.destroy_entity(nodes[0]).unwrap();
    mesh.destroy_entity(nodes[3]).unwrap();
    mesh.end_modification().unwrap();

    assert!(scalars.in_step_with(&mesh));
    for i in [1, 2, 4] {
        assert_eq!(scalars.get(&mesh, nodes[i]), 100 + i as u64);
    }

    // moving to another bucket starts over, like any freshly placed entity
    mesh.begin_modification().unwrap();
    let q = mesh
        .declare_element(1, Topology::Triangle2D, &[2, 3, 5], &[p[0]])
        .unwrap();
    mesh.end_modification().unwrap();
    assert!(scalars.in_step_with(&mesh));
    assert_eq!(scalars.get(&mesh, q), 0);
}

#[test]
fn ghosts_arrive_with_their_field_payload() {
    let (meta, _) = meta_with(&[]);
    run_ranks(2, |comm| {
        let me = comm.rank();
        let scalars = Scalars::default();
        let mut mesh = BulkData::with_observers(
            meta.clone(),
            comm,
            checked_config(),
            vec![Box::new(scalars.clone())],
        )
        .unwrap();
        mesh.begin_modification().unwrap();
        let g = mesh.create_ghosting("fields").unwrap();
        let tri = (me == 0).then(|| {
            mesh.declare_element(7, Topology::Triangle2D, &[70, 71, 72], &[])
                .unwrap()
        });
        mesh.end_modification().unwrap();

        mesh.begin_modification().unwrap();
        if let Some(tri) = tri {
            scalars.set(&mesh, tri, 42);
            mesh.change_ghosting(g, &[(tri, 1)], &[]).unwrap();
        }
        mesh.end_modification().unwrap();
        assert!(scalars.in_step_with(&mesh));

        let tri = mesh.entity(key(EntityRank::ELEMENT, 7)).unwrap();
        assert_eq!(scalars.get(&mesh, tri), 42);
        let n = mesh.entity(key(EntityRank::NODE, 71)).unwrap();
        assert_eq!(scalars.get(&mesh, n), 0);
        assert_eq!(mesh.is_ghost(tri).unwrap(), me == 1);
    });
}
