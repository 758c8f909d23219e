mod util;

use mesh_bulk::prelude::*;
use util::*;

#[test]
fn state_machine_guards_every_mutator() {
    let mut uncommitted = MetaData::new();
    uncommitted.declare_part("p", None).unwrap();
    assert!(matches!(
        BulkData::new(std::sync::Arc::new(uncommitted), NoComm, MeshConfig::default()),
        Err(MeshError::MetaDataNotCommitted)
    ));

    let (meta, _) = meta_with(&[]);
    let mut mesh = serial_mesh(&meta);
    assert!(mesh.in_synchronized_state());
    assert!(!mesh.end_modification().unwrap());
    assert!(matches!(
        mesh.declare_entity(EntityRank::NODE, 1, &[]),
        Err(MeshError::NotModifiable { op: "declare_entity" })
    ));

    mesh.begin_modification().unwrap();
    assert_eq!(mesh.modification_state(), ModificationState::Modifiable);
    assert!(matches!(mesh.begin_modification(), Err(MeshError::AlreadyModifiable)));
    let n = mesh.declare_entity(EntityRank::NODE, 1, &[]).unwrap();
    assert!(mesh.end_modification().unwrap());
    assert_eq!(mesh.synchronized_count(), 1);

    assert!(matches!(
        mesh.destroy_entity(n),
        Err(MeshError::NotModifiable { .. })
    ));
    assert!(matches!(
        mesh.generate_new_ids(EntityRank::NODE, 1),
        Err(MeshError::NotModifiable { .. })
    ));
}

#[test]
fn entity_states_track_the_cycle() {
    let (meta, _) = meta_with(&[]);
    let mut mesh = serial_mesh(&meta);
    mesh.begin_modification().unwrap();
    let q = mesh
        .declare_element(1, Topology::Quadrilateral2D, &[1, 2, 3, 4], &[])
        .unwrap();
    let extra = mesh.declare_entity(EntityRank::NODE, 9, &[]).unwrap();
    assert_eq!(mesh.state(q).unwrap(), EntityState::Created);
    mesh.end_modification().unwrap();
    assert_eq!(mesh.state(q).unwrap(), EntityState::Unchanged);
    assert_eq!(mesh.state(extra).unwrap(), EntityState::Unchanged);

    mesh.begin_modification().unwrap();
    let n1 = mesh.entity(key(EntityRank::NODE, 1)).unwrap();
    mesh.destroy_relation(q, n1, 0).unwrap();
    mesh.declare_relation(q, extra, 0, 0).unwrap();
    assert_eq!(mesh.state(q).unwrap(), EntityState::Modified);
    assert_eq!(mesh.state(extra).unwrap(), EntityState::Modified);
    let n3 = mesh.entity(key(EntityRank::NODE, 3)).unwrap();
    assert_eq!(mesh.state(n3).unwrap(), EntityState::Unchanged);
    mesh.end_modification().unwrap();
    assert_eq!(mesh.state(q).unwrap(), EntityState::Unchanged);
    assert_eq!(mesh.synchronized_count(), 2);
}

#[test]
fn destroyed_slots_are_recycled_with_a_new_generation() {
    let (meta, _) = meta_with(&[]);
    let mut mesh = serial_mesh(&meta);
    mesh.begin_modification().unwrap();
    let a = mesh.declare_entity(EntityRank::NODE, 1, &[]).unwrap();
    mesh.end_modification().unwrap();

    mesh.begin_modification().unwrap();
    assert!(mesh.destroy_entity(a).unwrap());
    mesh.end_modification().unwrap();

    mesh.begin_modification().unwrap();
    let b = mesh.declare_entity(EntityRank::NODE, 2, &[]).unwrap();
    mesh.end_modification().unwrap();

    assert_eq!(a.index(), b.index());
    assert_ne!(a, b);
    assert!(!mesh.is_valid(a));
    assert_eq!(mesh.entity_count(), 1);
}

#[test]
fn synchronized_end_is_free_in_parallel() {
    let (meta, p) = meta_with(&[
        ("block_1", Some(EntityRank::ELEMENT)),
        ("block_2", Some(EntityRank::ELEMENT)),
    ]);
    let world = world(2);
    let mut meshes = run_on(&world, |comm| {
        let mut mesh = BulkData::new(meta.clone(), comm, checked_config()).unwrap();
        mesh.begin_modification().unwrap();
        declare_two_quads(&mut mesh, &p);
        mesh.end_modification().unwrap();
        mesh
    });

    let sent = world.messages_sent();
    assert!(sent > 0);
    for mesh in &mut meshes {
        assert!(!mesh.end_modification().unwrap());
        assert_eq!(mesh.synchronized_count(), 1);
    }
    assert_eq!(world.messages_sent(), sent);
}

#[test]
fn empty_cycles_leave_the_parallel_mesh_unchanged() {
    let (meta, p) = meta_with(&[
        ("block_1", Some(EntityRank::ELEMENT)),
        ("block_2", Some(EntityRank::ELEMENT)),
    ]);
    let snapshots = run_ranks(2, |comm| {
        let mut mesh = BulkData::new(meta.clone(), comm, checked_config()).unwrap();
        mesh.begin_modification().unwrap();
        declare_two_quads(&mut mesh, &p);
        mesh.end_modification().unwrap();
        let snapshot = |mesh: &BulkData<LocalComm>| -> Vec<(EntityKey, usize, Vec<PartOrdinal>)> {
            EntityRank::all()
                .flat_map(|r| mesh.entities(r))
                .map(|e| {
                    (
                        mesh.entity_key(e).unwrap(),
                        mesh.owner(e).unwrap(),
                        mesh.parts(e).unwrap().to_vec(),
                    )
                })
                .collect()
        };
        let first = snapshot(&mesh);
        for _ in 0..2 {
            mesh.begin_modification().unwrap();
            assert!(mesh.end_modification().unwrap());
        }
        assert_eq!(snapshot(&mesh), first);
        assert_eq!(mesh.synchronized_count(), 3);
        first.len()
    });
    // 4 owned-or-shared nodes + 2 ghost nodes + own element + ghost element
    assert_eq!(snapshots, vec![8, 8]);
}
