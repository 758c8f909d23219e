mod util;

use mesh_bulk::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use util::*;

#[test]
fn two_quads_share_their_interface_nodes() {
    let (meta, p) = meta_with(&[
        ("block_1", Some(EntityRank::ELEMENT)),
        ("block_2", Some(EntityRank::ELEMENT)),
    ]);
    let (b1, b2) = (p[0], p[1]);
    let results = run_ranks(2, |comm| {
        let me = comm.rank();
        let mut mesh = BulkData::new(meta.clone(), comm, checked_config()).unwrap();
        mesh.begin_modification().unwrap();
        declare_two_quads(&mut mesh, &p);
        assert!(mesh.end_modification().unwrap());

        for id in [2, 5] {
            let n = mesh.entity(key(EntityRank::NODE, id)).unwrap();
            assert!(mesh.is_shared(n).unwrap());
            assert_eq!(mesh.sharing_procs(n).unwrap(), vec![1 - me]);
            assert_eq!(mesh.parallel_owner_rank(n).unwrap(), 0);
            assert_eq!(mesh.is_locally_owned(n).unwrap(), me == 0);
            assert!(mesh.has_part(n, MetaData::GLOBALLY_SHARED).unwrap());
            // both blocks reach the interface, whichever rank declared them
            assert!(mesh.has_part(n, b1).unwrap());
            assert!(mesh.has_part(n, b2).unwrap());
        }
        let interior = if me == 0 { 1 } else { 3 };
        let n = mesh.entity(key(EntityRank::NODE, interior)).unwrap();
        assert!(!mesh.is_shared(n).unwrap());
        assert!(mesh.is_locally_owned(n).unwrap());

        let owned_nodes = mesh.count_entities(EntityRank::NODE, &Selector::locally_owned());
        let shared_nodes = mesh.count_entities(EntityRank::NODE, &Selector::globally_shared());
        (owned_nodes, shared_nodes, mesh.synchronized_count())
    });
    assert_eq!(results[0], (4, 2, 1));
    assert_eq!(results[1], (2, 2, 1));
}

#[test]
fn owner_is_the_lowest_declaring_rank() {
    const NODES: u64 = 24;
    const RANKS: usize = 4;
    // same seed everywhere: every rank knows who declares what
    let mut rng = StdRng::seed_from_u64(7);
    let mut holders: Vec<Vec<usize>> = (1..=NODES)
        .map(|_| (0..RANKS).filter(|_| rng.gen_bool(0.5)).collect())
        .collect();
    // ranks 0, 2 and 3 declare node 1
    holders[0] = vec![0, 2, 3];

    let holders = &holders;
    run_ranks(RANKS, |comm| {
        let me = comm.rank();
        let mut mine: Vec<u64> = (1..=NODES)
            .filter(|&id| holders[(id - 1) as usize].contains(&me))
            .collect();
        mine.shuffle(&mut StdRng::seed_from_u64(100 + me as u64));

        let mut mesh = BulkData::new(meta_with(&[]).0, comm, checked_config()).unwrap();
        mesh.begin_modification().unwrap();
        for &id in &mine {
            mesh.declare_entity(EntityRank::NODE, id, &[]).unwrap();
        }
        mesh.end_modification().unwrap();

        for &id in &mine {
            let held = &holders[(id - 1) as usize];
            let n = mesh.entity(key(EntityRank::NODE, id)).unwrap();
            assert_eq!(mesh.owner(n).unwrap(), held[0], "node {id}");
            let others: Vec<usize> = held.iter().copied().filter(|&p| p != me).collect();
            assert_eq!(mesh.sharing_procs(n).unwrap(), others, "node {id}");
        }
        if me == 1 {
            assert!(mesh.entity(key(EntityRank::NODE, 1)).is_none());
        }
    });
}

#[test]
fn matched_sides_adopt_the_smallest_key() {
    let (meta, p) = meta_with(&[
        ("block_1", Some(EntityRank::ELEMENT)),
        ("block_2", Some(EntityRank::ELEMENT)),
    ]);
    let results = run_ranks(2, |comm| {
        let me = comm.rank();
        let mut mesh = BulkData::new(meta.clone(), comm, checked_config()).unwrap();
        mesh.begin_modification().unwrap();
        let quad = declare_two_quads(&mut mesh, &p);
        // the same edge 2-5, under different ids
        let side = if me == 0 {
            mesh.declare_element_side(quad, 1, 20, &[]).unwrap()
        } else {
            mesh.declare_element_side(quad, 3, 10, &[]).unwrap()
        };
        mesh.end_modification().unwrap();

        assert_eq!(mesh.entity_key(side).unwrap(), key(EntityRank::EDGE, 10));
        assert!(mesh.entity(key(EntityRank::EDGE, 20)).is_none());
        assert_eq!(mesh.sharing_procs(side).unwrap(), vec![1 - me]);
        assert_eq!(mesh.owner(side).unwrap(), 0);
        let nodes: Vec<EntityKey> = mesh
            .downward(side, EntityRank::NODE)
            .unwrap()
            .iter()
            .map(|r| mesh.entity_key(r.entity).unwrap())
            .collect();
        sorted(&nodes)
    });
    let expected = vec![key(EntityRank::NODE, 2), key(EntityRank::NODE, 5)];
    assert_eq!(results, vec![expected.clone(), expected]);
}

#[test]
fn destroying_one_copy_unshares_the_other() {
    let (meta, _) = meta_with(&[]);
    run_ranks(2, |comm| {
        let me = comm.rank();
        let mut mesh = BulkData::new(meta.clone(), comm, checked_config()).unwrap();
        mesh.begin_modification().unwrap();
        let n = mesh.declare_entity(EntityRank::NODE, 9, &[]).unwrap();
        mesh.end_modification().unwrap();
        assert!(mesh.is_shared(n).unwrap());

        mesh.begin_modification().unwrap();
        if me == 0 {
            assert!(mesh.destroy_entity(n).unwrap());
        }
        mesh.end_modification().unwrap();

        if me == 0 {
            assert!(mesh.entity(key(EntityRank::NODE, 9)).is_none());
        } else {
            assert!(!mesh.is_shared(n).unwrap());
            assert_eq!(mesh.owner(n).unwrap(), 1);
            assert!(mesh.has_part(n, MetaData::LOCALLY_OWNED).unwrap());
            assert!(!mesh.has_part(n, MetaData::GLOBALLY_SHARED).unwrap());
        }
    });
}

#[test]
fn part_changes_by_the_owner_reach_every_sharer() {
    let (meta, p) = meta_with(&[
        ("boundary", Some(EntityRank::NODE)),
        ("inlet", Some(EntityRank::NODE)),
    ]);
    let (boundary, inlet) = (p[0], p[1]);
    run_ranks(3, |comm| {
        let me = comm.rank();
        let mut mesh = BulkData::new(meta.clone(), comm, checked_config()).unwrap();
        mesh.begin_modification().unwrap();
        let n = mesh.declare_entity(EntityRank::NODE, 4, &[]).unwrap();
        mesh.end_modification().unwrap();
        assert_eq!(mesh.sharing_procs(n).unwrap().len(), 2);

        mesh.begin_modification().unwrap();
        if me == 0 {
            mesh.change_parts(n, &[boundary], &[]).unwrap();
        }
        mesh.end_modification().unwrap();
        assert!(mesh.has_part(n, boundary).unwrap(), "rank {me}");

        // only the owner may change the parts of a shared entity
        mesh.begin_modification().unwrap();
        if me == 2 {
            assert!(matches!(
                mesh.change_parts(n, &[], &[boundary]),
                Err(MeshError::PartChangeNotOwned { rank: 2, owner: 0, .. })
            ));
            assert!(matches!(
                mesh.declare_entity(EntityRank::NODE, 4, &[inlet]),
                Err(MeshError::PartChangeNotOwned { .. })
            ));
            // re-declaring with parts it already has changes nothing
            assert_eq!(mesh.declare_entity(EntityRank::NODE, 4, &[boundary]).unwrap(), n);
        }
        mesh.end_modification().unwrap();
        assert!(mesh.has_part(n, boundary).unwrap(), "rank {me}");
        assert!(!mesh.has_part(n, inlet).unwrap(), "rank {me}");
    });
}

#[test]
fn owner_part_changes_keep_remotely_induced_parts_below() {
    let (meta, p) = meta_with(&[("block_1", Some(EntityRank::ELEMENT)), ("tag", None)]);
    let (block, tag) = (p[0], p[1]);
    run_ranks(2, |comm| {
        let me = comm.rank();
        let mut mesh = BulkData::new(meta.clone(), comm, checked_config()).unwrap();
        mesh.begin_modification().unwrap();
        // only rank 0 has an element over the interface nodes
        if me == 0 {
            mesh.declare_element(1, Topology::Quadrilateral2D, &[1, 2, 5, 4], &[block])
                .unwrap();
        }
        let edge = mesh.declare_entity(EntityRank::EDGE, 10, &[]).unwrap();
        for (ordinal, id) in [2, 5].into_iter().enumerate() {
            let n = mesh.declare_entity(EntityRank::NODE, id, &[]).unwrap();
            mesh.declare_relation(edge, n, ordinal as u16, 0).unwrap();
        }
        mesh.end_modification().unwrap();
        assert_eq!(mesh.sharing_procs(edge).unwrap(), vec![1 - me]);
        let n2 = mesh.entity(key(EntityRank::NODE, 2)).unwrap();
        assert!(mesh.has_part(n2, block).unwrap(), "rank {me}");

        mesh.begin_modification().unwrap();
        if me == 0 {
            mesh.change_parts(edge, &[tag], &[]).unwrap();
        }
        mesh.end_modification().unwrap();

        assert!(mesh.has_part(edge, tag).unwrap(), "rank {me}");
        for id in [2, 5] {
            let n = mesh.entity(key(EntityRank::NODE, id)).unwrap();
            assert!(mesh.has_part(n, block).unwrap(), "rank {me} node {id}");
            assert!(!mesh.has_part(n, tag).unwrap(), "rank {me} node {id}");
        }
    });
}

#[test]
fn shared_entities_keep_their_key() {
    let (meta, _) = meta_with(&[]);
    run_ranks(2, |comm| {
        let mut mesh = BulkData::new(meta.clone(), comm, checked_config()).unwrap();
        mesh.begin_modification().unwrap();
        let n = mesh.declare_entity(EntityRank::NODE, 3, &[]).unwrap();
        let lone = mesh
            .declare_entity(EntityRank::NODE, 100 + mesh.parallel_rank() as u64, &[])
            .unwrap();
        mesh.end_modification().unwrap();
        assert!(mesh.is_communicated(n).unwrap());

        mesh.begin_modification().unwrap();
        assert!(matches!(
            mesh.change_entity_key(n, key(EntityRank::NODE, 30)),
            Err(MeshError::RekeyShared(_))
        ));
        let new_id = 200 + mesh.parallel_rank() as u64;
        mesh.change_entity_key(lone, key(EntityRank::NODE, new_id)).unwrap();
        mesh.end_modification().unwrap();
        assert_eq!(mesh.entity(key(EntityRank::NODE, new_id)), Some(lone));
        assert_eq!(mesh.entity_key(n).unwrap(), key(EntityRank::NODE, 3));
    });
}

#[test]
fn random_strip_of_quads_stays_consistent() {
    const QUADS: u64 = 12;
    const RANKS: usize = 3;
    let mut rng = StdRng::seed_from_u64(31);
    let placement: Vec<usize> = (0..QUADS).map(|_| rng.gen_range(0..RANKS)).collect();
    let placement = &placement;
    let (meta, _) = meta_with(&[]);

    let totals = run_ranks(RANKS, |comm| {
        let me = comm.rank();
        let mut mesh = BulkData::new(meta.clone(), comm, checked_config()).unwrap();
        mesh.begin_modification().unwrap();
        for q in 0..QUADS {
            if placement[q as usize] != me {
                continue;
            }
            // nodes 1..=QUADS+1 along the bottom, offset by 100 along the top
            let (a, b) = (q + 1, q + 2);
            mesh.declare_element(q + 1, Topology::Quadrilateral2D, &[a, b, b + 100, a + 100], &[])
                .unwrap();
        }
        mesh.end_modification().unwrap();
        mesh.count_entities(EntityRank::NODE, &Selector::locally_owned())
    });
    // every node has exactly one owner
    assert_eq!(totals.iter().sum::<usize>(), 2 * (QUADS as usize + 1));
}
