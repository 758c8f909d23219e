//! Collective unique-id generation.
//!
//! Every process reports, per entity rank, the largest id it has in use
//! (including ids pending deletion this cycle) and how many new ids it needs.
//! After an all-reduce of both, process `p` takes the block starting at
//! `max_in_use + 1 + p * max_request`. Blocks are disjoint by construction and
//! depend only on the reduced values, so every process computes the same
//! layout without further messages.

use std::ops::Range;

use crate::algs::collectives::{ReduceOp, all_reduce};
use crate::algs::communicator::{CommTag, Communicator};
use crate::mesh_error::MeshError;
use crate::topology::entity_key::{EntityKey, EntityRank};

/// Ids for process `proc` given the reduced maxima.
pub fn id_block(
    rank: EntityRank,
    global_max: u64,
    max_request: u64,
    proc: usize,
    nprocs: usize,
    count: u64,
) -> Result<Range<u64>, MeshError> {
    // the whole layout must fit, so every process fails together
    let span = max_request
        .checked_mul(nprocs as u64)
        .and_then(|s| s.checked_add(global_max))
        .ok_or(MeshError::IdSpaceExhausted { rank })?;
    if span > EntityKey::MAX_ID {
        return Err(MeshError::IdSpaceExhausted { rank });
    }
    let start = global_max + 1 + proc as u64 * max_request;
    Ok(start..start + count)
}

/// Generate `requests[r]` fresh ids for every rank `r`. Collective.
///
/// `max_in_use[r]` is the largest id of rank `r` known locally.
pub fn generate_ids<C: Communicator>(
    comm: &C,
    tag: CommTag,
    max_in_use: &[u64; EntityRank::COUNT],
    requests: &[u64; EntityRank::COUNT],
) -> Result<Vec<Range<u64>>, MeshError> {
    let mut local = Vec::with_capacity(2 * EntityRank::COUNT);
    local.extend_from_slice(max_in_use);
    local.extend_from_slice(requests);
    let global = all_reduce(comm, tag, &local, ReduceOp::Max)?;
    let (maxes, counts) = global.split_at(EntityRank::COUNT);

    EntityRank::all()
        .map(|rank| {
            let i = rank.index();
            if counts[i] == 0 {
                return Ok(0..0);
            }
            id_block(rank, maxes[i], counts[i], comm.rank(), comm.size(), requests[i])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::LocalWorld;
    use proptest::prelude::*;

    #[test]
    fn blocks_follow_rank_order() {
        let b0 = id_block(EntityRank::NODE, 10, 3, 0, 2, 3).unwrap();
        let b1 = id_block(EntityRank::NODE, 10, 3, 1, 2, 1).unwrap();
        assert_eq!(b0, 11..14);
        assert_eq!(b1, 14..15);
    }

    #[test]
    fn exhaustion_is_reported() {
        let err = id_block(EntityRank::ELEMENT, EntityKey::MAX_ID - 1, 2, 0, 1, 2).unwrap_err();
        assert!(matches!(err, MeshError::IdSpaceExhausted { rank } if rank == EntityRank::ELEMENT));
    }

    #[test]
    fn collective_generation_is_disjoint() {
        let world = LocalWorld::new(3);
        let blocks: Vec<Vec<Range<u64>>> = std::thread::scope(|s| {
            let hs: Vec<_> = world
                .comms()
                .into_iter()
                .map(|c| {
                    s.spawn(move || {
                        let mut max = [0u64; EntityRank::COUNT];
                        max[0] = 5 * (c.rank() as u64 + 1);
                        let mut req = [0u64; EntityRank::COUNT];
                        req[0] = c.rank() as u64 + 1;
                        generate_ids(&c, CommTag::new(60), &max, &req).unwrap()
                    })
                })
                .collect();
            hs.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(blocks[0][0], 16..17);
        assert_eq!(blocks[1][0], 19..21);
        assert_eq!(blocks[2][0], 22..25);
        assert!(blocks.iter().all(|b| b[1].is_empty()));
    }

    proptest! {
        #[test]
        fn blocks_never_overlap(
            max in 0u64..1_000_000,
            counts in proptest::collection::vec(0u64..50, 1..8),
        ) {
            let k = *counts.iter().max().unwrap();
            let n = counts.len();
            let mut seen: Vec<u64> = Vec::new();
            for (p, &c) in counts.iter().enumerate() {
                let b = id_block(EntityRank::NODE, max, k, p, n, c).unwrap();
                prop_assert!(b.start > max);
                seen.extend(b);
            }
            let total = seen.len();
            seen.sort_unstable();
            seen.dedup();
            prop_assert_eq!(seen.len(), total);
        }
    }
}
