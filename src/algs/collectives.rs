//! All-reduce over point-to-point messages: every rank sends its vector to
//! rank 0, which reduces element-wise and sends the result back.

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{WireReader, WireWriter, kind};
use crate::mesh_error::MeshError;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Max,
    Sum,
}

impl ReduceOp {
    fn apply(self, acc: &mut [u64], other: &[u64]) {
        for (a, &b) in acc.iter_mut().zip(other) {
            *a = match self {
                ReduceOp::Max => (*a).max(b),
                ReduceOp::Sum => a.saturating_add(b),
            };
        }
    }
}

fn encode(values: &[u64]) -> Vec<u8> {
    let mut w = WireWriter::with_header(kind::REDUCE, values.len());
    for &v in values {
        w.u64(v);
    }
    w.finish()
}

fn decode(neighbor: usize, data: Option<Vec<u8>>, expected: usize) -> Result<Vec<u64>, MeshError> {
    let data = data.ok_or_else(|| MeshError::CommError {
        neighbor,
        source: format!("no reduction payload from rank {neighbor}").into(),
    })?;
    let mut r = WireReader::new(&data);
    let n = r.header(kind::REDUCE)?;
    if n != expected {
        return Err(MeshError::BufferSizeMismatch {
            neighbor,
            expected,
            got: n,
        });
    }
    (0..n).map(|_| r.u64()).collect()
}

/// Element-wise all-reduce of `values` (same length on every rank).
pub fn all_reduce<C: Communicator>(
    comm: &C,
    tag: CommTag,
    values: &[u64],
    op: ReduceOp,
) -> Result<Vec<u64>, MeshError> {
    let (me, size) = (comm.rank(), comm.size());
    if size == 1 {
        return Ok(values.to_vec());
    }
    let len = 8 + 8 * values.len();
    if me == 0 {
        let mut acc = values.to_vec();
        let mut maybe_err = None;
        for p in 1..size {
            let mut buf = vec![0u8; len];
            let got = comm.irecv(p, tag.as_u16(), &mut buf).wait();
            match decode(p, got, values.len()) {
                Ok(v) => op.apply(&mut acc, &v),
                Err(e) => {
                    maybe_err.get_or_insert(e);
                }
            }
        }
        let payload = encode(&acc);
        let sends: Vec<_> = (1..size)
            .map(|p| comm.isend(p, tag.offset(1).as_u16(), &payload))
            .collect();
        for s in sends {
            let _ = s.wait();
        }
        match maybe_err {
            Some(e) => Err(e),
            None => Ok(acc),
        }
    } else {
        let send = comm.isend(0, tag.as_u16(), &encode(values));
        let mut buf = vec![0u8; len];
        let got = comm.irecv(0, tag.offset(1).as_u16(), &mut buf).wait();
        let _ = send.wait();
        decode(0, got, values.len())
    }
}

pub fn all_reduce_max<C: Communicator>(comm: &C, tag: CommTag, v: u64) -> Result<u64, MeshError> {
    Ok(all_reduce(comm, tag, &[v], ReduceOp::Max)?[0])
}

/// Logical or across ranks.
pub fn all_reduce_or<C: Communicator>(comm: &C, tag: CommTag, flag: bool) -> Result<bool, MeshError> {
    Ok(all_reduce_max(comm, tag, flag as u64)? != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::LocalWorld;

    #[test]
    fn max_and_sum_agree_everywhere() {
        let world = LocalWorld::new(4);
        let out: Vec<(Vec<u64>, bool)> = std::thread::scope(|s| {
            let hs: Vec<_> = world
                .comms()
                .into_iter()
                .map(|c| {
                    s.spawn(move || {
                        let r = c.rank() as u64;
                        let v = all_reduce(&c, CommTag::new(40), &[r, 10 - r], ReduceOp::Max).unwrap();
                        let any = all_reduce_or(&c, CommTag::new(42), r == 2).unwrap();
                        (v, any)
                    })
                })
                .collect();
            hs.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for (v, any) in out {
            assert_eq!(v, vec![3, 10]);
            assert!(any);
        }
    }

    #[test]
    fn single_rank_is_identity() {
        let c = crate::algs::communicator::NoComm;
        assert_eq!(all_reduce(&c, CommTag::new(1), &[7], ReduceOp::Sum).unwrap(), vec![7]);
    }
}
