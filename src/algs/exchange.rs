//! Two-phase sparse personalized exchange.
//!
//! Stage 1 sends every other process the byte count it is about to receive
//! (a `WireCount`, zero when there is nothing). Stage 2 sends the payloads,
//! but only to processes with a non-zero count, and sizes every receive
//! buffer from stage 1. Every send and receive handle is drained before
//! returning, even if an error was seen on the way.
//!
//! Every process of the communicator must call `exchange` with the same tag
//! at the same point, or the run hangs.

use std::collections::BTreeMap;

use crate::algs::communicator::{CommTag, Communicator, Wait};
use crate::algs::wire::{WireCount, cast_slice, cast_slice_mut};
use crate::mesh_error::MeshError;

/// Outgoing or incoming payloads keyed by process rank.
pub type Buffers = BTreeMap<usize, Vec<u8>>;

/// Exchange the sizes of `outgoing` with every process. Returns the incoming
/// byte count per process (only non-zero entries).
pub fn exchange_sizes<C: Communicator>(
    comm: &C,
    tag: CommTag,
    outgoing: &Buffers,
) -> Result<BTreeMap<usize, usize>, MeshError> {
    let (me, size) = (comm.rank(), comm.size());

    if let Some((nbr, buf)) = outgoing.iter().find(|(_, b)| b.len() > u32::MAX as usize) {
        return Err(MeshError::Wire(format!(
            "payload of {} bytes to rank {nbr} exceeds the size header",
            buf.len()
        )));
    }

    // 1) post all sends; counts are copied out by the communicator
    let mut pending_sends = Vec::with_capacity(size);
    for nbr in (0..size).filter(|&p| p != me) {
        let count = WireCount::new(outgoing.get(&nbr).map_or(0, Vec::len));
        pending_sends.push(comm.isend(nbr, tag.as_u16(), cast_slice(std::slice::from_ref(&count))));
    }

    // 2) post all receives
    let mut recv_size = Vec::with_capacity(size);
    for nbr in (0..size).filter(|&p| p != me) {
        let mut cnt = WireCount::new(0);
        let h = comm.irecv(nbr, tag.as_u16(), cast_slice_mut(std::slice::from_mut(&mut cnt)));
        recv_size.push((nbr, h));
    }

    // 3) wait for all receives, collect counts (but do not early-return)
    let mut sizes_in = BTreeMap::new();
    let mut maybe_err = None;
    for (nbr, h) in recv_size {
        match h.wait() {
            Some(data) if data.len() == std::mem::size_of::<WireCount>() => {
                let mut cnt = WireCount::new(0);
                cast_slice_mut(std::slice::from_mut(&mut cnt)).copy_from_slice(&data);
                if cnt.get() > 0 {
                    sizes_in.insert(nbr, cnt.get());
                }
            }
            Some(data) if maybe_err.is_none() => {
                maybe_err = Some(MeshError::BufferSizeMismatch {
                    neighbor: nbr,
                    expected: std::mem::size_of::<WireCount>(),
                    got: data.len(),
                });
            }
            None if maybe_err.is_none() => {
                maybe_err = Some(MeshError::CommError {
                    neighbor: nbr,
                    source: format!("failed to receive size from rank {nbr}").into(),
                });
            }
            _ => {}
        }
    }

    // 4) always drain all send handles before returning
    for send in pending_sends {
        let _ = send.wait();
    }

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(sizes_in),
    }
}

/// Sparse exchange of byte payloads. A payload addressed to this process is
/// handed back without touching the communicator; empty payloads are not
/// sent at all.
pub fn exchange<C: Communicator>(
    comm: &C,
    tag: CommTag,
    mut outgoing: Buffers,
) -> Result<Buffers, MeshError> {
    let me = comm.rank();
    let mut incoming = Buffers::new();
    if let Some(own) = outgoing.remove(&me) {
        if !own.is_empty() {
            incoming.insert(me, own);
        }
    }
    if comm.size() == 1 {
        return Ok(incoming);
    }

    let sizes_in = exchange_sizes(comm, tag, &outgoing)?;
    let data_tag = tag.offset(1);

    let mut pending_sends = Vec::with_capacity(outgoing.len());
    for (&nbr, buf) in outgoing.iter().filter(|(_, b)| !b.is_empty()) {
        pending_sends.push(comm.isend(nbr, data_tag.as_u16(), buf));
    }
    log::trace!(
        "rank {me}: tag {} sends {} payloads, expects {}",
        tag.as_u16(),
        pending_sends.len(),
        sizes_in.len()
    );

    let mut recvs = Vec::with_capacity(sizes_in.len());
    for (&nbr, &n) in &sizes_in {
        let mut buf = vec![0u8; n];
        let h = comm.irecv(nbr, data_tag.as_u16(), &mut buf);
        recvs.push((nbr, n, h));
    }

    let mut maybe_err = None;
    for (nbr, expected, h) in recvs {
        match h.wait() {
            Some(data) if data.len() == expected => {
                incoming.insert(nbr, data);
            }
            Some(data) if maybe_err.is_none() => {
                maybe_err = Some(MeshError::BufferSizeMismatch {
                    neighbor: nbr,
                    expected,
                    got: data.len(),
                });
            }
            None if maybe_err.is_none() => {
                maybe_err = Some(MeshError::CommError {
                    neighbor: nbr,
                    source: format!("failed to receive payload from rank {nbr}").into(),
                });
            }
            _ => {}
        }
    }

    for send in pending_sends {
        let _ = send.wait();
    }

    match maybe_err {
        Some(err) => Err(err),
        None => Ok(incoming),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{LocalWorld, NoComm};

    #[test]
    fn self_payload_skips_the_network() {
        let mut out = Buffers::new();
        out.insert(0, vec![1, 2]);
        let got = exchange(&NoComm, CommTag::new(10), out).unwrap();
        assert_eq!(got.get(&0), Some(&vec![1, 2]));
    }

    #[test]
    fn only_nonempty_payloads_travel() {
        let world = LocalWorld::new(3);
        let results: Vec<Buffers> = std::thread::scope(|s| {
            let handles: Vec<_> = world
                .comms()
                .into_iter()
                .map(|c| {
                    s.spawn(move || {
                        let mut out = Buffers::new();
                        // everyone talks to rank 0 only
                        if c.rank() != 0 {
                            out.insert(0, vec![c.rank() as u8; c.rank()]);
                        }
                        exchange(&c, CommTag::new(20), out).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(results[0].get(&1), Some(&vec![1]));
        assert_eq!(results[0].get(&2), Some(&vec![2, 2]));
        assert!(results[1].is_empty());
        assert!(results[2].is_empty());
        // 6 size headers + 2 payloads
        assert_eq!(world.messages_sent(), 8);
    }
}
