//! Thin façade over in-process (threads) or inter-process (MPI) message passing.
//!
//! Messages are contiguous byte slices. All handles are waitable; the
//! exchange helpers call `.wait()` on every handle before trusting a buffer,
//! and drain every send handle before returning, even on error.
//!
//! Message order between one sender and one receiver on the same tag is FIFO.
//! Nothing else is ordered.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

/// Typed message tag. Each protocol phase owns a base tag; the exchange
/// helpers use `base` for size headers and `base.offset(1)` for payloads.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommTag(u16);

impl CommTag {
    pub const fn new(tag: u16) -> Self {
        CommTag(tag)
    }

    pub const fn as_u16(self) -> u16 {
        self.0
    }

    pub const fn offset(self, by: u16) -> Self {
        CommTag(self.0.wrapping_add(by))
    }
}

/// Non-blocking point-to-point communication.
pub trait Communicator {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    /// This process' rank in the communicator.
    fn rank(&self) -> usize;
    /// Number of processes in the communicator.
    fn size(&self) -> usize;

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> Self::SendHandle;
    /// Post a receive. `buf` gives the expected size; the message itself is
    /// returned by `wait()`.
    fn irecv(&self, peer: usize, tag: u16, buf: &mut [u8]) -> Self::RecvHandle;
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Single-process communicator. Every exchange short-circuits before using it.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Communicator for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn isend(&self, _peer: usize, _tag: u16, _buf: &[u8]) {}

    fn irecv(&self, _peer: usize, _tag: u16, _buf: &mut [u8]) {}
}

// --- LocalWorld: several ranks as threads of one process -------------------

type Key = (usize, usize, u16); // (src, dst, tag)

#[derive(Debug)]
struct Shared {
    size: usize,
    mailbox: DashMap<Key, VecDeque<Bytes>>,
    lock: Mutex<()>,
    arrived: Condvar,
    sent: AtomicUsize,
    timeout: Duration,
}

/// An isolated group of in-process ranks with its own mailbox.
///
/// ```rust
/// use mesh_bulk::algs::communicator::{Communicator, LocalWorld, Wait};
/// let world = LocalWorld::new(2);
/// let (a, b) = (world.comm(0), world.comm(1));
/// a.isend(1, 7, &[1, 2, 3]).wait();
/// assert_eq!(b.irecv(0, 7, &mut [0; 3]).wait(), Some(vec![1, 2, 3]));
/// ```
#[derive(Clone, Debug)]
pub struct LocalWorld {
    shared: Arc<Shared>,
}

impl LocalWorld {
    pub fn new(size: usize) -> Self {
        Self::with_timeout(size, Duration::from_secs(60))
    }

    /// A world whose receives give up after `timeout` (a hung peer then
    /// surfaces as a `CommError` instead of a deadlocked test).
    pub fn with_timeout(size: usize, timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                size: size.max(1),
                mailbox: DashMap::new(),
                lock: Mutex::new(()),
                arrived: Condvar::new(),
                sent: AtomicUsize::new(0),
                timeout,
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Endpoint for `rank`.
    pub fn comm(&self, rank: usize) -> LocalComm {
        LocalComm {
            rank,
            shared: Arc::clone(&self.shared),
        }
    }

    /// One endpoint per rank, in rank order.
    pub fn comms(&self) -> Vec<LocalComm> {
        (0..self.shared.size).map(|r| self.comm(r)).collect()
    }

    /// Total number of messages sent by all ranks so far.
    pub fn messages_sent(&self) -> usize {
        self.shared.sent.load(Ordering::SeqCst)
    }
}

/// One rank's endpoint into a `LocalWorld`.
#[derive(Clone, Debug)]
pub struct LocalComm {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalComm {
    pub fn messages_sent(&self) -> usize {
        self.shared.sent.load(Ordering::SeqCst)
    }
}

pub struct LocalRecv {
    shared: Arc<Shared>,
    key: Key,
}

impl Wait for LocalRecv {
    fn wait(self) -> Option<Vec<u8>> {
        let deadline = Instant::now() + self.shared.timeout;
        let mut guard = self.shared.lock.lock();
        loop {
            if let Some(mut queue) = self.shared.mailbox.get_mut(&self.key) {
                if let Some(bytes) = queue.pop_front() {
                    return Some(bytes.to_vec());
                }
            }
            if self
                .shared
                .arrived
                .wait_until(&mut guard, deadline)
                .timed_out()
            {
                log::warn!(
                    "rank {} timed out waiting for rank {} (tag {})",
                    self.key.1,
                    self.key.0,
                    self.key.2
                );
                return None;
            }
        }
    }
}

impl Communicator for LocalComm {
    type SendHandle = ();
    type RecvHandle = LocalRecv;

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn isend(&self, peer: usize, tag: u16, buf: &[u8]) {
        self.shared
            .mailbox
            .entry((self.rank, peer, tag))
            .or_default()
            .push_back(Bytes::copy_from_slice(buf));
        self.shared.sent.fetch_add(1, Ordering::SeqCst);
        let _guard = self.shared.lock.lock();
        self.shared.arrived.notify_all();
    }

    fn irecv(&self, peer: usize, tag: u16, _buf: &mut [u8]) -> LocalRecv {
        LocalRecv {
            shared: Arc::clone(&self.shared),
            key: (peer, self.rank, tag),
        }
    }
}

// --- MPI backend (feature = "mpi-support") ----------------------------------
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::{Communicator, Wait};
    use crate::mesh_error::MeshError;
    use mpi::environment::Universe;
    use mpi::request::StaticScope;
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;

    /// MPI world communicator. Owns the MPI environment; dropping it
    /// finalizes MPI.
    pub struct MpiComm {
        _universe: Universe,
        world: SimpleCommunicator,
        rank: usize,
        size: usize,
    }

    impl MpiComm {
        pub fn new() -> Result<Self, MeshError> {
            let universe = mpi::initialize().ok_or_else(|| MeshError::CommError {
                neighbor: 0,
                source: "MPI was already initialized".into(),
            })?;
            let world = universe.world();
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Ok(Self {
                _universe: universe,
                world,
                rank,
                size,
            })
        }
    }

    /// In-flight send; the payload is released once the request completes.
    pub struct MpiSend {
        complete: Option<Box<dyn FnOnce()>>,
        payload: *mut [u8],
    }

    impl Wait for MpiSend {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(complete) = self.complete.take() {
                complete();
            }
            // SAFETY: `payload` came from `Box::into_raw` in `isend` and the
            // request borrowing it has completed above.
            unsafe { drop(Box::from_raw(self.payload)) };
            None
        }
    }

    /// Receives complete eagerly inside `irecv`; the exchange helpers post
    /// all sends before their receives.
    pub struct MpiRecv(Option<Vec<u8>>);

    impl Wait for MpiRecv {
        fn wait(self) -> Option<Vec<u8>> {
            self.0
        }
    }

    impl Communicator for MpiComm {
        type SendHandle = MpiSend;
        type RecvHandle = MpiRecv;

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn isend(&self, peer: usize, tag: u16, buf: &[u8]) -> MpiSend {
            let payload: *mut [u8] = Box::into_raw(buf.to_vec().into_boxed_slice());
            // SAFETY: the allocation stays alive until `MpiSend::wait` frees it,
            // after the request has completed.
            let data: &'static [u8] = unsafe { &*payload };
            let req = self
                .world
                .process_at_rank(peer as i32)
                .immediate_send_with_tag(StaticScope, data, tag as i32);
            MpiSend {
                complete: Some(Box::new(move || {
                    req.wait();
                })),
                payload,
            }
        }

        fn irecv(&self, peer: usize, tag: u16, _buf: &mut [u8]) -> MpiRecv {
            let (data, _status) = self
                .world
                .process_at_rank(peer as i32)
                .receive_vec_with_tag::<u8>(tag as i32);
            MpiRecv(Some(data))
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_roundtrip_two_ranks() {
        let world = LocalWorld::new(2);
        let comm0 = world.comm(0);
        let comm1 = world.comm(1);

        let mut recv_buf = [0u8; 4];
        let recv = comm1.irecv(0, 7, &mut recv_buf);
        comm0.isend(1, 7, &[1, 2, 3, 4]).wait();

        let data = recv.wait().expect("message from rank 0");
        recv_buf.copy_from_slice(&data);
        assert_eq!(&recv_buf, &[1, 2, 3, 4]);
        assert_eq!(world.messages_sent(), 1);
    }

    #[test]
    fn same_tag_is_fifo() {
        let world = LocalWorld::new(2);
        let (a, b) = (world.comm(0), world.comm(1));
        a.isend(1, 3, &[1]);
        a.isend(1, 3, &[2]);
        assert_eq!(b.irecv(0, 3, &mut [0]).wait(), Some(vec![1]));
        assert_eq!(b.irecv(0, 3, &mut [0]).wait(), Some(vec![2]));
    }

    #[test]
    fn worlds_are_isolated() {
        let w1 = LocalWorld::with_timeout(2, Duration::from_millis(50));
        let w2 = LocalWorld::new(2);
        w2.comm(0).isend(1, 1, &[9]);
        assert_eq!(w1.comm(1).irecv(0, 1, &mut [0]).wait(), None);
        assert_eq!(w2.comm(1).irecv(0, 1, &mut [0]).wait(), Some(vec![9]));
    }

    #[test]
    fn receive_across_threads() {
        let world = LocalWorld::new(2);
        let comms = world.comms();
        std::thread::scope(|s| {
            let c1 = comms[1].clone();
            let h = s.spawn(move || c1.irecv(0, 5, &mut [0; 2]).wait());
            std::thread::sleep(Duration::from_millis(10));
            comms[0].isend(1, 5, &[4, 2]);
            assert_eq!(h.join().unwrap(), Some(vec![4, 2]));
        });
    }

    #[test]
    fn no_comm_is_single_rank() {
        let c = NoComm;
        assert_eq!((c.rank(), c.size()), (0, 1));
        assert_eq!(c.irecv(0, 0, &mut []).wait(), None);
    }
}
