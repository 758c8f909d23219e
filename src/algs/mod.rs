//! Communication algorithms used by the parallel protocols.

pub mod collectives;
pub mod communicator;
pub mod exchange;
pub mod id_gen;
pub mod wire;

pub use communicator::{CommTag, Communicator, LocalComm, LocalWorld, NoComm, Wait};
#[cfg(feature = "mpi-support")]
pub use communicator::MpiComm;
