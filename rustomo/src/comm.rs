//! The communicator provides the SPMD process model to the rest of the
//! core: every rank runs an identical pipeline and touches its peers only
//! through the operations here: tagged pairwise messages, the vector
//! all-to-all used by reslicing, and a barrier.
//!
//! Two implementations are provided. [`solo::SoloCommunicator`] is the
//! single-rank loop-back used for serial runs. [`threaded::ThreadedCommunicator`]
//! wires a set of ranks together over channels so multi-rank behaviour can
//! run on threads inside one process, which is how the collective code paths
//! are tested.

pub mod solo;
pub mod threaded;

use ndarray::{Array3, ArrayView3};
use rustomo_core::{Element, Shape3};
use thiserror::Error;

/// Tag namespace for the collective operations; per-pair FIFO delivery plus
/// the SPMD execution model keep same-tag messages unambiguous.
pub const TAG_RESLICE: u64 = 1;
pub const TAG_HALO_UP: u64 = 2;
pub const TAG_HALO_DOWN: u64 = 3;
pub const TAG_STATS: u64 = 4;

#[derive(Error, Debug)]
pub enum CommError {
    #[error("peer rank {rank} is out of range for a communicator of size {size}")]
    RankOutOfRange { rank: usize, size: usize },
    #[error("peer rank {rank} disconnected during {operation}")]
    Disconnected { rank: usize, operation: &'static str },
    #[error("malformed collective payload: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, CommError>;

/// Rank-addressed message passing between the processes of a run.
///
/// Sends are buffered and never block; receives block until the matching
/// message arrives. Collective failure is fatal and propagates; the core
/// does not time out, killing stuck runs is the environment's job.
pub trait Communicator: Send + Sync + std::fmt::Debug {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    fn send(&self, to: usize, tag: u64, payload: Vec<u8>) -> Result<()>;
    fn recv(&self, from: usize, tag: u64) -> Result<Vec<u8>>;
    fn barrier(&self) -> Result<()>;

    /// Vector all-to-all: `parts[r]` is delivered to rank `r`, the return
    /// value holds what every rank sent to us, indexed by source rank. The
    /// local part is passed through without copying.
    fn alltoall(&self, tag: u64, mut parts: Vec<Vec<u8>>) -> Result<Vec<Vec<u8>>> {
        let n = self.size();
        let me = self.rank();
        debug_assert_eq!(parts.len(), n);
        let mut received: Vec<Vec<u8>> = vec![Vec::new(); n];
        received[me] = std::mem::take(&mut parts[me]);
        for (r, part) in parts.into_iter().enumerate() {
            if r != me {
                self.send(r, tag, part)?;
            }
        }
        for (r, slot) in received.iter_mut().enumerate() {
            if r != me {
                *slot = self.recv(r, tag)?;
            }
        }
        Ok(received)
    }
}

/// Encodes a 3-D slab for the wire: three u64 extents, then the elements in
/// row-major order, all little endian.
pub fn encode_slab<T: Element>(view: ArrayView3<'_, T>) -> Vec<u8> {
    let shape = view.shape();
    let mut out = Vec::with_capacity(24 + view.len() * T::NBYTES);
    for extent in shape {
        out.extend_from_slice(&(*extent as u64).to_le_bytes());
    }
    let mut buf = vec![0_u8; T::NBYTES];
    for value in view.iter() {
        value.write_le(&mut buf);
        out.extend_from_slice(&buf);
    }
    out
}

/// Inverse of [`encode_slab`].
pub fn decode_slab<T: Element>(bytes: &[u8]) -> Result<Array3<T>> {
    if bytes.len() < 24 {
        return Err(CommError::Malformed(format!(
            "slab payload of {} bytes is shorter than its header",
            bytes.len()
        )));
    }
    let mut shape: Shape3 = [0; 3];
    for (d, extent) in shape.iter_mut().enumerate() {
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(&bytes[d * 8..d * 8 + 8]);
        *extent = u64::from_le_bytes(raw) as usize;
    }
    let total: usize = shape.iter().product();
    let body = &bytes[24..];
    if body.len() != total * T::NBYTES {
        return Err(CommError::Malformed(format!(
            "slab payload holds {} bytes, expected {} for shape {:?}",
            body.len(),
            total * T::NBYTES,
            shape
        )));
    }
    let elements: Vec<T> = body.chunks_exact(T::NBYTES).map(T::read_le).collect();
    Ok(Array3::from_shape_vec((shape[0], shape[1], shape[2]), elements)
        .expect("shape and element count agree"))
}
