//! Collective reslicing: an all-to-all transpose of the distributed chunk
//! from one slicing axis to another.
//!
//! Every rank owns the full global extent along all axes except the old
//! slicing axis. To move the cut to a new axis, rank `r` sends rank `r'` the
//! sub-tile of its chunk that falls inside `r'`'s new share, and receives
//! the symmetric tiles. The new partition is the ceil-split: every rank
//! takes `ceil(G / N)` indices except the last, which takes the remainder.

use crate::comm::{self, Communicator, TAG_RESLICE};
use crate::store::{Result, StoreError};
use rustomo_core::{shape, Dim, Element, Shape3};

use ndarray::{Array3, Axis, Slice};
use tracing::{debug, instrument};

/// Transposes the distributed chunk onto `new_dim`.
///
/// Takes the rank's full chunk in the old layout and returns the chunk in
/// the new layout together with its start offset along `new_dim`. With a
/// single rank this is a pass-through; the caller relabels its metadata.
#[instrument(skip(chunk, comm), fields(rank = comm.rank(), size = comm.size()))]
pub fn reslice<T: Element>(
    chunk: Array3<T>,
    old_dim: Dim,
    new_dim: Dim,
    global_shape: Shape3,
    comm: &dyn Communicator,
) -> Result<(Array3<T>, usize)> {
    debug_assert_ne!(old_dim, new_dim);
    let nproc = comm.size();
    if nproc == 1 {
        return Ok((chunk, 0));
    }
    let rank = comm.rank();
    let old_d = old_dim.index();
    let new_d = new_dim.index();
    let new_extent = global_shape[new_d];

    let parts = (0..nproc)
        .map(|r| {
            let start = shape::ceil_split_start(new_extent, nproc, r);
            let len = shape::ceil_split_len(new_extent, nproc, r);
            let tile = chunk.slice_axis(Axis(new_d), Slice::from(start..start + len));
            comm::encode_slab(tile)
        })
        .collect();
    let received = comm.alltoall(TAG_RESLICE, parts)?;

    let my_start = shape::ceil_split_start(new_extent, nproc, rank);
    let my_len = shape::ceil_split_len(new_extent, nproc, rank);
    let out_shape = shape::with_dim(shape::with_dim(global_shape, new_dim, my_len), old_dim, global_shape[old_d]);
    let mut out = Array3::from_elem(shape::ix(out_shape), T::default());

    // Tiles arrive indexed by source rank; ranks tile the old axis in
    // ascending order, so stacking them in rank order rebuilds it.
    let mut offset = 0;
    for payload in &received {
        let tile = comm::decode_slab::<T>(payload)?;
        let tile_len = tile.shape()[old_d];
        out.slice_axis_mut(Axis(old_d), Slice::from(offset..offset + tile_len))
            .assign(&tile);
        offset += tile_len;
    }
    if offset != global_shape[old_d] {
        return Err(StoreError::ShapeMismatch {
            field: "resliced extent",
            expected: global_shape[old_d].to_string(),
            got: offset.to_string(),
        });
    }
    debug!(?out_shape, my_start, "reslice complete");
    Ok((out, my_start))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::solo::SoloCommunicator;
    use ndarray::Array;

    #[test]
    fn single_rank_is_a_pass_through() {
        let chunk: Array3<f32> = Array::from_iter((0..1000).map(|v| v as f32))
            .into_shape((10, 10, 10))
            .unwrap();
        let comm = SoloCommunicator::new();
        let dim0 = Dim::new(0).unwrap();
        let dim1 = Dim::new(1).unwrap();
        let (out, start) = reslice(chunk.clone(), dim0, dim1, [10, 10, 10], &comm).unwrap();
        assert_eq!(start, 0);
        assert_eq!(out, chunk);
    }
}
