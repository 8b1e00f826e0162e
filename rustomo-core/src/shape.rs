//! Shape, slicing and padding arithmetic for 3-D volumes.
//!
//! All volumetric data in rustomo is three dimensional, with axes
//! `(angles, detector_y, detector_x)` in the natural file layout. These
//! helpers are the single source of truth for how a global extent is split
//! into per-rank chunks and how block ranges are validated against them.

use thiserror::Error;

/// A 3-D extent.
pub type Shape3 = [usize; 3];

/// A signed 3-D coordinate.
///
/// Indices can go negative along the slicing axis when halo padding reaches
/// before the start of a chunk.
pub type Index3 = [isize; 3];

/// Halo sizes before and after a block along the slicing axis.
pub type Padding = (usize, usize);

#[derive(Error, Debug)]
pub enum ShapeError {
    #[error("invalid slicing dimension {0}, must be one of 0, 1, 2")]
    InvalidDim(usize),
    #[error(
        "block range [{start}, {end}) lies outside chunk of length {chunk_len} \
         (padding allowance ({pad_before}, {pad_after}))"
    )]
    OutOfChunk {
        start: isize,
        end: isize,
        chunk_len: usize,
        pad_before: usize,
        pad_after: usize,
    },
}

type Result<T> = std::result::Result<T, ShapeError>;

/// A validated slicing dimension.
///
/// Wrapping the index means a `Dim` in a signature is always one of 0, 1, 2,
/// so downstream indexing does not need to re-check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dim(usize);

impl Dim {
    pub fn new(index: usize) -> Result<Dim> {
        if index > 2 {
            return Err(ShapeError::InvalidDim(index));
        }
        Ok(Dim(index))
    }

    pub fn index(self) -> usize {
        self.0
    }

    /// The two non-slicing dimensions, in ascending order.
    pub fn others(self) -> [usize; 2] {
        match self.0 {
            0 => [1, 2],
            1 => [0, 2],
            _ => [0, 1],
        }
    }
}

impl std::fmt::Display for Dim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returns `shape` with the extent along `dim` replaced by `value`.
pub fn with_dim(shape: Shape3, dim: Dim, value: usize) -> Shape3 {
    let mut out = shape;
    out[dim.index()] = value;
    out
}

/// The two non-slicing extents of `shape`, in ascending dimension order.
pub fn non_slice_shape(shape: Shape3, dim: Dim) -> (usize, usize) {
    let [a, b] = dim.others();
    (shape[a], shape[b])
}

/// Converts a shape to the tuple form `ndarray` indexes with.
pub fn ix(shape: Shape3) -> (usize, usize, usize) {
    (shape[0], shape[1], shape[2])
}

pub fn to_index(shape: Shape3) -> Index3 {
    [shape[0] as isize, shape[1] as isize, shape[2] as isize]
}

/// Start offset of rank `rank`'s share when `len` indices are distributed
/// over `nproc` ranks with the rounding rule `round(len * rank / nproc)`.
///
/// This is the ingestion split: shares differ by at most one and tile the
/// extent exactly.
pub fn split_start(len: usize, nproc: usize, rank: usize) -> usize {
    debug_assert!(nproc > 0 && rank <= nproc);
    // round(len * rank / nproc) without going through floats
    (2 * len * rank + nproc) / (2 * nproc)
}

/// Length of rank `rank`'s share under the rounding split.
pub fn split_len(len: usize, nproc: usize, rank: usize) -> usize {
    split_start(len, nproc, rank + 1) - split_start(len, nproc, rank)
}

/// Start offset of rank `rank`'s share under the reslice partition: every
/// rank receives `ceil(len / nproc)` indices except the last, which takes
/// the remainder.
pub fn ceil_split_start(len: usize, nproc: usize, rank: usize) -> usize {
    debug_assert!(nproc > 0 && rank <= nproc);
    let per_rank = (len + nproc - 1) / nproc;
    (rank * per_rank).min(len)
}

/// Length of rank `rank`'s share under the reslice partition.
pub fn ceil_split_len(len: usize, nproc: usize, rank: usize) -> usize {
    ceil_split_start(len, nproc, rank + 1) - ceil_split_start(len, nproc, rank)
}

/// Validates a block's core range against a chunk extent, allowing the range
/// to reach into the halo allowance on either side.
pub fn check_block_range(
    start: isize,
    length: usize,
    chunk_len: usize,
    padding: Padding,
) -> Result<()> {
    let (pad_before, pad_after) = padding;
    let end = start + length as isize;
    if start < -(pad_before as isize) || end > (chunk_len + pad_after) as isize {
        return Err(ShapeError::OutOfChunk {
            start,
            end,
            chunk_len,
            pad_before,
            pad_after,
        });
    }
    Ok(())
}
