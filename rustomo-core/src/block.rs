//! Blocks: the unit of data served to methods.
//!
//! A block is a view over a contiguous sub-range of a chunk along the
//! slicing axis, optionally widened by halo slices on either side. Blocks
//! own their buffer, carry a shared handle to the run's [`AuxiliaryData`],
//! and know where they sit inside the chunk and the global volume.
//!
//! Coordinates: `block_start` is the index of the block's core (non-halo)
//! region within the chunk, which is also the index of the buffer's first
//! slice within the padded chunk extent a halo-serving reader reports. The
//! derived `global_index` goes negative when a leading halo reaches before
//! the start of the global volume.

use crate::auxiliary::AuxiliaryData;
use crate::element::Element;
use crate::shape::{self, Dim, Index3, Padding, Shape3, ShapeError};

use ndarray::{Array3, ArrayView1, ArrayView3, ArrayViewMut3, Axis, Slice};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlockError {
    #[error("block data has {got} slices along dim {dim}, expected {expected}")]
    SlicingLenChanged { dim: Dim, expected: usize, got: usize },
    #[error(
        "block data shape {data:?} does not match chunk shape {chunk:?} in non-slicing dims"
    )]
    NonSliceShapeMismatch { data: Shape3, chunk: Shape3 },
    #[error("no GPU is configured for this run")]
    NoGpu,
    #[error(transparent)]
    Shape(#[from] ShapeError),
}

type Result<T> = std::result::Result<T, BlockError>;

/// Where a block's buffer currently resides.
///
/// The core only tracks residency and byte budgets; kernel and stream
/// management belongs to the methods themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Gpu(u32),
}

#[derive(Debug)]
pub struct DataBlock<T: Element> {
    data: Array3<T>,
    aux: Arc<AuxiliaryData<T>>,
    slicing_dim: Dim,
    block_start: usize,
    chunk_start: isize,
    global_shape: Shape3,
    chunk_shape: Shape3,
    padding: Padding,
    device: Device,
}

impl<T: Element> DataBlock<T> {
    /// Builds an unpadded block.
    pub fn new(
        data: Array3<T>,
        aux: Arc<AuxiliaryData<T>>,
        slicing_dim: Dim,
        block_start: usize,
        chunk_start: isize,
        global_shape: Shape3,
        chunk_shape: Shape3,
    ) -> Result<Self> {
        Self::with_padding(
            data,
            aux,
            slicing_dim,
            block_start,
            chunk_start,
            global_shape,
            chunk_shape,
            (0, 0),
        )
    }

    /// Builds a block whose buffer carries halo slices around the core.
    ///
    /// `chunk_shape` is the extent the serving source reports, so it already
    /// includes the halo allowance when `padding` is non-zero.
    #[allow(clippy::too_many_arguments)]
    pub fn with_padding(
        data: Array3<T>,
        aux: Arc<AuxiliaryData<T>>,
        slicing_dim: Dim,
        block_start: usize,
        chunk_start: isize,
        global_shape: Shape3,
        chunk_shape: Shape3,
        padding: Padding,
    ) -> Result<Self> {
        let d = slicing_dim.index();
        let data_shape: Shape3 = [data.shape()[0], data.shape()[1], data.shape()[2]];
        let [a, b] = slicing_dim.others();
        if data_shape[a] != chunk_shape[a] || data_shape[b] != chunk_shape[b] {
            return Err(BlockError::NonSliceShapeMismatch {
                data: data_shape,
                chunk: chunk_shape,
            });
        }
        let (pb, pa) = padding;
        let core_len = data_shape[d] - pb - pa;
        let chunk_core_len = chunk_shape[d] - pb - pa;
        shape::check_block_range(block_start as isize, core_len, chunk_core_len, (0, 0))?;
        Ok(DataBlock {
            data,
            aux,
            slicing_dim,
            block_start,
            chunk_start,
            global_shape,
            chunk_shape,
            padding,
            device: Device::Cpu,
        })
    }

    pub fn shape(&self) -> Shape3 {
        [self.data.shape()[0], self.data.shape()[1], self.data.shape()[2]]
    }

    /// Buffer length along the slicing axis, halo included.
    pub fn len(&self) -> usize {
        self.data.shape()[self.slicing_dim.index()]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Core length along the slicing axis, halo excluded.
    pub fn core_len(&self) -> usize {
        self.len() - self.padding.0 - self.padding.1
    }

    pub fn slicing_dim(&self) -> Dim {
        self.slicing_dim
    }

    pub fn block_start(&self) -> usize {
        self.block_start
    }

    /// Global offset of the serving chunk's first slice along the slicing
    /// axis; negative when the chunk carries a leading halo.
    pub fn chunk_start(&self) -> isize {
        self.chunk_start
    }

    pub fn padding(&self) -> Padding {
        self.padding
    }

    pub fn is_padded(&self) -> bool {
        self.padding != (0, 0)
    }

    pub fn global_shape(&self) -> Shape3 {
        self.global_shape
    }

    pub fn chunk_shape(&self) -> Shape3 {
        self.chunk_shape
    }

    /// Index of the buffer's first slice within the chunk the source serves.
    pub fn chunk_index(&self) -> Index3 {
        let mut out = [0_isize; 3];
        out[self.slicing_dim.index()] = self.block_start as isize;
        out
    }

    /// Index of the buffer's first slice within the global volume.
    ///
    /// Negative along the slicing axis when a leading halo was filled by
    /// edge extrapolation at the global boundary.
    pub fn global_index(&self) -> Index3 {
        let mut out = [0_isize; 3];
        out[self.slicing_dim.index()] = self.chunk_start + self.block_start as isize;
        out
    }

    pub fn is_last_in_chunk(&self) -> bool {
        let d = self.slicing_dim.index();
        let chunk_core_len = self.chunk_shape[d] - self.padding.0 - self.padding.1;
        self.block_start + self.core_len() == chunk_core_len
    }

    pub fn data(&self) -> ArrayView3<'_, T> {
        self.data.view()
    }

    pub fn data_mut(&mut self) -> ArrayViewMut3<'_, T> {
        self.data.view_mut()
    }

    pub fn into_data(self) -> Array3<T> {
        self.data
    }

    /// The core region of the buffer, halo slices stripped.
    pub fn core_view(&self) -> ArrayView3<'_, T> {
        let (pb, pa) = self.padding;
        self.data.slice_axis(
            Axis(self.slicing_dim.index()),
            Slice::from(pb..self.len() - pa),
        )
    }

    /// Replaces the buffer, allowing non-slicing dims to change.
    ///
    /// Methods are free to reshape detector dimensions but must preserve the
    /// slicing-axis length, since that is the coordinate the chunk and the
    /// stores are partitioned over. The chunk and global shapes follow the
    /// new non-slicing extents.
    pub fn set_data(&mut self, new_data: Array3<T>) -> Result<()> {
        let d = self.slicing_dim.index();
        if new_data.shape()[d] != self.len() {
            return Err(BlockError::SlicingLenChanged {
                dim: self.slicing_dim,
                expected: self.len(),
                got: new_data.shape()[d],
            });
        }
        for dim in &self.slicing_dim.others() {
            self.chunk_shape[*dim] = new_data.shape()[*dim];
            self.global_shape[*dim] = new_data.shape()[*dim];
        }
        self.data = new_data;
        Ok(())
    }

    pub fn aux(&self) -> Arc<AuxiliaryData<T>> {
        Arc::clone(&self.aux)
    }

    pub fn angles(&self) -> ArrayView1<'_, f32> {
        self.aux.angles()
    }

    pub fn darks(&self) -> Option<ArrayView3<'_, T>> {
        self.aux.darks()
    }

    pub fn flats(&self) -> Option<ArrayView3<'_, T>> {
        self.aux.flats()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self.device, Device::Gpu(_))
    }

    pub fn is_cpu(&self) -> bool {
        self.device == Device::Cpu
    }

    /// Moves the buffer to device residency.
    ///
    /// Transfer cost is accounted by the planner; the buffer itself stays
    /// host-addressable staging memory from the core's point of view.
    pub fn to_gpu(&mut self, gpu_id: i32) -> Result<()> {
        if gpu_id < 0 {
            return Err(BlockError::NoGpu);
        }
        if self.device == Device::Cpu {
            tracing::trace!(gpu_id, "moving block to device");
            self.device = Device::Gpu(gpu_id as u32);
        }
        Ok(())
    }

    pub fn to_cpu(&mut self) {
        if self.device != Device::Cpu {
            tracing::trace!("moving block to host");
            self.device = Device::Cpu;
        }
    }

    /// Bytes held by the buffer.
    pub fn nbytes(&self) -> u64 {
        (self.data.len() * T::NBYTES) as u64
    }
}
