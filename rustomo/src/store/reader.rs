//! The reading half of the data-set store.

use super::writer::StoreMeta;
use super::{DataSetSource, Result};
use crate::comm::{self, Communicator, TAG_HALO_DOWN, TAG_HALO_UP};
use crate::reslice::reslice;
use rustomo_core::chunk::{ChunkData, FileDataSet};
use rustomo_core::{shape, AuxiliaryData, DataBlock, Dim, Element, Index3, Padding, Shape3};

use ndarray::{concatenate, Array3, Axis, Slice};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Serves the sealed chunk of a store to the next section.
///
/// Created exclusively by `DataSetStoreWriter::make_reader`, which hands
/// over the chunk buffer. If the requested slicing dim differs from the
/// writer's, construction performs the collective reslice; if padding was
/// requested, the halo slabs are exchanged with the neighbouring ranks once,
/// here, and every served block is widened from them.
#[derive(Debug)]
pub struct DataSetStoreReader<T: Element> {
    chunk: ChunkData<T>,
    meta: StoreMeta<T>,
    slicing_dim: Dim,
    padding: Padding,
    halo_before: Option<Array3<T>>,
    halo_after: Option<Array3<T>>,
    comm: Arc<dyn Communicator>,
}

impl<T: Element> DataSetStoreReader<T> {
    #[instrument(skip(chunk, meta, comm, temp_dir), fields(rank = comm.rank()))]
    pub(crate) fn new(
        mut chunk: ChunkData<T>,
        mut meta: StoreMeta<T>,
        old_dim: Dim,
        new_slicing_dim: Option<Dim>,
        padding: Padding,
        comm: Arc<dyn Communicator>,
        temp_dir: PathBuf,
    ) -> Result<Self> {
        let slicing_dim = new_slicing_dim.unwrap_or(old_dim);
        if slicing_dim != old_dim {
            if comm.size() == 1 {
                // A single rank holds the whole volume; changing the slicing
                // axis only relabels the metadata.
                meta.chunk_start = 0;
            } else {
                let full = chunk.read_slab([0, 0, 0], meta.chunk_shape)?;
                let was_file_based = chunk.is_file_based();
                chunk.finalize()?;
                let (resliced, chunk_start) =
                    reslice(full, old_dim, slicing_dim, meta.global_shape, comm.as_ref())?;
                let chunk_shape = [
                    resliced.shape()[0],
                    resliced.shape()[1],
                    resliced.shape()[2],
                ];
                chunk = if was_file_based {
                    let mut file = FileDataSet::create(&temp_dir, chunk_shape)?;
                    file.write_slab([0, 0, 0], resliced.view())?;
                    ChunkData::File(file)
                } else {
                    ChunkData::Ram(resliced)
                };
                meta.chunk_shape = chunk_shape;
                meta.chunk_start = chunk_start;
            }
        }

        let mut reader = DataSetStoreReader {
            chunk,
            meta,
            slicing_dim,
            padding,
            halo_before: None,
            halo_after: None,
            comm,
        };
        if padding != (0, 0) {
            reader.exchange_halos()?;
        }
        Ok(reader)
    }

    /// One-shot pairwise halo exchange with the neighbouring ranks.
    ///
    /// Rank r's leading halo is the trailing `pad_before` slices of rank
    /// r−1's chunk, and symmetrically for the trailing halo; at the global
    /// boundary the edge slice is repeated instead.
    fn exchange_halos(&mut self) -> Result<()> {
        let (pad_before, pad_after) = self.padding;
        let dim = self.slicing_dim;
        let core_len = self.meta.chunk_shape[dim.index()];
        let rank = self.comm.rank();
        let size = self.comm.size();

        // Sends are buffered, so both directions go out before any receive.
        if pad_after > 0 && rank > 0 {
            let head = self.boundary_slab(0, pad_after)?;
            self.comm
                .send(rank - 1, TAG_HALO_UP, comm::encode_slab(head.view()))?;
        }
        if pad_before > 0 && rank + 1 < size {
            let tail = self.boundary_slab(core_len - pad_before, pad_before)?;
            self.comm
                .send(rank + 1, TAG_HALO_DOWN, comm::encode_slab(tail.view()))?;
        }
        if pad_before > 0 {
            self.halo_before = Some(if rank > 0 {
                comm::decode_slab(&self.comm.recv(rank - 1, TAG_HALO_DOWN)?)?
            } else {
                let edge = self.boundary_slab(0, 1)?;
                repeat_slices(&edge, pad_before, dim)
            });
        }
        if pad_after > 0 {
            self.halo_after = Some(if rank + 1 < size {
                comm::decode_slab(&self.comm.recv(rank + 1, TAG_HALO_UP)?)?
            } else {
                let edge = self.boundary_slab(core_len - 1, 1)?;
                repeat_slices(&edge, pad_after, dim)
            });
        }
        debug!(rank, padding = ?self.padding, "halo slabs materialized");
        Ok(())
    }

    fn boundary_slab(&mut self, start: usize, count: usize) -> Result<Array3<T>> {
        let dim = self.slicing_dim;
        let offset = shape::with_dim([0, 0, 0], dim, start);
        let slab_shape = shape::with_dim(self.meta.chunk_shape, dim, count);
        Ok(self.chunk.read_slab(offset, slab_shape)?)
    }

    /// Releases the chunk buffer; file-backed buffers delete their file.
    pub fn finalize(self) -> Result<()> {
        self.chunk.finalize()?;
        Ok(())
    }
}

/// Stacks `count` copies of a single-slice slab along the slicing axis.
fn repeat_slices<T: Element>(slice: &Array3<T>, count: usize, dim: Dim) -> Array3<T> {
    let views: Vec<_> = (0..count).map(|_| slice.view()).collect();
    concatenate(Axis(dim.index()), &views).expect("identical slab shapes")
}

impl<T: Element> DataSetSource<T> for DataSetStoreReader<T> {
    fn global_shape(&self) -> Shape3 {
        self.meta.global_shape
    }

    fn chunk_shape(&self) -> Shape3 {
        let (pad_before, pad_after) = self.padding;
        let d = self.slicing_dim.index();
        shape::with_dim(
            self.meta.chunk_shape,
            self.slicing_dim,
            self.meta.chunk_shape[d] + pad_before + pad_after,
        )
    }

    fn global_index(&self) -> Index3 {
        let mut index = [0_isize; 3];
        index[self.slicing_dim.index()] =
            self.meta.chunk_start as isize - self.padding.0 as isize;
        index
    }

    fn slicing_dim(&self) -> Dim {
        self.slicing_dim
    }

    fn padding(&self) -> Padding {
        self.padding
    }

    fn aux(&self) -> Arc<AuxiliaryData<T>> {
        Arc::clone(&self.meta.aux)
    }

    fn is_file_based(&self) -> bool {
        self.chunk.is_file_based()
    }

    #[instrument(skip(self))]
    fn read_block(&mut self, block_start: usize, length: usize) -> Result<DataBlock<T>> {
        let dim = self.slicing_dim;
        let d = dim.index();
        let core_len = self.meta.chunk_shape[d];
        shape::check_block_range(block_start as isize, length, core_len, (0, 0))?;
        let (pad_before, pad_after) = self.padding;
        let lo = block_start as isize - pad_before as isize;
        let hi = (block_start + length + pad_after) as isize;

        let mut segments: Vec<Array3<T>> = Vec::with_capacity(3);
        if lo < 0 {
            let halo = self.halo_before.as_ref().expect("padding implies a leading halo");
            let from = (pad_before as isize + lo) as usize;
            segments.push(halo.slice_axis(Axis(d), Slice::from(from..pad_before)).to_owned());
        }
        let core_lo = lo.max(0) as usize;
        let core_hi = (hi.min(core_len as isize)) as usize;
        if core_hi > core_lo {
            let offset = shape::with_dim([0, 0, 0], dim, core_lo);
            let slab_shape = shape::with_dim(self.meta.chunk_shape, dim, core_hi - core_lo);
            segments.push(self.chunk.read_slab(offset, slab_shape)?);
        }
        if hi > core_len as isize {
            let halo = self.halo_after.as_ref().expect("padding implies a trailing halo");
            let over = (hi - core_len as isize) as usize;
            segments.push(halo.slice_axis(Axis(d), Slice::from(0..over)).to_owned());
        }
        let data = if segments.len() == 1 {
            segments.pop().expect("one segment")
        } else {
            let views: Vec<_> = segments.iter().map(Array3::view).collect();
            concatenate(Axis(d), &views).expect("segment shapes agree off the slicing axis")
        };

        let block = DataBlock::with_padding(
            data,
            self.aux(),
            dim,
            block_start,
            self.meta.chunk_start as isize - pad_before as isize,
            self.meta.global_shape,
            self.chunk_shape(),
            self.padding,
        )?;
        Ok(block)
    }
}
