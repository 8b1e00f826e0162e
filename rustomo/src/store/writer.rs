//! The writing half of the data-set store.

use super::{DataSetSink, Result, StoreError};
use crate::comm::Communicator;
use crate::store::reader::DataSetStoreReader;
use rustomo_core::chunk::{self, ChunkData, ChunkError, FileDataSet};
use rustomo_core::{shape, AuxiliaryData, DataBlock, Dim, Element, Index3, Padding, Shape3};

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Where the chunk buffer should live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Prefer RAM, spill to a temp file when the allocation fails or would
    /// exceed the configured memory limit.
    Auto,
    /// RAM only; allocation failure is surfaced as `OutOfMemory`.
    Ram,
    /// Always file backed.
    File,
}

/// Shape and identity a store fixes on its first write, shared with the
/// reader it eventually hands its buffer to.
#[derive(Debug, Clone)]
pub(crate) struct StoreMeta<T: Element> {
    pub global_shape: Shape3,
    /// Core chunk extent, halo-free.
    pub chunk_shape: Shape3,
    /// Global offset of the core chunk along the slicing axis.
    pub chunk_start: usize,
    pub aux: Arc<AuxiliaryData<T>>,
}

/// Accepts the blocks one section emits and assembles the process-local
/// chunk.
///
/// The first written block fixes the global shape, chunk shape and chunk
/// offset; later blocks must agree and must extend the coverage frontier in
/// order, exactly once. `make_reader` seals the store and moves the buffer
/// into a [`DataSetStoreReader`].
#[derive(Debug)]
pub struct DataSetStoreWriter<T: Element> {
    slicing_dim: Dim,
    comm: Arc<dyn Communicator>,
    temp_dir: PathBuf,
    memory_limit_bytes: Option<u64>,
    backing: Backing,
    chunk: Option<ChunkData<T>>,
    meta: Option<StoreMeta<T>>,
    frontier: usize,
    file_based: bool,
    sealed: bool,
}

impl<T: Element> DataSetStoreWriter<T> {
    pub fn new(slicing_dim: Dim, comm: Arc<dyn Communicator>, temp_dir: impl Into<PathBuf>) -> Self {
        DataSetStoreWriter {
            slicing_dim,
            comm,
            temp_dir: temp_dir.into(),
            memory_limit_bytes: None,
            backing: Backing::Auto,
            chunk: None,
            meta: None,
            frontier: 0,
            file_based: false,
            sealed: false,
        }
    }

    /// Caps the chunk bytes held in RAM; larger chunks go straight to file.
    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = Some(bytes);
        self
    }

    pub fn with_backing(mut self, backing: Backing) -> Self {
        self.backing = backing;
        self
    }

    pub fn slicing_dim(&self) -> Dim {
        self.slicing_dim
    }

    pub fn is_file_based(&self) -> bool {
        self.file_based
    }

    /// Set by the first write.
    pub fn global_shape(&self) -> Option<Shape3> {
        self.meta.as_ref().map(|m| m.global_shape)
    }

    /// Set by the first write.
    pub fn chunk_shape(&self) -> Option<Shape3> {
        self.meta.as_ref().map(|m| m.chunk_shape)
    }

    /// Set by the first write.
    pub fn global_index(&self) -> Option<Index3> {
        self.meta.as_ref().map(|m| {
            let mut index = [0_isize; 3];
            index[self.slicing_dim.index()] = m.chunk_start as isize;
            index
        })
    }

    fn allocate(&self, chunk_shape: Shape3) -> Result<ChunkData<T>> {
        let bytes = (chunk_shape.iter().product::<usize>() * T::NBYTES) as u64;
        match self.backing {
            Backing::Ram => Ok(ChunkData::Ram(chunk::try_alloc_ram(chunk_shape)?)),
            Backing::File => Ok(ChunkData::File(FileDataSet::create(
                &self.temp_dir,
                chunk_shape,
            )?)),
            Backing::Auto => {
                if let Some(limit) = self.memory_limit_bytes {
                    if bytes > limit {
                        warn!(
                            bytes,
                            limit, "chunk exceeds the memory limit, using a file-backed store"
                        );
                        return Ok(ChunkData::File(FileDataSet::create(
                            &self.temp_dir,
                            chunk_shape,
                        )?));
                    }
                }
                match chunk::try_alloc_ram(chunk_shape) {
                    Ok(array) => Ok(ChunkData::Ram(array)),
                    Err(ChunkError::OutOfMemory { bytes }) => {
                        warn!(
                            bytes,
                            "chunk allocation failed, falling back to a file-backed store"
                        );
                        Ok(ChunkData::File(FileDataSet::create(
                            &self.temp_dir,
                            chunk_shape,
                        )?))
                    }
                    Err(other) => Err(other.into()),
                }
            }
        }
    }

    /// Derives the core (halo-free) chunk metadata of the block's serving
    /// chunk, which is what this store will hold.
    fn incoming_meta(&self, block: &DataBlock<T>) -> Result<StoreMeta<T>> {
        let dim = self.slicing_dim;
        let (pad_before, pad_after) = block.padding();
        let padded = block.chunk_shape();
        let chunk_shape = shape::with_dim(
            padded,
            dim,
            padded[dim.index()] - pad_before - pad_after,
        );
        let chunk_start = block.chunk_start() + pad_before as isize;
        if chunk_start < 0 {
            return Err(StoreError::ShapeMismatch {
                field: "global_index",
                expected: "a non-negative chunk offset".to_string(),
                got: chunk_start.to_string(),
            });
        }
        Ok(StoreMeta {
            global_shape: block.global_shape(),
            chunk_shape,
            chunk_start: chunk_start as usize,
            aux: block.aux(),
        })
    }

    /// Seals the store and hands its buffer to a reader.
    ///
    /// When `new_slicing_dim` differs from the writer's, the reader performs
    /// the collective reslice; `padding` widens every block it will serve by
    /// halo slices along the (new) slicing axis.
    #[instrument(skip(self))]
    pub fn make_reader(
        &mut self,
        new_slicing_dim: Option<Dim>,
        padding: Padding,
    ) -> Result<DataSetStoreReader<T>> {
        if self.sealed {
            return Err(StoreError::AlreadySealed);
        }
        let (chunk, meta) = match (self.chunk.take(), self.meta.clone()) {
            (Some(chunk), Some(meta)) => (chunk, meta),
            _ => return Err(StoreError::EmptyStore),
        };
        self.sealed = true;
        DataSetStoreReader::new(
            chunk,
            meta,
            self.slicing_dim,
            new_slicing_dim,
            padding,
            Arc::clone(&self.comm),
            self.temp_dir.clone(),
        )
    }

    /// Releases the chunk buffer; a file-backed buffer deletes its file.
    ///
    /// Only meaningful while the store still owns its buffer; after
    /// `make_reader` the reader is responsible for the hand-off.
    pub fn finalize(&mut self) -> Result<()> {
        if let Some(chunk) = self.chunk.take() {
            chunk.finalize()?;
        }
        Ok(())
    }
}

impl<T: Element> DataSetSink<T> for DataSetStoreWriter<T> {
    fn slicing_dim(&self) -> Dim {
        self.slicing_dim
    }

    #[instrument(skip(self, block), fields(block_start = block.block_start()))]
    fn write_block(&mut self, block: &DataBlock<T>) -> Result<()> {
        if self.sealed {
            return Err(StoreError::WriteAfterSeal);
        }
        if block.slicing_dim() != self.slicing_dim {
            return Err(StoreError::ShapeMismatch {
                field: "slicing_dim",
                expected: self.slicing_dim.to_string(),
                got: block.slicing_dim().to_string(),
            });
        }
        let incoming = self.incoming_meta(block)?;
        match &self.meta {
            None => {
                debug!(
                    global_shape = ?incoming.global_shape,
                    chunk_shape = ?incoming.chunk_shape,
                    chunk_start = incoming.chunk_start,
                    dtype = T::DTYPE,
                    "first write fixes the store's shape"
                );
                self.chunk = Some(self.allocate(incoming.chunk_shape)?);
                self.file_based = self.chunk.as_ref().map_or(false, ChunkData::is_file_based);
                self.meta = Some(incoming);
            }
            Some(meta) => {
                if incoming.global_shape != meta.global_shape {
                    return Err(StoreError::ShapeMismatch {
                        field: "global_shape",
                        expected: format!("{:?}", meta.global_shape),
                        got: format!("{:?}", incoming.global_shape),
                    });
                }
                if incoming.chunk_shape != meta.chunk_shape {
                    return Err(StoreError::ShapeMismatch {
                        field: "chunk_shape",
                        expected: format!("{:?}", meta.chunk_shape),
                        got: format!("{:?}", incoming.chunk_shape),
                    });
                }
                if incoming.chunk_start != meta.chunk_start {
                    return Err(StoreError::ShapeMismatch {
                        field: "global_index",
                        expected: meta.chunk_start.to_string(),
                        got: incoming.chunk_start.to_string(),
                    });
                }
            }
        }
        let dim = self.slicing_dim;
        let chunk_len = self.meta.as_ref().expect("meta set above").chunk_shape[dim.index()];
        shape::check_block_range(block.block_start() as isize, block.core_len(), chunk_len, (0, 0))?;
        if block.block_start() != self.frontier {
            return Err(StoreError::OutOfOrder {
                expected: self.frontier,
                got: block.block_start(),
            });
        }
        let offset = shape::with_dim([0, 0, 0], dim, block.block_start());
        self.chunk
            .as_mut()
            .expect("chunk allocated above")
            .write_slab(offset, block.core_view())?;
        self.frontier += block.core_len();
        Ok(())
    }
}
