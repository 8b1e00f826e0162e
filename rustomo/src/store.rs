//! The data-set store: the hand-off point between pipeline sections.
//!
//! A [`writer::DataSetStoreWriter`] accepts the blocks one section emits and
//! assembles them into the process-local chunk; sealing it with
//! `make_reader` transfers the chunk buffer into a
//! [`reader::DataSetStoreReader`], which serves blocks (with halo padding
//! and, when the next section's pattern differs, after a reslice) to the
//! following section. The traits here are what the runner actually talks
//! to; the loader is just another [`DataSetSource`].

pub mod reader;
pub mod writer;

use crate::comm::CommError;
use crate::loader::LoaderError;
use rustomo_core::{
    AuxiliaryData, BlockError, ChunkError, DataBlock, Dim, Element, Index3, Padding, Shape3,
    ShapeError,
};

use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("block {field} {got} is inconsistent with the store's first write, expected {expected}")]
    ShapeMismatch {
        field: &'static str,
        expected: String,
        got: String,
    },
    #[error(transparent)]
    OutOfChunk(#[from] ShapeError),
    #[error("reader requested before any block was written to the store")]
    EmptyStore,
    #[error("block written after the store was sealed by make_reader")]
    WriteAfterSeal,
    #[error("store is already sealed; only one reader can be made")]
    AlreadySealed,
    #[error(
        "block at {got} does not continue the chunk frontier at {expected}; \
         blocks must cover the chunk in order, exactly once"
    )]
    OutOfOrder { expected: usize, got: usize },
    #[error("chunk buffer error")]
    Chunk(#[from] ChunkError),
    #[error("collective exchange failed")]
    Comm(#[from] CommError),
    #[error(transparent)]
    Block(#[from] BlockError),
    #[error("loader error")]
    Loader(#[from] LoaderError),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Anything that can serve blocks of the current chunk to a section.
pub trait DataSetSource<T: Element>: std::fmt::Debug {
    fn global_shape(&self) -> Shape3;

    /// Extent of the served chunk; includes the halo allowance when the
    /// source was built with padding.
    fn chunk_shape(&self) -> Shape3;

    /// Position of the served chunk within the global volume; shifted by
    /// `-pad_before` along the slicing axis when padded.
    fn global_index(&self) -> Index3;

    fn slicing_dim(&self) -> Dim;

    fn padding(&self) -> Padding {
        (0, 0)
    }

    fn aux(&self) -> Arc<AuxiliaryData<T>>;

    fn is_file_based(&self) -> bool {
        false
    }

    /// Core (halo-free) chunk length along the slicing axis; block starts
    /// iterate over `0..chunk_len()`.
    fn chunk_len(&self) -> usize {
        let (pad_before, pad_after) = self.padding();
        self.chunk_shape()[self.slicing_dim().index()] - pad_before - pad_after
    }

    /// Serves `length` core slices starting at `block_start`, widened by the
    /// source's halo padding on both sides.
    fn read_block(&mut self, block_start: usize, length: usize) -> Result<DataBlock<T>>;
}

/// Anything that consumes the blocks a section emits.
pub trait DataSetSink<T: Element>: std::fmt::Debug {
    fn slicing_dim(&self) -> Dim;
    fn write_block(&mut self, block: &DataBlock<T>) -> Result<()>;
}
