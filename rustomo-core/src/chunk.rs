//! Process-local chunk buffers, RAM or file backed.
//!
//! A store holds its chunk either as an in-memory array or as a raw
//! little-endian dump in a uniquely named file under the run's temp
//! directory. The file variant exists purely as spill space: it is created
//! when the in-memory allocation fails or would exceed the configured
//! memory limit, and it is deleted again when the owning store is finalized
//! or dropped.

use crate::element::Element;
use crate::shape::{self, Shape3};

use ndarray::{Array3, ArrayView3};
use std::fs::{remove_file, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Magic number at the start of chunk spill files.
const MAGIC_NUMBER: [u8; 8] = *b"RUSTOMOC";
/// Magic, three u64 extents, u32 element width.
const HEADER_LEN: u64 = 8 + 24 + 4;

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("I/O error on file-backed chunk")]
    Io(#[from] std::io::Error),
    #[error("cannot allocate {bytes} bytes for a chunk buffer")]
    OutOfMemory { bytes: u64 },
    #[error("slab at {start:?} with shape {shape:?} lies outside chunk extent {chunk:?}")]
    SlabOutOfBounds {
        start: Shape3,
        shape: Shape3,
        chunk: Shape3,
    },
}

type Result<T> = std::result::Result<T, ChunkError>;

/// Fallible in-memory chunk allocation.
///
/// Uses `try_reserve_exact` so exhaustion surfaces as an `Err` the store can
/// recover from by spilling to disk, rather than aborting the process.
pub fn try_alloc_ram<T: Element>(chunk_shape: Shape3) -> Result<Array3<T>> {
    let total: usize = chunk_shape.iter().product();
    let mut buffer: Vec<T> = Vec::new();
    buffer.try_reserve_exact(total).map_err(|_| ChunkError::OutOfMemory {
        bytes: (total * T::NBYTES) as u64,
    })?;
    buffer.resize(total, T::default());
    // The reserve above makes this infallible
    Ok(Array3::from_shape_vec(shape::ix(chunk_shape), buffer)
        .expect("shape and buffer length agree"))
}

/// A chunk-sized, zero-initialized scratch dataset in a file.
///
/// The layout is a fixed header followed by the chunk in row-major order,
/// little endian. The file is exclusive to its owner and is removed on drop,
/// so a crashed run leaves at most one stale spill file per store behind.
#[derive(Debug)]
pub struct FileDataSet<T: Element> {
    file: File,
    path: PathBuf,
    shape: Shape3,
    _element: PhantomData<T>,
}

impl<T: Element> FileDataSet<T> {
    /// Creates a zero-filled dataset of `chunk_shape` under `dir`.
    pub fn create(dir: &Path, chunk_shape: Shape3) -> Result<FileDataSet<T>> {
        let path = dir.join(format!("chunk-{}.rtc", Uuid::new_v4()));
        let mut file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        file.write_all(&MAGIC_NUMBER)?;
        let mut header = [0_u8; 28];
        for (i, extent) in chunk_shape.iter().enumerate() {
            header[i * 8..i * 8 + 8].copy_from_slice(&(*extent as u64).to_le_bytes());
        }
        header[24..28].copy_from_slice(&(T::NBYTES as u32).to_le_bytes());
        file.write_all(&header)?;
        let total: usize = chunk_shape.iter().product();
        file.set_len(HEADER_LEN + (total * T::NBYTES) as u64)?;
        debug!(?path, ?chunk_shape, "created file-backed chunk dataset");
        Ok(FileDataSet {
            file,
            path,
            shape: chunk_shape,
            _element: PhantomData,
        })
    }

    pub fn shape(&self) -> Shape3 {
        self.shape
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_slab(&self, start: Shape3, slab_shape: Shape3) -> Result<()> {
        for d in 0..3 {
            if start[d] + slab_shape[d] > self.shape[d] {
                return Err(ChunkError::SlabOutOfBounds {
                    start,
                    shape: slab_shape,
                    chunk: self.shape,
                });
            }
        }
        Ok(())
    }

    fn row_offset(&self, i0: usize, i1: usize, i2: usize) -> u64 {
        let flat = (i0 * self.shape[1] + i1) * self.shape[2] + i2;
        HEADER_LEN + (flat * T::NBYTES) as u64
    }

    /// Reads a contiguous slab into a freshly allocated array.
    pub fn read_slab(&mut self, start: Shape3, slab_shape: Shape3) -> Result<Array3<T>> {
        self.check_slab(start, slab_shape)?;
        let mut out = Vec::with_capacity(slab_shape.iter().product());
        let mut row = vec![0_u8; slab_shape[2] * T::NBYTES];
        for i0 in 0..slab_shape[0] {
            for i1 in 0..slab_shape[1] {
                let offset = self.row_offset(start[0] + i0, start[1] + i1, start[2]);
                self.file.seek(SeekFrom::Start(offset))?;
                self.file.read_exact(&mut row)?;
                out.extend(row.chunks_exact(T::NBYTES).map(T::read_le));
            }
        }
        Ok(Array3::from_shape_vec(shape::ix(slab_shape), out)
            .expect("slab shape and buffer length agree"))
    }

    /// Writes a slab at the given offset.
    pub fn write_slab(&mut self, start: Shape3, data: ArrayView3<'_, T>) -> Result<()> {
        let slab_shape: Shape3 = [data.shape()[0], data.shape()[1], data.shape()[2]];
        self.check_slab(start, slab_shape)?;
        let mut row = vec![0_u8; slab_shape[2] * T::NBYTES];
        for i0 in 0..slab_shape[0] {
            for i1 in 0..slab_shape[1] {
                for (i2, value) in data.slice(ndarray::s![i0, i1, ..]).iter().enumerate() {
                    value.write_le(&mut row[i2 * T::NBYTES..(i2 + 1) * T::NBYTES]);
                }
                let offset = self.row_offset(start[0] + i0, start[1] + i1, start[2]);
                self.file.seek(SeekFrom::Start(offset))?;
                self.file.write_all(&row)?;
            }
        }
        Ok(())
    }

    /// Flushes and releases the dataset; the backing file is deleted.
    pub fn finalize(self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
        // Drop removes the file
    }
}

impl<T: Element> Drop for FileDataSet<T> {
    fn drop(&mut self) {
        // The temp dir may already be gone when a whole run directory was
        // cleaned up; only delete what is still there.
        if self.path.exists() {
            if let Err(err) = remove_file(&self.path) {
                tracing::warn!(path = ?self.path, %err, "failed to delete chunk spill file");
            }
        }
    }
}

/// A store's chunk buffer with its backing choice applied.
#[derive(Debug)]
pub enum ChunkData<T: Element> {
    Ram(Array3<T>),
    File(FileDataSet<T>),
}

impl<T: Element> ChunkData<T> {
    pub fn shape(&self) -> Shape3 {
        match self {
            ChunkData::Ram(array) => [array.shape()[0], array.shape()[1], array.shape()[2]],
            ChunkData::File(file) => file.shape(),
        }
    }

    pub fn is_file_based(&self) -> bool {
        matches!(self, ChunkData::File(_))
    }

    pub fn read_slab(&mut self, start: Shape3, slab_shape: Shape3) -> Result<Array3<T>> {
        match self {
            ChunkData::Ram(array) => {
                let chunk = [array.shape()[0], array.shape()[1], array.shape()[2]];
                for d in 0..3 {
                    if start[d] + slab_shape[d] > chunk[d] {
                        return Err(ChunkError::SlabOutOfBounds {
                            start,
                            shape: slab_shape,
                            chunk,
                        });
                    }
                }
                Ok(array
                    .slice(ndarray::s![
                        start[0]..start[0] + slab_shape[0],
                        start[1]..start[1] + slab_shape[1],
                        start[2]..start[2] + slab_shape[2]
                    ])
                    .to_owned())
            }
            ChunkData::File(file) => file.read_slab(start, slab_shape),
        }
    }

    pub fn write_slab(&mut self, start: Shape3, data: ArrayView3<'_, T>) -> Result<()> {
        match self {
            ChunkData::Ram(array) => {
                let chunk = [array.shape()[0], array.shape()[1], array.shape()[2]];
                let slab_shape: Shape3 = [data.shape()[0], data.shape()[1], data.shape()[2]];
                for d in 0..3 {
                    if start[d] + slab_shape[d] > chunk[d] {
                        return Err(ChunkError::SlabOutOfBounds {
                            start,
                            shape: slab_shape,
                            chunk,
                        });
                    }
                }
                array
                    .slice_mut(ndarray::s![
                        start[0]..start[0] + slab_shape[0],
                        start[1]..start[1] + slab_shape[1],
                        start[2]..start[2] + slab_shape[2]
                    ])
                    .assign(&data);
                Ok(())
            }
            ChunkData::File(file) => file.write_slab(start, data),
        }
    }

    /// Releases the buffer; file-backed datasets delete their file.
    pub fn finalize(self) -> Result<()> {
        match self {
            ChunkData::Ram(_) => Ok(()),
            ChunkData::File(file) => file.finalize(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;
    use tempfile::TempDir;

    fn arange(shape: (usize, usize, usize)) -> Array3<f32> {
        let len = shape.0 * shape.1 * shape.2;
        Array::from_iter((0..len).map(|v| v as f32))
            .into_shape(shape)
            .unwrap()
    }

    #[test]
    fn file_dataset_roundtrips_slabs() {
        let dir = TempDir::new().unwrap();
        let mut ds: FileDataSet<f32> = FileDataSet::create(dir.path(), [6, 5, 4]).unwrap();
        let data = arange((2, 5, 4));
        ds.write_slab([3, 0, 0], data.view()).unwrap();
        let back = ds.read_slab([3, 0, 0], [2, 5, 4]).unwrap();
        assert_eq!(back, data);
        // untouched region reads as zeros
        let zeros = ds.read_slab([0, 0, 0], [1, 5, 4]).unwrap();
        assert!(zeros.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn file_dataset_removes_file_on_drop() {
        let dir = TempDir::new().unwrap();
        let ds: FileDataSet<f32> = FileDataSet::create(dir.path(), [2, 2, 2]).unwrap();
        let path = ds.path().to_path_buf();
        assert!(path.exists());
        drop(ds);
        assert!(!path.exists());
    }

    #[test]
    fn slab_bounds_are_checked() {
        let dir = TempDir::new().unwrap();
        let mut ds: FileDataSet<f32> = FileDataSet::create(dir.path(), [2, 2, 2]).unwrap();
        assert!(ds.read_slab([1, 0, 0], [2, 2, 2]).is_err());
        let data = arange((1, 2, 2));
        assert!(ds.write_slab([2, 0, 0], data.view()).is_err());
    }

    #[test]
    fn ram_chunk_roundtrips_slabs() {
        let mut chunk = ChunkData::Ram(Array::zeros((4, 3, 3)));
        assert!(!chunk.is_file_based());
        let data = arange((2, 3, 3));
        chunk.write_slab([1, 0, 0], data.view()).unwrap();
        let back = chunk.read_slab([1, 0, 0], [2, 3, 3]).unwrap();
        assert_eq!(back, data);
        assert!(chunk.read_slab([3, 0, 0], [2, 3, 3]).is_err());
    }

    #[test]
    fn try_alloc_ram_zeroes_the_buffer() {
        let array: Array3<f32> = try_alloc_ram([3, 4, 5]).unwrap();
        assert_eq!(array.shape(), &[3, 4, 5]);
        assert!(array.iter().all(|v| *v == 0.0));
    }
}
