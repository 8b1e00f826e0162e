//! Flat binary raw container.
//!
//! A minimal on-disk format for acquisition data: a magic number, the
//! datasets back to back in row-major little endian, and a bincode header
//! at the tail describing them (a trailing header lets the writer stream
//! datasets without knowing their count up front). One volume dtype per
//! container; image keys are i32 and angles f32 regardless of the volume
//! dtype.

use super::{LoaderError, RawImageFile, Result};
use rustomo_core::{Element, Shape3};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic number for rustomo flat raw containers.
const MAGIC_NUMBER: [u8; 8] = *b"RUSTOMOF";
const FORMAT_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum DatasetKind {
    Volume,
    ImageKey,
    Angles,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DatasetEntry {
    name: String,
    kind: DatasetKind,
    shape: Vec<u64>,
    offset: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FlatHeader {
    version: u16,
    dtype: String,
    entries: Vec<DatasetEntry>,
}

/// Streams datasets into a new flat container.
#[derive(Debug)]
pub struct RawFlatFileWriter<T: Element> {
    file: BufWriter<File>,
    offset: u64,
    entries: Vec<DatasetEntry>,
    _element: std::marker::PhantomData<T>,
}

impl<T: Element> RawFlatFileWriter<T> {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)?;
        let mut file = BufWriter::new(file);
        file.write_all(&MAGIC_NUMBER)?;
        Ok(RawFlatFileWriter {
            file,
            offset: MAGIC_NUMBER.len() as u64,
            entries: Vec::new(),
            _element: std::marker::PhantomData,
        })
    }

    pub fn add_volume(&mut self, name: impl Into<String>, data: ndarray::ArrayView3<'_, T>) -> Result<()> {
        let shape = data.shape().iter().map(|v| *v as u64).collect();
        self.entries.push(DatasetEntry {
            name: name.into(),
            kind: DatasetKind::Volume,
            shape,
            offset: self.offset,
        });
        let mut buf = vec![0_u8; T::NBYTES];
        for value in data.iter() {
            value.write_le(&mut buf);
            self.file.write_all(&buf)?;
        }
        self.offset += (data.len() * T::NBYTES) as u64;
        Ok(())
    }

    pub fn add_image_key(&mut self, name: impl Into<String>, key: &[i32]) -> Result<()> {
        self.entries.push(DatasetEntry {
            name: name.into(),
            kind: DatasetKind::ImageKey,
            shape: vec![key.len() as u64],
            offset: self.offset,
        });
        for value in key {
            self.file.write_i32::<LittleEndian>(*value)?;
        }
        self.offset += (key.len() * 4) as u64;
        Ok(())
    }

    pub fn add_angles(&mut self, name: impl Into<String>, angles: &[f32]) -> Result<()> {
        self.entries.push(DatasetEntry {
            name: name.into(),
            kind: DatasetKind::Angles,
            shape: vec![angles.len() as u64],
            offset: self.offset,
        });
        for value in angles {
            self.file.write_f32::<LittleEndian>(*value)?;
        }
        self.offset += (angles.len() * 4) as u64;
        Ok(())
    }

    /// Writes the trailing header and flushes the container.
    pub fn finish(mut self) -> Result<()> {
        let header = FlatHeader {
            version: FORMAT_VERSION,
            dtype: T::DTYPE.to_string(),
            entries: std::mem::take(&mut self.entries),
        };
        let bytes = bincode::serialize(&header)?;
        self.file.write_all(&bytes)?;
        self.file.write_u64::<LittleEndian>(bytes.len() as u64)?;
        self.file.flush()?;
        Ok(())
    }
}

/// Read access to a flat container.
#[derive(Debug)]
pub struct RawFlatFile<T: Element> {
    file: File,
    path: PathBuf,
    header: FlatHeader,
    _element: std::marker::PhantomData<T>,
}

impl<T: Element> RawFlatFile<T> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = File::open(&path)?;
        let mut magic = [0_u8; 8];
        file.read_exact(&mut magic)?;
        if magic != MAGIC_NUMBER {
            return Err(LoaderError::Container(format!(
                "{} is not a rustomo raw container (bad magic number)",
                path.display()
            )));
        }
        file.seek(SeekFrom::End(-8))?;
        let header_len = file.read_u64::<LittleEndian>()?;
        file.seek(SeekFrom::End(-8 - header_len as i64))?;
        let mut bytes = vec![0_u8; header_len as usize];
        file.read_exact(&mut bytes)?;
        let header: FlatHeader = bincode::deserialize(&bytes)?;
        if header.version != FORMAT_VERSION {
            return Err(LoaderError::Container(format!(
                "unsupported container version {}",
                header.version
            )));
        }
        if header.dtype != T::DTYPE {
            return Err(LoaderError::Container(format!(
                "container holds {} volumes, {} requested",
                header.dtype,
                T::DTYPE
            )));
        }
        Ok(RawFlatFile {
            file,
            path,
            header,
            _element: std::marker::PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn entry(&self, name: &str, kind: DatasetKind) -> Result<&DatasetEntry> {
        self.header
            .entries
            .iter()
            .find(|e| e.name == name && e.kind == kind)
            .ok_or_else(|| LoaderError::MissingDataset(name.to_string()))
    }
}

impl<T: Element> RawImageFile<T> for RawFlatFile<T> {
    fn dataset_shape(&self, data_path: &str) -> Result<Shape3> {
        let entry = self.entry(data_path, DatasetKind::Volume)?;
        Ok([
            entry.shape[0] as usize,
            entry.shape[1] as usize,
            entry.shape[2] as usize,
        ])
    }

    fn read_slab(
        &mut self,
        data_path: &str,
        start: Shape3,
        slab_shape: Shape3,
    ) -> Result<Array3<T>> {
        let entry = self.entry(data_path, DatasetKind::Volume)?;
        let extent = [
            entry.shape[0] as usize,
            entry.shape[1] as usize,
            entry.shape[2] as usize,
        ];
        for d in 0..3 {
            if start[d] + slab_shape[d] > extent[d] {
                return Err(LoaderError::Container(format!(
                    "slab at {:?} with shape {:?} exceeds dataset {:?} of shape {:?}",
                    start, slab_shape, data_path, extent
                )));
            }
        }
        let base = entry.offset;
        let mut out = Vec::with_capacity(slab_shape.iter().product());
        let mut row = vec![0_u8; slab_shape[2] * T::NBYTES];
        for i0 in 0..slab_shape[0] {
            for i1 in 0..slab_shape[1] {
                let flat =
                    ((start[0] + i0) * extent[1] + start[1] + i1) * extent[2] + start[2];
                self.file
                    .seek(SeekFrom::Start(base + (flat * T::NBYTES) as u64))?;
                self.file.read_exact(&mut row)?;
                out.extend(row.chunks_exact(T::NBYTES).map(T::read_le));
            }
        }
        Ok(Array3::from_shape_vec(
            (slab_shape[0], slab_shape[1], slab_shape[2]),
            out,
        )
        .expect("slab shape and element count agree"))
    }

    fn read_image_key(&mut self, key_path: &str) -> Result<Vec<i32>> {
        let entry = self.entry(key_path, DatasetKind::ImageKey)?;
        let count = entry.shape[0] as usize;
        let offset = entry.offset;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.file.read_i32::<LittleEndian>()?);
        }
        Ok(out)
    }

    fn read_angles(&mut self, angles_path: &str) -> Result<Vec<f32>> {
        let entry = self.entry(angles_path, DatasetKind::Angles)?;
        let count = entry.shape[0] as usize;
        let offset = entry.offset;
        self.file.seek(SeekFrom::Start(offset))?;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(self.file.read_f32::<LittleEndian>()?);
        }
        Ok(out)
    }
}
