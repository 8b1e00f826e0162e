//! Intermediate persistence: the sink the runner hands section output to
//! when a method asked for its result to be saved.
//!
//! The store never coordinates writes across ranks; everything that would
//! need to be collective (file layout, compression) is owned by the sink.
//! The provided implementation shards by rank: each rank appends records
//! to its own container file, so compressed writes need no cross-rank
//! negotiation and the layout stays deterministic for a given input and
//! rank count.

use crate::config::RunConfig;
use rustomo_core::{shape, Dim, Element, Shape3};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::{Array3, ArrayView1, ArrayView3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument, warn};

/// Magic number for rustomo intermediate containers.
const MAGIC_NUMBER: [u8; 8] = *b"RUSTOMOI";

#[derive(Error, Debug)]
pub enum PersistError {
    #[error("I/O error writing intermediate data")]
    Io(#[from] std::io::Error),
    #[error("intermediate container codec error")]
    Codec(#[from] bincode::Error),
    #[error("intermediate container failed validation: {0}")]
    Container(String),
}

pub type Result<T> = std::result::Result<T, PersistError>;

/// Chunk shape for persisted datasets: the global extent in the non-slicing
/// dims and `frames_per_chunk` along the slicing dim, falling back to 1
/// when `frames_per_chunk` exceeds the data's slicing extent.
pub fn intermediate_chunk_shape(
    global_shape: Shape3,
    slicing_dim: Dim,
    data_len: usize,
    frames_per_chunk: usize,
) -> Shape3 {
    let frames = if frames_per_chunk > data_len {
        warn!(
            frames_per_chunk,
            data_len, "frames_per_chunk exceeds the slicing extent, falling back to 1"
        );
        1
    } else {
        frames_per_chunk.max(1)
    };
    shape::with_dim(global_shape, slicing_dim, frames)
}

/// Where the runner sends section output flagged for persistence.
pub trait IntermediateSink<T: Element>: std::fmt::Debug + Send {
    /// Saves one slab of the (eventual) global dataset at `path`. The
    /// caller guarantees `global_index` and `global_shape` are consistent
    /// with the store the slab came from.
    #[allow(clippy::too_many_arguments)]
    fn save(
        &mut self,
        data: ArrayView3<'_, T>,
        global_shape: Shape3,
        global_index: Shape3,
        slicing_dim: Dim,
        path: &str,
        angles: ArrayView1<'_, f32>,
        detector_y: usize,
        detector_x: usize,
        frames_per_chunk: usize,
    ) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ContainerHeader {
    dtype: String,
    rank: usize,
    detector_y: u64,
    detector_x: u64,
    angles: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordMeta {
    global_shape: [u64; 3],
    global_index: [u64; 3],
    data_shape: [u64; 3],
    slicing_dim: u8,
    chunk_shape: [u64; 3],
    compressed: bool,
    payload_len: u64,
}

fn to_u64x3(shape: Shape3) -> [u64; 3] {
    [shape[0] as u64, shape[1] as u64, shape[2] as u64]
}

fn sanitize(path: &str) -> String {
    path.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// Per-rank intermediate container writer.
///
/// Each dataset path gets one file per rank under the run output directory,
/// holding a header (angles, detector dims) followed by appended records.
#[derive(Debug)]
pub struct FlatIntermediateWriter<T: Element> {
    out_dir: PathBuf,
    rank: usize,
    compress: bool,
    files: HashMap<String, BufWriter<File>>,
    _element: std::marker::PhantomData<T>,
}

impl<T: Element> FlatIntermediateWriter<T> {
    pub fn new(config: &RunConfig, rank: usize) -> Self {
        FlatIntermediateWriter {
            out_dir: config.run_out_dir.clone(),
            rank,
            compress: config.compress_intermediate,
            files: HashMap::new(),
            _element: std::marker::PhantomData,
        }
    }

    pub fn file_name(&self, path: &str) -> PathBuf {
        self.out_dir
            .join(format!("{}-r{}.rti", sanitize(path), self.rank))
    }

    fn open(
        &mut self,
        path: &str,
        angles: ArrayView1<'_, f32>,
        detector_y: usize,
        detector_x: usize,
    ) -> Result<&mut BufWriter<File>> {
        if !self.files.contains_key(path) {
            let file_name = self.file_name(path);
            let file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&file_name)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&MAGIC_NUMBER)?;
            let header = ContainerHeader {
                dtype: T::DTYPE.to_string(),
                rank: self.rank,
                detector_y: detector_y as u64,
                detector_x: detector_x as u64,
                angles: angles.to_vec(),
            };
            let bytes = bincode::serialize(&header)?;
            writer.write_u64::<LittleEndian>(bytes.len() as u64)?;
            writer.write_all(&bytes)?;
            debug!(?file_name, "created intermediate container");
            self.files.insert(path.to_string(), writer);
        }
        Ok(self.files.get_mut(path).expect("inserted above"))
    }

    /// Flushes every open container.
    pub fn flush(&mut self) -> Result<()> {
        for writer in self.files.values_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl<T: Element> Drop for FlatIntermediateWriter<T> {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(%err, "failed to flush intermediate containers");
        }
    }
}

impl<T: Element> IntermediateSink<T> for FlatIntermediateWriter<T> {
    #[instrument(skip(self, data, angles))]
    fn save(
        &mut self,
        data: ArrayView3<'_, T>,
        global_shape: Shape3,
        global_index: Shape3,
        slicing_dim: Dim,
        path: &str,
        angles: ArrayView1<'_, f32>,
        detector_y: usize,
        detector_x: usize,
        frames_per_chunk: usize,
    ) -> Result<()> {
        let data_shape: Shape3 = [data.shape()[0], data.shape()[1], data.shape()[2]];
        let chunk_shape = intermediate_chunk_shape(
            global_shape,
            slicing_dim,
            data_shape[slicing_dim.index()],
            frames_per_chunk,
        );

        let mut raw = Vec::with_capacity(data.len() * T::NBYTES);
        let mut buf = vec![0_u8; T::NBYTES];
        for value in data.iter() {
            value.write_le(&mut buf);
            raw.extend_from_slice(&buf);
        }
        let (payload, compressed) = if self.compress {
            (zstd::encode_all(raw.as_slice(), 0)?, true)
        } else {
            (raw, false)
        };

        let meta = RecordMeta {
            global_shape: to_u64x3(global_shape),
            global_index: to_u64x3(global_index),
            data_shape: to_u64x3(data_shape),
            slicing_dim: slicing_dim.index() as u8,
            chunk_shape: to_u64x3(chunk_shape),
            compressed,
            payload_len: payload.len() as u64,
        };
        let meta_bytes = bincode::serialize(&meta)?;
        let compress = self.compress;
        let writer = self.open(path, angles, detector_y, detector_x)?;
        writer.write_u64::<LittleEndian>(meta_bytes.len() as u64)?;
        writer.write_all(&meta_bytes)?;
        writer.write_all(&payload)?;
        debug!(
            path,
            compressed = compress,
            bytes = payload.len(),
            "saved intermediate slab"
        );
        Ok(())
    }
}

/// One slab read back from an intermediate container.
#[derive(Debug)]
pub struct SavedSlab<T: Element> {
    pub global_shape: Shape3,
    pub global_index: Shape3,
    pub chunk_shape: Shape3,
    pub slicing_dim: u8,
    pub data: Array3<T>,
}

/// Reads an intermediate container back, for verification and downstream
/// tooling.
pub fn read_intermediate<T: Element>(
    file_name: &Path,
) -> Result<(Vec<f32>, Vec<SavedSlab<T>>)> {
    let mut file = File::open(file_name)?;
    let mut magic = [0_u8; 8];
    file.read_exact(&mut magic)?;
    if magic != MAGIC_NUMBER {
        return Err(PersistError::Container(format!(
            "{} is not a rustomo intermediate container",
            file_name.display()
        )));
    }
    let header_len = file.read_u64::<LittleEndian>()?;
    let mut header_bytes = vec![0_u8; header_len as usize];
    file.read_exact(&mut header_bytes)?;
    let header: ContainerHeader = bincode::deserialize(&header_bytes)?;
    if header.dtype != T::DTYPE {
        return Err(PersistError::Container(format!(
            "container holds {} data, {} requested",
            header.dtype,
            T::DTYPE
        )));
    }

    let end = file.seek(SeekFrom::End(0))?;
    file.seek(SeekFrom::Start(8 + 8 + header_len))?;
    let mut slabs = Vec::new();
    let mut position = 8 + 8 + header_len;
    while position < end {
        let meta_len = file.read_u64::<LittleEndian>()?;
        let mut meta_bytes = vec![0_u8; meta_len as usize];
        file.read_exact(&mut meta_bytes)?;
        let meta: RecordMeta = bincode::deserialize(&meta_bytes)?;
        let mut payload = vec![0_u8; meta.payload_len as usize];
        file.read_exact(&mut payload)?;
        let raw = if meta.compressed {
            zstd::decode_all(payload.as_slice())?
        } else {
            payload
        };
        let elements: Vec<T> = raw.chunks_exact(T::NBYTES).map(T::read_le).collect();
        let data_shape = [
            meta.data_shape[0] as usize,
            meta.data_shape[1] as usize,
            meta.data_shape[2] as usize,
        ];
        let data = Array3::from_shape_vec(shape::ix(data_shape), elements)
            .map_err(|e| PersistError::Container(e.to_string()))?;
        slabs.push(SavedSlab {
            global_shape: [
                meta.global_shape[0] as usize,
                meta.global_shape[1] as usize,
                meta.global_shape[2] as usize,
            ],
            global_index: [
                meta.global_index[0] as usize,
                meta.global_index[1] as usize,
                meta.global_index[2] as usize,
            ],
            chunk_shape: [
                meta.chunk_shape[0] as usize,
                meta.chunk_shape[1] as usize,
                meta.chunk_shape[2] as usize,
            ],
            slicing_dim: meta.slicing_dim,
            data,
        });
        position += 8 + meta_len + meta.payload_len;
    }
    Ok((header.angles, slabs))
}
