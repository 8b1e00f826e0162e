//! Ingestion: turning a raw acquisition file into blocks.
//!
//! The loader resolves a preview (crop) against the raw dataset, filters
//! projection frames through the optional image key, splits the retained
//! extent across ranks along the slicing axis, and then serves blocks
//! straight out of the file. Raw container access is abstracted behind
//! [`RawImageFile`], with an in-memory implementation for tests and a flat
//! binary container for files on disk.

pub mod flatfile;
pub mod mem;

use crate::comm::Communicator;
use crate::store::{DataSetSource, Result as StoreResult, StoreError};
use rustomo_core::{
    shape, AuxiliaryData, BlockError, DataBlock, Dim, Element, Index3, Padding, Shape3,
    ShapeError,
};

use ndarray::{Array1, Array3, Axis, Slice};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error(
        "preview indices in {dim} dim exceed bounds of data: start={start}, stop={stop}, \
         dataset length={len}"
    )]
    PreviewOutOfBounds {
        dim: &'static str,
        start: usize,
        stop: usize,
        len: usize,
    },
    #[error(
        "preview index error for {dim}: start must be strictly smaller than stop, \
         but start={start}, stop={stop}"
    )]
    PreviewEmpty {
        dim: &'static str,
        start: usize,
        stop: usize,
    },
    #[error("no projection frames remain after applying the image key to the preview")]
    NoProjections,
    #[error("only slicing dimension 0 is supported at ingestion, got {0}")]
    UnsupportedSlicingDim(Dim),
    #[error("dataset {0:?} not found in the raw container")]
    MissingDataset(String),
    #[error("raw container failed validation: {0}")]
    Container(String),
    #[error("container header codec error")]
    Codec(#[from] bincode::Error),
    #[error("I/O error reading raw data")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Shape(#[from] ShapeError),
    #[error(transparent)]
    Block(#[from] BlockError),
}

pub type Result<T> = std::result::Result<T, LoaderError>;

/// Read access to a raw acquisition container.
///
/// Datasets are addressed by path; the volume datasets are 3-D with axes
/// `(frames, detector_y, detector_x)`, image keys and angles are 1-D over
/// the frame axis.
pub trait RawImageFile<T: Element>: std::fmt::Debug + Send {
    fn dataset_shape(&self, data_path: &str) -> Result<Shape3>;
    fn read_slab(&mut self, data_path: &str, start: Shape3, slab_shape: Shape3)
        -> Result<Array3<T>>;
    fn read_image_key(&mut self, key_path: &str) -> Result<Vec<i32>>;
    fn read_angles(&mut self, angles_path: &str) -> Result<Vec<f32>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewDim {
    pub start: usize,
    pub stop: usize,
}

/// Crop rectangle applied to the raw dataset on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewConfig {
    pub angles: PreviewDim,
    pub detector_y: PreviewDim,
    pub detector_x: PreviewDim,
}

impl PreviewConfig {
    /// The whole dataset, no cropping.
    pub fn full(data_shape: Shape3) -> Self {
        PreviewConfig {
            angles: PreviewDim { start: 0, stop: data_shape[0] },
            detector_y: PreviewDim { start: 0, stop: data_shape[1] },
            detector_x: PreviewDim { start: 0, stop: data_shape[2] },
        }
    }

    fn dims(&self) -> [(&'static str, PreviewDim); 3] {
        [
            ("angles", self.angles),
            ("detector_y", self.detector_y),
            ("detector_x", self.detector_x),
        ]
    }
}

/// Where the projection angles come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AnglesConfig {
    /// A 1-D dataset inside the raw container.
    Raw { data_path: String },
    /// Synthesized as a linear ramp over `[start_angle, stop_angle]`.
    UserDefined {
        start_angle: f32,
        stop_angle: f32,
        angles_total: usize,
    },
}

/// Locates darks or flats inside a raw container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DarksFlatsConfig {
    pub data_path: String,
    /// Frame-type key: 0 = projection, 1 = flat, 2 = dark. Without a key
    /// every frame of the dataset is taken.
    pub image_key_path: Option<String>,
}

/// Loader parameters, everything except the container handles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoaderConfig {
    pub data_path: String,
    pub image_key_path: Option<String>,
    pub angles: AnglesConfig,
    /// `None` previews the whole dataset.
    pub preview: Option<PreviewConfig>,
}

/// A preview checked against the dataset and narrowed to the frames the
/// image key retains.
#[derive(Debug, Clone)]
pub struct ResolvedPreview {
    pub config: PreviewConfig,
    /// Raw frame indices retained, in ascending order.
    pub frame_indices: Vec<usize>,
    pub global_shape: Shape3,
}

/// Validates the preview against the dataset extent and intersects its
/// angle range with the image key's projection frames. If the intersection
/// is a strict subset, the angle preview is narrowed to its hull.
pub fn resolve_preview(
    mut config: PreviewConfig,
    data_shape: Shape3,
    image_key: Option<&[i32]>,
) -> Result<ResolvedPreview> {
    for (d, (name, dim)) in config.dims().iter().copied().enumerate() {
        if dim.stop > data_shape[d] {
            return Err(LoaderError::PreviewOutOfBounds {
                dim: name,
                start: dim.start,
                stop: dim.stop,
                len: data_shape[d],
            });
        }
        if dim.start >= dim.stop {
            return Err(LoaderError::PreviewEmpty {
                dim: name,
                start: dim.start,
                stop: dim.stop,
            });
        }
    }

    let requested: Vec<usize> = (config.angles.start..config.angles.stop).collect();
    let frame_indices: Vec<usize> = match image_key {
        Some(key) => requested
            .iter()
            .copied()
            .filter(|i| key.get(*i) == Some(&0))
            .collect(),
        None => requested.clone(),
    };
    if frame_indices.is_empty() {
        return Err(LoaderError::NoProjections);
    }
    if frame_indices.len() != requested.len() {
        config.angles = PreviewDim {
            start: frame_indices[0],
            stop: frame_indices[frame_indices.len() - 1] + 1,
        };
        debug!(
            start = config.angles.start,
            stop = config.angles.stop,
            "narrowed angles preview to the image-key intersection"
        );
    }

    let global_shape = [
        frame_indices.len(),
        config.detector_y.stop - config.detector_y.start,
        config.detector_x.stop - config.detector_x.start,
    ];
    Ok(ResolvedPreview {
        config,
        frame_indices,
        global_shape,
    })
}

/// Reads the darks (`kind = 2`) or flats (`kind = 1`) frames, cropped to
/// the detector preview.
pub fn read_calibration<T: Element>(
    raw: &mut dyn RawImageFile<T>,
    config: &DarksFlatsConfig,
    kind: i32,
    preview: &PreviewConfig,
) -> Result<Array3<T>> {
    let data_shape = raw.dataset_shape(&config.data_path)?;
    let indices: Vec<usize> = match &config.image_key_path {
        Some(path) => raw
            .read_image_key(path)?
            .iter()
            .enumerate()
            .filter(|(_, v)| **v == kind)
            .map(|(i, _)| i)
            .collect(),
        None => (0..data_shape[0]).collect(),
    };
    let ny = preview.detector_y.stop - preview.detector_y.start;
    let nx = preview.detector_x.stop - preview.detector_x.start;
    let mut out = Array3::from_elem((indices.len(), ny, nx), T::default());
    for (row, frame) in indices.iter().enumerate() {
        let slab = raw.read_slab(
            &config.data_path,
            [*frame, preview.detector_y.start, preview.detector_x.start],
            [1, ny, nx],
        )?;
        out.slice_axis_mut(Axis(0), Slice::from(row..row + 1)).assign(&slab);
    }
    Ok(out)
}

fn resolve_angles<T: Element>(
    raw: &mut dyn RawImageFile<T>,
    config: &AnglesConfig,
    frame_indices: &[usize],
) -> Result<Array1<f32>> {
    match config {
        AnglesConfig::Raw { data_path } => {
            let all = raw.read_angles(data_path)?;
            let mut out = Vec::with_capacity(frame_indices.len());
            for i in frame_indices {
                out.push(*all.get(*i).ok_or_else(|| {
                    LoaderError::Container(format!(
                        "angles dataset {:?} has {} entries, frame {} requested",
                        data_path,
                        all.len(),
                        i
                    ))
                })?);
            }
            Ok(Array1::from(out))
        }
        AnglesConfig::UserDefined {
            start_angle,
            stop_angle,
            angles_total,
        } => Ok(linspace(*start_angle, *stop_angle, *angles_total)),
    }
}

/// Evenly spaced values over `[start, stop]`, endpoint included.
fn linspace(start: f32, stop: f32, total: usize) -> Array1<f32> {
    if total < 2 {
        return Array1::from(vec![start; total]);
    }
    let step = (stop - start) / (total - 1) as f32;
    Array1::from_iter((0..total).map(|i| start + step * i as f32))
}

/// Serves blocks of the previewed, rank-split dataset directly from the raw
/// container.
///
/// Ingestion always slices along dim 0 (the frame axis); a pipeline whose
/// first section needs another pattern gets there through a store reslice,
/// driven by the runner. Halo slices requested past the chunk bounds are
/// read straight from the file when the neighbouring rank owns them, or
/// edge-extrapolated at the global boundary.
pub struct StandardLoader<T: Element> {
    raw: Box<dyn RawImageFile<T>>,
    data_path: String,
    preview: ResolvedPreview,
    slicing_dim: Dim,
    padding: Padding,
    aux: Arc<AuxiliaryData<T>>,
    chunk_start: usize,
    chunk_len: usize,
}

impl<T: Element> std::fmt::Debug for StandardLoader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StandardLoader")
            .field("data_path", &self.data_path)
            .field("global_shape", &self.preview.global_shape)
            .field("chunk_start", &self.chunk_start)
            .field("chunk_len", &self.chunk_len)
            .finish()
    }
}

/// Darks or flats input: a config plus, when they live in a separate file,
/// their own container.
pub struct CalibrationInput<T: Element> {
    pub source: Option<Box<dyn RawImageFile<T>>>,
    pub config: DarksFlatsConfig,
}

impl<T: Element> StandardLoader<T> {
    /// Opens the dataset, resolves the preview and claims this rank's chunk.
    #[instrument(skip(raw, darks, flats, comm), fields(rank = comm.rank(), size = comm.size()))]
    pub fn new(
        mut raw: Box<dyn RawImageFile<T>>,
        config: LoaderConfig,
        darks: Option<CalibrationInput<T>>,
        flats: Option<CalibrationInput<T>>,
        slicing_dim: Dim,
        padding: Padding,
        comm: &dyn Communicator,
    ) -> Result<Self> {
        if slicing_dim.index() != 0 {
            return Err(LoaderError::UnsupportedSlicingDim(slicing_dim));
        }
        let data_shape = raw.dataset_shape(&config.data_path)?;
        let image_key = match &config.image_key_path {
            Some(path) => Some(raw.read_image_key(path)?),
            None => None,
        };
        let preview_config = config
            .preview
            .unwrap_or_else(|| PreviewConfig::full(data_shape));
        let preview = resolve_preview(preview_config, data_shape, image_key.as_deref())?;

        let angles = resolve_angles(raw.as_mut(), &config.angles, &preview.frame_indices)?;
        let darks_arr = match darks {
            Some(mut input) => Some(match input.source.as_mut() {
                Some(separate) => {
                    read_calibration(separate.as_mut(), &input.config, 2, &preview.config)?
                }
                None => read_calibration(raw.as_mut(), &input.config, 2, &preview.config)?,
            }),
            None => None,
        };
        let flats_arr = match flats {
            Some(mut input) => Some(match input.source.as_mut() {
                Some(separate) => {
                    read_calibration(separate.as_mut(), &input.config, 1, &preview.config)?
                }
                None => read_calibration(raw.as_mut(), &input.config, 1, &preview.config)?,
            }),
            None => None,
        };
        let aux = match (darks_arr, flats_arr) {
            (Some(darks), Some(flats)) => AuxiliaryData::with_darks_flats(angles, darks, flats),
            _ => AuxiliaryData::new(angles),
        };

        let retained = preview.frame_indices.len();
        let chunk_start = shape::split_start(retained, comm.size(), comm.rank());
        let chunk_len = shape::split_len(retained, comm.size(), comm.rank());
        info!(
            global_shape = ?preview.global_shape,
            chunk_start,
            chunk_len,
            dtype = T::DTYPE,
            "loader ready"
        );
        Ok(StandardLoader {
            raw,
            data_path: config.data_path,
            preview,
            slicing_dim,
            padding,
            aux: Arc::new(aux),
            chunk_start,
            chunk_len,
        })
    }

    pub fn dtype(&self) -> &'static str {
        T::DTYPE
    }

    pub fn angles_total(&self) -> usize {
        self.preview.global_shape[0]
    }

    pub fn detector_y(&self) -> usize {
        self.preview.global_shape[1]
    }

    pub fn detector_x(&self) -> usize {
        self.preview.global_shape[2]
    }

    /// Raw frame index serving previewed row `g`, clamped to the global
    /// extent so out-of-volume halo rows repeat the edge frame.
    fn frame_for_row(&self, g: isize) -> usize {
        let max = self.preview.frame_indices.len() as isize - 1;
        self.preview.frame_indices[g.clamp(0, max) as usize]
    }
}

impl<T: Element> DataSetSource<T> for StandardLoader<T> {
    fn global_shape(&self) -> Shape3 {
        self.preview.global_shape
    }

    fn chunk_shape(&self) -> Shape3 {
        let (pad_before, pad_after) = self.padding;
        shape::with_dim(
            self.preview.global_shape,
            self.slicing_dim,
            self.chunk_len + pad_before + pad_after,
        )
    }

    fn global_index(&self) -> Index3 {
        let mut index = [0_isize; 3];
        index[self.slicing_dim.index()] =
            self.chunk_start as isize - self.padding.0 as isize;
        index
    }

    fn slicing_dim(&self) -> Dim {
        self.slicing_dim
    }

    fn padding(&self) -> Padding {
        self.padding
    }

    fn aux(&self) -> Arc<AuxiliaryData<T>> {
        Arc::clone(&self.aux)
    }

    #[instrument(skip(self))]
    fn read_block(&mut self, block_start: usize, length: usize) -> StoreResult<DataBlock<T>> {
        shape::check_block_range(block_start as isize, length, self.chunk_len, (0, 0))?;
        let (pad_before, pad_after) = self.padding;
        let dy = self.preview.config.detector_y;
        let dx = self.preview.config.detector_x;
        let (ny, nx) = (dy.stop - dy.start, dx.stop - dx.start);
        let rows = length + pad_before + pad_after;

        let mut data = Array3::from_elem((rows, ny, nx), T::default());
        // Coalesce consecutive raw frames into single slab reads.
        let frames: Vec<usize> = (0..rows)
            .map(|j| {
                let g = self.chunk_start as isize + block_start as isize + j as isize
                    - pad_before as isize;
                self.frame_for_row(g)
            })
            .collect();
        let mut row = 0;
        while row < rows {
            let mut run = 1;
            while row + run < rows && frames[row + run] == frames[row + run - 1] + 1 {
                run += 1;
            }
            let slab = self
                .raw
                .read_slab(
                    &self.data_path,
                    [frames[row], dy.start, dx.start],
                    [run, ny, nx],
                )
                .map_err(StoreError::from)?;
            data.slice_axis_mut(Axis(0), Slice::from(row..row + run)).assign(&slab);
            row += run;
        }

        let block = DataBlock::with_padding(
            data,
            Arc::clone(&self.aux),
            self.slicing_dim,
            block_start,
            self.chunk_start as isize - pad_before as isize,
            self.preview.global_shape,
            self.chunk_shape(),
            self.padding,
        )
        .map_err(StoreError::from)?;
        Ok(block)
    }
}
