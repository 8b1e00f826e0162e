//! rustomo-core provides the data structures shared by every stage of the
//! rustomo pipeline: shape and slicing arithmetic, the element (dtype)
//! abstraction, auxiliary calibration data, blocks, and the RAM/file backed
//! chunk buffers that the data-set stores are built on.
//!
//! Nothing in this crate talks to other processes; the collective operations
//! live in the `rustomo` crate and only move the buffers defined here.
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod auxiliary;
pub mod block;
pub mod chunk;
pub mod element;
pub mod shape;

pub use auxiliary::AuxiliaryData;
pub use block::{BlockError, DataBlock, Device};
pub use chunk::{ChunkData, ChunkError, FileDataSet};
pub use element::Element;
pub use shape::{Dim, Index3, Padding, Shape3, ShapeError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
