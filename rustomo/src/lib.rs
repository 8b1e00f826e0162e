//! rustomo is the execution substrate of a distributed, block-streaming
//! tomographic reconstruction pipeline.
//!
//! A run decomposes the 3-D volume across ranks into chunks, cuts the
//! declared method pipeline into sections that share a slicing pattern and
//! a platform, and streams fixed-length blocks of each chunk through the
//! sections. Between sections the data lives in a process-local store that
//! can spill to disk, serve halo-padded blocks, and reslice the distributed
//! volume onto another axis when consecutive sections disagree on pattern.
//!
//! Concrete processing methods are external collaborators: they plug in
//! through [`method::MethodWrapper`], and the persistence of user-visible
//! intermediates goes through [`persist::IntermediateSink`].
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod comm;
pub mod config;
pub mod loader;
pub mod method;
pub mod persist;
pub mod planner;
pub mod reslice;
pub mod runner;
pub mod section;
pub mod stats;
pub mod store;

pub use comm::{CommError, Communicator};
pub use config::RunConfig;
pub use loader::{LoaderConfig, LoaderError, StandardLoader};
pub use method::{MethodError, MethodWrapper, Pattern, SideOutputs, SideValue};
pub use runner::{PipelineError, RunOutcome, RunReport, Runner};
pub use section::{sectionize, Pipeline, Section, SectionedPipeline};
pub use store::{DataSetSink, DataSetSource, StoreError};

pub use rustomo_core::{
    AuxiliaryData, DataBlock, Device, Dim, Element, Index3, Padding, Shape3,
};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
