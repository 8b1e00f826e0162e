//! The method interface: what the runner knows about the processing steps
//! a user declares.
//!
//! Concrete filters and reconstruction kernels live outside this crate;
//! they plug in through [`MethodWrapper`], which exposes the attributes the
//! sectionizer partitions on, the memory queries the planner walks, and the
//! side-output channel that lets one method feed parameters to the ones
//! after it.

use rustomo_core::{AuxiliaryData, BlockError, DataBlock, Dim, Element, Padding};

use std::collections::HashMap;
use thiserror::Error;

/// The data-access pattern a method requires: which axis blocks are cut
/// along while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// Slices along the angle axis (dim 0).
    Projection,
    /// Slices along the detector-y axis (dim 1).
    Sinogram,
    /// Works either way; resolved to a concrete pattern by the sectionizer.
    All,
}

impl Pattern {
    /// The slicing axis this pattern dictates; `None` for [`Pattern::All`].
    pub fn slicing_dim(self) -> Option<Dim> {
        match self {
            Pattern::Projection => Some(Dim::new(0).expect("0 is a valid dim")),
            Pattern::Sinogram => Some(Dim::new(1).expect("1 is a valid dim")),
            Pattern::All => None,
        }
    }

    /// Two patterns are compatible iff either is `All` or they are equal.
    pub fn compatible(self, other: Pattern) -> bool {
        self == Pattern::All || other == Pattern::All || self == other
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pattern::Projection => write!(f, "projection"),
            Pattern::Sinogram => write!(f, "sinogram"),
            Pattern::All => write!(f, "all"),
        }
    }
}

/// A value a method publishes for the methods downstream.
#[derive(Debug, Clone, PartialEq)]
pub enum SideValue {
    Float(f64),
    Int(i64),
    Text(String),
}

/// Named side outputs, merged into the parameters of every later method.
pub type SideOutputs = HashMap<String, SideValue>;

#[derive(Error, Debug)]
pub enum MethodError {
    #[error("method {method} failed: {message}")]
    Execution { method: String, message: String },
    #[error(transparent)]
    Block(#[from] BlockError),
}

pub type Result<T> = std::result::Result<T, MethodError>;

/// A pipeline step as seen by the sectionizer, planner and runner.
pub trait MethodWrapper<T: Element>: Send {
    fn method_name(&self) -> &str;

    fn module_path(&self) -> &str {
        ""
    }

    fn package_name(&self) -> &str {
        "rustomo"
    }

    fn pattern(&self) -> Pattern;

    /// Called once sectionization has resolved `All` patterns; wrappers keep
    /// the stamped pattern so `execute` knows its slicing axis.
    fn set_pattern(&mut self, pattern: Pattern) {
        let _ = pattern;
    }

    fn is_gpu(&self) -> bool {
        false
    }

    fn save_result(&self) -> bool {
        false
    }

    /// Needs every block of the volume to have passed through before it can
    /// run; forces a section boundary and a cross-rank barrier.
    fn glob_stats(&self) -> bool {
        false
    }

    fn output_dims_change(&self) -> bool {
        false
    }

    /// Halo slices this method needs around each block.
    fn padding(&self) -> Padding {
        (0, 0)
    }

    /// Runs the method over one block, in place or replacing the buffer.
    fn execute(&mut self, block: DataBlock<T>) -> Result<DataBlock<T>>;

    /// Output extents in the non-slicing dims, for shape-changing methods.
    fn calculate_output_dims(&self, non_slice_shape: (usize, usize)) -> (usize, usize) {
        non_slice_shape
    }

    /// Given the dtype (fixed by `T`), the non-slicing extents and the
    /// remaining device memory, reports the largest block length this method
    /// can process and the bytes still live once it has run.
    fn calculate_max_slices(
        &self,
        non_slice_shape: (usize, usize),
        available_bytes: u64,
        aux: &AuxiliaryData<T>,
    ) -> (usize, u64) {
        let _ = (non_slice_shape, aux);
        (usize::MAX, available_bytes)
    }

    /// Values to merge into the parameters of every method after this one.
    fn get_side_output(&self) -> SideOutputs {
        SideOutputs::new()
    }

    /// Late binding of upstream side outputs into this method's parameters.
    fn append_side_inputs(&mut self, side: &SideOutputs) {
        let _ = side;
    }
}
