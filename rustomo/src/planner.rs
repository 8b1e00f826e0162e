//! Block-length planning: the largest block a section can stream through
//! device memory.
//!
//! The policy is conservative. Methods are queried in order; each reports
//! the largest block it could process within the remaining budget and how
//! many bytes stay live after it runs, and the section takes the minimum.
//! CPU-only sections skip the walk and use the configured cap.

use crate::config::RunConfig;
use crate::section::Section;
use rustomo_core::{AuxiliaryData, Element};

use tracing::debug;

/// Largest block length (in slices along the section's axis) the section
/// can execute, bounded by the chunk length.
pub fn max_slices_for_section<T: Element>(
    section: &Section<T>,
    non_slice_shape: (usize, usize),
    chunk_len: usize,
    aux: &AuxiliaryData<T>,
    config: &RunConfig,
) -> usize {
    if chunk_len == 0 {
        return 1;
    }
    let gpu_budget = match (section.gpu, config.gpu_id >= 0, config.gpu_memory_bytes) {
        (true, true, Some(bytes)) => Some(bytes),
        _ => None,
    };
    let budget = match gpu_budget {
        Some(bytes) => bytes,
        None => {
            return config.max_cpu_slices.max(1).min(chunk_len);
        }
    };

    // The calibration fields sit on the device for the whole section.
    let mut available = budget.saturating_sub(aux.calibration_bytes());
    let mut shape = non_slice_shape;
    let mut max_slices = chunk_len;
    for method in &section.methods {
        let (method_max, remaining) = method.calculate_max_slices(shape, available, aux);
        max_slices = max_slices.min(method_max);
        available = remaining;
        if method.output_dims_change() {
            shape = method.calculate_output_dims(shape);
        }
    }
    let max_slices = max_slices.max(1).min(chunk_len);
    debug!(max_slices, budget, "planned section block length");
    max_slices
}
