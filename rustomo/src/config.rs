//! Process-wide run configuration.
//!
//! One immutable record threaded through the runner, replacing any notion
//! of mutable process-global settings. The CLI deserializes it; library
//! users construct it directly.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Where intermediate artifacts and spill files land.
    pub run_out_dir: PathBuf,
    /// Device ordinal; −1 disables GPU sections' residency moves.
    pub gpu_id: i32,
    /// Planner budget for GPU sections. `None` makes GPU sections fall back
    /// to the CPU block cap.
    pub gpu_memory_bytes: Option<u64>,
    /// Block-length cap for CPU-only sections.
    pub max_cpu_slices: usize,
    /// Storage chunk width along the slicing axis for persisted files.
    pub frames_per_chunk: usize,
    /// Compress slabs written by the intermediate persistence sink.
    pub compress_intermediate: bool,
    /// RAM cap per store chunk; larger chunks spill to file.
    pub memory_limit_bytes: Option<u64>,
    /// Persist the output of every section, not just flagged ones.
    pub save_all: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            run_out_dir: PathBuf::from("."),
            gpu_id: -1,
            gpu_memory_bytes: None,
            max_cpu_slices: 64,
            frames_per_chunk: 1,
            compress_intermediate: false,
            memory_limit_bytes: None,
            save_all: false,
        }
    }
}
