/*!
The `bench` command: stream a synthetic volume through a pass-through
pipeline that forces one reslice, and report the core's throughput.

Method execution is free here, so the numbers isolate the cost of the
substrate itself: block serving, store writes, and the reslice transpose.
*/

use crate::cli::MethodSpec;
use crate::synthetic::{ramp_volume, SyntheticMethod};

use anyhow::Result;
use rustomo::comm::solo::SoloCommunicator;
use rustomo::config::RunConfig;
use rustomo::loader::mem::RawMem;
use rustomo::loader::{AnglesConfig, LoaderConfig, StandardLoader};
use rustomo::method::Pattern;
use rustomo::section::Pipeline;
use rustomo::Dim;
use rustomo::Runner;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

pub fn bench(
    angles: usize,
    detector_y: usize,
    detector_x: usize,
    max_cpu_slices: usize,
    out_dir: Option<PathBuf>,
) -> Result<()> {
    let volume = ramp_volume(angles, detector_y, detector_x);
    let nbytes = volume.len() * std::mem::size_of::<f32>();
    println!(
        "benchmarking a ({}, {}, {}) float32 volume ({:.1} MiB) through projection -> sinogram",
        angles,
        detector_y,
        detector_x,
        nbytes as f64 / (1024.0 * 1024.0)
    );

    let comm = Arc::new(SoloCommunicator::new());
    let raw = RawMem::new().with_volume("data", volume);
    let loader = StandardLoader::new(
        Box::new(raw),
        LoaderConfig {
            data_path: "data".to_string(),
            image_key_path: None,
            angles: AnglesConfig::UserDefined {
                start_angle: 0.0,
                stop_angle: 180.0,
                angles_total: angles,
            },
            preview: None,
        },
        None,
        None,
        Dim::new(0)?,
        (0, 0),
        comm.as_ref(),
    )?;

    let out_dir = out_dir.unwrap_or_else(std::env::temp_dir);
    let config = RunConfig {
        run_out_dir: out_dir,
        max_cpu_slices,
        ..RunConfig::default()
    };
    let mut runner = Runner::new(config, comm);
    let pipeline = Pipeline::new(
        Pattern::Projection,
        vec![
            SyntheticMethod::boxed(MethodSpec {
                name: "pass_projection".to_string(),
                pattern: Pattern::Projection,
                gpu: false,
                save_result: false,
                glob_stats: false,
            }),
            SyntheticMethod::boxed(MethodSpec {
                name: "pass_sinogram".to_string(),
                pattern: Pattern::Sinogram,
                gpu: false,
                save_result: false,
                glob_stats: false,
            }),
        ],
    );

    let start = Instant::now();
    let outcome = runner.run(Box::new(loader), pipeline)?;
    let elapsed = start.elapsed().as_secs_f64();

    for (index, section) in outcome.report.sections.iter().enumerate() {
        println!(
            "section {}: pattern={} max_slices={} blocks={}{}",
            index,
            section.pattern,
            section.max_slices,
            section.blocks,
            if section.resliced { " (resliced)" } else { "" }
        );
    }
    println!(
        "completed in {:.3} s ({:.1} MiB/s)",
        elapsed,
        nbytes as f64 / (1024.0 * 1024.0) / elapsed
    );
    Ok(())
}
