//! End-to-end runs: loader → sections → stores, with a pattern change in
//! the middle and the persistence sink attached.

mod common;

use common::{arange, dim, spmd};
use ndarray::s;
use rustomo::comm::solo::SoloCommunicator;
use rustomo::config::RunConfig;
use rustomo::loader::mem::RawMem;
use rustomo::loader::{AnglesConfig, LoaderConfig, StandardLoader};
use rustomo::method::{
    MethodWrapper, Pattern, Result as MethodResult, SideOutputs, SideValue,
};
use rustomo::persist::{read_intermediate, FlatIntermediateWriter};
use rustomo::runner::Runner;
use rustomo::section::Pipeline;
use rustomo::store::DataSetSource;
use rustomo::Communicator;
use rustomo_core::DataBlock;

use std::sync::Arc;
use tempfile::TempDir;

/// Scales every sample in place.
struct Scale {
    pattern: Pattern,
    factor: f32,
    save_result: bool,
}

impl MethodWrapper<f32> for Scale {
    fn method_name(&self) -> &str {
        "scale"
    }
    fn pattern(&self) -> Pattern {
        self.pattern
    }
    fn set_pattern(&mut self, pattern: Pattern) {
        self.pattern = pattern;
    }
    fn save_result(&self) -> bool {
        self.save_result
    }
    fn execute(&mut self, mut block: DataBlock<f32>) -> MethodResult<DataBlock<f32>> {
        block.data_mut().mapv_inplace(|v| v * self.factor);
        Ok(block)
    }
    fn get_side_output(&self) -> SideOutputs {
        let mut side = SideOutputs::new();
        side.insert("scale_factor".to_string(), SideValue::Float(f64::from(self.factor)));
        side
    }
}

/// Adds the scale factor published upstream to every sample.
struct AddSideFactor {
    pattern: Pattern,
    seen_factor: Option<f64>,
}

impl MethodWrapper<f32> for AddSideFactor {
    fn method_name(&self) -> &str {
        "add_side_factor"
    }
    fn pattern(&self) -> Pattern {
        self.pattern
    }
    fn set_pattern(&mut self, pattern: Pattern) {
        self.pattern = pattern;
    }
    fn append_side_inputs(&mut self, side: &SideOutputs) {
        if let Some(SideValue::Float(factor)) = side.get("scale_factor") {
            self.seen_factor = Some(*factor);
        }
    }
    fn execute(&mut self, mut block: DataBlock<f32>) -> MethodResult<DataBlock<f32>> {
        let add = self.seen_factor.unwrap_or(0.0) as f32;
        block.data_mut().mapv_inplace(|v| v + add);
        Ok(block)
    }
}

fn loader_config() -> LoaderConfig {
    LoaderConfig {
        data_path: "entry/data".to_string(),
        image_key_path: None,
        angles: AnglesConfig::UserDefined {
            start_angle: 0.0,
            stop_angle: 180.0,
            angles_total: 12,
        },
        preview: None,
    }
}

#[test]
fn single_rank_run_with_pattern_change_and_sink() {
    let temp = TempDir::new().unwrap();
    let comm = Arc::new(SoloCommunicator::new());
    let global = arange((12, 8, 6));
    let raw = RawMem::new().with_volume("entry/data", global.clone());

    let loader = StandardLoader::new(
        Box::new(raw),
        loader_config(),
        None,
        None,
        dim(0),
        (0, 0),
        comm.as_ref(),
    )
    .unwrap();

    let config = RunConfig {
        run_out_dir: temp.path().to_path_buf(),
        max_cpu_slices: 5,
        frames_per_chunk: 2,
        ..RunConfig::default()
    };
    let sink = FlatIntermediateWriter::new(&config, comm.rank());
    let sink_probe = sink.file_name("scale");

    let mut runner = Runner::new(config, comm).with_intermediate_sink(Box::new(sink));
    let pipeline = Pipeline::new(
        Pattern::Projection,
        vec![
            Box::new(Scale { pattern: Pattern::Projection, factor: 2.0, save_result: true }),
            Box::new(AddSideFactor { pattern: Pattern::Sinogram, seen_factor: None }),
        ],
    );
    let outcome = runner.run(Box::new(loader), pipeline).unwrap();

    // Two sections: projection (scale, saved) then sinogram (reslice)
    assert_eq!(outcome.report.sections.len(), 2);
    assert_eq!(outcome.report.sections[0].pattern, Pattern::Projection);
    assert_eq!(outcome.report.sections[1].pattern, Pattern::Sinogram);
    assert!(outcome.report.sections[1].resliced);
    assert_eq!(outcome.report.sections[0].max_slices, 5);
    assert_eq!(outcome.report.sections[0].blocks, 3);
    assert!(matches!(
        outcome.report.side_outputs.get("scale_factor"),
        Some(SideValue::Float(f)) if (*f - 2.0).abs() < 1e-9
    ));

    // Final store holds 2 * data + 2 on the sinogram axis
    let mut output = outcome.output.unwrap();
    assert_eq!(output.slicing_dim(), dim(1));
    let len = output.chunk_len();
    assert_eq!(len, 8);
    let result = output.read_block(0, len).unwrap().into_data();
    let expected = global.mapv(|v| v * 2.0 + 2.0);
    assert_eq!(result, expected);

    // The first section's output landed in the sink, pre-reslice
    let (angles, slabs) = read_intermediate::<f32>(&sink_probe).unwrap();
    assert_eq!(angles.len(), 12);
    assert_eq!(slabs.len(), 3);
    assert_eq!(slabs[0].global_shape, [12, 8, 6]);
    assert_eq!(slabs[0].chunk_shape, [2, 8, 6]);
    assert_eq!(slabs[1].global_index, [5, 0, 0]);
    let saved = &slabs[0].data;
    assert_eq!(saved.view(), global.slice(s![0..5, .., ..]).mapv(|v| v * 2.0));
}

/// A sinogram-first pipeline forces the runner to restage the dim-0 loader
/// through a store reslice before the first section.
#[test]
fn sinogram_first_pipeline_restages_the_loader() {
    let temp = TempDir::new().unwrap();
    let comm = Arc::new(SoloCommunicator::new());
    let global = arange((6, 10, 4));
    let raw = RawMem::new().with_volume("entry/data", global.clone());

    let loader = StandardLoader::new(
        Box::new(raw),
        LoaderConfig {
            angles: AnglesConfig::UserDefined {
                start_angle: 0.0,
                stop_angle: 180.0,
                angles_total: 6,
            },
            ..loader_config()
        },
        None,
        None,
        dim(0),
        (0, 0),
        comm.as_ref(),
    )
    .unwrap();

    let config = RunConfig {
        run_out_dir: temp.path().to_path_buf(),
        max_cpu_slices: 4,
        ..RunConfig::default()
    };
    let mut runner = Runner::new(config, comm);
    let pipeline = Pipeline::new(
        Pattern::Projection,
        vec![Box::new(Scale { pattern: Pattern::Sinogram, factor: 3.0, save_result: false })],
    );
    let outcome = runner.run(Box::new(loader), pipeline).unwrap();

    assert_eq!(outcome.report.sections.len(), 1);
    assert_eq!(outcome.report.sections[0].pattern, Pattern::Sinogram);

    let mut output = outcome.output.unwrap();
    assert_eq!(output.slicing_dim(), dim(1));
    let result = output.read_block(0, output.chunk_len()).unwrap().into_data();
    assert_eq!(result, global.mapv(|v| v * 3.0));
}

/// Two ranks end to end: each rank's final sinogram share matches the
/// serially transformed global volume.
#[test]
fn two_rank_run_matches_the_serial_result() {
    let results = spmd(2, |comm| {
        let temp = TempDir::new().unwrap();
        let rank = comm.rank();
        let global = arange((12, 8, 6));
        let raw = RawMem::new().with_volume("entry/data", global.clone());

        let loader = StandardLoader::new(
            Box::new(raw),
            loader_config(),
            None,
            None,
            dim(0),
            (0, 0),
            &comm,
        )
        .unwrap();

        let config = RunConfig {
            run_out_dir: temp.path().to_path_buf(),
            max_cpu_slices: 4,
            ..RunConfig::default()
        };
        let mut runner = Runner::new(config, Arc::new(comm));
        let pipeline = Pipeline::new(
            Pattern::Projection,
            vec![
                Box::new(Scale { pattern: Pattern::Projection, factor: 2.0, save_result: false }),
                Box::new(AddSideFactor { pattern: Pattern::Sinogram, seen_factor: None }),
            ],
        );
        let outcome = runner.run(Box::new(loader), pipeline).unwrap();
        let mut output = outcome.output.unwrap();
        let index = output.global_index();
        let data = output.read_block(0, output.chunk_len()).unwrap().into_data();
        (rank, index, data)
    });

    let expected = arange((12, 8, 6)).mapv(|v| v * 2.0 + 2.0);
    for (rank, index, data) in results {
        assert_eq!(index, [0, rank as isize * 4, 0]);
        let lo = rank * 4;
        let hi = lo + data.shape()[1];
        assert_eq!(data, expected.slice(s![.., lo..hi, ..]).to_owned());
    }
}
