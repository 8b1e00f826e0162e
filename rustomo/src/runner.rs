//! The runner: drives blocks through the sectionized pipeline.
//!
//! For each section it plans a block length, builds a sink store on the
//! section's axis, streams every block of the current source through the
//! section's methods into the sink, seals the sink and turns it into the
//! next section's source, reslicing and exchanging halos at that boundary
//! when the next section asks for them.

use crate::comm::{CommError, Communicator};
use crate::config::RunConfig;
use crate::method::{MethodError, Pattern, SideOutputs};
use crate::persist::{IntermediateSink, PersistError};
use crate::planner::max_slices_for_section;
use crate::section::{sectionize, Pipeline};
use crate::store::reader::DataSetStoreReader;
use crate::store::writer::DataSetStoreWriter;
use crate::store::{DataSetSink, DataSetSource, StoreError};
use rustomo_core::{shape, Dim, Element, Padding};

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("store failure in section {section}")]
    Store {
        section: usize,
        #[source]
        source: StoreError,
    },
    #[error("method {method} failed")]
    Method {
        method: String,
        #[source]
        source: MethodError,
    },
    #[error("intermediate persistence failed")]
    Persist(#[from] PersistError),
    #[error("collective synchronization failed")]
    Comm(#[from] CommError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// What one section did, for logs and the CLI report.
#[derive(Debug, Clone)]
pub struct SectionReport {
    pub pattern: Pattern,
    pub gpu: bool,
    pub resliced: bool,
    pub methods: Vec<String>,
    pub max_slices: usize,
    pub blocks: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub sections: Vec<SectionReport>,
    pub side_outputs: SideOutputs,
}

/// A finished run: the report plus, when the pipeline had any section, a
/// reader over the final section's store.
pub struct RunOutcome<T: Element> {
    pub report: RunReport,
    pub output: Option<DataSetStoreReader<T>>,
}

pub struct Runner<T: Element> {
    config: RunConfig,
    comm: Arc<dyn Communicator>,
    sink: Option<Box<dyn IntermediateSink<T>>>,
}

impl<T: Element> Runner<T> {
    pub fn new(config: RunConfig, comm: Arc<dyn Communicator>) -> Self {
        Runner {
            config,
            comm,
            sink: None,
        }
    }

    /// Attaches the persistence sink `save_result` sections write to.
    pub fn with_intermediate_sink(mut self, sink: Box<dyn IntermediateSink<T>>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn new_writer(&self, dim: Dim) -> DataSetStoreWriter<T> {
        let writer = DataSetStoreWriter::new(
            dim,
            Arc::clone(&self.comm),
            self.config.run_out_dir.clone(),
        );
        match self.config.memory_limit_bytes {
            Some(limit) => writer.with_memory_limit(limit),
            None => writer,
        }
    }

    /// Streams the source through a pass-through store to land on `dim`
    /// with `padding`. This is how a loader serving dim 0 feeds a sinogram-first
    /// pipeline.
    #[instrument(skip(self, source))]
    fn restage(
        &self,
        mut source: Box<dyn DataSetSource<T>>,
        dim: Dim,
        padding: Padding,
    ) -> Result<Box<dyn DataSetSource<T>>> {
        let staging_err = |e: StoreError| PipelineError::Store { section: 0, source: e };
        let source_dim = source.slicing_dim();
        info!(%source_dim, %dim, "restaging the source onto the section axis");
        let mut writer = self.new_writer(source_dim);
        let chunk_len = source.chunk_len();
        let step = self.config.max_cpu_slices.max(1);
        let mut start = 0;
        while start < chunk_len {
            let length = step.min(chunk_len - start);
            let block = source.read_block(start, length).map_err(staging_err)?;
            writer.write_block(&block).map_err(staging_err)?;
            start += length;
        }
        let new_dim = if source_dim != dim { Some(dim) } else { None };
        let reader = writer.make_reader(new_dim, padding).map_err(staging_err)?;
        Ok(Box::new(reader))
    }

    /// Runs the whole pipeline over the source's chunk.
    #[instrument(skip(self, source, pipeline), fields(rank = self.comm.rank()))]
    pub fn run(
        &mut self,
        source: Box<dyn DataSetSource<T>>,
        pipeline: Pipeline<T>,
    ) -> Result<RunOutcome<T>> {
        let sectioned = sectionize(pipeline, self.config.save_all);
        let specs: Vec<(Dim, Padding)> = sectioned
            .sections
            .iter()
            .map(|s| {
                (
                    s.pattern.slicing_dim().expect("sectionize resolves patterns"),
                    s.padding(),
                )
            })
            .collect();

        let mut source = source;
        if let Some((first_dim, first_padding)) = specs.first() {
            if source.slicing_dim() != *first_dim || source.padding() != *first_padding {
                source = self.restage(source, *first_dim, *first_padding)?;
            }
        }

        let mut report = RunReport::default();
        let mut side = SideOutputs::new();
        let mut output = None;
        let section_count = sectioned.sections.len();

        for (index, mut section) in sectioned.sections.into_iter().enumerate() {
            let store_err = |e: StoreError| PipelineError::Store { section: index, source: e };
            if section.needs_global_input() {
                // Every rank must have pushed all blocks through the
                // previous sections before a global reduction runs.
                self.comm.barrier()?;
            }
            let dim = specs[index].0;
            let chunk_len = source.chunk_len();
            let aux = source.aux();
            let non_slice = shape::non_slice_shape(source.chunk_shape(), dim);
            let max_slices =
                max_slices_for_section(&section, non_slice, chunk_len, &aux, &self.config);
            info!(
                section = index,
                pattern = %section.pattern,
                gpu = section.gpu,
                max_slices,
                chunk_len,
                "executing section"
            );

            let mut writer = self.new_writer(dim);
            let mut blocks = 0;
            let mut start = 0;
            while start < chunk_len {
                let length = max_slices.min(chunk_len - start);
                let mut block = source.read_block(start, length).map_err(store_err)?;
                if section.gpu && self.config.gpu_id >= 0 {
                    block
                        .to_gpu(self.config.gpu_id)
                        .map_err(|e| store_err(StoreError::Block(e)))?;
                }
                for method in &mut section.methods {
                    method.append_side_inputs(&side);
                    block = method.execute(block).map_err(|e| PipelineError::Method {
                        method: method.method_name().to_string(),
                        source: e,
                    })?;
                    let outputs = method.get_side_output();
                    if !outputs.is_empty() {
                        debug!(method = method.method_name(), count = outputs.len(), "collected side outputs");
                        side.extend(outputs);
                    }
                }
                block.to_cpu();
                if section.save_result {
                    self.persist_block(&block, dim, &section, index)?;
                }
                writer.write_block(&block).map_err(store_err)?;
                blocks += 1;
                start += length;
            }

            report.sections.push(SectionReport {
                pattern: section.pattern,
                gpu: section.gpu,
                resliced: section.reslice,
                methods: section
                    .methods
                    .iter()
                    .map(|m| m.method_name().to_string())
                    .collect(),
                max_slices,
                blocks,
            });

            if index + 1 < section_count {
                let (next_dim, next_padding) = specs[index + 1];
                let new_dim = if next_dim != dim { Some(next_dim) } else { None };
                let reader = writer.make_reader(new_dim, next_padding).map_err(store_err)?;
                source = Box::new(reader);
            } else {
                let reader = writer.make_reader(None, (0, 0)).map_err(store_err)?;
                output = Some(reader);
            }
        }

        report.side_outputs = side;
        Ok(RunOutcome { report, output })
    }

    fn persist_block(
        &mut self,
        block: &rustomo_core::DataBlock<T>,
        dim: Dim,
        section: &crate::section::Section<T>,
        index: usize,
    ) -> Result<()> {
        let sink = match self.sink.as_mut() {
            Some(sink) => sink,
            None => {
                warn!(section = index, "save_result set but no intermediate sink is attached");
                return Ok(());
            }
        };
        let (pad_before, _) = block.padding();
        let global_index_signed = block.global_index();
        let mut global_index = [0_usize; 3];
        global_index[dim.index()] =
            (global_index_signed[dim.index()] + pad_before as isize) as usize;
        let path = section
            .methods
            .last()
            .map_or_else(|| format!("section{}", index), |m| m.method_name().to_string());
        let global_shape = block.global_shape();
        sink.save(
            block.core_view(),
            global_shape,
            global_index,
            dim,
            &path,
            block.angles(),
            global_shape[1],
            global_shape[2],
            self.config.frames_per_chunk,
        )?;
        Ok(())
    }
}
