//! Sectionization: partitioning the declared method pipeline into maximal
//! runs that share a slicing pattern and an execution platform, with no
//! intervening persist or global-reduction barrier.
//!
//! The runner executes one section at a time, streaming every block of the
//! chunk through the section's methods before the next section starts. A
//! section whose pattern differs from its predecessor's carries a `reslice`
//! flag: its source store must transpose the distributed chunk first.

use crate::method::{MethodWrapper, Pattern};
use rustomo_core::{Element, Padding};

use tracing::{debug, info, instrument};

/// The declared pipeline: the loader's pattern plus the ordered methods.
pub struct Pipeline<T: Element> {
    pub loader_pattern: Pattern,
    pub methods: Vec<Box<dyn MethodWrapper<T>>>,
}

impl<T: Element> Pipeline<T> {
    pub fn new(loader_pattern: Pattern, methods: Vec<Box<dyn MethodWrapper<T>>>) -> Self {
        Pipeline {
            loader_pattern,
            methods,
        }
    }
}

/// A maximal run of methods sharing pattern and platform.
pub struct Section<T: Element> {
    pub gpu: bool,
    /// Resolved pattern; never [`Pattern::All`] after sectionization.
    pub pattern: Pattern,
    /// The distributed chunk must be resliced onto this section's axis
    /// before it runs.
    pub reslice: bool,
    /// The section's output is handed to the intermediate persistence sink.
    pub save_result: bool,
    pub methods: Vec<Box<dyn MethodWrapper<T>>>,
}

impl<T: Element> Section<T> {
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Elementwise maximum of the halo the section's methods ask for.
    pub fn padding(&self) -> Padding {
        self.methods.iter().fold((0, 0), |acc, m| {
            let p = m.padding();
            (acc.0.max(p.0), acc.1.max(p.1))
        })
    }

    /// True when the first method needs the whole volume to have passed
    /// through already; the runner inserts a cross-rank barrier.
    pub fn needs_global_input(&self) -> bool {
        self.methods.first().map_or(false, |m| m.glob_stats())
    }
}

impl<T: Element> std::fmt::Debug for Section<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Section")
            .field("gpu", &self.gpu)
            .field("pattern", &self.pattern)
            .field("reslice", &self.reslice)
            .field("save_result", &self.save_result)
            .field(
                "methods",
                &self.methods.iter().map(|m| m.method_name().to_string()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// A sectionized pipeline, pattern-resolved and ready to run.
#[derive(Debug)]
pub struct SectionedPipeline<T: Element> {
    /// Pattern the first section consumes; the loader is expected to serve
    /// it, through a reslice when its ingestion axis differs.
    pub loader_pattern: Pattern,
    /// The loader's declared pattern differs from `loader_pattern`, so the
    /// runner must reslice between ingestion and the first section.
    pub loader_reslice: bool,
    pub sections: Vec<Section<T>>,
}

/// Walks the pipeline and cuts it into sections.
///
/// A new section starts before method `m` whenever `m`'s pattern is
/// incompatible with the running section, its platform differs, the
/// previous method persists its result (or `save_all` is on), or `m` needs
/// a global reduction. Afterwards, `All` patterns are resolved by a
/// backward sweep, defaulting to projection when the whole pipeline is
/// pattern-agnostic, and every method is stamped with its section's
/// pattern.
#[instrument(skip(pipeline), fields(methods = pipeline.methods.len()))]
pub fn sectionize<T: Element>(pipeline: Pipeline<T>, save_all: bool) -> SectionedPipeline<T> {
    let declared_loader_pattern = pipeline.loader_pattern;
    let mut sections: Vec<Section<T>> = Vec::new();

    let mut current_gpu = false;
    let mut current_pattern = declared_loader_pattern;
    let mut current_methods: Vec<Box<dyn MethodWrapper<T>>> = Vec::new();
    let mut save_previous = false;

    for method in pipeline.methods {
        let pattern_changed = !current_pattern.compatible(method.pattern());
        let platform_changed = method.is_gpu() != current_gpu;
        let global_input = method.glob_stats();
        let start_new_section =
            global_input || save_previous || pattern_changed || platform_changed;

        if start_new_section && !current_methods.is_empty() {
            sections.push(Section {
                gpu: current_gpu,
                pattern: current_pattern,
                reslice: false,
                save_result: save_previous,
                methods: std::mem::take(&mut current_methods),
            });
        }
        if start_new_section || current_methods.is_empty() {
            // A fresh section starts with its first method's pattern, `All`
            // included, so the backward sweep below can resolve it from the
            // section that follows.
            current_gpu = method.is_gpu();
            current_pattern = method.pattern();
        } else if current_pattern == Pattern::All {
            current_pattern = method.pattern();
        }
        save_previous = method.save_result() || save_all;
        current_methods.push(method);
    }
    if !current_methods.is_empty() {
        sections.push(Section {
            gpu: current_gpu,
            pattern: current_pattern,
            reslice: false,
            save_result: save_previous,
            methods: current_methods,
        });
    }

    // Backward sweep: an `All` section takes the pattern of the section
    // that follows it, so the loader ends up serving whatever the first
    // concrete consumer needs.
    let mut following = Pattern::All;
    for section in sections.iter_mut().rev() {
        if section.pattern == Pattern::All {
            section.pattern = following;
        }
        following = section.pattern;
    }

    // A fully pattern-agnostic pipeline defaults to projection.
    if sections.first().map_or(declared_loader_pattern == Pattern::All, |s| s.pattern == Pattern::All) {
        info!("all pipeline sections support all patterns: choosing projection");
        for section in &mut sections {
            section.pattern = Pattern::Projection;
        }
    }

    let loader_pattern = match sections.first() {
        Some(section) => section.pattern,
        None if declared_loader_pattern == Pattern::All => Pattern::Projection,
        None => declared_loader_pattern,
    };
    let loader_reslice = declared_loader_pattern != Pattern::All
        && declared_loader_pattern != loader_pattern;

    // Reslice flags against the resolved chain of patterns.
    let mut previous = loader_pattern;
    for section in &mut sections {
        section.reslice = section.pattern != previous;
        previous = section.pattern;
    }

    // Stamp every method with its section's resolved pattern.
    for section in &mut sections {
        debug_assert_ne!(section.pattern, Pattern::All);
        for method in &mut section.methods {
            method.set_pattern(section.pattern);
        }
    }

    debug!(
        sections = sections.len(),
        %loader_pattern,
        loader_reslice,
        "pipeline sectionized"
    );
    SectionedPipeline {
        loader_pattern,
        loader_reslice,
        sections,
    }
}
