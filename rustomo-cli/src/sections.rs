/*!
The `sections` command: dry-run sectionization of a declared pipeline.
*/

use crate::cli::MethodSpec;
use crate::synthetic::SyntheticMethod;

use anyhow::{bail, Result};
use rustomo::method::Pattern;
use rustomo::section::{sectionize, Pipeline};

pub fn sections(methods: Vec<MethodSpec>, loader_pattern: Pattern, save_all: bool) -> Result<()> {
    if methods.is_empty() {
        bail!("no methods given; pass --methods name:pattern[,name:pattern...]");
    }
    let pipeline = Pipeline::new(
        loader_pattern,
        methods.into_iter().map(SyntheticMethod::boxed).collect(),
    );
    let sectioned = sectionize(pipeline, save_all);

    println!(
        "loader: pattern={}{}",
        sectioned.loader_pattern,
        if sectioned.loader_reslice {
            " (reslice after ingestion)"
        } else {
            ""
        }
    );
    for (index, section) in sectioned.sections.iter().enumerate() {
        let names: Vec<&str> = section.methods.iter().map(|m| m.method_name()).collect();
        println!(
            "section {:2}: pattern={:<10} platform={} reslice={} save={} methods=[{}]",
            index,
            section.pattern.to_string(),
            if section.gpu { "gpu" } else { "cpu" },
            section.reslice,
            section.save_result,
            names.join(", ")
        );
    }
    Ok(())
}
