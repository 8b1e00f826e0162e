/*!
The `rustomo` binary provides a lightweight wrapper over the core
`rustomo` logic: inspecting how a pipeline sectionizes, benchmarking the
streaming substrate, and generating synthetic raw containers.
*/

mod bench;
mod cli;
mod pack;
mod sections;
mod synthetic;

use anyhow::Result;
use cli::{Command, Opt};
use structopt::StructOpt;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let options = Opt::from_args();
    match options.command {
        Command::Sections {
            methods,
            loader_pattern,
            save_all,
        } => sections::sections(methods, loader_pattern, save_all),
        Command::Bench {
            angles,
            detector_y,
            detector_x,
            max_cpu_slices,
            out_dir,
        } => bench::bench(angles, detector_y, detector_x, max_cpu_slices, out_dir),
        Command::Pack {
            output,
            angles,
            flats,
            darks,
            detector_y,
            detector_x,
        } => pack::pack(output, angles, flats, darks, detector_y, detector_x),
    }
}
