/*!
Command line option declarations.
*/

use rustomo::method::Pattern;

use std::path::PathBuf;
use std::str::FromStr;
use structopt::StructOpt;

/// A method description of the form `name:pattern[:gpu][:save][:glob]`,
/// e.g. `normalize:projection`, `paganin:projection:gpu`,
/// `rescale:all:save`.
#[derive(Debug, Clone)]
pub struct MethodSpec {
    pub name: String,
    pub pattern: Pattern,
    pub gpu: bool,
    pub save_result: bool,
    pub glob_stats: bool,
}

impl FromStr for MethodSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let name = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| format!("method spec {:?} is missing a name", s))?;
        let pattern = match parts.next() {
            Some("projection") | None => Pattern::Projection,
            Some("sinogram") => Pattern::Sinogram,
            Some("all") => Pattern::All,
            Some(other) => {
                return Err(format!(
                    "unknown pattern {:?} in method spec {:?} (expected projection, sinogram or all)",
                    other, s
                ))
            }
        };
        let mut spec = MethodSpec {
            name: name.to_string(),
            pattern,
            gpu: false,
            save_result: false,
            glob_stats: false,
        };
        for flag in parts {
            match flag {
                "gpu" => spec.gpu = true,
                "save" => spec.save_result = true,
                "glob" => spec.glob_stats = true,
                other => return Err(format!("unknown flag {:?} in method spec {:?}", other, s)),
            }
        }
        Ok(spec)
    }
}

#[derive(Debug, StructOpt)]
#[structopt(
    name = "rustomo",
    about = "Block-streaming tomographic reconstruction pipeline core"
)]
pub struct Opt {
    #[structopt(subcommand)]
    pub command: Command,
}

#[derive(Debug, StructOpt)]
pub enum Command {
    /// Shows how a declared method pipeline splits into sections.
    Sections {
        /// Comma separated method specs (`name:pattern[:gpu][:save][:glob]`)
        #[structopt(short, long, use_delimiter = true)]
        methods: Vec<MethodSpec>,
        /// Pattern declared by the loader
        #[structopt(long, default_value = "projection", parse(try_from_str = parse_pattern))]
        loader_pattern: Pattern,
        /// Persist the output of every section
        #[structopt(long)]
        save_all: bool,
    },
    /// Streams a synthetic volume through a pass-through pipeline and
    /// reports throughput.
    Bench {
        /// Number of projection angles in the synthetic volume
        #[structopt(long, default_value = "180")]
        angles: usize,
        /// Detector height
        #[structopt(long, default_value = "128")]
        detector_y: usize,
        /// Detector width
        #[structopt(long, default_value = "160")]
        detector_x: usize,
        /// Block-length cap for the CPU sections
        #[structopt(long, default_value = "64")]
        max_cpu_slices: usize,
        /// Scratch directory for stores that spill to disk
        #[structopt(long, parse(from_os_str))]
        out_dir: Option<PathBuf>,
    },
    /// Writes a synthetic raw acquisition container for testing.
    Pack {
        /// Output container path
        #[structopt(parse(from_os_str))]
        output: PathBuf,
        /// Number of projection frames
        #[structopt(long, default_value = "180")]
        angles: usize,
        /// Flat-field frames up front
        #[structopt(long, default_value = "4")]
        flats: usize,
        /// Dark-field frames at the end
        #[structopt(long, default_value = "4")]
        darks: usize,
        /// Detector height
        #[structopt(long, default_value = "128")]
        detector_y: usize,
        /// Detector width
        #[structopt(long, default_value = "160")]
        detector_x: usize,
    },
}

pub fn parse_pattern(s: &str) -> Result<Pattern, String> {
    match s {
        "projection" => Ok(Pattern::Projection),
        "sinogram" => Ok(Pattern::Sinogram),
        "all" => Ok(Pattern::All),
        other => Err(format!(
            "unknown pattern {:?} (expected projection, sinogram or all)",
            other
        )),
    }
}
