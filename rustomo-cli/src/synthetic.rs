/*!
Synthetic methods and data used by the `sections` and `bench` commands.

These stand in for the real filter/reconstruction packages, which plug into
the core through the same `MethodWrapper` trait.
*/

use crate::cli::MethodSpec;

use ndarray::{Array, Array3};
use rustomo::method::{MethodWrapper, Pattern, Result as MethodResult};
use rustomo::DataBlock;

/// A pass-through method carrying the declared attributes.
pub struct SyntheticMethod {
    spec: MethodSpec,
}

impl SyntheticMethod {
    pub fn boxed(spec: MethodSpec) -> Box<dyn MethodWrapper<f32>> {
        Box::new(SyntheticMethod { spec })
    }
}

impl MethodWrapper<f32> for SyntheticMethod {
    fn method_name(&self) -> &str {
        &self.spec.name
    }

    fn pattern(&self) -> Pattern {
        self.spec.pattern
    }

    fn set_pattern(&mut self, pattern: Pattern) {
        self.spec.pattern = pattern;
    }

    fn is_gpu(&self) -> bool {
        self.spec.gpu
    }

    fn save_result(&self) -> bool {
        self.spec.save_result
    }

    fn glob_stats(&self) -> bool {
        self.spec.glob_stats
    }

    fn execute(&mut self, block: DataBlock<f32>) -> MethodResult<DataBlock<f32>> {
        Ok(block)
    }
}

/// A smooth ramp volume; compressible, nonzero, and cheap to generate.
pub fn ramp_volume(angles: usize, detector_y: usize, detector_x: usize) -> Array3<f32> {
    let plane = (detector_y * detector_x) as f32;
    Array::from_shape_fn((angles, detector_y, detector_x), |(a, y, x)| {
        a as f32 + ((y * detector_x + x) as f32) / plane
    })
}
