//! Auxiliary calibration data attached to every block of a run.
//!
//! The bundle is immutable once built and shared by reference count: the
//! loader constructs one `Arc<AuxiliaryData<T>>` and every block produced
//! from any source of the run carries a handle to the same instance.

use crate::element::Element;
use ndarray::{Array1, Array3, ArrayView1, ArrayView3};

/// Projection angles plus optional flat and dark fields.
#[derive(Debug, Clone)]
pub struct AuxiliaryData<T: Element> {
    angles: Array1<f32>,
    darks: Option<Array3<T>>,
    flats: Option<Array3<T>>,
}

impl<T: Element> AuxiliaryData<T> {
    pub fn new(angles: Array1<f32>) -> Self {
        AuxiliaryData {
            angles,
            darks: None,
            flats: None,
        }
    }

    pub fn with_darks_flats(angles: Array1<f32>, darks: Array3<T>, flats: Array3<T>) -> Self {
        AuxiliaryData {
            angles,
            darks: Some(darks),
            flats: Some(flats),
        }
    }

    pub fn angles(&self) -> ArrayView1<'_, f32> {
        self.angles.view()
    }

    pub fn n_angles(&self) -> usize {
        self.angles.len()
    }

    pub fn darks(&self) -> Option<ArrayView3<'_, T>> {
        self.darks.as_ref().map(Array3::view)
    }

    pub fn flats(&self) -> Option<ArrayView3<'_, T>> {
        self.flats.as_ref().map(Array3::view)
    }

    /// Bytes held by the darks and flats fields.
    ///
    /// The planner subtracts this from the device budget before asking
    /// methods for their per-slice footprint.
    pub fn calibration_bytes(&self) -> u64 {
        let count = self.darks.as_ref().map_or(0, Array3::len)
            + self.flats.as_ref().map_or(0, Array3::len);
        (count * T::NBYTES) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array;

    #[test]
    fn calibration_bytes_counts_both_fields() {
        let angles = Array::zeros(10);
        let darks = Array::from_elem((2, 4, 4), 1.0_f32);
        let flats = Array::from_elem((3, 4, 4), 2.0_f32);
        let aux = AuxiliaryData::with_darks_flats(angles, darks, flats);
        assert_eq!(aux.calibration_bytes(), (2 * 16 + 3 * 16) * 4);
    }

    #[test]
    fn plain_bundle_has_no_fields() {
        let aux: AuxiliaryData<f32> = AuxiliaryData::new(Array::zeros(5));
        assert!(aux.darks().is_none());
        assert!(aux.flats().is_none());
        assert_eq!(aux.n_angles(), 5);
        assert_eq!(aux.calibration_bytes(), 0);
    }
}
