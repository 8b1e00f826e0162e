//! In-memory raw container, used by tests and the synthetic benchmark.

use super::{LoaderError, RawImageFile, Result};
use rustomo_core::{Element, Shape3};

use ndarray::Array3;
use std::collections::HashMap;

/// A raw container backed by maps of named datasets.
#[derive(Debug, Default)]
pub struct RawMem<T: Element> {
    volumes: HashMap<String, Array3<T>>,
    image_keys: HashMap<String, Vec<i32>>,
    angles: HashMap<String, Vec<f32>>,
}

impl<T: Element> RawMem<T> {
    pub fn new() -> Self {
        RawMem {
            volumes: HashMap::new(),
            image_keys: HashMap::new(),
            angles: HashMap::new(),
        }
    }

    pub fn with_volume(mut self, path: impl Into<String>, data: Array3<T>) -> Self {
        self.volumes.insert(path.into(), data);
        self
    }

    pub fn with_image_key(mut self, path: impl Into<String>, key: Vec<i32>) -> Self {
        self.image_keys.insert(path.into(), key);
        self
    }

    pub fn with_angles(mut self, path: impl Into<String>, angles: Vec<f32>) -> Self {
        self.angles.insert(path.into(), angles);
        self
    }
}

impl<T: Element> RawImageFile<T> for RawMem<T> {
    fn dataset_shape(&self, data_path: &str) -> Result<Shape3> {
        let volume = self
            .volumes
            .get(data_path)
            .ok_or_else(|| LoaderError::MissingDataset(data_path.to_string()))?;
        Ok([volume.shape()[0], volume.shape()[1], volume.shape()[2]])
    }

    fn read_slab(
        &mut self,
        data_path: &str,
        start: Shape3,
        slab_shape: Shape3,
    ) -> Result<Array3<T>> {
        let volume = self
            .volumes
            .get(data_path)
            .ok_or_else(|| LoaderError::MissingDataset(data_path.to_string()))?;
        for d in 0..3 {
            if start[d] + slab_shape[d] > volume.shape()[d] {
                return Err(LoaderError::Container(format!(
                    "slab at {:?} with shape {:?} exceeds dataset {:?} of shape {:?}",
                    start,
                    slab_shape,
                    data_path,
                    volume.shape()
                )));
            }
        }
        Ok(volume
            .slice(ndarray::s![
                start[0]..start[0] + slab_shape[0],
                start[1]..start[1] + slab_shape[1],
                start[2]..start[2] + slab_shape[2]
            ])
            .to_owned())
    }

    fn read_image_key(&mut self, key_path: &str) -> Result<Vec<i32>> {
        self.image_keys
            .get(key_path)
            .cloned()
            .ok_or_else(|| LoaderError::MissingDataset(key_path.to_string()))
    }

    fn read_angles(&mut self, angles_path: &str) -> Result<Vec<f32>> {
        self.angles
            .get(angles_path)
            .cloned()
            .ok_or_else(|| LoaderError::MissingDataset(angles_path.to_string()))
    }
}
