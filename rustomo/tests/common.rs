//! Shared helpers for the integration tests.
#![allow(dead_code)]

use ndarray::{Array, Array3};
use rustomo::comm::threaded::ThreadedCommunicator;
use rustomo_core::{AuxiliaryData, DataBlock, Dim, Shape3};

use std::sync::Arc;
use std::thread;

pub fn dim(index: usize) -> Dim {
    Dim::new(index).unwrap()
}

/// A float32 arange volume, the reference data most scenarios slice up.
pub fn arange(shape: (usize, usize, usize)) -> Array3<f32> {
    let len = shape.0 * shape.1 * shape.2;
    Array::from_iter((0..len).map(|v| v as f32))
        .into_shape(shape)
        .unwrap()
}

pub fn plain_aux(n_angles: usize) -> Arc<AuxiliaryData<f32>> {
    Arc::new(AuxiliaryData::new(Array::zeros(n_angles)))
}

/// An unpadded block over `data`, placed at `block_start` within a chunk
/// that begins at `chunk_start` globally.
pub fn make_block(
    data: Array3<f32>,
    slicing_dim: Dim,
    block_start: usize,
    chunk_start: usize,
    global_shape: Shape3,
    chunk_shape: Shape3,
) -> DataBlock<f32> {
    let n_angles = global_shape[0];
    DataBlock::new(
        data,
        plain_aux(n_angles),
        slicing_dim,
        block_start,
        chunk_start as isize,
        global_shape,
        chunk_shape,
    )
    .unwrap()
}

/// Runs `f` once per rank on its own thread, SPMD style, and returns the
/// per-rank results in rank order.
pub fn spmd<R, F>(size: usize, f: F) -> Vec<R>
where
    R: Send + 'static,
    F: Fn(ThreadedCommunicator) -> R + Send + Sync + Clone + 'static,
{
    let handles: Vec<_> = ThreadedCommunicator::create(size)
        .into_iter()
        .map(|comm| {
            let f = f.clone();
            thread::spawn(move || f(comm))
        })
        .collect();
    handles
        .into_iter()
        .map(|handle| handle.join().expect("rank thread panicked"))
        .collect()
}
