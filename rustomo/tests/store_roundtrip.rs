//! Single-rank store behaviour: write/read round-trips on both backings
//! and the metadata-only reslice.

mod common;

use common::{arange, dim, make_block};
use ndarray::s;
use rustomo::comm::solo::SoloCommunicator;
use rustomo::store::writer::{Backing, DataSetStoreWriter};
use rustomo::store::{DataSetSink, DataSetSource};

use std::sync::Arc;
use tempfile::TempDir;

fn writer(temp: &TempDir, backing: Backing) -> DataSetStoreWriter<f32> {
    DataSetStoreWriter::new(dim(0), Arc::new(SoloCommunicator::new()), temp.path())
        .with_backing(backing)
}

/// Writes two length-2 blocks of a chunk starting at global offset 3 and
/// reads them back unchanged.
fn roundtrip_two_blocks(backing: Backing) {
    let temp = TempDir::new().unwrap();
    let global = arange((10, 10, 10));
    let global_shape = [10, 10, 10];
    let chunk_shape = [4, 10, 10];
    let chunk_start = 3;

    let mut store = writer(&temp, backing);
    for block_start in [0_usize, 2] {
        let lo = chunk_start + block_start;
        let block = make_block(
            global.slice(s![lo..lo + 2, .., ..]).to_owned(),
            dim(0),
            block_start,
            chunk_start,
            global_shape,
            chunk_shape,
        );
        store.write_block(&block).unwrap();
    }
    assert_eq!(store.is_file_based(), backing == Backing::File);
    assert_eq!(store.global_shape(), Some(global_shape));
    assert_eq!(store.chunk_shape(), Some(chunk_shape));
    assert_eq!(store.global_index(), Some([3, 0, 0]));

    let mut reader = store.make_reader(None, (0, 0)).unwrap();
    assert_eq!(reader.global_shape(), global_shape);
    assert_eq!(reader.chunk_shape(), chunk_shape);
    assert_eq!(reader.global_index(), [3, 0, 0]);
    assert_eq!(reader.is_file_based(), backing == Backing::File);

    let first = reader.read_block(0, 2).unwrap();
    let second = reader.read_block(2, 2).unwrap();
    assert_eq!(first.data(), global.slice(s![3..5, .., ..]));
    assert_eq!(second.data(), global.slice(s![5..7, .., ..]));

    // One read over the whole chunk is bit-identical too
    let whole = reader.read_block(0, 4).unwrap();
    assert_eq!(whole.data(), global.slice(s![3..7, .., ..]));
    reader.finalize().unwrap();
}

#[test]
fn roundtrip_in_ram() {
    roundtrip_two_blocks(Backing::Ram);
}

#[test]
fn roundtrip_file_backed() {
    roundtrip_two_blocks(Backing::File);
}

#[test]
fn zero_padding_readback_is_bit_identical() {
    for backing in [Backing::Ram, Backing::File] {
        let temp = TempDir::new().unwrap();
        let data = arange((6, 5, 5));
        let mut store = writer(&temp, backing);
        store
            .write_block(&make_block(data.clone(), dim(0), 0, 0, [6, 5, 5], [6, 5, 5]))
            .unwrap();
        let mut reader = store.make_reader(None, (0, 0)).unwrap();
        let block = reader.read_block(0, 6).unwrap();
        assert_eq!(block.data(), data.view());
    }
}

/// Reslicing on a single rank only relabels the slicing axis.
#[test]
fn single_rank_reslice_serves_the_new_axis() {
    for backing in [Backing::Ram, Backing::File] {
        let temp = TempDir::new().unwrap();
        let data = arange((10, 10, 10));
        let mut store = writer(&temp, backing);
        store
            .write_block(&make_block(
                data.clone(),
                dim(0),
                0,
                0,
                [10, 10, 10],
                [10, 10, 10],
            ))
            .unwrap();

        let mut reader = store.make_reader(Some(dim(1)), (0, 0)).unwrap();
        assert_eq!(reader.slicing_dim(), dim(1));
        assert_eq!(reader.global_shape(), [10, 10, 10]);
        assert_eq!(reader.chunk_shape(), [10, 10, 10]);
        assert_eq!(reader.global_index(), [0, 0, 0]);
        assert_eq!(reader.is_file_based(), backing == Backing::File);

        let block = reader.read_block(1, 2).unwrap();
        assert_eq!(block.shape(), [10, 2, 10]);
        assert_eq!(block.chunk_index(), [0, 1, 0]);
        assert_eq!(block.data(), data.slice(s![.., 1..3, ..]));
    }
}

#[test]
fn auto_backing_spills_on_memory_limit() {
    let temp = TempDir::new().unwrap();
    let data = arange((4, 4, 4));
    let mut store = DataSetStoreWriter::new(
        dim(0),
        Arc::new(SoloCommunicator::new()),
        temp.path(),
    )
    // chunk needs 4*4*4*4 = 256 bytes, only one block fits
    .with_memory_limit(100);
    store
        .write_block(&make_block(data.clone(), dim(0), 0, 0, [4, 4, 4], [4, 4, 4]))
        .unwrap();
    assert!(store.is_file_based());

    let mut reader = store.make_reader(None, (0, 0)).unwrap();
    assert!(reader.is_file_based());
    assert_eq!(reader.read_block(0, 4).unwrap().data(), data.view());
}
