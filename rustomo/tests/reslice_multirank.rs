//! Multi-rank reslice behaviour, run SPMD on threads.

mod common;

use common::{arange, dim, make_block, spmd};
use ndarray::{s, Array3};
use rustomo::store::writer::{Backing, DataSetStoreWriter};
use rustomo::store::{DataSetSink, DataSetSource};
use rustomo::Communicator;

use std::sync::Arc;
use tempfile::TempDir;

/// Global (10,10,10) split over two ranks on dim 0, resliced to dim 1;
/// every rank must end up with its detector-y share of the full volume.
fn two_rank_reslice(backings: [Backing; 2]) {
    let results = spmd(2, move |comm| {
        let temp = TempDir::new().unwrap();
        let rank = comm.rank();
        let global = arange((10, 10, 10));
        let chunk_start = rank * 5;

        let mut store = DataSetStoreWriter::new(dim(0), Arc::new(comm), temp.path())
            .with_backing(backings[rank]);
        let block = make_block(
            global.slice(s![chunk_start..chunk_start + 5, .., ..]).to_owned(),
            dim(0),
            0,
            chunk_start,
            [10, 10, 10],
            [5, 10, 10],
        );
        store.write_block(&block).unwrap();

        let mut reader = store.make_reader(Some(dim(1)), (0, 0)).unwrap();
        assert_eq!(reader.slicing_dim(), dim(1));
        assert_eq!(reader.global_shape(), [10, 10, 10]);
        assert_eq!(reader.chunk_shape(), [10, 5, 10]);
        assert_eq!(reader.global_index(), [0, rank as isize * 5, 0]);
        assert_eq!(reader.is_file_based(), backings[rank] == Backing::File);

        let block = reader.read_block(1, 2).unwrap();
        assert_eq!(block.shape(), [10, 2, 10]);
        assert_eq!(block.chunk_index(), [0, 1, 0]);
        (rank, block.into_data())
    });

    let global = arange((10, 10, 10));
    for (rank, data) in results {
        let lo = rank * 5 + 1;
        assert_eq!(data, global.slice(s![.., lo..lo + 2, ..]).to_owned());
    }
}

#[test]
fn two_rank_reslice_in_ram() {
    two_rank_reslice([Backing::Ram, Backing::Ram]);
}

#[test]
fn two_rank_reslice_one_rank_spilled() {
    two_rank_reslice([Backing::Ram, Backing::File]);
}

#[test]
fn two_rank_reslice_both_ranks_spilled() {
    two_rank_reslice([Backing::File, Backing::File]);
}

/// Reslicing 0→1 and then 1→0 with the same partitioning restores every
/// rank's original chunk bit for bit.
#[test]
fn reslice_is_its_own_inverse() {
    let results = spmd(2, |comm| {
        let temp = TempDir::new().unwrap();
        let rank = comm.rank();
        let comm: Arc<dyn rustomo::Communicator> = Arc::new(comm);
        let global = arange((10, 8, 6));
        let chunk_start = rank * 5;
        let original = global.slice(s![chunk_start..chunk_start + 5, .., ..]).to_owned();

        let mut store = DataSetStoreWriter::new(dim(0), Arc::clone(&comm), temp.path());
        store
            .write_block(&make_block(
                original.clone(),
                dim(0),
                0,
                chunk_start,
                [10, 8, 6],
                [5, 8, 6],
            ))
            .unwrap();
        let mut resliced = store.make_reader(Some(dim(1)), (0, 0)).unwrap();

        // Stream the resliced chunk into a second store, then reslice back.
        let mut back_store = DataSetStoreWriter::new(dim(1), Arc::clone(&comm), temp.path());
        let len = resliced.chunk_len();
        let block = resliced.read_block(0, len).unwrap();
        back_store.write_block(&block).unwrap();
        let mut restored = back_store.make_reader(Some(dim(0)), (0, 0)).unwrap();

        let restored_len = restored.chunk_len();
        let data = restored.read_block(0, restored_len).unwrap().into_data();
        (original, data)
    });

    for (original, restored) in results {
        assert_eq!(restored, original);
    }
}

/// Three ranks over an extent the ceil split cuts unevenly (4, 4, 2).
#[test]
fn three_rank_reslice_with_remainder() {
    let results = spmd(3, |comm| {
        let temp = TempDir::new().unwrap();
        let rank = comm.rank();
        let global = arange((9, 10, 4));
        // dim-0 ingestion split by the rounding rule: round(9 r / 3) = 0, 3, 6
        let chunk_start = rank * 3;

        let mut store = DataSetStoreWriter::new(dim(0), Arc::new(comm), temp.path());
        store
            .write_block(&make_block(
                global.slice(s![chunk_start..chunk_start + 3, .., ..]).to_owned(),
                dim(0),
                0,
                chunk_start,
                [9, 10, 4],
                [3, 10, 4],
            ))
            .unwrap();

        let mut reader = store.make_reader(Some(dim(1)), (0, 0)).unwrap();
        let expected_len = [4, 4, 2][rank];
        assert_eq!(reader.chunk_shape(), [9, expected_len, 4]);
        assert_eq!(reader.global_index(), [0, (rank * 4) as isize, 0]);
        let data = reader.read_block(0, expected_len).unwrap().into_data();
        (rank, data)
    });

    let global = arange((9, 10, 4));
    let starts = [0, 4, 8];
    let lens = [4, 4, 2];
    for (rank, data) in results {
        let expected: Array3<f32> = global
            .slice(s![.., starts[rank]..starts[rank] + lens[rank], ..])
            .to_owned();
        assert_eq!(data, expected);
    }
}
