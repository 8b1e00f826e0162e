//! Loader behaviour over real containers: chunk splits, image-key
//! filtering, calibration fields and padded reads from the file.

mod common;

use common::{arange, dim, spmd};
use ndarray::{s, Array};
use rustomo::comm::solo::SoloCommunicator;
use rustomo::loader::flatfile::{RawFlatFile, RawFlatFileWriter};
use rustomo::loader::mem::RawMem;
use rustomo::loader::{
    AnglesConfig, CalibrationInput, DarksFlatsConfig, LoaderConfig, PreviewConfig, PreviewDim,
    StandardLoader,
};
use rustomo::store::DataSetSource;
use rustomo::Communicator;

use tempfile::TempDir;

#[test]
fn loader_splits_the_retained_frames_across_ranks() {
    let results = spmd(3, |comm| {
        let global = arange((10, 4, 4));
        let raw = RawMem::new().with_volume("data", global.clone()).with_angles(
            "angles",
            (0..10).map(|v| v as f32).collect(),
        );
        let config = LoaderConfig {
            data_path: "data".to_string(),
            image_key_path: None,
            angles: AnglesConfig::Raw { data_path: "angles".to_string() },
            preview: None,
        };
        let mut loader =
            StandardLoader::new(Box::new(raw), config, None, None, dim(0), (0, 0), &comm)
                .unwrap();
        let chunk_len = loader.chunk_len();
        let index = loader.global_index();
        let block = loader.read_block(0, chunk_len).unwrap();
        (comm.rank(), index, chunk_len, block.into_data())
    });

    let global = arange((10, 4, 4));
    // round(10 r / 3): 0, 3, 7, 10
    let starts = [0_usize, 3, 7];
    let lens = [3_usize, 4, 3];
    for (rank, index, chunk_len, data) in results {
        assert_eq!(index, [starts[rank] as isize, 0, 0]);
        assert_eq!(chunk_len, lens[rank]);
        assert_eq!(
            data,
            global
                .slice(s![starts[rank]..starts[rank] + lens[rank], .., ..])
                .to_owned()
        );
    }
}

#[test]
fn image_key_and_preview_shape_the_loaded_volume() {
    // 12 raw frames: 2 flats, 8 projections, 2 darks
    let mut key = vec![0_i32; 12];
    key[0] = 1;
    key[1] = 1;
    key[10] = 2;
    key[11] = 2;
    let raw_volume = arange((12, 6, 6));
    let raw = RawMem::new()
        .with_volume("entry/data", raw_volume.clone())
        .with_image_key("entry/image_key", key)
        .with_angles("entry/angles", (0..12).map(|v| v as f32 * 0.5).collect());

    let config = LoaderConfig {
        data_path: "entry/data".to_string(),
        image_key_path: Some("entry/image_key".to_string()),
        angles: AnglesConfig::Raw { data_path: "entry/angles".to_string() },
        preview: Some(PreviewConfig {
            angles: PreviewDim { start: 0, stop: 12 },
            detector_y: PreviewDim { start: 1, stop: 5 },
            detector_x: PreviewDim { start: 2, stop: 6 },
        }),
    };
    let comm = SoloCommunicator::new();
    let darks = CalibrationInput {
        source: None,
        config: DarksFlatsConfig {
            data_path: "entry/data".to_string(),
            image_key_path: Some("entry/image_key".to_string()),
        },
    };
    let flats = CalibrationInput {
        source: None,
        config: DarksFlatsConfig {
            data_path: "entry/data".to_string(),
            image_key_path: Some("entry/image_key".to_string()),
        },
    };
    let mut loader = StandardLoader::new(
        Box::new(raw),
        config,
        Some(darks),
        Some(flats),
        dim(0),
        (0, 0),
        &comm,
    )
    .unwrap();

    // 8 projection frames, detector preview 4x4
    assert_eq!(loader.global_shape(), [8, 4, 4]);
    let aux = loader.aux();
    assert_eq!(aux.n_angles(), 8);
    // angles follow the retained frames 2..10
    assert!((aux.angles()[0] - 1.0).abs() < 1e-6);
    let darks = aux.darks().unwrap();
    assert_eq!(darks.shape(), &[2, 4, 4]);
    assert_eq!(darks, raw_volume.slice(s![10..12, 1..5, 2..6]));
    let flats = aux.flats().unwrap();
    assert_eq!(flats, raw_volume.slice(s![0..2, 1..5, 2..6]));

    let block = loader.read_block(2, 3).unwrap();
    assert_eq!(block.data(), raw_volume.slice(s![4..7, 1..5, 2..6]));
}

#[test]
fn padded_loader_blocks_extrapolate_at_the_volume_edges() {
    let global = arange((8, 4, 4));
    let raw = RawMem::new().with_volume("data", global.clone());
    let config = LoaderConfig {
        data_path: "data".to_string(),
        image_key_path: None,
        angles: AnglesConfig::UserDefined {
            start_angle: 0.0,
            stop_angle: 180.0,
            angles_total: 8,
        },
        preview: None,
    };
    let comm = SoloCommunicator::new();
    let mut loader =
        StandardLoader::new(Box::new(raw), config, None, None, dim(0), (2, 1), &comm).unwrap();

    assert_eq!(loader.chunk_shape(), [11, 4, 4]);
    assert_eq!(loader.global_index(), [-2, 0, 0]);

    let first = loader.read_block(0, 3).unwrap();
    assert_eq!(first.shape(), [6, 4, 4]);
    // two extrapolated leading slices, then frames 0..4
    assert_eq!(first.data().slice(s![0..1, .., ..]), global.slice(s![0..1, .., ..]));
    assert_eq!(first.data().slice(s![1..2, .., ..]), global.slice(s![0..1, .., ..]));
    assert_eq!(first.data().slice(s![2..6, .., ..]), global.slice(s![0..4, .., ..]));

    let last = loader.read_block(5, 3).unwrap();
    assert!(last.is_last_in_chunk());
    // frames 3..8 then one extrapolated trailing slice
    assert_eq!(last.data().slice(s![0..5, .., ..]), global.slice(s![3..8, .., ..]));
    assert_eq!(last.data().slice(s![5..6, .., ..]), global.slice(s![7..8, .., ..]));
}

#[test]
fn flat_container_feeds_the_loader() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("scan.rtr");
    let global = arange((6, 5, 5));
    let angles: Vec<f32> = (0..6).map(|v| v as f32 * 30.0).collect();

    let mut writer = RawFlatFileWriter::create(&path).unwrap();
    writer.add_volume("entry/data", global.view()).unwrap();
    writer.add_angles("entry/angles", &angles).unwrap();
    writer.finish().unwrap();

    let raw: RawFlatFile<f32> = RawFlatFile::open(&path).unwrap();
    let config = LoaderConfig {
        data_path: "entry/data".to_string(),
        image_key_path: None,
        angles: AnglesConfig::Raw { data_path: "entry/angles".to_string() },
        preview: Some(PreviewConfig {
            angles: PreviewDim { start: 1, stop: 5 },
            detector_y: PreviewDim { start: 0, stop: 5 },
            detector_x: PreviewDim { start: 1, stop: 4 },
        }),
    };
    let comm = SoloCommunicator::new();
    let mut loader =
        StandardLoader::new(Box::new(raw), config, None, None, dim(0), (0, 0), &comm).unwrap();

    assert_eq!(loader.global_shape(), [4, 5, 3]);
    assert_eq!(loader.dtype(), "f32");
    let block = loader.read_block(1, 2).unwrap();
    assert_eq!(block.data(), global.slice(s![2..4, 0..5, 1..4]));
    assert_eq!(block.global_index(), [1, 0, 0]);

    let aux = loader.aux();
    assert!((aux.angles()[0] - 30.0).abs() < 1e-6);
    assert_eq!(aux.n_angles(), 4);
}

#[test]
fn loader_rejects_non_zero_slicing_dims() {
    let raw: RawMem<f32> = RawMem::new().with_volume("data", Array::zeros((4, 4, 4)));
    let config = LoaderConfig {
        data_path: "data".to_string(),
        image_key_path: None,
        angles: AnglesConfig::UserDefined {
            start_angle: 0.0,
            stop_angle: 180.0,
            angles_total: 4,
        },
        preview: None,
    };
    let comm = SoloCommunicator::new();
    let result = StandardLoader::new(Box::new(raw), config, None, None, dim(1), (0, 0), &comm);
    assert!(result.is_err());
}
