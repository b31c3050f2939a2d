// In tests/tsqr_pipeline_tests.rs

use float_cmp::assert_approx_eq;
use ndarray::Array2;
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tsqr_direct::compressor::canonicalize_signs;
use tsqr_direct::linalg_backends::{BackendQR, LinAlgBackendProvider};
use std::collections::BTreeMap;
use tsqr_direct::schedule::StepKind;
use tsqr_direct::substrate::Group;
use tsqr_direct::{
    ErrorKind, IncrementalQr, Key, KeyStrategy, KeyType, LocalExecutor, Record, RowEncoding, TsqrConfig, TsqrError,
    TsqrPipeline, WireValue,
};

const TOLERANCE: f64 = 1e-9;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn random_matrix(nrows: usize, ncols: usize, seed: u64) -> Array2<f64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    Array2::random_using((nrows, ncols), Normal::new(0.0, 1.0).unwrap(), &mut rng)
}

/// Splits the rows of `a` into `parts` contiguous chunks of random size, keyed by row index.
fn random_splits(a: &Array2<f64>, parts: usize, seed: u64, encoding: RowEncoding) -> Vec<Vec<Record>> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut cuts: Vec<usize> = (1..parts).map(|_| rng.gen_range(0..=a.nrows())).collect();
    cuts.push(0);
    cuts.push(a.nrows());
    cuts.sort_unstable();
    cuts.windows(2)
        .map(|w| {
            (w[0]..w[1])
                .map(|i| Record::from_row(Key::Int(i as u64), &a.row(i).to_vec(), encoding))
                .collect()
        })
        .collect()
}

fn reference_r(a: &Array2<f64>) -> Array2<f64> {
    let backend = LinAlgBackendProvider::<f64>::new();
    let mut r = backend.qr_r_factor(a).unwrap();
    canonicalize_signs(None, &mut r);
    r
}

fn assert_matrices_close(actual: &Array2<f64>, expected: &Array2<f64>, tolerance: f64) {
    assert_eq!(actual.dim(), expected.dim(), "shape mismatch");
    for ((idx, a), e) in actual.indexed_iter().zip(expected.iter()) {
        assert!((a - e).abs() <= tolerance, "entry {:?}: {} vs {}", idx, a, e);
    }
}

fn run(config: TsqrConfig, splits: Vec<Vec<Record>>) -> Array2<f64> {
    let blocksize = config.blocksize;
    let output = TsqrPipeline::new(config).unwrap().run(splits).unwrap();
    output.r_factor(blocksize).unwrap()
}

#[test]
fn single_stage_matches_direct_factorization() {
    init_logging();
    let a = random_matrix(400, 6, 1);
    let r = run(TsqrConfig::default(), random_splits(&a, 7, 2, RowEncoding::Text));
    assert_matrices_close(&r, &reference_r(&a), TOLERANCE);
}

#[test]
fn spray_schedule_matches_direct_factorization() {
    init_logging();
    let a = random_matrix(600, 5, 3);
    let config = TsqrConfig::from_options([("schedule", "4,s3,1"), ("seed", "11")]).unwrap();
    let r = run(config, random_splits(&a, 9, 4, RowEncoding::Binary));
    assert_matrices_close(&r, &reference_r(&a), TOLERANCE);
}

#[test]
fn spray_with_first_row_keys_matches_direct_factorization() {
    init_logging();
    let a = random_matrix(200, 4, 16);
    let config = TsqrConfig::from_options([("schedule", "4,s3,2"), ("keytype", "first")]).unwrap();
    let r = run(config, random_splits(&a, 6, 17, RowEncoding::Binary));
    assert_matrices_close(&r, &reference_r(&a), TOLERANCE);
}

/// Every lineage block must sit whole in exactly one partition.
fn assert_whole_blocks(partitions: &[Vec<Group>], block_rows: usize, blocks: usize) {
    let mut homes: BTreeMap<Key, (usize, usize)> = BTreeMap::new();
    for (p, groups) in partitions.iter().enumerate() {
        for group in groups {
            let block = group.key.prefix();
            let home = homes.entry(block.clone()).or_insert((p, 0));
            assert_eq!(home.0, p, "block {} is split across partitions", block);
            home.1 += group.values.len();
        }
    }
    assert_eq!(homes.len(), blocks);
    assert!(homes.values().all(|&(_, rows)| rows == block_rows));
}

#[test]
fn spray_partitions_hold_whole_lineage_blocks() {
    init_logging();
    let a = random_matrix(240, 4, 19);
    let executor = LocalExecutor::new();
    let emitted: Vec<Vec<Record>> = (0..12)
        .map(|w| {
            let mut qr = IncrementalQr::new(3);
            for i in w * 20..(w + 1) * 20 {
                qr.collect(&Key::Int(i as u64), &a.row(i).to_vec()).unwrap();
            }
            let mut strategy = KeyStrategy::for_worker(KeyType::First, None, 0, w);
            qr.finish().unwrap().emit(&mut strategy, RowEncoding::Binary)
        })
        .collect();

    let sprayed = executor.shuffle(emitted, 3);
    assert_whole_blocks(&sprayed, 4, 12);

    // The spray passes records through with their keys; the next stage regroups them.
    let passed_through: Vec<Vec<Record>> = sprayed
        .into_iter()
        .map(|groups| {
            groups
                .into_iter()
                .flat_map(|group| {
                    let key = group.key;
                    group.values.into_iter().map(move |value| Record::new(key.clone(), value))
                })
                .collect()
        })
        .collect();
    assert_whole_blocks(&executor.shuffle(passed_through, 2), 4, 12);
}

#[test]
fn multi_stage_first_row_keys_match_direct_factorization() {
    init_logging();
    let a = random_matrix(500, 4, 5);
    let config = TsqrConfig::from_options([("schedule", "5,3,1"), ("keytype", "first"), ("blocksize", "2")]).unwrap();
    let r = run(config, random_splits(&a, 12, 6, RowEncoding::Binary));
    assert_matrices_close(&r, &reference_r(&a), TOLERANCE);
}

#[test]
fn several_final_reducers_are_merged() {
    init_logging();
    let a = random_matrix(300, 4, 7);
    let config = TsqrConfig::from_options([("schedule", "3,2"), ("seed", "1")]).unwrap();
    let r = run(config, random_splits(&a, 6, 8, RowEncoding::Binary));
    assert_matrices_close(&r, &reference_r(&a), TOLERANCE);
}

#[test]
fn partitioning_does_not_change_r() {
    init_logging();
    let a = random_matrix(250, 5, 9);
    let coarse = run(TsqrConfig::default(), random_splits(&a, 2, 10, RowEncoding::Binary));
    let fine = run(
        TsqrConfig::from_options([("schedule", "8,1"), ("seed", "3")]).unwrap(),
        random_splits(&a, 40, 11, RowEncoding::Binary),
    );
    for (x, y) in coarse.iter().zip(fine.iter()) {
        assert_approx_eq!(f64, *x, *y, epsilon = TOLERANCE);
    }
}

#[test]
fn final_rows_are_text_and_keyed_by_row_index() {
    init_logging();
    let a = random_matrix(80, 3, 12);
    let output = TsqrPipeline::new(TsqrConfig::default())
        .unwrap()
        .run(random_splits(&a, 4, 13, RowEncoding::Binary))
        .unwrap();
    assert_eq!(output.records.len(), 3);
    for (i, record) in output.records.iter().enumerate() {
        assert_eq!(record.key, Key::Int(i as u64));
        assert!(matches!(record.value, WireValue::Text(_)));
    }
    assert!(output.counters.compressions > 0);
    assert!(output.counters.rows_processed >= 80);
}

#[test]
fn matrix_with_fewer_rows_than_columns_passes_through() {
    init_logging();
    let a = random_matrix(3, 6, 14);
    let output = TsqrPipeline::new(TsqrConfig::default())
        .unwrap()
        .run(random_splits(&a, 1, 15, RowEncoding::Binary))
        .unwrap();
    let r = output.r_factor(3).unwrap();
    // Rows pass through untouched, in whatever order the shuffle delivered them.
    let sorted_rows = |m: &Array2<f64>| {
        let mut rows: Vec<Vec<f64>> = m.rows().into_iter().map(|r| r.to_vec()).collect();
        rows.sort_by(|x, y| x.partial_cmp(y).unwrap());
        rows
    };
    assert_eq!(sorted_rows(&r), sorted_rows(&a));
    assert_eq!(output.counters.compressions, 0);
}

#[test]
fn empty_input_emits_nothing() {
    init_logging();
    let output = TsqrPipeline::new(TsqrConfig::default()).unwrap().run(vec![vec![], vec![]]).unwrap();
    assert!(output.records.is_empty());
}

#[test]
fn column_mismatch_aborts_the_run() {
    init_logging();
    let good: Vec<Record> = (0..30)
        .map(|i| Record::from_row(Key::Int(i), &[1.0 + i as f64; 10], RowEncoding::Binary))
        .collect();
    let bad = vec![Record::from_row(Key::Int(99), &[1.0; 9], RowEncoding::Binary)];
    let err = TsqrPipeline::new(TsqrConfig::default()).unwrap().run(vec![good, bad]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Format);
    assert!(matches!(err, TsqrError::ColumnMismatch { .. }));
}

#[test]
fn configured_ncols_rejects_other_widths_immediately() {
    init_logging();
    let config = TsqrConfig::from_options([("ncols", "4")]).unwrap();
    let split = vec![Record::from_row(Key::Int(0), &[1.0, 2.0, 3.0], RowEncoding::Text)];
    let err = TsqrPipeline::new(config).unwrap().run(vec![split]).unwrap_err();
    assert!(matches!(err, TsqrError::ColumnMismatch { expected: 4, found: 3 }));
}

#[test]
fn malformed_encoding_aborts_the_run() {
    init_logging();
    let split = vec![
        Record::from_row(Key::Int(0), &[1.0, 2.0], RowEncoding::Binary),
        Record::new(Key::Int(1), WireValue::Binary(vec![0u8; 11])),
    ];
    let err = TsqrPipeline::new(TsqrConfig::default()).unwrap().run(vec![split]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Format);
}

#[test]
fn bad_schedules_are_config_errors() {
    for schedule in ["abc", "-1", "4,s2", "", "0,1"] {
        let err = TsqrConfig::from_options([("schedule", schedule)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config, "schedule '{}'", schedule);
    }
}

#[test]
fn stage_layout_follows_the_schedule() {
    let config = TsqrConfig::from_options([("schedule", "100,s50,1")]).unwrap();
    let pipeline = TsqrPipeline::new(config).unwrap();
    let stages = pipeline.stages();
    assert_eq!(stages.len(), 3);
    assert_eq!(stages[0].map, StepKind::Compress);
    assert_eq!(stages[1].reduce, StepKind::Identity);
    assert_eq!(stages[2].reducers, 1);
    assert!(stages[2].is_final);
    assert_eq!(pipeline.config().keytype, KeyType::Random);
}
