// src/direct.rs

//! Direct TSQR: the explicit orthogonal factor and singular vectors in three phases.
//!
//! 1. Every source partition is factored on its own, `A_p = Q1_p * R_p`. Only `R_p` and
//!    the partition's row count leave the worker.
//! 2. The stacked `R_p` are factored centrally, `[R_1; ...; R_P] = Q2 * R`. `Q2` is cut
//!    into one block per partition. When singular vectors are wanted, `R = U * S * V^t`.
//! 3. Every partition is read again and factored with the same compression sequence, this
//!    time keeping `Q1_p`. Its rows of the global factor are `Q1_p * Q2_p`, or
//!    `Q1_p * Q2_p * U` for the left singular vectors.
//!
//! `Q2` and `U` are the only state crossing from phase 2 to phase 3. They travel in a
//! [`BroadcastArtifact`] that phase 3 workers only ever read.

use log::{debug, info, warn};
use ndarray::{s, Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use crate::compressor::{canonicalize_signs, CompressedBlock, CompressorCounters, IncrementalQr};
use crate::config::{DirectMode, TsqrConfig};
use crate::error::TsqrError;
use crate::keys::{Key, KeyStrategy};
use crate::linalg_backends::{BackendQR, BackendSVD, LinAlgBackendProvider, QROutput, SVDOutput};
use crate::matmul::ts_matmul;
use crate::schedule::Schedule;
use crate::substrate::LocalExecutor;
use crate::wire::{
    assemble_by_key, decode_row, encode_view, format_text_row, parse_text_row, read_text_matrix, rows_to_matrix,
    write_text_matrix, Record, RowEncoding,
};

pub const LEDGER_FILE: &str = "ledger.bin";
pub const Q2_FILE: &str = "Q2.txt";
pub const U_FILE: &str = "U.txt";

/// Identity and size of one factored source partition. Its R rows travel separately,
/// serialized, in [`Phase1Output::records`].
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionFactor {
    /// Smallest source row key in the partition.
    pub partition: Key,
    pub row_count: usize,
}

/// Row counts recorded by phase 1, checked again by phase 3.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionLedger {
    pub ncols: usize,
    pub row_counts: BTreeMap<Key, usize>,
}

impl PartitionLedger {
    /// # Errors
    /// `TsqrError::ReconstructionMismatch` when two partitions claim the same identity.
    pub fn from_factors(ncols: usize, factors: &[PartitionFactor]) -> Result<Self, TsqrError> {
        let mut row_counts = BTreeMap::new();
        for factor in factors {
            if row_counts.insert(factor.partition.clone(), factor.row_count).is_some() {
                return Err(TsqrError::ReconstructionMismatch {
                    partition: factor.partition.to_string(),
                    detail: "two partitions share their smallest row key".to_string(),
                });
            }
        }
        Ok(PartitionLedger { ncols, row_counts })
    }

    pub fn total_rows(&self) -> usize {
        self.row_counts.values().sum()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), TsqrError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| TsqrError::io(path, e))?;
        let mut writer = BufWriter::new(file);
        bincode::serde::encode_into_std_write(self, &mut writer, bincode::config::standard())
            .map_err(|e| TsqrError::Serialization(format!("failed to write ledger {:?}: {}", path, e)))?;
        writer.flush().map_err(|e| TsqrError::io(path, e))?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, TsqrError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| TsqrError::io(path, e))?;
        let mut reader = BufReader::new(file);
        let ledger: PartitionLedger = bincode::serde::decode_from_std_read(&mut reader, bincode::config::standard())
            .map_err(|e| TsqrError::Serialization(format!("failed to read ledger {:?}: {}", path, e)))?;
        Ok(ledger)
    }
}

/// Small matrices published by phase 2 for every phase 3 worker.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastArtifact {
    /// Rows of `Q2` belonging to each partition.
    pub q2: BTreeMap<Key, Array2<f64>>,
    /// Left singular vectors of the global R.
    pub u: Option<Array2<f64>>,
}

impl BroadcastArtifact {
    /// Writes `Q2.txt` (one `key<TAB>row` line per row) and, if present, `U.txt`.
    pub fn write_to<P: AsRef<Path>>(&self, dir: P) -> Result<(), TsqrError> {
        let dir = dir.as_ref();
        let q2_path = dir.join(Q2_FILE);
        let file = File::create(&q2_path).map_err(|e| TsqrError::io(&q2_path, e))?;
        let mut writer = BufWriter::new(file);
        for (partition, block) in &self.q2 {
            for row in block.rows() {
                writeln!(writer, "{}\t{}", partition, format_text_row(row.iter().copied()))
                    .map_err(|e| TsqrError::io(&q2_path, e))?;
            }
        }
        writer.flush().map_err(|e| TsqrError::io(&q2_path, e))?;
        if let Some(u) = &self.u {
            write_text_matrix(dir.join(U_FILE), u.view())?;
        }
        debug!("Published Q2 blocks for {} partitions to {:?}", self.q2.len(), dir);
        Ok(())
    }

    /// Reads what [`write_to`](Self::write_to) wrote. `U.txt` is optional.
    pub fn read_from<P: AsRef<Path>>(dir: P) -> Result<Self, TsqrError> {
        let dir = dir.as_ref();
        let q2_path = dir.join(Q2_FILE);
        let file = File::open(&q2_path).map_err(|e| TsqrError::io(&q2_path, e))?;
        let mut rows: BTreeMap<Key, Vec<Vec<f64>>> = BTreeMap::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| TsqrError::io(&q2_path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let (key, values) = line
                .split_once('\t')
                .ok_or_else(|| TsqrError::MalformedRow(format!("Q2 line without a key: '{}'", line)))?;
            rows.entry(key.parse()?).or_default().push(parse_text_row(values)?);
        }
        let mut q2 = BTreeMap::new();
        for (key, block_rows) in rows {
            q2.insert(key, stack_rows(block_rows)?);
        }
        let u_path = dir.join(U_FILE);
        let u = if u_path.exists() { Some(read_text_matrix(&u_path)?) } else { None };
        Ok(BroadcastArtifact { q2, u })
    }
}

fn stack_rows(rows: Vec<Vec<f64>>) -> Result<Array2<f64>, TsqrError> {
    let ncols = rows.first().map_or(0, Vec::len);
    let nrows = rows.len();
    let mut data = Vec::with_capacity(nrows * ncols);
    for row in rows {
        if row.len() != ncols {
            return Err(TsqrError::ColumnMismatch { expected: ncols, found: row.len() });
        }
        data.extend(row);
    }
    Array2::from_shape_vec((nrows, ncols), data).map_err(|e| TsqrError::MalformedRow(format!("could not assemble block: {}", e)))
}

#[derive(Debug, Clone)]
pub struct Phase1Output {
    pub factors: Vec<PartitionFactor>,
    /// The local R rows of `factors[i]`, binary encoded and keyed by the configured
    /// discipline. Phase 2 reads R from these.
    pub records: Vec<Vec<Record>>,
    pub counters: CompressorCounters,
}

#[derive(Debug, Clone)]
pub struct Phase2Output {
    pub r: Array2<f64>,
    /// Global R rows keyed by row index.
    pub r_records: Vec<Record>,
    pub singular_values: Option<Array1<f64>>,
    pub vt: Option<Array2<f64>>,
    pub broadcast: BroadcastArtifact,
}

#[derive(Debug, Clone)]
pub struct Phase3Output {
    /// Rows of Q, or of the left singular vectors when `U` was broadcast, keyed by
    /// the source row keys.
    pub records: Vec<Vec<Record>>,
    pub counters: CompressorCounters,
}

/// Everything a Direct-Q run produced for its mode.
#[derive(Debug, Clone)]
pub struct DirectOutput {
    pub mode: DirectMode,
    pub r: Array2<f64>,
    pub singular_values: Option<Array1<f64>>,
    pub vt: Option<Array2<f64>>,
    pub q: Option<Vec<Record>>,
    pub left_singular_vectors: Option<Vec<Record>>,
    pub counters: CompressorCounters,
}

impl DirectOutput {
    /// The explicit Q in source-key order.
    pub fn q_matrix(&self) -> Result<Option<Array2<f64>>, TsqrError> {
        self.q.as_deref().map(assemble_by_key).transpose()
    }

    /// The left singular vectors in source-key order.
    pub fn left_singular_vectors_matrix(&self) -> Result<Option<Array2<f64>>, TsqrError> {
        self.left_singular_vectors.as_deref().map(assemble_by_key).transpose()
    }
}

pub struct DirectTsqr {
    config: TsqrConfig,
    ncols: usize,
    executor: LocalExecutor,
    backend: LinAlgBackendProvider<f64>,
}

impl DirectTsqr {
    /// # Errors
    /// `TsqrError::Config` when `ncols` is missing or a schedule other than the
    /// single-reducer default is set. Direct-Q runs fixed phases, one worker per split.
    pub fn new(config: TsqrConfig) -> Result<Self, TsqrError> {
        config.validate()?;
        let ncols = config.require_ncols()?;
        if config.schedule != Schedule::single_reducer() {
            return Err(TsqrError::config(format!(
                "Direct-Q runs fixed phases and takes no stage schedule (got {})",
                config.schedule
            )));
        }
        Ok(DirectTsqr { config, ncols, executor: LocalExecutor::new(), backend: LinAlgBackendProvider::new() })
    }

    pub fn config(&self) -> &TsqrConfig {
        &self.config
    }

    /// Factors every source partition independently.
    pub fn phase1(&self, splits: Vec<Vec<Record>>) -> Result<Phase1Output, TsqrError> {
        let start = Instant::now();
        let outputs = self.executor.run_map(splits, |worker, split| {
            let block = self.factor_partition(&split, false)?;
            let Some(partition) = block.first_key.clone() else {
                warn!("Phase 1 partition {} is empty", worker);
                return Ok(None);
            };
            let mut strategy = KeyStrategy::for_worker(self.config.keytype, self.config.seed, 0, worker);
            let records = block.emit(&mut strategy, RowEncoding::Binary);
            let factor = PartitionFactor { partition, row_count: block.rows_seen };
            Ok(Some((factor, records, block.counters)))
        })?;

        let mut factors = Vec::new();
        let mut records = Vec::new();
        let mut counters = CompressorCounters::default();
        for (factor, emitted, worker_counters) in outputs.into_iter().flatten() {
            factors.push(factor);
            records.push(emitted);
            counters += worker_counters;
        }
        info!("Phase 1 factored {} partitions in {:?}", factors.len(), start.elapsed());
        Ok(Phase1Output { factors, records, counters })
    }

    /// Combines the partition factors into the global R, `Q2` and, if the mode asks, the SVD.
    pub fn phase2(&self, phase1: &Phase1Output) -> Result<Phase2Output, TsqrError> {
        let start = Instant::now();
        if phase1.records.len() != phase1.factors.len() {
            return Err(TsqrError::ReconstructionMismatch {
                partition: "*".to_string(),
                detail: format!(
                    "{} partitions but {} shipped R blocks",
                    phase1.factors.len(),
                    phase1.records.len()
                ),
            });
        }
        let mut by_partition: BTreeMap<&Key, Array2<f64>> = BTreeMap::new();
        for (factor, shipped) in phase1.factors.iter().zip(&phase1.records) {
            let local_r = rows_to_matrix(shipped.iter().map(|record| &record.value))?;
            if local_r.ncols() != self.ncols {
                return Err(TsqrError::ColumnMismatch { expected: self.ncols, found: local_r.ncols() });
            }
            if by_partition.insert(&factor.partition, local_r).is_some() {
                return Err(TsqrError::ReconstructionMismatch {
                    partition: factor.partition.to_string(),
                    detail: "two partitions share their smallest row key".to_string(),
                });
            }
        }

        let stacked_rows: usize = by_partition.values().map(|m| m.nrows()).sum();
        let mut stacked = Array2::<f64>::zeros((stacked_rows, self.ncols));
        let mut offset = 0;
        for local_r in by_partition.values() {
            stacked.slice_mut(s![offset..offset + local_r.nrows(), ..]).assign(local_r);
            offset += local_r.nrows();
        }

        let QROutput { mut q, mut r } = self.backend.qr_thin(&stacked)?;
        canonicalize_signs(Some(&mut q), &mut r);
        debug!("Phase 2 stacked {} rows from {} partitions into a {}x{} R", stacked_rows, by_partition.len(), r.nrows(), r.ncols());

        let mut q2 = BTreeMap::new();
        let mut offset = 0;
        for (partition, local_r) in &by_partition {
            let rows = local_r.nrows();
            q2.insert((*partition).clone(), q.slice(s![offset..offset + rows, ..]).to_owned());
            offset += rows;
        }

        let mode = self.config.svd;
        let (singular_values, vt, u) = if mode.needs_svd() {
            let SVDOutput { u, s, vt } = self.backend.svd_into(r.clone(), mode.needs_left_vectors(), mode.needs_left_vectors())?;
            (Some(s), vt, u)
        } else {
            (None, None, None)
        };

        let r_records = r
            .rows()
            .into_iter()
            .enumerate()
            .map(|(i, row)| Record::new(Key::Int(i as u64), encode_view(row, RowEncoding::Text)))
            .collect();
        info!("Phase 2 finished in {:?}", start.elapsed());
        Ok(Phase2Output { r, r_records, singular_values, vt, broadcast: BroadcastArtifact { q2, u } })
    }

    /// Re-reads every partition and emits its rows of `Q1 * Q2`, or of `Q1 * Q2 * U`
    /// when the artifact carries `U`.
    ///
    /// # Errors
    /// `TsqrError::ReconstructionMismatch` when a partition is unknown to the ledger,
    /// sees a different number of rows than in phase 1, has a `Q2` block of the wrong
    /// shape, or does not turn up at all.
    pub fn phase3(
        &self,
        splits: Vec<Vec<Record>>,
        broadcast: &BroadcastArtifact,
        ledger: &PartitionLedger,
    ) -> Result<Phase3Output, TsqrError> {
        let start = Instant::now();
        let outputs = self.executor.run_map(splits, |worker, split| {
            let block = self.factor_partition(&split, true)?;
            let Some(partition) = block.first_key.clone() else {
                debug!("Phase 3 partition {} is empty", worker);
                return Ok(None);
            };
            let mismatch = |detail: String| TsqrError::ReconstructionMismatch { partition: partition.to_string(), detail };

            let expected = ledger
                .row_counts
                .get(&partition)
                .ok_or_else(|| mismatch("partition was not seen in phase 1".to_string()))?;
            if *expected != block.rows_seen {
                return Err(mismatch(format!("phase 1 recorded {} rows, phase 3 read {}", expected, block.rows_seen)));
            }
            let q2_block = broadcast
                .q2
                .get(&partition)
                .ok_or_else(|| mismatch("no Q2 block was broadcast".to_string()))?;
            let q1 = block
                .q
                .as_ref()
                .ok_or_else(|| mismatch("orthogonal factor was not retained".to_string()))?;
            if q2_block.nrows() != q1.ncols() {
                return Err(mismatch(format!(
                    "Q2 block has {} rows but the local factor has {} columns",
                    q2_block.nrows(),
                    q1.ncols()
                )));
            }

            let target = match &broadcast.u {
                Some(u) => q2_block.dot(u),
                None => q2_block.clone(),
            };
            let rows = q1.dot(&target);
            let records: Vec<Record> = block
                .row_keys
                .iter()
                .zip(rows.rows())
                .map(|(key, row)| Record::new(key.clone(), encode_view(row, RowEncoding::Text)))
                .collect();
            Ok(Some((partition, records, block.counters)))
        })?;

        let mut seen = BTreeSet::new();
        let mut records = Vec::new();
        let mut counters = CompressorCounters::default();
        for (partition, emitted, worker_counters) in outputs.into_iter().flatten() {
            if !seen.insert(partition.clone()) {
                return Err(TsqrError::ReconstructionMismatch {
                    partition: partition.to_string(),
                    detail: "partition was read twice".to_string(),
                });
            }
            records.push(emitted);
            counters += worker_counters;
        }
        if let Some(missing) = ledger.row_counts.keys().find(|k| !seen.contains(*k)) {
            return Err(TsqrError::ReconstructionMismatch {
                partition: missing.to_string(),
                detail: "partition recorded in phase 1 was not read in phase 3".to_string(),
            });
        }
        info!("Phase 3 rebuilt {} partitions in {:?}", seen.len(), start.elapsed());
        Ok(Phase3Output { records, counters })
    }

    /// Runs all phases in memory. `splits` is read once by phase 1 and again by phase 3.
    pub fn run(&self, splits: &[Vec<Record>]) -> Result<DirectOutput, TsqrError> {
        let start = Instant::now();
        let phase1 = self.phase1(splits.to_vec())?;
        let ledger = PartitionLedger::from_factors(self.ncols, &phase1.factors)?;
        let phase2 = self.phase2(&phase1)?;
        let output = self.finish(splits, phase1.counters, phase2, &ledger, None)?;
        info!("Direct-Q (mode {}) finished in {:?}", self.config.svd.code(), start.elapsed());
        Ok(output)
    }

    /// Like [`run`](Self::run), but the ledger and broadcast matrices go through files in
    /// `workdir` and phase 3 works from the reloaded copies.
    pub fn run_staged<P: AsRef<Path>>(&self, splits: &[Vec<Record>], workdir: P) -> Result<DirectOutput, TsqrError> {
        let workdir = workdir.as_ref();
        let start = Instant::now();
        let phase1 = self.phase1(splits.to_vec())?;
        PartitionLedger::from_factors(self.ncols, &phase1.factors)?.save(workdir.join(LEDGER_FILE))?;
        let phase2 = self.phase2(&phase1)?;
        phase2.broadcast.write_to(workdir)?;

        let ledger = PartitionLedger::load(workdir.join(LEDGER_FILE))?;
        let broadcast = BroadcastArtifact::read_from(workdir)?;
        let output = self.finish(splits, phase1.counters, phase2, &ledger, Some(broadcast))?;
        info!("Staged Direct-Q (mode {}) finished in {:?}", self.config.svd.code(), start.elapsed());
        Ok(output)
    }

    fn finish(
        &self,
        splits: &[Vec<Record>],
        mut counters: CompressorCounters,
        phase2: Phase2Output,
        ledger: &PartitionLedger,
        reloaded: Option<BroadcastArtifact>,
    ) -> Result<DirectOutput, TsqrError> {
        let mode = self.config.svd;
        let mut output = DirectOutput {
            mode,
            r: phase2.r,
            singular_values: phase2.singular_values,
            vt: phase2.vt,
            q: None,
            left_singular_vectors: None,
            counters,
        };
        if !mode.needs_second_pass() {
            return Ok(output);
        }

        let broadcast = reloaded.unwrap_or(phase2.broadcast);
        match mode {
            DirectMode::SvdOnly => {
                let phase3 = self.phase3(splits.to_vec(), &broadcast, ledger)?;
                counters += phase3.counters;
                output.left_singular_vectors = Some(phase3.records.into_iter().flatten().collect());
            }
            _ => {
                let u = broadcast.u.clone();
                let q_only = BroadcastArtifact { q2: broadcast.q2, u: None };
                let phase3 = self.phase3(splits.to_vec(), &q_only, ledger)?;
                counters += phase3.counters;
                if let Some(u) = u {
                    let left = ts_matmul(&self.executor, phase3.records.clone(), &u)?;
                    output.left_singular_vectors = Some(left.into_iter().flatten().collect());
                }
                output.q = Some(phase3.records.into_iter().flatten().collect());
            }
        }
        output.counters = counters;
        Ok(output)
    }

    /// One compression pass over a partition in source-key order, so phase 1 and phase 3
    /// run the same compression sequence however the rows arrive.
    fn factor_partition(&self, split: &[Record], retain_q: bool) -> Result<CompressedBlock, TsqrError> {
        let mut ordered: Vec<&Record> = split.iter().collect();
        ordered.sort_by(|a, b| a.key.cmp(&b.key));
        let mut qr = IncrementalQr::new(self.config.blocksize).with_ncols(self.ncols);
        if retain_q {
            qr = qr.retaining_q();
        }
        for record in ordered {
            qr.collect(&record.key, &decode_row(&record.value)?)?;
        }
        qr.finish()
    }
}
