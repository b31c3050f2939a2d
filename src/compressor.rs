// src/compressor.rs

//! The incremental block-QR compressor run by every worker instance.
//!
//! Rows are appended to an owned accumulator. Once the accumulator holds more than
//! `blocksize * ncols` rows it is replaced by the R factor of its contents, which bounds
//! memory to `O(blocksize * ncols^2)` no matter how long the stream is. Concatenating the
//! R factors of disjoint row sets and factoring again yields the R factor of their union,
//! so the order rows arrive in and how they are partitioned never matter.

use log::{debug, trace};
use ndarray::{s, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use std::time::Instant;

use crate::error::TsqrError;
use crate::keys::{Key, KeyStrategy};
use crate::linalg_backends::{BackendQR, LinAlgBackendProvider, QROutput};
use crate::wire::{encode_view, Record, RowEncoding};

/// Rows between two "rows processed" counter updates.
pub const ROW_REPORT_INTERVAL: u64 = 50_000;

/// Observational telemetry. Never consulted by the algorithm.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressorCounters {
    pub rows_processed: u64,
    pub compressions: u64,
    pub compression_millis: u64,
}

impl AddAssign for CompressorCounters {
    fn add_assign(&mut self, other: Self) {
        self.rows_processed += other.rows_processed;
        self.compressions += other.compressions;
        self.compression_millis += other.compression_millis;
    }
}

/// Flips signs so every diagonal entry of `r` is non-negative, adjusting the matching
/// columns of `q` so that `q * r` is unchanged. Makes R unique for full-rank input.
pub fn canonicalize_signs(mut q: Option<&mut Array2<f64>>, r: &mut Array2<f64>) {
    let k = r.nrows().min(r.ncols());
    for i in 0..k {
        if r[[i, i]] < 0.0 {
            r.row_mut(i).mapv_inplace(|v| -v);
            if let Some(q) = q.as_deref_mut() {
                q.column_mut(i).mapv_inplace(|v| -v);
            }
        }
    }
}

/// Orthogonal factors of each compression, kept so the explicit Q of every row that
/// went through the accumulator can be rebuilt at the end.
#[derive(Debug, Default)]
struct OrthogonalHistory {
    /// For each compression: how many leading accumulator rows were a previous R,
    /// and the thin Q of that compression.
    steps: Vec<(usize, Array2<f64>)>,
    row_keys: Vec<Key>,
}

impl OrthogonalHistory {
    /// Q for every row seen, in arrival order, such that `source = Q * R_final`.
    ///
    /// Each compression factored `[R_prev; tail] = Qc * Rc`, so rows that were already
    /// represented by `R_prev` pick up `Qc[..covered]` and the tail rows get `Qc[covered..]`.
    /// Walking the steps backwards accumulates those products in `O(rows * ncols^2)`.
    fn assemble(&self) -> Result<Array2<f64>, TsqrError> {
        let total_rows = self.row_keys.len();
        let Some((_, last_q)) = self.steps.last() else {
            return Ok(Array2::eye(total_rows));
        };
        let k = last_q.ncols();
        let mut tails: Vec<Array2<f64>> = Vec::with_capacity(self.steps.len());
        let mut carry = Array2::<f64>::eye(k);
        for (covered, qc) in self.steps.iter().rev() {
            tails.push(qc.slice(s![*covered.., ..]).dot(&carry));
            carry = qc.slice(s![..*covered, ..]).dot(&carry);
        }
        let views: Vec<ArrayView2<f64>> = tails.iter().rev().map(|t| t.view()).collect();
        ndarray::concatenate(Axis(0), &views)
            .map_err(|e| TsqrError::MalformedRow(format!("orthogonal factor assembly: {}", e)))
    }
}

/// Result of finalizing a compressor.
#[derive(Debug, Clone)]
pub struct CompressedBlock {
    /// Key of the first row the accumulator ever saw.
    pub first_key: Option<Key>,
    /// The R factor, or the raw rows when fewer than `ncols` rows were ever seen.
    pub r: Array2<f64>,
    /// Explicit orthogonal factor for every row seen, when retention was requested.
    pub q: Option<Array2<f64>>,
    /// Source keys in arrival order, when retention was requested.
    pub row_keys: Vec<Key>,
    pub rows_seen: usize,
    pub counters: CompressorCounters,
}

impl CompressedBlock {
    pub fn ncols(&self) -> usize {
        self.r.ncols()
    }

    /// Emits every retained row under a key chosen by `strategy`.
    pub fn emit(&self, strategy: &mut KeyStrategy, encoding: RowEncoding) -> Vec<Record> {
        self.r
            .rows()
            .into_iter()
            .enumerate()
            .map(|(i, row)| Record::new(strategy.key_for(self.first_key.as_ref(), i), encode_view(row, encoding)))
            .collect()
    }
}

/// Accumulates rows and keeps them compressed to an R factor.
#[derive(Debug)]
pub struct IncrementalQr {
    blocksize: usize,
    ncols: Option<usize>,
    /// Row-major accumulator contents.
    block: Vec<f64>,
    block_rows: usize,
    first_key: Option<Key>,
    rows_seen: usize,
    /// Leading accumulator rows that are an R factor rather than raw input.
    covered_rows: usize,
    history: Option<OrthogonalHistory>,
    counters: CompressorCounters,
    backend: LinAlgBackendProvider<f64>,
}

impl IncrementalQr {
    pub fn new(blocksize: usize) -> Self {
        IncrementalQr {
            blocksize: blocksize.max(1),
            ncols: None,
            block: Vec::new(),
            block_rows: 0,
            first_key: None,
            rows_seen: 0,
            covered_rows: 0,
            history: None,
            counters: CompressorCounters::default(),
            backend: LinAlgBackendProvider::new(),
        }
    }

    /// Fixes the column count up front instead of taking it from the first row.
    pub fn with_ncols(mut self, ncols: usize) -> Self {
        self.ncols = Some(ncols);
        self
    }

    /// Keeps the orthogonal factor of every compression so `finish` can return the
    /// explicit Q of the rows seen. Costs `O(rows * ncols)` memory.
    pub fn retaining_q(mut self) -> Self {
        self.history = Some(OrthogonalHistory::default());
        self
    }

    pub fn ncols(&self) -> Option<usize> {
        self.ncols
    }

    pub fn rows_seen(&self) -> usize {
        self.rows_seen
    }

    pub fn counters(&self) -> CompressorCounters {
        self.counters
    }

    /// A copy of the current accumulator contents.
    pub fn block(&self) -> Array2<f64> {
        let ncols = self.ncols.unwrap_or(0);
        Array2::from_shape_fn((self.block_rows, ncols), |(i, j)| self.block[i * ncols + j])
    }

    /// Appends one row, compressing when the accumulator grows past its threshold.
    ///
    /// # Errors
    /// `TsqrError::ColumnMismatch` when the row length differs from the established
    /// column count. The row is not added.
    pub fn collect(&mut self, key: &Key, row: &[f64]) -> Result<(), TsqrError> {
        let ncols = match self.ncols {
            Some(n) => n,
            None => {
                debug!("Matrix size: {} columns", row.len());
                self.ncols = Some(row.len());
                row.len()
            }
        };
        if row.len() != ncols {
            return Err(TsqrError::ColumnMismatch { expected: ncols, found: row.len() });
        }
        if self.rows_seen == 0 {
            self.first_key = Some(key.clone());
        }

        self.block.extend_from_slice(row);
        self.block_rows += 1;
        self.rows_seen += 1;
        if let Some(history) = self.history.as_mut() {
            history.row_keys.push(key.clone());
        }

        if self.block_rows > self.blocksize * ncols {
            self.compress()?;
        }

        if self.rows_seen as u64 % ROW_REPORT_INTERVAL == 0 {
            self.counters.rows_processed += ROW_REPORT_INTERVAL;
            trace!("rows processed: {}", self.rows_seen);
        }
        Ok(())
    }

    /// Replaces the accumulator with the R factor of its contents.
    /// Does nothing while fewer than `ncols` rows are held.
    pub fn compress(&mut self) -> Result<(), TsqrError> {
        let Some(ncols) = self.ncols else {
            return Ok(());
        };
        if self.block_rows < ncols || self.block_rows == self.covered_rows {
            return Ok(());
        }

        let started = Instant::now();
        let matrix = Array2::from_shape_vec((self.block_rows, ncols), std::mem::take(&mut self.block))
            .map_err(|e| TsqrError::MalformedRow(format!("accumulator shape: {}", e)))?;

        let r = if let Some(history) = self.history.as_mut() {
            let QROutput { mut q, mut r } = self.backend.qr_thin(&matrix)?;
            canonicalize_signs(Some(&mut q), &mut r);
            history.steps.push((self.covered_rows, q));
            r
        } else {
            let mut r = self.backend.qr_r_factor(&matrix)?;
            canonicalize_signs(None, &mut r);
            r
        };

        self.counters.compressions += 1;
        self.counters.compression_millis += started.elapsed().as_millis() as u64;
        trace!("Compressed {} rows to {}x{} R", self.block_rows, r.nrows(), r.ncols());

        self.block_rows = r.nrows();
        self.covered_rows = r.nrows();
        self.block = r.iter().copied().collect();
        Ok(())
    }

    /// Runs a last compression over residual rows and returns what the block holds.
    pub fn finish(mut self) -> Result<CompressedBlock, TsqrError> {
        self.counters.rows_processed += self.rows_seen as u64 % ROW_REPORT_INTERVAL;
        self.compress()?;
        let ncols = self.ncols.unwrap_or(0);
        let r = Array2::from_shape_vec((self.block_rows, ncols), self.block)
            .map_err(|e| TsqrError::MalformedRow(format!("accumulator shape: {}", e)))?;
        let (q, row_keys) = match self.history {
            Some(history) => (Some(history.assemble()?), history.row_keys),
            None => (None, Vec::new()),
        };
        Ok(CompressedBlock {
            first_key: self.first_key,
            r,
            q,
            row_keys,
            rows_seen: self.rows_seen,
            counters: self.counters,
        })
    }
}
