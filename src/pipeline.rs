// src/pipeline.rs

//! R-only TSQR: the stages a schedule describes, run back to back on a [`LocalExecutor`].

use log::{debug, info};
use ndarray::Array2;
use std::time::Instant;

use crate::compressor::{CompressorCounters, IncrementalQr};
use crate::config::TsqrConfig;
use crate::error::TsqrError;
use crate::keys::{Key, KeyStrategy};
use crate::schedule::{StagePlan, StepKind};
use crate::substrate::{Group, LocalExecutor};
use crate::wire::{decode_row, rows_to_matrix, Record, RowEncoding};

/// Final output of a TSQR run.
#[derive(Debug, Clone)]
pub struct TsqrOutput {
    /// Rows emitted by the last stage, text-encoded.
    pub records: Vec<Record>,
    /// Telemetry summed over every compressing worker of every stage.
    pub counters: CompressorCounters,
}

impl TsqrOutput {
    /// Decodes the final rows into the R factor.
    ///
    /// With several reducers on the last stage each one emits its own R; those are
    /// merged locally so the result is always the single global factor.
    pub fn r_factor(&self, blocksize: usize) -> Result<Array2<f64>, TsqrError> {
        let stacked = rows_to_matrix(self.records.iter().map(|r| &r.value))?;
        if stacked.nrows() <= stacked.ncols() {
            return Ok(stacked);
        }
        let mut qr = IncrementalQr::new(blocksize);
        for (record, row) in self.records.iter().zip(stacked.rows()) {
            qr.collect(&record.key, &row.to_vec())?;
        }
        Ok(qr.finish()?.r)
    }
}

/// Output of one worker instance.
struct WorkerOutput {
    records: Vec<Record>,
    counters: CompressorCounters,
}

pub struct TsqrPipeline {
    config: TsqrConfig,
    plans: Vec<StagePlan>,
    executor: LocalExecutor,
}

impl TsqrPipeline {
    /// Validates the configuration and lays out the stages. Nothing runs yet, so any
    /// configuration problem surfaces before the first stage.
    pub fn new(config: TsqrConfig) -> Result<Self, TsqrError> {
        config.validate()?;
        let plans = config.schedule.build_stages();
        Ok(TsqrPipeline { config, plans, executor: LocalExecutor::new() })
    }

    pub fn config(&self) -> &TsqrConfig {
        &self.config
    }

    pub fn stages(&self) -> &[StagePlan] {
        &self.plans
    }

    /// Runs every stage over `splits`, the partitioned source rows.
    pub fn run(&self, splits: Vec<Vec<Record>>) -> Result<TsqrOutput, TsqrError> {
        let run_start = Instant::now();
        info!(
            "Starting TSQR over {} splits with schedule {} (blocksize {}, keytype {})",
            splits.len(),
            self.config.schedule,
            self.config.blocksize,
            self.config.keytype
        );

        let mut counters = CompressorCounters::default();
        let mut current = splits;
        for plan in &self.plans {
            let stage_start = Instant::now();

            let mapped = self.executor.run_map(current, |worker, split| self.map_worker(plan, worker, split))?;
            let map_records = collect_outputs(mapped, &mut counters);

            let partitions = self.executor.shuffle(map_records, plan.reducers);
            let reduced = self
                .executor
                .run_reduce(partitions, |worker, groups| self.reduce_worker(plan, worker, groups))?;
            current = collect_outputs(reduced, &mut counters);

            info!(
                "Stage {} ({}) emitted {} rows in {:?}",
                plan.index,
                plan.descriptor,
                current.iter().map(Vec::len).sum::<usize>(),
                stage_start.elapsed()
            );
        }

        info!(
            "TSQR finished in {:?}: {} rows processed, {} compressions",
            run_start.elapsed(),
            counters.rows_processed,
            counters.compressions
        );
        Ok(TsqrOutput { records: current.into_iter().flatten().collect(), counters })
    }

    fn map_worker(&self, plan: &StagePlan, worker: usize, split: Vec<Record>) -> Result<WorkerOutput, TsqrError> {
        match plan.map {
            StepKind::Identity => Ok(WorkerOutput { records: split, counters: CompressorCounters::default() }),
            StepKind::Compress => {
                let rows = split
                    .into_iter()
                    .map(|record| decode_row(&record.value).map(|row| (record.key, row)));
                // The map side always feeds a shuffle, so it never writes the final encoding.
                self.compress_worker(plan.index * 2, worker, rows, RowEncoding::Binary)
            }
        }
    }

    fn reduce_worker(&self, plan: &StagePlan, worker: usize, groups: Vec<Group>) -> Result<WorkerOutput, TsqrError> {
        match plan.reduce {
            StepKind::Identity => {
                let records = groups
                    .into_iter()
                    .flat_map(|group| {
                        let key = group.key;
                        group.values.into_iter().map(move |value| Record::new(key.clone(), value))
                    })
                    .collect();
                Ok(WorkerOutput { records, counters: CompressorCounters::default() })
            }
            StepKind::Compress => {
                let rows = groups.into_iter().flat_map(|group| {
                    let key = group.key;
                    group.values.into_iter().map(move |value| decode_row(&value).map(|row| (key.clone(), row)))
                });
                let encoding = if plan.is_final { RowEncoding::Text } else { RowEncoding::Binary };
                self.compress_worker(plan.index * 2 + 1, worker, rows, encoding)
            }
        }
    }

    fn compress_worker<I>(&self, step: usize, worker: usize, rows: I, encoding: RowEncoding) -> Result<WorkerOutput, TsqrError>
    where
        I: Iterator<Item = Result<(Key, Vec<f64>), TsqrError>>,
    {
        let mut qr = IncrementalQr::new(self.config.blocksize);
        if let Some(ncols) = self.config.ncols {
            qr = qr.with_ncols(ncols);
        }
        for row in rows {
            let (key, values) = row?;
            qr.collect(&key, &values)?;
        }
        let block = qr.finish()?;
        if block.rows_seen == 0 {
            debug!("Worker {} of step {} received no rows", worker, step);
            return Ok(WorkerOutput { records: Vec::new(), counters: block.counters });
        }
        debug!(
            "Worker {} of step {}: {} rows compressed to {} ({} compressions)",
            worker,
            step,
            block.rows_seen,
            block.r.nrows(),
            block.counters.compressions
        );
        let mut strategy = if encoding == RowEncoding::Text {
            KeyStrategy::RowIndex
        } else {
            KeyStrategy::for_worker(self.config.keytype, self.config.seed, step, worker)
        };
        Ok(WorkerOutput { records: block.emit(&mut strategy, encoding), counters: block.counters })
    }
}

fn collect_outputs(outputs: Vec<WorkerOutput>, counters: &mut CompressorCounters) -> Vec<Vec<Record>> {
    outputs
        .into_iter()
        .map(|out| {
            *counters += out.counters;
            out.records
        })
        .collect()
}
