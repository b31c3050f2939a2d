// src/substrate.rs

//! An in-process map/shuffle/reduce executor.
//!
//! Worker instances run in parallel on the rayon pool and share nothing mutable.
//! Between stages records are routed by [`Key::routing_hash`] modulo the reducer count
//! and grouped by key, ordered within each reducer partition.

use log::debug;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::time::Instant;

use crate::error::TsqrError;
use crate::keys::Key;
use crate::wire::{Record, WireValue};

/// All values one reducer received under a single key.
#[derive(Clone, Debug, PartialEq)]
pub struct Group {
    pub key: Key,
    pub values: Vec<WireValue>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalExecutor;

impl LocalExecutor {
    pub fn new() -> Self {
        LocalExecutor
    }

    /// Runs `worker(split_index, split)` over every input split. Output order follows
    /// split order. The first worker error aborts the whole pass.
    pub fn run_map<T, F>(&self, splits: Vec<Vec<Record>>, worker: F) -> Result<Vec<T>, TsqrError>
    where
        T: Send,
        F: Fn(usize, Vec<Record>) -> Result<T, TsqrError> + Sync + Send,
    {
        let start = Instant::now();
        let n = splits.len();
        let out = splits
            .into_par_iter()
            .enumerate()
            .map(|(i, split)| worker(i, split))
            .collect::<Result<Vec<T>, TsqrError>>()?;
        debug!("map pass over {} splits finished in {:?}", n, start.elapsed());
        Ok(out)
    }

    /// Routes every record to one of `reducers` partitions and groups by key.
    pub fn shuffle(&self, outputs: Vec<Vec<Record>>, reducers: usize) -> Vec<Vec<Group>> {
        let reducers = reducers.max(1);
        let mut partitions: Vec<BTreeMap<Key, Vec<WireValue>>> = vec![BTreeMap::new(); reducers];
        let mut routed = 0usize;
        for record in outputs.into_iter().flatten() {
            let target = (record.key.routing_hash() % reducers as u64) as usize;
            partitions[target].entry(record.key).or_default().push(record.value);
            routed += 1;
        }
        debug!("shuffled {} records into {} partitions", routed, reducers);
        partitions
            .into_iter()
            .map(|groups| groups.into_iter().map(|(key, values)| Group { key, values }).collect())
            .collect()
    }

    /// Runs `worker(partition_index, groups)` over every reducer partition.
    pub fn run_reduce<T, F>(&self, partitions: Vec<Vec<Group>>, worker: F) -> Result<Vec<T>, TsqrError>
    where
        T: Send,
        F: Fn(usize, Vec<Group>) -> Result<T, TsqrError> + Sync + Send,
    {
        let start = Instant::now();
        let n = partitions.len();
        let out = partitions
            .into_par_iter()
            .enumerate()
            .map(|(i, groups)| worker(i, groups))
            .collect::<Result<Vec<T>, TsqrError>>()?;
        debug!("reduce pass over {} partitions finished in {:?}", n, start.elapsed());
        Ok(out)
    }
}
