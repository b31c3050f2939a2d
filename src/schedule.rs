// src/schedule.rs

//! Stage schedules.
//!
//! A schedule string is a comma-separated list of tokens. An integer token is a
//! compress stage with that many reducer instances; `s<integer>` is a spray stage
//! that only redistributes rows over that many partitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TsqrError;

/// One entry of a schedule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageDescriptor {
    /// Compress-and-combine with this many parallel reducers.
    Compress(usize),
    /// Pure redistribution over this many partitions.
    Spray(usize),
}

impl StageDescriptor {
    pub fn fan_out(&self) -> usize {
        match self {
            StageDescriptor::Compress(n) | StageDescriptor::Spray(n) => *n,
        }
    }
}

impl FromStr for StageDescriptor {
    type Err = TsqrError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let token = token.trim();
        let (spray, digits) = match token.strip_prefix('s') {
            Some(rest) => (true, rest),
            None => (false, token),
        };
        let count = digits
            .parse::<usize>()
            .map_err(|_| TsqrError::config(format!("unparseable schedule token '{}'", token)))?;
        if count == 0 {
            return Err(TsqrError::config(format!("schedule token '{}' must be positive", token)));
        }
        Ok(if spray { StageDescriptor::Spray(count) } else { StageDescriptor::Compress(count) })
    }
}

impl fmt::Display for StageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageDescriptor::Compress(n) => write!(f, "{}", n),
            StageDescriptor::Spray(n) => write!(f, "s{}", n),
        }
    }
}

/// A validated, non-empty list of stage descriptors ending in a compress stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Schedule(Vec<StageDescriptor>);

impl Schedule {
    pub fn new(stages: Vec<StageDescriptor>) -> Result<Self, TsqrError> {
        match stages.last() {
            None => Err(TsqrError::config("schedule is empty")),
            Some(StageDescriptor::Spray(_)) => Err(TsqrError::config(
                "schedule ends in a spray stage; a compress stage must follow it",
            )),
            Some(StageDescriptor::Compress(_)) => {
                if stages.iter().any(|s| s.fan_out() == 0) {
                    return Err(TsqrError::config("schedule fan-in must be positive"));
                }
                Ok(Schedule(stages))
            }
        }
    }

    /// The default schedule: one compress stage with a single reducer.
    pub fn single_reducer() -> Self {
        Schedule(vec![StageDescriptor::Compress(1)])
    }

    pub fn stages(&self) -> &[StageDescriptor] {
        &self.0
    }

    /// Lays the schedule out as executable stages.
    ///
    /// The first compress stage also compresses map-side, directly over the raw input
    /// splits; later stages pass rows through their map side and compress on reduce.
    /// Spray stages pass rows through on both sides. Only the last stage is final.
    pub fn build_stages(&self) -> Vec<StagePlan> {
        let last = self.0.len() - 1;
        self.0
            .iter()
            .enumerate()
            .map(|(index, descriptor)| {
                let (map, reduce) = match descriptor {
                    StageDescriptor::Spray(_) => (StepKind::Identity, StepKind::Identity),
                    StageDescriptor::Compress(_) if index == 0 => (StepKind::Compress, StepKind::Compress),
                    StageDescriptor::Compress(_) => (StepKind::Identity, StepKind::Compress),
                };
                StagePlan {
                    index,
                    descriptor: *descriptor,
                    map,
                    reduce,
                    reducers: descriptor.fan_out(),
                    is_final: index == last,
                }
            })
            .collect()
    }
}

impl FromStr for Schedule {
    type Err = TsqrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(TsqrError::config("schedule is empty"));
        }
        let stages = s.split(',').map(str::parse).collect::<Result<Vec<_>, _>>()?;
        Schedule::new(stages)
    }
}

impl TryFrom<String> for Schedule {
    type Error = TsqrError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Schedule> for String {
    fn from(schedule: Schedule) -> String {
        schedule.to_string()
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tokens: Vec<String> = self.0.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", tokens.join(","))
    }
}

/// What a stage runs on one side of its shuffle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    /// Incremental QR compression.
    Compress,
    /// Pass rows through unchanged.
    Identity,
}

/// One executable stage derived from a schedule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StagePlan {
    pub index: usize,
    pub descriptor: StageDescriptor,
    pub map: StepKind,
    pub reduce: StepKind,
    /// Number of reducer instances (partitions after the shuffle).
    pub reducers: usize,
    /// The final stage emits text rows instead of the compact binary encoding.
    pub is_final: bool,
}
