// src/keys.rs

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::config::KeyType;
use crate::error::TsqrError;

/// Upper bound (exclusive) for keys drawn by the random discipline.
pub const RANDOM_KEY_RANGE: u64 = 4_000_000_000;

/// Identifier attached to a row to decide which downstream reducer receives it.
///
/// `Int` keys are opaque: source row ids, random spray keys and row indices all use it.
/// `Lineage` keys are produced by the first-row-derived discipline: the components of the
/// key the block's first row carried, flattened, followed by the row's position in the block.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Key {
    Int(u64),
    Lineage(Vec<u64>),
}

impl Key {
    /// Derives the key for the row at `position` of a block whose first row carried `self`.
    /// Nested lineages are flattened, so repeated derivation keeps growing one path.
    pub fn derive(&self, position: usize) -> Key {
        let mut path = self.components();
        path.push(position as u64);
        Key::Lineage(path)
    }

    /// The block identity of a lineage key (everything but the trailing position);
    /// opaque keys are their own prefix.
    pub fn prefix(&self) -> Key {
        match self {
            Key::Lineage(path) if path.len() > 1 => {
                let head = &path[..path.len() - 1];
                if head.len() == 1 {
                    Key::Int(head[0])
                } else {
                    Key::Lineage(head.to_vec())
                }
            }
            _ => self.clone(),
        }
    }

    /// Hash used by the shuffle. Rows that share a lineage prefix always land on the
    /// same reducer so a block can be regrouped downstream.
    pub fn routing_hash(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.prefix().hash(&mut hasher);
        hasher.finish()
    }

    fn components(&self) -> Vec<u64> {
        match self {
            Key::Int(v) => vec![*v],
            Key::Lineage(path) => path.clone(),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(v) => write!(f, "{}", v),
            Key::Lineage(path) => {
                let parts: Vec<String> = path.iter().map(|p| p.to_string()).collect();
                write!(f, "({})", parts.join(","))
            }
        }
    }
}

impl FromStr for Key {
    type Err = TsqrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let bad_key = || TsqrError::MalformedRow(format!("unparseable key '{}'", s));
        if let Some(inner) = s.strip_prefix('(').and_then(|rest| rest.strip_suffix(')')) {
            let path = inner
                .split(',')
                .map(|part| part.trim().parse::<u64>().map_err(|_| bad_key()))
                .collect::<Result<Vec<_>, _>>()?;
            if path.is_empty() {
                return Err(bad_key());
            }
            Ok(Key::Lineage(path))
        } else {
            s.parse::<u64>().map(Key::Int).map_err(|_| bad_key())
        }
    }
}

/// Chooses output keys for the rows a worker emits. One strategy is fixed per run.
#[derive(Debug, Clone)]
pub enum KeyStrategy {
    /// Uniform keys in `[0, RANDOM_KEY_RANGE)`, for load-balanced spraying.
    Random(ChaCha8Rng),
    /// `first_key.derive(position)`, preserving block lineage.
    FirstRow,
    /// The row's position in the block; used for final factor output.
    RowIndex,
}

impl KeyStrategy {
    /// Builds the strategy for one worker instance. With a seed, each `(stage, worker)`
    /// pair gets its own reproducible random stream.
    pub fn for_worker(key_type: KeyType, seed: Option<u64>, stage: usize, worker: usize) -> Self {
        match key_type {
            KeyType::Random => {
                let rng = match seed {
                    Some(s) => ChaCha8Rng::seed_from_u64(
                        s.wrapping_add((stage as u64) << 32).wrapping_add(worker as u64),
                    ),
                    None => ChaCha8Rng::from_entropy(),
                };
                KeyStrategy::Random(rng)
            }
            KeyType::First => KeyStrategy::FirstRow,
        }
    }

    pub fn key_for(&mut self, first_key: Option<&Key>, position: usize) -> Key {
        match self {
            KeyStrategy::Random(rng) => Key::Int(rng.gen_range(0..RANDOM_KEY_RANGE)),
            KeyStrategy::FirstRow => match first_key {
                Some(k) => k.derive(position),
                None => Key::Int(position as u64),
            },
            KeyStrategy::RowIndex => Key::Int(position as u64),
        }
    }
}
