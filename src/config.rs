// src/config.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::TsqrError;
use crate::schedule::Schedule;

/// Default accumulator threshold multiplier: a block is compressed once it holds
/// more than `blocksize * ncols` rows.
pub const DEFAULT_BLOCKSIZE: usize = 3;

/// Which key discipline workers use for the rows they emit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    /// Random keys with no semantic meaning.
    Random,
    /// Keys derived from the first row a block saw, preserving lineage.
    First,
}

impl FromStr for KeyType {
    type Err = TsqrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "random" => Ok(KeyType::Random),
            "first" => Ok(KeyType::First),
            other => Err(TsqrError::config(format!("unknown keytype '{}' (expected 'random' or 'first')", other))),
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyType::Random => write!(f, "random"),
            KeyType::First => write!(f, "first"),
        }
    }
}

/// The `svd` option of a Direct-Q run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectMode {
    /// 0: the global R factor only.
    ROnly,
    /// 1: R plus the singular values.
    SingularValues,
    /// 2: R, the explicit Q, and the left singular vectors.
    QAndSingularVectors,
    /// 3: the SVD (values, left and right vectors) without an explicit Q.
    SvdOnly,
}

impl DirectMode {
    pub fn needs_svd(self) -> bool {
        !matches!(self, DirectMode::ROnly)
    }

    /// Whether phase 3 (the second pass over the source partitions) has to run.
    pub fn needs_second_pass(self) -> bool {
        matches!(self, DirectMode::QAndSingularVectors | DirectMode::SvdOnly)
    }

    pub fn needs_left_vectors(self) -> bool {
        self.needs_second_pass()
    }

    pub fn code(self) -> i64 {
        match self {
            DirectMode::ROnly => 0,
            DirectMode::SingularValues => 1,
            DirectMode::QAndSingularVectors => 2,
            DirectMode::SvdOnly => 3,
        }
    }
}

impl TryFrom<i64> for DirectMode {
    type Error = TsqrError;

    fn try_from(code: i64) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(DirectMode::ROnly),
            1 => Ok(DirectMode::SingularValues),
            2 => Ok(DirectMode::QAndSingularVectors),
            3 => Ok(DirectMode::SvdOnly),
            other => Err(TsqrError::config(format!("unrecognized svd mode {} (expected 0, 1, 2 or 3)", other))),
        }
    }
}

/// Options recognized by a TSQR or Direct-Q run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TsqrConfig {
    /// Accumulator compression threshold multiplier. Must be greater than 0.
    pub blocksize: usize,
    /// Expected column count. Required for Direct-Q; optional for plain TSQR, where
    /// the first row establishes it.
    pub ncols: Option<usize>,
    /// Stage schedule for plain TSQR.
    pub schedule: Schedule,
    /// Which products a Direct-Q run computes.
    pub svd: DirectMode,
    /// Key discipline used between stages.
    pub keytype: KeyType,
    /// Seed for the random key discipline. `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for TsqrConfig {
    fn default() -> Self {
        TsqrConfig {
            blocksize: DEFAULT_BLOCKSIZE,
            ncols: None,
            schedule: Schedule::single_reducer(),
            svd: DirectMode::ROnly,
            keytype: KeyType::Random,
            seed: None,
        }
    }
}

impl TsqrConfig {
    /// Builds a configuration from `name=value` style options, starting from the defaults.
    ///
    /// # Errors
    /// Returns `TsqrError::Config` for an unknown option name or an unparseable value.
    pub fn from_options<I, K, V>(options: I) -> Result<Self, TsqrError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = TsqrConfig::default();
        for (name, value) in options {
            let (name, value) = (name.as_ref().trim(), value.as_ref().trim());
            match name {
                "blocksize" => config.blocksize = parse_positive(name, value)?,
                "ncols" => config.ncols = Some(parse_positive(name, value)?),
                "schedule" => config.schedule = value.parse()?,
                "svd" => {
                    let code = value
                        .parse::<i64>()
                        .map_err(|_| TsqrError::config(format!("svd mode '{}' is not an integer", value)))?;
                    config.svd = DirectMode::try_from(code)?;
                }
                "keytype" => config.keytype = value.parse()?,
                "seed" => {
                    config.seed = Some(
                        value
                            .parse::<u64>()
                            .map_err(|_| TsqrError::config(format!("seed '{}' is not an unsigned integer", value)))?,
                    )
                }
                other => return Err(TsqrError::config(format!("unrecognized option '{}'", other))),
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TsqrError> {
        if self.blocksize == 0 {
            return Err(TsqrError::config("blocksize must be greater than 0"));
        }
        if self.ncols == Some(0) {
            return Err(TsqrError::config("ncols must be greater than 0"));
        }
        Ok(())
    }

    /// The configured column count, which Direct-Q cannot run without.
    pub fn require_ncols(&self) -> Result<usize, TsqrError> {
        self.ncols
            .ok_or_else(|| TsqrError::config("number of columns not provided (ncols is required for Direct-Q)"))
    }
}

fn parse_positive(name: &str, value: &str) -> Result<usize, TsqrError> {
    match value.parse::<usize>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(TsqrError::config(format!("option '{}' must be a positive integer, got '{}'", name, value))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::schedule::StageDescriptor;

    #[test]
    fn defaults_match_documented_values() {
        let config = TsqrConfig::default();
        assert_eq!(config.blocksize, 3);
        assert_eq!(config.ncols, None);
        assert_eq!(config.schedule.stages(), &[StageDescriptor::Compress(1)]);
        assert_eq!(config.svd, DirectMode::ROnly);
        assert_eq!(config.keytype, KeyType::Random);
    }

    #[test]
    fn parses_all_recognized_options() {
        let config = TsqrConfig::from_options([
            ("blocksize", "5"),
            ("ncols", "10"),
            ("schedule", "100,s50,1"),
            ("svd", "2"),
            ("keytype", "first"),
            ("seed", "42"),
        ])
        .unwrap();
        assert_eq!(config.blocksize, 5);
        assert_eq!(config.ncols, Some(10));
        assert_eq!(config.schedule.stages().len(), 3);
        assert_eq!(config.svd, DirectMode::QAndSingularVectors);
        assert_eq!(config.keytype, KeyType::First);
        assert_eq!(config.seed, Some(42));
    }

    #[test]
    fn rejects_bad_options_as_config_errors() {
        let cases: Vec<Vec<(&str, &str)>> = vec![
            vec![("svd", "4")],
            vec![("svd", "two")],
            vec![("keytype", "sorted")],
            vec![("blocksize", "0")],
            vec![("ncols", "-3")],
            vec![("schedule", "abc")],
            vec![("reduce_schedule", "1")],
        ];
        for options in cases {
            let err = TsqrConfig::from_options(options.clone()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Config, "options {:?} gave {:?}", options, err);
        }
    }

    #[test]
    fn missing_ncols_is_config_error() {
        let err = TsqrConfig::default().require_ncols().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn mode_flags() {
        assert!(!DirectMode::ROnly.needs_svd());
        assert!(!DirectMode::SingularValues.needs_second_pass());
        assert!(DirectMode::QAndSingularVectors.needs_second_pass());
        assert!(DirectMode::SvdOnly.needs_left_vectors());
        for code in 0..4 {
            assert_eq!(DirectMode::try_from(code).unwrap().code(), code);
        }
    }
}
