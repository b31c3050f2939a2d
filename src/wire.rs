// src/wire.rs

//! Row serialization.
//!
//! Intermediate stages ship rows as a compact fixed-width binary encoding
//! (`ncols` native-endian doubles). The final stage and the broadcast side-inputs
//! use plain text: whitespace-separated floating-point values, one row per line.

use log::debug;
use ndarray::{Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::error::TsqrError;
use crate::keys::Key;

/// Encoding used when a worker writes rows.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowEncoding {
    Binary,
    Text,
}

/// A row value as it travels between stages.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WireValue {
    Binary(Vec<u8>),
    Text(String),
}

impl WireValue {
    pub fn encoding(&self) -> RowEncoding {
        match self {
            WireValue::Binary(_) => RowEncoding::Binary,
            WireValue::Text(_) => RowEncoding::Text,
        }
    }
}

/// A keyed row on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: Key,
    pub value: WireValue,
}

impl Record {
    pub fn new(key: Key, value: WireValue) -> Self {
        Record { key, value }
    }

    /// Convenience for building source splits from in-memory rows.
    pub fn from_row(key: Key, row: &[f64], encoding: RowEncoding) -> Self {
        Record { key, value: encode_row(row, encoding) }
    }
}

pub fn encode_row(row: &[f64], encoding: RowEncoding) -> WireValue {
    match encoding {
        RowEncoding::Binary => WireValue::Binary(bytemuck::cast_slice::<f64, u8>(row).to_vec()),
        RowEncoding::Text => WireValue::Text(format_text_row(row.iter().copied())),
    }
}

pub fn encode_view(row: ArrayView1<f64>, encoding: RowEncoding) -> WireValue {
    match row.as_slice() {
        Some(slice) => encode_row(slice, encoding),
        None => encode_row(&row.to_vec(), encoding),
    }
}

/// Decodes a row from whichever encoding it was written in.
///
/// # Errors
/// `TsqrError::MalformedRow` when binary data is not a whole number of doubles or a
/// text token is not a floating-point value.
pub fn decode_row(value: &WireValue) -> Result<Vec<f64>, TsqrError> {
    match value {
        WireValue::Binary(bytes) => {
            if bytes.len() % std::mem::size_of::<f64>() != 0 {
                return Err(TsqrError::MalformedRow(format!(
                    "binary row of {} bytes is not a whole number of doubles",
                    bytes.len()
                )));
            }
            Ok(bytemuck::pod_collect_to_vec::<u8, f64>(bytes))
        }
        WireValue::Text(text) => parse_text_row(text),
    }
}

pub fn parse_text_row(text: &str) -> Result<Vec<f64>, TsqrError> {
    text.split_whitespace()
        .map(|token| {
            token
                .parse::<f64>()
                .map_err(|_| TsqrError::MalformedRow(format!("'{}' is not a floating-point value", token)))
        })
        .collect()
}

pub(crate) fn format_text_row<I: Iterator<Item = f64>>(values: I) -> String {
    // `{:?}` prints the shortest representation that parses back to the same double.
    values.map(|v| format!("{:?}", v)).collect::<Vec<_>>().join(" ")
}

/// Decodes a collection of rows into a dense matrix, preserving their order.
pub fn rows_to_matrix<'a, I>(values: I) -> Result<Array2<f64>, TsqrError>
where
    I: IntoIterator<Item = &'a WireValue>,
{
    let mut ncols: Option<usize> = None;
    let mut data = Vec::new();
    let mut nrows = 0;
    for value in values {
        let row = decode_row(value)?;
        match ncols {
            None => ncols = Some(row.len()),
            Some(expected) if expected != row.len() => {
                return Err(TsqrError::ColumnMismatch { expected, found: row.len() });
            }
            Some(_) => {}
        }
        data.extend(row);
        nrows += 1;
    }
    Array2::from_shape_vec((nrows, ncols.unwrap_or(0)), data)
        .map_err(|e| TsqrError::MalformedRow(format!("could not assemble matrix: {}", e)))
}

/// Reassembles rows emitted in arbitrary order by sorting on their keys.
/// Used to restore source row order for keyed Q and singular-vector output.
pub fn assemble_by_key(records: &[Record]) -> Result<Array2<f64>, TsqrError> {
    let mut sorted: Vec<&Record> = records.iter().collect();
    sorted.sort_by(|a, b| a.key.cmp(&b.key));
    rows_to_matrix(sorted.into_iter().map(|r| &r.value))
}

/// Writes a matrix as text, one row per line.
pub fn write_text_matrix<P: AsRef<Path>>(path: P, matrix: ArrayView2<f64>) -> Result<(), TsqrError> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| TsqrError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    for row in matrix.rows() {
        writeln!(writer, "{}", format_text_row(row.iter().copied())).map_err(|e| TsqrError::io(path, e))?;
    }
    writer.flush().map_err(|e| TsqrError::io(path, e))?;
    debug!("Wrote {}x{} text matrix to {:?}", matrix.nrows(), matrix.ncols(), path);
    Ok(())
}

/// Reads a matrix written by [`write_text_matrix`]. Blank lines are skipped.
pub fn read_text_matrix<P: AsRef<Path>>(path: P) -> Result<Array2<f64>, TsqrError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| TsqrError::io(path, e))?;
    let mut values = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| TsqrError::io(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        values.push(WireValue::Text(line));
    }
    rows_to_matrix(values.iter())
}
