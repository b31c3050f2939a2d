// src/matmul.rs

use log::info;
use ndarray::{Array1, Array2};
use std::time::Instant;

use crate::error::TsqrError;
use crate::substrate::LocalExecutor;
use crate::wire::{decode_row, encode_row, Record, RowEncoding};

/// Multiplies a distributed tall-and-skinny matrix by a small matrix every worker holds.
///
/// Map-only: each row `a` becomes `a * small` under the same key, text-encoded. Row
/// placement is unchanged, so the output keeps whatever ordering keys the input had.
///
/// # Errors
/// `TsqrError::ColumnMismatch` when a row's length differs from `small.nrows()`.
pub fn ts_matmul(
    executor: &LocalExecutor,
    splits: Vec<Vec<Record>>,
    small: &Array2<f64>,
) -> Result<Vec<Vec<Record>>, TsqrError> {
    let start = Instant::now();
    let out = executor.run_map(splits, |_, split| {
        split
            .into_iter()
            .map(|record| {
                let row = decode_row(&record.value)?;
                if row.len() != small.nrows() {
                    return Err(TsqrError::ColumnMismatch { expected: small.nrows(), found: row.len() });
                }
                let product = Array1::from(row).dot(small);
                Ok(Record::new(record.key, encode_row(&product.to_vec(), RowEncoding::Text)))
            })
            .collect::<Result<Vec<Record>, TsqrError>>()
    })?;
    info!("Multiplied by {}x{} side input in {:?}", small.nrows(), small.ncols(), start.elapsed());
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Key;
    use crate::wire::assemble_by_key;
    use ndarray::array;

    #[test]
    fn multiplies_each_row_and_keeps_keys() {
        let small = array![[1.0, 0.0], [0.0, 2.0], [1.0, 1.0]];
        let splits = vec![
            vec![Record::from_row(Key::Int(1), &[1.0, 2.0, 3.0], RowEncoding::Binary)],
            vec![Record::from_row(Key::Int(0), &[0.0, 1.0, 0.0], RowEncoding::Text)],
        ];
        let out = ts_matmul(&LocalExecutor::new(), splits, &small).unwrap();
        let records: Vec<Record> = out.into_iter().flatten().collect();
        assert_eq!(assemble_by_key(&records).unwrap(), array![[0.0, 2.0], [4.0, 7.0]]);
    }

    #[test]
    fn wrong_row_length_is_rejected() {
        let splits = vec![vec![Record::from_row(Key::Int(0), &[1.0, 2.0], RowEncoding::Text)]];
        let err = ts_matmul(&LocalExecutor::new(), splits, &Array2::eye(3)).unwrap_err();
        assert!(matches!(err, TsqrError::ColumnMismatch { expected: 3, found: 2 }));
    }
}
