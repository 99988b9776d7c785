use crate::backends::QueryOutput;
use common::LogValue;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScalarError {
	#[error("result cell is not numeric: {0}")]
	NonNumeric(String),
	#[error("result row has no columns")]
	NoColumns,
}

/// Coerce the first cell of the first row to `f64` for threshold
/// comparison. An empty result is the zero-matches contract for
/// aggregate queries and yields 0.
pub fn extract_scalar(out: &QueryOutput) -> Result<f64, ScalarError> {
	let Some(row) = out.rows.first() else {
		return Ok(0.0);
	};
	let cell = match out.columns.first() {
		Some(col) => row.get(&col.name),
		None => row.values().next(),
	};
	let Some(cell) = cell else {
		return Err(ScalarError::NoColumns);
	};
	match cell {
		LogValue::Int(i) => Ok(*i as f64),
		LogValue::Float(f) => Ok(*f),
		LogValue::Null => Ok(0.0),
		LogValue::String(s) => s
			.trim()
			.parse::<f64>()
			.map_err(|_| ScalarError::NonNumeric(format!("string {s:?}"))),
		other => Err(ScalarError::NonNumeric(format!("{other:?}"))),
	}
}
