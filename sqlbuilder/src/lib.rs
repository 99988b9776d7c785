pub mod clickhouse;
pub mod logsql;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LowerError {
	#[error("operator {op} on field {field} does not accept this value")]
	UnsupportedValue { field: String, op: &'static str },
	#[error("operator {op} on field {field} requires a non-empty list")]
	EmptyList { field: String, op: &'static str },
}
