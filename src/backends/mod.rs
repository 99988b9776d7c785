use async_trait::async_trait;
use chrono::NaiveDateTime;
use common::{LogValue, TimeRange};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::time::Duration;
use thiserror::Error;

pub mod clickhouse;
pub mod manager;
pub mod registry;
pub mod victorialogs;

pub use manager::{BackendManager, BackendTuning};
pub use registry::BackendRegistry;

pub type SourceId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
	/// SQL-speaking columnar engine (ClickHouse).
	#[default]
	Sql,
	/// LogsQL-speaking engine (VictoriaLogs).
	Logsql,
}

impl Display for BackendKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			BackendKind::Sql => f.write_str("sql"),
			BackendKind::Logsql => f.write_str("logsql"),
		}
	}
}

#[derive(Debug, Error)]
pub enum BackendError {
	#[error("query timed out after {0:?}")]
	Timeout(Duration),
	#[error("backend unavailable: {0}")]
	Unavailable(String),
	#[error("invalid query: {0}")]
	InvalidQuery(String),
	#[error("permission denied: {0}")]
	PermissionDenied(String),
	#[error("not found: {0}")]
	NotFound(String),
	#[error("internal backend error: {0}")]
	Internal(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// One decoded log line: column name to dynamic value.
pub type LogRow = BTreeMap<String, LogValue>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
	pub name: String,
	#[serde(rename = "type")]
	pub column_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryStats {
	pub execution_time_ms: f64,
	pub rows_read: u64,
	pub bytes_read: u64,
}

#[derive(Debug, Default)]
pub struct QueryOutput {
	pub rows: Vec<LogRow>,
	pub columns: Vec<ColumnInfo>,
	pub stats: QueryStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableInfo {
	pub engine: String,
	pub columns: Vec<ColumnInfo>,
	pub sort_keys: Vec<String>,
	pub create_query: String,
}

#[derive(Debug, Clone)]
pub struct HistogramParams {
	/// Full native query the buckets are computed over.
	pub query: String,
	pub range: TimeRange,
	/// Explicit bucket width; auto-selected from the ladder when absent.
	pub window_secs: Option<u64>,
	pub group_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistogramBucket {
	pub bucket_start: NaiveDateTime,
	pub log_count: u64,
	pub group_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistogramResult {
	pub granularity_secs: u64,
	pub buckets: Vec<HistogramBucket>,
}

pub const MAX_CONTEXT_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy)]
pub struct LogContextParams {
	pub target_time_ms: i64,
	pub before_limit: u32,
	pub after_limit: u32,
	pub before_offset: u32,
	pub after_offset: u32,
	/// Pagination flag: switch the before bound from `<=` to `<` so a
	/// second page does not repeat boundary rows.
	pub exclude_boundary: bool,
}

impl LogContextParams {
	pub fn clamped(mut self) -> Self {
		self.before_limit = self.before_limit.min(MAX_CONTEXT_LIMIT);
		self.after_limit = self.after_limit.min(MAX_CONTEXT_LIMIT);
		self
	}
}

#[derive(Debug, Default)]
pub struct LogContextResult {
	pub before: Vec<LogRow>,
	pub target: Vec<LogRow>,
	pub after: Vec<LogRow>,
	pub stats: QueryStats,
}

/// The before-query returns newest-first. Flip it chronological (boundary
/// rows at the tail) and pull out the rows sitting exactly on the target
/// instant.
pub(crate) fn order_context_rows(
	mut rows_desc: Vec<LogRow>,
	ts_field: &str,
	target: NaiveDateTime,
) -> (Vec<LogRow>, Vec<LogRow>) {
	rows_desc.reverse();
	let target_rows = rows_desc
		.iter()
		.filter(|row| matches!(row.get(ts_field), Some(LogValue::DateTime(t)) if *t == target))
		.cloned()
		.collect();
	(rows_desc, target_rows)
}

#[derive(Debug, Clone)]
pub struct FieldValuesParams {
	pub field: String,
	pub field_type: Option<String>,
	pub range: TimeRange,
	pub limit: u32,
	/// Already-lowered native filter (WHERE fragment / LogsQL expression).
	pub filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldValueCount {
	pub value: String,
	pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldValuesResult {
	pub field: String,
	pub field_type: String,
	pub low_cardinality: bool,
	pub values: Vec<FieldValueCount>,
	pub total_distinct: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
	Healthy,
	Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceHealth {
	pub status: HealthStatus,
	pub last_checked: NaiveDateTime,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

impl SourceHealth {
	pub fn pending() -> Self {
		Self {
			status: HealthStatus::Unhealthy,
			last_checked: chrono::Utc::now().naive_utc(),
			error: Some("initial health check pending".to_string()),
		}
	}
}

/// Uniform per-source client contract, one implementation per backend
/// kind. All methods are safe for concurrent use.
#[async_trait]
pub trait BackendClient: Send + Sync {
	async fn query(&self, query: &str, timeout: Option<Duration>) -> Result<QueryOutput>;
	async fn table_info(&self, database: &str, table: &str) -> Result<TableInfo>;
	async fn histogram(&self, params: &HistogramParams) -> Result<HistogramResult>;
	async fn surrounding_logs(
		&self,
		params: &LogContextParams,
		timeout: Option<Duration>,
	) -> Result<LogContextResult>;
	async fn field_distinct_values(
		&self,
		params: &FieldValuesParams,
	) -> Result<FieldValuesResult>;
	async fn ping(&self) -> Result<()>;
	/// Rebuild the underlying network resource in place.
	async fn reconnect(&self) -> Result<()>;
	fn close(&self);
}

impl std::fmt::Debug for dyn BackendClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("dyn BackendClient").finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn test_context_limits_clamped() {
		let p = LogContextParams {
			target_time_ms: 0,
			before_limit: 500,
			after_limit: 7,
			before_offset: 0,
			after_offset: 0,
			exclude_boundary: false,
		}
		.clamped();
		assert_eq!(100, p.before_limit);
		assert_eq!(7, p.after_limit);
	}

	#[test]
	fn test_context_rows_chronological_with_boundary_at_tail() {
		let ts = |s: &str| {
			NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
		};
		let row = |t: NaiveDateTime, msg: &str| {
			LogRow::from([
				("timestamp".to_string(), LogValue::DateTime(t)),
				("msg".to_string(), LogValue::String(msg.to_string())),
			])
		};
		let target = ts("2024-01-15 10:00:10");
		// newest-first, as the backend returns them
		let desc = vec![
			row(target, "t-b"),
			row(target, "t-a"),
			row(ts("2024-01-15 10:00:09"), "earlier"),
		];
		let (before, target_rows) = order_context_rows(desc, "timestamp", target);
		// chronological, ending at the target instant
		assert_eq!(
			Some(&LogValue::String("earlier".to_string())),
			before[0].get("msg")
		);
		assert_eq!(
			Some(&LogValue::DateTime(target)),
			before[2].get("timestamp")
		);
		for w in before.windows(2) {
			let a = w[0].get("timestamp").unwrap();
			let b = w[1].get("timestamp").unwrap();
			let (LogValue::DateTime(a), LogValue::DateTime(b)) = (a, b) else {
				panic!("missing timestamps");
			};
			assert!(a <= b);
		}
		assert_eq!(2, target_rows.len());
	}

	#[test]
	fn test_backend_kind_serde() {
		assert_eq!(
			BackendKind::Sql,
			serde_json::from_str::<BackendKind>("\"sql\"").unwrap()
		);
		assert_eq!(
			BackendKind::Logsql,
			serde_json::from_str::<BackendKind>("\"logsql\"").unwrap()
		);
		assert_eq!(BackendKind::Sql, BackendKind::default());
	}
}
