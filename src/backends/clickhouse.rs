use super::*;
use crate::meta::SqlConnection;
use crate::services::histogram::auto_granularity;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use common::{format_sql_datetime, LogValue, TimeRange};
use serde::Deserialize;
use std::time::Duration;
use sqlbuilder::clickhouse::{ensure_ts_in_select, escape_string, histogram_over, quote_ident};
use std::sync::RwLock;
use std::time::Instant;
use tracing::debug;
use url::Url;

pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(60);
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// ClickHouse client over the HTTP interface. `FORMAT JSON` responses
/// carry column metadata, dynamic rows and the profile counters the
/// stats surface reads.
pub struct ClickhouseClient {
	http: RwLock<reqwest::Client>,
	endpoint: Url,
	database: String,
	table: String,
	ts_field: String,
	username: String,
	password: String,
	default_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ChResponse {
	#[serde(default)]
	meta: Vec<ChColumn>,
	#[serde(default)]
	data: Vec<serde_json::Value>,
	#[serde(default)]
	statistics: Option<ChStatistics>,
}

#[derive(Debug, Deserialize)]
struct ChColumn {
	name: String,
	#[serde(rename = "type")]
	column_type: String,
}

#[derive(Debug, Deserialize)]
struct ChStatistics {
	#[serde(default)]
	rows_read: u64,
	#[serde(default)]
	bytes_read: u64,
}

impl ClickhouseClient {
	pub fn new(
		conn: &SqlConnection,
		ts_field: &str,
		default_timeout: Duration,
	) -> Result<Self> {
		let endpoint = Url::parse(&conn.url)
			.map_err(|e| BackendError::Internal(format!("bad clickhouse url {}: {e}", conn.url)))?;
		Ok(Self {
			http: RwLock::new(build_http()?),
			endpoint,
			database: conn.database.clone(),
			table: conn.table.clone(),
			ts_field: ts_field.to_string(),
			username: conn.username.clone(),
			password: conn.password.clone(),
			default_timeout,
		})
	}

	fn http(&self) -> reqwest::Client {
		self.http.read().unwrap().clone()
	}

	fn table_ref(&self) -> String {
		format!("{}.{}", self.database, self.table)
	}

	async fn execute(
		&self,
		sql: &str,
		timeout: Option<Duration>,
	) -> Result<(ChResponse, QueryStats)> {
		let timeout = timeout.unwrap_or(self.default_timeout);
		let started = Instant::now();
		let request = self
			.http()
			.post(self.endpoint.clone())
			.query(&[
				("database", self.database.as_str()),
				("default_format", "JSON"),
			])
			.header("X-ClickHouse-User", &self.username)
			.header("X-ClickHouse-Key", &self.password)
			.body(sql.to_string());

		debug!(sql, "executing clickhouse query");
		let run = async {
			let resp = request.send().await.map_err(map_transport_error)?;
			let status = resp.status();
			let summary = resp
				.headers()
				.get("X-ClickHouse-Summary")
				.and_then(|v| v.to_str().ok())
				.map(str::to_string);
			let body = resp.text().await.map_err(map_transport_error)?;
			if !status.is_success() {
				return Err(classify_server_error(status.as_u16(), &body));
			}
			let parsed: ChResponse = serde_json::from_str(&body)
				.map_err(|e| BackendError::Internal(format!("bad response body: {e}")))?;
			Ok((parsed, summary))
		};
		let (parsed, summary) = tokio::time::timeout(timeout, run)
			.await
			.map_err(|_| BackendError::Timeout(timeout))??;

		let mut stats = QueryStats {
			execution_time_ms: started.elapsed().as_secs_f64() * 1000.0,
			..QueryStats::default()
		};
		if let Some(st) = &parsed.statistics {
			stats.rows_read = st.rows_read;
			stats.bytes_read = st.bytes_read;
		} else if let Some(raw) = summary.as_deref() {
			if let Some((rows, bytes)) = parse_summary(raw) {
				stats.rows_read = rows;
				stats.bytes_read = bytes;
			}
		}
		Ok((parsed, stats))
	}

	fn decode(&self, resp: ChResponse, stats: QueryStats) -> QueryOutput {
		let columns: Vec<ColumnInfo> = resp
			.meta
			.iter()
			.map(|c| ColumnInfo {
				name: c.name.clone(),
				column_type: c.column_type.clone(),
			})
			.collect();
		let rows = resp
			.data
			.into_iter()
			.filter_map(|item| match item {
				serde_json::Value::Object(obj) => {
					let mut row = LogRow::new();
					for (name, value) in obj {
						let col_type = resp
							.meta
							.iter()
							.find(|c| c.name == name)
							.map(|c| c.column_type.as_str())
							.unwrap_or("String");
						row.insert(name, decode_cell(col_type, value));
					}
					Some(row)
				}
				_ => None,
			})
			.collect();
		QueryOutput {
			rows,
			columns,
			stats,
		}
	}

	fn time_bound_where(&self, range: &TimeRange, filter: Option<&str>) -> String {
		let mut out = format!(
			"{} BETWEEN toDateTime('{}','{}') AND toDateTime('{}','{}')",
			quote_ident(&self.ts_field),
			format_sql_datetime(range.start),
			range.timezone,
			format_sql_datetime(range.end),
			range.timezone,
		);
		if let Some(frag) = filter {
			if !frag.is_empty() {
				out.push_str(" AND ");
				if frag.starts_with('(') {
					out.push_str(frag);
				} else {
					out.push_str(&format!("({})", frag));
				}
			}
		}
		out
	}

	fn column_type_sql(&self, field: &str) -> String {
		format!(
			"SELECT type FROM system.columns WHERE database = '{}' AND table = '{}' AND name = '{}'",
			escape_string(&self.database),
			escape_string(&self.table),
			escape_string(field),
		)
	}
}

fn build_http() -> Result<reqwest::Client> {
	reqwest::Client::builder()
		.build()
		.map_err(|e| BackendError::Internal(format!("http client: {e}")))
}

fn map_transport_error(e: reqwest::Error) -> BackendError {
	if e.is_timeout() {
		BackendError::Timeout(DEFAULT_QUERY_TIMEOUT)
	} else if e.is_connect() {
		BackendError::Unavailable(e.to_string())
	} else {
		BackendError::Internal(e.to_string())
	}
}

// server exception codes worth telling apart
const CODE_UNKNOWN_IDENT: i64 = 47;
const CODE_UNKNOWN_TABLE: i64 = 60;
const CODE_SYNTAX_ERROR: i64 = 62;
const CODE_UNKNOWN_DATABASE: i64 = 81;
const CODE_TIMEOUT_EXCEEDED: i64 = 159;
const CODE_TOO_MANY_QUERIES: i64 = 202;
const CODE_ACCESS_DENIED: i64 = 497;
const CODE_AUTH_FAILED: i64 = 516;

fn classify_server_error(status: u16, body: &str) -> BackendError {
	let message = body.trim().to_string();
	match parse_exception_code(body) {
		Some(CODE_SYNTAX_ERROR) | Some(CODE_UNKNOWN_IDENT) => {
			BackendError::InvalidQuery(message)
		}
		Some(CODE_UNKNOWN_TABLE) | Some(CODE_UNKNOWN_DATABASE) => {
			BackendError::NotFound(message)
		}
		Some(CODE_TIMEOUT_EXCEEDED) => BackendError::Timeout(DEFAULT_QUERY_TIMEOUT),
		Some(CODE_TOO_MANY_QUERIES) => BackendError::Unavailable(message),
		Some(CODE_ACCESS_DENIED) | Some(CODE_AUTH_FAILED) => {
			BackendError::PermissionDenied(message)
		}
		Some(_) => BackendError::Internal(message),
		None if status == 401 || status == 403 => BackendError::PermissionDenied(message),
		None if status >= 500 => BackendError::Unavailable(message),
		None => BackendError::Internal(message),
	}
}

fn parse_exception_code(body: &str) -> Option<i64> {
	let rest = body.trim_start().strip_prefix("Code: ")?;
	let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
	digits.parse().ok()
}

fn parse_summary(raw: &str) -> Option<(u64, u64)> {
	let v: serde_json::Value = serde_json::from_str(raw).ok()?;
	let read = |key: &str| {
		v.get(key)
			.and_then(|x| x.as_str())
			.and_then(|s| s.parse::<u64>().ok())
	};
	Some((read("read_rows")?, read("read_bytes")?))
}

fn base_type(t: &str) -> &str {
	let mut t = t;
	loop {
		if let Some(inner) = t
			.strip_prefix("Nullable(")
			.or_else(|| t.strip_prefix("LowCardinality("))
		{
			t = inner.strip_suffix(')').unwrap_or(inner);
		} else {
			return t;
		}
	}
}

fn is_integer_type(t: &str) -> bool {
	let t = base_type(t);
	t.starts_with("UInt") || t.starts_with("Int")
}

fn is_float_type(t: &str) -> bool {
	let t = base_type(t);
	t.starts_with("Float") || t.starts_with("Decimal")
}

fn is_datetime_type(t: &str) -> bool {
	let t = base_type(t);
	t.starts_with("DateTime") || t == "Date" || t == "Date32"
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
	for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
		if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
			return Some(t);
		}
	}
	if let Ok(t) = chrono::DateTime::parse_from_rfc3339(s) {
		return Some(t.naive_utc());
	}
	if let Ok(d) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
		return d.and_hms_opt(0, 0, 0);
	}
	None
}

/// JSON output quotes 64-bit integers and renders datetimes as strings;
/// recover the typed value from the column type.
fn decode_cell(col_type: &str, value: serde_json::Value) -> LogValue {
	match value {
		serde_json::Value::String(s) => {
			if is_datetime_type(col_type) {
				match parse_datetime(&s) {
					Some(t) => LogValue::DateTime(t),
					None => LogValue::String(s),
				}
			} else if is_integer_type(col_type) {
				match s.parse::<i64>() {
					Ok(i) => LogValue::Int(i),
					Err(_) => LogValue::String(s),
				}
			} else if is_float_type(col_type) {
				match s.parse::<f64>() {
					Ok(f) => LogValue::Float(f),
					Err(_) => LogValue::String(s),
				}
			} else {
				LogValue::String(s)
			}
		}
		other => LogValue::from(other),
	}
}

#[async_trait]
impl BackendClient for ClickhouseClient {
	async fn query(&self, query: &str, timeout: Option<Duration>) -> Result<QueryOutput> {
		let (resp, stats) = self.execute(query, timeout).await?;
		Ok(self.decode(resp, stats))
	}

	async fn table_info(&self, database: &str, table: &str) -> Result<TableInfo> {
		let meta_sql = format!(
			"SELECT engine, sorting_key, create_table_query FROM system.tables WHERE database = '{}' AND name = '{}'",
			escape_string(database),
			escape_string(table),
		);
		let (resp, stats) = self.execute(&meta_sql, None).await?;
		let out = self.decode(resp, stats);
		let Some(row) = out.rows.first() else {
			return Err(BackendError::NotFound(format!("table {database}.{table}")));
		};
		let text = |key: &str| {
			row.get(key)
				.and_then(|v| v.as_str())
				.unwrap_or_default()
				.to_string()
		};
		let engine = text("engine");
		let sort_keys: Vec<String> = text("sorting_key")
			.split(',')
			.map(|s| s.trim().to_string())
			.filter(|s| !s.is_empty())
			.collect();
		let create_query = text("create_table_query");

		let cols_sql = format!(
			"SELECT name, type FROM system.columns WHERE database = '{}' AND table = '{}' ORDER BY position",
			escape_string(database),
			escape_string(table),
		);
		let (resp, stats) = self.execute(&cols_sql, None).await?;
		let out = self.decode(resp, stats);
		let columns = out
			.rows
			.iter()
			.map(|row| ColumnInfo {
				name: row
					.get("name")
					.and_then(|v| v.as_str())
					.unwrap_or_default()
					.to_string(),
				column_type: row
					.get("type")
					.and_then(|v| v.as_str())
					.unwrap_or_default()
					.to_string(),
			})
			.collect();

		Ok(TableInfo {
			engine,
			columns,
			sort_keys,
			create_query,
		})
	}

	async fn histogram(&self, params: &HistogramParams) -> Result<HistogramResult> {
		let granularity = params
			.window_secs
			.unwrap_or_else(|| auto_granularity(params.range.span_seconds()));
		let base = ensure_ts_in_select(&params.query, &self.ts_field);
		let sql = histogram_over(
			&base,
			&self.ts_field,
			&params.range.timezone,
			granularity,
			params.group_by.as_deref(),
		);
		let (resp, stats) = self.execute(&sql, None).await?;
		let out = self.decode(resp, stats);
		let mut buckets = vec![];
		for row in &out.rows {
			let start = match row.get("bucket") {
				Some(LogValue::DateTime(t)) => *t,
				Some(LogValue::String(s)) => match parse_datetime(s) {
					Some(t) => t,
					None => continue,
				},
				_ => continue,
			};
			let count = match row.get("log_count") {
				Some(LogValue::Int(i)) => *i as u64,
				Some(LogValue::String(s)) => s.parse().unwrap_or(0),
				_ => 0,
			};
			let group_value = row
				.get("group_value")
				.and_then(|v| v.as_str())
				.map(str::to_string);
			buckets.push(HistogramBucket {
				bucket_start: start,
				log_count: count,
				group_value,
			});
		}
		Ok(HistogramResult {
			granularity_secs: granularity,
			buckets,
		})
	}

	async fn surrounding_logs(
		&self,
		params: &LogContextParams,
		timeout: Option<Duration>,
	) -> Result<LogContextResult> {
		let p = params.clamped();
		let target_time = chrono::DateTime::from_timestamp_millis(p.target_time_ms)
			.ok_or_else(|| {
				BackendError::InvalidQuery(format!("bad target timestamp {}", p.target_time_ms))
			})?
			.naive_utc();
		let ts = quote_ident(&self.ts_field);
		let target = format!("fromUnixTimestamp64Milli({})", p.target_time_ms);
		let before_cmp = if p.exclude_boundary { "<" } else { "<=" };
		let before_sql = format!(
			"SELECT * FROM {} WHERE {} {} {} ORDER BY {} DESC LIMIT {} OFFSET {}",
			self.table_ref(),
			ts,
			before_cmp,
			target,
			ts,
			p.before_limit,
			p.before_offset,
		);
		let after_sql = format!(
			"SELECT * FROM {} WHERE {} > {} ORDER BY {} ASC LIMIT {} OFFSET {}",
			self.table_ref(),
			ts,
			target,
			ts,
			p.after_limit,
			p.after_offset,
		);

		let (before_resp, before_stats) = self.execute(&before_sql, timeout).await?;
		let (after_resp, after_stats) = self.execute(&after_sql, timeout).await?;
		let before = self.decode(before_resp, before_stats);
		let after = self.decode(after_resp, after_stats);
		let (before_rows, target_rows) =
			super::order_context_rows(before.rows, &self.ts_field, target_time);

		let stats = QueryStats {
			execution_time_ms: before.stats.execution_time_ms + after.stats.execution_time_ms,
			rows_read: before.stats.rows_read + after.stats.rows_read,
			bytes_read: before.stats.bytes_read + after.stats.bytes_read,
		};
		Ok(LogContextResult {
			before: before_rows,
			target: target_rows,
			after: after.rows,
			stats,
		})
	}

	async fn field_distinct_values(
		&self,
		params: &FieldValuesParams,
	) -> Result<FieldValuesResult> {
		let field_type = match &params.field_type {
			Some(t) => t.clone(),
			None => {
				let (resp, stats) =
					self.execute(&self.column_type_sql(&params.field), None).await?;
				let out = self.decode(resp, stats);
				out.rows
					.first()
					.and_then(|row| row.get("type"))
					.and_then(|v| v.as_str())
					.map(str::to_string)
					.ok_or_else(|| {
						BackendError::NotFound(format!("column {} not found", params.field))
					})?
			}
		};
		let col = quote_ident(&params.field);
		let where_part = self.time_bound_where(&params.range, params.filter.as_deref());
		let values_sql = format!(
			"SELECT toString({col}) AS value, count(*) AS c FROM {} WHERE {} GROUP BY value ORDER BY c DESC LIMIT {}",
			self.table_ref(),
			where_part,
			params.limit,
		);
		let (resp, stats) = self.execute(&values_sql, None).await?;
		let out = self.decode(resp, stats);
		let values = out
			.rows
			.iter()
			.map(|row| FieldValueCount {
				value: row
					.get("value")
					.and_then(|v| v.as_str())
					.unwrap_or_default()
					.to_string(),
				count: match row.get("c") {
					Some(LogValue::Int(i)) => *i as u64,
					Some(LogValue::String(s)) => s.parse().unwrap_or(0),
					_ => 0,
				},
			})
			.collect();

		let distinct_sql = format!(
			"SELECT uniqExact({col}) AS total FROM {} WHERE {}",
			self.table_ref(),
			where_part,
		);
		let (resp, stats) = self.execute(&distinct_sql, None).await?;
		let out = self.decode(resp, stats);
		let total_distinct = out
			.rows
			.first()
			.and_then(|row| row.get("total"))
			.map(|v| match v {
				LogValue::Int(i) => *i as u64,
				LogValue::String(s) => s.parse().unwrap_or(0),
				_ => 0,
			})
			.unwrap_or(0);

		Ok(FieldValuesResult {
			field: params.field.clone(),
			low_cardinality: crate::services::fields::is_low_cardinality(&field_type),
			field_type,
			values,
			total_distinct,
		})
	}

	async fn ping(&self) -> Result<()> {
		self.execute("SELECT 1", Some(PING_TIMEOUT)).await?;
		Ok(())
	}

	async fn reconnect(&self) -> Result<()> {
		let fresh = build_http()?;
		*self.http.write().unwrap() = fresh;
		Ok(())
	}

	fn close(&self) {
		// connection pool is dropped with the client
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn test_decode_cell_recovers_types() {
		let dt = decode_cell(
			"DateTime64(3)",
			serde_json::Value::String("2024-01-15 10:00:00.123".to_string()),
		);
		let LogValue::DateTime(t) = dt else {
			panic!("expected datetime, got {dt:?}");
		};
		assert_eq!("2024-01-15T10:00:00.123Z", common::format_rfc3339_millis(t));

		assert_eq!(
			LogValue::Int(123),
			decode_cell("UInt64", serde_json::Value::String("123".to_string()))
		);
		assert_eq!(
			LogValue::Int(7),
			decode_cell("Nullable(Int64)", serde_json::json!(7))
		);
		assert_eq!(
			LogValue::Float(1.5),
			decode_cell("Float64", serde_json::json!(1.5))
		);
		assert_eq!(
			LogValue::String("abc".to_string()),
			decode_cell("LowCardinality(String)", serde_json::json!("abc"))
		);
		assert_eq!(LogValue::Null, decode_cell("Nullable(String)", serde_json::Value::Null));
	}

	#[test]
	fn test_classify_server_errors() {
		let e = classify_server_error(400, "Code: 62. DB::Exception: Syntax error");
		assert!(matches!(e, BackendError::InvalidQuery(_)));
		let e = classify_server_error(404, "Code: 60. DB::Exception: Table default.nope does not exist");
		assert!(matches!(e, BackendError::NotFound(_)));
		let e = classify_server_error(403, "Code: 497. DB::Exception: not enough privileges");
		assert!(matches!(e, BackendError::PermissionDenied(_)));
		let e = classify_server_error(500, "Code: 159. DB::Exception: timeout exceeded");
		assert!(matches!(e, BackendError::Timeout(_)));
		let e = classify_server_error(503, "Code: 202. DB::Exception: too many simultaneous queries");
		assert!(matches!(e, BackendError::Unavailable(_)));
		let e = classify_server_error(502, "upstream unreachable");
		assert!(matches!(e, BackendError::Unavailable(_)));
	}

	#[test]
	fn test_parse_summary_header() {
		let raw = r#"{"read_rows":"4096","read_bytes":"1048576","written_rows":"0"}"#;
		assert_eq!(Some((4096, 1048576)), parse_summary(raw));
		assert_eq!(None, parse_summary("not json"));
	}

	#[test]
	fn test_base_type_unwrapping() {
		assert_eq!("String", base_type("LowCardinality(Nullable(String))"));
		assert_eq!("Int64", base_type("Nullable(Int64)"));
		assert_eq!("DateTime64(3)", base_type("DateTime64(3)"));
		assert!(is_integer_type("Nullable(UInt32)"));
		assert!(is_float_type("Decimal(10, 2)"));
		assert!(is_datetime_type("Nullable(DateTime)"));
	}
}
