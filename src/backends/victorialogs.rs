use super::*;
use crate::meta::LogsqlConnection;
use crate::services::histogram::auto_granularity;
use async_trait::async_trait;
use bytes::BytesMut;
use chrono::NaiveDateTime;
use common::{format_rfc3339_millis, LogValue, TimeRange};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tokio_stream::StreamExt;
use tracing::{debug, warn};
use url::Url;

const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;
const PING_TIMEOUT: Duration = Duration::from_secs(5);
/// Window searched around the target when emulating log context; the
/// engine has no native surrounding-logs endpoint.
const CONTEXT_WINDOW_MS: i64 = 24 * 3600 * 1000;

const TIME_KEY: &str = "_time";

/// VictoriaLogs client: LogsQL over HTTP, JSONL result streaming,
/// multi-tenant via `AccountID`/`ProjectID` headers.
pub struct VictoriaLogsClient {
	http: RwLock<reqwest::Client>,
	base: Url,
	account_id: Option<String>,
	project_id: Option<String>,
	default_timeout: Duration,
}

impl VictoriaLogsClient {
	pub fn new(conn: &LogsqlConnection, default_timeout: Duration) -> Result<Self> {
		let base = Url::parse(&conn.url)
			.map_err(|e| BackendError::Internal(format!("bad victorialogs url {}: {e}", conn.url)))?;
		Ok(Self {
			http: RwLock::new(build_http()?),
			base,
			account_id: conn.account_id.clone(),
			project_id: conn.project_id.clone(),
			default_timeout,
		})
	}

	fn http(&self) -> reqwest::Client {
		self.http.read().unwrap().clone()
	}

	fn endpoint(&self, path: &str) -> Result<Url> {
		self.base
			.join(path)
			.map_err(|e| BackendError::Internal(format!("bad endpoint {path}: {e}")))
	}

	fn with_tenancy(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		if let Some(account) = &self.account_id {
			req = req.header("AccountID", account);
		}
		if let Some(project) = &self.project_id {
			req = req.header("ProjectID", project);
		}
		req
	}

	async fn run_query(
		&self,
		logsql: &str,
		limit: Option<u64>,
		timeout: Option<Duration>,
	) -> Result<QueryOutput> {
		let timeout = timeout.unwrap_or(self.default_timeout);
		let started = Instant::now();
		let mut form: Vec<(&str, String)> = vec![("query", logsql.to_string())];
		if let Some(n) = limit {
			form.push(("limit", n.to_string()));
		}
		let request = self
			.with_tenancy(self.http().post(self.endpoint("/select/logsql/query")?))
			.form(&form);

		debug!(logsql, "executing victorialogs query");
		let run = async {
			let resp = request.send().await.map_err(map_transport_error)?;
			let status = resp.status();
			if !status.is_success() {
				let body = resp.text().await.unwrap_or_default();
				return Err(classify_status(status.as_u16(), &body));
			}
			let header_stats = read_stats_headers(resp.headers());
			let mut decoder = JsonlDecoder::default();
			let mut stream = Box::pin(resp.bytes_stream());
			while let Some(chunk) = stream.next().await {
				let chunk = chunk.map_err(map_transport_error)?;
				decoder.push_chunk(&chunk);
			}
			Ok((decoder.finish(), header_stats))
		};
		let ((rows, columns, lines), header_stats) = tokio::time::timeout(timeout, run)
			.await
			.map_err(|_| BackendError::Timeout(timeout))??;

		let stats = QueryStats {
			execution_time_ms: header_stats
				.execution_time_ms
				.unwrap_or_else(|| started.elapsed().as_secs_f64() * 1000.0),
			rows_read: header_stats.rows_read.unwrap_or(lines),
			bytes_read: header_stats.bytes_read.unwrap_or(0),
		};
		Ok(QueryOutput {
			rows,
			columns,
			stats,
		})
	}

	async fn get_json<T: serde::de::DeserializeOwned>(
		&self,
		path: &str,
		params: &[(&str, String)],
		timeout: Duration,
	) -> Result<T> {
		let request = self
			.with_tenancy(self.http().get(self.endpoint(path)?))
			.query(params);
		let run = async {
			let resp = request.send().await.map_err(map_transport_error)?;
			let status = resp.status();
			if !status.is_success() {
				let body = resp.text().await.unwrap_or_default();
				return Err(classify_status(status.as_u16(), &body));
			}
			resp.json::<T>()
				.await
				.map_err(|e| BackendError::Internal(format!("bad response body: {e}")))
		};
		tokio::time::timeout(timeout, run)
			.await
			.map_err(|_| BackendError::Timeout(timeout))?
	}
}

fn build_http() -> Result<reqwest::Client> {
	reqwest::Client::builder()
		.build()
		.map_err(|e| BackendError::Internal(format!("http client: {e}")))
}

fn map_transport_error(e: reqwest::Error) -> BackendError {
	if e.is_timeout() {
		BackendError::Timeout(Duration::from_secs(60))
	} else if e.is_connect() {
		BackendError::Unavailable(e.to_string())
	} else {
		BackendError::Internal(e.to_string())
	}
}

fn classify_status(status: u16, body: &str) -> BackendError {
	let message = body.trim().to_string();
	match status {
		400 | 422 => BackendError::InvalidQuery(message),
		401 | 403 => BackendError::PermissionDenied(message),
		404 => BackendError::NotFound(message),
		_ if status >= 500 => BackendError::Unavailable(message),
		_ => BackendError::Internal(message),
	}
}

#[derive(Debug, Default)]
struct HeaderStats {
	rows_read: Option<u64>,
	bytes_read: Option<u64>,
	execution_time_ms: Option<f64>,
}

fn read_stats_headers(headers: &reqwest::header::HeaderMap) -> HeaderStats {
	let get = |name: &str| {
		headers
			.get(name)
			.and_then(|v| v.to_str().ok())
			.map(str::to_string)
	};
	HeaderStats {
		rows_read: get("X-Stats-Rows-Read").and_then(|s| s.parse().ok()),
		bytes_read: get("X-Stats-Bytes-Read").and_then(|s| s.parse().ok()),
		execution_time_ms: get("X-Stats-Execution-Time-Seconds")
			.and_then(|s| s.parse::<f64>().ok())
			.map(|secs| secs * 1000.0),
	}
}

/// Schemaless type inference for one JSON cell.
fn infer(value: serde_json::Value) -> (LogValue, &'static str) {
	match value {
		serde_json::Value::Null => (LogValue::Null, "Nullable(String)"),
		serde_json::Value::Bool(b) => (LogValue::Bool(b), "Bool"),
		serde_json::Value::Number(n) => {
			if let Some(i) = n.as_i64() {
				(LogValue::Int(i), "Int64")
			} else {
				(LogValue::Float(n.as_f64().unwrap_or(f64::NAN)), "Float64")
			}
		}
		serde_json::Value::String(s) => match chrono::DateTime::parse_from_rfc3339(&s) {
			Ok(t) => (LogValue::DateTime(t.naive_utc()), "DateTime64"),
			Err(_) => (LogValue::String(s), "String"),
		},
		serde_json::Value::Array(items) => (
			LogValue::Array(items.into_iter().map(LogValue::from).collect()),
			"Array(String)",
		),
		serde_json::Value::Object(entries) => (
			LogValue::Map(
				entries
					.into_iter()
					.map(|(k, v)| (k, LogValue::from(v)))
					.collect(),
			),
			"JSON",
		),
	}
}

/// Incremental JSONL decoder: splits a byte stream on newlines, skips
/// malformed lines and lines over the 10 MiB cap, and accumulates the
/// union of observed columns.
#[derive(Default)]
struct JsonlDecoder {
	buf: BytesMut,
	skipping_oversize: bool,
	rows: Vec<LogRow>,
	columns: BTreeMap<String, &'static str>,
	lines: u64,
	malformed: u64,
}

impl JsonlDecoder {
	fn push_chunk(&mut self, chunk: &[u8]) {
		self.buf.extend_from_slice(chunk);
		loop {
			match self.buf.iter().position(|b| *b == b'\n') {
				Some(pos) => {
					let line = self.buf.split_to(pos + 1);
					if self.skipping_oversize {
						self.skipping_oversize = false;
						self.malformed += 1;
						continue;
					}
					self.handle_line(&line[..line.len() - 1]);
				}
				None => {
					if self.buf.len() > MAX_LINE_BYTES {
						self.buf.clear();
						self.skipping_oversize = true;
					}
					break;
				}
			}
		}
	}

	fn handle_line(&mut self, line: &[u8]) {
		let trimmed = match std::str::from_utf8(line) {
			Ok(s) => s.trim(),
			Err(_) => {
				self.malformed += 1;
				return;
			}
		};
		if trimmed.is_empty() {
			return;
		}
		self.lines += 1;
		let serde_json::Value::Object(obj) = serde_json::from_str::<serde_json::Value>(trimmed)
			.unwrap_or(serde_json::Value::Null)
		else {
			self.malformed += 1;
			return;
		};
		let mut row = LogRow::new();
		for (name, value) in obj {
			let (cell, inferred) = infer(value);
			// a concrete type observed later upgrades a null-only column
			match self.columns.get(name.as_str()) {
				Some(existing) if *existing != "Nullable(String)" => {}
				_ => {
					self.columns.insert(name.clone(), inferred);
				}
			}
			row.insert(name, cell);
		}
		self.rows.push(row);
	}

	fn finish(mut self) -> (Vec<LogRow>, Vec<ColumnInfo>, u64) {
		if !self.buf.is_empty() && !self.skipping_oversize {
			let leftover = self.buf.split();
			self.handle_line(&leftover);
		}
		if self.malformed > 0 {
			warn!(malformed = self.malformed, "skipped malformed jsonl lines");
		}
		let columns = self
			.columns
			.iter()
			.map(|(name, ty)| ColumnInfo {
				name: name.clone(),
				column_type: ty.to_string(),
			})
			.collect();
		(self.rows, columns, self.lines)
	}
}

#[derive(Debug, Deserialize)]
struct HitsResponse {
	#[serde(default)]
	hits: Vec<HitsSeries>,
}

#[derive(Debug, Deserialize)]
struct HitsSeries {
	#[serde(default)]
	fields: BTreeMap<String, String>,
	#[serde(default)]
	timestamps: Vec<String>,
	#[serde(default)]
	values: Vec<u64>,
}

#[derive(Debug, Deserialize)]
struct FieldValuesResponse {
	#[serde(default)]
	values: Vec<FieldValueHit>,
}

#[derive(Debug, Deserialize)]
struct FieldValueHit {
	value: String,
	#[serde(default)]
	hits: u64,
}

fn range_params(range: &TimeRange) -> [(&'static str, String); 2] {
	[
		("start", format_rfc3339_millis(range.start)),
		("end", format_rfc3339_millis(range.end)),
	]
}

const TOP_GROUPS: usize = 10;

fn hits_to_buckets(resp: HitsResponse, grouped: bool) -> Vec<HistogramBucket> {
	let mut series: Vec<(Option<String>, u64, Vec<(NaiveDateTime, u64)>)> = resp
		.hits
		.into_iter()
		.map(|hit| {
			let group = if grouped {
				Some(hit.fields.values().cloned().collect::<Vec<_>>().join(","))
			} else {
				None
			};
			let points: Vec<(NaiveDateTime, u64)> = hit
				.timestamps
				.iter()
				.zip(hit.values.iter())
				.filter_map(|(ts, count)| {
					chrono::DateTime::parse_from_rfc3339(ts)
						.ok()
						.map(|t| (t.naive_utc(), *count))
				})
				.collect();
			let total: u64 = points.iter().map(|(_, c)| c).sum();
			(group, total, points)
		})
		.collect();
	if grouped {
		// keep the 10 largest groups, drop the rest outright
		series.sort_by(|a, b| b.1.cmp(&a.1));
		series.truncate(TOP_GROUPS);
	}
	let mut buckets: Vec<HistogramBucket> = series
		.into_iter()
		.flat_map(|(group, _, points)| {
			points.into_iter().map(move |(ts, count)| HistogramBucket {
				bucket_start: ts,
				log_count: count,
				group_value: group.clone(),
			})
		})
		.filter(|b| b.log_count > 0)
		.collect();
	buckets.sort_by(|a, b| {
		a.bucket_start
			.cmp(&b.bucket_start)
			.then_with(|| a.group_value.cmp(&b.group_value))
	});
	buckets
}

#[async_trait]
impl BackendClient for VictoriaLogsClient {
	async fn query(&self, query: &str, timeout: Option<Duration>) -> Result<QueryOutput> {
		self.run_query(query, None, timeout).await
	}

	async fn table_info(&self, _database: &str, _table: &str) -> Result<TableInfo> {
		let now = chrono::Utc::now().naive_utc();
		let range = TimeRange {
			start: now - chrono::Duration::days(1),
			end: now,
			timezone: "UTC".to_string(),
		};
		let mut params: Vec<(&str, String)> = vec![("query", "*".to_string())];
		params.extend(range_params(&range));
		let resp: FieldValuesResponse = self
			.get_json("/select/logsql/field_names", &params, self.default_timeout)
			.await?;
		let columns = resp
			.values
			.into_iter()
			.map(|v| ColumnInfo {
				column_type: if v.value == TIME_KEY {
					"DateTime64".to_string()
				} else {
					"String".to_string()
				},
				name: v.value,
			})
			.collect();
		Ok(TableInfo {
			engine: "VictoriaLogs".to_string(),
			columns,
			sort_keys: vec![TIME_KEY.to_string()],
			create_query: String::new(),
		})
	}

	async fn histogram(&self, params: &HistogramParams) -> Result<HistogramResult> {
		let granularity = params
			.window_secs
			.unwrap_or_else(|| auto_granularity(params.range.span_seconds()));
		let mut query_params: Vec<(&str, String)> = vec![
			("query", params.query.clone()),
			("step", format!("{granularity}s")),
		];
		query_params.extend(range_params(&params.range));
		if let Some(group) = &params.group_by {
			query_params.push(("field", group.clone()));
		}
		let resp: HitsResponse = self
			.get_json("/select/logsql/hits", &query_params, self.default_timeout)
			.await?;
		Ok(HistogramResult {
			granularity_secs: granularity,
			buckets: hits_to_buckets(resp, params.group_by.is_some()),
		})
	}

	async fn surrounding_logs(
		&self,
		params: &LogContextParams,
		timeout: Option<Duration>,
	) -> Result<LogContextResult> {
		let p = params.clamped();
		let target = chrono::DateTime::from_timestamp_millis(p.target_time_ms)
			.ok_or_else(|| {
				BackendError::InvalidQuery(format!("bad target timestamp {}", p.target_time_ms))
			})?
			.naive_utc();
		let window = chrono::Duration::milliseconds(CONTEXT_WINDOW_MS);
		let target_str = format_rfc3339_millis(target);
		let before_bracket = if p.exclude_boundary { ')' } else { ']' };
		let before_query = format!(
			"_time:[{}, {}{} * | sort by ({}) desc | offset {} | limit {}",
			format_rfc3339_millis(target - window),
			target_str,
			before_bracket,
			TIME_KEY,
			p.before_offset,
			p.before_limit,
		);
		let after_query = format!(
			"_time:({}, {}] * | sort by ({}) | offset {} | limit {}",
			target_str,
			format_rfc3339_millis(target + window),
			TIME_KEY,
			p.after_offset,
			p.after_limit,
		);

		let before = self
			.run_query(&before_query, Some(p.before_limit as u64), timeout)
			.await?;
		let after = self
			.run_query(&after_query, Some(p.after_limit as u64), timeout)
			.await?;
		let (before_rows, target_rows) =
			super::order_context_rows(before.rows, TIME_KEY, target);

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
		let filter = params
			.filter
			.clone()
			.filter(|f| !f.trim().is_empty())
			.unwrap_or_else(|| "*".to_string());
		let mut query_params: Vec<(&str, String)> = vec![
			("query", filter),
			("field", params.field.clone()),
		];
		query_params.extend(range_params(&params.range));
		let resp: FieldValuesResponse = self
			.get_json("/select/logsql/field_values", &query_params, self.default_timeout)
			.await?;
		let mut all: Vec<FieldValueCount> = resp
			.values
			.into_iter()
			.map(|v| FieldValueCount {
				value: v.value,
				count: v.hits,
			})
			.collect();
		all.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
		let total_distinct = all.len() as u64;
		all.truncate(params.limit as usize);
		Ok(FieldValuesResult {
			field: params.field.clone(),
			field_type: params
				.field_type
				.clone()
				.unwrap_or_else(|| "String".to_string()),
			low_cardinality: false,
			values: all,
			total_distinct,
		})
	}

	async fn ping(&self) -> Result<()> {
		let request = self.with_tenancy(self.http().get(self.endpoint("/health")?));
		let run = async {
			let resp = request.send().await.map_err(map_transport_error)?;
			if resp.status().is_success() {
				Ok(())
			} else {
				Err(BackendError::Unavailable(format!(
					"health probe returned {}",
					resp.status()
				)))
			}
		};
		tokio::time::timeout(PING_TIMEOUT, run)
			.await
			.map_err(|_| BackendError::Timeout(PING_TIMEOUT))?
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

	fn decode_all(chunks: &[&[u8]]) -> (Vec<LogRow>, Vec<ColumnInfo>, u64) {
		let mut decoder = JsonlDecoder::default();
		for chunk in chunks {
			decoder.push_chunk(chunk);
		}
		decoder.finish()
	}

	#[test]
	fn test_jsonl_decode_and_type_inference() {
		let (rows, columns, lines) = decode_all(&[
			br#"{"_time":"2024-01-15T10:00:00Z","_msg":"hello","status":200}"#,
			b"\n",
			br#"{"_msg":"world","ratio":0.5,"tags":["a","b"],"extra":null}"#,
			b"\n",
		]);
		assert_eq!(2, lines);
		assert_eq!(2, rows.len());
		let types: BTreeMap<String, String> = columns
			.into_iter()
			.map(|c| (c.name, c.column_type))
			.collect();
		assert_eq!(Some(&"DateTime64".to_string()), types.get("_time"));
		assert_eq!(Some(&"String".to_string()), types.get("_msg"));
		assert_eq!(Some(&"Int64".to_string()), types.get("status"));
		assert_eq!(Some(&"Float64".to_string()), types.get("ratio"));
		assert_eq!(Some(&"Array(String)".to_string()), types.get("tags"));
		assert_eq!(Some(&"Nullable(String)".to_string()), types.get("extra"));
	}

	#[test]
	fn test_jsonl_lines_split_across_chunks() {
		let (rows, _, lines) = decode_all(&[
			br#"{"_msg":"he"#,
			br#"llo"}"#,
			b"\n",
			br#"{"_msg":"tail-without-newline"}"#,
		]);
		assert_eq!(2, rows.len());
		assert_eq!(2, lines);
		assert_eq!(
			Some(&LogValue::String("hello".to_string())),
			rows[0].get("_msg")
		);
	}

	#[test]
	fn test_jsonl_malformed_lines_skipped() {
		let (rows, _, _) = decode_all(&[
			b"{\"_msg\":\"ok\"}\n",
			b"not json at all\n",
			b"[1,2,3]\n",
			b"{\"_msg\":\"also ok\"}\n",
		]);
		assert_eq!(2, rows.len());
	}

	#[test]
	fn test_jsonl_oversize_line_skipped() {
		let mut decoder = JsonlDecoder::default();
		// an unterminated line past the cap is dropped in one piece
		let big = vec![b'x'; MAX_LINE_BYTES + 1];
		decoder.push_chunk(&big);
		decoder.push_chunk(b"tail-of-big-line\n{\"_msg\":\"ok\"}\n");
		let (rows, _, _) = decoder.finish();
		assert_eq!(1, rows.len());
		assert_eq!(
			Some(&LogValue::String("ok".to_string())),
			rows[0].get("_msg")
		);
	}

	#[test]
	fn test_rfc3339_lookalikes_are_labelled_datetime() {
		// inference is shape-based on purpose, even for non-timestamp fields
		let (_, columns, _) = decode_all(&[
			br#"{"release_date":"1999-12-31T23:59:59Z"}"#,
			b"\n",
		]);
		assert_eq!("DateTime64", columns[0].column_type);
	}

	#[test]
	fn test_hits_transform_keeps_top_groups() {
		let resp = HitsResponse {
			hits: (0..12)
				.map(|i| HitsSeries {
					fields: BTreeMap::from([(
						"service".to_string(),
						format!("svc-{i:02}"),
					)]),
					timestamps: vec!["2024-01-15T10:00:00Z".to_string()],
					values: vec![100 - i as u64],
				})
				.collect(),
		};
		let buckets = hits_to_buckets(resp, true);
		assert_eq!(10, buckets.len());
		assert!(buckets
			.iter()
			.all(|b| b.group_value.as_deref() != Some("svc-10")));
		assert!(buckets
			.iter()
			.all(|b| b.group_value.as_deref() != Some("svc-11")));
	}

	#[test]
	fn test_hits_transform_sorted_chronologically() {
		let resp = HitsResponse {
			hits: vec![HitsSeries {
				fields: BTreeMap::new(),
				timestamps: vec![
					"2024-01-15T11:00:00Z".to_string(),
					"2024-01-15T10:00:00Z".to_string(),
				],
				values: vec![5, 3],
			}],
		};
		let buckets = hits_to_buckets(resp, false);
		assert_eq!(2, buckets.len());
		assert!(buckets[0].bucket_start < buckets[1].bucket_start);
		assert_eq!(3, buckets[0].log_count);
	}

	#[test]
	fn test_stats_headers() {
		let mut headers = reqwest::header::HeaderMap::new();
		headers.insert("X-Stats-Rows-Read", "1024".parse().unwrap());
		headers.insert("X-Stats-Bytes-Read", "4096".parse().unwrap());
		headers.insert("X-Stats-Execution-Time-Seconds", "0.25".parse().unwrap());
		let stats = read_stats_headers(&headers);
		assert_eq!(Some(1024), stats.rows_read);
		assert_eq!(Some(4096), stats.bytes_read);
		assert_eq!(Some(250.0), stats.execution_time_ms);
	}
}
