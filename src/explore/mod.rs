use crate::backends::{
	FieldValuesParams, HistogramParams, LogContextParams, LogRow, QueryStats, SourceHealth,
	TableInfo,
};
use crate::errors::AppError;
use crate::meta::{ConnectionInfo, Source};
use crate::services::translate::{cached_translate, translate, TranslateTarget, Translation};
use crate::services::{fields, histogram};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::response::Json;
use common::{format_rfc3339_millis, resolve_timezone, TimeRange};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_LIMIT: u32 = 100;
const DEFAULT_FIELD_VALUES_LIMIT: u32 = 10;
const DEFAULT_RANGE: &str = "15m";

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
	pub status: &'static str,
	pub data: T,
}

fn success<T>(data: T) -> Json<ApiResponse<T>> {
	Json(ApiResponse {
		status: "success",
		data,
	})
}

pub(crate) type JsonResult<T> = Result<Json<ApiResponse<T>>, AppError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryKind {
	#[default]
	Dsl,
	Native,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueryRequest {
	#[serde(default)]
	pub query: Option<String>,
	#[serde(default)]
	pub query_kind: QueryKind,
	#[serde(default)]
	pub since: Option<String>,
	#[serde(default)]
	pub start_time: Option<String>,
	#[serde(default)]
	pub end_time: Option<String>,
	#[serde(default)]
	pub timezone: Option<String>,
	#[serde(default)]
	pub limit: Option<u32>,
	/// Seconds; capped by the server-wide request deadline.
	#[serde(default)]
	pub query_timeout: Option<u64>,
}

impl QueryRequest {
	fn has_time_params(&self) -> bool {
		self.since.is_some() || self.start_time.is_some() || self.end_time.is_some()
	}

	fn resolve_range(&self) -> Result<TimeRange, AppError> {
		let tz = resolve_timezone(self.timezone.as_deref());
		let range = match (&self.since, &self.start_time) {
			(Some(rel), _) => TimeRange::from_relative(rel, &tz)?,
			(None, Some(start)) => {
				TimeRange::from_absolute(start, self.end_time.as_deref(), &tz)?
			}
			(None, None) => TimeRange::from_relative(DEFAULT_RANGE, &tz)?,
		};
		Ok(range)
	}
}

fn translate_target(source: &Source) -> TranslateTarget {
	let (database, table) = match &source.connection {
		ConnectionInfo::Sql(conn) => (conn.database.clone(), conn.table.clone()),
		ConnectionInfo::Logsql(_) => (String::new(), String::new()),
	};
	TranslateTarget {
		kind: source.kind(),
		database,
		table,
		ts_field: source.ts_field.clone(),
	}
}

async fn authorized_source(
	state: &AppState,
	team_id: i64,
	source_id: i64,
) -> Result<Source, AppError> {
	if !state.meta.team_has_source(team_id, source_id).await? {
		return Err(AppError::NotFound(format!(
			"source {source_id} not found for team {team_id}"
		)));
	}
	Ok(state.meta.get_source(source_id).await?)
}

fn effective_limit(state: &AppState, requested: Option<u32>) -> u32 {
	requested.unwrap_or(DEFAULT_LIMIT).min(state.config.query.max_limit)
}

/// The HTTP request deadline is the hard ceiling for every query.
fn effective_timeout(state: &AppState, requested: Option<u64>) -> Duration {
	let cap = state.config.server.http_server_timeout;
	requested
		.map(Duration::from_secs)
		.unwrap_or(state.config.query.default_timeout)
		.min(cap)
}

/// Produce the native query for the request: translate DSL, pass native
/// text straight through.
fn native_query(
	req: &QueryRequest,
	source: &Source,
	range: &TimeRange,
	limit: u32,
) -> Result<String, AppError> {
	match req.query_kind {
		QueryKind::Native => req
			.query
			.clone()
			.filter(|q| !q.trim().is_empty())
			.ok_or_else(|| AppError::InvalidRequest("native query text is required".to_string())),
		QueryKind::Dsl => {
			let translation = translate(
				req.query.as_deref().unwrap_or_default(),
				&translate_target(source),
				Some(range),
				limit,
			);
			into_full_query(translation)
		}
	}
}

fn into_full_query(translation: Translation) -> Result<String, AppError> {
	if !translation.valid {
		let detail = translation
			.error
			.map(|e| match (e.line, e.column) {
				(Some(line), Some(column)) => {
					format!("{} (line {line}, column {column})", e.message)
				}
				_ => e.message,
			})
			.unwrap_or_else(|| "invalid query".to_string());
		return Err(AppError::InvalidRequest(detail));
	}
	translation
		.full_sql
		.ok_or_else(|| AppError::InvalidRequest("query could not be composed".to_string()))
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
	pub logs: Vec<LogRow>,
	pub columns: Vec<crate::backends::ColumnInfo>,
	pub stats: QueryStats,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub generated_sql: Option<String>,
}

pub async fn query_logs(
	State(state): State<AppState>,
	Path((team_id, source_id)): Path<(i64, i64)>,
	Json(req): Json<QueryRequest>,
) -> JsonResult<QueryResponse> {
	let source = authorized_source(&state, team_id, source_id).await?;
	let client = state.registry.get_client(source_id)?;
	let range = req.resolve_range()?;
	let limit = effective_limit(&state, req.limit);
	let timeout = effective_timeout(&state, req.query_timeout);
	let native = native_query(&req, &source, &range, limit)?;

	let outcome = client.query(&native, Some(timeout)).await;
	state
		.metrics
		.record_query(&source.kind().to_string(), outcome.is_ok());
	let output = outcome?;
	Ok(success(QueryResponse {
		logs: output.rows,
		columns: output.columns,
		stats: output.stats,
		generated_sql: Some(native),
	}))
}

pub async fn translate_query(
	State(state): State<AppState>,
	Path((team_id, source_id)): Path<(i64, i64)>,
	Json(req): Json<QueryRequest>,
) -> JsonResult<Translation> {
	let source = authorized_source(&state, team_id, source_id).await?;
	let target = translate_target(&source);
	let query = req.query.clone().unwrap_or_default();
	let limit = effective_limit(&state, req.limit);

	let translation = if req.has_time_params() {
		let range = req.resolve_range()?;
		translate(&query, &target, Some(&range), limit)
	} else {
		cached_translate(&state.cache, team_id, source_id, &query, || {
			translate(&query, &target, None, limit)
		})
	};
	Ok(success(translation))
}

#[derive(Debug, Deserialize)]
pub struct HistogramRequest {
	#[serde(flatten)]
	pub base: QueryRequest,
	/// Explicit bucket width from the ladder, e.g. `30s`, `15m`.
	#[serde(default)]
	pub window: Option<String>,
	#[serde(default)]
	pub group_by: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HistogramBucketDto {
	pub bucket: String,
	pub log_count: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub group_value: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HistogramResponse {
	pub granularity: String,
	pub data: Vec<HistogramBucketDto>,
}

pub async fn query_histogram(
	State(state): State<AppState>,
	Path((team_id, source_id)): Path<(i64, i64)>,
	Json(req): Json<HistogramRequest>,
) -> JsonResult<HistogramResponse> {
	let source = authorized_source(&state, team_id, source_id).await?;
	let client = state.registry.get_client(source_id)?;
	let range = req.base.resolve_range()?;
	let limit = effective_limit(&state, req.base.limit);
	let window_secs = match &req.window {
		Some(expr) => Some(histogram::parse_window(expr)?),
		None => None,
	};
	// the SQL path buckets over the composed query; the LogsQL hits
	// endpoint takes a bare filter and applies start/end itself
	let native = match (req.base.query_kind, source.kind()) {
		(QueryKind::Native, _) => native_query(&req.base, &source, &range, limit)?,
		(QueryKind::Dsl, crate::backends::BackendKind::Sql) => {
			native_query(&req.base, &source, &range, limit)?
		}
		(QueryKind::Dsl, crate::backends::BackendKind::Logsql) => {
			let translation = translate(
				req.base.query.as_deref().unwrap_or_default(),
				&translate_target(&source),
				None,
				limit,
			);
			if !translation.valid {
				return Err(AppError::InvalidRequest(
					translation
						.error
						.map(|e| e.message)
						.unwrap_or_else(|| "invalid query".to_string()),
				));
			}
			if translation.sql.is_empty() {
				"*".to_string()
			} else {
				translation.sql
			}
		}
	};

	let params = HistogramParams {
		query: native,
		range,
		window_secs,
		group_by: req.group_by.clone(),
	};
	let result = client.histogram(&params).await?;
	Ok(success(HistogramResponse {
		granularity: histogram::humanize(result.granularity_secs),
		data: result
			.buckets
			.into_iter()
			.map(|b| HistogramBucketDto {
				bucket: format_rfc3339_millis(b.bucket_start),
				log_count: b.log_count,
				group_value: b.group_value,
			})
			.collect(),
	}))
}

#[derive(Debug, Deserialize)]
pub struct ContextRequest {
	/// Target instant, epoch milliseconds.
	pub timestamp: i64,
	pub before_limit: u32,
	pub after_limit: u32,
	#[serde(default)]
	pub before_offset: u32,
	#[serde(default)]
	pub after_offset: u32,
	#[serde(default)]
	pub exclude_boundary: bool,
	#[serde(default)]
	pub query_timeout: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ContextResponse {
	pub target_timestamp: String,
	pub before_logs: Vec<LogRow>,
	pub target_logs: Vec<LogRow>,
	pub after_logs: Vec<LogRow>,
	pub stats: QueryStats,
}

pub async fn query_context(
	State(state): State<AppState>,
	Path((team_id, source_id)): Path<(i64, i64)>,
	Json(req): Json<ContextRequest>,
) -> JsonResult<ContextResponse> {
	authorized_source(&state, team_id, source_id).await?;
	let client = state.registry.get_client(source_id)?;
	let timeout = effective_timeout(&state, req.query_timeout);
	let params = LogContextParams {
		target_time_ms: req.timestamp,
		before_limit: req.before_limit,
		after_limit: req.after_limit,
		before_offset: req.before_offset,
		after_offset: req.after_offset,
		exclude_boundary: req.exclude_boundary,
	};
	let result = client.surrounding_logs(&params, Some(timeout)).await?;
	let target = chrono::DateTime::from_timestamp_millis(req.timestamp)
		.map(|t| format_rfc3339_millis(t.naive_utc()))
		.unwrap_or_default();
	Ok(success(ContextResponse {
		target_timestamp: target,
		before_logs: result.before,
		target_logs: result.target,
		after_logs: result.after,
		stats: result.stats,
	}))
}

#[derive(Debug, Deserialize)]
pub struct FieldValuesRequest {
	#[serde(default)]
	pub field_name: Option<String>,
	#[serde(default)]
	pub field_type: Option<String>,
	#[serde(default)]
	pub since: Option<String>,
	#[serde(default)]
	pub start_time: Option<String>,
	#[serde(default)]
	pub end_time: Option<String>,
	#[serde(default)]
	pub timezone: Option<String>,
	#[serde(default)]
	pub limit: Option<u32>,
	#[serde(default)]
	pub logchefql: Option<String>,
}

pub async fn field_values(
	State(state): State<AppState>,
	Path((team_id, source_id)): Path<(i64, i64)>,
	Json(req): Json<FieldValuesRequest>,
) -> JsonResult<serde_json::Value> {
	let source = authorized_source(&state, team_id, source_id).await?;
	let client = state.registry.get_client(source_id)?;
	let tz = resolve_timezone(req.timezone.as_deref());
	let range = match (&req.since, &req.start_time) {
		(Some(rel), _) => TimeRange::from_relative(rel, &tz)?,
		(None, Some(start)) => TimeRange::from_absolute(start, req.end_time.as_deref(), &tz)?,
		(None, None) => TimeRange::from_relative(DEFAULT_RANGE, &tz)?,
	};
	let limit = req.limit.unwrap_or(DEFAULT_FIELD_VALUES_LIMIT);

	let filter = match req.logchefql.as_deref().filter(|q| !q.trim().is_empty()) {
		None => None,
		Some(dsl) => {
			let translation = translate(dsl, &translate_target(&source), None, limit);
			if !translation.valid {
				return Err(AppError::InvalidRequest(
					translation
						.error
						.map(|e| e.message)
						.unwrap_or_else(|| "invalid filter".to_string()),
				));
			}
			Some(translation.sql).filter(|s| !s.is_empty())
		}
	};

	match &req.field_name {
		Some(field) => {
			let params = FieldValuesParams {
				field: field.clone(),
				field_type: req.field_type.clone(),
				range,
				limit,
				filter,
			};
			let result = client.field_distinct_values(&params).await?;
			Ok(success(serde_json::to_value(result).map_err(anyhow::Error::from)?))
		}
		None => {
			let (database, table) = match &source.connection {
				ConnectionInfo::Sql(conn) => (conn.database.clone(), conn.table.clone()),
				ConnectionInfo::Logsql(_) => (String::new(), String::new()),
			};
			let info = client.table_info(&database, &table).await?;
			let results =
				fields::all_filterable_values(client, &info, &range, limit, filter).await;
			Ok(success(serde_json::to_value(results).map_err(anyhow::Error::from)?))
		}
	}
}

pub async fn source_schema(
	State(state): State<AppState>,
	Path((team_id, source_id)): Path<(i64, i64)>,
) -> JsonResult<TableInfo> {
	let source = authorized_source(&state, team_id, source_id).await?;
	let client = state.registry.get_client(source_id)?;
	let (database, table) = match &source.connection {
		ConnectionInfo::Sql(conn) => (conn.database.clone(), conn.table.clone()),
		ConnectionInfo::Logsql(_) => (String::new(), String::new()),
	};
	Ok(success(client.table_info(&database, &table).await?))
}

#[derive(Debug, Deserialize, Default)]
pub struct HealthQuery {
	/// Skip the live probe and return the cached record.
	#[serde(default)]
	pub cached: bool,
}

pub async fn source_health(
	State(state): State<AppState>,
	Path((team_id, source_id)): Path<(i64, i64)>,
	Query(params): Query<HealthQuery>,
) -> JsonResult<SourceHealth> {
	authorized_source(&state, team_id, source_id).await?;
	let health = if params.cached {
		state
			.registry
			.get_cached_health(source_id)?
			.ok_or_else(|| AppError::NotFound(format!("no health record for source {source_id}")))?
	} else {
		state.registry.get_health(source_id).await?
	};
	Ok(success(health))
}
