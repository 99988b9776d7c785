pub(crate) use crate::backends::{BackendKind, SourceId};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub mod sqlite;

pub use sqlite::SqliteStore;

pub type TeamId = i64;
pub type AlertId = i64;

#[derive(Debug, Error)]
pub enum MetaError {
	#[error("not found: {0}")]
	NotFound(String),
	#[error("metastore error: {0}")]
	Internal(String),
}

impl From<rusqlite::Error> for MetaError {
	fn from(e: rusqlite::Error) -> Self {
		match e {
			rusqlite::Error::QueryReturnedNoRows => {
				MetaError::NotFound("no matching row".to_string())
			}
			other => MetaError::Internal(other.to_string()),
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlConnection {
	pub url: String,
	pub database: String,
	pub table: String,
	pub username: String,
	pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogsqlConnection {
	pub url: String,
	pub account_id: Option<String>,
	pub project_id: Option<String>,
}

/// Exactly one variant is populated per source; the variant IS the
/// backend kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionInfo {
	Sql(SqlConnection),
	Logsql(LogsqlConnection),
}

pub const DEFAULT_TS_FIELD: &str = "timestamp";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
	pub id: SourceId,
	pub name: String,
	pub connection: ConnectionInfo,
	pub ts_field: String,
	/// Display-time severity colouring only; never used in planning.
	pub severity_field: Option<String>,
}

impl Source {
	pub fn kind(&self) -> BackendKind {
		match self.connection {
			ConnectionInfo::Sql(_) => BackendKind::Sql,
			ConnectionInfo::Logsql(_) => BackendKind::Logsql,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertQueryKind {
	Dsl,
	Native,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
	Idle,
	Firing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdOp {
	#[serde(rename = ">")]
	Gt,
	#[serde(rename = ">=")]
	Gte,
	#[serde(rename = "<")]
	Lt,
	#[serde(rename = "<=")]
	Lte,
	#[serde(rename = "=")]
	Eq,
	#[serde(rename = "!=")]
	Ne,
}

const EQ_EPSILON: f64 = 1e-9;

impl ThresholdOp {
	pub fn compare(&self, value: f64, threshold: f64) -> bool {
		match self {
			ThresholdOp::Gt => value > threshold,
			ThresholdOp::Gte => value >= threshold,
			ThresholdOp::Lt => value < threshold,
			ThresholdOp::Lte => value <= threshold,
			ThresholdOp::Eq => (value - threshold).abs() < EQ_EPSILON,
			ThresholdOp::Ne => (value - threshold).abs() >= EQ_EPSILON,
		}
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			ThresholdOp::Gt => ">",
			ThresholdOp::Gte => ">=",
			ThresholdOp::Lt => "<",
			ThresholdOp::Lte => "<=",
			ThresholdOp::Eq => "=",
			ThresholdOp::Ne => "!=",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			">" => Some(ThresholdOp::Gt),
			">=" => Some(ThresholdOp::Gte),
			"<" => Some(ThresholdOp::Lt),
			"<=" => Some(ThresholdOp::Lte),
			"=" => Some(ThresholdOp::Eq),
			"!=" => Some(ThresholdOp::Ne),
			_ => None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
	pub id: AlertId,
	pub team_id: TeamId,
	pub source_id: SourceId,
	pub name: String,
	pub description: Option<String>,
	pub query: String,
	pub query_kind: AlertQueryKind,
	pub threshold_op: ThresholdOp,
	pub threshold_value: f64,
	pub frequency_secs: u64,
	pub lookback_secs: Option<u64>,
	pub severity: String,
	pub recipients: Vec<String>,
	pub state: AlertState,
	pub active: bool,
	pub last_evaluated_at: Option<NaiveDateTime>,
	pub last_triggered_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
	Triggered,
	Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertHistoryEntry {
	pub id: i64,
	pub alert_id: AlertId,
	pub status: HistoryStatus,
	pub triggered_at: NaiveDateTime,
	pub resolved_at: Option<NaiveDateTime>,
	pub value_text: String,
	pub recipients: Vec<String>,
	pub message: String,
}

#[derive(Debug, Clone)]
pub struct NewAlertHistory {
	pub alert_id: AlertId,
	pub triggered_at: NaiveDateTime,
	pub value_text: String,
	pub recipients: Vec<String>,
	pub message: String,
}

pub type MetaResult<T> = std::result::Result<T, MetaError>;

/// Read/update contract the core consumes. The schema behind it belongs
/// to the admin surface, not to this service.
#[async_trait]
pub trait MetaStore: Send + Sync {
	async fn get_source(&self, id: SourceId) -> MetaResult<Source>;
	async fn list_sources(&self) -> MetaResult<Vec<Source>>;
	async fn team_has_source(&self, team: TeamId, source: SourceId) -> MetaResult<bool>;
	async fn get_team_name(&self, team: TeamId) -> MetaResult<Option<String>>;

	async fn list_due_alerts(&self, now: NaiveDateTime) -> MetaResult<Vec<Alert>>;
	async fn latest_unresolved_history(
		&self,
		alert_id: AlertId,
	) -> MetaResult<Option<AlertHistoryEntry>>;
	async fn insert_history(&self, entry: NewAlertHistory) -> MetaResult<i64>;
	async fn resolve_history(
		&self,
		entry_id: i64,
		message: &str,
		resolved_at: NaiveDateTime,
	) -> MetaResult<()>;
	async fn prune_history(&self, alert_id: AlertId, limit: u32) -> MetaResult<u64>;
	async fn list_history(&self, alert_id: AlertId) -> MetaResult<Vec<AlertHistoryEntry>>;

	async fn mark_alert_triggered(&self, id: AlertId, at: NaiveDateTime) -> MetaResult<()>;
	async fn mark_alert_evaluated(
		&self,
		id: AlertId,
		at: NaiveDateTime,
		next_due: NaiveDateTime,
	) -> MetaResult<()>;
	async fn set_alert_state(&self, id: AlertId, state: AlertState) -> MetaResult<()>;

	async fn get_setting(&self, key: &str, default: &str) -> MetaResult<String>;
	async fn get_setting_i64(&self, key: &str, default: i64) -> MetaResult<i64>;
	async fn get_setting_bool(&self, key: &str, default: bool) -> MetaResult<bool>;
	async fn get_setting_duration(&self, key: &str, default: Duration) -> MetaResult<Duration>;
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	#[test]
	fn test_threshold_compare() {
		let test_cases = vec![
			(ThresholdOp::Gt, 15.0, 10.0, true),
			(ThresholdOp::Gt, 10.0, 10.0, false),
			(ThresholdOp::Gte, 10.0, 10.0, true),
			(ThresholdOp::Lt, 5.0, 10.0, true),
			(ThresholdOp::Lte, 10.0, 10.0, true),
			(ThresholdOp::Eq, 10.0, 10.0, true),
			(ThresholdOp::Eq, 10.0 + 1e-12, 10.0, true),
			(ThresholdOp::Eq, 10.1, 10.0, false),
			(ThresholdOp::Ne, 10.1, 10.0, true),
			(ThresholdOp::Ne, 10.0, 10.0, false),
		];
		for (op, value, threshold, expect) in test_cases {
			assert_eq!(
				expect,
				op.compare(value, threshold),
				"{} {} {}",
				value,
				op.as_str(),
				threshold
			);
		}
	}

	#[test]
	fn test_threshold_op_round_trip() {
		for op in [
			ThresholdOp::Gt,
			ThresholdOp::Gte,
			ThresholdOp::Lt,
			ThresholdOp::Lte,
			ThresholdOp::Eq,
			ThresholdOp::Ne,
		] {
			assert_eq!(Some(op), ThresholdOp::parse(op.as_str()));
		}
		assert_eq!(None, ThresholdOp::parse("~"));
	}

	#[test]
	fn test_source_kind_follows_connection() {
		let sql = Source {
			id: 1,
			name: "app-logs".to_string(),
			connection: ConnectionInfo::Sql(SqlConnection {
				url: "http://localhost:8123".to_string(),
				database: "default".to_string(),
				table: "logs".to_string(),
				username: "default".to_string(),
				password: String::new(),
			}),
			ts_field: DEFAULT_TS_FIELD.to_string(),
			severity_field: None,
		};
		assert_eq!(BackendKind::Sql, sql.kind());

		let vl = Source {
			connection: ConnectionInfo::Logsql(LogsqlConnection {
				url: "http://localhost:9428".to_string(),
				account_id: None,
				project_id: None,
			}),
			..sql
		};
		assert_eq!(BackendKind::Logsql, vl.kind());
	}
}
