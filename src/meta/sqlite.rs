use super::*;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use rusqlite::{params, Connection, Row};
use std::sync::Mutex;
use std::time::Duration;

const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

fn fmt_time(t: NaiveDateTime) -> String {
	t.format(TIME_FORMAT).to_string()
}

fn parse_time(s: &str) -> MetaResult<NaiveDateTime> {
	NaiveDateTime::parse_from_str(s, TIME_FORMAT)
		.map_err(|e| MetaError::Internal(format!("bad stored timestamp {s}: {e}")))
}

fn parse_opt_time(s: Option<String>) -> MetaResult<Option<NaiveDateTime>> {
	s.map(|v| parse_time(&v)).transpose()
}

fn decode_recipients(raw: &str) -> Vec<String> {
	serde_json::from_str(raw).unwrap_or_default()
}

pub struct SqliteStore {
	conn: Mutex<Connection>,
}

impl SqliteStore {
	pub fn open(path: &str) -> MetaResult<Self> {
		let conn =
			Connection::open(path).map_err(|e| MetaError::Internal(e.to_string()))?;
		conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
		let store = Self {
			conn: Mutex::new(conn),
		};
		store.run_migrations()?;
		Ok(store)
	}

	pub fn open_in_memory() -> MetaResult<Self> {
		let conn =
			Connection::open_in_memory().map_err(|e| MetaError::Internal(e.to_string()))?;
		conn.execute_batch("PRAGMA foreign_keys=ON;")?;
		let store = Self {
			conn: Mutex::new(conn),
		};
		store.run_migrations()?;
		Ok(store)
	}

	fn run_migrations(&self) -> MetaResult<()> {
		let conn = self.conn.lock().unwrap();
		conn.execute_batch(
			"
			CREATE TABLE IF NOT EXISTS teams (
				id   INTEGER PRIMARY KEY AUTOINCREMENT,
				name TEXT NOT NULL UNIQUE
			);

			CREATE TABLE IF NOT EXISTS sources (
				id             INTEGER PRIMARY KEY AUTOINCREMENT,
				name           TEXT NOT NULL,
				kind           TEXT NOT NULL DEFAULT 'sql' CHECK(kind IN ('sql','logsql')),
				url            TEXT NOT NULL DEFAULT '',
				database_name  TEXT NOT NULL DEFAULT '',
				table_name     TEXT NOT NULL DEFAULT '',
				username       TEXT NOT NULL DEFAULT '',
				password       TEXT NOT NULL DEFAULT '',
				account_id     TEXT,
				project_id     TEXT,
				ts_field       TEXT NOT NULL DEFAULT 'timestamp',
				severity_field TEXT
			);

			CREATE TABLE IF NOT EXISTS team_sources (
				team_id   INTEGER NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
				source_id INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
				PRIMARY KEY (team_id, source_id)
			);

			CREATE TABLE IF NOT EXISTS alerts (
				id                INTEGER PRIMARY KEY AUTOINCREMENT,
				team_id           INTEGER NOT NULL REFERENCES teams(id) ON DELETE CASCADE,
				source_id         INTEGER NOT NULL REFERENCES sources(id) ON DELETE CASCADE,
				name              TEXT NOT NULL,
				description       TEXT,
				query             TEXT NOT NULL,
				query_kind        TEXT NOT NULL DEFAULT 'dsl' CHECK(query_kind IN ('dsl','native')),
				threshold_op      TEXT NOT NULL CHECK(threshold_op IN ('>','>=','<','<=','=','!=')),
				threshold_value   REAL NOT NULL,
				frequency_secs    INTEGER NOT NULL DEFAULT 60,
				lookback_secs     INTEGER,
				severity          TEXT NOT NULL DEFAULT 'warning',
				recipients        TEXT NOT NULL DEFAULT '[]',
				state             TEXT NOT NULL DEFAULT 'idle' CHECK(state IN ('idle','firing')),
				active            INTEGER NOT NULL DEFAULT 1,
				last_evaluated_at TEXT,
				last_triggered_at TEXT,
				next_due_at       TEXT
			);
			CREATE INDEX IF NOT EXISTS idx_alerts_due ON alerts(active, next_due_at);

			CREATE TABLE IF NOT EXISTS alert_history (
				id           INTEGER PRIMARY KEY AUTOINCREMENT,
				alert_id     INTEGER NOT NULL REFERENCES alerts(id) ON DELETE CASCADE,
				status       TEXT NOT NULL CHECK(status IN ('triggered','resolved')),
				triggered_at TEXT NOT NULL,
				resolved_at  TEXT,
				value_text   TEXT NOT NULL,
				recipients   TEXT NOT NULL DEFAULT '[]',
				message      TEXT NOT NULL
			);
			CREATE INDEX IF NOT EXISTS idx_alert_history_alert
				ON alert_history(alert_id, triggered_at DESC);

			CREATE TABLE IF NOT EXISTS settings (
				key   TEXT PRIMARY KEY,
				value TEXT NOT NULL
			);
			",
		)?;
		Ok(())
	}

	// admin-side writes, used by provisioning and tests

	pub fn create_team(&self, name: &str) -> MetaResult<TeamId> {
		let conn = self.conn.lock().unwrap();
		conn.execute("INSERT INTO teams (name) VALUES (?1)", params![name])?;
		Ok(conn.last_insert_rowid())
	}

	pub fn create_source(&self, source: &Source) -> MetaResult<SourceId> {
		let conn = self.conn.lock().unwrap();
		match &source.connection {
			ConnectionInfo::Sql(c) => {
				conn.execute(
					"INSERT INTO sources (name, kind, url, database_name, table_name, username, password, ts_field, severity_field)
					 VALUES (?1, 'sql', ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
					params![
						source.name,
						c.url,
						c.database,
						c.table,
						c.username,
						c.password,
						source.ts_field,
						source.severity_field,
					],
				)?;
			}
			ConnectionInfo::Logsql(c) => {
				conn.execute(
					"INSERT INTO sources (name, kind, url, account_id, project_id, ts_field, severity_field)
					 VALUES (?1, 'logsql', ?2, ?3, ?4, ?5, ?6)",
					params![
						source.name,
						c.url,
						c.account_id,
						c.project_id,
						source.ts_field,
						source.severity_field,
					],
				)?;
			}
		}
		Ok(conn.last_insert_rowid())
	}

	pub fn link_team_source(&self, team: TeamId, source: SourceId) -> MetaResult<()> {
		let conn = self.conn.lock().unwrap();
		conn.execute(
			"INSERT OR IGNORE INTO team_sources (team_id, source_id) VALUES (?1, ?2)",
			params![team, source],
		)?;
		Ok(())
	}

	pub fn create_alert(&self, alert: &Alert) -> MetaResult<AlertId> {
		let conn = self.conn.lock().unwrap();
		conn.execute(
			"INSERT INTO alerts (team_id, source_id, name, description, query, query_kind,
				threshold_op, threshold_value, frequency_secs, lookback_secs, severity,
				recipients, state, active)
			 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
			params![
				alert.team_id,
				alert.source_id,
				alert.name,
				alert.description,
				alert.query,
				match alert.query_kind {
					AlertQueryKind::Dsl => "dsl",
					AlertQueryKind::Native => "native",
				},
				alert.threshold_op.as_str(),
				alert.threshold_value,
				alert.frequency_secs,
				alert.lookback_secs,
				alert.severity,
				serde_json::to_string(&alert.recipients)
					.map_err(|e| MetaError::Internal(e.to_string()))?,
				match alert.state {
					AlertState::Idle => "idle",
					AlertState::Firing => "firing",
				},
				alert.active,
			],
		)?;
		Ok(conn.last_insert_rowid())
	}

	pub fn set_setting(&self, key: &str, value: &str) -> MetaResult<()> {
		let conn = self.conn.lock().unwrap();
		conn.execute(
			"INSERT INTO settings (key, value) VALUES (?1, ?2)
			 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
			params![key, value],
		)?;
		Ok(())
	}
}

fn source_from_row(row: &Row<'_>) -> rusqlite::Result<(Source, String)> {
	let kind: String = row.get("kind")?;
	let url: String = row.get("url")?;
	let connection = if kind == "logsql" {
		ConnectionInfo::Logsql(LogsqlConnection {
			url,
			account_id: row.get("account_id")?,
			project_id: row.get("project_id")?,
		})
	} else {
		ConnectionInfo::Sql(SqlConnection {
			url,
			database: row.get("database_name")?,
			table: row.get("table_name")?,
			username: row.get("username")?,
			password: row.get("password")?,
		})
	};
	Ok((
		Source {
			id: row.get("id")?,
			name: row.get("name")?,
			connection,
			ts_field: row.get("ts_field")?,
			severity_field: row.get("severity_field")?,
		},
		kind,
	))
}

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<Alert> {
	let query_kind: String = row.get("query_kind")?;
	let op: String = row.get("threshold_op")?;
	let state: String = row.get("state")?;
	let recipients: String = row.get("recipients")?;
	let last_evaluated_at: Option<String> = row.get("last_evaluated_at")?;
	let last_triggered_at: Option<String> = row.get("last_triggered_at")?;
	Ok(Alert {
		id: row.get("id")?,
		team_id: row.get("team_id")?,
		source_id: row.get("source_id")?,
		name: row.get("name")?,
		description: row.get("description")?,
		query: row.get("query")?,
		query_kind: if query_kind == "native" {
			AlertQueryKind::Native
		} else {
			AlertQueryKind::Dsl
		},
		threshold_op: ThresholdOp::parse(&op).unwrap_or(ThresholdOp::Gt),
		threshold_value: row.get("threshold_value")?,
		frequency_secs: row.get::<_, i64>("frequency_secs")? as u64,
		lookback_secs: row.get::<_, Option<i64>>("lookback_secs")?.map(|v| v as u64),
		severity: row.get("severity")?,
		recipients: decode_recipients(&recipients),
		state: if state == "firing" {
			AlertState::Firing
		} else {
			AlertState::Idle
		},
		active: row.get("active")?,
		last_evaluated_at: last_evaluated_at
			.and_then(|s| NaiveDateTime::parse_from_str(&s, TIME_FORMAT).ok()),
		last_triggered_at: last_triggered_at
			.and_then(|s| NaiveDateTime::parse_from_str(&s, TIME_FORMAT).ok()),
	})
}

fn history_from_row(row: &Row<'_>) -> rusqlite::Result<AlertHistoryEntry> {
	let status: String = row.get("status")?;
	let triggered_at: String = row.get("triggered_at")?;
	let resolved_at: Option<String> = row.get("resolved_at")?;
	let recipients: String = row.get("recipients")?;
	Ok(AlertHistoryEntry {
		id: row.get("id")?,
		alert_id: row.get("alert_id")?,
		status: if status == "resolved" {
			HistoryStatus::Resolved
		} else {
			HistoryStatus::Triggered
		},
		triggered_at: NaiveDateTime::parse_from_str(&triggered_at, TIME_FORMAT)
			.unwrap_or_default(),
		resolved_at: resolved_at
			.and_then(|s| NaiveDateTime::parse_from_str(&s, TIME_FORMAT).ok()),
		value_text: row.get("value_text")?,
		recipients: decode_recipients(&recipients),
		message: row.get("message")?,
	})
}

const SOURCE_COLS: &str =
	"id, name, kind, url, database_name, table_name, username, password, account_id, project_id, ts_field, severity_field";

const ALERT_COLS: &str =
	"id, team_id, source_id, name, description, query, query_kind, threshold_op, threshold_value, \
	 frequency_secs, lookback_secs, severity, recipients, state, active, last_evaluated_at, last_triggered_at";

const HISTORY_COLS: &str =
	"id, alert_id, status, triggered_at, resolved_at, value_text, recipients, message";

#[async_trait]
impl MetaStore for SqliteStore {
	async fn get_source(&self, id: SourceId) -> MetaResult<Source> {
		let conn = self.conn.lock().unwrap();
		let mut stmt =
			conn.prepare(&format!("SELECT {SOURCE_COLS} FROM sources WHERE id = ?1"))?;
		let mut rows = stmt.query_map(params![id], source_from_row)?;
		match rows.next() {
			Some(row) => Ok(row?.0),
			None => Err(MetaError::NotFound(format!("source {id}"))),
		}
	}

	async fn list_sources(&self) -> MetaResult<Vec<Source>> {
		let conn = self.conn.lock().unwrap();
		let mut stmt =
			conn.prepare(&format!("SELECT {SOURCE_COLS} FROM sources ORDER BY id"))?;
		let rows = stmt.query_map([], source_from_row)?;
		let mut out = vec![];
		for row in rows {
			out.push(row?.0);
		}
		Ok(out)
	}

	async fn team_has_source(&self, team: TeamId, source: SourceId) -> MetaResult<bool> {
		let conn = self.conn.lock().unwrap();
		let count: i64 = conn.query_row(
			"SELECT count(*) FROM team_sources WHERE team_id = ?1 AND source_id = ?2",
			params![team, source],
			|row| row.get(0),
		)?;
		Ok(count > 0)
	}

	async fn get_team_name(&self, team: TeamId) -> MetaResult<Option<String>> {
		let conn = self.conn.lock().unwrap();
		let mut stmt = conn.prepare("SELECT name FROM teams WHERE id = ?1")?;
		let mut rows = stmt.query_map(params![team], |row| row.get::<_, String>(0))?;
		match rows.next() {
			Some(row) => Ok(Some(row?)),
			None => Ok(None),
		}
	}

	async fn list_due_alerts(&self, now: NaiveDateTime) -> MetaResult<Vec<Alert>> {
		let conn = self.conn.lock().unwrap();
		let mut stmt = conn.prepare(&format!(
			"SELECT {ALERT_COLS} FROM alerts
			 WHERE active = 1 AND (next_due_at IS NULL OR next_due_at <= ?1)
			 ORDER BY id"
		))?;
		let rows = stmt.query_map(params![fmt_time(now)], alert_from_row)?;
		let mut out = vec![];
		for row in rows {
			out.push(row?);
		}
		Ok(out)
	}

	async fn latest_unresolved_history(
		&self,
		alert_id: AlertId,
	) -> MetaResult<Option<AlertHistoryEntry>> {
		let conn = self.conn.lock().unwrap();
		let mut stmt = conn.prepare(&format!(
			"SELECT {HISTORY_COLS} FROM alert_history
			 WHERE alert_id = ?1 AND status = 'triggered' AND resolved_at IS NULL
			 ORDER BY triggered_at DESC, id DESC LIMIT 1"
		))?;
		let mut rows = stmt.query_map(params![alert_id], history_from_row)?;
		match rows.next() {
			Some(row) => Ok(Some(row?)),
			None => Ok(None),
		}
	}

	async fn insert_history(&self, entry: NewAlertHistory) -> MetaResult<i64> {
		let conn = self.conn.lock().unwrap();
		conn.execute(
			"INSERT INTO alert_history (alert_id, status, triggered_at, value_text, recipients, message)
			 VALUES (?1, 'triggered', ?2, ?3, ?4, ?5)",
			params![
				entry.alert_id,
				fmt_time(entry.triggered_at),
				entry.value_text,
				serde_json::to_string(&entry.recipients)
					.map_err(|e| MetaError::Internal(e.to_string()))?,
				entry.message,
			],
		)?;
		Ok(conn.last_insert_rowid())
	}

	async fn resolve_history(
		&self,
		entry_id: i64,
		message: &str,
		resolved_at: NaiveDateTime,
	) -> MetaResult<()> {
		let conn = self.conn.lock().unwrap();
		let changed = conn.execute(
			"UPDATE alert_history SET status = 'resolved', resolved_at = ?2, message = ?3
			 WHERE id = ?1",
			params![entry_id, fmt_time(resolved_at), message],
		)?;
		if changed == 0 {
			return Err(MetaError::NotFound(format!("alert history entry {entry_id}")));
		}
		Ok(())
	}

	async fn prune_history(&self, alert_id: AlertId, limit: u32) -> MetaResult<u64> {
		let conn = self.conn.lock().unwrap();
		let removed = conn.execute(
			"DELETE FROM alert_history
			 WHERE alert_id = ?1 AND id NOT IN (
				SELECT id FROM alert_history WHERE alert_id = ?1
				ORDER BY triggered_at DESC, id DESC LIMIT ?2
			 )",
			params![alert_id, limit],
		)?;
		Ok(removed as u64)
	}

	async fn list_history(&self, alert_id: AlertId) -> MetaResult<Vec<AlertHistoryEntry>> {
		let conn = self.conn.lock().unwrap();
		let mut stmt = conn.prepare(&format!(
			"SELECT {HISTORY_COLS} FROM alert_history WHERE alert_id = ?1
			 ORDER BY triggered_at DESC, id DESC"
		))?;
		let rows = stmt.query_map(params![alert_id], history_from_row)?;
		let mut out = vec![];
		for row in rows {
			out.push(row?);
		}
		Ok(out)
	}

	async fn mark_alert_triggered(&self, id: AlertId, at: NaiveDateTime) -> MetaResult<()> {
		let conn = self.conn.lock().unwrap();
		let changed = conn.execute(
			"UPDATE alerts SET state = 'firing', last_triggered_at = ?2 WHERE id = ?1",
			params![id, fmt_time(at)],
		)?;
		if changed == 0 {
			return Err(MetaError::NotFound(format!("alert {id}")));
		}
		Ok(())
	}

	async fn mark_alert_evaluated(
		&self,
		id: AlertId,
		at: NaiveDateTime,
		next_due: NaiveDateTime,
	) -> MetaResult<()> {
		let conn = self.conn.lock().unwrap();
		let changed = conn.execute(
			"UPDATE alerts SET last_evaluated_at = ?2, next_due_at = ?3 WHERE id = ?1",
			params![id, fmt_time(at), fmt_time(next_due)],
		)?;
		if changed == 0 {
			return Err(MetaError::NotFound(format!("alert {id}")));
		}
		Ok(())
	}

	async fn set_alert_state(&self, id: AlertId, state: AlertState) -> MetaResult<()> {
		let conn = self.conn.lock().unwrap();
		let changed = conn.execute(
			"UPDATE alerts SET state = ?2 WHERE id = ?1",
			params![
				id,
				match state {
					AlertState::Idle => "idle",
					AlertState::Firing => "firing",
				}
			],
		)?;
		if changed == 0 {
			return Err(MetaError::NotFound(format!("alert {id}")));
		}
		Ok(())
	}

	async fn get_setting(&self, key: &str, default: &str) -> MetaResult<String> {
		let conn = self.conn.lock().unwrap();
		let mut stmt = conn.prepare("SELECT value FROM settings WHERE key = ?1")?;
		let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
		match rows.next() {
			Some(row) => Ok(row?),
			None => Ok(default.to_string()),
		}
	}

	async fn get_setting_i64(&self, key: &str, default: i64) -> MetaResult<i64> {
		let raw = self.get_setting(key, &default.to_string()).await?;
		raw.trim()
			.parse()
			.map_err(|e| MetaError::Internal(format!("setting {key} is not an integer: {e}")))
	}

	async fn get_setting_bool(&self, key: &str, default: bool) -> MetaResult<bool> {
		let raw = self.get_setting(key, if default { "true" } else { "false" }).await?;
		match raw.trim() {
			"true" | "1" | "yes" => Ok(true),
			"false" | "0" | "no" => Ok(false),
			other => Err(MetaError::Internal(format!(
				"setting {key} is not a boolean: {other}"
			))),
		}
	}

	async fn get_setting_duration(&self, key: &str, default: Duration) -> MetaResult<Duration> {
		let fallback = humantime::format_duration(default).to_string();
		let raw = self.get_setting(key, &fallback).await?;
		humantime::parse_duration(raw.trim())
			.map_err(|e| MetaError::Internal(format!("setting {key} is not a duration: {e}")))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	fn sample_source() -> Source {
		Source {
			id: 0,
			name: "app-logs".to_string(),
			connection: ConnectionInfo::Sql(SqlConnection {
				url: "http://localhost:8123".to_string(),
				database: "default".to_string(),
				table: "logs".to_string(),
				username: "default".to_string(),
				password: String::new(),
			}),
			ts_field: DEFAULT_TS_FIELD.to_string(),
			severity_field: Some("level".to_string()),
		}
	}

	fn sample_alert(team: TeamId, source: SourceId) -> Alert {
		Alert {
			id: 0,
			team_id: team,
			source_id: source,
			name: "high error rate".to_string(),
			description: None,
			query: r#"level="error""#.to_string(),
			query_kind: AlertQueryKind::Dsl,
			threshold_op: ThresholdOp::Gt,
			threshold_value: 10.0,
			frequency_secs: 60,
			lookback_secs: Some(300),
			severity: "critical".to_string(),
			recipients: vec!["oncall@example.com".to_string()],
			state: AlertState::Idle,
			active: true,
			last_evaluated_at: None,
			last_triggered_at: None,
		}
	}

	fn now() -> NaiveDateTime {
		chrono::Utc::now().naive_utc()
	}

	#[tokio::test]
	async fn test_source_round_trip() {
		let store = SqliteStore::open_in_memory().unwrap();
		let id = store.create_source(&sample_source()).unwrap();
		let got = store.get_source(id).await.unwrap();
		assert_eq!("app-logs", got.name);
		assert_eq!(BackendKind::Sql, got.kind());
		assert_eq!("timestamp", got.ts_field);
		assert_eq!(Some("level".to_string()), got.severity_field);

		let err = store.get_source(id + 1).await.unwrap_err();
		assert!(matches!(err, MetaError::NotFound(_)));
	}

	#[tokio::test]
	async fn test_team_source_membership() {
		let store = SqliteStore::open_in_memory().unwrap();
		let team = store.create_team("platform").unwrap();
		let source = store.create_source(&sample_source()).unwrap();
		assert!(!store.team_has_source(team, source).await.unwrap());
		store.link_team_source(team, source).unwrap();
		assert!(store.team_has_source(team, source).await.unwrap());
		assert_eq!(
			Some("platform".to_string()),
			store.get_team_name(team).await.unwrap()
		);
	}

	#[tokio::test]
	async fn test_due_alerts_and_scheduling() {
		let store = SqliteStore::open_in_memory().unwrap();
		let team = store.create_team("platform").unwrap();
		let source = store.create_source(&sample_source()).unwrap();
		let alert_id = store.create_alert(&sample_alert(team, source)).unwrap();

		// never evaluated -> due
		let due = store.list_due_alerts(now()).await.unwrap();
		assert_eq!(1, due.len());
		assert_eq!(alert_id, due[0].id);

		// scheduled into the future -> not due
		let t = now();
		store
			.mark_alert_evaluated(alert_id, t, t + chrono::Duration::seconds(60))
			.await
			.unwrap();
		assert!(store.list_due_alerts(t).await.unwrap().is_empty());
		assert_eq!(
			1,
			store
				.list_due_alerts(t + chrono::Duration::seconds(61))
				.await
				.unwrap()
				.len()
		);
	}

	#[tokio::test]
	async fn test_history_lifecycle_and_pruning() {
		let store = SqliteStore::open_in_memory().unwrap();
		let team = store.create_team("platform").unwrap();
		let source = store.create_source(&sample_source()).unwrap();
		let alert_id = store.create_alert(&sample_alert(team, source)).unwrap();

		let t0 = chrono::NaiveDateTime::parse_from_str(
			"2024-01-15T10:00:00Z",
			super::TIME_FORMAT,
		)
		.unwrap();
		for i in 0..5 {
			store
				.insert_history(NewAlertHistory {
					alert_id,
					triggered_at: t0 + chrono::Duration::minutes(i),
					value_text: format!("{}.0000", 10 + i),
					recipients: vec!["oncall@example.com".to_string()],
					message: format!("fired at minute {i}"),
				})
				.await
				.unwrap();
		}

		// prune to the 3 newest
		let removed = store.prune_history(alert_id, 3).await.unwrap();
		assert_eq!(2, removed);
		let remaining = store.list_history(alert_id).await.unwrap();
		assert_eq!(3, remaining.len());
		let oldest = remaining.iter().map(|h| h.triggered_at).min().unwrap();
		assert_eq!(t0 + chrono::Duration::minutes(2), oldest);

		// resolve the newest open entry
		let open = store
			.latest_unresolved_history(alert_id)
			.await
			.unwrap()
			.unwrap();
		let resolved_at = open.triggered_at + chrono::Duration::minutes(1);
		store
			.resolve_history(open.id, "alert high error rate resolved with value 5.0000", resolved_at)
			.await
			.unwrap();
		assert!(store
			.latest_unresolved_history(alert_id)
			.await
			.unwrap()
			.map(|e| e.id != open.id)
			.unwrap_or(true));
		let all = store.list_history(alert_id).await.unwrap();
		let entry = all.iter().find(|e| e.id == open.id).unwrap();
		assert_eq!(HistoryStatus::Resolved, entry.status);
		assert!(entry.resolved_at.unwrap() >= entry.triggered_at);
	}

	#[tokio::test]
	async fn test_settings_typed_getters() {
		let store = SqliteStore::open_in_memory().unwrap();
		store.set_setting("alerts.history_limit", "25").unwrap();
		store.set_setting("alerts.enabled", "true").unwrap();
		store.set_setting("alerts.request_timeout", "5s").unwrap();

		assert_eq!(25, store.get_setting_i64("alerts.history_limit", 100).await.unwrap());
		assert!(store.get_setting_bool("alerts.enabled", false).await.unwrap());
		assert_eq!(
			Duration::from_secs(5),
			store
				.get_setting_duration("alerts.request_timeout", Duration::from_secs(9))
				.await
				.unwrap()
		);
		// defaults when absent
		assert_eq!(
			"fallback",
			store.get_setting("missing.key", "fallback").await.unwrap()
		);
		assert_eq!(7, store.get_setting_i64("missing.int", 7).await.unwrap());
	}
}
