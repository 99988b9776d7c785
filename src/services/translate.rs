use crate::backends::BackendKind;
use common::TimeRange;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use sqlbuilder::clickhouse::{lower_expr as lower_sql, SelectPlan, SortOrder};
use sqlbuilder::logsql::{full_query as logsql_full_query, lower_expr as lower_logsql};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslatedCondition {
	pub field: String,
	pub operator: String,
	pub value: String,
	pub is_regex: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslationError {
	pub code: String,
	pub message: String,
	pub line: Option<u32>,
	pub column: Option<u32>,
}

/// Translator output. Invalid input is data, not an error: `valid` is
/// false and `error` says why, so callers decide whether to surface it.
// round-trips through the rmp-serde cache encoding, so every field is
// always present on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Translation {
	/// WHERE fragment (SQL) or bare expression (LogsQL).
	pub sql: String,
	pub full_sql: Option<String>,
	pub select_clause: Option<String>,
	pub valid: bool,
	pub error: Option<TranslationError>,
	pub conditions: Vec<TranslatedCondition>,
	pub fields_used: Vec<String>,
}

impl Translation {
	fn invalid(error: TranslationError) -> Self {
		Self {
			sql: String::new(),
			full_sql: None,
			select_clause: None,
			valid: false,
			error: Some(error),
			conditions: vec![],
			fields_used: vec![],
		}
	}
}

#[derive(Debug, Clone)]
pub struct TranslateTarget {
	pub kind: BackendKind,
	pub database: String,
	pub table: String,
	pub ts_field: String,
}

/// Lower a DSL query for one backend. When `range` is given the full
/// executable query is composed as well.
pub fn translate(
	query: &str,
	target: &TranslateTarget,
	range: Option<&TimeRange>,
	limit: u32,
) -> Translation {
	let ast = match logchefql::parse(query) {
		Ok(ast) => ast,
		Err(e) => {
			return Translation::invalid(TranslationError {
				code: e.code.to_string(),
				message: e.message.clone(),
				line: Some(e.line),
				column: Some(e.column),
			});
		}
	};

	let fragment = match &ast.expr {
		None => Ok(String::new()),
		Some(expr) => match target.kind {
			BackendKind::Sql => lower_sql(expr),
			BackendKind::Logsql => lower_logsql(expr),
		},
	};
	let fragment = match fragment {
		Ok(f) => f,
		Err(e) => {
			return Translation::invalid(TranslationError {
				code: "lowering_error".to_string(),
				message: e.to_string(),
				line: None,
				column: None,
			});
		}
	};

	let conditions = ast
		.conditions()
		.into_iter()
		.map(|c| TranslatedCondition {
			field: c.field.clone(),
			operator: c.op.as_str().to_string(),
			value: c.value.as_text(),
			is_regex: c.op.is_regex(),
		})
		.collect();

	let (full_sql, select_clause) = match (target.kind, range) {
		(BackendKind::Sql, Some(range)) => {
			let plan = SelectPlan {
				database: target.database.clone(),
				table: target.table.clone(),
				ts_field: target.ts_field.clone(),
				range: range.clone(),
				fragment: (!fragment.is_empty()).then(|| fragment.clone()),
				projection: ast.projection.clone(),
				order: SortOrder::Desc,
				limit,
			};
			(Some(plan.as_sql()), Some(plan.select_clause()))
		}
		(BackendKind::Logsql, Some(range)) => {
			let composed = logsql_full_query(
				(!fragment.is_empty()).then_some(fragment.as_str()),
				range,
			);
			(Some(format!("{composed} | limit {limit}")), None)
		}
		(_, None) => (None, None),
	};

	Translation {
		sql: fragment,
		full_sql,
		select_clause,
		valid: true,
		error: None,
		conditions,
		fields_used: ast.fields_used(),
	}
}

/// 30 s translation cache, keyed by (team, source, query). Only used when
/// the request carries no time parameters, so entries are range-free.
pub fn cached_translate<F>(
	cache: &Cache<String, Arc<Vec<u8>>>,
	team: i64,
	source: i64,
	query: &str,
	build: F,
) -> Translation
where
	F: FnOnce() -> Translation,
{
	let key = format!("translate:{team}:{source}:{query}");
	if let Some(buf) = cache.get(&key) {
		if let Ok(hit) = rmp_serde::from_slice::<Translation>(&buf) {
			debug!(team, source, "translate cache hit");
			return hit;
		}
	}
	let fresh = build();
	if fresh.valid {
		if let Ok(buf) = rmp_serde::to_vec(&fresh) {
			cache.insert(key, Arc::new(buf));
		}
	}
	fresh
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	fn target(kind: BackendKind) -> TranslateTarget {
		TranslateTarget {
			kind,
			database: "default".to_string(),
			table: "logs".to_string(),
			ts_field: "timestamp".to_string(),
		}
	}

	fn range() -> TimeRange {
		TimeRange {
			start: chrono::NaiveDateTime::parse_from_str(
				"2024-01-15 10:00:00",
				"%Y-%m-%d %H:%M:%S",
			)
			.unwrap(),
			end: chrono::NaiveDateTime::parse_from_str(
				"2024-01-15 11:00:00",
				"%Y-%m-%d %H:%M:%S",
			)
			.unwrap(),
			timezone: "UTC".to_string(),
		}
	}

	#[test]
	fn test_translate_to_full_sql() {
		let t = translate(
			r#"level="err'or" AND status>=500"#,
			&target(BackendKind::Sql),
			Some(&range()),
			100,
		);
		assert!(t.valid);
		assert_eq!(
			"(`level` = 'err''or' AND `status` >= 500)",
			t.sql
		);
		assert_eq!(
			Some(
				"SELECT * FROM default.logs WHERE `timestamp` BETWEEN \
				 toDateTime('2024-01-15 10:00:00','UTC') AND toDateTime('2024-01-15 11:00:00','UTC') \
				 AND (`level` = 'err''or' AND `status` >= 500) \
				 ORDER BY `timestamp` DESC LIMIT 100"
					.to_string()
			),
			t.full_sql
		);
		assert_eq!(vec!["level", "status"], t.fields_used);
	}

	#[test]
	fn test_translate_to_logsql() {
		let t = translate(
			r#"level="error" or app="api""#,
			&target(BackendKind::Logsql),
			Some(&range()),
			100,
		);
		assert!(t.valid);
		assert_eq!("(level:=error or app:=api)", t.sql);
		assert_eq!(
			Some(
				"_time:[2024-01-15T10:00:00.000Z, 2024-01-15T11:00:00.000Z] (level:=error or app:=api) | limit 100"
					.to_string()
			),
			t.full_sql
		);
	}

	#[test]
	fn test_translate_is_deterministic() {
		let dsl = r#"a=1 and (b~"x" or not c=2) | ts, msg"#;
		let first = translate(dsl, &target(BackendKind::Sql), Some(&range()), 50);
		for _ in 0..5 {
			let again = translate(dsl, &target(BackendKind::Sql), Some(&range()), 50);
			assert_eq!(first, again);
		}
	}

	#[test]
	fn test_invalid_query_is_data_not_error() {
		let t = translate("level=", &target(BackendKind::Sql), None, 100);
		assert!(!t.valid);
		let err = t.error.unwrap();
		assert_eq!(Some(1), err.line);
		assert!(err.column.is_some());
		assert!(t.full_sql.is_none());
	}

	#[test]
	fn test_empty_query_means_no_filter() {
		let t = translate("", &target(BackendKind::Sql), Some(&range()), 10);
		assert!(t.valid);
		assert_eq!("", t.sql);
		let full = t.full_sql.unwrap();
		assert!(!full.contains(" AND ("), "full: {full}");
		assert!(full.contains("BETWEEN"), "full: {full}");
	}

	#[test]
	fn test_conditions_reported() {
		let t = translate(
			r#"msg~"timeout" AND NOT service="cache""#,
			&target(BackendKind::Sql),
			None,
			100,
		);
		assert_eq!(
			vec![
				TranslatedCondition {
					field: "msg".to_string(),
					operator: "~".to_string(),
					value: "timeout".to_string(),
					is_regex: true,
				},
				TranslatedCondition {
					field: "service".to_string(),
					operator: "=".to_string(),
					value: "cache".to_string(),
					is_regex: false,
				},
			],
			t.conditions
		);
	}

	#[test]
	fn test_cached_translate_round_trip() {
		let cache: Cache<String, Arc<Vec<u8>>> = Cache::builder()
			.time_to_live(std::time::Duration::from_secs(30))
			.build();
		let mut calls = 0;
		let t1 = cached_translate(&cache, 1, 2, r#"a=1"#, || {
			calls += 1;
			translate("a=1", &target(BackendKind::Sql), None, 100)
		});
		let mut calls2 = 0;
		let t2 = cached_translate(&cache, 1, 2, r#"a=1"#, || {
			calls2 += 1;
			translate("a=1", &target(BackendKind::Sql), None, 100)
		});
		assert_eq!(1, calls);
		assert_eq!(0, calls2);
		assert_eq!(t1, t2);
	}
}
