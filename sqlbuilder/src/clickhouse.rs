use crate::LowerError;
use common::{format_sql_datetime, TimeRange};
use itertools::Itertools;
use logchefql::{Condition, Expr, Op, Value};

/// Escape a string for embedding in a single-quoted SQL literal. Backslash
/// first so the two passes cannot interfere; the result round-trips.
pub fn escape_string(s: &str) -> String {
	s.replace('\\', "\\\\").replace('\'', "''")
}

pub fn quote_ident(s: &str) -> String {
	format!("`{}`", s.replace('`', "\\`"))
}

fn literal(field: &str, op: Op, v: &Value) -> Result<String, LowerError> {
	match v {
		Value::Int(i) => Ok(i.to_string()),
		Value::Float(f) => Ok(f.to_string()),
		Value::String(s) => Ok(format!("'{}'", escape_string(s))),
		Value::List(_) | Value::None => Err(LowerError::UnsupportedValue {
			field: field.to_string(),
			op: op.as_str(),
		}),
	}
}

fn string_arg(field: &str, op: Op, v: &Value) -> Result<String, LowerError> {
	match v {
		Value::List(_) | Value::None => Err(LowerError::UnsupportedValue {
			field: field.to_string(),
			op: op.as_str(),
		}),
		other => Ok(escape_string(&other.as_text())),
	}
}

/// Lower an AST to a WHERE fragment. Boolean combinators parenthesise
/// themselves; a bare condition stays unwrapped.
pub fn lower_expr(expr: &Expr) -> Result<String, LowerError> {
	match expr {
		Expr::Condition(c) => lower_condition(c),
		Expr::And(children) => {
			let parts: Vec<String> =
				children.iter().map(lower_expr).try_collect()?;
			Ok(format!("({})", parts.join(" AND ")))
		}
		Expr::Or(children) => {
			let parts: Vec<String> =
				children.iter().map(lower_expr).try_collect()?;
			Ok(format!("({})", parts.join(" OR ")))
		}
		Expr::Not(child) => {
			let inner = lower_expr(child)?;
			if inner.starts_with('(') {
				Ok(format!("NOT {}", inner))
			} else {
				Ok(format!("NOT ({})", inner))
			}
		}
	}
}

fn lower_condition(c: &Condition) -> Result<String, LowerError> {
	let col = quote_ident(&c.field);
	let out = match c.op {
		Op::Eq => format!("{} = {}", col, literal(&c.field, c.op, &c.value)?),
		Op::Ne => format!("{} != {}", col, literal(&c.field, c.op, &c.value)?),
		Op::Gt => format!("{} > {}", col, literal(&c.field, c.op, &c.value)?),
		Op::Gte => format!("{} >= {}", col, literal(&c.field, c.op, &c.value)?),
		Op::Lt => format!("{} < {}", col, literal(&c.field, c.op, &c.value)?),
		Op::Lte => format!("{} <= {}", col, literal(&c.field, c.op, &c.value)?),
		Op::RegexMatch => {
			format!("match({}, '{}')", col, string_arg(&c.field, c.op, &c.value)?)
		}
		Op::RegexNotMatch => format!(
			"NOT match({}, '{}')",
			col,
			string_arg(&c.field, c.op, &c.value)?
		),
		Op::Contains => format!(
			"position({}, '{}') > 0",
			col,
			string_arg(&c.field, c.op, &c.value)?
		),
		Op::NotContains => format!(
			"position({}, '{}') = 0",
			col,
			string_arg(&c.field, c.op, &c.value)?
		),
		Op::StartsWith => format!(
			"startsWith({}, '{}')",
			col,
			string_arg(&c.field, c.op, &c.value)?
		),
		Op::NotStartsWith => format!(
			"NOT startsWith({}, '{}')",
			col,
			string_arg(&c.field, c.op, &c.value)?
		),
		Op::EndsWith => format!(
			"endsWith({}, '{}')",
			col,
			string_arg(&c.field, c.op, &c.value)?
		),
		Op::NotEndsWith => format!(
			"NOT endsWith({}, '{}')",
			col,
			string_arg(&c.field, c.op, &c.value)?
		),
		Op::In | Op::NotIn => {
			let Value::List(items) = &c.value else {
				return Err(LowerError::UnsupportedValue {
					field: c.field.clone(),
					op: c.op.as_str(),
				});
			};
			if items.is_empty() {
				return Err(LowerError::EmptyList {
					field: c.field.clone(),
					op: c.op.as_str(),
				});
			}
			let list: Vec<String> = items
				.iter()
				.map(|v| literal(&c.field, c.op, v))
				.try_collect()?;
			let kw = if c.op == Op::In { "IN" } else { "NOT IN" };
			format!("{} {} ({})", col, kw, list.join(", "))
		}
		Op::IsNull => format!("{} IS NULL", col),
		Op::IsNotNull => format!("{} IS NOT NULL", col),
	};
	Ok(out)
}

/// `SELECT *` elides materialised columns, so a query used as a histogram
/// subquery gets the timestamp column appended explicitly. Idempotent:
/// only the bare `SELECT * FROM` prefix is rewritten.
pub fn ensure_ts_in_select(sql: &str, ts_field: &str) -> String {
	let trimmed = sql.trim_start();
	let lowered = trimmed.to_ascii_lowercase();
	if lowered.starts_with("select * from ") {
		let rest = &trimmed["SELECT * FROM ".len()..];
		format!("SELECT *, {} FROM {}", quote_ident(ts_field), rest)
	} else {
		trimmed.to_string()
	}
}

/// Wrap a base query in the bucketing aggregate. The grouped form first
/// narrows to the 10 largest groups over the whole window.
pub fn histogram_over(
	base_sql: &str,
	ts_field: &str,
	timezone: &str,
	granularity_secs: u64,
	group_by: Option<&str>,
) -> String {
	let bucket = format!(
		"toStartOfInterval({}, INTERVAL {} second, '{}')",
		quote_ident(ts_field),
		granularity_secs,
		timezone
	);
	match group_by {
		None => format!(
			"SELECT {} AS bucket, count(*) AS log_count FROM ({}) GROUP BY bucket ORDER BY bucket ASC",
			bucket, base_sql
		),
		Some(group) => {
			let g = quote_ident(group);
			format!(
				"WITH base AS ({base}), top_groups AS (SELECT {g} AS group_value FROM base GROUP BY group_value ORDER BY count(*) DESC LIMIT 10) \
				 SELECT {bucket} AS bucket, toString({g}) AS group_value, count(*) AS log_count \
				 FROM base WHERE {g} GLOBAL IN (SELECT group_value FROM top_groups) \
				 GROUP BY bucket, group_value ORDER BY bucket ASC, group_value ASC",
				base = base_sql,
				g = g,
				bucket = bucket,
			)
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortOrder {
	Asc,
	Desc,
}

/// Full-query composition over one table: time bounds, optional filter
/// fragment, projection, ordering, limit.
#[derive(Debug, Clone)]
pub struct SelectPlan {
	pub database: String,
	pub table: String,
	pub ts_field: String,
	pub range: TimeRange,
	pub fragment: Option<String>,
	pub projection: Option<Vec<String>>,
	pub order: SortOrder,
	pub limit: u32,
}

impl SelectPlan {
	pub fn as_sql(&self) -> String {
		let mut sql = format!(
			"SELECT {} FROM {}.{} WHERE {}",
			self.projection_part(false),
			self.database,
			self.table,
			self.where_part()
		);
		sql.push_str(&format!(
			" ORDER BY {} {}",
			quote_ident(&self.ts_field),
			match self.order {
				SortOrder::Asc => "ASC",
				SortOrder::Desc => "DESC",
			}
		));
		sql.push_str(&format!(" LIMIT {}", self.limit));
		sql
	}

	/// The same query with the timestamp column guaranteed present in the
	/// projection, for use as a histogram subquery. Materialised columns
	/// are not part of `*`, so `SELECT *` becomes `SELECT *, ts`.
	pub fn as_subquery_sql(&self) -> String {
		let mut sql = format!(
			"SELECT {} FROM {}.{} WHERE {}",
			self.projection_part(true),
			self.database,
			self.table,
			self.where_part()
		);
		sql.push_str(&format!(" LIMIT {}", self.limit));
		sql
	}

	pub fn histogram_sql(&self, granularity_secs: u64, group_by: Option<&str>) -> String {
		histogram_over(
			&self.as_subquery_sql(),
			&self.ts_field,
			&self.range.timezone,
			granularity_secs,
			group_by,
		)
	}

	fn where_part(&self) -> String {
		let mut out = format!(
			"{} BETWEEN toDateTime('{}','{}') AND toDateTime('{}','{}')",
			quote_ident(&self.ts_field),
			format_sql_datetime(self.range.start),
			self.range.timezone,
			format_sql_datetime(self.range.end),
			self.range.timezone,
		);
		if let Some(frag) = self.fragment.as_deref() {
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

	pub fn select_clause(&self) -> String {
		self.projection_part(false)
	}

	fn projection_part(&self, force_timestamp: bool) -> String {
		match &self.projection {
			None => {
				if force_timestamp {
					format!("*, {}", quote_ident(&self.ts_field))
				} else {
					"*".to_string()
				}
			}
			Some(fields) => {
				let mut cols: Vec<String> = vec![];
				if !fields.iter().any(|f| f == &self.ts_field) {
					cols.push(quote_ident(&self.ts_field));
				}
				cols.extend(fields.iter().map(|f| quote_ident(f)));
				cols.join(", ")
			}
		}
	}
}
