use crate::LowerError;
use common::{format_rfc3339_millis, TimeRange};
use itertools::Itertools;
use logchefql::{Condition, Expr, Op, Value};

/// Quote a value for a LogsQL filter. Simple words stay bare, anything
/// else is double-quoted with `\"`/`\\` escapes.
fn quote_value(v: &Value) -> String {
	match v {
		Value::Int(i) => i.to_string(),
		Value::Float(f) => f.to_string(),
		Value::String(s) => quote_text(s),
		Value::List(items) => items.iter().map(quote_value).join(", "),
		Value::None => String::new(),
	}
}

fn quote_text(s: &str) -> String {
	let bare = !s.is_empty()
		&& s.chars()
			.all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':'));
	if bare {
		s.to_string()
	} else {
		format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
	}
}

fn quoted_text_arg(field: &str, op: Op, v: &Value) -> Result<String, LowerError> {
	match v {
		Value::List(_) | Value::None => Err(LowerError::UnsupportedValue {
			field: field.to_string(),
			op: op.as_str(),
		}),
		other => Ok(format!(
			"\"{}\"",
			other.as_text().replace('\\', "\\\\").replace('"', "\\\"")
		)),
	}
}

fn regex_escape(s: &str) -> String {
	let mut out = String::with_capacity(s.len());
	for c in s.chars() {
		if matches!(
			c,
			'.' | '+' | '*' | '?' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '^' | '$' | '\\'
		) {
			out.push('\\');
		}
		out.push(c);
	}
	out
}

/// Lower an AST to a LogsQL expression. AND is whitespace, OR groups in
/// parentheses, NOT is the `-` prefix.
pub fn lower_expr(expr: &Expr) -> Result<String, LowerError> {
	match expr {
		Expr::Condition(c) => lower_condition(c),
		Expr::And(children) => {
			let parts: Vec<String> = children.iter().map(lower_expr).try_collect()?;
			Ok(parts.join(" "))
		}
		Expr::Or(children) => {
			let parts: Vec<String> = children.iter().map(lower_expr).try_collect()?;
			Ok(format!("({})", parts.join(" or ")))
		}
		Expr::Not(child) => {
			let inner = lower_expr(child)?;
			// AND joins with whitespace, so it needs explicit grouping here
			if matches!(child.as_ref(), Expr::And(_)) {
				Ok(format!("-({})", inner))
			} else {
				Ok(format!("-{}", inner))
			}
		}
	}
}

fn lower_condition(c: &Condition) -> Result<String, LowerError> {
	let out = match c.op {
		Op::Eq => format!("{}:={}", c.field, quote_value(&c.value)),
		Op::Ne => format!("{}:!={}", c.field, quote_value(&c.value)),
		Op::RegexMatch => {
			format!("{}:~{}", c.field, quoted_text_arg(&c.field, c.op, &c.value)?)
		}
		Op::RegexNotMatch => {
			format!("{}:!~{}", c.field, quoted_text_arg(&c.field, c.op, &c.value)?)
		}
		Op::Gt => format!("{}:>{}", c.field, quote_value(&c.value)),
		Op::Gte => format!("{}:>={}", c.field, quote_value(&c.value)),
		Op::Lt => format!("{}:<{}", c.field, quote_value(&c.value)),
		Op::Lte => format!("{}:<={}", c.field, quote_value(&c.value)),
		Op::Contains => {
			format!("{}:{}", c.field, quoted_text_arg(&c.field, c.op, &c.value)?)
		}
		Op::NotContains => {
			format!("-{}:{}", c.field, quoted_text_arg(&c.field, c.op, &c.value)?)
		}
		Op::StartsWith => {
			format!("{}:{}*", c.field, quoted_text_arg(&c.field, c.op, &c.value)?)
		}
		Op::NotStartsWith => {
			format!("-{}:{}*", c.field, quoted_text_arg(&c.field, c.op, &c.value)?)
		}
		Op::EndsWith => format!(
			"{}:~\"{}$\"",
			c.field,
			regex_escape(&c.value.as_text()).replace('"', "\\\"")
		),
		Op::NotEndsWith => format!(
			"-{}:~\"{}$\"",
			c.field,
			regex_escape(&c.value.as_text()).replace('"', "\\\"")
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
			let list = items.iter().map(quote_value).join(", ");
			if c.op == Op::In {
				format!("{}:in({})", c.field, list)
			} else {
				format!("-{}:in({})", c.field, list)
			}
		}
		Op::IsNull => format!("{}:\"\"", c.field),
		Op::IsNotNull => format!("{}:*", c.field),
	};
	Ok(out)
}

pub fn time_filter(range: &TimeRange) -> String {
	format!(
		"_time:[{}, {}]",
		format_rfc3339_millis(range.start),
		format_rfc3339_millis(range.end)
	)
}

/// Prefix the time filter onto a lowered (or raw, passthrough) expression.
pub fn full_query(expr: Option<&str>, range: &TimeRange) -> String {
	match expr {
		Some(e) if !e.trim().is_empty() => format!("{} {}", time_filter(range), e),
		_ => format!("{} *", time_filter(range)),
	}
}
