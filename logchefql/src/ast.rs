use itertools::Itertools;
use ordered_float::OrderedFloat;
use std::fmt::Display;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
	String(String),
	Int(i64),
	Float(OrderedFloat<f64>),
	List(Vec<Value>),
	/// Valueless operators (`is_null`, `is_not_null`).
	None,
}

impl Value {
	pub fn is_numeric(&self) -> bool {
		matches!(self, Value::Int(_) | Value::Float(_))
	}

	/// The raw text of the value, without quoting.
	pub fn as_text(&self) -> String {
		match self {
			Value::String(s) => s.clone(),
			Value::Int(i) => i.to_string(),
			Value::Float(f) => f.to_string(),
			Value::List(items) => items.iter().map(|v| v.as_text()).join(", "),
			Value::None => String::new(),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
	Eq,
	Ne,
	RegexMatch,
	RegexNotMatch,
	Gt,
	Gte,
	Lt,
	Lte,
	Contains,
	NotContains,
	StartsWith,
	NotStartsWith,
	EndsWith,
	NotEndsWith,
	In,
	NotIn,
	IsNull,
	IsNotNull,
}

impl Op {
	pub fn is_regex(&self) -> bool {
		matches!(self, Op::RegexMatch | Op::RegexNotMatch)
	}

	pub fn takes_value(&self) -> bool {
		!matches!(self, Op::IsNull | Op::IsNotNull)
	}

	pub fn as_str(&self) -> &'static str {
		match self {
			Op::Eq => "=",
			Op::Ne => "!=",
			Op::RegexMatch => "~",
			Op::RegexNotMatch => "!~",
			Op::Gt => ">",
			Op::Gte => ">=",
			Op::Lt => "<",
			Op::Lte => "<=",
			Op::Contains => "contains",
			Op::NotContains => "!contains",
			Op::StartsWith => "startswith",
			Op::NotStartsWith => "!startswith",
			Op::EndsWith => "endswith",
			Op::NotEndsWith => "!endswith",
			Op::In => "in",
			Op::NotIn => "!in",
			Op::IsNull => "is_null",
			Op::IsNotNull => "is_not_null",
		}
	}
}

impl Display for Op {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
	pub field: String,
	pub op: Op,
	pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
	Condition(Condition),
	And(Vec<Expr>),
	Or(Vec<Expr>),
	Not(Box<Expr>),
}

impl Expr {
	fn collect_conditions<'a>(&'a self, out: &mut Vec<&'a Condition>) {
		match self {
			Expr::Condition(c) => out.push(c),
			Expr::And(children) | Expr::Or(children) => {
				for child in children {
					child.collect_conditions(out);
				}
			}
			Expr::Not(child) => child.collect_conditions(out),
		}
	}
}

/// A parsed query: an optional filter expression and an optional pipe
/// projection (`expr | field1, field2`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Query {
	pub expr: Option<Expr>,
	pub projection: Option<Vec<String>>,
}

impl Query {
	pub fn is_empty(&self) -> bool {
		self.expr.is_none()
	}

	/// Every condition in the tree, left to right.
	pub fn conditions(&self) -> Vec<&Condition> {
		let mut out = vec![];
		if let Some(expr) = &self.expr {
			expr.collect_conditions(&mut out);
		}
		out
	}

	/// Field names appearing as the LHS of any condition, first occurrence
	/// order, deduplicated.
	pub fn fields_used(&self) -> Vec<String> {
		self.conditions()
			.into_iter()
			.map(|c| c.field.clone())
			.unique()
			.collect()
	}
}
