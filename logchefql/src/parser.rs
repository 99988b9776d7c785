use crate::ast::{Condition, Expr, Op, Query, Value};
use nom::{
	branch::alt,
	bytes::complete::{is_not, tag},
	character::complete::{alpha1, alphanumeric1, char, digit1, multispace0, multispace1},
	combinator::{map, opt, recognize, value as tok, verify},
	error::{Error as NomError, ErrorKind},
	multi::{many0, many0_count, separated_list1},
	sequence::{delimited, pair, preceded, terminated, tuple},
	IResult,
};
use ordered_float::OrderedFloat;
use std::fmt::Display;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
	Syntax,
	TrailingInput,
}

impl Display for ErrorCode {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			ErrorCode::Syntax => f.write_str("syntax_error"),
			ErrorCode::TrailingInput => f.write_str("trailing_input"),
		}
	}
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message} (line {line}, column {column})")]
pub struct ParseError {
	pub code: ErrorCode,
	pub message: String,
	pub line: u32,
	pub column: u32,
}

/// Parse a LogChefQL query. An empty (or all-whitespace) input is valid
/// and means "no filter".
pub fn parse(input: &str) -> Result<Query, ParseError> {
	if input.trim().is_empty() {
		return Ok(Query::default());
	}
	match query(input) {
		Ok((rest, q)) if rest.trim().is_empty() => Ok(q),
		Ok((rest, _)) => Err(at_position(
			input,
			rest,
			ErrorCode::TrailingInput,
			"unexpected trailing input",
		)),
		Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
			Err(at_position(input, e.input, ErrorCode::Syntax, "invalid query syntax"))
		}
		Err(nom::Err::Incomplete(_)) => Err(at_position(
			input,
			"",
			ErrorCode::Syntax,
			"unexpected end of input",
		)),
	}
}

fn at_position(input: &str, rest: &str, code: ErrorCode, message: &str) -> ParseError {
	let offset = input.len() - rest.len();
	let consumed = &input[..offset];
	let line = consumed.matches('\n').count() as u32 + 1;
	let column = match consumed.rfind('\n') {
		Some(pos) => (offset - pos - 1) as u32 + 1,
		None => offset as u32 + 1,
	};
	ParseError {
		code,
		message: message.to_string(),
		line,
		column,
	}
}

fn query(s: &str) -> IResult<&str, Query> {
	let (s, expr) = delimited(multispace0, or_expr, multispace0)(s)?;
	let (s, projection) = opt(preceded(pair(char('|'), multispace0), projection))(s)?;
	let (s, _) = multispace0(s)?;
	Ok((
		s,
		Query {
			expr: Some(expr),
			projection,
		},
	))
}

fn projection(s: &str) -> IResult<&str, Vec<String>> {
	map(
		separated_list1(delimited(multispace0, char(','), multispace0), identifier),
		|fields| fields.into_iter().map(|f| f.to_string()).collect(),
	)(s)
}

fn or_expr(s: &str) -> IResult<&str, Expr> {
	let (s, first) = and_expr(s)?;
	let (s, rest) = many0(preceded(
		delimited(multispace0, keyword("or"), multispace0),
		and_expr,
	))(s)?;
	if rest.is_empty() {
		return Ok((s, first));
	}
	let mut children = vec![first];
	children.extend(rest);
	Ok((s, Expr::Or(children)))
}

// Juxtaposed operands are conjoined: `a=1 b=2` reads as `a=1 AND b=2`.
fn and_expr(s: &str) -> IResult<&str, Expr> {
	let (s, first) = unary(s)?;
	let (s, rest) = many0(alt((
		preceded(delimited(multispace0, keyword("and"), multispace0), unary),
		preceded(multispace1, unary),
	)))(s)?;
	if rest.is_empty() {
		return Ok((s, first));
	}
	let mut children = vec![first];
	children.extend(rest);
	Ok((s, Expr::And(children)))
}

fn unary(s: &str) -> IResult<&str, Expr> {
	alt((
		map(
			preceded(terminated(keyword("not"), multispace0), unary),
			|inner| Expr::Not(Box::new(inner)),
		),
		atom,
	))(s)
}

fn atom(s: &str) -> IResult<&str, Expr> {
	alt((
		delimited(
			pair(char('('), multispace0),
			or_expr,
			pair(multispace0, char(')')),
		),
		map(condition, Expr::Condition),
	))(s)
}

fn condition(s: &str) -> IResult<&str, Condition> {
	let (s, field) = identifier(s)?;
	let (s, _) = multispace0(s)?;
	let (s, (op, value)) = op_and_value(s)?;
	Ok((
		s,
		Condition {
			field: field.to_string(),
			op,
			value,
		},
	))
}

fn op_and_value(input: &str) -> IResult<&str, (Op, Value)> {
	if let Ok((s, op)) = symbolic_op(input) {
		let (s, _) = multispace0(s)?;
		let (s, v) = value(s)?;
		return Ok((s, (op, v)));
	}
	let (s, op) = word_op(input)?;
	match op {
		Op::IsNull | Op::IsNotNull => Ok((s, (op, Value::None))),
		Op::In | Op::NotIn => {
			let (s, _) = multispace0(s)?;
			let (s, v) = list_value(s)?;
			Ok((s, (op, v)))
		}
		_ => {
			let (s, _) = multispace1(s)?;
			let (s, v) = value(s)?;
			Ok((s, (op, v)))
		}
	}
}

fn symbolic_op(s: &str) -> IResult<&str, Op> {
	alt((
		tok(Op::Gte, tag(">=")),
		tok(Op::Lte, tag("<=")),
		tok(Op::Ne, tag("!=")),
		tok(Op::RegexNotMatch, tag("!~")),
		tok(Op::Gt, tag(">")),
		tok(Op::Lt, tag("<")),
		tok(Op::Eq, tag("=")),
		tok(Op::RegexMatch, tag("~")),
	))(s)
}

fn word_op(input: &str) -> IResult<&str, Op> {
	let (s, negated) = opt(char('!'))(input)?;
	let (s, id) = identifier(s)?;
	let lowered = id.to_ascii_lowercase();
	let op = match (negated.is_some(), lowered.as_str()) {
		(false, "contains") => Op::Contains,
		(true, "contains") => Op::NotContains,
		(false, "startswith") => Op::StartsWith,
		(true, "startswith") => Op::NotStartsWith,
		(false, "endswith") => Op::EndsWith,
		(true, "endswith") => Op::NotEndsWith,
		(false, "in") => Op::In,
		(true, "in") => Op::NotIn,
		(false, "is_null") => Op::IsNull,
		(false, "is_not_null") => Op::IsNotNull,
		_ => {
			return Err(nom::Err::Error(NomError::new(input, ErrorKind::Tag)));
		}
	};
	Ok((s, op))
}

fn keyword<'a>(kw: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
	verify(identifier, move |id: &str| id.eq_ignore_ascii_case(kw))
}

fn identifier(input: &str) -> IResult<&str, &str> {
	recognize(pair(
		alt((alpha1, tag("_"))),
		many0_count(alt((alphanumeric1, tag("_"), tag(".")))),
	))(input)
}

fn value(s: &str) -> IResult<&str, Value> {
	alt((map(quoted_string, Value::String), number, bare_word))(s)
}

fn list_value(s: &str) -> IResult<&str, Value> {
	map(
		delimited(
			pair(char('('), multispace0),
			separated_list1(delimited(multispace0, char(','), multispace0), value),
			pair(multispace0, char(')')),
		),
		Value::List,
	)(s)
}

fn quoted_string(s: &str) -> IResult<&str, String> {
	delimited(
		char('"'),
		map(
			opt(nom::bytes::complete::escaped_transform(
				is_not("\\\""),
				'\\',
				alt((tok('\\', char('\\')), tok('"', char('"')))),
			)),
			Option::unwrap_or_default,
		),
		char('"'),
	)(s)
}

fn number(input: &str) -> IResult<&str, Value> {
	let (rest, text) = recognize(tuple((
		opt(char('-')),
		digit1,
		opt(pair(char('.'), digit1)),
	)))(input)?;
	// `5xx` is a bare word, not the number 5
	if rest
		.chars()
		.next()
		.is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '.')
	{
		return Err(nom::Err::Error(NomError::new(input, ErrorKind::Digit)));
	}
	if text.contains('.') {
		let f: f64 = text
			.parse()
			.map_err(|_| nom::Err::Error(NomError::new(input, ErrorKind::Float)))?;
		Ok((rest, Value::Float(OrderedFloat(f))))
	} else {
		let i: i64 = text
			.parse()
			.map_err(|_| nom::Err::Error(NomError::new(input, ErrorKind::Digit)))?;
		Ok((rest, Value::Int(i)))
	}
}

fn bare_word(s: &str) -> IResult<&str, Value> {
	map(
		nom::bytes::complete::take_while1(|c: char| {
			c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '*' | '@')
		}),
		|w: &str| Value::String(w.to_string()),
	)(s)
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	fn cond(field: &str, op: Op, value: Value) -> Expr {
		Expr::Condition(Condition {
			field: field.to_string(),
			op,
			value,
		})
	}

	fn s(v: &str) -> Value {
		Value::String(v.to_string())
	}

	#[test]
	fn test_empty_query() {
		for input in ["", "   ", "\t\n"] {
			let actual = parse(input).unwrap();
			assert_eq!(Query::default(), actual, "input: {:?}", input);
		}
	}

	#[test]
	fn test_single_condition() {
		let actual = parse(r#"level="error""#).unwrap();
		let expect = Query {
			expr: Some(cond("level", Op::Eq, s("error"))),
			projection: None,
		};
		assert_eq!(expect, actual);
	}

	#[test]
	fn test_and_with_numeric_comparison() {
		let actual = parse(r#"level="error" AND status>=500"#).unwrap();
		let expect = Query {
			expr: Some(Expr::And(vec![
				cond("level", Op::Eq, s("error")),
				cond("status", Op::Gte, Value::Int(500)),
			])),
			projection: None,
		};
		assert_eq!(expect, actual);
	}

	#[test]
	fn test_juxtaposition_is_and() {
		let actual = parse(r#"level="error" status=500"#).unwrap();
		let expect = Query {
			expr: Some(Expr::And(vec![
				cond("level", Op::Eq, s("error")),
				cond("status", Op::Eq, Value::Int(500)),
			])),
			projection: None,
		};
		assert_eq!(expect, actual);
	}

	#[test]
	fn test_or_binds_looser_than_and() {
		let actual = parse(r#"a=1 or b=2 and c=3"#).unwrap();
		let expect = Query {
			expr: Some(Expr::Or(vec![
				cond("a", Op::Eq, Value::Int(1)),
				Expr::And(vec![
					cond("b", Op::Eq, Value::Int(2)),
					cond("c", Op::Eq, Value::Int(3)),
				]),
			])),
			projection: None,
		};
		assert_eq!(expect, actual);
	}

	#[test]
	fn test_not_and_parens() {
		let actual = parse(r#"msg~"timeout" AND NOT service="cache""#).unwrap();
		let expect = Query {
			expr: Some(Expr::And(vec![
				cond("msg", Op::RegexMatch, s("timeout")),
				Expr::Not(Box::new(cond("service", Op::Eq, s("cache")))),
			])),
			projection: None,
		};
		assert_eq!(expect, actual);

		let actual = parse(r#"not (a=1 or b=2)"#).unwrap();
		let expect = Query {
			expr: Some(Expr::Not(Box::new(Expr::Or(vec![
				cond("a", Op::Eq, Value::Int(1)),
				cond("b", Op::Eq, Value::Int(2)),
			])))),
			projection: None,
		};
		assert_eq!(expect, actual);
	}

	#[test]
	fn test_quoted_escapes() {
		let actual = parse(r#"msg="say \"hi\" \\ done""#).unwrap();
		let expect = Query {
			expr: Some(cond("msg", Op::Eq, s(r#"say "hi" \ done"#))),
			projection: None,
		};
		assert_eq!(expect, actual);
	}

	#[test]
	fn test_empty_quoted_value() {
		let actual = parse(r#"msg="""#).unwrap();
		let expect = Query {
			expr: Some(cond("msg", Op::Eq, s(""))),
			projection: None,
		};
		assert_eq!(expect, actual);
	}

	#[test]
	fn test_bare_words_and_numbers() {
		let actual = parse(r#"status=5xx env=prod ratio>0.75 delta<-2"#).unwrap();
		let expect = Query {
			expr: Some(Expr::And(vec![
				cond("status", Op::Eq, s("5xx")),
				cond("env", Op::Eq, s("prod")),
				cond("ratio", Op::Gt, Value::Float(OrderedFloat(0.75))),
				cond("delta", Op::Lt, Value::Int(-2)),
			])),
			projection: None,
		};
		assert_eq!(expect, actual);
	}

	#[test]
	fn test_word_operators() {
		let actual = parse(
			r#"msg contains "disk full" and path startswith /var and host endswith ".internal""#,
		)
		.unwrap();
		let expect = Query {
			expr: Some(Expr::And(vec![
				cond("msg", Op::Contains, s("disk full")),
				cond("path", Op::StartsWith, s("/var")),
				cond("host", Op::EndsWith, s(".internal")),
			])),
			projection: None,
		};
		assert_eq!(expect, actual);
	}

	#[test]
	fn test_negated_word_operators() {
		let actual = parse(r#"msg !contains "heartbeat" and env !in (dev, staging)"#).unwrap();
		let expect = Query {
			expr: Some(Expr::And(vec![
				cond("msg", Op::NotContains, s("heartbeat")),
				cond(
					"env",
					Op::NotIn,
					Value::List(vec![s("dev"), s("staging")]),
				),
			])),
			projection: None,
		};
		assert_eq!(expect, actual);
	}

	#[test]
	fn test_in_list_mixed_values() {
		let actual = parse(r#"status in (200, 204, "301")"#).unwrap();
		let expect = Query {
			expr: Some(cond(
				"status",
				Op::In,
				Value::List(vec![Value::Int(200), Value::Int(204), s("301")]),
			)),
			projection: None,
		};
		assert_eq!(expect, actual);
	}

	#[test]
	fn test_null_operators() {
		let actual = parse(r#"trace_id is_null or span_id is_not_null"#).unwrap();
		let expect = Query {
			expr: Some(Expr::Or(vec![
				cond("trace_id", Op::IsNull, Value::None),
				cond("span_id", Op::IsNotNull, Value::None),
			])),
			projection: None,
		};
		assert_eq!(expect, actual);
	}

	#[test]
	fn test_projection() {
		let actual = parse(r#"level="error" | timestamp, msg, service.name"#).unwrap();
		let expect = Query {
			expr: Some(cond("level", Op::Eq, s("error"))),
			projection: Some(vec![
				"timestamp".to_string(),
				"msg".to_string(),
				"service.name".to_string(),
			]),
		};
		assert_eq!(expect, actual);
	}

	#[test]
	fn test_fields_used() {
		let q = parse(r#"a=1 and (b=2 or a=3) and not c~"x""#).unwrap();
		assert_eq!(vec!["a", "b", "c"], q.fields_used());
	}

	#[test]
	fn test_error_carries_position() {
		let err = parse(r#"level="error" AND "#).unwrap_err();
		assert_eq!(1, err.line);
		assert!(err.column > 1, "column: {}", err.column);

		let err = parse("a=1 ???").unwrap_err();
		assert_eq!(ErrorCode::TrailingInput, err.code);
		assert_eq!(1, err.line);
		assert_eq!(5, err.column);
	}

	#[test]
	fn test_keywords_are_case_insensitive() {
		let lower = parse(r#"a=1 and b=2 or not c=3"#).unwrap();
		let upper = parse(r#"a=1 AND b=2 OR NOT c=3"#).unwrap();
		assert_eq!(lower, upper);
	}
}
