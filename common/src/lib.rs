use chrono::{Duration, NaiveDate, NaiveDateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use std::env;
use thiserror::Error;

pub mod value;

pub use value::LogValue;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TimeRangeError {
	#[error("unrecognized time format: {0}")]
	UnrecognizedFormat(String),
	#[error("invalid duration: {0}")]
	InvalidDuration(String),
	#[error("invalid time range: start {start} is not before end {end}")]
	EmptyRange {
		start: NaiveDateTime,
		end: NaiveDateTime,
	},
	#[error("time out of bounds: {0} is more than 100 years from now")]
	OutOfBounds(NaiveDateTime),
}

/// A half-open query window. Instants are kept naive: they are interpreted
/// in `timezone` by the backend, and all local arithmetic (spans, buckets)
/// only depends on the difference between the two.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeRange {
	pub start: NaiveDateTime,
	pub end: NaiveDateTime,
	pub timezone: String,
}

const MAX_RANGE_DISTANCE_DAYS: i64 = 36525; // 100 years

lazy_static! {
	static ref SIMPLE_RELATIVE: Regex = Regex::new(r"^(\d+)([smhdw])$").unwrap();
}

impl TimeRange {
	/// Window ending now, starting `expr` ago. `expr` is either the simple
	/// form `\d+[smhdw]` or a composite humantime expression like `1h30m`.
	pub fn from_relative(expr: &str, timezone: &str) -> Result<Self, TimeRangeError> {
		let dur = parse_relative(expr)?;
		let end = Utc::now().naive_utc();
		let start = end - dur;
		Self::checked(start, end, timezone)
	}

	/// Window between two absolute instants; a missing `to` means now.
	pub fn from_absolute(
		from: &str,
		to: Option<&str>,
		timezone: &str,
	) -> Result<Self, TimeRangeError> {
		let start = parse_instant(from)?;
		let end = match to {
			Some(s) => parse_instant(s)?,
			None => Utc::now().naive_utc(),
		};
		Self::checked(start, end, timezone)
	}

	pub fn checked(
		start: NaiveDateTime,
		end: NaiveDateTime,
		timezone: &str,
	) -> Result<Self, TimeRangeError> {
		if start >= end {
			return Err(TimeRangeError::EmptyRange { start, end });
		}
		let now = Utc::now().naive_utc();
		let horizon = Duration::days(MAX_RANGE_DISTANCE_DAYS);
		for t in [start, end] {
			if t < now - horizon || t > now + horizon {
				return Err(TimeRangeError::OutOfBounds(t));
			}
		}
		Ok(Self {
			start,
			end,
			timezone: timezone.to_string(),
		})
	}

	pub fn span(&self) -> Duration {
		self.end - self.start
	}

	pub fn span_seconds(&self) -> i64 {
		self.span().num_seconds()
	}
}

pub fn parse_relative(expr: &str) -> Result<Duration, TimeRangeError> {
	if let Some(caps) = SIMPLE_RELATIVE.captures(expr) {
		let n: i64 = caps[1]
			.parse()
			.map_err(|_| TimeRangeError::InvalidDuration(expr.to_string()))?;
		let dur = match &caps[2] {
			"s" => Duration::seconds(n),
			"m" => Duration::minutes(n),
			"h" => Duration::hours(n),
			"d" => Duration::days(n),
			"w" => Duration::weeks(n),
			_ => unreachable!(),
		};
		return Ok(dur);
	}
	// composite forms: 1h30m, 2d12h, ...
	let std_dur = humantime::parse_duration(expr)
		.map_err(|_| TimeRangeError::InvalidDuration(expr.to_string()))?;
	Duration::from_std(std_dur)
		.map_err(|_| TimeRangeError::InvalidDuration(expr.to_string()))
}

static INSTANT_FORMATS: [&str; 5] = [
	"%Y-%m-%dT%H:%M:%S%.f",
	"%Y-%m-%dT%H:%M:%S",
	"%Y-%m-%dT%H:%M",
	"%Y-%m-%d %H:%M:%S",
	"%Y-%m-%d %H:%M",
];

pub fn parse_instant(value: &str) -> Result<NaiveDateTime, TimeRangeError> {
	let value = value.trim();
	if value.eq_ignore_ascii_case("now") {
		return Ok(Utc::now().naive_utc());
	}
	// RFC3339 with offset (incl. nanosecond precision)
	if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(value) {
		return Ok(dt.naive_utc());
	}
	for fmt in INSTANT_FORMATS {
		if let Ok(dt) = NaiveDateTime::parse_from_str(value, fmt) {
			return Ok(dt);
		}
	}
	if let Ok(d) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
		return Ok(d.and_hms_opt(0, 0, 0).unwrap());
	}
	Err(TimeRangeError::UnrecognizedFormat(value.to_string()))
}

/// `Local` and the empty string fall back to the host `TZ`, then to UTC.
/// Anything else is treated as an IANA identifier and passed through to
/// the backend verbatim.
pub fn resolve_timezone(requested: Option<&str>) -> String {
	match requested {
		None => host_timezone(),
		Some(tz) if tz.is_empty() || tz.eq_ignore_ascii_case("local") => host_timezone(),
		Some(tz) => tz.to_string(),
	}
}

fn host_timezone() -> String {
	env::var("TZ")
		.ok()
		.filter(|v| !v.is_empty())
		.unwrap_or_else(|| "UTC".to_string())
}

/// `YYYY-MM-DD HH:MM:SS`, the literal form `toDateTime` expects.
pub fn format_sql_datetime(t: NaiveDateTime) -> String {
	t.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// RFC3339 with millisecond precision, UTC-suffixed.
pub fn format_rfc3339_millis(t: NaiveDateTime) -> String {
	t.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	fn dt(s: &str) -> NaiveDateTime {
		NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").unwrap()
	}

	#[test]
	fn test_parse_relative() {
		let test_cases = vec![
			("15m", Duration::minutes(15)),
			("90s", Duration::seconds(90)),
			("7d", Duration::days(7)),
			("2w", Duration::weeks(2)),
			("1h30m", Duration::minutes(90)),
			("2d12h", Duration::hours(60)),
		];
		for (input, expect) in test_cases {
			let actual = parse_relative(input).unwrap();
			assert_eq!(expect, actual, "input: {}", input);
		}
	}

	#[test]
	fn test_parse_relative_invalid() {
		for input in ["", "15", "m15", "1y2x", "fifteen minutes"] {
			assert!(parse_relative(input).is_err(), "input: {}", input);
		}
	}

	#[test]
	fn test_parse_instant() {
		let test_cases = vec![
			("2024-01-15 10:00:00", dt("2024-01-15 10:00:00")),
			("2024-01-15T10:00:00", dt("2024-01-15 10:00:00")),
			("2024-01-15T10:00", dt("2024-01-15 10:00:00")),
			("2024-01-15 10:00", dt("2024-01-15 10:00:00")),
			("2024-01-15", dt("2024-01-15 00:00:00")),
			("2024-01-15T10:00:00Z", dt("2024-01-15 10:00:00")),
			(
				"2024-01-15T10:00:00.123456789Z",
				dt("2024-01-15 10:00:00") + Duration::nanoseconds(123456789),
			),
			("2024-01-15T12:00:00+02:00", dt("2024-01-15 10:00:00")),
		];
		for (input, expect) in test_cases {
			let actual = parse_instant(input).unwrap();
			assert_eq!(expect, actual, "input: {}", input);
		}
	}

	#[test]
	fn test_parse_instant_now() {
		let before = Utc::now().naive_utc();
		let actual = parse_instant("now").unwrap();
		let after = Utc::now().naive_utc();
		assert!(actual >= before && actual <= after);
	}

	#[test]
	fn test_from_absolute_rejects_empty_range() {
		let err = TimeRange::from_absolute(
			"2024-01-15 11:00:00",
			Some("2024-01-15 10:00:00"),
			"UTC",
		)
		.unwrap_err();
		assert!(matches!(err, TimeRangeError::EmptyRange { .. }));

		let err = TimeRange::from_absolute(
			"2024-01-15 10:00:00",
			Some("2024-01-15 10:00:00"),
			"UTC",
		)
		.unwrap_err();
		assert!(matches!(err, TimeRangeError::EmptyRange { .. }));
	}

	#[test]
	fn test_from_absolute_rejects_far_past() {
		let err =
			TimeRange::from_absolute("1016-01-15 10:00:00", Some("2024-01-15 10:00:00"), "UTC")
				.unwrap_err();
		assert!(matches!(err, TimeRangeError::OutOfBounds(_)));
	}

	#[test]
	fn test_from_relative_window() {
		let r = TimeRange::from_relative("15m", "UTC").unwrap();
		assert_eq!(Duration::minutes(15), r.span());
	}

	#[test]
	fn test_resolve_timezone() {
		assert_eq!("Asia/Kolkata", resolve_timezone(Some("Asia/Kolkata")));
		assert_eq!("Europe/Berlin", resolve_timezone(Some("Europe/Berlin")));
		// Local/empty/None fall back to $TZ or UTC; either way the result
		// is non-empty.
		assert!(!resolve_timezone(Some("Local")).is_empty());
		assert!(!resolve_timezone(Some("")).is_empty());
		assert!(!resolve_timezone(None).is_empty());
	}

	#[test]
	fn test_wire_formats() {
		let t = dt("2024-01-15 10:05:07");
		assert_eq!("2024-01-15 10:05:07", format_sql_datetime(t));
		assert_eq!("2024-01-15T10:05:07.000Z", format_rfc3339_millis(t));
	}
}
