use common::TimeRangeError;

/// Fixed bucket widths, in seconds, a histogram may use.
pub static LADDER: [u64; 16] = [
	1, 5, 10, 15, 30, 60, 300, 600, 900, 1800, 3600, 7200, 10800, 21600, 43200, 86400,
];

const TARGET_BUCKETS: f64 = 100.0;

/// Pick the ladder width whose bucket count over `span_secs` lands nearest
/// the 100-bucket target; ties prefer the finer width. Never finer than 1 s.
pub fn auto_granularity(span_secs: i64) -> u64 {
	let span = span_secs.max(1) as f64;
	let mut best = LADDER[0];
	let mut best_dist = f64::INFINITY;
	for width in LADDER {
		let dist = (span / width as f64 - TARGET_BUCKETS).abs();
		if dist < best_dist {
			best = width;
			best_dist = dist;
		}
	}
	best
}

/// Parse an explicit window like `30s`, `15m`, `2h` and snap it onto the
/// ladder (next coarser entry).
pub fn parse_window(expr: &str) -> Result<u64, TimeRangeError> {
	let dur = common::parse_relative(expr)?;
	let secs = dur.num_seconds().max(1) as u64;
	Ok(LADDER
		.iter()
		.copied()
		.find(|w| *w >= secs)
		.unwrap_or(LADDER[LADDER.len() - 1]))
}

pub fn humanize(secs: u64) -> String {
	if secs % 3600 == 0 {
		format!("{}h", secs / 3600)
	} else if secs % 60 == 0 {
		format!("{}m", secs / 60)
	} else {
		format!("{}s", secs)
	}
}
