use crate::backends::{BackendClient, FieldValuesParams, FieldValuesResult, TableInfo};
use common::TimeRange;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::warn;

/// Column types the sidebar offers value discovery for: strings,
/// low-cardinality strings, and enum-like integers.
pub fn is_filterable_type(column_type: &str) -> bool {
	column_type == "String"
		|| column_type == "Nullable(String)"
		|| column_type.starts_with("LowCardinality(")
		|| column_type.starts_with("Enum8")
		|| column_type.starts_with("Enum16")
		|| matches!(column_type, "UInt8" | "Int8" | "Bool")
}

pub fn is_low_cardinality(column_type: &str) -> bool {
	column_type.starts_with("LowCardinality(") || column_type.starts_with("Enum")
}

/// Batch value discovery across every filterable column of a table. Field
/// queries run concurrently; a failing field is logged and skipped rather
/// than failing the batch. Dropping the returned future aborts the
/// in-flight queries.
pub async fn all_filterable_values(
	client: Arc<dyn BackendClient>,
	info: &TableInfo,
	range: &TimeRange,
	limit: u32,
	filter: Option<String>,
) -> Vec<FieldValuesResult> {
	let mut set = JoinSet::new();
	for col in info.columns.iter().filter(|c| is_filterable_type(&c.column_type)) {
		let client = client.clone();
		let params = FieldValuesParams {
			field: col.name.clone(),
			field_type: Some(col.column_type.clone()),
			range: range.clone(),
			limit,
			filter: filter.clone(),
		};
		set.spawn(async move {
			let field = params.field.clone();
			(field, client.field_distinct_values(&params).await)
		});
	}
	let mut out = vec![];
	while let Some(joined) = set.join_next().await {
		match joined {
			Ok((_, Ok(result))) => out.push(result),
			Ok((field, Err(e))) => {
				warn!(field, error = %e, "field value discovery failed");
			}
			Err(e) => warn!(error = %e, "field value task panicked"),
		}
	}
	out.sort_by(|a, b| a.field.cmp(&b.field));
	out
}
