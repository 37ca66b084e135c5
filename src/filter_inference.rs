//! Naming-convention filter inference.
//!
//! Fallback for callers that send raw key/value filter params without
//! explicit metadata. Keys are mapped onto `FilterMeta` by convention:
//! date-range keys bind to a date column detected in the SQL text,
//! well-known categorical keys become equality/IN filters, and `_id`,
//! `_min`, `_max` suffixes become numeric comparisons. Anything
//! unrecognized is dropped silently — the caller then runs the query
//! unmodified.

use crate::filter_injection::{
    build_filtered_query, is_skipped_value, FilterMeta, FilterOperator, FilterType, FilteredQuery,
};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

const DATE_FROM_KEYS: [&str; 3] = ["date_from", "start_date", "from_date"];
const DATE_TO_KEYS: [&str; 3] = ["date_to", "end_date", "to_date"];

/// Column names commonly holding the row date in analytics schemas, in
/// detection priority order.
const DATE_COLUMN_CANDIDATES: [&str; 12] = [
    "date",
    "created_at",
    "updated_at",
    "order_date",
    "transaction_date",
    "timestamp",
    "datetime",
    "time",
    "day",
    "event_date",
    "sale_date",
    "purchase_date",
];

/// Keys treated as categorical dropdown filters.
const CATEGORICAL_KEYS: [&str; 10] = [
    "category",
    "region",
    "status",
    "type",
    "department",
    "product",
    "customer",
    "country",
    "state",
    "city",
];

/// Infer filter metadata from raw key/value params.
///
/// Keys are visited in sorted order so the produced metadata (and therefore
/// parameter numbering) is deterministic. Date-range keys are dropped when
/// no date column can be detected in `sql`.
pub fn infer_filter_meta(
    filter_params: &HashMap<String, Value>,
    sql: Option<&str>,
) -> Vec<FilterMeta> {
    let date_column = sql.and_then(detect_date_column);
    let mut inferred = Vec::new();

    let mut keys: Vec<&String> = filter_params.keys().collect();
    keys.sort();

    for key in keys {
        let value = &filter_params[key];
        if is_skipped_value(value) {
            continue;
        }

        if DATE_FROM_KEYS.contains(&key.as_str()) {
            match &date_column {
                Some(column) => inferred.push(FilterMeta {
                    id: key.clone(),
                    column: column.clone(),
                    operator: FilterOperator::Gte,
                    filter_type: FilterType::Date,
                    table: None,
                }),
                None => debug!("dropping date filter '{}': no date column detected", key),
            }
        } else if DATE_TO_KEYS.contains(&key.as_str()) {
            match &date_column {
                Some(column) => inferred.push(FilterMeta {
                    id: key.clone(),
                    column: column.clone(),
                    operator: FilterOperator::Lte,
                    filter_type: FilterType::Date,
                    table: None,
                }),
                None => debug!("dropping date filter '{}': no date column detected", key),
            }
        } else if CATEGORICAL_KEYS.contains(&key.as_str()) {
            let operator = if value.is_array() {
                FilterOperator::In
            } else {
                FilterOperator::Eq
            };
            inferred.push(FilterMeta {
                id: key.clone(),
                column: key.clone(),
                operator,
                filter_type: FilterType::Text,
                table: None,
            });
        } else if key.ends_with("_id") {
            inferred.push(FilterMeta {
                id: key.clone(),
                column: key.clone(),
                operator: FilterOperator::Eq,
                filter_type: FilterType::Number,
                table: None,
            });
        } else if let Some(column) = key.strip_suffix("_min") {
            inferred.push(FilterMeta {
                id: key.clone(),
                column: column.to_string(),
                operator: FilterOperator::Gte,
                filter_type: FilterType::Number,
                table: None,
            });
        } else if let Some(column) = key.strip_suffix("_max") {
            inferred.push(FilterMeta {
                id: key.clone(),
                column: column.to_string(),
                operator: FilterOperator::Lte,
                filter_type: FilterType::Number,
                table: None,
            });
        } else {
            debug!("dropping unrecognized filter param '{}'", key);
        }
    }

    inferred
}

/// Infer metadata from `filter_params` and splice the result into
/// `base_sql`. Returns `None` when inference yields no filters, signalling
/// the caller to run the query unmodified.
pub fn build_auto_filtered_query(
    base_sql: &str,
    filter_params: &HashMap<String, Value>,
) -> Option<FilteredQuery> {
    let meta = infer_filter_meta(filter_params, Some(base_sql));
    if meta.is_empty() {
        return None;
    }
    Some(build_filtered_query(base_sql, &meta, filter_params))
}

/// Scan SQL text for the first known date column it references.
///
/// Tries, per candidate: a simple reference, an alias-qualified reference,
/// a SELECT-list mention, and a WHERE-context mention.
fn detect_date_column(sql: &str) -> Option<String> {
    for candidate in DATE_COLUMN_CANDIDATES {
        let patterns = [
            format!(r"(?i)\b{}\b", candidate),
            format!(r"(?i)\b\w+\.{}\b", candidate),
            format!(r"(?is)\bSELECT\b.*\b{}\b", candidate),
            format!(r"(?is)\bWHERE\b.*\b{}\b", candidate),
        ];
        for pattern in &patterns {
            if let Ok(re) = Regex::new(pattern) {
                if re.is_match(sql) {
                    return Some(candidate.to_string());
                }
            }
        }
    }
    None
}
