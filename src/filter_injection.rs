//! Filter-Injection Engine — parameterized WHERE/AND splicing.
//!
//! Takes an arbitrary caller-supplied SELECT statement plus structured filter
//! metadata and splices a parameterized condition into the correct syntactic
//! position, regardless of existing clauses, subqueries, or trailing
//! GROUP BY/ORDER BY/LIMIT. Values never enter the SQL text; they travel as
//! positional `$1, $2, ...` bind parameters. This is the preferred path —
//! the textual `{{placeholder}}` mechanism in `placeholders` is legacy.

use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Comparison operator a filter maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Like,
    Ilike,
    Between,
}

impl FilterOperator {
    /// SQL rendering for the single-parameter operators.
    fn sql_symbol(&self) -> &'static str {
        match self {
            FilterOperator::Eq => "=",
            FilterOperator::Neq => "!=",
            FilterOperator::Gt => ">",
            FilterOperator::Gte => ">=",
            FilterOperator::Lt => "<",
            FilterOperator::Lte => "<=",
            FilterOperator::Like => "LIKE",
            FilterOperator::Ilike => "ILIKE",
            FilterOperator::In | FilterOperator::NotIn | FilterOperator::Between => {
                unreachable!("list operators are rendered separately")
            }
        }
    }
}

/// Declared value type of a filter. Governs parameter casting only — the
/// receiving database performs any date casting itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterType {
    Date,
    Text,
    Number,
    Boolean,
}

/// How one user-facing filter maps onto a SQL condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterMeta {
    /// Unique key within a filter-set; also the lookup key into the values map.
    pub id: String,

    /// Target column. Must pass the identifier pattern; table-qualified names
    /// use `.`.
    pub column: String,

    /// Comparison operator.
    pub operator: FilterOperator,

    /// Declared value type.
    #[serde(rename = "type")]
    pub filter_type: FilterType,

    /// Optional table or alias qualifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
}

/// Filter id → value. Scalars for the comparison operators, a two-element
/// array for `between`, an array for `in`/`not_in`.
pub type FilterValues = HashMap<String, Value>;

/// Result of splicing filters into a statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilteredQuery {
    /// Rewritten SQL with positional `$n` placeholders.
    pub sql: String,

    /// Bind parameters, in placeholder order.
    pub params: Vec<Value>,

    /// The joined condition text, for diagnostics.
    pub where_clause: String,
}

/// Keywords that close off the clause a condition may be appended to.
const TERMINATOR_KEYWORDS: [&str; 7] = [
    "GROUP BY",
    "ORDER BY",
    "LIMIT",
    "HAVING",
    "UNION",
    "INTERSECT",
    "EXCEPT",
];

lazy_static! {
    static ref COLUMN_NAME: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]{0,127}$").unwrap();
    static ref WHITESPACE: Regex = Regex::new(r"\s+").unwrap();
}

/// Splice the surviving filters into `base_sql` as a parameterized condition.
///
/// Filters whose value is missing, null, an empty string, or an empty list
/// are skipped without emitting a fragment or a parameter, so an unset
/// dashboard control leaves the statement untouched. This function never
/// fails; unusable filters degrade to skips with a warning.
pub fn build_filtered_query(
    base_sql: &str,
    filter_meta: &[FilterMeta],
    filter_values: &FilterValues,
) -> FilteredQuery {
    let base = trim_statement(base_sql);
    let mut fragments: Vec<String> = Vec::new();
    let mut params: Vec<Value> = Vec::new();

    for meta in filter_meta {
        let value = match filter_values.get(&meta.id) {
            Some(v) if !is_skipped_value(v) => v,
            _ => {
                debug!("filter '{}' has no usable value, skipping", meta.id);
                continue;
            }
        };
        if !COLUMN_NAME.is_match(&meta.column) {
            warn!(
                "skipping filter '{}': column {:?} fails the identifier check",
                meta.id, meta.column
            );
            continue;
        }
        let column = match &meta.table {
            Some(table) => format!("{}.{}", table, meta.column),
            None => meta.column.clone(),
        };

        match meta.operator {
            FilterOperator::Between => {
                let pair = match value.as_array() {
                    Some(items) if items.len() == 2 => items,
                    _ => {
                        warn!(
                            "skipping between filter '{}': expected a two-element range",
                            meta.id
                        );
                        continue;
                    }
                };
                params.push(cast_param(meta.filter_type, &pair[0]));
                params.push(cast_param(meta.filter_type, &pair[1]));
                fragments.push(format!(
                    "{} BETWEEN ${} AND ${}",
                    column,
                    params.len() - 1,
                    params.len()
                ));
            }
            FilterOperator::In | FilterOperator::NotIn => {
                let items: Vec<&Value> = match value {
                    Value::Array(list) => list.iter().collect(),
                    scalar => vec![scalar],
                };
                let mut slots = Vec::with_capacity(items.len());
                for item in items {
                    params.push(cast_param(meta.filter_type, item));
                    slots.push(format!("${}", params.len()));
                }
                let keyword = if meta.operator == FilterOperator::In {
                    "IN"
                } else {
                    "NOT IN"
                };
                fragments.push(format!("{} {} ({})", column, keyword, slots.join(", ")));
            }
            scalar_op => {
                params.push(cast_param(meta.filter_type, value));
                fragments.push(format!(
                    "{} {} ${}",
                    column,
                    scalar_op.sql_symbol(),
                    params.len()
                ));
            }
        }
    }

    if fragments.is_empty() {
        return FilteredQuery {
            sql: base,
            params: Vec::new(),
            where_clause: String::new(),
        };
    }

    let where_clause = fragments.join(" AND ");
    let (position, insert_keyword) = injection_point(&base);
    let sql = format!(
        "{}{}{} {}",
        &base[..position],
        insert_keyword,
        where_clause,
        &base[position..]
    );
    let sql = collapse_whitespace(&sql);

    debug!(
        "injected {} filter condition(s): {}",
        fragments.len(),
        where_clause
    );
    FilteredQuery {
        sql,
        params,
        where_clause,
    }
}

/// A `gte`/`lte` pair keyed `date_from`/`date_to` for the standard dashboard
/// date-range control.
pub fn date_range_filter_meta(column: &str, table: Option<&str>) -> Vec<FilterMeta> {
    vec![
        FilterMeta {
            id: "date_from".to_string(),
            column: column.to_string(),
            operator: FilterOperator::Gte,
            filter_type: FilterType::Date,
            table: table.map(str::to_string),
        },
        FilterMeta {
            id: "date_to".to_string(),
            column: column.to_string(),
            operator: FilterOperator::Lte,
            filter_type: FilterType::Date,
            table: table.map(str::to_string),
        },
    ]
}

/// A single equality filter, defaulting to text typing.
pub fn equality_filter_meta(
    id: &str,
    column: &str,
    filter_type: Option<FilterType>,
    table: Option<&str>,
) -> FilterMeta {
    FilterMeta {
        id: id.to_string(),
        column: column.to_string(),
        operator: FilterOperator::Eq,
        filter_type: filter_type.unwrap_or(FilterType::Text),
        table: table.map(str::to_string),
    }
}

/// Check a filter-set for duplicate ids, empty fields, and invalid column
/// names. Returns every violation found, not just the first.
pub fn validate_filter_meta(filter_meta: &[FilterMeta]) -> Vec<String> {
    let mut violations = Vec::new();

    for id in filter_meta.iter().map(|m| m.id.as_str()).duplicates() {
        violations.push(format!("duplicate filter id '{}'", id));
    }
    for meta in filter_meta {
        if meta.id.trim().is_empty() {
            violations.push("filter with an empty id".to_string());
        }
        if meta.column.trim().is_empty() {
            violations.push(format!("filter '{}' has an empty column", meta.id));
        } else if !COLUMN_NAME.is_match(&meta.column) {
            violations.push(format!(
                "filter '{}' column {:?} is not a valid identifier",
                meta.id, meta.column
            ));
        }
    }

    violations
}

/// True when a value means "this filter is unset".
pub(crate) fn is_skipped_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Cast a raw value into the bind-parameter shape its filter type declares.
fn cast_param(filter_type: FilterType, value: &Value) -> Value {
    match filter_type {
        FilterType::Number => match value {
            Value::Number(_) => value.clone(),
            Value::String(s) => match s.trim().parse::<f64>() {
                Ok(parsed) => serde_json::Number::from_f64(parsed)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                Err(_) => Value::Null,
            },
            _ => Value::Null,
        },
        FilterType::Boolean => match value {
            Value::Bool(_) => value.clone(),
            Value::String(s) => Value::Bool(s == "true" || s == "1"),
            _ => Value::Bool(false),
        },
        FilterType::Date | FilterType::Text => match value {
            Value::String(_) => value.clone(),
            Value::Number(n) => Value::String(n.to_string()),
            Value::Bool(b) => Value::String(b.to_string()),
            _ => Value::Null,
        },
    }
}

/// Strip surrounding whitespace and a single trailing semicolon.
fn trim_statement(sql: &str) -> String {
    let trimmed = sql.trim();
    let trimmed = trimmed.strip_suffix(';').unwrap_or(trimmed);
    trimmed.trim_end().to_string()
}

/// Where to splice, and with which keyword.
///
/// A depth-0 `WHERE` means the statement already has a top-level WHERE
/// clause: the condition is appended to it with ` AND ` just before the
/// first depth-0 terminator keyword that follows it. Otherwise a fresh
/// ` WHERE ` goes in front of the earliest depth-0 terminator, or at the
/// end of the statement.
fn injection_point(sql: &str) -> (usize, &'static str) {
    match find_depth0_keyword(sql, 0, &["WHERE"]) {
        Some(where_pos) => {
            let after_where = where_pos + "WHERE".len();
            let position =
                find_depth0_keyword(sql, after_where, &TERMINATOR_KEYWORDS).unwrap_or(sql.len());
            (position, " AND ")
        }
        None => {
            let position =
                find_depth0_keyword(sql, 0, &TERMINATOR_KEYWORDS).unwrap_or(sql.len());
            (position, " WHERE ")
        }
    }
}

/// Find the first occurrence of any keyword at parenthesis depth 0, outside
/// single-quoted strings, starting at byte offset `from`.
///
/// A match must sit at a word boundary: preceded by start-of-string or
/// whitespace, and followed by a non-identifier character. Returns the byte
/// offset of the keyword.
pub(crate) fn find_depth0_keyword(sql: &str, from: usize, keywords: &[&str]) -> Option<usize> {
    let bytes = sql.as_bytes();
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut i = from;

    while i < bytes.len() {
        let byte = bytes[i];
        if in_string {
            if byte == b'\'' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match byte {
            b'\'' => {
                in_string = true;
                i += 1;
                continue;
            }
            b'(' => {
                depth += 1;
                i += 1;
                continue;
            }
            b')' => {
                depth -= 1;
                i += 1;
                continue;
            }
            _ => {}
        }
        if depth == 0 {
            let at_boundary = i == 0 || (bytes[i - 1] as char).is_ascii_whitespace();
            if at_boundary {
                for keyword in keywords {
                    if matches_keyword_at(sql, i, keyword) {
                        return Some(i);
                    }
                }
            }
        }
        i += 1;
    }
    None
}

/// Case-insensitive keyword match at a byte offset. Multi-word keywords
/// tolerate any run of whitespace between their words.
fn matches_keyword_at(sql: &str, position: usize, keyword: &str) -> bool {
    let bytes = sql.as_bytes();
    let mut cursor = position;

    let words: Vec<&str> = keyword.split_whitespace().collect();
    for (index, word) in words.iter().enumerate() {
        let end = cursor + word.len();
        if end > bytes.len() || !bytes[cursor..end].eq_ignore_ascii_case(word.as_bytes()) {
            return false;
        }
        cursor = end;
        if index + 1 < words.len() {
            let mut skipped = 0;
            while cursor < bytes.len() && (bytes[cursor] as char).is_ascii_whitespace() {
                cursor += 1;
                skipped += 1;
            }
            if skipped == 0 {
                return false;
            }
        }
    }

    // Trailing boundary: end of string or a non-identifier byte.
    match bytes.get(cursor) {
        None => true,
        Some(b) => !(b.is_ascii_alphanumeric() || *b == b'_'),
    }
}

fn collapse_whitespace(sql: &str) -> String {
    WHITESPACE.replace_all(sql, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn count_placeholders(sql: &str) -> usize {
        let re = Regex::new(r"\$\d+").unwrap();
        re.find_iter(sql).count()
    }

    fn date_filter(id: &str, column: &str, operator: FilterOperator) -> FilterMeta {
        FilterMeta {
            id: id.to_string(),
            column: column.to_string(),
            operator,
            filter_type: FilterType::Date,
            table: None,
        }
    }

    #[test]
    fn test_injects_where_before_group_by() {
        let meta = vec![date_filter("date_from", "date", FilterOperator::Gte)];
        let values = FilterValues::from([("date_from".to_string(), json!("2024-01-01"))]);
        let result = build_filtered_query(
            "SELECT region, SUM(revenue) FROM daily_metrics GROUP BY region",
            &meta,
            &values,
        );
        assert!(
            result.sql.contains("WHERE date >= $1 GROUP BY region"),
            "got: {}",
            result.sql
        );
        assert_eq!(result.params, vec![json!("2024-01-01")]);
    }

    #[test]
    fn test_appends_to_existing_where() {
        let meta = vec![equality_filter_meta("region", "region", None, None)];
        let values = FilterValues::from([("region".to_string(), json!("West"))]);
        let result = build_filtered_query(
            "SELECT * FROM orders WHERE status = 'active'",
            &meta,
            &values,
        );
        assert!(
            result
                .sql
                .contains("WHERE status = 'active' AND region = $1"),
            "got: {}",
            result.sql
        );
        assert_eq!(result.params, vec![json!("West")]);
    }

    #[test]
    fn test_ignores_where_inside_subquery() {
        let meta = vec![equality_filter_meta("region", "region", None, None)];
        let values = FilterValues::from([("region".to_string(), json!("West"))]);
        let sql = "SELECT * FROM (SELECT * FROM orders WHERE status = 'active') o";
        let result = build_filtered_query(sql, &meta, &values);
        // The subquery WHERE is at depth 1, so a fresh top-level WHERE is added.
        assert_eq!(
            result.sql,
            "SELECT * FROM (SELECT * FROM orders WHERE status = 'active') o WHERE region = $1"
        );
    }

    #[test]
    fn test_ignores_keywords_inside_string_literals() {
        let meta = vec![equality_filter_meta("region", "region", None, None)];
        let values = FilterValues::from([("region".to_string(), json!("West"))]);
        let sql = "SELECT 'where clause' AS label FROM orders";
        let result = build_filtered_query(sql, &meta, &values);
        assert_eq!(
            result.sql,
            "SELECT 'where clause' AS label FROM orders WHERE region = $1"
        );
    }

    #[test]
    fn test_terminator_after_where_respected() {
        let meta = vec![equality_filter_meta("region", "region", None, None)];
        let values = FilterValues::from([("region".to_string(), json!("West"))]);
        let sql = "SELECT region, COUNT(*) FROM orders WHERE status = 'active' GROUP BY region ORDER BY region LIMIT 10";
        let result = build_filtered_query(sql, &meta, &values);
        assert!(
            result.sql.contains(
                "WHERE status = 'active' AND region = $1 GROUP BY region ORDER BY region LIMIT 10"
            ),
            "got: {}",
            result.sql
        );
    }

    #[test]
    fn test_between_consumes_two_params() {
        let meta = vec![date_filter("range", "order_date", FilterOperator::Between)];
        let values =
            FilterValues::from([("range".to_string(), json!(["2024-01-01", "2024-06-30"]))]);
        let result = build_filtered_query("SELECT * FROM orders", &meta, &values);
        assert_eq!(
            result.sql,
            "SELECT * FROM orders WHERE order_date BETWEEN $1 AND $2"
        );
        assert_eq!(result.params.len(), 2);
    }

    #[test]
    fn test_in_list_consumes_one_param_per_element() {
        let meta = vec![FilterMeta {
            id: "region".to_string(),
            column: "region".to_string(),
            operator: FilterOperator::In,
            filter_type: FilterType::Text,
            table: None,
        }];
        let values =
            FilterValues::from([("region".to_string(), json!(["West", "East", "North"]))]);
        let result = build_filtered_query("SELECT * FROM orders", &meta, &values);
        assert_eq!(
            result.sql,
            "SELECT * FROM orders WHERE region IN ($1, $2, $3)"
        );
        assert_eq!(
            result.params,
            vec![json!("West"), json!("East"), json!("North")]
        );
    }

    #[test]
    fn test_table_qualifier() {
        let meta = vec![FilterMeta {
            id: "region".to_string(),
            column: "region".to_string(),
            operator: FilterOperator::Eq,
            filter_type: FilterType::Text,
            table: Some("o".to_string()),
        }];
        let values = FilterValues::from([("region".to_string(), json!("West"))]);
        let result = build_filtered_query("SELECT * FROM orders o", &meta, &values);
        assert_eq!(result.sql, "SELECT * FROM orders o WHERE o.region = $1");
    }

    #[test]
    fn test_param_count_matches_placeholder_count() {
        let meta = vec![
            date_filter("date_from", "order_date", FilterOperator::Gte),
            date_filter("date_to", "order_date", FilterOperator::Lte),
            FilterMeta {
                id: "regions".to_string(),
                column: "region".to_string(),
                operator: FilterOperator::In,
                filter_type: FilterType::Text,
                table: None,
            },
            FilterMeta {
                id: "amount".to_string(),
                column: "amount".to_string(),
                operator: FilterOperator::Between,
                filter_type: FilterType::Number,
                table: None,
            },
            equality_filter_meta("missing", "status", None, None),
        ];
        let values = FilterValues::from([
            ("date_from".to_string(), json!("2024-01-01")),
            ("date_to".to_string(), json!("2024-12-31")),
            ("regions".to_string(), json!(["West", "East"])),
            ("amount".to_string(), json!([10, 500])),
        ]);
        let result = build_filtered_query(
            "SELECT region, SUM(amount) FROM orders GROUP BY region",
            &meta,
            &values,
        );
        assert_eq!(count_placeholders(&result.sql), result.params.len());
        assert_eq!(result.params.len(), 6);
    }

    #[test]
    fn test_no_surviving_filters_is_a_noop() {
        let meta = vec![
            equality_filter_meta("region", "region", None, None),
            equality_filter_meta("status", "status", None, None),
        ];
        let values = FilterValues::from([
            ("region".to_string(), json!("")),
            ("status".to_string(), Value::Null),
        ]);
        let result = build_filtered_query("SELECT * FROM orders;", &meta, &values);
        assert_eq!(result.sql, "SELECT * FROM orders");
        assert!(result.params.is_empty());
        assert!(result.where_clause.is_empty());
    }

    #[test]
    fn test_values_never_appear_in_sql() {
        let hostile = "West'; DROP TABLE orders; --";
        let meta = vec![equality_filter_meta("region", "region", None, None)];
        let values = FilterValues::from([("region".to_string(), json!(hostile))]);
        let result = build_filtered_query("SELECT * FROM orders", &meta, &values);
        assert!(!result.sql.contains(hostile));
        assert!(!result.sql.contains("DROP"));
        assert_eq!(result.params, vec![json!(hostile)]);
    }

    #[test]
    fn test_invalid_column_is_skipped() {
        let meta = vec![equality_filter_meta(
            "bad",
            "region; DROP TABLE orders",
            None,
            None,
        )];
        let values = FilterValues::from([("bad".to_string(), json!("x"))]);
        let result = build_filtered_query("SELECT * FROM orders", &meta, &values);
        assert_eq!(result.sql, "SELECT * FROM orders");
        assert!(result.params.is_empty());
    }

    #[test]
    fn test_number_cast() {
        let meta = vec![FilterMeta {
            id: "min".to_string(),
            column: "amount".to_string(),
            operator: FilterOperator::Gte,
            filter_type: FilterType::Number,
            table: None,
        }];
        let values = FilterValues::from([("min".to_string(), json!("42.5"))]);
        let result = build_filtered_query("SELECT * FROM orders", &meta, &values);
        assert_eq!(result.params, vec![json!(42.5)]);

        // Unparseable numbers degrade to a null parameter, not an error.
        let values = FilterValues::from([("min".to_string(), json!("not-a-number"))]);
        let result = build_filtered_query("SELECT * FROM orders", &meta, &values);
        assert_eq!(result.params, vec![Value::Null]);
    }

    #[test]
    fn test_boolean_cast() {
        let meta = vec![FilterMeta {
            id: "active".to_string(),
            column: "active".to_string(),
            operator: FilterOperator::Eq,
            filter_type: FilterType::Boolean,
            table: None,
        }];
        for (raw, expected) in [
            (json!("true"), true),
            (json!("1"), true),
            (json!("yes"), false),
            (json!(true), true),
        ] {
            let values = FilterValues::from([("active".to_string(), raw)]);
            let result = build_filtered_query("SELECT * FROM orders", &meta, &values);
            assert_eq!(result.params, vec![json!(expected)]);
        }
    }

    #[test]
    fn test_date_range_constructor() {
        let pair = date_range_filter_meta("order_date", Some("o"));
        assert_eq!(pair.len(), 2);
        assert_eq!(pair[0].id, "date_from");
        assert_eq!(pair[0].operator, FilterOperator::Gte);
        assert_eq!(pair[1].id, "date_to");
        assert_eq!(pair[1].operator, FilterOperator::Lte);
        assert_eq!(pair[0].table.as_deref(), Some("o"));
    }

    #[test]
    fn test_validate_filter_meta_reports_all_violations() {
        let meta = vec![
            equality_filter_meta("region", "region", None, None),
            equality_filter_meta("region", "region", None, None),
            equality_filter_meta("", "status", None, None),
            equality_filter_meta("bad", "not a column", None, None),
        ];
        let violations = validate_filter_meta(&meta);
        assert_eq!(violations.len(), 3);
        assert!(violations.iter().any(|v| v.contains("duplicate")));
        assert!(violations.iter().any(|v| v.contains("empty id")));
        assert!(violations.iter().any(|v| v.contains("not a valid identifier")));
    }

    #[test]
    fn test_union_terminator() {
        let meta = vec![equality_filter_meta("region", "region", None, None)];
        let values = FilterValues::from([("region".to_string(), json!("West"))]);
        let sql = "SELECT id FROM orders UNION SELECT id FROM archived_orders";
        let result = build_filtered_query(sql, &meta, &values);
        assert_eq!(
            result.sql,
            "SELECT id FROM orders WHERE region = $1 UNION SELECT id FROM archived_orders"
        );
    }
}
