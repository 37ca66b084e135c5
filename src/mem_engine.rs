//! In-memory query engine.
//!
//! Interprets a constrained SELECT grammar directly over the rows held in a
//! `TableStore`, for sessions with no real database attached. The statement
//! is re-parsed on every call; there is no persistent AST. Driven by
//! unvalidated AI-generated SQL, so unknown columns degrade to nulls rather
//! than erroring — only an unknown table or a statement outside the grammar
//! is reported back.

use crate::error::{QueryError, Result};
use crate::filter_injection::find_depth0_keyword;
use crate::table_store::{InMemoryTable, Row, TableStore};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use strsim::jaro_winkler;
use tracing::info;

/// Shape documented back to the caller on an unsupported statement.
const SUPPORTED_SYNTAX: &str = "SELECT <columns> FROM <table> \
     [WHERE <col> <op> <value> [AND ...]] [GROUP BY <col>] \
     [ORDER BY <col> [ASC|DESC]] [LIMIT <n>]";

/// Similarity floor for "did you mean" table suggestions.
const SUGGESTION_THRESHOLD: f64 = 0.84;

lazy_static! {
    static ref TABLE_NAME: Regex = Regex::new(r"(?s)^\s*([A-Za-z_][A-Za-z0-9_]*)(.*)$").unwrap();
    static ref AGGREGATE_ITEM: Regex = Regex::new(
        r"(?i)^(COUNT|SUM|AVG|MIN|MAX)\s*\(\s*(\*|[A-Za-z_][\w.]*)\s*\)(?:\s+AS\s+([A-Za-z_]\w*))?$"
    )
    .unwrap();
    static ref COLUMN_ITEM: Regex =
        Regex::new(r"(?i)^([A-Za-z_][\w.]*)(?:\s+AS\s+([A-Za-z_]\w*))?$").unwrap();
    static ref CONDITION_IN: Regex =
        Regex::new(r"(?is)^([A-Za-z_][\w.]*)\s+IN\s*\((.*)\)$").unwrap();
    static ref CONDITION_LIKE: Regex =
        Regex::new(r"(?is)^([A-Za-z_][\w.]*)\s+LIKE\s+(.+)$").unwrap();
    static ref CONDITION_COMPARE: Regex =
        Regex::new(r"(?s)^([A-Za-z_][\w.]*)\s*(>=|<=|!=|<>|=|>|<)\s*(.+)$").unwrap();
    static ref ORDER_CLAUSE: Regex =
        Regex::new(r"(?i)^([A-Za-z_][\w.]*)(?:\s+(ASC|DESC))?$").unwrap();
    static ref GROUP_CLAUSE: Regex = Regex::new(r"^[A-Za-z_][\w.]*$").unwrap();
}

/// Result of an in-memory query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOutput {
    pub rows: Vec<Row>,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AggregateFunc {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone)]
enum SelectItem {
    Star,
    Column {
        name: String,
        alias: Option<String>,
    },
    Aggregate {
        func: AggregateFunc,
        /// `None` means `COUNT(*)`.
        column: Option<String>,
        alias: Option<String>,
        /// Item text as written, used as the output name when unaliased.
        raw: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Neq,
    Gt,
    Lt,
    Gte,
    Lte,
    Like,
    In,
}

#[derive(Debug, Clone)]
enum ConditionValue {
    Scalar(String),
    List(Vec<String>),
}

#[derive(Debug, Clone)]
struct Condition {
    column: String,
    op: CompareOp,
    value: ConditionValue,
}

#[derive(Debug)]
struct Statement {
    items: Vec<SelectItem>,
    table: String,
    conditions: Vec<Condition>,
    group_by: Option<String>,
    order_by: Option<(String, bool)>,
    limit: Option<usize>,
}

/// Interpreter over a shared table store.
pub struct MemoryQueryEngine {
    store: Arc<TableStore>,
}

impl MemoryQueryEngine {
    pub fn new(store: Arc<TableStore>) -> Self {
        Self { store }
    }

    /// Execute one SELECT statement against the registered tables.
    pub fn query(&self, sql: &str) -> Result<QueryOutput> {
        info!("🔍 executing in-memory query: {}", sql);
        let statement = parse_statement(sql)?;
        let table = self.lookup_table(&statement.table)?;

        let mut rows: Vec<Row> = table
            .rows
            .iter()
            .filter(|row| {
                statement
                    .conditions
                    .iter()
                    .all(|condition| evaluate_condition(row, condition))
            })
            .cloned()
            .collect();

        let has_aggregates = statement
            .items
            .iter()
            .any(|item| matches!(item, SelectItem::Aggregate { .. }));

        let aggregate_columns;
        if has_aggregates {
            let (aggregated, columns) = aggregate_rows(&statement, rows)?;
            rows = aggregated;
            aggregate_columns = Some(columns);
        } else {
            aggregate_columns = None;
        }

        if let Some((column, descending)) = &statement.order_by {
            sort_rows(&mut rows, column, *descending);
        }
        if let Some(limit) = statement.limit {
            rows.truncate(limit);
        }

        let (rows, columns) = match aggregate_columns {
            Some(columns) => (rows, columns),
            None => project_rows(rows, &statement.items, &table),
        };

        info!("✅ in-memory query returned {} row(s)", rows.len());
        Ok(QueryOutput { rows, columns })
    }

    /// Exact lookup, then case-insensitive, then a descriptive error listing
    /// what is actually registered.
    fn lookup_table(&self, name: &str) -> Result<InMemoryTable> {
        if let Some(table) = self.store.table(name) {
            return Ok(table);
        }
        if let Some(table) = self.store.table_ignore_case(name) {
            return Ok(table);
        }

        let names = self.store.table_names();
        let available = if names.is_empty() {
            "none".to_string()
        } else {
            names.join(", ")
        };
        let suggestion = names
            .iter()
            .map(|candidate| {
                (
                    candidate,
                    jaro_winkler(&candidate.to_lowercase(), &name.to_lowercase()),
                )
            })
            .filter(|(_, score)| *score > SUGGESTION_THRESHOLD)
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
            .map(|(candidate, _)| format!(" (did you mean '{}'?)", candidate))
            .unwrap_or_default();

        Err(QueryError::TableNotFound(format!(
            "table '{}' not found; available tables: {}{}",
            name, available, suggestion
        )))
    }
}

fn unsupported(reason: &str) -> QueryError {
    QueryError::UnsupportedSyntax(format!(
        "{}. Supported format: {}",
        reason, SUPPORTED_SYNTAX
    ))
}

fn parse_statement(sql: &str) -> Result<Statement> {
    let text = sql.trim();
    let text = text.strip_suffix(';').unwrap_or(text).trim_end();

    if !text
        .get(..6)
        .map_or(false, |head| head.eq_ignore_ascii_case("select"))
    {
        return Err(unsupported("statement must start with SELECT"));
    }

    let from_pos = find_depth0_keyword(text, 0, &["FROM"])
        .ok_or_else(|| unsupported("missing FROM clause"))?;
    let select_list = text[6..from_pos].trim();
    if select_list.is_empty() {
        return Err(unsupported("empty SELECT list"));
    }
    let items = parse_select_items(select_list)?;

    let after_from = &text[from_pos + "FROM".len()..];
    let captures = TABLE_NAME
        .captures(after_from)
        .ok_or_else(|| unsupported("missing or invalid table name after FROM"))?;
    let table = captures[1].to_string();
    let rest = captures.get(2).map_or("", |m| m.as_str());

    let mut markers: Vec<(usize, &str)> = Vec::new();
    for keyword in ["WHERE", "GROUP BY", "ORDER BY", "LIMIT"] {
        if let Some(position) = find_depth0_keyword(rest, 0, &[keyword]) {
            markers.push((position, keyword));
        }
    }
    markers.sort_by_key(|(position, _)| *position);

    let head_end = markers.first().map_or(rest.len(), |(position, _)| *position);
    if !rest[..head_end].trim().is_empty() {
        return Err(unsupported("unexpected tokens after the table name"));
    }

    let mut conditions = Vec::new();
    let mut group_by = None;
    let mut order_by = None;
    let mut limit = None;

    for (index, (position, keyword)) in markers.iter().enumerate() {
        let clause_start = keyword_end(rest, *position, keyword);
        let clause_end = markers
            .get(index + 1)
            .map_or(rest.len(), |(next, _)| *next);
        let clause = rest[clause_start..clause_end].trim();

        match *keyword {
            "WHERE" => conditions = parse_conditions(clause)?,
            "GROUP BY" => {
                if !GROUP_CLAUSE.is_match(clause) {
                    return Err(unsupported("GROUP BY accepts a single column"));
                }
                group_by = Some(clause.to_string());
            }
            "ORDER BY" => {
                let captures = ORDER_CLAUSE
                    .captures(clause)
                    .ok_or_else(|| unsupported("ORDER BY accepts a single column"))?;
                let descending = captures
                    .get(2)
                    .map_or(false, |d| d.as_str().eq_ignore_ascii_case("DESC"));
                order_by = Some((captures[1].to_string(), descending));
            }
            "LIMIT" => {
                limit = Some(
                    clause
                        .parse::<usize>()
                        .map_err(|_| unsupported("LIMIT requires a non-negative integer"))?,
                );
            }
            _ => {}
        }
    }

    Ok(Statement {
        items,
        table,
        conditions,
        group_by,
        order_by,
        limit,
    })
}

fn parse_select_items(select_list: &str) -> Result<Vec<SelectItem>> {
    let mut items = Vec::new();
    for part in split_top_level(select_list, ',') {
        if part == "*" {
            items.push(SelectItem::Star);
        } else if let Some(captures) = AGGREGATE_ITEM.captures(&part) {
            let func = match captures[1].to_uppercase().as_str() {
                "COUNT" => AggregateFunc::Count,
                "SUM" => AggregateFunc::Sum,
                "AVG" => AggregateFunc::Avg,
                "MIN" => AggregateFunc::Min,
                _ => AggregateFunc::Max,
            };
            let argument = captures[2].to_string();
            let column = if argument == "*" {
                if func != AggregateFunc::Count {
                    return Err(unsupported("only COUNT accepts * as its argument"));
                }
                None
            } else {
                Some(argument)
            };
            // Output name when unaliased is the call text as written.
            let raw = match part.find(')') {
                Some(close) => part[..=close].to_string(),
                None => part.clone(),
            };
            items.push(SelectItem::Aggregate {
                func,
                column,
                alias: captures.get(3).map(|a| a.as_str().to_string()),
                raw,
            });
        } else if let Some(captures) = COLUMN_ITEM.captures(&part) {
            items.push(SelectItem::Column {
                name: captures[1].to_string(),
                alias: captures.get(2).map(|a| a.as_str().to_string()),
            });
        } else {
            return Err(unsupported(&format!("unsupported select item {:?}", part)));
        }
    }

    let has_aggregates = items
        .iter()
        .any(|item| matches!(item, SelectItem::Aggregate { .. }));
    if has_aggregates && items.iter().any(|item| matches!(item, SelectItem::Star)) {
        return Err(unsupported("* cannot be mixed with aggregate functions"));
    }
    Ok(items)
}

fn parse_conditions(clause: &str) -> Result<Vec<Condition>> {
    if clause.is_empty() {
        return Err(unsupported("empty WHERE clause"));
    }

    let mut segments = Vec::new();
    let mut cursor = 0;
    while let Some(position) = find_depth0_keyword(clause, cursor, &["AND"]) {
        segments.push(clause[cursor..position].trim().to_string());
        cursor = keyword_end(clause, position, "AND");
    }
    segments.push(clause[cursor..].trim().to_string());

    segments
        .into_iter()
        .map(|segment| parse_condition(&segment))
        .collect()
}

fn parse_condition(segment: &str) -> Result<Condition> {
    if let Some(captures) = CONDITION_IN.captures(segment) {
        let items = captures[2]
            .split(',')
            .map(|item| unquote(item.trim()).to_string())
            .collect();
        return Ok(Condition {
            column: captures[1].to_string(),
            op: CompareOp::In,
            value: ConditionValue::List(items),
        });
    }
    if let Some(captures) = CONDITION_LIKE.captures(segment) {
        return Ok(Condition {
            column: captures[1].to_string(),
            op: CompareOp::Like,
            value: ConditionValue::Scalar(unquote(captures[2].trim()).to_string()),
        });
    }
    if let Some(captures) = CONDITION_COMPARE.captures(segment) {
        let op = match &captures[2] {
            "=" => CompareOp::Eq,
            "!=" | "<>" => CompareOp::Neq,
            ">" => CompareOp::Gt,
            "<" => CompareOp::Lt,
            ">=" => CompareOp::Gte,
            _ => CompareOp::Lte,
        };
        return Ok(Condition {
            column: captures[1].to_string(),
            op,
            value: ConditionValue::Scalar(unquote(captures[3].trim()).to_string()),
        });
    }
    Err(unsupported(&format!(
        "unsupported WHERE condition {:?}",
        segment
    )))
}

/// Split on a delimiter at parenthesis depth 0, outside quoted strings.
fn split_top_level(text: &str, delimiter: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut in_string = false;

    for c in text.chars() {
        match c {
            '\'' => {
                in_string = !in_string;
                current.push(c);
            }
            '(' if !in_string => {
                depth += 1;
                current.push(c);
            }
            ')' if !in_string => {
                depth -= 1;
                current.push(c);
            }
            c if c == delimiter && depth == 0 && !in_string => {
                parts.push(current.trim().to_string());
                current.clear();
            }
            c => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}

/// Byte offset just past a keyword match, tolerating internal whitespace
/// runs in multi-word keywords.
fn keyword_end(text: &str, position: usize, keyword: &str) -> usize {
    let bytes = text.as_bytes();
    let mut cursor = position;
    for (index, word) in keyword.split_whitespace().enumerate() {
        if index > 0 {
            while cursor < bytes.len() && bytes[cursor].is_ascii_whitespace() {
                cursor += 1;
            }
        }
        cursor += word.len();
    }
    cursor
}

fn unquote(text: &str) -> &str {
    let text = text.trim();
    if text.len() >= 2
        && ((text.starts_with('\'') && text.ends_with('\''))
            || (text.starts_with('"') && text.ends_with('"')))
    {
        &text[1..text.len() - 1]
    } else {
        text
    }
}

fn evaluate_condition(row: &Row, condition: &Condition) -> bool {
    let lhs = row.get(&condition.column).filter(|v| !v.is_null());

    match (&condition.op, &condition.value) {
        (CompareOp::In, ConditionValue::List(items)) => {
            items.iter().any(|item| values_equal(lhs, item))
        }
        (CompareOp::Like, ConditionValue::Scalar(pattern)) => match lhs {
            Some(value) => match like_to_regex(pattern) {
                Some(re) => re.is_match(&value_text(value)),
                None => false,
            },
            None => false,
        },
        (CompareOp::Eq, ConditionValue::Scalar(rhs)) => values_equal(lhs, rhs),
        (CompareOp::Neq, ConditionValue::Scalar(rhs)) => !values_equal(lhs, rhs),
        (op, ConditionValue::Scalar(rhs)) => {
            let Some(value) = lhs else {
                return false;
            };
            let ordering = match (value_number(value), rhs.trim().parse::<f64>().ok()) {
                (Some(left), Some(right)) => match left.partial_cmp(&right) {
                    Some(ordering) => ordering,
                    None => return false,
                },
                _ => value_text(value).as_str().cmp(rhs.as_str()),
            };
            match op {
                CompareOp::Gt => ordering == Ordering::Greater,
                CompareOp::Lt => ordering == Ordering::Less,
                CompareOp::Gte => ordering != Ordering::Less,
                CompareOp::Lte => ordering != Ordering::Greater,
                _ => false,
            }
        }
        _ => false,
    }
}

fn values_equal(lhs: Option<&Value>, rhs: &str) -> bool {
    let Some(value) = lhs else {
        return false;
    };
    if let (Some(left), Ok(right)) = (value_number(value), rhs.trim().parse::<f64>()) {
        return left == right;
    }
    value_text(value) == rhs
}

/// Translate a LIKE pattern into an anchored regex; `%` becomes `.*`.
fn like_to_regex(pattern: &str) -> Option<Regex> {
    let mut translated = String::from("(?i)^");
    for c in pattern.chars() {
        if c == '%' {
            translated.push_str(".*");
        } else {
            translated.push_str(&regex::escape(&c.to_string()));
        }
    }
    translated.push('$');
    Regex::new(&translated).ok()
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn value_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// `Number(v)` coercion for aggregate math: null is zero, missing values and
/// unparseable strings are NaN.
fn loose_number(value: Option<&Value>) -> f64 {
    match value {
        None => f64::NAN,
        Some(Value::Null) => 0.0,
        Some(Value::Bool(b)) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Some(Value::Number(n)) => n.as_f64().unwrap_or(f64::NAN),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                0.0
            } else {
                trimmed.parse::<f64>().unwrap_or(f64::NAN)
            }
        }
        Some(_) => f64::NAN,
    }
}

/// Render an f64 as a JSON number, preferring integers for whole values.
fn number_value(value: f64) -> Value {
    if value.is_nan() || value.is_infinite() {
        return Value::Null;
    }
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        return Value::Number(serde_json::Number::from(value as i64));
    }
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn aggregate_rows(statement: &Statement, rows: Vec<Row>) -> Result<(Vec<Row>, Vec<String>)> {
    let columns: Vec<String> = statement
        .items
        .iter()
        .map(|item| match item {
            SelectItem::Column { name, alias } => alias.clone().unwrap_or_else(|| name.clone()),
            SelectItem::Aggregate { alias, raw, .. } => {
                alias.clone().unwrap_or_else(|| raw.clone())
            }
            SelectItem::Star => "*".to_string(),
        })
        .collect();

    let grouped: Vec<(Value, Vec<Row>)> = match &statement.group_by {
        Some(group_column) => {
            let mut order: Vec<String> = Vec::new();
            let mut groups: HashMap<String, (Value, Vec<Row>)> = HashMap::new();
            for row in rows {
                let value = row.get(group_column).cloned().unwrap_or(Value::Null);
                let key = value_text(&value);
                if !groups.contains_key(&key) {
                    order.push(key.clone());
                }
                groups
                    .entry(key)
                    .or_insert_with(|| (value, Vec::new()))
                    .1
                    .push(row);
            }
            order
                .into_iter()
                .filter_map(|key| groups.remove(&key))
                .collect()
        }
        None => vec![(Value::Null, rows)],
    };

    let mut output = Vec::with_capacity(grouped.len());
    for (representative, members) in grouped {
        let mut out_row = Row::new();
        for item in &statement.items {
            match item {
                SelectItem::Column { name, alias } => {
                    let value = match &statement.group_by {
                        Some(group_column) if group_column == name => representative.clone(),
                        _ => members
                            .first()
                            .and_then(|row| row.get(name))
                            .cloned()
                            .unwrap_or(Value::Null),
                    };
                    out_row.insert(alias.clone().unwrap_or_else(|| name.clone()), value);
                }
                SelectItem::Aggregate {
                    func,
                    column,
                    alias,
                    raw,
                } => {
                    out_row.insert(
                        alias.clone().unwrap_or_else(|| raw.clone()),
                        compute_aggregate(*func, column.as_deref(), &members),
                    );
                }
                SelectItem::Star => {}
            }
        }
        output.push(out_row);
    }

    Ok((output, columns))
}

fn compute_aggregate(func: AggregateFunc, column: Option<&str>, rows: &[Row]) -> Value {
    match func {
        AggregateFunc::Count => match column {
            None => Value::Number(serde_json::Number::from(rows.len() as u64)),
            Some(column) => {
                let count = rows
                    .iter()
                    .filter(|row| matches!(row.get(column), Some(v) if !v.is_null()))
                    .count();
                Value::Number(serde_json::Number::from(count as u64))
            }
        },
        AggregateFunc::Sum | AggregateFunc::Avg => {
            let Some(column) = column else {
                return Value::Null;
            };
            let sum: f64 = rows
                .iter()
                .map(|row| {
                    let n = loose_number(row.get(column));
                    if n.is_nan() {
                        0.0
                    } else {
                        n
                    }
                })
                .sum();
            if func == AggregateFunc::Sum {
                number_value(sum)
            } else if rows.is_empty() {
                Value::Null
            } else {
                number_value(sum / rows.len() as f64)
            }
        }
        AggregateFunc::Min | AggregateFunc::Max => {
            let Some(column) = column else {
                return Value::Null;
            };
            if rows.is_empty() {
                return Value::Null;
            }
            let values: Vec<f64> = rows
                .iter()
                .map(|row| loose_number(row.get(column)))
                .collect();
            if values.iter().any(|v| v.is_nan()) {
                return Value::Null;
            }
            let folded = values.into_iter().fold(
                if func == AggregateFunc::Min {
                    f64::INFINITY
                } else {
                    f64::NEG_INFINITY
                },
                |acc, v| {
                    if func == AggregateFunc::Min {
                        acc.min(v)
                    } else {
                        acc.max(v)
                    }
                },
            );
            number_value(folded)
        }
    }
}

/// Sort in place; nulls go last in both directions.
fn sort_rows(rows: &mut [Row], column: &str, descending: bool) {
    rows.sort_by(|a, b| {
        let left = a.get(column).filter(|v| !v.is_null());
        let right = b.get(column).filter(|v| !v.is_null());
        match (left, right) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(l), Some(r)) => {
                let ordering = match (value_number(l), value_number(r)) {
                    (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                    _ => value_text(l).cmp(&value_text(r)),
                };
                if descending {
                    ordering.reverse()
                } else {
                    ordering
                }
            }
        }
    });
}

/// Re-map rows to exactly the requested columns (non-aggregate queries).
fn project_rows(
    rows: Vec<Row>,
    items: &[SelectItem],
    table: &InMemoryTable,
) -> (Vec<Row>, Vec<String>) {
    let mut mapping: Vec<(String, String)> = Vec::new();
    for item in items {
        match item {
            SelectItem::Star => {
                for column in &table.columns {
                    mapping.push((column.name.clone(), column.name.clone()));
                }
            }
            SelectItem::Column { name, alias } => {
                mapping.push((alias.clone().unwrap_or_else(|| name.clone()), name.clone()));
            }
            SelectItem::Aggregate { .. } => {}
        }
    }

    let columns: Vec<String> = mapping.iter().map(|(output, _)| output.clone()).collect();
    let projected = rows
        .into_iter()
        .map(|row| {
            mapping
                .iter()
                .map(|(output, source)| {
                    (
                        output.clone(),
                        row.get(source).cloned().unwrap_or(Value::Null),
                    )
                })
                .collect::<Row>()
        })
        .collect();
    (projected, columns)
}
