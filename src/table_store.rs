//! In-memory table registry.
//!
//! Holds the row collections a user uploads when no real database is
//! attached. The store is an explicit handle owned by the session context;
//! re-adding a name replaces that table wholesale and `clear()` resets the
//! whole store. Column types are inferred once at registration time.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::info;

/// One row: column name → value.
pub type Row = HashMap<String, Value>;

/// Maximum non-null values sampled per column during type inference.
const TYPE_SAMPLE_SIZE: usize = 100;

/// Share of samples a type must reach to win the column.
const TYPE_MAJORITY: f64 = 0.8;

/// Inferred column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Text,
    Number,
    Boolean,
    Date,
    Unknown,
}

/// Schema entry for one column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub inferred_type: ColumnType,
    pub nullable: bool,
}

/// A named, typed row collection standing in for a real database table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InMemoryTable {
    pub name: String,
    pub rows: Vec<Row>,
    pub columns: Vec<ColumnSchema>,
}

/// Registry of uploaded tables.
///
/// Backed by a concurrent map so uploads and queries from different tasks
/// do not need external locking; each `add_table` replaces its entry
/// atomically.
#[derive(Debug, Default)]
pub struct TableStore {
    tables: DashMap<String, InMemoryTable>,
}

impl TableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or wholesale replace) a table from uploaded rows.
    pub fn add_table(&self, name: &str, rows: Vec<Row>) {
        let columns = infer_columns(&rows);
        info!(
            "📋 registered table '{}' ({} rows, {} columns)",
            name,
            rows.len(),
            columns.len()
        );
        self.tables.insert(
            name.to_string(),
            InMemoryTable {
                name: name.to_string(),
                rows,
                columns,
            },
        );
    }

    /// Drop a table. Returns whether it existed.
    pub fn remove_table(&self, name: &str) -> bool {
        self.tables.remove(name).is_some()
    }

    /// Schema of a table, if registered.
    pub fn get_table_schema(&self, name: &str) -> Option<Vec<ColumnSchema>> {
        self.tables.get(name).map(|t| t.columns.clone())
    }

    /// Schemas of every registered table, sorted by table name.
    pub fn all_schemas(&self) -> Vec<(String, Vec<ColumnSchema>)> {
        let mut schemas: Vec<(String, Vec<ColumnSchema>)> = self
            .tables
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().columns.clone()))
            .collect();
        schemas.sort_by(|a, b| a.0.cmp(&b.0));
        schemas
    }

    /// Rows of a table, if registered.
    pub fn table_data(&self, name: &str) -> Option<Vec<Row>> {
        self.tables.get(name).map(|t| t.rows.clone())
    }

    /// Exact-name lookup returning the whole table.
    pub fn table(&self, name: &str) -> Option<InMemoryTable> {
        self.tables.get(name).map(|t| t.value().clone())
    }

    /// Case-insensitive lookup, used as a fallback after an exact miss.
    pub fn table_ignore_case(&self, name: &str) -> Option<InMemoryTable> {
        self.tables
            .iter()
            .find(|entry| entry.key().eq_ignore_ascii_case(name))
            .map(|entry| entry.value().clone())
    }

    /// Registered table names, sorted.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Drop every table (session reset).
    pub fn clear(&self) {
        self.tables.clear();
        info!("🧹 table store cleared");
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// Infer the column schema from uploaded rows.
///
/// Column names are the union over all rows, sorted for a stable order.
/// Each column samples up to `TYPE_SAMPLE_SIZE` non-null values; a type must
/// win at least `TYPE_MAJORITY` of the sample, otherwise the column falls
/// back to text. A column with no non-null values at all is `unknown`.
fn infer_columns(rows: &[Row]) -> Vec<ColumnSchema> {
    let mut names: Vec<String> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !names.iter().any(|n| n == key) {
                names.push(key.clone());
            }
        }
    }
    names.sort();

    names
        .into_iter()
        .map(|name| {
            let mut counts: HashMap<ColumnType, usize> = HashMap::new();
            let mut sampled = 0usize;
            let mut nullable = false;

            for row in rows {
                match row.get(&name) {
                    None | Some(Value::Null) => nullable = true,
                    Some(value) => {
                        if sampled < TYPE_SAMPLE_SIZE {
                            *counts.entry(classify_value(value)).or_insert(0) += 1;
                            sampled += 1;
                        }
                    }
                }
            }

            let inferred_type = if sampled == 0 {
                ColumnType::Unknown
            } else {
                counts
                    .iter()
                    .max_by_key(|(_, count)| **count)
                    .filter(|(_, count)| **count as f64 >= TYPE_MAJORITY * sampled as f64)
                    .map(|(column_type, _)| *column_type)
                    .unwrap_or(ColumnType::Text)
            };

            ColumnSchema {
                name,
                inferred_type,
                nullable,
            }
        })
        .collect()
}

/// Best-guess type of a single value.
fn classify_value(value: &Value) -> ColumnType {
    match value {
        Value::Bool(_) => ColumnType::Boolean,
        Value::Number(_) => ColumnType::Number,
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.eq_ignore_ascii_case("true") || trimmed.eq_ignore_ascii_case("false") {
                ColumnType::Boolean
            } else if trimmed.parse::<f64>().is_ok() {
                ColumnType::Number
            } else if is_date_like(trimmed) {
                ColumnType::Date
            } else {
                ColumnType::Text
            }
        }
        _ => ColumnType::Text,
    }
}

fn is_date_like(s: &str) -> bool {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
        || NaiveDate::parse_from_str(s, "%Y/%m/%d").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S").is_ok()
        || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S").is_ok()
        || DateTime::parse_from_rfc3339(s).is_ok()
}
