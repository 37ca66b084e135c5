//! Query orchestration.
//!
//! Thin seam between the rewriting components and whatever actually runs the
//! SQL: a real database adapter implementing `QueryExecutor`, or the
//! in-memory engine over uploaded tables. Per request it picks the
//! parameterized metadata path when filter metadata is present, falls back
//! to the legacy placeholder path otherwise, and always gates the final
//! statement through the validator before dispatch.

use crate::error::{QueryError, Result};
use crate::filter_injection::{
    build_filtered_query, validate_filter_meta, FilterMeta, FilterValues,
};
use crate::mem_engine::MemoryQueryEngine;
use crate::placeholders::{
    inject_placeholders, remove_unresolved_conditions, strip_all_unresolved_placeholders,
};
use crate::table_store::{Row, TableStore};
use crate::validator::validate_query;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Execution collaborator for a real database.
///
/// Receives the rewritten SQL together with its positional `$1, $2, ...`
/// bind parameters. Connection pooling, timeouts, and row caps live behind
/// this trait, not in the core.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;
}

/// Where a dispatched query runs.
#[derive(Clone)]
pub enum DataSource {
    External(Arc<dyn QueryExecutor>),
    InMemory(Arc<TableStore>),
}

/// One incoming query request from the dashboard layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    /// The AI-generated SELECT statement.
    pub sql: String,

    /// Structured filter metadata; presence selects the parameterized path.
    #[serde(default)]
    pub filter_meta: Option<Vec<FilterMeta>>,

    /// Values for the structured filters, keyed by filter id.
    #[serde(default)]
    pub filter_values: FilterValues,

    /// Legacy string filters for `{{placeholder}}` substitution.
    #[serde(default)]
    pub legacy_filters: HashMap<String, String>,
}

/// Dispatches rewritten queries to the configured data source.
pub struct QueryDispatcher {
    source: DataSource,
}

impl QueryDispatcher {
    pub fn new(source: DataSource) -> Self {
        Self { source }
    }

    /// Rewrite, validate, and run one request.
    pub async fn run(&self, request: &QueryRequest) -> Result<Vec<Row>> {
        let (sql, params) = match &request.filter_meta {
            Some(meta) => {
                let violations = validate_filter_meta(meta);
                if !violations.is_empty() {
                    return Err(QueryError::InvalidFilterMetadata(violations));
                }
                let filtered = build_filtered_query(&request.sql, meta, &request.filter_values);
                debug!("filter injection produced: {}", filtered.sql);
                (filtered.sql, filtered.params)
            }
            None => {
                let substituted = inject_placeholders(&request.sql, &request.legacy_filters);
                let cleaned = remove_unresolved_conditions(&substituted);
                let stripped = strip_all_unresolved_placeholders(&cleaned);
                debug!("legacy substitution produced: {}", stripped);
                (stripped, Vec::new())
            }
        };

        validate_query(&sql)?;

        match &self.source {
            DataSource::External(executor) => {
                info!("🚀 dispatching to external database ({} params)", params.len());
                executor.execute(&sql, &params).await
            }
            DataSource::InMemory(store) => {
                let inlined = inline_params(&sql, &params);
                info!("🚀 dispatching to in-memory engine");
                let engine = MemoryQueryEngine::new(Arc::clone(store));
                Ok(engine.query(&inlined)?.rows)
            }
        }
    }
}

/// Replace `$n` placeholders with escaped literals for the in-memory engine,
/// which has no bind support. Highest index first so `$12` is not clobbered
/// by `$1`.
fn inline_params(sql: &str, params: &[Value]) -> String {
    let mut result = sql.to_string();
    for (index, value) in params.iter().enumerate().rev() {
        let literal = match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => format!("'{}'", s.replace('\'', "''")),
            other => format!("'{}'", other.to_string().replace('\'', "''")),
        };
        result = result.replace(&format!("${}", index + 1), &literal);
    }
    result
}
