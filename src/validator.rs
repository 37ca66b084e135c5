//! Read-only query validation.
//!
//! Allow-list gate applied to raw SQL text right before dispatch. The check
//! runs after filter injection and placeholder cleanup so that injected text
//! is covered by the same rules. Pure text heuristics, no AST.

use crate::error::{QueryError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use tracing::debug;

/// Limits applied to incoming statements.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Maximum statement length in characters.
    pub max_query_length: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_query_length: 5_000,
        }
    }
}

lazy_static! {
    static ref DENIED_KEYWORDS: Regex = Regex::new(
        r"(?i)\b(INSERT|UPDATE|DELETE|DROP|CREATE|ALTER|TRUNCATE|GRANT|REVOKE|EXECUTE|EXEC|CALL)\b"
    )
    .unwrap();
    static ref DENIED_FUNCTIONS: Regex = Regex::new(r"(?i)\b(pg_sleep|pg_read_file)\b").unwrap();
    // A semicolon followed by anything but whitespace means a stacked statement.
    static ref STACKED_STATEMENTS: Regex = Regex::new(r";\s*\S").unwrap();
}

/// Validate a statement with the default limits.
pub fn validate_query(sql: &str) -> Result<()> {
    validate_query_with(sql, &ValidatorConfig::default())
}

/// Validate a statement against an explicit configuration.
pub fn validate_query_with(sql: &str, config: &ValidatorConfig) -> Result<()> {
    let trimmed = sql.trim();

    if trimmed.is_empty() {
        return Err(QueryError::InvalidQueryLength("query is empty".to_string()));
    }
    if sql.chars().count() > config.max_query_length {
        return Err(QueryError::InvalidQueryLength(format!(
            "query is {} characters, maximum is {}",
            sql.chars().count(),
            config.max_query_length
        )));
    }

    if let Some(found) = DENIED_KEYWORDS.find(sql) {
        return Err(QueryError::DisallowedOperation(
            found.as_str().to_uppercase(),
        ));
    }
    if sql.contains("--") || sql.contains("/*") {
        return Err(QueryError::DisallowedOperation("SQL comment".to_string()));
    }
    if STACKED_STATEMENTS.is_match(sql) {
        return Err(QueryError::DisallowedOperation(
            "stacked statements".to_string(),
        ));
    }
    if let Some(found) = DENIED_FUNCTIONS.find(sql) {
        return Err(QueryError::DisallowedOperation(
            found.as_str().to_lowercase(),
        ));
    }

    let upper = trimmed.to_uppercase();
    if !upper.starts_with("SELECT") && !upper.starts_with("WITH") {
        let head: String = trimmed.chars().take(40).collect();
        return Err(QueryError::NotASelect(head));
    }

    debug!("query passed validation ({} chars)", trimmed.len());
    Ok(())
}
