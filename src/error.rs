use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Invalid query length: {0}")]
    InvalidQueryLength(String),

    #[error("Disallowed operation: {0}")]
    DisallowedOperation(String),

    #[error("Only SELECT statements are allowed, got: {0}")]
    NotASelect(String),

    #[error("Invalid filter metadata: {}", .0.join("; "))]
    InvalidFilterMetadata(Vec<String>),

    #[error("Table not found: {0}")]
    TableNotFound(String),

    #[error("Unsupported SQL syntax: {0}")]
    UnsupportedSyntax(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, QueryError>;
