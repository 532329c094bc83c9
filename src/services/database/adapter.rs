// Database adapter trait: the only way the pipeline reaches the target database
use crate::models::{ExecutionResult, SchemaCatalog, ValidatedQuery};
use std::time::Duration;
use thiserror::Error;

/// Driver-level failure, classified before the connector maps it onto the
/// pipeline taxonomy
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DatabaseError {
    /// No pooled connection became free within the pool wait timeout
    #[error("Timed out waiting for a pooled connection: {0}")]
    PoolTimeout(String),

    /// Broken pipe, reset connection and similar faults worth one more try
    #[error("Transient connection fault: {0}")]
    Transient(String),

    /// The engine refused the statement (syntax, types, permissions)
    #[error("{0}")]
    Engine(String),

    /// Cancelled server-side by `statement_timeout`
    #[error("Statement cancelled by the server: {0}")]
    StatementTimeout(String),

    #[error("Database error: {0}")]
    Other(String),
}

impl DatabaseError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DatabaseError::Transient(_))
    }
}

/// Database adapter trait - abstraction layer over the target database
#[async_trait::async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Read tables, columns, keys, comments, row estimates and sample rows of one schema
    async fn load_catalog(&self, schema: &str, sample_rows: usize) -> Result<SchemaCatalog, DatabaseError>;

    /// Execute a validated query read-only, streaming at most `row_cap` rows.
    /// `timeout` is also applied server-side.
    async fn execute_read_only(
        &self,
        query: &ValidatedQuery,
        row_cap: usize,
        timeout: Duration,
    ) -> Result<ExecutionResult, DatabaseError>;

    /// Get database type
    fn database_type(&self) -> &str;

    /// Test connection
    async fn test_connection(&self) -> Result<(), DatabaseError>;
}
