//! Contracts the writer needs from a target database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use sync_core::{RowValues, TableName, TableShape};
use sync_dml::{Dialect, DmlStatement};

/// Classification of a database error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorKind {
    UniqueViolation,
    ForeignKeyViolation,
    Other,
}

/// Database error with the vendor diagnostics the batch record keeps.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (sql state: {}, code: {code})", .sql_state.as_deref().unwrap_or("none"))]
pub struct DbError {
    pub kind: DbErrorKind,
    pub sql_state: Option<String>,
    pub code: i32,
    pub message: String,
}

impl DbError {
    pub fn new(kind: DbErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            sql_state: None,
            code: 0,
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(DbErrorKind::Other, message)
    }

    pub fn with_sql_state(mut self, sql_state: impl Into<String>) -> Self {
        self.sql_state = Some(sql_state.into());
        self
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = code;
        self
    }

    pub fn is_unique_violation(&self) -> bool {
        self.kind == DbErrorKind::UniqueViolation
    }

    pub fn is_foreign_key_violation(&self) -> bool {
        self.kind == DbErrorKind::ForeignKeyViolation
    }
}

/// One transactional connection to the target database.
///
/// Values are bound as text (`None` for `NULL`); dialects insert the casts the
/// database needs.
#[async_trait]
pub trait Connection: Send {
    fn dialect(&self) -> Arc<dyn Dialect>;

    async fn begin(&mut self) -> Result<(), DbError>;

    async fn commit(&mut self) -> Result<(), DbError>;

    async fn rollback(&mut self) -> Result<(), DbError>;

    /// Prepares `statement`; later [`execute`](Self::execute) calls bind to it.
    async fn prepare(&mut self, statement: &DmlStatement) -> Result<(), DbError>;

    /// Executes the prepared statement, returning the affected row count.
    async fn execute(&mut self, values: &[Option<String>]) -> Result<u64, DbError>;

    /// Runs a select/count statement and returns its first row as text.
    async fn query_row(
        &mut self,
        statement: &DmlStatement,
        values: &[Option<String>],
    ) -> Result<Option<RowValues>, DbError>;

    /// Executes literal SQL inside the current transaction.
    async fn execute_sql(&mut self, sql: &str) -> Result<u64, DbError>;

    /// Creates `table`, or alters the existing table to add missing columns.
    async fn apply_table(&mut self, table: &TableShape) -> Result<(), DbError>;

    async fn server_time(&mut self) -> Result<DateTime<Utc>, DbError>;
}

/// Reads table shapes from the target database.
#[async_trait]
pub trait TableIntrospector: Send + Sync {
    async fn lookup_table(&self, name: &TableName) -> Result<Option<TableShape>, DbError>;
}
