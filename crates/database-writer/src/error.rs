//! Writer errors.

use sync_core::{DataEventType, SchemaError};
use sync_dml::StatementError;

use crate::connection::DbError;

/// Errors surfaced by the writer.
///
/// Conflicts that a resolver absorbs never appear here; [`WriterError::Conflict`]
/// means resolution chose to fail (or no resolver was registered).
#[derive(Debug, Clone, thiserror::Error)]
pub enum WriterError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error(transparent)]
    Statement(#[from] StatementError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("Detected conflict while executing {event_type} on {table} (conflict {conflict_id}, fallback attempted: {fallback})")]
    Conflict {
        table: String,
        event_type: DataEventType,
        conflict_id: String,
        fallback: bool,
    },

    #[error("Batch {0} was ignored by conflict resolution")]
    IgnoreBatch(i64),

    #[error("The ({table}) table's column count ({expected}) does not match the data's column count ({actual})")]
    ColumnCountMismatch {
        table: String,
        expected: usize,
        actual: usize,
    },

    #[error("The ({table}) table's pk column count ({expected}) does not match the data's pk column count ({actual})")]
    PkCountMismatch {
        table: String,
        expected: usize,
        actual: usize,
    },

    #[error("There are no keys defined for {table}. Cannot build {operation} statement")]
    NoKeyColumns { table: String, operation: DataEventType },

    #[error("The previous value of key column {column} in {table} is unknown")]
    UnknownKeyValue { table: String, column: String },

    #[error("No table has been started for this batch")]
    TableNotStarted,

    #[error("Failed to apply structural change to {table}: {source}")]
    CreateTable {
        table: String,
        #[source]
        source: DbError,
    },
}

impl WriterError {
    /// Database diagnostics carried by the error, if any.
    pub fn db_error(&self) -> Option<&DbError> {
        match self {
            WriterError::Database(e) => Some(e),
            WriterError::CreateTable { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, WriterError::Conflict { .. })
    }
}
