//! Hooks around row writes.

use sync_core::{RowEvent, TableShape};

use crate::error::WriterError;

/// Batch identity handed to filters.
#[derive(Debug, Clone, Copy)]
pub struct FilterContext<'a> {
    pub batch_id: i64,
    pub node_id: &'a str,
    pub channel_id: &'a str,
}

/// Observes or vetoes rows as they are written.
///
/// Every method has a no-op default.
pub trait WriterFilter: Send + Sync {
    /// Returning `false` skips the row.
    fn before_write(&self, _ctx: &FilterContext<'_>, _table: &TableShape, _event: &RowEvent) -> bool {
        true
    }

    fn after_write(&self, _ctx: &FilterContext<'_>, _table: &TableShape, _event: &RowEvent) {}

    /// Claims rows for a table missing at the target.
    fn handles_missing_table(&self, _ctx: &FilterContext<'_>, _table: &TableShape) -> bool {
        false
    }

    /// Returning `false` swallows the error; the row counts as ignored.
    fn handle_error(
        &self,
        _ctx: &FilterContext<'_>,
        _table: Option<&TableShape>,
        _event: &RowEvent,
        _error: &WriterError,
    ) -> bool {
        true
    }

    fn early_commit(&self, _ctx: &FilterContext<'_>, _rows: u64) {}

    fn batch_complete(&self, _ctx: &FilterContext<'_>) {}

    fn batch_committed(&self, _ctx: &FilterContext<'_>) {}

    fn batch_rolled_back(&self, _ctx: &FilterContext<'_>) {}
}
