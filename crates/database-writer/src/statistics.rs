//! Per-batch writer statistics.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sync_core::Batch;

/// Counters accumulated while one batch is written.
///
/// Read-only for telemetry once the batch is closed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WriterStatistics {
    /// Events handed to `write`, including skipped ones.
    pub line_number: u64,
    /// Events processed (not skipped).
    pub row_count: u64,
    pub insert_count: u64,
    pub update_count: u64,
    pub delete_count: u64,
    pub sql_count: u64,
    pub sql_rows_affected: u64,
    pub create_count: u64,
    pub fallback_insert_count: u64,
    pub fallback_update_count: u64,
    pub missing_delete_count: u64,
    pub ignore_row_count: u64,
    pub skip_count: u64,
    pub byte_count: u64,
    /// Rows made durable by commits so far.
    pub committed_rows: u64,
    pub database_millis: u64,
    pub filter_millis: u64,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
}

impl WriterStatistics {
    pub fn elapsed_millis(&self) -> u64 {
        match (self.start_time, self.finish_time) {
            (Some(start), Some(finish)) => (finish - start).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }

    /// Copies load counters onto a batch record.
    pub fn apply_to(&self, batch: &mut Batch) {
        let c = &mut batch.counters;
        c.load_count += 1;
        c.load_row_count = self.row_count as i64;
        c.load_insert_row_count = self.insert_count as i64;
        c.load_update_row_count = self.update_count as i64;
        c.load_delete_row_count = self.delete_count as i64;
        c.other_row_count = (self.sql_count + self.create_count) as i64;
        c.fallback_insert_count = self.fallback_insert_count as i64;
        c.fallback_update_count = self.fallback_update_count as i64;
        c.missing_delete_count = self.missing_delete_count as i64;
        c.ignore_row_count = self.ignore_row_count as i64;
        c.skip_count = self.skip_count as i64;
        c.committed_row_count = self.committed_rows as i64;
        c.byte_count = c.byte_count.max(self.byte_count as i64);
        c.database_millis = self.database_millis as i64;
        c.filter_millis = self.filter_millis as i64;
        c.load_millis = self.elapsed_millis() as i64;
    }
}
