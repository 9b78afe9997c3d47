//! Loading one outgoing batch into a target database.
//!
//! [`BatchApplier`] ties the writer to the batch record:
//!
//! 1. the batch moves to `LD` and is persisted
//! 2. every table's events go through the [`DatabaseWriter`]
//! 3. the writer's statistics are copied onto the batch
//! 4. the batch is persisted as `OK`, `IG` (ignored by conflict resolution)
//!    or `ER` with the failing row number, statement and SQL diagnostics
//!
//! A batch retried from `ER` skips the rows an earlier attempt already
//! committed through early commits.

use database_writer::{BatchSession, Connection, DatabaseWriter, WriterError, WriterStatistics};
use outgoing_batch::OutgoingBatchService;
use std::sync::Arc;
use sync_core::{Batch, BatchStatus, RowEvent, TableShape};
use tracing::{debug, error, info, warn};

/// Events of one source table, in capture order.
#[derive(Debug, Clone)]
pub struct TableEvents {
    pub table: TableShape,
    pub events: Vec<RowEvent>,
}

impl TableEvents {
    pub fn new(table: TableShape, events: Vec<RowEvent>) -> Self {
        Self { table, events }
    }
}

/// Applies batches through one writer and records the outcome.
pub struct BatchApplier<C: Connection> {
    writer: DatabaseWriter<C>,
    service: Arc<OutgoingBatchService>,
}

impl<C: Connection> BatchApplier<C> {
    pub fn new(writer: DatabaseWriter<C>, service: Arc<OutgoingBatchService>) -> Self {
        Self { writer, service }
    }

    pub fn writer(&self) -> &DatabaseWriter<C> {
        &self.writer
    }

    /// Loads `tables` as the content of `batch` and returns the status the
    /// batch was left in.
    ///
    /// Load failures are recorded on the batch, not returned; `Err` means the
    /// batch record itself could not be updated.
    pub async fn apply(
        &mut self,
        batch: &mut Batch,
        tables: &[TableEvents],
    ) -> anyhow::Result<BatchStatus> {
        let already_committed = if batch.status == BatchStatus::Error {
            u64::try_from(batch.counters.committed_row_count).unwrap_or(0)
        } else {
            0
        };
        batch.transition(BatchStatus::Loading)?;
        batch.clear_failure();
        self.service.update_batch(batch).await?;
        info!(
            "Loading batch {} from node {} on channel {} ({} tables)",
            batch.batch_id,
            batch.node_id,
            batch.channel_id,
            tables.len()
        );
        if already_committed > 0 {
            info!(
                "Skipping {} rows of batch {} committed by an earlier attempt",
                already_committed, batch.batch_id
            );
        }

        let mut session = match self.writer.open(batch).await {
            Ok(session) => session,
            Err(e) => {
                self.record_failure(batch, &e, 0, None)?;
                self.service.update_batch(batch).await?;
                return Ok(batch.status);
            }
        };
        session.skip_leading_rows(already_committed);

        let written = self.write_tables(&mut session, tables).await;
        let line_number = session.line_number();
        let last_statement = session.last_statement().map(str::to_string);

        match written {
            Ok(()) => match self.writer.close(session, false).await {
                Ok(statistics) => {
                    Self::copy_statistics(batch, &statistics, already_committed);
                    batch.transition(BatchStatus::Ok)?;
                    info!(
                        "Loaded batch {}: {} rows in {} ms",
                        batch.batch_id,
                        statistics.row_count,
                        statistics.elapsed_millis()
                    );
                }
                Err(e) => self.record_failure(batch, &e, line_number, last_statement)?,
            },
            Err(e) => {
                match self.writer.close(session, true).await {
                    Ok(statistics) => Self::copy_statistics(batch, &statistics, already_committed),
                    Err(close) => warn!("Failed to close batch {}: {}", batch.batch_id, close),
                }
                if let WriterError::IgnoreBatch(_) = e {
                    info!("Batch {} ignored by conflict resolution", batch.batch_id);
                    batch.transition(BatchStatus::Ignored)?;
                } else {
                    self.record_failure(batch, &e, line_number, last_statement)?;
                }
            }
        }

        self.service.update_batch(batch).await?;
        Ok(batch.status)
    }

    async fn write_tables(
        &mut self,
        session: &mut BatchSession,
        tables: &[TableEvents],
    ) -> Result<(), WriterError> {
        for table in tables {
            let mut started = self.writer.start_table(session, &table.table).await?;
            let mut skipped = 0usize;
            for event in &table.events {
                match event {
                    RowEvent::CreateSchema { .. } => {
                        self.writer.write(session, event).await?;
                        started = self.writer.start_table(session, &table.table).await?;
                    }
                    _ if started || !event.event_type().requires_table() => {
                        self.writer.write(session, event).await?;
                    }
                    _ => skipped += 1,
                }
            }
            if skipped > 0 {
                debug!("Skipped {} rows for missing table {}", skipped, table.table.name);
            }
            self.writer.end_table(session);
        }
        Ok(())
    }

    fn copy_statistics(batch: &mut Batch, statistics: &WriterStatistics, already_committed: u64) {
        statistics.apply_to(batch);
        batch.counters.committed_row_count += already_committed as i64;
    }

    fn record_failure(
        &self,
        batch: &mut Batch,
        error: &WriterError,
        line_number: u64,
        last_statement: Option<String>,
    ) -> anyhow::Result<()> {
        let (sql_state, sql_code) = error
            .db_error()
            .map(|db| (db.sql_state.clone(), db.code))
            .unwrap_or((None, 0));
        error!(
            "Failed to load batch {} at row {}: {}",
            batch.batch_id, line_number, error
        );
        batch.record_failure(
            sql_state,
            sql_code,
            error.to_string(),
            line_number as i64,
            last_statement,
        )?;
        Ok(())
    }
}
