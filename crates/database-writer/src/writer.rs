//! The conflict-aware database writer.
//!
//! A [`DatabaseWriter`] applies the row events of one batch at a time:
//!
//! ```text
//! open ──► (start_table ──► write* ──► end_table)* ──► close(in_error)
//! ```
//!
//! Rows are applied strictly in the order received. Per-batch state lives in a
//! [`BatchSession`] so the writer itself only holds the connection and the
//! collaborators shared between batches.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use sync_core::{
    abbreviate_values, Batch, Column, ConflictPolicy, DataEventType, DetectConflict, RowEvent,
    TableName, TableShape,
};
use sync_dml::{DmlStatement, DmlType, StatementBuilder};
use tracing::{debug, error, info, warn};

use crate::cache::TargetTableCache;
use crate::connection::{Connection, DbError, TableIntrospector};
use crate::error::WriterError;
use crate::filter::{FilterContext, WriterFilter};
use crate::keys::{changed_columns, keys_for, usable_keys, KeyOperation};
use crate::policy::{ConfiguredPolicies, ConflictPolicyProvider};
use crate::resolver::{ConflictResolver, DefaultConflictResolver, FallbackWriter, LoadStatus};
use crate::settings::{CommitPolicy, WriterSettings};
use crate::statistics::WriterStatistics;

/// Payloads are cut to this many characters in failure logs.
const MAX_LOGGED_PAYLOAD: usize = 1000;

// ============================================================================
// Session state
// ============================================================================

/// Resolved table for the rows currently being written.
#[derive(Debug, Clone)]
struct TableContext {
    source: Arc<TableShape>,
    target: Arc<TableShape>,
    /// Source index of every target column.
    positions: Arc<Vec<Option<usize>>>,
    policy: Arc<ConflictPolicy>,
    /// Target is missing; rows only pass through the filters.
    handled_by_filter: bool,
}

/// What a prepared statement was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StatementSignature {
    dml_type: DmlType,
    table: String,
    columns: Vec<String>,
    keys: Vec<String>,
    null_keys: Vec<bool>,
}

impl StatementSignature {
    fn new(
        dml_type: DmlType,
        table: &TableName,
        keys: &[Column],
        columns: &[Column],
        null_keys: &[bool],
    ) -> Self {
        Self {
            dml_type,
            table: table.key(),
            columns: columns.iter().map(|c| c.name.clone()).collect(),
            keys: keys.iter().map(|c| c.name.clone()).collect(),
            null_keys: null_keys.to_vec(),
        }
    }
}

#[derive(Debug)]
struct PreparedState {
    signature: StatementSignature,
    statement: Arc<DmlStatement>,
}

/// State of one batch between [`DatabaseWriter::open`] and
/// [`DatabaseWriter::close`].
#[derive(Debug)]
pub struct BatchSession {
    batch_id: i64,
    node_id: String,
    channel_id: String,
    statistics: WriterStatistics,
    uncommitted: u64,
    skip_rows: u64,
    table: Option<TableContext>,
    prepared: Option<PreparedState>,
    last_statement: Option<String>,
    /// Line whose delete already counted as missing.
    missing_delete_line: Option<u64>,
}

impl BatchSession {
    fn new(batch: &Batch) -> Self {
        Self {
            batch_id: batch.batch_id,
            node_id: batch.node_id.clone(),
            channel_id: batch.channel_id.clone(),
            statistics: WriterStatistics {
                start_time: Some(Utc::now()),
                ..WriterStatistics::default()
            },
            uncommitted: 0,
            skip_rows: 0,
            table: None,
            prepared: None,
            last_statement: None,
            missing_delete_line: None,
        }
    }

    /// Treats the first `rows` events as already applied.
    ///
    /// Used when retrying a batch whose leading rows were committed early.
    pub fn skip_leading_rows(&mut self, rows: u64) {
        self.skip_rows = rows;
    }

    pub fn batch_id(&self) -> i64 {
        self.batch_id
    }

    pub fn statistics(&self) -> &WriterStatistics {
        &self.statistics
    }

    /// 1-based index of the last event handed to `write`.
    pub fn line_number(&self) -> u64 {
        self.statistics.line_number
    }

    /// SQL of the last statement prepared or executed.
    pub fn last_statement(&self) -> Option<&str> {
        self.last_statement.as_deref()
    }

    fn filter_context(&self) -> FilterContext<'_> {
        FilterContext {
            batch_id: self.batch_id,
            node_id: &self.node_id,
            channel_id: &self.channel_id,
        }
    }

    fn table_context(&self) -> Result<TableContext, WriterError> {
        self.table.clone().ok_or(WriterError::TableNotStarted)
    }
}

// ============================================================================
// Writer
// ============================================================================

/// Applies batches of row events to one target connection.
pub struct DatabaseWriter<C: Connection> {
    connection: C,
    builder: StatementBuilder,
    introspector: Arc<dyn TableIntrospector>,
    table_cache: Arc<TargetTableCache>,
    policies: Arc<dyn ConflictPolicyProvider>,
    resolver: Option<Arc<dyn ConflictResolver>>,
    filters: Vec<Arc<dyn WriterFilter>>,
    settings: WriterSettings,
    /// Targets already reported missing since the cache generation below.
    missing_tables: HashSet<String>,
    missing_generation: u64,
}

impl<C: Connection> DatabaseWriter<C> {
    pub fn new(
        connection: C,
        introspector: Arc<dyn TableIntrospector>,
        settings: WriterSettings,
    ) -> Self {
        let mut builder = StatementBuilder::new(connection.dialect());
        if !settings.quote_identifiers {
            builder = builder.without_quoted_identifiers();
        }
        Self {
            connection,
            builder,
            introspector,
            table_cache: Arc::new(TargetTableCache::default()),
            policies: Arc::new(ConfiguredPolicies::default()),
            resolver: Some(Arc::new(DefaultConflictResolver::new())),
            filters: Vec::new(),
            settings,
            missing_tables: HashSet::new(),
            missing_generation: 0,
        }
    }

    /// Shares a table cache with other writers on the same target.
    pub fn with_table_cache(mut self, cache: Arc<TargetTableCache>) -> Self {
        self.missing_generation = cache.generation();
        self.table_cache = cache;
        self
    }

    pub fn with_policy_provider(mut self, policies: Arc<dyn ConflictPolicyProvider>) -> Self {
        self.policies = policies;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Every conflict fails the batch.
    pub fn without_resolver(mut self) -> Self {
        self.resolver = None;
        self
    }

    pub fn with_filter(mut self, filter: Arc<dyn WriterFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn settings(&self) -> &WriterSettings {
        &self.settings
    }

    pub fn table_cache(&self) -> &Arc<TargetTableCache> {
        &self.table_cache
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    #[cfg(test)]
    pub(crate) fn missing_table_count(&self) -> usize {
        self.missing_tables.len()
    }

    // ------------------------------------------------------------------------
    // Batch lifecycle
    // ------------------------------------------------------------------------

    /// Begins the batch transaction.
    pub async fn open(&mut self, batch: &Batch) -> Result<BatchSession, WriterError> {
        debug!(
            "Opening batch {} from node {} on channel {}",
            batch.batch_id, batch.node_id, batch.channel_id
        );
        let mut session = BatchSession::new(batch);
        let started = Instant::now();
        let result = self.connection.begin().await;
        session.statistics.database_millis += elapsed_millis(started);
        result?;
        Ok(session)
    }

    /// Resolves the target table for `source`.
    ///
    /// Returns `false` when the target has no such table and no filter claims
    /// it; the caller must skip the table's rows.
    pub async fn start_table(
        &mut self,
        session: &mut BatchSession,
        source: &TableShape,
    ) -> Result<bool, WriterError> {
        source.validate()?;
        session.table = None;
        session.prepared = None;

        let source = Arc::new(source.clone());
        let lookup = self.target_name(&source.name);
        let key = TargetTableCache::key_for(&source);

        let target = match self.table_cache.get(&key) {
            Some(target) => Some(target),
            None => {
                let started = Instant::now();
                let found = self.introspector.lookup_table(&lookup).await;
                session.statistics.database_millis += elapsed_millis(started);
                found?.map(|table| {
                    let reconciled = Arc::new(
                        table.reconcile_with_source(&source, self.settings.use_primary_keys_from_source),
                    );
                    self.table_cache.put(key, Arc::clone(&reconciled));
                    reconciled
                })
            }
        };

        let generation = self.table_cache.generation();
        if generation != self.missing_generation {
            self.missing_tables.clear();
            self.missing_generation = generation;
        }

        let (target, handled_by_filter) = match target {
            Some(target) => (target, false),
            None => {
                let ctx = session.filter_context();
                let claimed = self
                    .filters
                    .iter()
                    .fold(false, |claimed, f| f.handles_missing_table(&ctx, &source) || claimed);
                if !claimed {
                    if self.missing_tables.insert(lookup.key()) {
                        warn!(
                            "Did not find the {} table in the target database; its rows will be skipped",
                            lookup
                        );
                    }
                    return Ok(false);
                }
                debug!("Table {} is missing at the target but handled by a filter", lookup);
                (
                    Arc::new(source.reconcile_with_source(&source, true)),
                    true,
                )
            }
        };

        let policy = self
            .policies
            .policy_for(&session.channel_id, &target.name, session.batch_id);
        let positions = target.source_positions(&source);

        session.table = Some(TableContext {
            source,
            target,
            positions: Arc::new(positions),
            policy: Arc::new(policy),
            handled_by_filter,
        });
        Ok(true)
    }

    /// Applies one event.
    ///
    /// Returns [`LoadStatus::Conflict`] when a conflict was detected and
    /// resolved; unresolved conflicts surface as [`WriterError::Conflict`].
    pub async fn write(
        &mut self,
        session: &mut BatchSession,
        event: &RowEvent,
    ) -> Result<LoadStatus, WriterError> {
        session.statistics.line_number += 1;
        if session.statistics.line_number <= session.skip_rows {
            session.statistics.skip_count += 1;
            return Ok(LoadStatus::Success);
        }
        session.statistics.row_count += 1;
        session.statistics.byte_count += event.byte_size();

        match self.dispatch(session, event).await {
            Ok(status) => {
                session.uncommitted += 1;
                self.check_early_commit(session).await?;
                Ok(status)
            }
            Err(error) => {
                let propagate = {
                    let ctx = session.filter_context();
                    let table = session.table.as_ref().map(|t| t.target.as_ref());
                    self.filters
                        .iter()
                        .fold(true, |keep, f| f.handle_error(&ctx, table, event, &error) && keep)
                };
                if !propagate {
                    debug!(
                        "Error at line {} of batch {} was handled by a filter: {}",
                        session.statistics.line_number, session.batch_id, error
                    );
                    session.statistics.ignore_row_count += 1;
                    session.uncommitted += 1;
                    return Ok(LoadStatus::Success);
                }
                self.log_failure(session, event, &error);
                Err(error)
            }
        }
    }

    /// Closes table-scoped state.
    pub fn end_table(&mut self, session: &mut BatchSession) {
        session.table = None;
        session.prepared = None;
    }

    /// Commits (or, `in_error`, rolls back) the batch transaction.
    pub async fn close(
        &mut self,
        mut session: BatchSession,
        in_error: bool,
    ) -> Result<WriterStatistics, WriterError> {
        session.table = None;
        session.prepared = None;

        if in_error {
            let started = Instant::now();
            if let Err(e) = self.connection.rollback().await {
                warn!("Failed to roll back batch {}: {}", session.batch_id, e);
            }
            session.statistics.database_millis += elapsed_millis(started);
            let ctx = session.filter_context();
            self.filters.iter().for_each(|f| f.batch_rolled_back(&ctx));
        } else {
            {
                let ctx = session.filter_context();
                self.filters.iter().for_each(|f| f.batch_complete(&ctx));
            }
            let started = Instant::now();
            let result = self.connection.commit().await;
            session.statistics.database_millis += elapsed_millis(started);
            if let Err(e) = result {
                error!("Failed to commit batch {}: {}", session.batch_id, e);
                if let Err(rollback) = self.connection.rollback().await {
                    warn!("Failed to roll back batch {}: {}", session.batch_id, rollback);
                }
                return Err(e.into());
            }
            session.statistics.committed_rows += session.uncommitted;
            session.uncommitted = 0;
            let ctx = session.filter_context();
            self.filters.iter().for_each(|f| f.batch_committed(&ctx));
        }

        session.statistics.finish_time = Some(Utc::now());
        debug!(
            "Closed batch {} ({} rows, {} ms in database)",
            session.batch_id, session.statistics.row_count, session.statistics.database_millis
        );
        Ok(session.statistics)
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    async fn dispatch(
        &mut self,
        session: &mut BatchSession,
        event: &RowEvent,
    ) -> Result<LoadStatus, WriterError> {
        let context = if event.event_type().requires_table() {
            let ctx = session.table_context()?;
            Self::validate_event(&ctx, event)?;
            if !self.before_write(session, &ctx.target, event) {
                return Ok(LoadStatus::Success);
            }
            Some(ctx)
        } else {
            None
        };

        let status = match event {
            _ if context.as_ref().is_some_and(|t| t.handled_by_filter) => LoadStatus::Success,
            RowEvent::Insert { .. } => self.insert(session, event).await?,
            RowEvent::Update { .. } => {
                let apply_changes_only = self.settings.apply_changes_only;
                self.update(session, event, apply_changes_only, true).await?
            }
            RowEvent::Delete { .. } => self.delete(session, event, true).await?,
            RowEvent::RawSql { sql } => {
                self.sql(session, sql).await?;
                LoadStatus::Success
            }
            RowEvent::CreateSchema { table } => {
                self.create(session, table).await?;
                LoadStatus::Success
            }
        };

        if status == LoadStatus::Conflict {
            self.resolve(session, event).await?;
        }

        if let Some(ctx) = &context {
            let started = Instant::now();
            let filter_ctx = session.filter_context();
            self.filters
                .iter()
                .for_each(|f| f.after_write(&filter_ctx, &ctx.target, event));
            session.statistics.filter_millis += elapsed_millis(started);
        }
        Ok(status)
    }

    fn validate_event(ctx: &TableContext, event: &RowEvent) -> Result<(), WriterError> {
        let expected = ctx.source.column_count();
        for values in [event.row(), event.old()].into_iter().flatten() {
            if values.len() != expected {
                return Err(WriterError::ColumnCountMismatch {
                    table: ctx.source.name.to_string(),
                    expected,
                    actual: values.len(),
                });
            }
        }
        if let Some(pk) = event.pk() {
            let expected = ctx.source.primary_key_count();
            if expected > 0 && pk.len() != expected {
                return Err(WriterError::PkCountMismatch {
                    table: ctx.source.name.to_string(),
                    expected,
                    actual: pk.len(),
                });
            }
        }
        Ok(())
    }

    fn before_write(&self, session: &mut BatchSession, target: &TableShape, event: &RowEvent) -> bool {
        if self.filters.is_empty() {
            return true;
        }
        let started = Instant::now();
        let allowed = {
            let ctx = session.filter_context();
            self.filters
                .iter()
                .fold(true, |ok, f| f.before_write(&ctx, target, event) && ok)
        };
        session.statistics.filter_millis += elapsed_millis(started);
        allowed
    }

    async fn resolve(&mut self, session: &mut BatchSession, event: &RowEvent) -> Result<(), WriterError> {
        let ctx = session.table_context()?;
        match self.resolver.clone() {
            Some(resolver) => {
                let mut handle = WriterHandle {
                    writer: self,
                    session,
                };
                resolver.resolve(&mut handle, event, &ctx.policy).await
            }
            None => Err(WriterError::Conflict {
                table: ctx.target.name.to_string(),
                event_type: event.event_type(),
                conflict_id: ctx.policy.id().to_string(),
                fallback: false,
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Row operations
    // ------------------------------------------------------------------------

    async fn insert(&mut self, session: &mut BatchSession, event: &RowEvent) -> Result<LoadStatus, WriterError> {
        let ctx = session.table_context()?;
        let row = event.row().unwrap_or(&[]);

        let (columns, values): (Vec<Column>, Vec<Option<String>>) = ctx
            .target
            .columns
            .iter()
            .zip(ctx.positions.iter())
            .filter_map(|(column, position)| {
                position.map(|index| (column.clone(), row.get(index).cloned().flatten()))
            })
            .unzip();

        let (dml_type, keys, key_values) = if self.settings.insert_ignores_duplicates {
            let dialect = self.builder.dialect();
            let (keys, key_values): (Vec<Column>, Vec<Option<String>>) = ctx
                .target
                .columns
                .iter()
                .zip(ctx.positions.iter())
                .filter(|(column, _)| column.primary_key && dialect.can_use_in_where(column))
                .filter_map(|(column, position)| {
                    position.map(|index| (column.clone(), row.get(index).cloned().flatten()))
                })
                .unzip();
            (DmlType::InsertIgnore, keys, key_values)
        } else {
            (DmlType::Insert, Vec::new(), Vec::new())
        };
        let null_keys: Vec<bool> = key_values.iter().map(Option::is_none).collect();
        let key_values: Vec<Option<String>> = key_values.into_iter().filter(Option::is_some).collect();

        let statement = self
            .ensure_prepared(session, dml_type, &ctx.target, &keys, &columns, &null_keys)
            .await?;
        let values = statement.value_array(&values, &key_values);

        match self.execute(session, &values).await {
            Ok(0) => Ok(LoadStatus::Conflict),
            Ok(_) => {
                session.statistics.insert_count += 1;
                Ok(LoadStatus::Success)
            }
            Err(e) if e.is_unique_violation() => {
                debug!("Insert into {} hit a unique constraint: {}", ctx.target.name, e);
                Ok(LoadStatus::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(
        &mut self,
        session: &mut BatchSession,
        event: &RowEvent,
        apply_changes_only: bool,
        use_conflict_detection: bool,
    ) -> Result<LoadStatus, WriterError> {
        let ctx = session.table_context()?;
        let changed = changed_columns(
            event,
            &ctx.source,
            &ctx.target,
            &ctx.positions,
            apply_changes_only,
            self.builder.dialect(),
        );
        if changed.is_empty() {
            debug!(
                "Not running update for {} because no columns changed",
                ctx.target.name
            );
            return Ok(LoadStatus::Success);
        }

        let detect = Self::effective_detection(&ctx, use_conflict_detection);
        let changed_cols: Vec<Column> = changed.iter().map(|(c, _)| c.clone()).collect();
        let keys = self.lookup_keys(&ctx, &detect, KeyOperation::Update, &changed_cols, event)?;
        let (keys, key_values, null_keys) = Self::key_values(&ctx, &detect, keys, event)?;

        let statement = self
            .ensure_prepared(session, DmlType::Update, &ctx.target, &keys, &changed_cols, &null_keys)
            .await?;
        let row = event.row().unwrap_or(&[]);
        let column_values: Vec<Option<String>> = changed
            .iter()
            .map(|(_, index)| row.get(*index).cloned().flatten())
            .collect();
        let values = statement.value_array(&column_values, &key_values);

        match self.execute(session, &values).await {
            Ok(0) => Ok(LoadStatus::Conflict),
            Ok(_) => {
                session.statistics.update_count += 1;
                Ok(LoadStatus::Success)
            }
            Err(e) if e.is_unique_violation() || e.is_foreign_key_violation() => {
                debug!("Update of {} hit a constraint: {}", ctx.target.name, e);
                Ok(LoadStatus::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(
        &mut self,
        session: &mut BatchSession,
        event: &RowEvent,
        use_conflict_detection: bool,
    ) -> Result<LoadStatus, WriterError> {
        let ctx = session.table_context()?;
        let detect = Self::effective_detection(&ctx, use_conflict_detection);
        let keys = self.lookup_keys(&ctx, &detect, KeyOperation::Delete, &[], event)?;
        let (keys, key_values, null_keys) = Self::key_values(&ctx, &detect, keys, event)?;

        let statement = self
            .ensure_prepared(session, DmlType::Delete, &ctx.target, &keys, &[], &null_keys)
            .await?;
        let values = statement.value_array(&[], &key_values);

        match self.execute(session, &values).await {
            Ok(0) => {
                let line = session.statistics.line_number;
                if session.missing_delete_line != Some(line) {
                    session.missing_delete_line = Some(line);
                    session.statistics.missing_delete_count += 1;
                }
                Ok(LoadStatus::Conflict)
            }
            Ok(_) => {
                session.statistics.delete_count += 1;
                Ok(LoadStatus::Success)
            }
            Err(e) if e.is_foreign_key_violation() => {
                debug!("Delete from {} hit a foreign key: {}", ctx.target.name, e);
                Ok(LoadStatus::Conflict)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn sql(&mut self, session: &mut BatchSession, sql: &str) -> Result<(), WriterError> {
        debug!("Running sql from batch {}: {}", session.batch_id, sql);
        session.prepared = None;
        session.last_statement = Some(sql.to_string());
        let started = Instant::now();
        let result = self.connection.execute_sql(sql).await;
        session.statistics.database_millis += elapsed_millis(started);
        let affected = result?;
        session.statistics.sql_count += 1;
        session.statistics.sql_rows_affected += affected;
        Ok(())
    }

    async fn create(&mut self, session: &mut BatchSession, table: &TableShape) -> Result<(), WriterError> {
        table.validate()?;
        let mut target = table.clone();
        target.name = self.target_name(&table.name);
        info!("Applying structural change to {}", target.name);

        session.prepared = None;
        session.last_statement = None;
        let started = Instant::now();
        let result = self.connection.apply_table(&target).await;
        session.statistics.database_millis += elapsed_millis(started);
        result.map_err(|source| WriterError::CreateTable {
            table: target.name.to_string(),
            source,
        })?;

        self.table_cache.invalidate(&table.name);
        self.missing_tables.remove(&target.name.key());
        session.statistics.create_count += 1;

        let current = session
            .table
            .as_ref()
            .filter(|ctx| ctx.source.name.key() == table.name.key())
            .map(|ctx| Arc::clone(&ctx.source));
        if let Some(source) = current {
            self.start_table(session, &source).await?;
        }
        Ok(())
    }

    /// Current target value of `column` for the event's row, located by
    /// primary key. `None` when the row is absent.
    async fn current_value(
        &mut self,
        session: &mut BatchSession,
        event: &RowEvent,
        column: &str,
    ) -> Result<Option<Option<String>>, WriterError> {
        let ctx = session.table_context()?;
        let Some(target_column) = ctx.target.column(column).cloned() else {
            return Ok(None);
        };
        let detect = DetectConflict::UsePkData;
        let keys = self.lookup_keys(&ctx, &detect, KeyOperation::Delete, &[], event)?;
        let (keys, key_values, null_keys) = Self::key_values(&ctx, &detect, keys, event)?;
        let statement = self.builder.build_with_null_keys(
            DmlType::Select,
            &ctx.target,
            &keys,
            std::slice::from_ref(&target_column),
            &null_keys,
        )?;
        let values = statement.value_array(&[], &key_values);

        let started = Instant::now();
        let result = self.connection.query_row(&statement, &values).await;
        session.statistics.database_millis += elapsed_millis(started);
        Ok(result?.map(|row| row.into_iter().next().flatten()))
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn target_name(&self, source: &TableName) -> TableName {
        let mut name = source.clone();
        if let Some(catalog) = &self.settings.target_catalog {
            name.catalog = Some(catalog.clone());
        }
        if let Some(schema) = &self.settings.target_schema {
            name.schema = Some(schema.clone());
        }
        name
    }

    fn effective_detection(ctx: &TableContext, use_conflict_detection: bool) -> DetectConflict {
        if use_conflict_detection {
            ctx.policy.detect.clone()
        } else {
            DetectConflict::UsePkData
        }
    }

    fn lookup_keys(
        &self,
        ctx: &TableContext,
        detect: &DetectConflict,
        operation: KeyOperation,
        changed: &[Column],
        event: &RowEvent,
    ) -> Result<Vec<Column>, WriterError> {
        if let Some(column) = detect.version_column() {
            if ctx.target.column(column).is_none() {
                error!(
                    "Conflict detection column {} is missing from {}; locating rows by primary key",
                    column, ctx.target.name
                );
            }
        }
        let keys = keys_for(operation, detect, &ctx.target, changed, event.old().is_some());
        let keys = usable_keys(
            keys,
            &ctx.target,
            &ctx.policy.excluded_columns,
            self.builder.dialect(),
        );
        if keys.is_empty() {
            return Err(WriterError::NoKeyColumns {
                table: ctx.target.name.to_string(),
                operation: event.event_type(),
            });
        }
        Ok(keys)
    }

    /// Lookup keys whose previous value is known, their bound values (nulls
    /// removed) and the null flag of every kept key.
    ///
    /// Keys with an unknown previous value are dropped. When any were dropped
    /// the remaining keys must still include a target key column.
    fn key_values(
        ctx: &TableContext,
        detect: &DetectConflict,
        keys: Vec<Column>,
        event: &RowEvent,
    ) -> Result<(Vec<Column>, Vec<Option<String>>, Vec<bool>), WriterError> {
        let mut kept = Vec::with_capacity(keys.len());
        let mut bound = Vec::with_capacity(keys.len());
        let mut null_keys = Vec::with_capacity(keys.len());
        let mut unknown = None;
        for key in keys {
            let is_source_key = ctx
                .source
                .column(&key.name)
                .map(|c| c.primary_key)
                .unwrap_or(false);
            let value = if *detect == DetectConflict::UsePkData && is_source_key {
                event.key_value(&ctx.source, &key.name)
            } else {
                event.previous_value(&ctx.source, &key.name)
            };
            match value {
                Some(Some(v)) => {
                    bound.push(Some(v.to_string()));
                    null_keys.push(false);
                    kept.push(key);
                }
                Some(None) => {
                    null_keys.push(true);
                    kept.push(key);
                }
                None => {
                    debug!(
                        "Previous value of {} in {} is unknown; not using it to locate the row",
                        key.name, ctx.target.name
                    );
                    if unknown.is_none() {
                        unknown = Some(key.name);
                    }
                }
            }
        }
        if kept.is_empty() || (unknown.is_some() && !kept.iter().any(|k| k.primary_key)) {
            return Err(match unknown {
                Some(column) => WriterError::UnknownKeyValue {
                    table: ctx.target.name.to_string(),
                    column,
                },
                None => WriterError::NoKeyColumns {
                    table: ctx.target.name.to_string(),
                    operation: event.event_type(),
                },
            });
        }
        Ok((kept, bound, null_keys))
    }

    /// Builds and prepares a statement unless the prepared one already has the
    /// same shape.
    async fn ensure_prepared(
        &mut self,
        session: &mut BatchSession,
        dml_type: DmlType,
        target: &TableShape,
        keys: &[Column],
        columns: &[Column],
        null_keys: &[bool],
    ) -> Result<Arc<DmlStatement>, WriterError> {
        let signature = StatementSignature::new(dml_type, &target.name, keys, columns, null_keys);
        if let Some(prepared) = &session.prepared {
            if prepared.signature == signature {
                return Ok(Arc::clone(&prepared.statement));
            }
        }

        let statement = Arc::new(
            self.builder
                .build_with_null_keys(dml_type, target, keys, columns, null_keys)?,
        );
        session.last_statement = Some(statement.sql().to_string());
        session.prepared = None;

        let started = Instant::now();
        let result = self.connection.prepare(&statement).await;
        session.statistics.database_millis += elapsed_millis(started);
        result?;

        session.prepared = Some(PreparedState {
            signature,
            statement: Arc::clone(&statement),
        });
        Ok(statement)
    }

    async fn execute(&mut self, session: &mut BatchSession, values: &[Option<String>]) -> Result<u64, DbError> {
        let started = Instant::now();
        let result = self.connection.execute(values).await;
        session.statistics.database_millis += elapsed_millis(started);
        result
    }

    async fn check_early_commit(&mut self, session: &mut BatchSession) -> Result<(), WriterError> {
        let CommitPolicy::EarlyCommit { max_rows, sleep } = self.settings.commit_policy else {
            return Ok(());
        };
        if max_rows == 0 || session.uncommitted < max_rows {
            return Ok(());
        }

        let started = Instant::now();
        let committed = self.connection.commit().await;
        session.statistics.database_millis += elapsed_millis(started);
        committed?;

        let rows = session.uncommitted;
        session.statistics.committed_rows += rows;
        session.uncommitted = 0;
        info!(
            "Committed {} rows early in batch {} ({} so far)",
            rows, session.batch_id, session.statistics.committed_rows
        );
        {
            let ctx = session.filter_context();
            self.filters.iter().for_each(|f| f.early_commit(&ctx, rows));
        }

        if !sleep.is_zero() {
            tokio::time::sleep(sleep).await;
        }

        let started = Instant::now();
        let begun = self.connection.begin().await;
        session.statistics.database_millis += elapsed_millis(started);
        begun?;
        Ok(())
    }

    fn log_failure(&self, session: &BatchSession, event: &RowEvent, error: &WriterError) {
        let table = session
            .table
            .as_ref()
            .map(|t| t.target.name.to_string())
            .unwrap_or_else(|| "none".to_string());
        error!(
            "Failed to process {} event in batch {} on channel '{}' at line {} for table {}: {}",
            event.event_type(),
            session.batch_id,
            session.channel_id,
            session.statistics.line_number,
            table,
            error
        );
        if let Some(sql) = &session.last_statement {
            error!("Failed sql was: {}", sql);
        }
        match event {
            RowEvent::RawSql { .. } | RowEvent::CreateSchema { .. } => {}
            _ => {
                if let Some(pk) = event.pk() {
                    error!("Failed pk data was: {}", abbreviate_values(Some(pk), MAX_LOGGED_PAYLOAD));
                }
                if let Some(row) = event.row() {
                    error!("Failed row data was: {}", abbreviate_values(Some(row), MAX_LOGGED_PAYLOAD));
                }
                if let Some(old) = event.old() {
                    error!("Failed old data was: {}", abbreviate_values(Some(old), MAX_LOGGED_PAYLOAD));
                }
            }
        }
        if let Some(db) = error.db_error() {
            error!(
                "Failed sql state and code: {} ({})",
                db.sql_state.as_deref().unwrap_or("none"),
                db.code
            );
        }
        if event.event_type() == DataEventType::Create {
            error!("Structural change could not be applied; the batch will be rolled back");
        }
    }
}

fn elapsed_millis(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

// ============================================================================
// Resolver access
// ============================================================================

/// Borrows a writer and its session for the duration of one resolution.
struct WriterHandle<'a, C: Connection> {
    writer: &'a mut DatabaseWriter<C>,
    session: &'a mut BatchSession,
}

#[async_trait]
impl<C: Connection> FallbackWriter for WriterHandle<'_, C> {
    fn batch_id(&self) -> i64 {
        self.session.batch_id
    }

    fn line_number(&self) -> u64 {
        self.session.statistics.line_number
    }

    fn source_table(&self) -> Option<&TableShape> {
        self.session.table.as_ref().map(|t| t.source.as_ref())
    }

    fn target_table(&self) -> Option<&TableShape> {
        self.session.table.as_ref().map(|t| t.target.as_ref())
    }

    fn settings(&self) -> &WriterSettings {
        &self.writer.settings
    }

    fn statistics_mut(&mut self) -> &mut WriterStatistics {
        &mut self.session.statistics
    }

    async fn insert(&mut self, event: &RowEvent) -> Result<LoadStatus, WriterError> {
        self.writer.insert(self.session, event).await
    }

    async fn update(
        &mut self,
        event: &RowEvent,
        apply_changes_only: bool,
        use_conflict_detection: bool,
    ) -> Result<LoadStatus, WriterError> {
        self.writer
            .update(self.session, event, apply_changes_only, use_conflict_detection)
            .await
    }

    async fn delete(
        &mut self,
        event: &RowEvent,
        use_conflict_detection: bool,
    ) -> Result<LoadStatus, WriterError> {
        self.writer
            .delete(self.session, event, use_conflict_detection)
            .await
    }

    async fn current_value(
        &mut self,
        event: &RowEvent,
        column: &str,
    ) -> Result<Option<Option<String>>, WriterError> {
        self.writer.current_value(self.session, event, column).await
    }
}
