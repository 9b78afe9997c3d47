//! In-memory target database for tests.
//!
//! [`MemoryDatabase`] executes [`DmlStatement`]s structurally: it reads the
//! statement's table, key and value columns rather than parsing SQL. Rows are
//! stored as text, exactly as bound.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use sync_core::{RowValues, TableName, TableShape};
use sync_dml::{Dialect, DmlStatement, DmlType, GenericDialect};

use crate::connection::{Connection, DbError, DbErrorKind, TableIntrospector};

#[derive(Debug, Clone)]
struct MemoryTable {
    shape: TableShape,
    rows: Vec<RowValues>,
}

/// Call counters across every connection of one database.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub prepares: usize,
    pub executes: usize,
}

#[derive(Debug, Default)]
struct DatabaseState {
    tables: BTreeMap<String, MemoryTable>,
    failures: Vec<(String, DbError)>,
    executed_sql: Vec<String>,
    stats: MemoryStats,
}

/// Shared in-memory database.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<DatabaseState>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, DatabaseState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn create_table(&self, shape: TableShape) {
        self.lock().tables.insert(
            shape.name.key(),
            MemoryTable {
                shape,
                rows: Vec::new(),
            },
        );
    }

    /// Inserts a row aligned to the table's own column order.
    pub fn insert_row(&self, name: &TableName, row: RowValues) {
        if let Some(table) = self.lock().tables.get_mut(&name.key()) {
            table.rows.push(row);
        }
    }

    pub fn rows(&self, name: &TableName) -> Vec<RowValues> {
        self.lock()
            .tables
            .get(&name.key())
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn table(&self, name: &TableName) -> Option<TableShape> {
        self.lock().tables.get(&name.key()).map(|t| t.shape.clone())
    }

    /// Every execution binding `value` (or raw SQL containing it) fails with `error`.
    pub fn fail_on_value(&self, value: impl Into<String>, error: DbError) {
        self.lock().failures.push((value.into(), error));
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Raw SQL executed so far.
    pub fn executed_sql(&self) -> Vec<String> {
        self.lock().executed_sql.clone()
    }

    pub fn stats(&self) -> MemoryStats {
        self.lock().stats.clone()
    }

    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection {
            database: self.clone(),
            dialect: Arc::new(GenericDialect::new()),
            snapshot: None,
            prepared: None,
        }
    }

    pub fn introspector(&self) -> MemoryIntrospector {
        MemoryIntrospector {
            database: self.clone(),
            lookups: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Transactional connection to a [`MemoryDatabase`].
///
/// `begin` snapshots every table; `rollback` restores the snapshot.
#[derive(Debug)]
pub struct MemoryConnection {
    database: MemoryDatabase,
    dialect: Arc<dyn Dialect>,
    snapshot: Option<BTreeMap<String, MemoryTable>>,
    prepared: Option<DmlStatement>,
}

impl MemoryConnection {
    pub fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }
}

fn unique_violation(table: &TableName) -> DbError {
    DbError::new(
        DbErrorKind::UniqueViolation,
        format!("duplicate key value violates unique constraint on {table}"),
    )
    .with_sql_state("23505")
}

fn injected_failure(state: &DatabaseState, values: &[Option<String>]) -> Option<DbError> {
    state
        .failures
        .iter()
        .find(|(value, _)| values.iter().flatten().any(|v| v == value))
        .map(|(_, error)| error.clone())
}

/// Indexes of rows matching every bound key and null key of `statement`.
fn matching_rows(table: &MemoryTable, statement: &DmlStatement, key_values: &[Option<String>]) -> Vec<usize> {
    let mut predicates: Vec<(usize, Option<&str>)> = Vec::new();
    for (key, value) in statement.keys().iter().zip(key_values) {
        if let Some(index) = table.shape.column_index(&key.name) {
            predicates.push((index, value.as_deref()));
        }
    }
    for key in statement.null_key_columns() {
        if let Some(index) = table.shape.column_index(&key.name) {
            predicates.push((index, None));
        }
    }
    table
        .rows
        .iter()
        .enumerate()
        .filter(|(_, row)| {
            predicates
                .iter()
                .all(|(index, value)| row.get(*index).and_then(|v| v.as_deref()) == *value)
        })
        .map(|(i, _)| i)
        .collect()
}

fn primary_key_of(shape: &TableShape, row: &RowValues) -> Option<Vec<Option<String>>> {
    let indexes: Vec<usize> = shape
        .columns
        .iter()
        .enumerate()
        .filter(|(_, c)| c.primary_key)
        .map(|(i, _)| i)
        .collect();
    if indexes.is_empty() {
        return None;
    }
    Some(indexes.iter().map(|i| row.get(*i).cloned().flatten()).collect())
}

#[async_trait]
impl Connection for MemoryConnection {
    fn dialect(&self) -> Arc<dyn Dialect> {
        Arc::clone(&self.dialect)
    }

    async fn begin(&mut self) -> Result<(), DbError> {
        let mut state = self.database.lock();
        state.stats.begins += 1;
        self.snapshot = Some(state.tables.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        self.database.lock().stats.commits += 1;
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        let mut state = self.database.lock();
        state.stats.rollbacks += 1;
        if let Some(snapshot) = self.snapshot.take() {
            state.tables = snapshot;
        }
        Ok(())
    }

    async fn prepare(&mut self, statement: &DmlStatement) -> Result<(), DbError> {
        self.database.lock().stats.prepares += 1;
        self.prepared = Some(statement.clone());
        Ok(())
    }

    async fn execute(&mut self, values: &[Option<String>]) -> Result<u64, DbError> {
        let statement = self
            .prepared
            .as_ref()
            .ok_or_else(|| DbError::other("no statement prepared"))?;
        let mut state = self.database.lock();
        state.stats.executes += 1;
        if let Some(error) = injected_failure(&state, values) {
            return Err(error);
        }
        if values.len() != statement.parameter_count() {
            return Err(DbError::other(format!(
                "expected {} parameters but got {}",
                statement.parameter_count(),
                values.len()
            )));
        }

        let table_name = statement.table().clone();
        let table = state
            .tables
            .get_mut(&table_name.key())
            .ok_or_else(|| DbError::other(format!("relation {table_name} does not exist")).with_sql_state("42P01"))?;

        let column_count = match statement.dml_type() {
            DmlType::Insert | DmlType::InsertIgnore | DmlType::Update => statement.columns().len(),
            _ => 0,
        };
        let (column_values, key_values) = values.split_at(column_count);

        match statement.dml_type() {
            DmlType::Insert | DmlType::InsertIgnore => {
                if statement.dml_type() == DmlType::InsertIgnore
                    && !key_values.is_empty()
                    && !matching_rows(table, statement, key_values).is_empty()
                {
                    return Ok(0);
                }
                let mut row: RowValues = vec![None; table.shape.columns.len()];
                for (column, value) in statement.columns().iter().zip(column_values) {
                    if let Some(index) = table.shape.column_index(&column.name) {
                        row[index] = value.clone();
                    }
                }
                if let Some(pk) = primary_key_of(&table.shape, &row) {
                    let duplicate = table
                        .rows
                        .iter()
                        .any(|existing| primary_key_of(&table.shape, existing).as_ref() == Some(&pk));
                    if duplicate {
                        if statement.dml_type() == DmlType::InsertIgnore {
                            return Ok(0);
                        }
                        return Err(unique_violation(&table_name));
                    }
                }
                table.rows.push(row);
                Ok(1)
            }
            DmlType::Update => {
                let matches = matching_rows(table, statement, key_values);
                for index in &matches {
                    for (column, value) in statement.columns().iter().zip(column_values) {
                        if let Some(position) = table.shape.column_index(&column.name) {
                            table.rows[*index][position] = value.clone();
                        }
                    }
                }
                Ok(matches.len() as u64)
            }
            DmlType::Delete => {
                let matches = matching_rows(table, statement, key_values);
                for index in matches.iter().rev() {
                    table.rows.remove(*index);
                }
                Ok(matches.len() as u64)
            }
            DmlType::Count | DmlType::Select => Err(DbError::other(format!(
                "{} statements cannot be executed",
                statement.dml_type()
            ))),
        }
    }

    async fn query_row(
        &mut self,
        statement: &DmlStatement,
        values: &[Option<String>],
    ) -> Result<Option<RowValues>, DbError> {
        let state = self.database.lock();
        let table = state
            .tables
            .get(&statement.table().key())
            .ok_or_else(|| DbError::other(format!("relation {} does not exist", statement.table())))?;
        let matches = matching_rows(table, statement, values);
        match statement.dml_type() {
            DmlType::Count => Ok(Some(vec![Some(matches.len().to_string())])),
            DmlType::Select => Ok(matches.first().map(|index| {
                let row = &table.rows[*index];
                statement
                    .columns()
                    .iter()
                    .map(|c| {
                        table
                            .shape
                            .column_index(&c.name)
                            .and_then(|i| row.get(i).cloned().flatten())
                    })
                    .collect()
            })),
            other => Err(DbError::other(format!("{other} statements return no rows"))),
        }
    }

    async fn execute_sql(&mut self, sql: &str) -> Result<u64, DbError> {
        let mut state = self.database.lock();
        if let Some((_, error)) = state.failures.iter().find(|(value, _)| sql.contains(value.as_str())) {
            return Err(error.clone());
        }
        state.executed_sql.push(sql.to_string());
        Ok(0)
    }

    async fn apply_table(&mut self, shape: &TableShape) -> Result<(), DbError> {
        let mut state = self.database.lock();
        if let Some((_, error)) = state.failures.iter().find(|(value, _)| *value == shape.name.name) {
            return Err(error.clone());
        }
        let key = shape.name.key();
        match state.tables.get_mut(&key) {
            Some(existing) => {
                for column in &shape.columns {
                    if existing.shape.column_index(&column.name).is_none() {
                        existing.shape.columns.push(column.clone());
                        existing.rows.iter_mut().for_each(|row| row.push(None));
                    }
                }
            }
            None => {
                state.tables.insert(
                    key,
                    MemoryTable {
                        shape: shape.clone(),
                        rows: Vec::new(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn server_time(&mut self) -> Result<DateTime<Utc>, DbError> {
        Ok(Utc::now())
    }
}

/// Introspector reading table shapes from a [`MemoryDatabase`].
#[derive(Debug, Clone)]
pub struct MemoryIntrospector {
    database: MemoryDatabase,
    lookups: Arc<AtomicUsize>,
}

impl MemoryIntrospector {
    /// Number of lookups served so far.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TableIntrospector for MemoryIntrospector {
    async fn lookup_table(&self, name: &TableName) -> Result<Option<TableShape>, DbError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.database.table(name))
    }
}
