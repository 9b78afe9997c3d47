//! Parameterized DML statements.

use std::fmt;
use std::sync::Arc;

use sync_core::{Column, SqlType, TableName, TableShape};
use tracing::trace;

use crate::dialect::Dialect;

/// Errors raised while building a statement.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatementError {
    #[error("There are no keys defined for {table}. Cannot build {dml_type} statement")]
    NoKeyColumns { table: String, dml_type: DmlType },

    #[error("There are no columns defined for {table}. Cannot build {dml_type} statement")]
    NoColumns { table: String, dml_type: DmlType },

    #[error("Expected {expected} null-key flags but got {actual}")]
    NullKeyMismatch { expected: usize, actual: usize },
}

/// Statement kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DmlType {
    Insert,
    /// Insert that skips rows colliding with a unique key.
    InsertIgnore,
    Update,
    Delete,
    Count,
    Select,
}

impl DmlType {
    fn requires_keys(&self) -> bool {
        matches!(
            self,
            DmlType::Update | DmlType::Delete | DmlType::Count | DmlType::Select
        )
    }

    fn requires_columns(&self) -> bool {
        matches!(
            self,
            DmlType::Insert | DmlType::InsertIgnore | DmlType::Update | DmlType::Select
        )
    }

    /// Whether the value columns are bound as parameters.
    fn binds_columns(&self) -> bool {
        matches!(self, DmlType::Insert | DmlType::InsertIgnore | DmlType::Update)
    }

    /// Whether the key columns are bound as parameters by default.
    fn binds_keys(&self) -> bool {
        self.requires_keys()
    }
}

impl fmt::Display for DmlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DmlType::Insert => "insert",
            DmlType::InsertIgnore => "insert ignore",
            DmlType::Update => "update",
            DmlType::Delete => "delete",
            DmlType::Count => "count",
            DmlType::Select => "select",
        };
        f.write_str(name)
    }
}

/// SQL text plus its positional parameter contract.
///
/// Parameters are bound in this order:
///
/// | kind                 | order              |
/// |----------------------|--------------------|
/// | insert, insert ignore| columns            |
/// | update               | columns, then keys |
/// | delete, count, select| keys               |
///
/// An insert ignore rendered as an existence check binds columns, then keys.
/// Keys whose lookup value is null are rendered as `is NULL` and are not part
/// of the parameter list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmlStatement {
    dml_type: DmlType,
    sql: String,
    table: TableName,
    keys: Vec<Column>,
    null_keys: Vec<bool>,
    null_key_columns: Vec<Column>,
    columns: Vec<Column>,
    types: Vec<SqlType>,
    binds_keys: bool,
}

impl DmlStatement {
    pub fn dml_type(&self) -> DmlType {
        self.dml_type
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn table(&self) -> &TableName {
        &self.table
    }

    /// Keys bound as parameters (null keys excluded).
    pub fn keys(&self) -> &[Column] {
        &self.keys
    }

    /// Null flags for the keys the statement was built with.
    pub fn null_keys(&self) -> &[bool] {
        &self.null_keys
    }

    /// Keys matched with `is NULL`.
    pub fn null_key_columns(&self) -> &[Column] {
        &self.null_key_columns
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn parameter_types(&self) -> &[SqlType] {
        &self.types
    }

    pub fn parameter_count(&self) -> usize {
        self.types.len()
    }

    /// Columns in bind order.
    pub fn parameter_columns(&self) -> Vec<&Column> {
        let mut out = Vec::with_capacity(self.types.len());
        if self.dml_type.binds_columns() {
            out.extend(self.columns.iter());
        }
        if self.binds_keys {
            out.extend(self.keys.iter());
        }
        out
    }

    /// Arranges column and key values into bind order.
    ///
    /// `key_values` must already exclude null keys.
    pub fn value_array<T: Clone>(&self, column_values: &[T], key_values: &[T]) -> Vec<T> {
        let mut out = Vec::with_capacity(self.types.len());
        if self.dml_type.binds_columns() {
            out.extend_from_slice(column_values);
        }
        if self.binds_keys {
            out.extend_from_slice(key_values);
        }
        out
    }
}

/// Builds [`DmlStatement`]s for one dialect.
#[derive(Debug, Clone)]
pub struct StatementBuilder {
    dialect: Arc<dyn Dialect>,
    quote_identifiers: bool,
}

impl StatementBuilder {
    pub fn new(dialect: Arc<dyn Dialect>) -> Self {
        Self {
            dialect,
            quote_identifiers: true,
        }
    }

    pub fn without_quoted_identifiers(mut self) -> Self {
        self.quote_identifiers = false;
        self
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    pub fn build(
        &self,
        dml_type: DmlType,
        table: &TableShape,
        keys: &[Column],
        columns: &[Column],
    ) -> Result<DmlStatement, StatementError> {
        self.build_with_null_keys(dml_type, table, keys, columns, &[])
    }

    /// Like [`build`](Self::build), with `null_keys[i]` marking keys whose
    /// lookup value is null. An empty slice means no key is null.
    pub fn build_with_null_keys(
        &self,
        dml_type: DmlType,
        table: &TableShape,
        keys: &[Column],
        columns: &[Column],
        null_keys: &[bool],
    ) -> Result<DmlStatement, StatementError> {
        if dml_type.requires_keys() && keys.is_empty() {
            return Err(StatementError::NoKeyColumns {
                table: table.name.to_string(),
                dml_type,
            });
        }
        if dml_type.requires_columns() && columns.is_empty() {
            return Err(StatementError::NoColumns {
                table: table.name.to_string(),
                dml_type,
            });
        }
        let null_keys = if null_keys.is_empty() {
            vec![false; keys.len()]
        } else if null_keys.len() != keys.len() {
            return Err(StatementError::NullKeyMismatch {
                expected: keys.len(),
                actual: null_keys.len(),
            });
        } else {
            null_keys.to_vec()
        };

        let mut writer = SqlWriter {
            dialect: self.dialect.as_ref(),
            quote_identifiers: self.quote_identifiers,
            position: 0,
        };
        let table_sql = writer.table_name(&table.name);
        let mut binds_keys = dml_type.binds_keys();

        let sql = match dml_type {
            DmlType::Insert => {
                let (cols, values) = writer.insert_lists(columns);
                format!("insert into {table_sql} ({cols}) values ({values})")
            }
            DmlType::InsertIgnore => {
                let (cols, values) = writer.insert_lists(columns);
                let condition = (self.dialect.insert_ignore_uses_keys() && !keys.is_empty())
                    .then(|| writer.equals_list(keys, &null_keys, " and "));
                match self
                    .dialect
                    .insert_ignore_sql(&table_sql, &cols, &values, condition.as_deref())
                {
                    Some(sql) => {
                        binds_keys = condition.is_some();
                        sql
                    }
                    None => format!("insert into {table_sql} ({cols}) values ({values})"),
                }
            }
            DmlType::Update => {
                let set = writer.equals_list(columns, &vec![false; columns.len()], ", ");
                let condition = writer.equals_list(keys, &null_keys, " and ");
                format!("update {table_sql} set {set} where {condition}")
            }
            DmlType::Delete => {
                let condition = writer.equals_list(keys, &null_keys, " and ");
                format!("delete from {table_sql} where {condition}")
            }
            DmlType::Count => {
                let condition = writer.equals_list(keys, &null_keys, " and ");
                format!("select count(*) from {table_sql} where {condition}")
            }
            DmlType::Select => {
                let cols = writer.select_list(columns);
                let condition = writer.equals_list(keys, &null_keys, " and ");
                format!("select {cols} from {table_sql} where {condition}")
            }
        };

        let (bound, unbound): (Vec<_>, Vec<_>) =
            keys.iter().zip(&null_keys).partition(|(_, is_null)| !**is_null);
        let bound_keys: Vec<Column> = bound.into_iter().map(|(k, _)| k.clone()).collect();
        let null_key_columns: Vec<Column> = unbound.into_iter().map(|(k, _)| k.clone()).collect();

        let mut types = Vec::new();
        if dml_type.binds_columns() {
            types.extend(columns.iter().map(|c| c.sql_type));
        }
        if binds_keys {
            types.extend(bound_keys.iter().map(|c| c.sql_type));
        }

        trace!("Built {} statement: {}", dml_type, sql);

        Ok(DmlStatement {
            dml_type,
            sql,
            table: table.name.clone(),
            keys: bound_keys,
            null_keys,
            null_key_columns,
            columns: columns.to_vec(),
            types,
            binds_keys,
        })
    }
}

/// Renders statement fragments while numbering parameters.
struct SqlWriter<'a> {
    dialect: &'a dyn Dialect,
    quote_identifiers: bool,
    position: usize,
}

impl SqlWriter<'_> {
    fn identifier(&self, name: &str) -> String {
        if self.quote_identifiers {
            self.dialect.quote_identifier(name)
        } else {
            name.to_string()
        }
    }

    fn table_name(&self, name: &TableName) -> String {
        let quote = if self.quote_identifiers {
            self.dialect.quote()
        } else {
            ""
        };
        name.qualified(
            quote,
            self.dialect.catalog_separator(),
            self.dialect.schema_separator(),
        )
    }

    fn next_parameter(&mut self, column: &Column) -> String {
        self.position += 1;
        let placeholder = self.dialect.placeholder(self.position);
        self.dialect.cast_expression(column, &placeholder)
    }

    fn column_list(&self, columns: &[Column]) -> String {
        columns
            .iter()
            .map(|c| self.identifier(&c.name))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn select_list(&self, columns: &[Column]) -> String {
        columns
            .iter()
            .map(|c| self.dialect.select_expression(c, &self.identifier(&c.name)))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn insert_lists(&mut self, columns: &[Column]) -> (String, String) {
        let names = self.column_list(columns);
        let values = columns
            .iter()
            .map(|c| self.next_parameter(c))
            .collect::<Vec<_>>()
            .join(",");
        (names, values)
    }

    fn equals_list(&mut self, columns: &[Column], null_flags: &[bool], separator: &str) -> String {
        let mut parts = Vec::with_capacity(columns.len());
        for (column, is_null) in columns.iter().zip(null_flags) {
            let name = self.identifier(&column.name);
            if *is_null {
                parts.push(format!("{name} is NULL"));
            } else {
                let value = self.next_parameter(column);
                parts.push(format!("{name} = {value}"));
            }
        }
        parts.join(separator)
    }
}
