//! Table shapes as seen by the replication pipeline.
//!
//! A [`TableShape`] is the minimal structural description the writer needs:
//! a qualified name plus an ordered column list. Column order is significant,
//! since row values travel as arrays aligned to the source shape.
//!
//! ## Reconciliation
//!
//! Source and target tables may drift apart. [`TableShape::reconcile_with_source`]
//! produces the shape the writer actually uses against the target:
//!
//! - target columns, in target order, restricted to names the source also has
//!   (case-insensitive); generated columns are dropped
//! - when the target has no primary key, every non-LOB column becomes a key
//!   so whole-row matching remains possible

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::SqlType;

// ============================================================================
// Error Types
// ============================================================================

/// Error type for schema operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// Same column name declared twice
    #[error("Duplicate column '{column}' in table '{table}'")]
    DuplicateColumn { table: String, column: String },

    /// Table declared without columns
    #[error("Table '{0}' has no columns")]
    NoColumns(String),
}

// ============================================================================
// Columns
// ============================================================================

/// Column metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,

    #[serde(rename = "type")]
    pub sql_type: SqlType,

    /// Database-native type name (e.g. `int8`, `varchar(40)`), used for casts and DDL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub native_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,

    #[serde(default = "default_true")]
    pub nullable: bool,

    #[serde(default)]
    pub primary_key: bool,

    #[serde(default)]
    pub auto_increment: bool,

    /// Computed by the database; never written.
    #[serde(default)]
    pub generated: bool,
}

fn default_true() -> bool {
    true
}

impl Column {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            native_type: None,
            size: None,
            scale: None,
            nullable: true,
            primary_key: false,
            auto_increment: false,
            generated: false,
        }
    }

    /// Convenience constructor for a non-null primary key column.
    pub fn key(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self::new(name, sql_type).primary_key()
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    pub fn with_native_type(mut self, native_type: impl Into<String>) -> Self {
        self.native_type = Some(native_type.into());
        self
    }

    pub fn with_size(mut self, size: u32, scale: Option<u32>) -> Self {
        self.size = Some(size);
        self.scale = scale;
        self
    }

    pub fn name_matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

// ============================================================================
// Table names
// ============================================================================

/// Catalog/schema/table identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableName {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub catalog: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    pub name: String,
}

impl TableName {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            catalog: None,
            schema: None,
            name: name.into(),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }

    /// Lower-cased `catalog.schema.name`, used as a cache and lookup key.
    pub fn key(&self) -> String {
        self.qualified("", ".", ".").to_lowercase()
    }

    /// Qualified name with every part wrapped in `quote`.
    pub fn qualified(&self, quote: &str, catalog_separator: &str, schema_separator: &str) -> String {
        let mut out = String::new();
        if let Some(catalog) = self.catalog.as_deref().filter(|c| !c.is_empty()) {
            out.push_str(quote);
            out.push_str(catalog);
            out.push_str(quote);
            out.push_str(catalog_separator);
        }
        if let Some(schema) = self.schema.as_deref().filter(|s| !s.is_empty()) {
            out.push_str(quote);
            out.push_str(schema);
            out.push_str(quote);
            out.push_str(schema_separator);
        }
        out.push_str(quote);
        out.push_str(&self.name);
        out.push_str(quote);
        out
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.qualified("", ".", "."))
    }
}

// ============================================================================
// Table shapes
// ============================================================================

/// Ordered column list of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableShape {
    #[serde(flatten)]
    pub name: TableName,
    pub columns: Vec<Column>,
}

impl TableShape {
    pub fn new(name: TableName, columns: Vec<Column>) -> Self {
        Self { name, columns }
    }

    /// Checks for an empty column list and duplicate names.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.columns.is_empty() {
            return Err(SchemaError::NoColumns(self.name.to_string()));
        }
        for (i, column) in self.columns.iter().enumerate() {
            if self.columns[..i].iter().any(|c| c.name_matches(&column.name)) {
                return Err(SchemaError::DuplicateColumn {
                    table: self.name.to_string(),
                    column: column.name.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Case-insensitive position of a column.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name_matches(name))
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name_matches(name))
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn primary_key_names(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    pub fn primary_key_count(&self) -> usize {
        self.columns.iter().filter(|c| c.primary_key).count()
    }

    pub fn has_primary_key(&self) -> bool {
        self.columns.iter().any(|c| c.primary_key)
    }

    /// Position of a column within the primary key list.
    pub fn primary_key_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .position(|c| c.name_matches(name))
    }

    /// Position of a column among the columns that identify a row.
    ///
    /// Those are the primary key columns, or every non-LOB column when the
    /// table declares no primary key.
    pub fn key_index(&self, name: &str) -> Option<usize> {
        if self.has_primary_key() {
            return self.primary_key_index(name);
        }
        self.columns
            .iter()
            .filter(|c| !c.sql_type.is_lob())
            .position(|c| c.name_matches(name))
    }

    /// Marks every non-LOB column as a key column.
    pub fn promote_all_columns_to_key(&mut self) {
        for column in &mut self.columns {
            if !column.sql_type.is_lob() {
                column.primary_key = true;
            }
        }
    }

    /// Builds the shape used to write rows captured from `source` into this table.
    ///
    /// When `use_source_keys` is set, key flags are taken from the source's
    /// primary key instead of the target's.
    pub fn reconcile_with_source(&self, source: &TableShape, use_source_keys: bool) -> TableShape {
        let mut columns: Vec<Column> = self
            .columns
            .iter()
            .filter(|c| !c.generated && source.column_index(&c.name).is_some())
            .cloned()
            .collect();

        if use_source_keys && source.has_primary_key() {
            for column in &mut columns {
                column.primary_key = source
                    .column(&column.name)
                    .map(|c| c.primary_key)
                    .unwrap_or(false);
            }
        }

        let mut reconciled = TableShape::new(self.name.clone(), columns);
        if !reconciled.has_primary_key() {
            reconciled.promote_all_columns_to_key();
        }
        reconciled
    }

    /// Index of every column of `self` within `source`, in `self` order.
    pub fn source_positions(&self, source: &TableShape) -> Vec<Option<usize>> {
        self.columns
            .iter()
            .map(|c| source.column_index(&c.name))
            .collect()
    }
}
