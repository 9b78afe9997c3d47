//! Per-database statement capabilities.
//!
//! A [`Dialect`] only overrides the pieces of SQL text that differ between
//! databases; the statement layout itself lives in [`crate::StatementBuilder`].

use std::fmt::Debug;
use sync_core::{Column, SqlType};

/// Statement-text hooks for one target database.
pub trait Dialect: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Identifier delimiter; empty when the database doesn't quote.
    fn quote(&self) -> &'static str {
        "\""
    }

    fn catalog_separator(&self) -> &'static str {
        "."
    }

    fn schema_separator(&self) -> &'static str {
        "."
    }

    /// Quotes one identifier, doubling embedded delimiters.
    fn quote_identifier(&self, identifier: &str) -> String {
        let quote = self.quote();
        if quote.is_empty() {
            return identifier.to_string();
        }
        format!(
            "{quote}{}{quote}",
            identifier.replace(quote, &format!("{quote}{quote}"))
        )
    }

    /// Bind marker for the parameter at 1-based `position`.
    fn placeholder(&self, _position: usize) -> String {
        "?".to_string()
    }

    /// Value expression for `column`, wrapping `placeholder` in a cast when
    /// the driver binds values as text.
    fn cast_expression(&self, _column: &Column, placeholder: &str) -> String {
        placeholder.to_string()
    }

    /// Expression selecting `column` so the driver can read it back as text.
    fn select_expression(&self, _column: &Column, quoted_name: &str) -> String {
        quoted_name.to_string()
    }

    /// Whether `column = ?` is a usable predicate for this column.
    fn can_use_in_where(&self, column: &Column) -> bool {
        !column.sql_type.is_lob()
    }

    fn allows_auto_increment_update(&self) -> bool {
        true
    }

    /// Whether [`insert_ignore_sql`](Self::insert_ignore_sql) needs a key
    /// condition to detect existing rows.
    fn insert_ignore_uses_keys(&self) -> bool {
        false
    }

    /// Insert that silently skips rows colliding with a unique key.
    ///
    /// `columns` and `values` are the already rendered column and value lists.
    /// `key_condition` is the rendered key predicate, present only when the
    /// dialect asks for it. `None` means the dialect has no such form.
    fn insert_ignore_sql(
        &self,
        _table: &str,
        _columns: &str,
        _values: &str,
        _key_condition: Option<&str>,
    ) -> Option<String> {
        None
    }
}

/// ANSI dialect: double-quoted identifiers, `?` markers.
#[derive(Debug, Clone)]
pub struct GenericDialect {
    auto_increment_updatable: bool,
}

impl Default for GenericDialect {
    fn default() -> Self {
        Self {
            auto_increment_updatable: true,
        }
    }
}

impl GenericDialect {
    pub fn new() -> Self {
        Self::default()
    }

    /// For databases that reject writes to identity columns.
    pub fn without_auto_increment_update(mut self) -> Self {
        self.auto_increment_updatable = false;
        self
    }
}

impl Dialect for GenericDialect {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn allows_auto_increment_update(&self) -> bool {
        self.auto_increment_updatable
    }

    fn insert_ignore_uses_keys(&self) -> bool {
        true
    }

    fn insert_ignore_sql(
        &self,
        table: &str,
        columns: &str,
        values: &str,
        key_condition: Option<&str>,
    ) -> Option<String> {
        key_condition.map(|condition| {
            format!(
                "insert into {table} ({columns}) select {values} where not exists (select 1 from {table} where {condition})"
            )
        })
    }
}

/// PostgreSQL: `$n` markers; values are bound as text and cast to the
/// column's native type.
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    fn cast_type(column: &Column) -> Option<String> {
        if let Some(native) = column.native_type.as_deref() {
            let native = native.trim();
            if matches!(
                native.to_ascii_lowercase().as_str(),
                "text" | "varchar" | "bpchar" | "name" | "character varying"
            ) {
                return None;
            }
            return Some(native.to_string());
        }
        let ty = match column.sql_type {
            SqlType::Boolean => "bool",
            SqlType::TinyInt | SqlType::SmallInt => "int2",
            SqlType::Integer => "int4",
            SqlType::BigInt => "int8",
            SqlType::Decimal => "numeric",
            SqlType::Float => "float4",
            SqlType::Double => "float8",
            SqlType::Binary | SqlType::VarBinary | SqlType::LongVarBinary | SqlType::Blob => {
                "bytea"
            }
            SqlType::Date => "date",
            SqlType::Time => "time",
            SqlType::Timestamp => "timestamp",
            SqlType::TimestampTz => "timestamptz",
            SqlType::Uuid => "uuid",
            SqlType::Json => "jsonb",
            SqlType::Char
            | SqlType::VarChar
            | SqlType::LongVarChar
            | SqlType::Clob
            | SqlType::Array
            | SqlType::Geometry
            | SqlType::Other => return None,
        };
        Some(ty.to_string())
    }
}

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn placeholder(&self, position: usize) -> String {
        format!("${position}")
    }

    fn cast_expression(&self, column: &Column, placeholder: &str) -> String {
        if column.sql_type == SqlType::Geometry {
            return format!("ST_GeomFromText({placeholder}::text)");
        }
        match Self::cast_type(column) {
            Some(ty) => format!("{placeholder}::text::{ty}"),
            None => placeholder.to_string(),
        }
    }

    fn select_expression(&self, _column: &Column, quoted_name: &str) -> String {
        format!("{quoted_name}::text")
    }

    fn can_use_in_where(&self, column: &Column) -> bool {
        !column.sql_type.is_lob()
            && !matches!(column.sql_type, SqlType::Json | SqlType::Geometry)
    }

    fn insert_ignore_sql(
        &self,
        table: &str,
        columns: &str,
        values: &str,
        _key_condition: Option<&str>,
    ) -> Option<String> {
        Some(format!(
            "insert into {table} ({columns}) values ({values}) on conflict do nothing"
        ))
    }
}

/// MySQL / MariaDB: backtick identifiers, `?` markers, implicit string
/// conversion on bind.
#[derive(Debug, Clone, Default)]
pub struct MySqlDialect;

impl Dialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn quote(&self) -> &'static str {
        "`"
    }

    fn cast_expression(&self, column: &Column, placeholder: &str) -> String {
        if column.sql_type == SqlType::Geometry {
            return format!("ST_GeomFromText({placeholder})");
        }
        placeholder.to_string()
    }

    fn can_use_in_where(&self, column: &Column) -> bool {
        !column.sql_type.is_lob() && column.sql_type != SqlType::Geometry
    }

    fn insert_ignore_sql(
        &self,
        table: &str,
        columns: &str,
        values: &str,
        _key_condition: Option<&str>,
    ) -> Option<String> {
        Some(format!("insert ignore into {table} ({columns}) values ({values})"))
    }
}
