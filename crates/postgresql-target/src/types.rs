//! PostgreSQL column types and DDL.
//!
//! Maps `information_schema.columns` types onto [`SqlType`] for introspection,
//! and renders column definitions when a schema change creates or alters a
//! target table.

use database_writer::DbErrorKind;
use sync_core::{Column, SqlType, TableShape};
use sync_dml::Dialect;

/// Convert a PostgreSQL `data_type` / `udt_name` pair to a [`SqlType`].
///
/// ```
/// use sync_core::SqlType;
/// use trigger_sync_postgresql::postgresql_column_type;
///
/// assert_eq!(postgresql_column_type("integer", "int4"), SqlType::Integer);
/// assert_eq!(postgresql_column_type("ARRAY", "_text"), SqlType::Array);
/// ```
pub fn postgresql_column_type(data_type: &str, udt_name: &str) -> SqlType {
    let data_type = data_type.to_lowercase();
    if data_type == "array" || udt_name.starts_with('_') {
        return SqlType::Array;
    }
    if data_type == "user-defined" {
        return match udt_name.to_lowercase().as_str() {
            "geometry" | "geography" => SqlType::Geometry,
            "citext" => SqlType::LongVarChar,
            _ => SqlType::Other,
        };
    }
    match data_type.as_str() {
        "smallint" | "int2" => SqlType::SmallInt,
        "integer" | "int" | "int4" => SqlType::Integer,
        "bigint" | "int8" => SqlType::BigInt,
        "real" | "float4" => SqlType::Float,
        "double precision" | "float8" => SqlType::Double,
        "numeric" | "decimal" | "money" => SqlType::Decimal,

        "boolean" | "bool" => SqlType::Boolean,

        "character varying" | "varchar" => SqlType::VarChar,
        "character" | "char" | "bpchar" => SqlType::Char,
        // Unbounded but comparable, unlike a true LOB.
        "text" | "name" => SqlType::LongVarChar,

        "bytea" => SqlType::LongVarBinary,

        "date" => SqlType::Date,
        "time without time zone" | "time with time zone" | "time" => SqlType::Time,
        "timestamp without time zone" | "timestamp" => SqlType::Timestamp,
        "timestamp with time zone" | "timestamptz" => SqlType::TimestampTz,

        "uuid" => SqlType::Uuid,
        "json" | "jsonb" => SqlType::Json,
        "point" | "line" | "lseg" | "box" | "path" | "polygon" | "circle" => SqlType::Geometry,

        _ => SqlType::Other,
    }
}

/// Classify a PostgreSQL SQLSTATE.
pub fn classify_sql_state(sql_state: &str) -> DbErrorKind {
    match sql_state {
        "23505" => DbErrorKind::UniqueViolation,
        "23503" => DbErrorKind::ForeignKeyViolation,
        _ => DbErrorKind::Other,
    }
}

/// Column type used in `CREATE TABLE` / `ADD COLUMN`.
pub fn column_ddl_type(column: &Column) -> String {
    let native = column.native_type.as_deref().map(str::trim);
    match column.sql_type {
        SqlType::Boolean => "boolean".to_string(),
        SqlType::TinyInt | SqlType::SmallInt => "smallint".to_string(),
        SqlType::Integer => "integer".to_string(),
        SqlType::BigInt => "bigint".to_string(),
        SqlType::Decimal => match (column.size, column.scale) {
            (Some(p), Some(s)) => format!("numeric({p},{s})"),
            (Some(p), None) => format!("numeric({p})"),
            _ => "numeric".to_string(),
        },
        SqlType::Float => "real".to_string(),
        SqlType::Double => "double precision".to_string(),
        SqlType::Char => match column.size {
            Some(n) => format!("char({n})"),
            None => "char(1)".to_string(),
        },
        SqlType::VarChar => match column.size {
            Some(n) => format!("varchar({n})"),
            None => "varchar".to_string(),
        },
        SqlType::LongVarChar | SqlType::Clob => "text".to_string(),
        SqlType::Binary | SqlType::VarBinary | SqlType::LongVarBinary | SqlType::Blob => {
            "bytea".to_string()
        }
        SqlType::Date => "date".to_string(),
        SqlType::Time => "time".to_string(),
        SqlType::Timestamp => "timestamp".to_string(),
        SqlType::TimestampTz => "timestamptz".to_string(),
        SqlType::Uuid => "uuid".to_string(),
        SqlType::Json => "jsonb".to_string(),
        SqlType::Array => match native {
            Some(n) if n.starts_with('_') => format!("{}[]", &n[1..]),
            Some(n) if n.ends_with("[]") => n.to_string(),
            _ => "text[]".to_string(),
        },
        SqlType::Geometry => native.unwrap_or("geometry").to_string(),
        SqlType::Other => native.unwrap_or("text").to_string(),
    }
}

fn column_definition(column: &Column, dialect: &dyn Dialect) -> String {
    let mut ddl = format!(
        "{} {}",
        dialect.quote_identifier(&column.name),
        column_ddl_type(column)
    );
    if !column.nullable {
        ddl.push_str(" NOT NULL");
    }
    ddl
}

/// `CREATE TABLE` for `shape`, including its primary key.
pub fn create_table_sql(shape: &TableShape, dialect: &dyn Dialect) -> String {
    let mut parts: Vec<String> = shape
        .columns
        .iter()
        .filter(|c| !c.generated)
        .map(|c| column_definition(c, dialect))
        .collect();
    let keys: Vec<String> = shape
        .columns
        .iter()
        .filter(|c| c.primary_key)
        .map(|c| dialect.quote_identifier(&c.name))
        .collect();
    if !keys.is_empty() {
        parts.push(format!("PRIMARY KEY ({})", keys.join(", ")));
    }
    format!(
        "CREATE TABLE {} ({})",
        table_sql(shape, dialect),
        parts.join(", ")
    )
}

/// `ALTER TABLE ... ADD COLUMN` for one new column. Added columns are
/// nullable so existing rows stay valid.
pub fn add_column_sql(shape: &TableShape, column: &Column, dialect: &dyn Dialect) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        table_sql(shape, dialect),
        dialect.quote_identifier(&column.name),
        column_ddl_type(column)
    )
}

fn table_sql(shape: &TableShape, dialect: &dyn Dialect) -> String {
    // PostgreSQL has no cross-database names; the catalog is dropped.
    let mut name = shape.name.clone();
    name.catalog = None;
    name.qualified(dialect.quote(), dialect.catalog_separator(), dialect.schema_separator())
}
