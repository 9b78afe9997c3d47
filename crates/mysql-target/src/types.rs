//! MySQL type mapping, value rendering and DDL.

use database_writer::{DbError, DbErrorKind};
use mysql_async::Value;
use sync_core::{Column, SqlType, TableShape};
use sync_dml::Dialect;

/// Convert a MySQL `DATA_TYPE` / `COLUMN_TYPE` pair to a [`SqlType`].
///
/// ```
/// use sync_core::SqlType;
/// use trigger_sync_mysql::mysql_column_type;
///
/// assert_eq!(mysql_column_type("tinyint", "tinyint(1)"), SqlType::Boolean);
/// assert_eq!(mysql_column_type("longtext", "longtext"), SqlType::Clob);
/// ```
pub fn mysql_column_type(data_type: &str, column_type: &str) -> SqlType {
    match data_type.to_uppercase().as_str() {
        "TINYINT" => {
            if column_type.to_lowercase().starts_with("tinyint(1)") {
                SqlType::Boolean
            } else {
                SqlType::TinyInt
            }
        }
        "BIT" | "BOOLEAN" | "BOOL" => SqlType::Boolean,
        "SMALLINT" => SqlType::SmallInt,
        "MEDIUMINT" | "INT" | "INTEGER" => SqlType::Integer,
        "BIGINT" => SqlType::BigInt,
        "FLOAT" => SqlType::Float,
        "DOUBLE" | "REAL" => SqlType::Double,
        "DECIMAL" | "NUMERIC" => SqlType::Decimal,

        "CHAR" => SqlType::Char,
        "VARCHAR" | "ENUM" | "SET" => SqlType::VarChar,
        "TINYTEXT" | "TEXT" => SqlType::LongVarChar,
        "MEDIUMTEXT" | "LONGTEXT" => SqlType::Clob,

        "BINARY" => SqlType::Binary,
        "VARBINARY" => SqlType::VarBinary,
        "TINYBLOB" | "BLOB" => SqlType::LongVarBinary,
        "MEDIUMBLOB" | "LONGBLOB" => SqlType::Blob,

        "DATE" => SqlType::Date,
        "TIME" => SqlType::Time,
        "DATETIME" | "TIMESTAMP" => SqlType::Timestamp,
        "YEAR" => SqlType::SmallInt,

        "JSON" => SqlType::Json,
        "GEOMETRY" | "POINT" | "LINESTRING" | "POLYGON" | "MULTIPOINT" | "MULTILINESTRING"
        | "MULTIPOLYGON" | "GEOMETRYCOLLECTION" => SqlType::Geometry,

        _ => SqlType::Other,
    }
}

/// Classify a MySQL server error code.
pub fn classify_error_code(code: u16) -> DbErrorKind {
    match code {
        1062 | 1586 => DbErrorKind::UniqueViolation,
        1216 | 1217 | 1451 | 1452 => DbErrorKind::ForeignKeyViolation,
        _ => DbErrorKind::Other,
    }
}

/// Converts a driver error, keeping SQLSTATE and the vendor code.
pub fn map_error(e: mysql_async::Error) -> DbError {
    match e {
        mysql_async::Error::Server(server) => {
            DbError::new(classify_error_code(server.code), server.message)
                .with_sql_state(server.state)
                .with_code(i32::from(server.code))
        }
        other => DbError::other(other.to_string()),
    }
}

/// Renders a result value as text, the way the writer binds values.
pub fn value_to_text(value: &Value) -> Option<String> {
    match value {
        Value::NULL => None,
        Value::Bytes(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Int(i) => Some(i.to_string()),
        Value::UInt(u) => Some(u.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Double(d) => Some(d.to_string()),
        Value::Date(y, m, d, 0, 0, 0, 0) => Some(format!("{y:04}-{m:02}-{d:02}")),
        Value::Date(y, m, d, h, mi, s, 0) => {
            Some(format!("{y:04}-{m:02}-{d:02} {h:02}:{mi:02}:{s:02}"))
        }
        Value::Date(y, m, d, h, mi, s, us) => Some(format!(
            "{y:04}-{m:02}-{d:02} {h:02}:{mi:02}:{s:02}.{us:06}"
        )),
        Value::Time(negative, days, h, mi, s, us) => {
            let sign = if *negative { "-" } else { "" };
            let hours = u32::from(*h) + days * 24;
            if *us == 0 {
                Some(format!("{sign}{hours:02}:{mi:02}:{s:02}"))
            } else {
                Some(format!("{sign}{hours:02}:{mi:02}:{s:02}.{us:06}"))
            }
        }
    }
}

/// Column type used in `CREATE TABLE` / `ADD COLUMN`.
pub fn column_ddl_type(column: &Column) -> String {
    let native = column.native_type.as_deref().map(str::trim);
    match column.sql_type {
        SqlType::Boolean => "tinyint(1)".to_string(),
        SqlType::TinyInt => "tinyint".to_string(),
        SqlType::SmallInt => "smallint".to_string(),
        SqlType::Integer => "int".to_string(),
        SqlType::BigInt => "bigint".to_string(),
        SqlType::Decimal => match (column.size, column.scale) {
            (Some(p), Some(s)) => format!("decimal({p},{s})"),
            (Some(p), None) => format!("decimal({p})"),
            _ => "decimal(38,10)".to_string(),
        },
        SqlType::Float => "float".to_string(),
        SqlType::Double => "double".to_string(),
        SqlType::Char => format!("char({})", column.size.unwrap_or(1)),
        SqlType::VarChar => format!("varchar({})", column.size.unwrap_or(255)),
        SqlType::LongVarChar => "text".to_string(),
        SqlType::Clob => "longtext".to_string(),
        SqlType::Binary => format!("binary({})", column.size.unwrap_or(1)),
        SqlType::VarBinary => format!("varbinary({})", column.size.unwrap_or(255)),
        SqlType::LongVarBinary => "blob".to_string(),
        SqlType::Blob => "longblob".to_string(),
        SqlType::Date => "date".to_string(),
        SqlType::Time => "time(6)".to_string(),
        SqlType::Timestamp | SqlType::TimestampTz => "datetime(6)".to_string(),
        SqlType::Uuid => "char(36)".to_string(),
        SqlType::Json => "json".to_string(),
        SqlType::Geometry => native.unwrap_or("geometry").to_string(),
        SqlType::Array | SqlType::Other => "longtext".to_string(),
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
    if column.auto_increment && column.primary_key {
        ddl.push_str(" AUTO_INCREMENT");
    }
    ddl
}

/// MySQL has no schemas: the catalog, or failing that the schema, names the
/// database.
pub fn table_sql(shape: &TableShape, dialect: &dyn Dialect) -> String {
    let mut name = shape.name.clone();
    if name.catalog.is_none() {
        name.catalog = name.schema.take();
    } else {
        name.schema = None;
    }
    name.qualified(dialect.quote(), dialect.catalog_separator(), dialect.schema_separator())
}

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

pub fn add_column_sql(shape: &TableShape, column: &Column, dialect: &dyn Dialect) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        table_sql(shape, dialect),
        dialect.quote_identifier(&column.name),
        column_ddl_type(column)
    )
}
