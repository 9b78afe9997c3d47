//! SQL type codes shared by table shapes, the statement builder and the
//! database-specific targets.
//!
//! Each target maps its native column types onto [`SqlType`]; the writer and
//! the statement builder only reason about these coarse categories
//! (large objects, text, numeric, temporal, ...). The native type name is
//! kept separately on the column for dialects that need it when casting.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Coarse SQL type category of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlType {
    Boolean,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Decimal,
    Float,
    Double,
    Char,
    VarChar,
    /// Unbounded text that is still comparable (`text`, `longtext` in some engines).
    LongVarChar,
    /// Character large object.
    Clob,
    Binary,
    VarBinary,
    LongVarBinary,
    /// Binary large object.
    Blob,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Uuid,
    Json,
    Array,
    Geometry,
    Other,
}

impl SqlType {
    /// Large objects are never used to locate rows.
    pub fn is_lob(&self) -> bool {
        matches!(self, SqlType::Clob | SqlType::Blob | SqlType::LongVarBinary)
    }

    /// Canonical lower-case name, also accepted by [`FromStr`].
    pub fn as_str(&self) -> &'static str {
        match self {
            SqlType::Boolean => "boolean",
            SqlType::TinyInt => "tinyint",
            SqlType::SmallInt => "smallint",
            SqlType::Integer => "integer",
            SqlType::BigInt => "bigint",
            SqlType::Decimal => "decimal",
            SqlType::Float => "float",
            SqlType::Double => "double",
            SqlType::Char => "char",
            SqlType::VarChar => "varchar",
            SqlType::LongVarChar => "longvarchar",
            SqlType::Clob => "clob",
            SqlType::Binary => "binary",
            SqlType::VarBinary => "varbinary",
            SqlType::LongVarBinary => "longvarbinary",
            SqlType::Blob => "blob",
            SqlType::Date => "date",
            SqlType::Time => "time",
            SqlType::Timestamp => "timestamp",
            SqlType::TimestampTz => "timestamptz",
            SqlType::Uuid => "uuid",
            SqlType::Json => "json",
            SqlType::Array => "array",
            SqlType::Geometry => "geometry",
            SqlType::Other => "other",
        }
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SqlType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ty = match s.trim().to_ascii_lowercase().as_str() {
            "boolean" | "bool" | "bit" => SqlType::Boolean,
            "tinyint" => SqlType::TinyInt,
            "smallint" | "int2" => SqlType::SmallInt,
            "integer" | "int" | "int4" | "mediumint" => SqlType::Integer,
            "bigint" | "int8" => SqlType::BigInt,
            "decimal" | "numeric" => SqlType::Decimal,
            "float" | "real" | "float4" => SqlType::Float,
            "double" | "double precision" | "float8" => SqlType::Double,
            "char" | "character" | "bpchar" => SqlType::Char,
            "varchar" | "character varying" => SqlType::VarChar,
            "longvarchar" | "text" => SqlType::LongVarChar,
            "clob" | "longtext" | "mediumtext" => SqlType::Clob,
            "binary" => SqlType::Binary,
            "varbinary" => SqlType::VarBinary,
            "longvarbinary" | "bytea" => SqlType::LongVarBinary,
            "blob" | "longblob" | "mediumblob" => SqlType::Blob,
            "date" => SqlType::Date,
            "time" => SqlType::Time,
            "timestamp" | "datetime" | "timestamp without time zone" => SqlType::Timestamp,
            "timestamptz" | "timestamp with time zone" => SqlType::TimestampTz,
            "uuid" => SqlType::Uuid,
            "json" | "jsonb" => SqlType::Json,
            "array" => SqlType::Array,
            "geometry" | "geography" | "point" => SqlType::Geometry,
            "other" => SqlType::Other,
            other => return Err(format!("Unknown SQL type: {other}")),
        };
        Ok(ty)
    }
}
