//! Table shape lookup through `INFORMATION_SCHEMA`.

use async_trait::async_trait;
use database_writer::{DbError, TableIntrospector};
use mysql_async::prelude::*;
use mysql_async::{Conn, Row};
use std::sync::Arc;
use sync_core::{Column, TableName, TableShape};
use tokio::sync::Mutex;
use tracing::debug;

use crate::types::{map_error, mysql_column_type, value_to_text};

const COLUMNS_SQL: &str = "
    SELECT COLUMN_NAME, DATA_TYPE, COLUMN_TYPE, IS_NULLABLE, CHARACTER_MAXIMUM_LENGTH,
           NUMERIC_PRECISION, NUMERIC_SCALE, COLUMN_KEY, EXTRA, TABLE_SCHEMA, TABLE_NAME
    FROM INFORMATION_SCHEMA.COLUMNS
    WHERE TABLE_SCHEMA = COALESCE(?, DATABASE()) AND TABLE_NAME = ?
    ORDER BY ORDINAL_POSITION";

fn text(row: &Row, index: usize) -> Option<String> {
    row.as_ref(index).and_then(value_to_text)
}

fn number(row: &Row, index: usize) -> Option<u32> {
    text(row, index).and_then(|v| v.parse().ok())
}

/// Reads the shape of a table; the catalog (or schema) names the database,
/// defaulting to the connection's current one.
pub async fn fetch_table_shape(
    conn: &mut Conn,
    name: &TableName,
) -> Result<Option<TableShape>, DbError> {
    let database = name
        .catalog
        .clone()
        .or_else(|| name.schema.clone())
        .filter(|d| !d.is_empty());
    let rows: Vec<Row> = conn
        .exec(COLUMNS_SQL, (database, name.name.clone()))
        .await
        .map_err(map_error)?;
    if rows.is_empty() {
        return Ok(None);
    }

    let mut columns = Vec::with_capacity(rows.len());
    for row in &rows {
        let column_name = text(row, 0).unwrap_or_default();
        let data_type = text(row, 1).unwrap_or_default();
        let column_type = text(row, 2).unwrap_or_default();
        let extra = text(row, 8).unwrap_or_default().to_lowercase();

        let mut column = Column::new(column_name, mysql_column_type(&data_type, &column_type))
            .with_native_type(column_type);
        if let Some(size) = number(row, 4).or_else(|| number(row, 5)) {
            column = column.with_size(size, number(row, 6));
        }
        column.nullable = text(row, 3).is_some_and(|v| v.eq_ignore_ascii_case("YES"));
        column.primary_key = text(row, 7).is_some_and(|v| v.eq_ignore_ascii_case("PRI"));
        column.auto_increment = extra.contains("auto_increment");
        column.generated = extra.contains("generated");
        columns.push(column);
    }

    // Report the name as stored, which may differ in case.
    let database = text(&rows[0], 9);
    let table = text(&rows[0], 10).unwrap_or_else(|| name.name.clone());
    let mut found = TableName::new(table);
    found.catalog = database;
    debug!("Found table {} with {} columns", found, columns.len());
    Ok(Some(TableShape::new(found, columns)))
}

/// [`TableIntrospector`] over a shared connection.
pub struct MySqlIntrospector {
    conn: Arc<Mutex<Conn>>,
}

impl MySqlIntrospector {
    pub fn new(conn: Arc<Mutex<Conn>>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl TableIntrospector for MySqlIntrospector {
    async fn lookup_table(&self, name: &TableName) -> Result<Option<TableShape>, DbError> {
        let mut conn = self.conn.lock().await;
        fetch_table_shape(&mut conn, name).await
    }
}
