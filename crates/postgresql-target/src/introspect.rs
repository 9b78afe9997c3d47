//! Table shape lookup through `information_schema`.

use async_trait::async_trait;
use database_writer::{DbError, TableIntrospector};
use std::sync::Arc;
use sync_core::{Column, TableName, TableShape};
use tokio::sync::Mutex;
use tokio_postgres::Client;
use tracing::debug;

use crate::connection::map_error;
use crate::types::postgresql_column_type;

const COLUMNS_SQL: &str = "SELECT column_name::text, data_type::text, udt_name::text, \
     is_nullable::text, character_maximum_length::int4, numeric_precision::int4, \
     numeric_scale::int4, column_default::text, is_identity::text, is_generated::text \
     FROM information_schema.columns \
     WHERE table_schema = $1 AND table_name = $2 \
     ORDER BY ordinal_position";

const PRIMARY_KEY_SQL: &str = "SELECT kcu.column_name::text \
     FROM information_schema.table_constraints tc \
     JOIN information_schema.key_column_usage kcu \
       ON tc.constraint_name = kcu.constraint_name \
      AND tc.table_schema = kcu.table_schema \
      AND tc.table_name = kcu.table_name \
     WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = $1 AND tc.table_name = $2 \
     ORDER BY kcu.ordinal_position";

/// Reads the shape of `schema.table`, trying the name as given and then
/// folded to lower case. `None` when neither exists.
pub async fn fetch_table_shape(
    client: &Client,
    name: &TableName,
    default_schema: &str,
) -> Result<Option<TableShape>, DbError> {
    let schema = name
        .schema
        .as_deref()
        .filter(|s| !s.is_empty())
        .unwrap_or(default_schema);

    let mut candidates = vec![name.name.clone()];
    let folded = name.name.to_lowercase();
    if folded != name.name {
        candidates.push(folded);
    }

    for table in candidates {
        let rows = client
            .query(COLUMNS_SQL, &[&schema, &table])
            .await
            .map_err(map_error)?;
        if rows.is_empty() {
            continue;
        }

        let keys: Vec<String> = client
            .query(PRIMARY_KEY_SQL, &[&schema, &table])
            .await
            .map_err(map_error)?
            .iter()
            .map(|row| row.try_get::<_, String>(0))
            .collect::<Result<_, _>>()
            .map_err(map_error)?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in &rows {
            let read = || -> Result<Column, tokio_postgres::Error> {
                let column_name: String = row.try_get(0)?;
                let data_type: String = row.try_get(1)?;
                let udt_name: String = row.try_get(2)?;
                let nullable: String = row.try_get(3)?;
                let char_length: Option<i32> = row.try_get(4)?;
                let precision: Option<i32> = row.try_get(5)?;
                let scale: Option<i32> = row.try_get(6)?;
                let default: Option<String> = row.try_get(7)?;
                let identity: Option<String> = row.try_get(8)?;
                let generated: Option<String> = row.try_get(9)?;

                let mut column = Column::new(
                    column_name.clone(),
                    postgresql_column_type(&data_type, &udt_name),
                )
                .with_native_type(udt_name);
                if let Some(size) = char_length.or(precision) {
                    column = column.with_size(size as u32, scale.map(|s| s as u32));
                }
                column.nullable = nullable.eq_ignore_ascii_case("YES");
                column.primary_key = keys.contains(&column_name);
                column.auto_increment = identity.as_deref() == Some("YES")
                    || default.as_deref().is_some_and(|d| d.starts_with("nextval("));
                column.generated = generated.as_deref() == Some("ALWAYS");
                Ok(column)
            };
            columns.push(read().map_err(map_error)?);
        }

        debug!(
            "Found table {}.{} with {} columns ({} key columns)",
            schema,
            table,
            columns.len(),
            keys.len()
        );
        let mut found = TableName::new(table).with_schema(schema);
        found.catalog = name.catalog.clone();
        return Ok(Some(TableShape::new(found, columns)));
    }
    Ok(None)
}

/// [`TableIntrospector`] over a shared client.
pub struct PostgresIntrospector {
    client: Arc<Mutex<Client>>,
    default_schema: String,
}

impl PostgresIntrospector {
    pub fn new(client: Arc<Mutex<Client>>) -> Self {
        Self {
            client,
            default_schema: "public".to_string(),
        }
    }

    /// Schema used for names without one.
    pub fn with_default_schema(mut self, schema: impl Into<String>) -> Self {
        self.default_schema = schema.into();
        self
    }
}

#[async_trait]
impl TableIntrospector for PostgresIntrospector {
    async fn lookup_table(&self, name: &TableName) -> Result<Option<TableShape>, DbError> {
        let client = self.client.lock().await;
        fetch_table_shape(&client, name, &self.default_schema).await
    }
}
