//! Writer connection over `tokio-postgres`.
//!
//! Each execute runs inside a savepoint while a transaction is open: a
//! unique violation would otherwise abort the whole transaction, and conflict
//! resolution needs to keep writing after one.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use database_writer::{Connection, DbError};
use std::sync::Arc;
use sync_core::{RowValues, TableShape};
use sync_dml::{Dialect, DmlStatement, DmlType, PostgresDialect};
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Statement};
use tracing::debug;

use crate::introspect::fetch_table_shape;
use crate::types::{add_column_sql, classify_sql_state, create_table_sql};

const SAVEPOINT: &str = "trigger_sync_row";

/// Converts a driver error, keeping SQLSTATE and server message.
pub fn map_error(e: tokio_postgres::Error) -> DbError {
    let message = e
        .as_db_error()
        .map(|db| db.message().to_string())
        .unwrap_or_else(|| e.to_string());
    match e.code() {
        Some(state) => {
            DbError::new(classify_sql_state(state.code()), message).with_sql_state(state.code())
        }
        None => DbError::other(message),
    }
}

fn params(values: &[Option<String>]) -> Vec<&(dyn ToSql + Sync)> {
    values.iter().map(|v| v as &(dyn ToSql + Sync)).collect()
}

/// [`Connection`] for a PostgreSQL target.
pub struct PostgresConnection {
    client: Arc<Mutex<Client>>,
    dialect: Arc<PostgresDialect>,
    prepared: Option<Statement>,
    in_transaction: bool,
    default_schema: String,
}

impl PostgresConnection {
    /// Share `client` with the [`PostgresIntrospector`](crate::PostgresIntrospector)
    /// so lookups see tables created inside the open transaction.
    pub fn new(client: Arc<Mutex<Client>>) -> Self {
        Self {
            client,
            dialect: Arc::new(PostgresDialect),
            prepared: None,
            in_transaction: false,
            default_schema: "public".to_string(),
        }
    }

    pub fn with_default_schema(mut self, schema: impl Into<String>) -> Self {
        self.default_schema = schema.into();
        self
    }

    pub fn client(&self) -> &Arc<Mutex<Client>> {
        &self.client
    }
}

#[async_trait]
impl Connection for PostgresConnection {
    fn dialect(&self) -> Arc<dyn Dialect> {
        self.dialect.clone()
    }

    async fn begin(&mut self) -> Result<(), DbError> {
        self.client
            .lock()
            .await
            .batch_execute("BEGIN")
            .await
            .map_err(map_error)?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        self.in_transaction = false;
        self.client
            .lock()
            .await
            .batch_execute("COMMIT")
            .await
            .map_err(map_error)
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.in_transaction = false;
        self.client
            .lock()
            .await
            .batch_execute("ROLLBACK")
            .await
            .map_err(map_error)
    }

    async fn prepare(&mut self, statement: &DmlStatement) -> Result<(), DbError> {
        debug!("Preparing {}", statement.sql());
        let prepared = self
            .client
            .lock()
            .await
            .prepare(statement.sql())
            .await
            .map_err(map_error)?;
        self.prepared = Some(prepared);
        Ok(())
    }

    async fn execute(&mut self, values: &[Option<String>]) -> Result<u64, DbError> {
        let statement = self
            .prepared
            .as_ref()
            .ok_or_else(|| DbError::other("no statement prepared"))?;
        let client = self.client.lock().await;
        if !self.in_transaction {
            return client
                .execute(statement, &params(values))
                .await
                .map_err(map_error);
        }

        client
            .batch_execute(&format!("SAVEPOINT {SAVEPOINT}"))
            .await
            .map_err(map_error)?;
        match client.execute(statement, &params(values)).await {
            Ok(count) => {
                client
                    .batch_execute(&format!("RELEASE SAVEPOINT {SAVEPOINT}"))
                    .await
                    .map_err(map_error)?;
                Ok(count)
            }
            Err(e) => {
                client
                    .batch_execute(&format!("ROLLBACK TO SAVEPOINT {SAVEPOINT}"))
                    .await
                    .map_err(map_error)?;
                Err(map_error(e))
            }
        }
    }

    async fn query_row(
        &mut self,
        statement: &DmlStatement,
        values: &[Option<String>],
    ) -> Result<Option<RowValues>, DbError> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(statement.sql(), &params(values))
            .await
            .map_err(map_error)?;
        let Some(row) = row else {
            return Ok(None);
        };
        match statement.dml_type() {
            DmlType::Count => {
                let count: i64 = row.try_get(0).map_err(map_error)?;
                Ok(Some(vec![Some(count.to_string())]))
            }
            _ => (0..row.len())
                .map(|i| row.try_get::<_, Option<String>>(i))
                .collect::<Result<RowValues, _>>()
                .map(Some)
                .map_err(map_error),
        }
    }

    async fn execute_sql(&mut self, sql: &str) -> Result<u64, DbError> {
        self.client
            .lock()
            .await
            .execute(sql, &[])
            .await
            .map_err(map_error)
    }

    async fn apply_table(&mut self, table: &TableShape) -> Result<(), DbError> {
        let client = self.client.lock().await;
        let existing = fetch_table_shape(&client, &table.name, &self.default_schema).await?;
        let statements = match existing {
            None => vec![create_table_sql(table, self.dialect.as_ref())],
            Some(existing) => table
                .columns
                .iter()
                .filter(|c| !c.generated && existing.column_index(&c.name).is_none())
                .map(|c| add_column_sql(&existing, c, self.dialect.as_ref()))
                .collect(),
        };
        for sql in statements {
            debug!("Applying {}", sql);
            client.batch_execute(&sql).await.map_err(map_error)?;
        }
        Ok(())
    }

    async fn server_time(&mut self) -> Result<DateTime<Utc>, DbError> {
        let row = self
            .client
            .lock()
            .await
            .query_one("SELECT now()", &[])
            .await
            .map_err(map_error)?;
        row.try_get(0).map_err(map_error)
    }
}
