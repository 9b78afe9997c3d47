//! Writer connection over `mysql_async`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use database_writer::{Connection, DbError};
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Pool, Row, Statement, Value};
use std::sync::Arc;
use sync_core::{RowValues, TableShape};
use sync_dml::{Dialect, DmlStatement, MySqlDialect};
use tokio::sync::Mutex;
use tracing::debug;

use crate::introspect::fetch_table_shape;
use crate::types::{add_column_sql, create_table_sql, map_error, value_to_text};

/// Connection options for `url`.
///
/// Affected-row counts report matched rows, so an update that rewrites a row
/// with its stored values still counts as applied.
pub fn connection_opts(url: &str) -> anyhow::Result<Opts> {
    let opts = Opts::from_url(url)
        .map_err(|e| anyhow::anyhow!("Invalid MySQL connection url: {e}"))?;
    Ok(OptsBuilder::from_opts(opts).client_found_rows(true).into())
}

/// Opens one connection from `url`, shared between a [`MySqlConnection`] and a
/// [`MySqlIntrospector`](crate::MySqlIntrospector).
pub async fn new_mysql_connection(url: &str) -> anyhow::Result<Arc<Mutex<Conn>>> {
    let pool = Pool::new(connection_opts(url)?);
    let conn = pool.get_conn().await?;
    Ok(Arc::new(Mutex::new(conn)))
}

fn params(values: &[Option<String>]) -> Vec<Value> {
    values.iter().cloned().map(Value::from).collect()
}

/// [`Connection`] for a MySQL or MariaDB target.
pub struct MySqlConnection {
    conn: Arc<Mutex<Conn>>,
    dialect: Arc<MySqlDialect>,
    prepared: Option<Statement>,
}

impl MySqlConnection {
    pub fn new(conn: Arc<Mutex<Conn>>) -> Self {
        Self {
            conn,
            dialect: Arc::new(MySqlDialect),
            prepared: None,
        }
    }

    pub fn conn(&self) -> &Arc<Mutex<Conn>> {
        &self.conn
    }
}

#[async_trait]
impl Connection for MySqlConnection {
    fn dialect(&self) -> Arc<dyn Dialect> {
        self.dialect.clone()
    }

    async fn begin(&mut self) -> Result<(), DbError> {
        self.conn
            .lock()
            .await
            .query_drop("START TRANSACTION")
            .await
            .map_err(map_error)
    }

    async fn commit(&mut self) -> Result<(), DbError> {
        self.conn
            .lock()
            .await
            .query_drop("COMMIT")
            .await
            .map_err(map_error)
    }

    async fn rollback(&mut self) -> Result<(), DbError> {
        self.conn
            .lock()
            .await
            .query_drop("ROLLBACK")
            .await
            .map_err(map_error)
    }

    async fn prepare(&mut self, statement: &DmlStatement) -> Result<(), DbError> {
        debug!("Preparing {}", statement.sql());
        let prepared = self
            .conn
            .lock()
            .await
            .prep(statement.sql())
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
        let mut conn = self.conn.lock().await;
        conn.exec_drop(statement, params(values))
            .await
            .map_err(map_error)?;
        Ok(conn.affected_rows())
    }

    async fn query_row(
        &mut self,
        statement: &DmlStatement,
        values: &[Option<String>],
    ) -> Result<Option<RowValues>, DbError> {
        let row: Option<Row> = self
            .conn
            .lock()
            .await
            .exec_first(statement.sql(), params(values))
            .await
            .map_err(map_error)?;
        Ok(row.map(|row| {
            (0..row.len())
                .map(|i| row.as_ref(i).and_then(value_to_text))
                .collect()
        }))
    }

    async fn execute_sql(&mut self, sql: &str) -> Result<u64, DbError> {
        let mut conn = self.conn.lock().await;
        conn.query_drop(sql).await.map_err(map_error)?;
        Ok(conn.affected_rows())
    }

    async fn apply_table(&mut self, table: &TableShape) -> Result<(), DbError> {
        let mut conn = self.conn.lock().await;
        let existing = fetch_table_shape(&mut conn, &table.name).await?;
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
            conn.query_drop(sql).await.map_err(map_error)?;
        }
        Ok(())
    }

    async fn server_time(&mut self) -> Result<DateTime<Utc>, DbError> {
        let now: Option<String> = self
            .conn
            .lock()
            .await
            .query_first("SELECT DATE_FORMAT(UTC_TIMESTAMP(6), '%Y-%m-%d %H:%i:%s.%f')")
            .await
            .map_err(map_error)?;
        let now = now.ok_or_else(|| DbError::other("UTC_TIMESTAMP returned no row"))?;
        NaiveDateTime::parse_from_str(&now, "%Y-%m-%d %H:%M:%S%.f")
            .map(|ts| ts.and_utc())
            .map_err(|e| DbError::other(format!("Unexpected server time '{now}': {e}")))
    }
}
