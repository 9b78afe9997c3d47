//! PostgreSQL batch store
//!
//! Batches live in one `<prefix>outgoing_batch` table. Counters are kept in a
//! `jsonb` column so new counters never need a migration.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use sync_core::{Batch, BatchCounters, BatchStatus};
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, info};

use crate::store::{
    BatchStore, BatchSummary, ChannelBacklog, StoreError, StoreResult, BACKLOG_STATUSES,
};

const BATCH_COLUMNS: &str = "batch_id, node_id, channel_id, status, error_flag, counters, \
     sql_state, sql_code, sql_message, failed_row_number, failed_statement, summary, \
     create_time, last_update_time, last_update_hostname";

/// [`BatchStore`] over a shared `tokio-postgres` client.
pub struct PostgresBatchStore {
    client: Arc<Mutex<Client>>,
    table: String,
}

impl PostgresBatchStore {
    /// Uses `client` with tables named `<table_prefix>outgoing_batch`.
    pub fn new(client: Arc<Mutex<Client>>, table_prefix: &str) -> StoreResult<Self> {
        if !table_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(StoreError::Database(format!(
                "Invalid table prefix '{table_prefix}'"
            )));
        }
        Ok(Self {
            client,
            table: format!("{table_prefix}outgoing_batch"),
        })
    }

    /// Connects to `url` and spawns the connection task.
    pub async fn connect(url: &str, table_prefix: &str) -> StoreResult<Self> {
        let (client, connection) = tokio_postgres::connect(url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!("Batch store connection error: {e}");
            }
        });
        Self::new(Arc::new(Mutex::new(client)), table_prefix)
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Creates the batch table and its indexes when missing.
    pub async fn initialize(&self) -> StoreResult<()> {
        let table = &self.table;
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                batch_id BIGSERIAL PRIMARY KEY,
                node_id VARCHAR(50) NOT NULL,
                channel_id VARCHAR(128) NOT NULL,
                status VARCHAR(2) NOT NULL,
                error_flag BOOLEAN NOT NULL DEFAULT FALSE,
                counters JSONB NOT NULL DEFAULT '{{}}'::jsonb,
                sql_state VARCHAR(10),
                sql_code INTEGER NOT NULL DEFAULT 0,
                sql_message TEXT,
                failed_row_number BIGINT NOT NULL DEFAULT 0,
                failed_statement TEXT,
                summary TEXT,
                create_time TIMESTAMPTZ NOT NULL DEFAULT now(),
                last_update_time TIMESTAMPTZ,
                last_update_hostname VARCHAR(255)
            );
            CREATE INDEX IF NOT EXISTS {table}_node_status_idx ON {table} (node_id, status, batch_id);
            CREATE INDEX IF NOT EXISTS {table}_error_idx ON {table} (error_flag);"
        );
        self.client.lock().await.batch_execute(&ddl).await?;
        info!("Initialized outgoing batch table {}", table);
        Ok(())
    }

    async fn query_batches(
        &self,
        predicate: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> StoreResult<Vec<Batch>> {
        let sql = format!("SELECT {BATCH_COLUMNS} FROM {} {predicate}", self.table);
        let rows = self.client.lock().await.query(&sql, params).await?;
        rows.iter().map(batch_from_row).collect()
    }
}

fn status_codes(statuses: &[BatchStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.code().to_string()).collect()
}

/// `LIMIT` parameter; sizes beyond `i64` saturate.
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn batch_from_row(row: &Row) -> StoreResult<Batch> {
    let status: String = row.try_get("status")?;
    let counters: serde_json::Value = row.try_get("counters")?;
    let counters: BatchCounters = serde_json::from_value(counters)?;
    Ok(Batch {
        batch_id: row.try_get("batch_id")?,
        node_id: row.try_get("node_id")?,
        channel_id: row.try_get("channel_id")?,
        status: status.parse()?,
        error_flag: row.try_get("error_flag")?,
        counters,
        sql_state: row.try_get("sql_state")?,
        sql_code: row.try_get("sql_code")?,
        sql_message: row.try_get("sql_message")?,
        failed_row_number: row.try_get("failed_row_number")?,
        failed_statement: row.try_get("failed_statement")?,
        summary: row.try_get("summary")?,
        create_time: row.try_get("create_time")?,
        last_update_time: row.try_get("last_update_time")?,
        last_update_hostname: row.try_get("last_update_hostname")?,
    })
}

#[async_trait]
impl BatchStore for PostgresBatchStore {
    async fn insert_batch(&self, batch: &mut Batch) -> StoreResult<()> {
        let table = &self.table;
        let counters = serde_json::to_value(&batch.counters)?;
        let status = batch.status.code();
        let client = self.client.lock().await;
        if batch.batch_id == 0 {
            let sql = format!(
                "INSERT INTO {table} (node_id, channel_id, status, error_flag, counters, summary, create_time)
                 VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING batch_id"
            );
            let row = client
                .query_one(
                    &sql,
                    &[
                        &batch.node_id,
                        &batch.channel_id,
                        &status,
                        &batch.error_flag,
                        &counters,
                        &batch.summary,
                        &batch.create_time,
                    ],
                )
                .await?;
            batch.batch_id = row.try_get(0)?;
        } else {
            let sql = format!(
                "INSERT INTO {table} (batch_id, node_id, channel_id, status, error_flag, counters, summary, create_time)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
            );
            client
                .execute(
                    &sql,
                    &[
                        &batch.batch_id,
                        &batch.node_id,
                        &batch.channel_id,
                        &status,
                        &batch.error_flag,
                        &counters,
                        &batch.summary,
                        &batch.create_time,
                    ],
                )
                .await?;
            // Keep the sequence ahead of explicit ids.
            let sql = format!(
                "SELECT setval(pg_get_serial_sequence('{table}', 'batch_id'), \
                 (SELECT MAX(batch_id) FROM {table}))"
            );
            client.query(&sql, &[]).await?;
        }
        debug!("Inserted outgoing batch {} for node {}", batch.batch_id, batch.node_id);
        Ok(())
    }

    async fn update_batch(&self, batch: &Batch) -> StoreResult<()> {
        let sql = format!(
            "UPDATE {} SET status = $1, error_flag = $2, counters = $3, sql_state = $4, sql_code = $5,
                 sql_message = $6, failed_row_number = $7, failed_statement = $8, summary = $9,
                 last_update_time = $10, last_update_hostname = $11
             WHERE batch_id = $12",
            self.table
        );
        let counters = serde_json::to_value(&batch.counters)?;
        let updated = self
            .client
            .lock()
            .await
            .execute(
                &sql,
                &[
                    &batch.status.code(),
                    &batch.error_flag,
                    &counters,
                    &batch.sql_state,
                    &batch.sql_code,
                    &batch.sql_message,
                    &batch.failed_row_number,
                    &batch.failed_statement,
                    &batch.summary,
                    &batch.last_update_time,
                    &batch.last_update_hostname,
                    &batch.batch_id,
                ],
            )
            .await?;
        if updated == 0 {
            return Err(StoreError::NotFound(batch.batch_id));
        }
        Ok(())
    }

    async fn find_batch(&self, batch_id: i64) -> StoreResult<Option<Batch>> {
        let mut batches = self
            .query_batches("WHERE batch_id = $1", &[&batch_id])
            .await?;
        Ok(batches.pop())
    }

    async fn find_pending_for_node(
        &self,
        node_id: &str,
        statuses: &[BatchStatus],
        limit: usize,
    ) -> StoreResult<Vec<Batch>> {
        let codes = status_codes(statuses);
        let limit = sql_limit(limit);
        self.query_batches(
            "WHERE node_id = $1 AND status = ANY($2) ORDER BY batch_id LIMIT $3",
            &[&node_id, &codes, &limit],
        )
        .await
    }

    async fn update_status_where(&self, from: BatchStatus, to: BatchStatus) -> StoreResult<u64> {
        let sql = format!("UPDATE {} SET status = $1 WHERE status = $2", self.table);
        let updated = self
            .client
            .lock()
            .await
            .execute(&sql, &[&to.code(), &from.code()])
            .await?;
        Ok(updated)
    }

    async fn count_in_error(&self) -> StoreResult<i64> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE error_flag", self.table);
        let row = self.client.lock().await.query_one(&sql, &[]).await?;
        Ok(row.try_get(0)?)
    }

    async fn count_unsent(&self) -> StoreResult<i64> {
        let sql = format!("SELECT COUNT(*) FROM {} WHERE status <> 'OK'", self.table);
        let row = self.client.lock().await.query_one(&sql, &[]).await?;
        Ok(row.try_get(0)?)
    }

    async fn count_unsent_by_channel(&self, node_id: &str) -> StoreResult<Vec<ChannelBacklog>> {
        let sql = format!(
            "SELECT channel_id, COUNT(*) AS batch_count FROM {}
             WHERE node_id = $1 AND status = ANY($2)
             GROUP BY channel_id ORDER BY batch_count DESC, channel_id",
            self.table
        );
        let codes = status_codes(&BACKLOG_STATUSES);
        let rows = self
            .client
            .lock()
            .await
            .query(&sql, &[&node_id, &codes])
            .await?;
        rows.iter()
            .map(|row| -> StoreResult<ChannelBacklog> {
                Ok(ChannelBacklog {
                    channel_id: row.try_get("channel_id")?,
                    batch_count: row.try_get("batch_count")?,
                })
            })
            .collect()
    }

    async fn batches_in_range(&self, start_id: i64, end_id: i64) -> StoreResult<Vec<Batch>> {
        self.query_batches(
            "WHERE batch_id BETWEEN $1 AND $2 ORDER BY batch_id",
            &[&start_id, &end_id],
        )
        .await
    }

    async fn batches_in_time_range(
        &self,
        node_id: &str,
        channel_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<Batch>> {
        self.query_batches(
            "WHERE node_id = $1 AND channel_id = $2 AND create_time >= $3 AND create_time <= $4
             ORDER BY batch_id",
            &[&node_id, &channel_id, &start, &end],
        )
        .await
    }

    async fn batches_in_error(&self, limit: usize) -> StoreResult<Vec<Batch>> {
        let limit = sql_limit(limit);
        self.query_batches("WHERE error_flag ORDER BY batch_id LIMIT $1", &[&limit])
            .await
    }

    async fn summary_by_status(&self, statuses: &[BatchStatus]) -> StoreResult<Vec<BatchSummary>> {
        let sql = format!(
            "SELECT COUNT(*) AS batches,
                    COALESCE(SUM((counters->>'data_row_count')::bigint), 0)::bigint AS data,
                    status, node_id, MIN(create_time) AS oldest_batch_time
             FROM {} WHERE status = ANY($1)
             GROUP BY status, node_id ORDER BY oldest_batch_time",
            self.table
        );
        let codes = status_codes(statuses);
        let rows = self.client.lock().await.query(&sql, &[&codes]).await?;
        rows.iter()
            .map(|row| -> StoreResult<BatchSummary> {
                let status: String = row.try_get("status")?;
                Ok(BatchSummary {
                    node_id: row.try_get("node_id")?,
                    status: status.parse()?,
                    batch_count: row.try_get("batches")?,
                    data_row_count: row.try_get("data")?,
                    oldest_batch_time: row.try_get("oldest_batch_time")?,
                })
            })
            .collect()
    }

    async fn nodes_in_error(&self) -> StoreResult<Vec<String>> {
        let sql = format!(
            "SELECT DISTINCT node_id FROM {} WHERE error_flag ORDER BY node_id",
            self.table
        );
        let rows = self.client.lock().await.query(&sql, &[]).await?;
        rows.iter()
            .map(|row| -> StoreResult<String> { Ok(row.try_get(0)?) })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_limit_saturates() {
        assert_eq!(sql_limit(25), 25);
        assert_eq!(sql_limit(usize::MAX), i64::MAX);
    }
}
