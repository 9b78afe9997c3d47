//! Outgoing batch storage trait and types
//!
//! The selector and the orchestration layer only talk to batches through
//! [`BatchStore`]; the row data is owned by the backing database, and status
//! transitions are the only concurrency control.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sync_core::{Batch, BatchError, BatchStatus};

/// Errors raised by batch stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Batch store database error: {0}")]
    Database(String),

    #[error("Outgoing batch {0} not found")]
    NotFound(i64),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("Failed to serialize batch counters: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<tokio_postgres::Error> for StoreError {
    fn from(e: tokio_postgres::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Batch count and data volume per (status, node).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub node_id: String,
    pub status: BatchStatus,
    pub batch_count: i64,
    pub data_row_count: i64,
    pub oldest_batch_time: Option<DateTime<Utc>>,
}

/// Unsent batch count for one channel of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelBacklog {
    pub channel_id: String,
    pub batch_count: i64,
}

/// Statuses counted as backlog per channel.
pub const BACKLOG_STATUSES: [BatchStatus; 5] = [
    BatchStatus::Error,
    BatchStatus::Requested,
    BatchStatus::New,
    BatchStatus::Querying,
    BatchStatus::Routing,
];

/// Trait for outgoing batch storage.
///
/// Implementations:
/// - [`MemoryBatchStore`](crate::MemoryBatchStore) for tests and embedding
/// - [`PostgresBatchStore`](crate::PostgresBatchStore) over `tokio-postgres`
#[async_trait]
pub trait BatchStore: Send + Sync {
    /// Stores a new batch.
    ///
    /// A `batch_id` of 0 is replaced by the next id of a monotonic sequence.
    async fn insert_batch(&self, batch: &mut Batch) -> StoreResult<()>;

    /// Persists status, diagnostics and every counter of an existing batch.
    async fn update_batch(&self, batch: &Batch) -> StoreResult<()>;

    async fn find_batch(&self, batch_id: i64) -> StoreResult<Option<Batch>>;

    /// Batches for `node_id` in one of `statuses`, ascending by batch id.
    async fn find_pending_for_node(
        &self,
        node_id: &str,
        statuses: &[BatchStatus],
        limit: usize,
    ) -> StoreResult<Vec<Batch>>;

    /// Moves every batch in status `from` to `to`, returning how many moved.
    async fn update_status_where(&self, from: BatchStatus, to: BatchStatus) -> StoreResult<u64>;

    /// Batches with the error flag set.
    async fn count_in_error(&self) -> StoreResult<i64>;

    /// Batches not yet `OK`.
    async fn count_unsent(&self) -> StoreResult<i64>;

    /// Backlog of `node_id` per channel, largest first.
    async fn count_unsent_by_channel(&self, node_id: &str) -> StoreResult<Vec<ChannelBacklog>>;

    /// Batches with ids in `[start_id, end_id]`.
    async fn batches_in_range(&self, start_id: i64, end_id: i64) -> StoreResult<Vec<Batch>>;

    /// Batches of one node and channel created in `[start, end]`.
    async fn batches_in_time_range(
        &self,
        node_id: &str,
        channel_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<Batch>>;

    /// Batches with the error flag set, ascending by batch id.
    async fn batches_in_error(&self, limit: usize) -> StoreResult<Vec<Batch>>;

    /// Summary of batches in `statuses`, oldest first.
    async fn summary_by_status(&self, statuses: &[BatchStatus]) -> StoreResult<Vec<BatchSummary>>;

    /// Nodes with at least one batch in error.
    async fn nodes_in_error(&self) -> StoreResult<Vec<String>>;
}
