//! In-memory batch store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use sync_core::{Batch, BatchStatus};
use tokio::sync::RwLock;

use crate::store::{
    BatchStore, BatchSummary, ChannelBacklog, StoreError, StoreResult, BACKLOG_STATUSES,
};

#[derive(Debug, Default)]
struct MemoryState {
    batches: BTreeMap<i64, Batch>,
    last_id: i64,
}

/// [`BatchStore`] keeping batches in a map ordered by batch id.
#[derive(Debug, Default)]
pub struct MemoryBatchStore {
    state: RwLock<MemoryState>,
}

impl MemoryBatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.batches.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.batches.is_empty()
    }
}

#[async_trait]
impl BatchStore for MemoryBatchStore {
    async fn insert_batch(&self, batch: &mut Batch) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if batch.batch_id == 0 {
            state.last_id += 1;
            batch.batch_id = state.last_id;
        } else if state.batches.contains_key(&batch.batch_id) {
            return Err(StoreError::Database(format!(
                "duplicate outgoing batch id {}",
                batch.batch_id
            )));
        } else {
            state.last_id = state.last_id.max(batch.batch_id);
        }
        state.batches.insert(batch.batch_id, batch.clone());
        Ok(())
    }

    async fn update_batch(&self, batch: &Batch) -> StoreResult<()> {
        let mut state = self.state.write().await;
        match state.batches.get_mut(&batch.batch_id) {
            Some(stored) => {
                *stored = batch.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(batch.batch_id)),
        }
    }

    async fn find_batch(&self, batch_id: i64) -> StoreResult<Option<Batch>> {
        Ok(self.state.read().await.batches.get(&batch_id).cloned())
    }

    async fn find_pending_for_node(
        &self,
        node_id: &str,
        statuses: &[BatchStatus],
        limit: usize,
    ) -> StoreResult<Vec<Batch>> {
        let state = self.state.read().await;
        Ok(state
            .batches
            .values()
            .filter(|b| b.node_id == node_id && statuses.contains(&b.status))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_status_where(&self, from: BatchStatus, to: BatchStatus) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let mut updated = 0;
        for batch in state.batches.values_mut().filter(|b| b.status == from) {
            batch.status = to;
            updated += 1;
        }
        Ok(updated)
    }

    async fn count_in_error(&self) -> StoreResult<i64> {
        let state = self.state.read().await;
        Ok(state.batches.values().filter(|b| b.error_flag).count() as i64)
    }

    async fn count_unsent(&self) -> StoreResult<i64> {
        let state = self.state.read().await;
        Ok(state
            .batches
            .values()
            .filter(|b| b.status != BatchStatus::Ok)
            .count() as i64)
    }

    async fn count_unsent_by_channel(&self, node_id: &str) -> StoreResult<Vec<ChannelBacklog>> {
        let state = self.state.read().await;
        let mut counts: HashMap<&str, i64> = HashMap::new();
        for batch in state
            .batches
            .values()
            .filter(|b| b.node_id == node_id && BACKLOG_STATUSES.contains(&b.status))
        {
            *counts.entry(batch.channel_id.as_str()).or_default() += 1;
        }
        let mut backlog: Vec<ChannelBacklog> = counts
            .into_iter()
            .map(|(channel_id, batch_count)| ChannelBacklog {
                channel_id: channel_id.to_string(),
                batch_count,
            })
            .collect();
        backlog.sort_by(|a, b| {
            b.batch_count
                .cmp(&a.batch_count)
                .then_with(|| a.channel_id.cmp(&b.channel_id))
        });
        Ok(backlog)
    }

    async fn batches_in_range(&self, start_id: i64, end_id: i64) -> StoreResult<Vec<Batch>> {
        if start_id > end_id {
            return Ok(Vec::new());
        }
        let state = self.state.read().await;
        Ok(state
            .batches
            .range(start_id..=end_id)
            .map(|(_, b)| b.clone())
            .collect())
    }

    async fn batches_in_time_range(
        &self,
        node_id: &str,
        channel_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<Batch>> {
        let state = self.state.read().await;
        Ok(state
            .batches
            .values()
            .filter(|b| {
                b.node_id == node_id
                    && b.channel_id == channel_id
                    && b.create_time >= start
                    && b.create_time <= end
            })
            .cloned()
            .collect())
    }

    async fn batches_in_error(&self, limit: usize) -> StoreResult<Vec<Batch>> {
        let state = self.state.read().await;
        Ok(state
            .batches
            .values()
            .filter(|b| b.error_flag)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn summary_by_status(&self, statuses: &[BatchStatus]) -> StoreResult<Vec<BatchSummary>> {
        let state = self.state.read().await;
        let mut groups: BTreeMap<(String, String), BatchSummary> = BTreeMap::new();
        for batch in state.batches.values().filter(|b| statuses.contains(&b.status)) {
            let summary = groups
                .entry((batch.status.code().to_string(), batch.node_id.clone()))
                .or_insert_with(|| BatchSummary {
                    node_id: batch.node_id.clone(),
                    status: batch.status,
                    batch_count: 0,
                    data_row_count: 0,
                    oldest_batch_time: None,
                });
            summary.batch_count += 1;
            summary.data_row_count += batch.counters.data_row_count;
            summary.oldest_batch_time = Some(match summary.oldest_batch_time {
                Some(oldest) => oldest.min(batch.create_time),
                None => batch.create_time,
            });
        }
        let mut summaries: Vec<BatchSummary> = groups.into_values().collect();
        summaries.sort_by_key(|s| s.oldest_batch_time);
        Ok(summaries)
    }

    async fn nodes_in_error(&self) -> StoreResult<Vec<String>> {
        let state = self.state.read().await;
        let nodes: BTreeSet<&str> = state
            .batches
            .values()
            .filter(|b| b.error_flag)
            .map(|b| b.node_id.as_str())
            .collect();
        Ok(nodes.into_iter().map(str::to_string).collect())
    }
}
