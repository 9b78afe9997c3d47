//! Outgoing batch selection and administration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use sync_core::{abbreviate, sort_channels, Batch, BatchStatus, Channel};
use tracing::{debug, info, warn};

use crate::clock::{Clock, NodeClock, SystemClock};
use crate::store::{BatchStore, BatchSummary, ChannelBacklog, StoreResult};

/// Maximum length of a persisted SQL error message.
pub const MAX_SQL_MESSAGE_LEN: usize = 1000;

/// Selector configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorSettings {
    /// Upper bound on batches scanned per selection.
    pub max_batches_to_select: usize,
    pub include_disabled_channels: bool,
}

impl Default for SelectorSettings {
    fn default() -> Self {
        Self {
            max_batches_to_select: 1000,
            include_disabled_channels: false,
        }
    }
}

/// Selects batches for remote nodes and maintains their records.
pub struct OutgoingBatchService {
    store: Arc<dyn BatchStore>,
    channels: Vec<Channel>,
    node_clock: NodeClock,
    clock: Arc<dyn Clock>,
    settings: SelectorSettings,
    hostname: String,
}

impl OutgoingBatchService {
    pub fn new(store: Arc<dyn BatchStore>, mut channels: Vec<Channel>) -> Self {
        sort_channels(&mut channels);
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            store,
            channels,
            node_clock: NodeClock::new(),
            clock: Arc::new(SystemClock),
            settings: SelectorSettings::default(),
            hostname,
        }
    }

    pub fn with_settings(mut self, settings: SelectorSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_node_clock(mut self, node_clock: NodeClock) -> Self {
        self.node_clock = node_clock;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn settings(&self) -> &SelectorSettings {
        &self.settings
    }

    /// Channels in selection order.
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn store(&self) -> &Arc<dyn BatchStore> {
        &self.store
    }

    /// Next batches to send to `node_id`.
    ///
    /// Channels are visited by processing order. Each channel contributes at
    /// most `max_batch_to_send` of its pending batches in batch-id order, and
    /// nothing at all while it is disabled (unless `include_disabled`) or
    /// outside its windows on the node's clock. Batches on channels that are
    /// not configured are never selected.
    pub async fn get_outgoing_batches(
        &self,
        node_id: &str,
        include_disabled: bool,
    ) -> StoreResult<Vec<Batch>> {
        let started = std::time::Instant::now();
        let pending = self
            .store
            .find_pending_for_node(node_id, &BatchStatus::PENDING, self.settings.max_batches_to_select)
            .await?;
        let fetched = pending.len();

        let mut by_channel: HashMap<String, Vec<Batch>> = HashMap::new();
        for batch in pending {
            by_channel.entry(batch.channel_id.clone()).or_default().push(batch);
        }

        let now = self.node_clock.now_for(self.clock.as_ref(), node_id);
        let mut keepers = Vec::new();
        for channel in &self.channels {
            let Some(mut batches) = by_channel.remove(&channel.channel_id) else {
                continue;
            };
            if !channel.enabled && !include_disabled {
                debug!(
                    "Skipping {} batches on disabled channel {} for node {}",
                    batches.len(),
                    channel.channel_id,
                    node_id
                );
                continue;
            }
            if !channel.in_window(&now) {
                debug!(
                    "Channel {} is outside its send window at {} for node {}",
                    channel.channel_id, now, node_id
                );
                continue;
            }
            batches.truncate(channel.max_batch_to_send);
            keepers.append(&mut batches);
        }

        for (channel_id, batches) in &by_channel {
            warn!(
                "Node {} has {} pending batches on unconfigured channel {}",
                node_id,
                batches.len(),
                channel_id
            );
        }

        debug!(
            "Selected {} of {} pending batches for node {} in {:?}",
            keepers.len(),
            fetched,
            node_id,
            started.elapsed()
        );
        Ok(keepers)
    }

    /// Marks every unsent batch of `node_id` as `OK`, newest first.
    ///
    /// Ignored batches are already terminal and stay as they are.
    pub async fn mark_all_as_sent_for_node(&self, node_id: &str) -> StoreResult<usize> {
        let statuses: Vec<BatchStatus> = BatchStatus::PENDING
            .into_iter()
            .filter(|s| *s != BatchStatus::Ignored)
            .collect();
        let mut marked = 0;
        loop {
            let batches = self
                .store
                .find_pending_for_node(node_id, &statuses, self.settings.max_batches_to_select)
                .await?;
            if batches.is_empty() {
                break;
            }
            for mut batch in batches.into_iter().rev() {
                batch.status = BatchStatus::Ok;
                batch.error_flag = false;
                self.update_batch(&mut batch).await?;
                marked += 1;
            }
        }
        info!("Marked {} batches as sent for node {}", marked, node_id);
        Ok(marked)
    }

    /// Returns batches abandoned in `RT` to `NE`.
    pub async fn update_abandoned_routing_batches(&self) -> StoreResult<u64> {
        let reset = self
            .store
            .update_status_where(BatchStatus::Routing, BatchStatus::New)
            .await?;
        if reset > 0 {
            info!("Reset {} abandoned routing batches to {}", reset, BatchStatus::New);
        }
        Ok(reset)
    }

    /// Stamps the update host and time, then persists the batch.
    pub async fn update_batch(&self, batch: &mut Batch) -> StoreResult<()> {
        batch.last_update_time = Some(self.clock.now());
        batch.last_update_hostname = Some(self.hostname.clone());
        if let Some(message) = batch.sql_message.as_mut() {
            *message = abbreviate(message, MAX_SQL_MESSAGE_LEN);
        }
        self.store.update_batch(batch).await
    }

    pub async fn update_batches(&self, batches: &mut [Batch]) -> StoreResult<()> {
        for batch in batches.iter_mut() {
            self.update_batch(batch).await?;
        }
        Ok(())
    }

    pub async fn insert_batch(&self, batch: &mut Batch) -> StoreResult<()> {
        self.store.insert_batch(batch).await
    }

    pub async fn find_batch(&self, batch_id: i64) -> StoreResult<Option<Batch>> {
        self.store.find_batch(batch_id).await
    }

    pub async fn count_batches_in_error(&self) -> StoreResult<i64> {
        self.store.count_in_error().await
    }

    pub async fn count_batches_unsent(&self) -> StoreResult<i64> {
        self.store.count_unsent().await
    }

    pub async fn count_unsent_by_channel(&self, node_id: &str) -> StoreResult<Vec<ChannelBacklog>> {
        self.store.count_unsent_by_channel(node_id).await
    }

    /// Whether `node_id` still has batches on `channel_id` that are not `OK`.
    pub async fn is_unsent_data_on_channel(&self, node_id: &str, channel_id: &str) -> StoreResult<bool> {
        let statuses: Vec<BatchStatus> = BatchStatus::PENDING
            .into_iter()
            .chain([BatchStatus::Routing])
            .collect();
        let batches = self
            .store
            .find_pending_for_node(node_id, &statuses, self.settings.max_batches_to_select)
            .await?;
        Ok(batches.iter().any(|b| b.channel_id == channel_id))
    }

    pub async fn batch_range(&self, start_id: i64, end_id: i64) -> StoreResult<Vec<Batch>> {
        self.store.batches_in_range(start_id, end_id).await
    }

    pub async fn batches_in_time_range(
        &self,
        node_id: &str,
        channel_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<Batch>> {
        self.store
            .batches_in_time_range(node_id, channel_id, start, end)
            .await
    }

    pub async fn batch_errors(&self, max_rows: usize) -> StoreResult<Vec<Batch>> {
        self.store.batches_in_error(max_rows).await
    }

    pub async fn summary(&self, statuses: &[BatchStatus]) -> StoreResult<Vec<BatchSummary>> {
        self.store.summary_by_status(statuses).await
    }

    pub async fn nodes_in_error(&self) -> StoreResult<Vec<String>> {
        self.store.nodes_in_error().await
    }
}
