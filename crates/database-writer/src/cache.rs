//! Target Table Cache.
//!
//! Shared by every writer that talks to the same target. Readers take a
//! shared lock; the timeout reset and explicit invalidation take the write
//! lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use sync_core::{TableName, TableShape};
use tracing::debug;

struct CacheState {
    tables: HashMap<String, Arc<TableShape>>,
    last_reset: Instant,
    /// Bumped on every full reset.
    generation: u64,
}

/// Reconciled target shapes keyed by source table identity.
pub struct TargetTableCache {
    state: RwLock<CacheState>,
    timeout: Duration,
}

impl Default for TargetTableCache {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

impl TargetTableCache {
    pub fn new(timeout: Duration) -> Self {
        Self {
            state: RwLock::new(CacheState {
                tables: HashMap::new(),
                last_reset: Instant::now(),
                generation: 0,
            }),
            timeout,
        }
    }

    /// Cache key for a source shape: qualified name plus its column list.
    pub fn key_for(source: &TableShape) -> String {
        let columns = source
            .columns
            .iter()
            .map(|c| c.name.to_lowercase())
            .collect::<Vec<_>>()
            .join(",");
        format!("{}|{}", source.name.key(), columns)
    }

    fn read(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<Arc<TableShape>> {
        let expired = self.read().last_reset.elapsed() >= self.timeout;
        if expired {
            let mut state = self.write();
            if state.last_reset.elapsed() >= self.timeout {
                debug!("Target table cache expired, clearing {} entries", state.tables.len());
                state.tables.clear();
                state.last_reset = Instant::now();
                state.generation += 1;
            }
            return None;
        }
        self.read().tables.get(key).cloned()
    }

    pub fn put(&self, key: String, table: Arc<TableShape>) {
        self.write().tables.insert(key, table);
    }

    /// Drops every entry resolved for the source table `name`.
    pub fn invalidate(&self, name: &TableName) {
        let prefix = format!("{}|", name.key());
        let mut state = self.write();
        state.tables.retain(|key, _| !key.starts_with(&prefix));
    }

    pub fn clear(&self) {
        let mut state = self.write();
        state.tables.clear();
        state.last_reset = Instant::now();
        state.generation += 1;
    }

    /// Number of full resets so far, from expiry or [`clear`](Self::clear).
    pub fn generation(&self) -> u64 {
        self.read().generation
    }

    pub fn len(&self) -> usize {
        self.read().tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
