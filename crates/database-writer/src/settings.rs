//! Writer configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// When the writer commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CommitPolicy {
    /// One transaction per batch; a failure rolls back every row.
    Atomic,
    /// Commit whenever `max_rows` rows are uncommitted, then continue.
    ///
    /// Bounds transaction size on very large batches at the cost of batch
    /// atomicity: a later failure only rolls back rows since the last commit.
    EarlyCommit {
        max_rows: u64,
        #[serde(default)]
        sleep: Duration,
    },
}

impl Default for CommitPolicy {
    fn default() -> Self {
        CommitPolicy::EarlyCommit {
            max_rows: 10_000,
            sleep: Duration::ZERO,
        }
    }
}

/// Settings for one writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterSettings {
    pub commit_policy: CommitPolicy,
    /// Updates only set columns whose value changed.
    pub apply_changes_only: bool,
    /// Take key flags from the source shape instead of the target's.
    pub use_primary_keys_from_source: bool,
    /// Use the dialect's insert-ignore form; skipped rows count as conflicts.
    pub insert_ignores_duplicates: bool,
    /// Log every conflict resolution at info level.
    pub log_conflict_resolution: bool,
    pub quote_identifiers: bool,
    /// Overrides the catalog of every target table.
    pub target_catalog: Option<String>,
    /// Overrides the schema of every target table.
    pub target_schema: Option<String>,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            commit_policy: CommitPolicy::default(),
            apply_changes_only: true,
            use_primary_keys_from_source: false,
            insert_ignores_duplicates: false,
            log_conflict_resolution: false,
            quote_identifiers: true,
            target_catalog: None,
            target_schema: None,
        }
    }
}

impl WriterSettings {
    pub fn atomic() -> Self {
        Self {
            commit_policy: CommitPolicy::Atomic,
            ..Self::default()
        }
    }

    pub fn early_commit(max_rows: u64) -> Self {
        Self {
            commit_policy: CommitPolicy::EarlyCommit {
                max_rows,
                sleep: Duration::ZERO,
            },
            ..Self::default()
        }
    }
}
