//! Conflict policies: how the writer finds the target row and what it does
//! when a write collides.

use serde::{Deserialize, Serialize};

/// How the row to update or delete is located at the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum DetectConflict {
    /// Primary key only.
    UsePkData,
    /// Every column of the previous row.
    UseOldData,
    /// Changed columns plus the primary key.
    UseChangedData,
    /// A version column plus the primary key.
    UseVersion { column: String },
    /// A timestamp column plus the primary key.
    UseTimestamp { column: String },
}

impl DetectConflict {
    /// Version or timestamp column, for the strategies that have one.
    pub fn version_column(&self) -> Option<&str> {
        match self {
            DetectConflict::UseVersion { column } | DetectConflict::UseTimestamp { column } => {
                Some(column)
            }
            _ => None,
        }
    }
}

/// What happens once a conflict is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolveConflict {
    /// Insert becomes update, update becomes insert, delete retries by key.
    Fallback,
    /// Apply the incoming row only if its version/timestamp is newer.
    NewerWins,
    /// Skip the row (or the whole batch, unless `resolve_row_only`).
    Ignore,
    /// Fail the batch.
    Manual,
}

/// Detection and resolution strategy for one (channel, table) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictPolicy {
    #[serde(default)]
    pub conflict_id: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    /// Target table name, matched case-insensitively.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default = "default_detect")]
    pub detect: DetectConflict,
    #[serde(default = "default_resolve")]
    pub resolve: ResolveConflict,
    #[serde(default = "default_true")]
    pub resolve_row_only: bool,
    /// Fallback updates only touch changed columns.
    #[serde(default)]
    pub resolve_changes_only: bool,
    /// Columns never used to locate rows.
    #[serde(default)]
    pub excluded_columns: Vec<String>,
}

fn default_detect() -> DetectConflict {
    DetectConflict::UsePkData
}

fn default_resolve() -> ResolveConflict {
    ResolveConflict::Manual
}

fn default_true() -> bool {
    true
}

impl Default for ConflictPolicy {
    fn default() -> Self {
        Self {
            conflict_id: None,
            channel_id: None,
            table: None,
            detect: default_detect(),
            resolve: default_resolve(),
            resolve_row_only: true,
            resolve_changes_only: false,
            excluded_columns: Vec::new(),
        }
    }
}

impl ConflictPolicy {
    pub fn new(detect: DetectConflict, resolve: ResolveConflict) -> Self {
        Self {
            detect,
            resolve,
            ..Self::default()
        }
    }

    pub fn for_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn for_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    pub fn excluding(mut self, columns: &[&str]) -> Self {
        self.excluded_columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn id(&self) -> &str {
        self.conflict_id.as_deref().unwrap_or("default")
    }

    pub fn is_excluded(&self, column: &str) -> bool {
        self.excluded_columns
            .iter()
            .any(|c| c.eq_ignore_ascii_case(column))
    }

    /// Match rank against a (channel, table) pair; `None` when it doesn't apply.
    ///
    /// Higher ranks win: channel and table (3), table (2), channel (1), neither (0).
    pub fn match_rank(&self, channel_id: &str, table: &str) -> Option<u8> {
        let channel_match = match &self.channel_id {
            Some(c) if c == channel_id => Some(true),
            Some(_) => None,
            None => Some(false),
        }?;
        let table_match = match &self.table {
            Some(t) if t.eq_ignore_ascii_case(table) => Some(true),
            Some(_) => None,
            None => Some(false),
        }?;
        Some(match (channel_match, table_match) {
            (true, true) => 3,
            (false, true) => 2,
            (true, false) => 1,
            (false, false) => 0,
        })
    }
}

/// Picks the most specific policy for a (channel, table) pair.
pub fn pick_policy<'a>(
    policies: &'a [ConflictPolicy],
    channel_id: &str,
    table: &str,
) -> Option<&'a ConflictPolicy> {
    policies
        .iter()
        .filter_map(|p| p.match_rank(channel_id, table).map(|rank| (rank, p)))
        .max_by_key(|(rank, _)| *rank)
        .map(|(_, p)| p)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = ConflictPolicy::default();
        assert_eq!(policy.detect, DetectConflict::UsePkData);
        assert_eq!(policy.resolve, ResolveConflict::Manual);
        assert_eq!(policy.id(), "default");
    }

    #[test]
    fn test_pick_most_specific_policy() {
        let policies = vec![
            ConflictPolicy::new(DetectConflict::UsePkData, ResolveConflict::Ignore),
            ConflictPolicy::new(DetectConflict::UseOldData, ResolveConflict::Fallback)
                .for_table("ITEM"),
            ConflictPolicy::new(DetectConflict::UseChangedData, ResolveConflict::Fallback)
                .for_channel("sales")
                .for_table("item"),
            ConflictPolicy::new(DetectConflict::UsePkData, ResolveConflict::Manual)
                .for_channel("other"),
        ];

        let picked = pick_policy(&policies, "sales", "item").unwrap();
        assert_eq!(picked.detect, DetectConflict::UseChangedData);

        let picked = pick_policy(&policies, "default", "item").unwrap();
        assert_eq!(picked.detect, DetectConflict::UseOldData);

        let picked = pick_policy(&policies, "other", "customer").unwrap();
        assert_eq!(picked.resolve, ResolveConflict::Manual);

        let picked = pick_policy(&policies, "default", "customer").unwrap();
        assert_eq!(picked.resolve, ResolveConflict::Ignore);
    }

    #[test]
    fn test_policy_from_toml_like_json() {
        let policy: ConflictPolicy = serde_json::from_str(
            r#"{"table":"item","detect":{"strategy":"use_version","column":"rev"},"resolve":"newer_wins"}"#,
        )
        .unwrap();
        assert_eq!(policy.detect.version_column(), Some("rev"));
        assert_eq!(policy.resolve, ResolveConflict::NewerWins);
        assert!(policy.resolve_row_only);
    }
}
