//! Conflict policy lookup.

use sync_core::{pick_policy, ConflictPolicy, TableName};

/// Supplies the conflict policy for a (channel, table) pair.
pub trait ConflictPolicyProvider: Send + Sync {
    fn policy_for(&self, channel_id: &str, table: &TableName, batch_id: i64) -> ConflictPolicy;
}

/// Policies from configuration, most specific match wins.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredPolicies {
    policies: Vec<ConflictPolicy>,
    default: ConflictPolicy,
}

impl ConfiguredPolicies {
    pub fn new(policies: Vec<ConflictPolicy>) -> Self {
        Self {
            policies,
            default: ConflictPolicy::default(),
        }
    }

    /// Policy applied when nothing matches.
    pub fn with_default(mut self, default: ConflictPolicy) -> Self {
        self.default = default;
        self
    }
}

impl ConflictPolicyProvider for ConfiguredPolicies {
    fn policy_for(&self, channel_id: &str, table: &TableName, _batch_id: i64) -> ConflictPolicy {
        pick_policy(&self.policies, channel_id, &table.name)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}
