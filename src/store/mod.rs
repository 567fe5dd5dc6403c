//! Persistence traits for counters, rules, violations and reputation.
//!
//! The engines only talk to storage through these traits, so any
//! transactional backend can be plugged in. `MemoryStore` is the bundled
//! implementation.

mod memory;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::ratelimit::{
    Metric, Quota, QuotaKey, Rule, Scope, Violation, ViolationStats, WindowKey,
};
use crate::reputation::{ReputationEvent, ReputationEventType, UserReputation};

pub use memory::MemoryStore;

/// One hit against a sliding-window rule.
#[derive(Debug, Clone)]
pub struct WindowHit {
    pub key: WindowKey,
    pub system_id: String,
    pub scope: Scope,
    /// Truncated start of the window; identifies the bucket this hit lands in
    pub window_start: DateTime<Utc>,
    pub at: DateTime<Utc>,
}

/// Storage for rules and the decision engine's counters.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Persist a new rule and return it with its assigned id.
    async fn insert_rule(&self, rule: Rule) -> Result<Rule>;

    /// Replace a rule. Returns `false` if no rule has that id.
    async fn update_rule(&self, rule: Rule) -> Result<bool>;

    /// Delete a rule, returning it if it existed.
    async fn delete_rule(&self, rule_id: i64) -> Result<Option<Rule>>;

    async fn get_rule(&self, rule_id: i64) -> Result<Option<Rule>>;

    /// Rules owned by `system_id` or by the global system.
    async fn list_rules(&self, system_id: &str, enabled_only: bool) -> Result<Vec<Rule>>;

    /// Record a hit and return the windowed count observed before it.
    ///
    /// The count is the sum of the key's buckets overlapping
    /// `[window_start, at]`. Summing and incrementing happen atomically per
    /// key, so concurrent callers never observe the same prior count.
    async fn record_window_hit(&self, hit: WindowHit) -> Result<u64>;

    /// Delete buckets whose last hit is before `before`.
    async fn delete_buckets_before(&self, before: DateTime<Utc>) -> Result<u64>;

    /// Consume one unit of the quota row for `key`, creating it from
    /// `template` with `used = 1` if absent. Returns `used` before this call.
    async fn consume_quota(&self, key: QuotaKey, template: Quota) -> Result<u64>;

    /// The quota row live at `now`, optionally restricted to a resource type.
    async fn find_live_quota(
        &self,
        system_id: &str,
        scope: Scope,
        scope_value: &str,
        resource_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Quota>>;

    /// Add `amount` to the live quota row. Returns the updated row, or `None`
    /// when there is no live row.
    async fn add_quota_usage(
        &self,
        system_id: &str,
        scope: Scope,
        scope_value: &str,
        resource_type: &str,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<Quota>>;

    async fn insert_violation(&self, violation: Violation) -> Result<()>;

    /// Violations for a system at or after `since`, newest first.
    async fn list_violations(&self, system_id: &str, since: DateTime<Utc>)
        -> Result<Vec<Violation>>;

    async fn violation_stats(&self, system_id: &str) -> Result<ViolationStats>;

    async fn delete_violations_before(&self, before: DateTime<Utc>) -> Result<u64>;

    async fn insert_metric(&self, metric: Metric) -> Result<()>;

    async fn delete_metrics_before(&self, before: DateTime<Utc>) -> Result<u64>;
}

/// Storage for per-user reputation and its audit trail.
#[async_trait]
pub trait ReputationStore: Send + Sync {
    /// Fetch a user's row, inserting a neutral one stamped `now` if absent.
    async fn get_or_create_reputation(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UserReputation>;

    async fn put_reputation(&self, reputation: UserReputation) -> Result<()>;

    async fn list_reputations(&self) -> Result<Vec<UserReputation>>;

    async fn insert_rep_event(&self, event: ReputationEvent) -> Result<()>;

    /// A user's events at or after `since`, newest first.
    async fn list_rep_events(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ReputationEvent>>;

    /// Number of events of a type, across all users, at or after `since`.
    async fn count_rep_events(
        &self,
        event_type: ReputationEventType,
        since: DateTime<Utc>,
    ) -> Result<u64>;
}
