//! A memory store wrapper that fails or stalls selected operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use super::{MemoryStore, RateLimitStore, ReputationStore, WindowHit};
use crate::error::{Result, TrustgateError};
use crate::ratelimit::{Metric, Quota, QuotaKey, Rule, Scope, Violation, ViolationStats};
use crate::reputation::{ReputationEvent, ReputationEventType, UserReputation};

/// Holds one read between fetching its row and returning it.
#[derive(Default)]
pub struct Stall {
    reached: Notify,
    release: Notify,
}

impl Stall {
    /// Wait until the stalled read has fetched its row.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[derive(Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    pub fail_rules: AtomicBool,
    pub fail_counters: AtomicBool,
    /// Fails bucket and violation deletes; metric deletes still go through
    pub fail_cleanup: AtomicBool,
    stall: Mutex<Option<Arc<Stall>>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stall the next `list_rules` or `get_or_create_reputation` call after
    /// it has read from the inner store.
    pub fn stall_next_read(&self) -> Arc<Stall> {
        let stall = Arc::new(Stall::default());
        *self.stall.lock() = Some(stall.clone());
        stall
    }

    async fn maybe_stall(&self) {
        let stall = self.stall.lock().take();
        if let Some(stall) = stall {
            stall.reached.notify_one();
            stall.release.notified().await;
        }
    }

    fn check(flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            Err(TrustgateError::Storage("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RateLimitStore for FaultyStore {
    async fn insert_rule(&self, rule: Rule) -> Result<Rule> {
        self.inner.insert_rule(rule).await
    }

    async fn update_rule(&self, rule: Rule) -> Result<bool> {
        self.inner.update_rule(rule).await
    }

    async fn delete_rule(&self, rule_id: i64) -> Result<Option<Rule>> {
        self.inner.delete_rule(rule_id).await
    }

    async fn get_rule(&self, rule_id: i64) -> Result<Option<Rule>> {
        self.inner.get_rule(rule_id).await
    }

    async fn list_rules(&self, system_id: &str, enabled_only: bool) -> Result<Vec<Rule>> {
        Self::check(&self.fail_rules)?;
        let rules = self.inner.list_rules(system_id, enabled_only).await?;
        self.maybe_stall().await;
        Ok(rules)
    }

    async fn record_window_hit(&self, hit: WindowHit) -> Result<u64> {
        Self::check(&self.fail_counters)?;
        self.inner.record_window_hit(hit).await
    }

    async fn delete_buckets_before(&self, before: DateTime<Utc>) -> Result<u64> {
        Self::check(&self.fail_cleanup)?;
        self.inner.delete_buckets_before(before).await
    }

    async fn consume_quota(&self, key: QuotaKey, template: Quota) -> Result<u64> {
        Self::check(&self.fail_counters)?;
        self.inner.consume_quota(key, template).await
    }

    async fn find_live_quota(
        &self,
        system_id: &str,
        scope: Scope,
        scope_value: &str,
        resource_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Quota>> {
        self.inner
            .find_live_quota(system_id, scope, scope_value, resource_type, now)
            .await
    }

    async fn add_quota_usage(
        &self,
        system_id: &str,
        scope: Scope,
        scope_value: &str,
        resource_type: &str,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<Quota>> {
        self.inner
            .add_quota_usage(system_id, scope, scope_value, resource_type, amount, now)
            .await
    }

    async fn insert_violation(&self, violation: Violation) -> Result<()> {
        self.inner.insert_violation(violation).await
    }

    async fn list_violations(&self, system_id: &str, since: DateTime<Utc>) -> Result<Vec<Violation>> {
        self.inner.list_violations(system_id, since).await
    }

    async fn violation_stats(&self, system_id: &str) -> Result<ViolationStats> {
        self.inner.violation_stats(system_id).await
    }

    async fn delete_violations_before(&self, before: DateTime<Utc>) -> Result<u64> {
        Self::check(&self.fail_cleanup)?;
        self.inner.delete_violations_before(before).await
    }

    async fn insert_metric(&self, metric: Metric) -> Result<()> {
        self.inner.insert_metric(metric).await
    }

    async fn delete_metrics_before(&self, before: DateTime<Utc>) -> Result<u64> {
        self.inner.delete_metrics_before(before).await
    }
}

#[async_trait]
impl ReputationStore for FaultyStore {
    async fn get_or_create_reputation(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UserReputation> {
        let reputation = self.inner.get_or_create_reputation(user_id, now).await?;
        self.maybe_stall().await;
        Ok(reputation)
    }

    async fn put_reputation(&self, reputation: UserReputation) -> Result<()> {
        self.inner.put_reputation(reputation).await
    }

    async fn list_reputations(&self) -> Result<Vec<UserReputation>> {
        self.inner.list_reputations().await
    }

    async fn insert_rep_event(&self, event: ReputationEvent) -> Result<()> {
        self.inner.insert_rep_event(event).await
    }

    async fn list_rep_events(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ReputationEvent>> {
        self.inner.list_rep_events(user_id, since).await
    }

    async fn count_rep_events(
        &self,
        event_type: ReputationEventType,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        self.inner.count_rep_events(event_type, since).await
    }
}
