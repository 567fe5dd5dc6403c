//! In-process store backed by concurrent maps.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use super::{RateLimitStore, ReputationStore, WindowHit};
use crate::error::Result;
use crate::ratelimit::{
    sort_by_priority, Bucket, Metric, Quota, QuotaKey, Rule, Scope, Violation, ViolationStats,
    WindowKey, SYSTEM_GLOBAL,
};
use crate::reputation::{ReputationEvent, ReputationEventType, UserReputation};

/// A store that keeps everything in memory.
///
/// Window buckets and quotas live in `DashMap`s; an entry guard is held for
/// the whole sum-and-increment, which makes each counter update atomic per
/// key without a process-wide lock.
#[derive(Default)]
pub struct MemoryStore {
    rules: RwLock<BTreeMap<i64, Rule>>,
    next_rule_id: AtomicI64,
    buckets: DashMap<WindowKey, Vec<Bucket>>,
    quotas: DashMap<QuotaKey, Quota>,
    next_quota_id: AtomicI64,
    violations: RwLock<Vec<Violation>>,
    metrics: RwLock<Vec<Metric>>,
    reputations: DashMap<String, UserReputation>,
    rep_events: RwLock<Vec<ReputationEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored window buckets across all keys.
    pub fn bucket_count(&self) -> usize {
        self.buckets.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn quota_count(&self) -> usize {
        self.quotas.len()
    }

    pub fn violation_count(&self) -> usize {
        self.violations.read().len()
    }

    pub fn metric_count(&self) -> usize {
        self.metrics.read().len()
    }

    fn live_quota_key(
        &self,
        system_id: &str,
        scope: Scope,
        scope_value: &str,
        resource_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<QuotaKey> {
        self.quotas
            .iter()
            .filter(|entry| {
                entry
                    .key()
                    .same_series(system_id, scope, scope_value, resource_type)
                    && entry.value().is_live(now)
            })
            .min_by_key(|entry| entry.value().id)
            .map(|entry| entry.key().clone())
    }
}

#[async_trait]
impl RateLimitStore for MemoryStore {
    async fn insert_rule(&self, mut rule: Rule) -> Result<Rule> {
        rule.id = self.next_rule_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.rules.write().insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn update_rule(&self, rule: Rule) -> Result<bool> {
        let mut rules = self.rules.write();
        match rules.get_mut(&rule.id) {
            Some(existing) => {
                *existing = rule;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_rule(&self, rule_id: i64) -> Result<Option<Rule>> {
        Ok(self.rules.write().remove(&rule_id))
    }

    async fn get_rule(&self, rule_id: i64) -> Result<Option<Rule>> {
        Ok(self.rules.read().get(&rule_id).cloned())
    }

    async fn list_rules(&self, system_id: &str, enabled_only: bool) -> Result<Vec<Rule>> {
        let mut rules: Vec<Rule> = self
            .rules
            .read()
            .values()
            .filter(|rule| rule.system_id == system_id || rule.system_id == SYSTEM_GLOBAL)
            .filter(|rule| !enabled_only || rule.enabled)
            .cloned()
            .collect();
        sort_by_priority(&mut rules);
        Ok(rules)
    }

    async fn record_window_hit(&self, hit: WindowHit) -> Result<u64> {
        let mut buckets = self.buckets.entry(hit.key.clone()).or_default();

        let prior: u64 = buckets
            .iter()
            .filter(|bucket| bucket.overlaps(hit.window_start, hit.at))
            .map(|bucket| bucket.request_count)
            .sum();

        match buckets
            .iter_mut()
            .find(|bucket| bucket.window_start == hit.window_start)
        {
            Some(bucket) => {
                bucket.request_count += 1;
                bucket.window_end = bucket.window_end.max(hit.at);
            }
            None => buckets.push(Bucket {
                rule_id: hit.key.rule_id,
                system_id: hit.system_id,
                scope: hit.scope,
                scope_value: hit.key.scope_value.clone(),
                window_start: hit.window_start,
                window_end: hit.at,
                request_count: 1,
            }),
        }

        Ok(prior)
    }

    async fn delete_buckets_before(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut deleted = 0u64;
        self.buckets.retain(|_, buckets| {
            let len = buckets.len();
            buckets.retain(|bucket| bucket.window_end >= before);
            deleted += (len - buckets.len()) as u64;
            !buckets.is_empty()
        });
        Ok(deleted)
    }

    async fn consume_quota(&self, key: QuotaKey, template: Quota) -> Result<u64> {
        match self.quotas.entry(key) {
            Entry::Occupied(mut entry) => {
                let quota = entry.get_mut();
                let prior = quota.used;
                quota.used += 1;
                Ok(prior)
            }
            Entry::Vacant(entry) => {
                let mut quota = template;
                quota.id = self.next_quota_id.fetch_add(1, Ordering::SeqCst) + 1;
                quota.used = 1;
                entry.insert(quota);
                Ok(0)
            }
        }
    }

    async fn find_live_quota(
        &self,
        system_id: &str,
        scope: Scope,
        scope_value: &str,
        resource_type: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Quota>> {
        let key = self.live_quota_key(system_id, scope, scope_value, resource_type, now);
        Ok(key.and_then(|key| self.quotas.get(&key).map(|quota| quota.clone())))
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
        let key = self.live_quota_key(system_id, scope, scope_value, Some(resource_type), now);
        Ok(key.and_then(|key| {
            self.quotas.get_mut(&key).map(|mut quota| {
                quota.used = quota.used.saturating_add(amount);
                quota.clone()
            })
        }))
    }

    async fn insert_violation(&self, violation: Violation) -> Result<()> {
        self.violations.write().push(violation);
        Ok(())
    }

    async fn list_violations(
        &self,
        system_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Violation>> {
        let mut violations: Vec<Violation> = self
            .violations
            .read()
            .iter()
            .filter(|v| v.system_id == system_id && v.timestamp >= since)
            .cloned()
            .collect();
        violations.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(violations)
    }

    async fn violation_stats(&self, system_id: &str) -> Result<ViolationStats> {
        let mut stats = ViolationStats::default();
        for violation in self
            .violations
            .read()
            .iter()
            .filter(|v| v.system_id == system_id)
        {
            stats.add(violation);
        }
        Ok(stats)
    }

    async fn delete_violations_before(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut violations = self.violations.write();
        let len = violations.len();
        violations.retain(|v| v.timestamp >= before);
        Ok((len - violations.len()) as u64)
    }

    async fn insert_metric(&self, metric: Metric) -> Result<()> {
        self.metrics.write().push(metric);
        Ok(())
    }

    async fn delete_metrics_before(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut metrics = self.metrics.write();
        let len = metrics.len();
        metrics.retain(|m| m.timestamp >= before);
        Ok((len - metrics.len()) as u64)
    }
}

#[async_trait]
impl ReputationStore for MemoryStore {
    async fn get_or_create_reputation(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<UserReputation> {
        Ok(self
            .reputations
            .entry(user_id.to_string())
            .or_insert_with(|| UserReputation::new(user_id, now))
            .clone())
    }

    async fn put_reputation(&self, reputation: UserReputation) -> Result<()> {
        self.reputations
            .insert(reputation.user_id.clone(), reputation);
        Ok(())
    }

    async fn list_reputations(&self) -> Result<Vec<UserReputation>> {
        Ok(self
            .reputations
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn insert_rep_event(&self, event: ReputationEvent) -> Result<()> {
        self.rep_events.write().push(event);
        Ok(())
    }

    async fn list_rep_events(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<ReputationEvent>> {
        let mut events: Vec<ReputationEvent> = self
            .rep_events
            .read()
            .iter()
            .filter(|e| e.user_id == user_id && e.timestamp >= since)
            .cloned()
            .collect();
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(events)
    }

    async fn count_rep_events(
        &self,
        event_type: ReputationEventType,
        since: DateTime<Utc>,
    ) -> Result<u64> {
        Ok(self
            .rep_events
            .read()
            .iter()
            .filter(|e| e.event_type == event_type && e.timestamp >= since)
            .count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{LimitType, RuleDefinition};
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn hit(rule_id: i64, value: &str, window_start: DateTime<Utc>, at: DateTime<Utc>) -> WindowHit {
        WindowHit {
            key: WindowKey::new(rule_id, value),
            system_id: "api".to_string(),
            scope: Scope::Ip,
            window_start,
            at,
        }
    }

    fn quota_template(key: &QuotaKey, limit: u64) -> Quota {
        Quota {
            id: 0,
            system_id: key.system_id.clone(),
            scope: key.scope,
            scope_value: key.scope_value.clone(),
            resource_type: key.resource_type.clone(),
            period: LimitType::PerDay,
            limit,
            used: 0,
            period_start: key.period_start,
            period_end: key.period_start + Duration::days(1),
        }
    }

    #[tokio::test]
    async fn test_rules_listed_with_global_in_priority_order() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let rules = [
            ("api", 5, true),
            ("global", 1, true),
            ("web", 0, true),
            ("api", 2, false),
        ];
        for (system, priority, enabled) in rules {
            let mut def = RuleDefinition::new(system, Scope::Ip, LimitType::PerSecond, 1)
                .with_priority(priority);
            def.enabled = enabled;
            store.insert_rule(def.into_rule(now).unwrap()).await.unwrap();
        }

        let rules = store.list_rules("api", true).await.unwrap();
        let systems: Vec<&str> = rules.iter().map(|r| r.system_id.as_str()).collect();
        assert_eq!(systems, vec!["global", "api"]);

        let all = store.list_rules("api", false).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[1].priority, 2);
    }

    #[tokio::test]
    async fn test_window_hit_returns_prior_count() {
        let store = MemoryStore::new();

        assert_eq!(store.record_window_hit(hit(1, "a", t(0), t(0))).await.unwrap(), 0);
        assert_eq!(store.record_window_hit(hit(1, "a", t(0), t(0))).await.unwrap(), 1);
        assert_eq!(store.record_window_hit(hit(1, "b", t(0), t(0))).await.unwrap(), 0);
        assert_eq!(store.bucket_count(), 2);
    }

    #[tokio::test]
    async fn test_window_sums_overlapping_buckets() {
        let store = MemoryStore::new();

        // Three hits in one bucket, then the window slides forward one second.
        for _ in 0..3 {
            store.record_window_hit(hit(1, "a", t(0), t(59))).await.unwrap();
        }
        let prior = store.record_window_hit(hit(1, "a", t(1), t(60))).await.unwrap();
        assert_eq!(prior, 3);

        // Once the window start passes the old bucket's last hit it drops out.
        let prior = store.record_window_hit(hit(1, "a", t(60), t(119))).await.unwrap();
        assert_eq!(prior, 1);
        assert_eq!(store.bucket_count(), 3);
    }

    #[tokio::test]
    async fn test_delete_buckets_before() {
        let store = MemoryStore::new();
        store.record_window_hit(hit(1, "a", t(0), t(0))).await.unwrap();
        store.record_window_hit(hit(1, "a", t(10), t(10))).await.unwrap();
        store.record_window_hit(hit(2, "a", t(0), t(0))).await.unwrap();

        let deleted = store.delete_buckets_before(t(5)).await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.bucket_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_window_hits_see_distinct_counts() {
        let store = Arc::new(MemoryStore::new());
        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store.record_window_hit(hit(1, "a", t(0), t(0))).await.unwrap()
                })
            })
            .collect();

        let mut priors: Vec<u64> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        priors.sort_unstable();
        assert_eq!(priors, (0..64).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_consume_quota_creates_then_increments() {
        let store = MemoryStore::new();
        let key = QuotaKey::new("api", Scope::User, "42", "upload", t(0));

        assert_eq!(store.consume_quota(key.clone(), quota_template(&key, 3)).await.unwrap(), 0);
        assert_eq!(store.consume_quota(key.clone(), quota_template(&key, 3)).await.unwrap(), 1);

        let quota = store
            .find_live_quota("api", Scope::User, "42", Some("upload"), t(60))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(quota.used, 2);
        assert_eq!(quota.id, 1);
        assert_eq!(store.quota_count(), 1);
    }

    #[tokio::test]
    async fn test_add_quota_usage_requires_live_row() {
        let store = MemoryStore::new();
        let key = QuotaKey::new("api", Scope::User, "42", "upload", t(0));

        let missing = store
            .add_quota_usage("api", Scope::User, "42", "upload", 5, t(0))
            .await
            .unwrap();
        assert!(missing.is_none());

        store.consume_quota(key.clone(), quota_template(&key, 10)).await.unwrap();
        let updated = store
            .add_quota_usage("api", Scope::User, "42", "upload", 5, t(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.used, 6);

        // The period has ended; nothing is live any more.
        let expired = store
            .add_quota_usage("api", Scope::User, "42", "upload", 5, t(86400))
            .await
            .unwrap();
        assert!(expired.is_none());
    }

    #[tokio::test]
    async fn test_reputation_created_once() {
        let store = MemoryStore::new();
        let first = store.get_or_create_reputation("42", t(0)).await.unwrap();
        let second = store.get_or_create_reputation("42", t(100)).await.unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(store.list_reputations().await.unwrap().len(), 1);
    }
}
