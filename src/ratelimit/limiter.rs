//! Core admission decision engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::counter::{
    period_bounds, sliding_window_start, CounterKind, CounterOutcome, LimitType, Quota,
};
use super::descriptor::{QuotaKey, WindowKey};
use super::rule_cache::RuleCache;
use super::rules::{Rule, RuleDefinition, RuleSet, Scope};
use super::violation::{
    severity_for_resource, Metric, MetricsSink, Violation, ViolationNotifier, ViolationStats,
};
use crate::clock::{Clock, SystemClock};
use crate::config::{RateLimitingConfig, ReputationConfig};
use crate::error::{Result, TrustgateError};
use crate::reputation::ReputationManager;
use crate::store::{RateLimitStore, WindowHit};

/// A single admission check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitCheckRequest {
    pub system_id: String,
    pub scope: Scope,
    /// User id, IP address or API key, depending on the scope
    #[serde(default)]
    pub scope_value: String,
    #[serde(default)]
    pub resource_type: String,
    #[serde(default)]
    pub request_path: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl LimitCheckRequest {
    pub fn new(system_id: &str, scope: Scope, scope_value: &str) -> Self {
        Self {
            system_id: system_id.to_string(),
            scope,
            scope_value: scope_value.to_string(),
            resource_type: String::new(),
            request_path: String::new(),
            method: String::new(),
            headers: HashMap::new(),
        }
    }

    pub fn with_resource_type(mut self, resource_type: &str) -> Self {
        self.resource_type = resource_type.to_string();
        self
    }

    pub fn with_path(mut self, method: &str, path: &str) -> Self {
        self.method = method.to_string();
        self.request_path = path.to_string();
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.system_id.is_empty() {
            return Err(TrustgateError::Validation(
                "system_id is required".to_string(),
            ));
        }
        if self.scope != Scope::Global && self.scope_value.is_empty() {
            return Err(TrustgateError::Validation(format!(
                "scope_value is required for {} scope",
                self.scope
            )));
        }
        Ok(())
    }

    /// The User-Agent header, matched case-insensitively.
    pub fn user_agent(&self) -> Option<String> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("user-agent"))
            .map(|(_, value)| value.clone())
    }

    fn is_user_scoped(&self) -> bool {
        self.scope == Scope::User && !self.scope_value.is_empty()
    }
}

/// The outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    /// The denying rule
    pub rule_id: Option<i64>,
    pub reason: Option<String>,
    pub limit: u64,
    pub remaining: u64,
    pub reset_time: Option<DateTime<Utc>>,
    pub retry_after_seconds: u64,
}

/// Current quota consumption for a scope value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub limit: u64,
    pub used: u64,
    pub remaining: u64,
    pub period: Option<LimitType>,
    pub reset_time: Option<DateTime<Utc>>,
}

/// The admission decision engine.
///
/// Rules are read through a per-system cache; counters live in the store.
/// This struct is thread-safe and can be shared across tasks.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    rules: RuleCache,
    reputation: Option<Arc<ReputationManager>>,
    track_clean_requests: bool,
    config: RateLimitingConfig,
    clock: Arc<dyn Clock>,
    notifier: Option<Arc<dyn ViolationNotifier>>,
    metrics_sink: Option<Arc<dyn MetricsSink>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, config: RateLimitingConfig) -> Self {
        Self {
            rules: RuleCache::new(store.clone(), config.rule_cache_ttl()),
            store,
            reputation: None,
            track_clean_requests: false,
            config,
            clock: Arc::new(SystemClock),
            notifier: None,
            metrics_sink: None,
        }
    }

    /// Scale user-scoped limits by reputation and feed decisions back into it.
    ///
    /// Has no effect when the reputation engine is disabled in `config`.
    pub fn with_reputation(
        mut self,
        manager: Arc<ReputationManager>,
        config: &ReputationConfig,
    ) -> Self {
        if config.enabled {
            self.reputation = Some(manager);
            self.track_clean_requests = config.track_clean_requests;
        }
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ViolationNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics_sink = Some(sink);
        self
    }

    pub fn reputation(&self) -> Option<&Arc<ReputationManager>> {
        self.reputation.as_ref()
    }

    /// Decide whether a request may proceed.
    ///
    /// Every matching rule's counter is charged until one denies. Storage
    /// failures while loading rules or counting allow the request.
    #[instrument(skip(self, request), fields(system_id = %request.system_id, scope = %request.scope))]
    pub async fn check_limit(&self, request: &LimitCheckRequest) -> Result<Decision> {
        request.validate()?;
        let now = self.clock.now();

        let rules = match self.rules.get(&request.system_id).await {
            Ok(rules) => rules,
            Err(e) => {
                warn!(error = %e, "Failed to load rules, allowing request");
                self.emit_metric(request, true, now);
                return Ok(self.allow(None));
            }
        };

        let mut last = None;
        for rule in rules.iter() {
            if !rule.enabled
                || !rule.matches(request.scope, &request.scope_value, &request.resource_type)
            {
                continue;
            }

            let limit = self.effective_limit(rule, request).await;
            let outcome = self.count(rule, request, limit, now).await;

            if !outcome.allowed {
                let decision = self.deny(rule, &outcome, now);
                debug!(
                    rule_id = rule.id,
                    limit = outcome.limit,
                    scope_value = %request.scope_value,
                    "Rate limit exceeded"
                );
                self.record_denial(rule, request, &decision, now).await;
                self.emit_metric(request, false, now);
                return Ok(decision);
            }
            last = Some(outcome);
        }

        if self.track_clean_requests && request.is_user_scoped() {
            if let Some(ref reputation) = self.reputation {
                if let Err(e) = reputation.record_clean_request(&request.scope_value).await {
                    warn!(error = %e, user_id = %request.scope_value, "Failed to credit clean request");
                }
            }
        }
        self.emit_metric(request, true, now);

        Ok(self.allow(last))
    }

    async fn effective_limit(&self, rule: &Rule, request: &LimitCheckRequest) -> u64 {
        if rule.scope != Scope::User || !request.is_user_scoped() {
            return rule.limit;
        }
        let Some(ref reputation) = self.reputation else {
            return rule.limit;
        };

        match reputation
            .get_adaptive_limit(&request.scope_value, rule.limit)
            .await
        {
            Ok(limit) => limit,
            Err(e) => {
                warn!(error = %e, user_id = %request.scope_value, "Reputation lookup failed, using base limit");
                rule.limit
            }
        }
    }

    /// Charge one request against a rule's counter.
    async fn count(
        &self,
        rule: &Rule,
        request: &LimitCheckRequest,
        limit: u64,
        now: DateTime<Utc>,
    ) -> CounterOutcome {
        let length = rule.limit_type.duration();

        match rule.limit_type.kind() {
            CounterKind::SlidingWindow => {
                let window_start =
                    sliding_window_start(now, length, self.config.clock_tolerance());
                let reset_time = window_start + to_chrono(length);
                let hit = WindowHit {
                    key: WindowKey::new(rule.id, &request.scope_value),
                    system_id: request.system_id.clone(),
                    scope: request.scope,
                    window_start,
                    at: now,
                };

                match self.store.record_window_hit(hit).await {
                    Ok(prior) => CounterOutcome::from_prior(prior, limit, reset_time),
                    Err(e) => {
                        warn!(error = %e, rule_id = rule.id, "Window count failed, allowing request");
                        CounterOutcome::fail_open(limit, reset_time)
                    }
                }
            }
            CounterKind::Quota => {
                let (period_start, period_end) = period_bounds(now, length);
                let key = QuotaKey::new(
                    &request.system_id,
                    request.scope,
                    &request.scope_value,
                    &request.resource_type,
                    period_start,
                );
                let template = Quota {
                    id: 0,
                    system_id: request.system_id.clone(),
                    scope: request.scope,
                    scope_value: request.scope_value.clone(),
                    resource_type: request.resource_type.clone(),
                    period: rule.limit_type,
                    limit,
                    used: 0,
                    period_start,
                    period_end,
                };

                match self.store.consume_quota(key, template).await {
                    Ok(prior) => CounterOutcome::from_prior(prior, limit, period_end),
                    Err(e) => {
                        warn!(error = %e, rule_id = rule.id, "Quota count failed, allowing request");
                        CounterOutcome::fail_open(limit, period_end)
                    }
                }
            }
        }
    }

    fn allow(&self, last: Option<CounterOutcome>) -> Decision {
        Decision {
            allowed: true,
            rule_id: None,
            reason: None,
            limit: last.map_or(0, |o| o.limit),
            remaining: last.map_or(0, |o| o.remaining),
            reset_time: last.map(|o| o.reset_time),
            retry_after_seconds: self.config.default_retry_after_secs,
        }
    }

    fn deny(&self, rule: &Rule, outcome: &CounterOutcome, now: DateTime<Utc>) -> Decision {
        let retry_after_seconds = (outcome.reset_time - now).num_seconds().max(1) as u64;
        Decision {
            allowed: false,
            rule_id: Some(rule.id),
            reason: Some(format!(
                "rate limit exceeded: {} ({} requests)",
                rule.limit_type, outcome.limit
            )),
            limit: outcome.limit,
            remaining: outcome.remaining,
            reset_time: Some(outcome.reset_time),
            retry_after_seconds,
        }
    }

    /// Record a denial as a violation and report it to the reputation engine.
    async fn record_denial(
        &self,
        rule: &Rule,
        request: &LimitCheckRequest,
        decision: &Decision,
        now: DateTime<Utc>,
    ) {
        let reason = decision.reason.clone().unwrap_or_default();

        if self.config.enable_violation_tracking {
            let violation = Violation {
                id: Uuid::new_v4(),
                system_id: request.system_id.clone(),
                rule_id: Some(rule.id),
                scope: request.scope,
                scope_value: request.scope_value.clone(),
                resource_type: request.resource_type.clone(),
                violated_limit: decision.limit,
                timestamp: now,
                request_path: request.request_path.clone(),
                request_method: request.method.clone(),
                user_agent: request.user_agent(),
                blocked: true,
            };

            if let Err(e) = self.store.insert_violation(violation.clone()).await {
                warn!(error = %e, rule_id = rule.id, "Failed to record violation");
            }

            if let Some(ref notifier) = self.notifier {
                let notifier = notifier.clone();
                tokio::spawn(async move {
                    notifier.notify(violation).await;
                });
            }
        }

        if request.is_user_scoped() {
            if let Some(ref reputation) = self.reputation {
                let severity = severity_for_resource(&request.resource_type);
                if let Err(e) = reputation
                    .record_violation(&request.scope_value, severity, &reason)
                    .await
                {
                    warn!(error = %e, user_id = %request.scope_value, "Failed to update reputation");
                }
            }
        }
    }

    fn emit_metric(&self, request: &LimitCheckRequest, allowed: bool, now: DateTime<Utc>) {
        if !self.config.enable_metrics {
            return;
        }

        let metric = Metric {
            system_id: request.system_id.clone(),
            scope: request.scope,
            scope_value: request.scope_value.clone(),
            timestamp: now,
            requests_processed: 1,
            requests_allowed: u64::from(allowed),
            requests_blocked: u64::from(!allowed),
        };
        let store = self.store.clone();
        let sink = self.metrics_sink.clone();

        tokio::spawn(async move {
            if let Err(e) = store.insert_metric(metric.clone()).await {
                warn!(error = %e, "Failed to record metric");
            }
            if let Some(sink) = sink {
                sink.record(metric).await;
            }
        });
    }

    /// The live quota for a scope value, across resource types.
    pub async fn get_usage(&self, system_id: &str, scope: Scope, scope_value: &str) -> Result<Usage> {
        let now = self.clock.now();
        let quota = self
            .store
            .find_live_quota(system_id, scope, scope_value, None, now)
            .await?;

        Ok(quota
            .map(|q| Usage {
                limit: q.limit,
                used: q.used,
                remaining: q.limit.saturating_sub(q.used),
                period: Some(q.period),
                reset_time: Some(q.period_end),
            })
            .unwrap_or_default())
    }

    pub async fn create_rule(&self, definition: RuleDefinition) -> Result<Rule> {
        let rule = definition.into_rule(self.clock.now())?;
        let rule = self.store.insert_rule(rule).await?;
        self.rules.invalidate(&rule);

        info!(
            rule_id = rule.id,
            name = %rule.name,
            system_id = %rule.system_id,
            limit_type = %rule.limit_type,
            limit = rule.limit,
            "Rule created"
        );
        Ok(rule)
    }

    /// Replace an existing rule, keeping its creation time.
    pub async fn update_rule(&self, rule: Rule) -> Result<Rule> {
        let mut rule = rule.normalized();
        rule.validate()?;

        let existing = self.get_rule(rule.id).await?;
        rule.created_at = existing.created_at;
        rule.updated_at = self.clock.now();

        if !self.store.update_rule(rule.clone()).await? {
            return Err(TrustgateError::NotFound(format!("rule {}", rule.id)));
        }
        self.rules.invalidate(&existing);
        self.rules.invalidate(&rule);

        info!(rule_id = rule.id, "Rule updated");
        Ok(rule)
    }

    /// Delete a rule. Returns `false` if it did not exist.
    pub async fn delete_rule(&self, rule_id: i64) -> Result<bool> {
        match self.store.delete_rule(rule_id).await? {
            Some(rule) => {
                self.rules.invalidate(&rule);
                info!(rule_id, "Rule deleted");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn get_rule(&self, rule_id: i64) -> Result<Rule> {
        self.store
            .get_rule(rule_id)
            .await?
            .ok_or_else(|| TrustgateError::NotFound(format!("rule {}", rule_id)))
    }

    /// Enabled rules for a system, global rules included, in evaluation order.
    pub async fn get_rules(&self, system_id: &str) -> Result<Vec<Rule>> {
        Ok(self.rules.get(system_id).await?.as_ref().clone())
    }

    /// All rules for a system, disabled ones included.
    pub async fn list_rules(&self, system_id: &str) -> Result<Vec<Rule>> {
        self.store.list_rules(system_id, false).await
    }

    /// Create every rule in a rule set.
    pub async fn load_rules(&self, rule_set: RuleSet) -> Result<Vec<Rule>> {
        let mut created = Vec::with_capacity(rule_set.len());
        for definition in rule_set.rules {
            created.push(self.create_rule(definition).await?);
        }
        info!(count = created.len(), "Rules loaded");
        Ok(created)
    }

    /// Add usage to the live quota for a resource.
    pub async fn increment_quota(
        &self,
        system_id: &str,
        scope: Scope,
        scope_value: &str,
        resource_type: &str,
        amount: u64,
    ) -> Result<Quota> {
        let now = self.clock.now();
        self.store
            .add_quota_usage(system_id, scope, scope_value, resource_type, amount, now)
            .await?
            .ok_or_else(|| {
                TrustgateError::NotFound(format!(
                    "no live quota for {}:{}={}:{}",
                    system_id, scope, scope_value, resource_type
                ))
            })
    }

    pub async fn get_quota(
        &self,
        system_id: &str,
        scope: Scope,
        scope_value: &str,
        resource_type: &str,
    ) -> Result<Option<Quota>> {
        let now = self.clock.now();
        self.store
            .find_live_quota(system_id, scope, scope_value, Some(resource_type), now)
            .await
    }

    /// Violations since `since`, newest first.
    pub async fn get_violations(
        &self,
        system_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Violation>> {
        self.store.list_violations(system_id, since).await
    }

    pub async fn get_violation_stats(&self, system_id: &str) -> Result<ViolationStats> {
        self.store.violation_stats(system_id).await
    }

    pub async fn cleanup_old_buckets(&self, before: DateTime<Utc>) -> Result<u64> {
        let deleted = self.store.delete_buckets_before(before).await?;
        debug!(deleted, before = %before, "Removed expired window buckets");
        Ok(deleted)
    }

    pub async fn cleanup_old_violations(&self, before: DateTime<Utc>) -> Result<u64> {
        let deleted = self.store.delete_violations_before(before).await?;
        debug!(deleted, before = %before, "Removed old violations");
        Ok(deleted)
    }

    pub async fn cleanup_old_metrics(&self, before: DateTime<Utc>) -> Result<u64> {
        let deleted = self.store.delete_metrics_before(before).await?;
        debug!(deleted, before = %before, "Removed old metrics");
        Ok(deleted)
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero())
}
