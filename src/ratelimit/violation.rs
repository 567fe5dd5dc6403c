//! Violation records, decision metrics and their optional consumers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::rules::Scope;

/// An append-only record of a denied request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub id: Uuid,
    pub system_id: String,
    pub rule_id: Option<i64>,
    pub scope: Scope,
    pub scope_value: String,
    pub resource_type: String,
    pub violated_limit: u64,
    pub timestamp: DateTime<Utc>,
    pub request_path: String,
    pub request_method: String,
    pub user_agent: Option<String>,
    pub blocked: bool,
}

/// Aggregate violation counts for one system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViolationStats {
    pub total_violations: u64,
    pub by_scope: BTreeMap<Scope, u64>,
    pub by_rule: BTreeMap<i64, u64>,
}

impl ViolationStats {
    /// Fold one violation into the totals.
    pub fn add(&mut self, violation: &Violation) {
        self.total_violations += 1;
        *self.by_scope.entry(violation.scope).or_default() += 1;
        if let Some(rule_id) = violation.rule_id {
            *self.by_rule.entry(rule_id).or_default() += 1;
        }
    }
}

/// One decision, as recorded for throughput reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub system_id: String,
    pub scope: Scope,
    pub scope_value: String,
    pub timestamp: DateTime<Utc>,
    pub requests_processed: u64,
    pub requests_allowed: u64,
    pub requests_blocked: u64,
}

/// Receives violations for alerting. Called off the decision path.
#[async_trait]
pub trait ViolationNotifier: Send + Sync {
    async fn notify(&self, violation: Violation);
}

/// Receives decision metrics. Called off the decision path.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn record(&self, metric: Metric);
}

/// Severity of a violation for the reputation engine, by resource type.
pub fn severity_for_resource(resource_type: &str) -> u8 {
    match resource_type {
        "login" => 3,
        "api_call" => 1,
        _ => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(scope: Scope, rule_id: Option<i64>) -> Violation {
        Violation {
            id: Uuid::new_v4(),
            system_id: "api".to_string(),
            rule_id,
            scope,
            scope_value: "v".to_string(),
            resource_type: String::new(),
            violated_limit: 10,
            timestamp: Utc::now(),
            request_path: "/".to_string(),
            request_method: "GET".to_string(),
            user_agent: None,
            blocked: true,
        }
    }

    #[test]
    fn test_stats_accumulate() {
        let mut stats = ViolationStats::default();
        stats.add(&violation(Scope::Ip, Some(1)));
        stats.add(&violation(Scope::Ip, Some(2)));
        stats.add(&violation(Scope::User, Some(1)));
        stats.add(&violation(Scope::User, None));

        assert_eq!(stats.total_violations, 4);
        assert_eq!(stats.by_scope[&Scope::Ip], 2);
        assert_eq!(stats.by_scope[&Scope::User], 2);
        assert_eq!(stats.by_rule[&1], 2);
        assert_eq!(stats.by_rule.len(), 2);
    }

    #[test]
    fn test_severity_for_resource() {
        assert_eq!(severity_for_resource("login"), 3);
        assert_eq!(severity_for_resource("api_call"), 1);
        assert_eq!(severity_for_resource("upload"), 2);
        assert_eq!(severity_for_resource(""), 2);
    }
}
