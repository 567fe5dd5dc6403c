//! Keys identifying counter rows.

use chrono::{DateTime, Utc};
use std::fmt;

use super::rules::Scope;

/// Identifies the sliding-window buckets of one rule for one scope value.
///
/// All sub-buckets sharing a key are summed together, so the store
/// serializes hits per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub rule_id: i64,
    pub scope_value: String,
}

impl WindowKey {
    pub fn new(rule_id: i64, scope_value: &str) -> Self {
        Self {
            rule_id,
            scope_value: scope_value.to_string(),
        }
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rule={}:{}", self.rule_id, self.scope_value)
    }
}

/// Identifies one live quota row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuotaKey {
    pub system_id: String,
    pub scope: Scope,
    pub scope_value: String,
    pub resource_type: String,
    pub period_start: DateTime<Utc>,
}

impl QuotaKey {
    pub fn new(
        system_id: &str,
        scope: Scope,
        scope_value: &str,
        resource_type: &str,
        period_start: DateTime<Utc>,
    ) -> Self {
        Self {
            system_id: system_id.to_string(),
            scope,
            scope_value: scope_value.to_string(),
            resource_type: resource_type.to_string(),
            period_start,
        }
    }

    /// Whether this key belongs to the given (system, scope, value, resource) series.
    pub fn same_series(
        &self,
        system_id: &str,
        scope: Scope,
        scope_value: &str,
        resource_type: Option<&str>,
    ) -> bool {
        self.system_id == system_id
            && self.scope == scope
            && self.scope_value == scope_value
            && resource_type.map_or(true, |r| self.resource_type == r)
    }
}

impl fmt::Display for QuotaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}={}:{}@{}",
            self.system_id,
            self.scope,
            self.scope_value,
            self.resource_type,
            self.period_start.timestamp()
        )
    }
}
