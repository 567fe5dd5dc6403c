//! Rate limit rule definitions, validation and matching.
//!
//! Rules are normally managed through the store, but a set of rules can also
//! be bootstrapped from a YAML file:
//!
//! ```yaml
//! rules:
//!   - system_id: checkout
//!     scope: ip
//!     limit_type: per_second
//!     limit: 20
//!     priority: 1
//!   - system_id: global
//!     scope: user
//!     resource_type: login
//!     limit_type: per_day
//!     limit: 50
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::info;

use super::counter::LimitType;
use crate::error::{Result, TrustgateError};

/// System id whose rules apply to every system.
pub const SYSTEM_GLOBAL: &str = "global";

/// The dimension a limit applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Global,
    User,
    Ip,
    ApiKey,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::User => "user",
            Scope::Ip => "ip",
            Scope::ApiKey => "api_key",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored rate limit rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: i64,
    pub name: String,
    pub system_id: String,
    pub scope: Scope,
    /// Only requests with this scope value match, when set
    pub scope_value: Option<String>,
    /// Only requests for this resource type match, when set
    pub resource_type: Option<String>,
    pub limit_type: LimitType,
    pub limit: u64,
    /// Lower values are evaluated first
    pub priority: i32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The caller-supplied part of a rule, as found in rule files and create requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    #[serde(default)]
    pub name: Option<String>,
    pub system_id: String,
    pub scope: Scope,
    #[serde(default)]
    pub scope_value: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    pub limit_type: LimitType,
    pub limit: u64,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_priority() -> i32 {
    100
}

fn default_enabled() -> bool {
    true
}

impl RuleDefinition {
    /// Create an enabled definition with default priority.
    pub fn new(system_id: &str, scope: Scope, limit_type: LimitType, limit: u64) -> Self {
        Self {
            name: None,
            system_id: system_id.to_string(),
            scope,
            scope_value: None,
            resource_type: None,
            limit_type,
            limit,
            priority: default_priority(),
            enabled: true,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_scope_value(mut self, value: &str) -> Self {
        self.scope_value = Some(value.to_string());
        self
    }

    pub fn with_resource_type(mut self, resource_type: &str) -> Self {
        self.resource_type = Some(resource_type.to_string());
        self
    }

    /// Turn this definition into a validated rule stamped at `now`.
    ///
    /// The id is left at zero for the store to assign.
    pub fn into_rule(self, now: DateTime<Utc>) -> Result<Rule> {
        let name = match self.name.filter(|n| !n.is_empty()) {
            Some(name) => name,
            None => format!(
                "{}_{}_{}_{}",
                self.system_id,
                self.scope,
                self.limit,
                now.timestamp_nanos_opt().unwrap_or_default()
            ),
        };
        let rule = Rule {
            id: 0,
            name,
            system_id: self.system_id,
            scope: self.scope,
            scope_value: normalize(self.scope_value),
            resource_type: normalize(self.resource_type),
            limit_type: self.limit_type,
            limit: self.limit,
            priority: self.priority,
            enabled: self.enabled,
            created_at: now,
            updated_at: now,
        };
        rule.validate()?;
        Ok(rule)
    }
}

fn normalize(filter: Option<String>) -> Option<String> {
    filter.filter(|v| !v.is_empty())
}

impl Rule {
    /// Check the rule is well-formed.
    pub fn validate(&self) -> Result<()> {
        if self.system_id.is_empty() {
            return Err(TrustgateError::Validation(
                "rule system_id is required".to_string(),
            ));
        }
        if self.scope == Scope::Global && self.scope_value.is_some() {
            return Err(TrustgateError::Validation(
                "global-scope rules cannot filter on a scope value".to_string(),
            ));
        }
        Ok(())
    }

    /// Normalize empty filters to `None`, as rule files and admin tools may send them.
    pub fn normalized(mut self) -> Self {
        self.scope_value = normalize(self.scope_value);
        self.resource_type = normalize(self.resource_type);
        self
    }

    pub fn is_global(&self) -> bool {
        self.system_id == SYSTEM_GLOBAL
    }

    /// Whether this rule applies to a request with the given attributes.
    pub fn matches(&self, scope: Scope, scope_value: &str, resource_type: &str) -> bool {
        if self.scope != scope {
            return false;
        }
        if let Some(ref value) = self.scope_value {
            if value != scope_value {
                return false;
            }
        }
        if let Some(ref resource) = self.resource_type {
            if resource != resource_type {
                return false;
            }
        }
        true
    }
}

/// Sort rules into evaluation order.
pub fn sort_by_priority(rules: &mut [Rule]) {
    rules.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));
}

/// A collection of rule definitions loaded from YAML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

impl RuleSet {
    /// Load a rule set from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse a rule set from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TrustgateError::Config(format!("Failed to parse rule file: {}", e)))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
