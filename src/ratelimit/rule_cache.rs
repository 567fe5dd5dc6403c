//! Per-system cache of enabled rules.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::rules::{sort_by_priority, Rule};
use crate::cache::TtlCache;
use crate::error::Result;
use crate::store::RateLimitStore;

/// Enabled rules for each system, merged with the global rules and kept in
/// evaluation order.
pub struct RuleCache {
    store: Arc<dyn RateLimitStore>,
    entries: TtlCache<String, Arc<Vec<Rule>>>,
}

impl RuleCache {
    pub fn new(store: Arc<dyn RateLimitStore>, ttl: Duration) -> Self {
        Self {
            store,
            entries: TtlCache::new(ttl),
        }
    }

    /// Rules for `system_id`, loading from the store when the entry is missing
    /// or expired. A load that overlaps a rule change is returned but not
    /// cached.
    pub async fn get(&self, system_id: &str) -> Result<Arc<Vec<Rule>>> {
        let key = system_id.to_string();
        if let Some(rules) = self.entries.get(&key) {
            return Ok(rules);
        }

        let generation = self.entries.generation();
        let mut rules = self.store.list_rules(system_id, true).await?;
        sort_by_priority(&mut rules);

        let rules = Arc::new(rules);
        let cached = self.entries.insert_if_current(key, rules.clone(), generation);
        debug!(system_id = %system_id, count = rules.len(), cached, "Loaded rules");
        Ok(rules)
    }

    /// Drop cached rules affected by a change to `rule`.
    ///
    /// Global rules are part of every entry, so a global change clears all.
    pub fn invalidate(&self, rule: &Rule) {
        if rule.is_global() {
            self.entries.clear();
        } else {
            self.entries.invalidate(&rule.system_id);
        }
    }
}
