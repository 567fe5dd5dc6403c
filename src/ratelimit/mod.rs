//! Rate limiting rules, counters and the admission decision engine.

mod counter;
mod descriptor;
mod limiter;
mod rule_cache;
mod rules;
mod violation;

pub use counter::{
    period_bounds, sliding_window_start, truncate_to_second, Bucket, CounterKind,
    CounterOutcome, LimitType, Quota,
};
pub use descriptor::{QuotaKey, WindowKey};
pub use limiter::{Decision, LimitCheckRequest, RateLimiter, Usage};
pub use rule_cache::RuleCache;
pub use rules::{sort_by_priority, Rule, RuleDefinition, RuleSet, Scope, SYSTEM_GLOBAL};
pub use violation::{
    severity_for_resource, Metric, MetricsSink, Violation, ViolationNotifier, ViolationStats,
};
