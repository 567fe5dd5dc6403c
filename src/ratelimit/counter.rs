//! Sliding-window buckets and fixed-period quotas.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::rules::Scope;

/// The unit a rule's limit is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitType {
    PerSecond,
    PerMinute,
    PerHour,
    PerDay,
    PerWeek,
    PerMonth,
}

/// How a limit type is counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    /// Moving window ending at now, approximated by 1-second buckets
    SlidingWindow,
    /// Epoch-aligned period that resets at its boundary
    Quota,
}

impl LimitType {
    /// Get the duration of this window or period.
    ///
    /// Months are a fixed 30 days.
    pub fn duration(&self) -> Duration {
        match self {
            LimitType::PerSecond => Duration::from_secs(1),
            LimitType::PerMinute => Duration::from_secs(60),
            LimitType::PerHour => Duration::from_secs(3600),
            LimitType::PerDay => Duration::from_secs(86400),
            LimitType::PerWeek => Duration::from_secs(7 * 86400),
            LimitType::PerMonth => Duration::from_secs(30 * 86400),
        }
    }

    pub fn kind(&self) -> CounterKind {
        match self {
            LimitType::PerSecond | LimitType::PerMinute | LimitType::PerHour => {
                CounterKind::SlidingWindow
            }
            LimitType::PerDay | LimitType::PerWeek | LimitType::PerMonth => CounterKind::Quota,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::PerSecond => "per_second",
            LimitType::PerMinute => "per_minute",
            LimitType::PerHour => "per_hour",
            LimitType::PerDay => "per_day",
            LimitType::PerWeek => "per_week",
            LimitType::PerMonth => "per_month",
        }
    }
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sliding-window sub-bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub rule_id: i64,
    pub system_id: String,
    pub scope: Scope,
    pub scope_value: String,
    /// Truncated to whole seconds; part of the bucket's identity
    pub window_start: DateTime<Utc>,
    /// Time of the latest hit recorded in this bucket
    pub window_end: DateTime<Utc>,
    pub request_count: u64,
}

impl Bucket {
    /// Whether this bucket has hits inside `[start, end]`.
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.window_start <= end && self.window_end >= start
    }
}

/// A fixed-period usage counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub id: i64,
    pub system_id: String,
    pub scope: Scope,
    pub scope_value: String,
    pub resource_type: String,
    pub period: LimitType,
    pub limit: u64,
    pub used: u64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

impl Quota {
    /// Whether `now` falls inside this quota's period.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.period_start <= now && now < self.period_end
    }
}

/// Result of checking one rule's counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterOutcome {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_time: DateTime<Utc>,
}

impl CounterOutcome {
    /// Build an outcome from the count observed before this request.
    pub fn from_prior(prior: u64, limit: u64, reset_time: DateTime<Utc>) -> Self {
        Self {
            allowed: prior < limit,
            limit,
            remaining: limit.saturating_sub(prior).saturating_sub(1),
            reset_time,
        }
    }

    /// Outcome used when the counter could not be read.
    pub fn fail_open(limit: u64, reset_time: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            reset_time,
        }
    }
}

/// Drop the sub-second part of a timestamp.
pub fn truncate_to_second(t: DateTime<Utc>) -> DateTime<Utc> {
    t - chrono::Duration::nanoseconds(i64::from(t.timestamp_subsec_nanos()))
}

/// Start of the sliding window ending at `now`.
///
/// The look-back is `window - tolerance`, with the tolerance capped at the
/// window length, truncated to whole seconds.
pub fn sliding_window_start(
    now: DateTime<Utc>,
    window: Duration,
    tolerance: Duration,
) -> DateTime<Utc> {
    let look_back = window.saturating_sub(tolerance.min(window));
    let look_back = chrono::Duration::from_std(look_back).unwrap_or(chrono::Duration::zero());
    truncate_to_second(now - look_back)
}

/// Epoch-aligned `[start, end)` of the period containing `now`.
pub fn period_bounds(now: DateTime<Utc>, period: Duration) -> (DateTime<Utc>, DateTime<Utc>) {
    let length = period.as_secs().max(1) as i64;
    let offset = now.timestamp().rem_euclid(length);
    let start = truncate_to_second(now) - chrono::Duration::seconds(offset);
    (start, start + chrono::Duration::seconds(length))
}
