//! Reputation records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use super::tier::{adaptive_multiplier, clamp_score, Tier, NEUTRAL_SCORE};

/// An administrative multiplier that supersedes the reputation-derived one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VipOverride {
    pub tier_name: String,
    pub multiplier: f64,
    /// Never expires when unset
    pub expires_at: Option<DateTime<Utc>>,
}

impl VipOverride {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expiry| expiry > now)
    }
}

/// Per-user trust state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserReputation {
    pub user_id: String,
    pub score: f64,
    pub tier: Tier,
    pub multiplier: f64,
    pub total_violations: u64,
    pub total_clean_requests: u64,
    pub last_violation: Option<DateTime<Utc>>,
    pub decay_last_applied: Option<DateTime<Utc>>,
    pub vip: Option<VipOverride>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserReputation {
    /// A fresh user at the neutral score.
    pub fn new(user_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            score: NEUTRAL_SCORE,
            tier: Tier::for_score(NEUTRAL_SCORE),
            multiplier: adaptive_multiplier(NEUTRAL_SCORE),
            total_violations: 0,
            total_clean_requests: 0,
            last_violation: None,
            decay_last_applied: None,
            vip: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The VIP override, if one is set and unexpired at `now`.
    pub fn active_vip(&self, now: DateTime<Utc>) -> Option<&VipOverride> {
        self.vip.as_ref().filter(|vip| vip.is_active(now))
    }

    /// Multiplier in effect at `now`: the VIP one when active, else the score's.
    pub fn effective_multiplier(&self, now: DateTime<Utc>) -> f64 {
        match self.active_vip(now) {
            Some(vip) => vip.multiplier,
            None => adaptive_multiplier(self.score),
        }
    }

    /// Re-derive tier and multiplier from the score and VIP state.
    pub fn refresh(&mut self, now: DateTime<Utc>) {
        self.score = clamp_score(self.score);
        self.tier = Tier::for_score(self.score);
        self.multiplier = self.effective_multiplier(now);
    }

    /// Move the score by `delta`, clamped. Returns the delta actually applied.
    pub fn adjust_score(&mut self, delta: f64) -> f64 {
        let before = self.score;
        self.score = clamp_score(self.score + delta);
        self.score - before
    }
}

/// What changed a user's reputation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReputationEventType {
    Violation,
    CleanRequest,
    Decay,
    AdminOverride,
    VipSet,
    VipRemoved,
}

impl fmt::Display for ReputationEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReputationEventType::Violation => "violation",
            ReputationEventType::CleanRequest => "clean_request",
            ReputationEventType::Decay => "decay",
            ReputationEventType::AdminOverride => "admin_override",
            ReputationEventType::VipSet => "vip_set",
            ReputationEventType::VipRemoved => "vip_removed",
        };
        f.write_str(name)
    }
}

/// Append-only audit entry for a reputation change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReputationEvent {
    pub id: Uuid,
    pub user_id: String,
    pub event_type: ReputationEventType,
    pub severity: Option<u8>,
    pub score_delta: f64,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl ReputationEvent {
    pub fn new(
        user_id: &str,
        event_type: ReputationEventType,
        score_delta: f64,
        reason: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            event_type,
            severity: None,
            score_delta,
            reason: reason.into(),
            timestamp,
        }
    }

    pub fn with_severity(mut self, severity: u8) -> Self {
        self.severity = Some(severity);
        self
    }
}

/// Population-wide reputation summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepStats {
    pub total_users: u64,
    pub average_score: f64,
    pub users_by_tier: BTreeMap<Tier, u64>,
    pub users_flagged: u64,
    pub users_suspended: u64,
    pub active_vips: u64,
    pub violations_today: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_new_user_is_neutral() {
        let rep = UserReputation::new("42", Utc::now());
        assert_eq!(rep.score, 50.0);
        assert_eq!(rep.tier, Tier::Standard);
        assert_eq!(rep.multiplier, 1.0);
        assert!(rep.vip.is_none());
    }

    #[test]
    fn test_adjust_score_reports_clamped_delta() {
        let mut rep = UserReputation::new("42", Utc::now());
        rep.score = 4.0;
        assert_eq!(rep.adjust_score(-9.0), -4.0);
        assert_eq!(rep.score, 0.0);

        rep.score = 99.995;
        let applied = rep.adjust_score(0.01);
        assert_eq!(rep.score, 100.0);
        assert!(applied < 0.01);
    }

    #[test]
    fn test_vip_replaces_reputation_multiplier() {
        let now = Utc::now();
        let mut rep = UserReputation::new("42", now);
        rep.score = 5.0;
        rep.vip = Some(VipOverride {
            tier_name: "partner".to_string(),
            multiplier: 1.5,
            expires_at: Some(now + Duration::days(1)),
        });
        rep.refresh(now);
        assert_eq!(rep.tier, Tier::Flagged);
        assert_eq!(rep.multiplier, 1.5);

        // Past the expiry the score-derived multiplier applies again.
        let later = now + Duration::days(2);
        assert!(rep.active_vip(later).is_none());
        assert_eq!(rep.effective_multiplier(later), 0.5);
    }

    #[test]
    fn test_event_type_display() {
        assert_eq!(ReputationEventType::AdminOverride.to_string(), "admin_override");
        assert_eq!(ReputationEventType::VipRemoved.to_string(), "vip_removed");
    }
}
