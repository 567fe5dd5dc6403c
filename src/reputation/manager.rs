//! Per-user reputation scoring and the adaptive limit it drives.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::model::{RepStats, ReputationEvent, ReputationEventType, UserReputation, VipOverride};
use super::tier::{scale_limit, Tier, MAX_SCORE, MIN_SCORE, NEUTRAL_SCORE, SUSPENDED_THRESHOLD};
use crate::cache::TtlCache;
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TrustgateError};
use crate::ratelimit::period_bounds;
use crate::store::ReputationStore;

/// Number of mutation locks users are hashed onto.
const LOCK_STRIPES: usize = 64;
/// Score lost per unit of violation severity.
const VIOLATION_PENALTY: f64 = 3.0;
const CLEAN_REQUEST_REWARD: f64 = 0.01;
/// Only every n-th clean request is written to the event log.
const CLEAN_EVENT_INTERVAL: u64 = 10;
const DECAY_STEP: f64 = 1.0;
const MAX_SEVERITY: u8 = 5;

/// What a mutation did to the row it was given.
enum Change {
    Unchanged,
    Updated(Option<ReputationEvent>),
}

/// Tracks user trust and derives adaptive limits from it.
///
/// Reads go through a per-user TTL cache. Mutations for the same user are
/// serialized on a striped lock, always start from the stored row and leave
/// the written row in the cache. Cache fills take the same lock.
pub struct ReputationManager {
    store: Arc<dyn ReputationStore>,
    cache: TtlCache<String, UserReputation>,
    locks: Vec<Mutex<()>>,
    clock: Arc<dyn Clock>,
}

impl ReputationManager {
    pub fn new(store: Arc<dyn ReputationStore>, cache_ttl: Duration) -> Self {
        Self {
            store,
            cache: TtlCache::new(cache_ttl),
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Use a different time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn stripe(&self, user_id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        &self.locks[(hasher.finish() as usize) % self.locks.len()]
    }

    /// Apply `f` to the stored row under the user's lock, persist the result
    /// and cache it.
    async fn mutate<F>(&self, user_id: &str, f: F) -> Result<UserReputation>
    where
        F: FnOnce(&mut UserReputation, DateTime<Utc>) -> Change + Send,
    {
        let _guard = self.stripe(user_id).lock().await;
        let now = self.clock.now();

        let mut reputation = self.store.get_or_create_reputation(user_id, now).await?;
        if let Change::Updated(event) = f(&mut reputation, now) {
            reputation.refresh(now);
            reputation.updated_at = now;
            self.store.put_reputation(reputation.clone()).await?;
            if let Some(event) = event {
                self.store.insert_rep_event(event).await?;
            }
            self.cache.insert(user_id.to_string(), reputation.clone());
        }

        reputation.refresh(now);
        Ok(reputation)
    }

    /// Current reputation, creating a neutral record for unknown users.
    ///
    /// Tier and multiplier are recomputed at read time, so an expired VIP
    /// override stops applying without a write.
    pub async fn get_user_reputation(&self, user_id: &str) -> Result<UserReputation> {
        let now = self.clock.now();
        let key = user_id.to_string();

        let mut reputation = match self.cache.get(&key) {
            Some(cached) => cached,
            None => {
                // Fills share the mutation lock, so a fill never lands after a newer write.
                let _guard = self.stripe(user_id).lock().await;
                match self.cache.get(&key) {
                    Some(cached) => cached,
                    None => {
                        let stored = self.store.get_or_create_reputation(user_id, now).await?;
                        self.cache.insert(key, stored.clone());
                        stored
                    }
                }
            }
        };
        reputation.refresh(now);
        Ok(reputation)
    }

    /// Penalize a user for a violation of the given severity (1 to 5).
    pub async fn record_violation(
        &self,
        user_id: &str,
        severity: u8,
        reason: &str,
    ) -> Result<UserReputation> {
        if !(1..=MAX_SEVERITY).contains(&severity) {
            return Err(TrustgateError::Validation(format!(
                "severity must be between 1 and {}, got {}",
                MAX_SEVERITY, severity
            )));
        }

        let reputation = self
            .mutate(user_id, |rep, now| {
                let applied = rep.adjust_score(-VIOLATION_PENALTY * f64::from(severity));
                rep.total_violations += 1;
                rep.last_violation = Some(now);
                let event = ReputationEvent::new(
                    user_id,
                    ReputationEventType::Violation,
                    applied,
                    reason,
                    now,
                )
                .with_severity(severity);
                Change::Updated(Some(event))
            })
            .await?;

        debug!(
            user_id = %user_id,
            severity,
            score = reputation.score,
            tier = %reputation.tier,
            "Recorded reputation violation"
        );
        Ok(reputation)
    }

    /// Credit a user for a request that passed every rule.
    pub async fn record_clean_request(&self, user_id: &str) -> Result<UserReputation> {
        self.mutate(user_id, |rep, now| {
            let prior = rep.total_clean_requests;
            let applied = rep.adjust_score(CLEAN_REQUEST_REWARD);
            rep.total_clean_requests += 1;

            let event = (prior % CLEAN_EVENT_INTERVAL == 0).then(|| {
                ReputationEvent::new(
                    user_id,
                    ReputationEventType::CleanRequest,
                    applied,
                    "clean request",
                    now,
                )
            });
            Change::Updated(event)
        })
        .await
    }

    /// Move the score one step toward neutral.
    pub async fn apply_rep_decay(&self, user_id: &str) -> Result<UserReputation> {
        self.mutate(user_id, |rep, now| {
            if rep.score == NEUTRAL_SCORE {
                return Change::Unchanged;
            }
            let distance = NEUTRAL_SCORE - rep.score;
            let step = distance.signum() * distance.abs().min(DECAY_STEP);
            let applied = rep.adjust_score(step);
            rep.decay_last_applied = Some(now);

            let event = ReputationEvent::new(
                user_id,
                ReputationEventType::Decay,
                applied,
                "decay toward neutral",
                now,
            );
            Change::Updated(Some(event))
        })
        .await
    }

    /// Set a score directly.
    pub async fn set_user_reputation(
        &self,
        user_id: &str,
        score: f64,
        reason: &str,
    ) -> Result<UserReputation> {
        if !score.is_finite() || !(MIN_SCORE..=MAX_SCORE).contains(&score) {
            return Err(TrustgateError::Validation(format!(
                "score must be between {} and {}, got {}",
                MIN_SCORE, MAX_SCORE, score
            )));
        }

        let reputation = self
            .mutate(user_id, |rep, now| {
                let delta = score - rep.score;
                rep.score = score;
                let event = ReputationEvent::new(
                    user_id,
                    ReputationEventType::AdminOverride,
                    delta,
                    reason,
                    now,
                );
                Change::Updated(Some(event))
            })
            .await?;

        info!(user_id = %user_id, score, reason = %reason, "Reputation overridden");
        Ok(reputation)
    }

    /// Grant a VIP multiplier that replaces the reputation-derived one.
    pub async fn set_vip_tier(
        &self,
        user_id: &str,
        tier_name: &str,
        multiplier: f64,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<UserReputation> {
        if tier_name.trim().is_empty() {
            return Err(TrustgateError::Validation(
                "VIP tier name is required".to_string(),
            ));
        }
        if !multiplier.is_finite() || multiplier <= 0.0 {
            return Err(TrustgateError::Validation(format!(
                "VIP multiplier must be positive, got {}",
                multiplier
            )));
        }
        if let Some(expiry) = expires_at {
            if expiry <= self.clock.now() {
                return Err(TrustgateError::Validation(
                    "VIP expiry must be in the future".to_string(),
                ));
            }
        }

        let reputation = self
            .mutate(user_id, |rep, now| {
                rep.vip = Some(VipOverride {
                    tier_name: tier_name.to_string(),
                    multiplier,
                    expires_at,
                });
                let event = ReputationEvent::new(
                    user_id,
                    ReputationEventType::VipSet,
                    0.0,
                    format!("vip tier {} ({}x)", tier_name, multiplier),
                    now,
                );
                Change::Updated(Some(event))
            })
            .await?;

        info!(user_id = %user_id, tier = %tier_name, multiplier, "VIP tier set");
        Ok(reputation)
    }

    /// Remove a user's VIP override, if any.
    pub async fn remove_vip_tier(&self, user_id: &str) -> Result<UserReputation> {
        self.mutate(user_id, |rep, now| match rep.vip.take() {
            None => Change::Unchanged,
            Some(vip) => Change::Updated(Some(ReputationEvent::new(
                user_id,
                ReputationEventType::VipRemoved,
                0.0,
                format!("vip tier {} removed", vip.tier_name),
                now,
            ))),
        })
        .await
    }

    /// A base limit scaled by the user's current multiplier, rounded down.
    pub async fn get_adaptive_limit(&self, user_id: &str, base_limit: u64) -> Result<u64> {
        let reputation = self.get_user_reputation(user_id).await?;
        Ok(scale_limit(base_limit, reputation.multiplier))
    }

    /// A user's events from the last `days` days, newest first.
    pub async fn get_rep_history(&self, user_id: &str, days: u32) -> Result<Vec<ReputationEvent>> {
        let since = self.clock.now() - ChronoDuration::days(i64::from(days));
        self.store.list_rep_events(user_id, since).await
    }

    pub async fn get_rep_stats(&self) -> Result<RepStats> {
        let now = self.clock.now();
        let reputations = self.store.list_reputations().await?;

        let mut stats = RepStats::default();
        let mut score_total = 0.0;
        for reputation in &reputations {
            let tier = Tier::for_score(reputation.score);
            *stats.users_by_tier.entry(tier).or_default() += 1;
            if tier == Tier::Flagged {
                stats.users_flagged += 1;
            }
            if reputation.score < SUSPENDED_THRESHOLD {
                stats.users_suspended += 1;
            }
            if reputation.active_vip(now).is_some() {
                stats.active_vips += 1;
            }
            score_total += reputation.score;
        }

        stats.total_users = reputations.len() as u64;
        if !reputations.is_empty() {
            stats.average_score = score_total / reputations.len() as f64;
        }

        let (today, _) = period_bounds(now, Duration::from_secs(86400));
        stats.violations_today = self
            .store
            .count_rep_events(ReputationEventType::Violation, today)
            .await?;

        Ok(stats)
    }
}
