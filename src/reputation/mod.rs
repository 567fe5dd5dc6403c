//! Behavioral trust scoring and adaptive limits.

mod manager;
mod model;
mod tier;

pub use manager::ReputationManager;
pub use model::{RepStats, ReputationEvent, ReputationEventType, UserReputation, VipOverride};
pub use tier::{
    adaptive_multiplier, clamp_score, scale_limit, Tier, MAX_SCORE, MIN_SCORE, NEUTRAL_SCORE,
    SUSPENDED_THRESHOLD,
};
