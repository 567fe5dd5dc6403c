//! Trust tiers and the adaptive limit multiplier.
//!
//! Both are pure functions of the score so they can be recomputed on every
//! read instead of trusting a stored copy.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lowest possible score.
pub const MIN_SCORE: f64 = 0.0;
/// Highest possible score.
pub const MAX_SCORE: f64 = 100.0;
/// Score of a new user, and the point decay drifts toward.
pub const NEUTRAL_SCORE: f64 = 50.0;

/// Lower bound of the standard tier.
const STANDARD_THRESHOLD: f64 = 20.0;
/// Lower bound of the trusted tier.
const TRUSTED_THRESHOLD: f64 = 80.0;
/// Scores below this are reported as suspended in statistics.
pub const SUSPENDED_THRESHOLD: f64 = 10.0;

/// A discrete trust class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// score < 20
    Flagged,
    /// 20 <= score < 80
    Standard,
    /// score >= 80
    Trusted,
}

impl Tier {
    pub fn for_score(score: f64) -> Tier {
        if score < STANDARD_THRESHOLD {
            Tier::Flagged
        } else if score < TRUSTED_THRESHOLD {
            Tier::Standard
        } else {
            Tier::Trusted
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Flagged => "flagged",
            Tier::Standard => "standard",
            Tier::Trusted => "trusted",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capacity multiplier for a reputation score.
///
/// A non-decreasing step function: below 1.0 for low scores, 1.0 in the band
/// around the neutral score, above 1.0 for high scores.
pub fn adaptive_multiplier(score: f64) -> f64 {
    if score.is_nan() {
        return 1.0;
    }
    if score < 20.0 {
        0.5
    } else if score < 40.0 {
        0.75
    } else if score < 50.0 {
        0.9
    } else if score < 75.0 {
        1.0
    } else if score < 90.0 {
        1.2
    } else {
        1.5
    }
}

/// Clamp a score into `[MIN_SCORE, MAX_SCORE]`.
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        return NEUTRAL_SCORE;
    }
    score.clamp(MIN_SCORE, MAX_SCORE)
}

/// Apply a multiplier to a base limit, rounding down.
pub fn scale_limit(base: u64, multiplier: f64) -> u64 {
    let scaled = (base as f64 * multiplier).floor();
    if scaled.is_nan() || scaled <= 0.0 {
        0
    } else {
        scaled as u64
    }
}
