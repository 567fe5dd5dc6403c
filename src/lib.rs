//! Trustgate - Reputation-Aware Admission Control
//!
//! This crate decides, per request, whether a caller may proceed. Requests are
//! checked against prioritized multi-window rate rules (sliding windows for
//! seconds to hours, fixed quotas for days to months), and the effective limit
//! for a user adapts to a behavioral trust score that every decision feeds.

pub mod cache;
pub mod cleanup;
pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod reputation;
pub mod store;

pub use cleanup::{CleanupReport, CleanupScheduler};
pub use config::TrustgateConfig;
pub use error::{Result, TrustgateError};
pub use ratelimit::{Decision, LimitCheckRequest, RateLimiter};
pub use reputation::ReputationManager;
pub use store::MemoryStore;
