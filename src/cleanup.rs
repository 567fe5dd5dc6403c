//! Periodic purge of expired counters, violations and metrics.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CleanupConfig;
use crate::ratelimit::RateLimiter;

/// Shortest interval the scheduler will run at.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Rows removed by one cleanup cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub buckets_deleted: u64,
    pub violations_deleted: u64,
    pub metrics_deleted: u64,
    /// Deletes that failed and were skipped
    pub failures: u32,
}

/// Run a single cleanup cycle.
///
/// Each delete is independent; a failure is logged and the cycle moves on.
pub async fn run_once(limiter: &RateLimiter, config: &CleanupConfig) -> CleanupReport {
    let now = limiter.now();
    let mut report = CleanupReport::default();

    if let Some(before) = cutoff(now, config.bucket_retention()) {
        match limiter.cleanup_old_buckets(before).await {
            Ok(deleted) => report.buckets_deleted = deleted,
            Err(e) => {
                warn!(error = %e, "Bucket cleanup failed");
                report.failures += 1;
            }
        }
    }

    if let Some(before) = cutoff(now, config.violation_retention()) {
        match limiter.cleanup_old_violations(before).await {
            Ok(deleted) => report.violations_deleted = deleted,
            Err(e) => {
                warn!(error = %e, "Violation cleanup failed");
                report.failures += 1;
            }
        }
    }

    if let Some(before) = cutoff(now, config.metrics_retention()) {
        match limiter.cleanup_old_metrics(before).await {
            Ok(deleted) => report.metrics_deleted = deleted,
            Err(e) => {
                warn!(error = %e, "Metrics cleanup failed");
                report.failures += 1;
            }
        }
    }

    debug!(
        buckets = report.buckets_deleted,
        violations = report.violations_deleted,
        metrics = report.metrics_deleted,
        failures = report.failures,
        "Cleanup cycle finished"
    );
    report
}

fn cutoff(now: DateTime<Utc>, retention: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|retention| now.checked_sub_signed(retention))
}

/// Background task running `run_once` on a fixed interval.
pub struct CleanupScheduler {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl CleanupScheduler {
    /// Spawn the cleanup task. The first cycle runs immediately.
    ///
    /// Intervals shorter than one second are raised to one second.
    pub fn start(limiter: Arc<RateLimiter>, config: CleanupConfig) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let interval = config.interval();
        if interval < MIN_INTERVAL {
            warn!(interval_secs = interval.as_secs(), "Cleanup interval too short, using 1s");
        }
        let interval = interval.max(MIN_INTERVAL);

        let handle = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "Starting cleanup task");
            let mut timer = tokio::time::interval(interval);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        info!("Cleanup task shutting down");
                        break;
                    }
                    _ = timer.tick() => {
                        run_once(&limiter, &config).await;
                    }
                }
            }
        });

        Self { shutdown, handle }
    }

    /// Signal the task and wait for any in-flight cycle to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Cleanup task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RateLimitingConfig;
    use crate::ratelimit::{LimitCheckRequest, LimitType, RuleDefinition, Scope};
    use crate::store::testing::FaultyStore;
    use crate::store::MemoryStore;
    use chrono::TimeZone;
    use std::sync::atomic::Ordering;

    fn setup() -> (Arc<MemoryStore>, Arc<ManualClock>, Arc<RateLimiter>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ));
        let config = RateLimitingConfig {
            enable_metrics: false,
            ..RateLimitingConfig::default()
        };
        let limiter = RateLimiter::new(store.clone(), config).with_clock(clock.clone());
        (store, clock, Arc::new(limiter))
    }

    #[tokio::test]
    async fn test_run_once_purges_by_retention() {
        let (store, clock, limiter) = setup();
        limiter
            .create_rule(RuleDefinition::new("api", Scope::Ip, LimitType::PerSecond, 1))
            .await
            .unwrap();

        let request = LimitCheckRequest::new("api", Scope::Ip, "10.0.0.1");
        limiter.check_limit(&request).await.unwrap();
        limiter.check_limit(&request).await.unwrap();
        assert_eq!(store.bucket_count(), 1);
        assert_eq!(store.violation_count(), 1);

        let config = CleanupConfig::default();

        // Nothing is old enough yet.
        let report = run_once(&limiter, &config).await;
        assert_eq!(report, CleanupReport::default());

        clock.advance(Duration::from_secs(3 * 3600));
        let report = run_once(&limiter, &config).await;
        assert_eq!(report.buckets_deleted, 1);
        assert_eq!(report.violations_deleted, 0);

        clock.advance(Duration::from_secs(8 * 86400));
        let report = run_once(&limiter, &config).await;
        assert_eq!(report.violations_deleted, 1);
        assert_eq!(store.violation_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_deletes_are_skipped() {
        let store = Arc::new(FaultyStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ));
        let limiter = RateLimiter::new(store.clone(), RateLimitingConfig::default())
            .with_clock(clock.clone());
        limiter
            .create_rule(RuleDefinition::new("api", Scope::Ip, LimitType::PerSecond, 1))
            .await
            .unwrap();

        let request = LimitCheckRequest::new("api", Scope::Ip, "10.0.0.1");
        limiter.check_limit(&request).await.unwrap();
        limiter.check_limit(&request).await.unwrap();
        for _ in 0..100 {
            if store.inner.metric_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.inner.metric_count(), 2);

        clock.advance(Duration::from_secs(90 * 86400));
        store.fail_cleanup.store(true, Ordering::SeqCst);
        let report = run_once(&limiter, &CleanupConfig::default()).await;

        assert_eq!(report.failures, 2);
        assert_eq!(report.buckets_deleted, 0);
        assert_eq!(report.violations_deleted, 0);
        assert_eq!(report.metrics_deleted, 2);
        assert_eq!(store.inner.bucket_count(), 1);
        assert_eq!(store.inner.violation_count(), 1);

        // The next cycle picks up what was skipped.
        store.fail_cleanup.store(false, Ordering::SeqCst);
        let report = run_once(&limiter, &CleanupConfig::default()).await;
        assert_eq!(report.failures, 0);
        assert_eq!(report.buckets_deleted, 1);
        assert_eq!(report.violations_deleted, 1);
    }

    #[tokio::test]
    async fn test_zero_interval_is_clamped() {
        let (_, _, limiter) = setup();
        let config = CleanupConfig {
            interval_secs: 0,
            ..CleanupConfig::default()
        };
        let scheduler = CleanupScheduler::start(limiter, config);
        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.stop().await;
    }

    #[test]
    fn test_cutoff_out_of_range() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert!(cutoff(now, Duration::from_secs(u64::MAX)).is_none());
        assert_eq!(
            cutoff(now, Duration::from_secs(60)),
            Some(now - chrono::Duration::seconds(60))
        );
    }

    #[tokio::test]
    async fn test_scheduler_runs_and_stops() {
        let (store, clock, limiter) = setup();
        limiter
            .create_rule(RuleDefinition::new("api", Scope::Ip, LimitType::PerSecond, 5))
            .await
            .unwrap();
        limiter
            .check_limit(&LimitCheckRequest::new("api", Scope::Ip, "a"))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(3 * 3600));

        let config = CleanupConfig {
            interval_secs: 3600,
            ..CleanupConfig::default()
        };
        let scheduler = CleanupScheduler::start(limiter.clone(), config);

        for _ in 0..100 {
            if store.bucket_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.bucket_count(), 0);

        scheduler.stop().await;
    }
}
