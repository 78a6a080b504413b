//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use super::bucket::BucketLimits;
use super::clock::{Clock, SystemClock};
use super::registry::Registry;
use super::sweeper::Sweeper;
use crate::error::{Result, TurnstileError};

/// Default refill rate in tokens per second.
pub const DEFAULT_RATE: f64 = 10.0;
/// Default burst capacity.
pub const DEFAULT_CAPACITY: u32 = 20;
/// Default time between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Default inactivity before a bucket is evicted.
pub const DEFAULT_IDLE_HORIZON: Duration = Duration::from_secs(10 * 60);
/// Longest accepted sweep interval or idle horizon.
pub const MAX_SWEEP_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Configuration for a [`RateLimiter`].
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterConfig {
    /// Tokens replenished per second per client
    pub rate: f64,
    /// Maximum burst size per client
    pub capacity: u32,
    /// How often idle buckets are swept
    pub sweep_interval: Duration,
    /// Inactivity after which a bucket is reclaimed
    pub idle_horizon: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rate: DEFAULT_RATE,
            capacity: DEFAULT_CAPACITY,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            idle_horizon: DEFAULT_IDLE_HORIZON,
        }
    }
}

impl LimiterConfig {
    /// Create a configuration with the given rate and capacity and default
    /// sweep settings.
    pub fn new(rate: f64, capacity: u32) -> Self {
        Self {
            rate,
            capacity,
            ..Self::default()
        }
    }

    /// Set the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the idle horizon.
    pub fn with_idle_horizon(mut self, horizon: Duration) -> Self {
        self.idle_horizon = horizon;
        self
    }

    /// Check the configuration invariants.
    pub fn validate(&self) -> Result<()> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(TurnstileError::Config(format!(
                "rate must be a positive number, got {}",
                self.rate
            )));
        }
        if self.capacity < 1 {
            return Err(TurnstileError::Config(format!(
                "capacity must be at least 1, got {}",
                self.capacity
            )));
        }
        check_duration("sweep interval", self.sweep_interval)?;
        check_duration("idle horizon", self.idle_horizon)?;
        Ok(())
    }

    fn limits(&self) -> BucketLimits {
        BucketLimits::new(self.rate, self.capacity)
    }
}

fn check_duration(name: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(TurnstileError::Config(format!("{} must be non-zero", name)));
    }
    if value > MAX_SWEEP_DURATION {
        return Err(TurnstileError::Config(format!(
            "{} must be at most {}s, got {}s",
            name,
            MAX_SWEEP_DURATION.as_secs(),
            value.as_secs()
        )));
    }
    Ok(())
}

/// Per-client token bucket rate limiter.
///
/// This struct is thread-safe and can be shared across tasks. Building one
/// starts a background sweeper on the current tokio runtime, which runs
/// until [`shutdown`](RateLimiter::shutdown) is called or the limiter is
/// dropped.
#[derive(Debug)]
pub struct RateLimiter {
    /// Buckets indexed by client key
    registry: Arc<Registry>,
    /// Source of timestamps for accounting and eviction
    clock: Arc<dyn Clock>,
    /// Settings the limiter was built with
    config: LimiterConfig,
    /// Running sweep task, if not yet shut down
    sweeper: Mutex<Option<Sweeper>>,
}

impl RateLimiter {
    /// Create a rate limiter driven by the system clock.
    pub fn new(config: LimiterConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a rate limiter driven by `clock`.
    pub fn with_clock(config: LimiterConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(Registry::new(config.limits()));
        let sweeper = Sweeper::spawn(
            Arc::clone(&registry),
            Arc::clone(&clock),
            config.sweep_interval,
            config.idle_horizon,
        )?;

        info!(
            rate = config.rate,
            capacity = config.capacity,
            sweep_interval_secs = config.sweep_interval.as_secs(),
            idle_horizon_secs = config.idle_horizon.as_secs(),
            "Rate limiter initialized"
        );

        Ok(Self {
            registry,
            clock,
            config,
            sweeper: Mutex::new(Some(sweeper)),
        })
    }

    /// Decide whether a request from `client_key` may proceed.
    ///
    /// Takes one token from the client's bucket if one is available. Never
    /// blocks on anything but the client's own bucket.
    pub fn allow(&self, client_key: &str) -> bool {
        let now = self.clock.now();
        let admitted = self.registry.allow(client_key, now);

        trace!(key = %client_key, admitted = admitted, "Checked rate limit");
        if !admitted {
            debug!(key = %client_key, "Rate limit exceeded");
        }
        admitted
    }

    /// Run one eviction pass immediately. Returns the number of evicted
    /// buckets.
    pub fn sweep_now(&self) -> usize {
        let evicted = self
            .registry
            .sweep(self.clock.now(), self.config.idle_horizon);
        debug!(evicted = evicted, "Manual sweep complete");
        evicted
    }

    /// Stop the background sweeper. Idempotent.
    ///
    /// Admission keeps working afterwards; idle buckets are simply no longer
    /// reclaimed.
    pub fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
            info!("Rate limiter shut down");
        }
    }

    /// Whether the background sweeper is still running.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .is_some_and(|sweeper| !sweeper.is_finished())
    }

    /// Number of clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.registry.len()
    }

    /// Suggested wait before a rejected client retries: the time to refill
    /// one token, rounded up to whole seconds.
    pub fn retry_after(&self) -> Duration {
        let secs = (1.0 / self.config.rate).ceil().max(1.0);
        Duration::from_secs(secs as u64)
    }

    /// The configuration this limiter was built with.
    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    /// The underlying bucket registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use tokio_test::{assert_err, assert_ok};

    fn limiter(rate: f64, capacity: u32) -> (RateLimiter, ManualClock) {
        let clock = ManualClock::new();
        let limiter =
            RateLimiter::with_clock(LimiterConfig::new(rate, capacity), Arc::new(clock.clone()))
                .unwrap();
        (limiter, clock)
    }

    #[test]
    fn test_config_defaults() {
        let config = LimiterConfig::default();
        assert_eq!(config.rate, 10.0);
        assert_eq!(config.capacity, 20);
        assert_eq!(config.sweep_interval, Duration::from_secs(300));
        assert_eq!(config.idle_horizon, Duration::from_secs(600));
        assert_ok!(config.validate());
    }

    #[test]
    fn test_config_validation() {
        assert_err!(LimiterConfig::new(0.0, 20).validate());
        assert_err!(LimiterConfig::new(-1.0, 20).validate());
        assert_err!(LimiterConfig::new(f64::NAN, 20).validate());
        assert_err!(LimiterConfig::new(f64::INFINITY, 20).validate());
        assert_err!(LimiterConfig::new(10.0, 0).validate());
        assert_err!(LimiterConfig::new(10.0, 20)
            .with_sweep_interval(Duration::ZERO)
            .validate());
        assert_err!(LimiterConfig::new(10.0, 20)
            .with_idle_horizon(Duration::ZERO)
            .validate());
        assert_ok!(LimiterConfig::new(0.5, 1).validate());
    }

    #[test]
    fn test_config_rejects_oversized_durations() {
        let forever = Duration::from_secs(u64::MAX);
        assert_err!(LimiterConfig::default().with_sweep_interval(forever).validate());
        assert_err!(LimiterConfig::default().with_idle_horizon(forever).validate());

        let just_over = MAX_SWEEP_DURATION + Duration::from_secs(1);
        assert_err!(LimiterConfig::default().with_sweep_interval(just_over).validate());
        assert_ok!(LimiterConfig::default()
            .with_sweep_interval(MAX_SWEEP_DURATION)
            .with_idle_horizon(MAX_SWEEP_DURATION)
            .validate());
    }

    #[tokio::test]
    async fn test_new_rejects_unbounded_sweep_interval() {
        let config = LimiterConfig::new(10.0, 20).with_sweep_interval(Duration::from_secs(u64::MAX));
        let result = RateLimiter::new(config);
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_longest_sweep_interval_keeps_sweeper_running() {
        let config = LimiterConfig::new(10.0, 20)
            .with_sweep_interval(MAX_SWEEP_DURATION)
            .with_idle_horizon(MAX_SWEEP_DURATION);
        let limiter = RateLimiter::new(config).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(limiter.is_sweeping());
        limiter.shutdown();
    }

    #[tokio::test]
    async fn test_retry_after_saturates_for_tiny_rate() {
        let (limiter, _clock) = limiter(1e-30, 1);
        assert_eq!(limiter.retry_after(), Duration::from_secs(u64::MAX));
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let zero_rate = RateLimiter::new(LimiterConfig::new(0.0, 20));
        assert!(matches!(zero_rate, Err(TurnstileError::Config(_))));

        let zero_capacity = RateLimiter::new(LimiterConfig::new(10.0, 0));
        assert!(matches!(zero_capacity, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let result = RateLimiter::new(LimiterConfig::default());
        assert!(matches!(result, Err(TurnstileError::Runtime(_))));
    }

    #[tokio::test]
    async fn test_rate_limiter_creation() {
        let (limiter, _clock) = limiter(10.0, 20);
        assert_eq!(limiter.tracked_clients(), 0);
        assert!(limiter.is_sweeping());
    }

    #[tokio::test]
    async fn test_burst_throttle_and_recovery() {
        let (limiter, clock) = limiter(10.0, 20);

        let results: Vec<bool> = (0..25).map(|_| limiter.allow("203.0.113.7")).collect();
        assert_eq!(&results[..20], &[true; 20]);
        assert_eq!(&results[20..], &[false; 5]);

        clock.advance(Duration::from_secs(1));
        for i in 0..10 {
            assert!(limiter.allow("203.0.113.7"), "call {} should be admitted", i);
        }
        assert!(!limiter.allow("203.0.113.7"));
    }

    #[tokio::test]
    async fn test_exhausted_key_does_not_affect_others() {
        let (limiter, _clock) = limiter(1.0, 3);

        for _ in 0..10 {
            limiter.allow("noisy");
        }
        assert!(!limiter.allow("noisy"));

        for _ in 0..3 {
            assert!(limiter.allow("quiet"));
        }
        assert_eq!(limiter.tracked_clients(), 2);
    }

    #[tokio::test]
    async fn test_clock_going_backwards_is_harmless() {
        let (limiter, clock) = limiter(10.0, 2);
        clock.advance(Duration::from_secs(60));

        assert!(limiter.allow("client"));
        clock.rewind(Duration::from_secs(30));
        assert!(limiter.allow("client"));
        assert!(!limiter.allow("client"));

        let tokens = limiter.registry().tokens("client").unwrap();
        assert!((0.0..=2.0).contains(&tokens));
    }

    #[tokio::test]
    async fn test_sweep_now_evicts_and_recreates_full() {
        let (limiter, clock) = limiter(10.0, 5);

        for _ in 0..5 {
            assert!(limiter.allow("client"));
        }
        assert!(!limiter.allow("client"));

        clock.advance(Duration::from_secs(601));
        assert_eq!(limiter.sweep_now(), 1);
        assert_eq!(limiter.tracked_clients(), 0);

        assert!(limiter.allow("client"));
        assert_eq!(limiter.registry().tokens("client"), Some(4.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tasks_admit_exactly_capacity() {
        const CAPACITY: u32 = 200;

        let (limiter, _clock) = limiter(1.0, CAPACITY);
        let limiter = Arc::new(limiter);

        let handles: Vec<_> = (0..CAPACITY * 2)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.allow("shared") })
            })
            .collect();

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }

        assert_eq!(admitted, CAPACITY);
    }

    #[tokio::test]
    async fn test_shutdown_stops_sweeper() {
        let (limiter, _clock) = limiter(10.0, 20);
        assert!(limiter.is_sweeping());

        limiter.shutdown();
        assert!(!limiter.is_sweeping());

        // Idempotent, and admission still works
        limiter.shutdown();
        assert!(limiter.allow("client"));
    }

    #[tokio::test]
    async fn test_retry_after() {
        let (fast, _) = limiter(10.0, 20);
        assert_eq!(fast.retry_after(), Duration::from_secs(1));

        let (slow, _) = limiter(0.25, 1);
        assert_eq!(slow.retry_after(), Duration::from_secs(4));
    }
}
