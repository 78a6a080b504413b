//! Token bucket accounting for a single client.

use std::time::{Duration, Instant};

/// Refill parameters shared by every bucket of a limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketLimits {
    /// Tokens added per second
    pub rate: f64,
    /// Maximum number of tokens a bucket can hold
    pub capacity: f64,
}

impl BucketLimits {
    /// Create limits from a refill rate and a burst capacity.
    pub fn new(rate: f64, capacity: u32) -> Self {
        Self {
            rate,
            capacity: f64::from(capacity),
        }
    }
}

/// Token accounting state for one client key.
///
/// Tokens accumulate continuously: fractional refills are kept between
/// calls, so sub-second arrival patterns are not rounded to whole ticks.
/// The bucket itself is not synchronized; the registry wraps each one in
/// its own lock.
#[derive(Debug, Clone)]
pub struct Bucket {
    /// Currently available tokens, always within `0..=capacity`
    tokens: f64,
    /// When the tokens were last brought up to date
    last_refill: Instant,
}

impl Bucket {
    /// Create a full bucket.
    pub fn new(limits: &BucketLimits, now: Instant) -> Self {
        Self {
            tokens: limits.capacity,
            last_refill: now,
        }
    }

    /// Refill for the time elapsed since the last update, then try to take
    /// one token.
    ///
    /// Returns `true` if a token was taken. On rejection the bucket keeps
    /// whatever the refill produced.
    pub fn consume(&mut self, limits: &BucketLimits, now: Instant) -> bool {
        self.refill(limits, now);

        let admitted = if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        };

        debug_assert!(
            self.tokens >= 0.0 && self.tokens <= limits.capacity,
            "bucket tokens {} outside 0..={}",
            self.tokens,
            limits.capacity
        );
        admitted
    }

    /// Bring the token count up to date with `now`.
    ///
    /// A `now` earlier than the last refill counts as zero elapsed time and
    /// leaves `last_refill` where it is.
    fn refill(&mut self, limits: &BucketLimits, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * limits.rate).min(limits.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// Currently available tokens.
    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    /// When the bucket was last updated.
    pub fn last_refill(&self) -> Instant {
        self.last_refill
    }

    /// How long the bucket has gone without an admission check.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_refill)
    }
}
