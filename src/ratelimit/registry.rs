//! Concurrent client key to bucket registry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::bucket::{Bucket, BucketLimits};

/// Shared handle to a single client's bucket.
pub type SharedBucket = Arc<Mutex<Bucket>>;

/// Owns the bucket of every client key seen recently.
///
/// Locking is two-tier. The sharded map is only locked exclusively to insert
/// or remove a key, and each bucket has its own mutex for token math, so
/// clients never wait on each other's accounting. Keys that share a map
/// shard can still wait on one another while a new key is inserted or an
/// idle one is removed; lookups of existing keys only take the shard's read
/// lock.
#[derive(Debug)]
pub struct Registry {
    /// Buckets indexed by client key
    buckets: DashMap<String, SharedBucket>,
    /// Refill parameters applied to every bucket
    limits: BucketLimits,
}

impl Registry {
    /// Create an empty registry.
    pub fn new(limits: BucketLimits) -> Self {
        Self {
            buckets: DashMap::new(),
            limits,
        }
    }

    /// Find the bucket for `key`, creating a full one on first sight.
    ///
    /// Concurrent first-sight calls for the same key all receive the same
    /// bucket.
    pub fn resolve(&self, key: &str, now: Instant) -> SharedBucket {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }

        // `entry` takes the shard's write lock and re-checks for the key
        let bucket = self.buckets.entry(key.to_owned()).or_insert_with(|| {
            debug!(
                key = %key,
                capacity = self.limits.capacity,
                rate = self.limits.rate,
                "Creating new bucket"
            );
            Arc::new(Mutex::new(Bucket::new(&self.limits, now)))
        });
        Arc::clone(bucket.value())
    }

    /// Resolve the bucket for `key` and try to take one token from it.
    pub fn allow(&self, key: &str, now: Instant) -> bool {
        let bucket = self.resolve(key, now);
        let admitted = bucket.lock().consume(&self.limits, now);
        admitted
    }

    /// Remove every bucket that has been idle for longer than `idle_horizon`.
    ///
    /// Idle keys are collected under shard read locks, then each one is
    /// removed under its shard's write lock after re-checking it. A bucket
    /// still referenced by an in-flight [`allow`](Self::allow), or touched
    /// since the scan, is kept. Returns the number of buckets removed.
    pub fn sweep(&self, now: Instant, idle_horizon: Duration) -> usize {
        let candidates: Vec<String> = self
            .buckets
            .iter()
            .filter(|entry| entry.value().lock().idle_for(now) > idle_horizon)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for key in candidates {
            let removed = self.buckets.remove_if(&key, |_, bucket| {
                Arc::strong_count(bucket) == 1 && bucket.lock().idle_for(now) > idle_horizon
            });
            if removed.is_some() {
                trace!(key = %key, "Evicting idle bucket");
                evicted += 1;
            }
        }

        evicted
    }

    /// The refill parameters for this registry.
    pub fn limits(&self) -> &BucketLimits {
        &self.limits
    }

    /// Number of tracked client keys.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no client keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Whether `key` currently has a bucket.
    pub fn contains(&self, key: &str) -> bool {
        self.buckets.contains_key(key)
    }

    /// Available tokens for `key`, as of its last update.
    pub fn tokens(&self, key: &str) -> Option<f64> {
        self.buckets.get(key).map(|bucket| bucket.lock().tokens())
    }

    /// Last refill time for `key`.
    pub fn last_refill(&self, key: &str) -> Option<Instant> {
        self.buckets.get(key).map(|bucket| bucket.lock().last_refill())
    }
}
