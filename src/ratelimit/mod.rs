//! Rate limiting logic and state management.

mod bucket;
mod clock;
mod limiter;
mod registry;
mod sweeper;

pub use bucket::{Bucket, BucketLimits};
pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use limiter::{
    LimiterConfig, RateLimiter, DEFAULT_CAPACITY, DEFAULT_IDLE_HORIZON, DEFAULT_RATE,
    DEFAULT_SWEEP_INTERVAL, MAX_SWEEP_DURATION,
};
pub use registry::{Registry, SharedBucket};
pub use sweeper::Sweeper;
