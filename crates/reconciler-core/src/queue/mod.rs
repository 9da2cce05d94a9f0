//! Queue module: bookkeeping state, rate limiters, and the work queue itself.

mod rate_limiter;
mod state;
mod work_queue;

pub use rate_limiter::{
    BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter, RateLimiter,
    default_controller_rate_limiter,
};
pub use work_queue::WorkQueue;
