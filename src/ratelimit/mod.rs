//! Rate limiting algorithms and their composition.

mod clock;
mod context;
mod fixed_window;
mod leaky_bucket;
mod limiter;
mod multi;
mod rules;
mod sliding_log;
mod sliding_window;
mod throttle;
mod token_bucket;

pub use clock::{Clock, ManualClock, SystemClock};
pub use context::{CancelHandle, WaitContext};
pub use fixed_window::{FixedWindowConfig, FixedWindowLimiter};
pub use leaky_bucket::{LeakyBucketConfig, LeakyBucketLimiter, DEFAULT_LEAK_PERIOD};
pub use limiter::{Rate, RateLimiter};
pub use multi::MultiLimiter;
pub use rules::{LimiterSpec, StrategySpec};
pub use sliding_log::{SlidingLogLimiter, SlidingLogStrategy};
pub use sliding_window::{SlidingWindowConfig, SlidingWindowLimiter};
pub use throttle::{Throttle, ThrottleConfig};
pub use token_bucket::{TokenBucketConfig, TokenBucketLimiter};
