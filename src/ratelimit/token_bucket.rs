//! Token bucket with lazy refill.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::clock::{default_clock, Clock};
use super::context::WaitContext;
use super::limiter::{wait_for_admission, Admission, Rate, RateLimiter};
use crate::error::{RatekeeperError, Result};

/// Configuration for a [`TokenBucketLimiter`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketConfig {
    /// Bucket depth; also the initial token count
    pub burst: u64,
    /// Rate at which tokens are added back
    pub rate: Rate,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Duration,
}

/// A token bucket that tops itself up on every call.
///
/// Tokens accumulate continuously at `rate` up to `burst`; the elapsed time
/// since the previous call is converted into tokens before each check, so no
/// background task is needed. See [`Throttle`](super::Throttle) for the
/// ticking variant.
pub struct TokenBucketLimiter {
    burst: u64,
    rate: Rate,
    clock: Arc<dyn Clock>,
    state: Mutex<BucketState>,
}

impl TokenBucketLimiter {
    /// Create a full bucket on the system clock.
    pub fn new(config: TokenBucketConfig) -> Result<Self> {
        Self::with_clock(config, default_clock())
    }

    /// Create a full bucket on the given clock.
    pub fn with_clock(config: TokenBucketConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.burst == 0 {
            return Err(RatekeeperError::Config(
                "token bucket burst must be greater than zero".to_string(),
            ));
        }
        let per_second = config.rate.events_per_second();
        if per_second.is_nan() || per_second <= 0.0 {
            return Err(RatekeeperError::Config(format!(
                "token bucket rate must be positive, got {}",
                config.rate
            )));
        }

        debug!(burst = config.burst, rate = %config.rate, "Creating token bucket limiter");

        let now = clock.now();
        Ok(Self {
            burst: config.burst,
            rate: config.rate,
            clock,
            state: Mutex::new(BucketState {
                tokens: config.burst as f64,
                last_refill: now,
            }),
        })
    }

    /// Tokens currently available, after accounting for elapsed time.
    pub fn tokens(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now();
        let elapsed = now.saturating_sub(state.last_refill);
        state.last_refill = now;

        let added = elapsed.as_secs_f64() * self.rate.events_per_second();
        state.tokens = (state.tokens + added).min(self.burst as f64);
    }

    fn attempt(&self, n: u64) -> Admission {
        let mut state = self.state.lock();
        self.refill(&mut state);

        let needed = n as f64;
        if state.tokens >= needed {
            state.tokens -= needed;
            trace!(n = n, remaining = state.tokens, "Token bucket admitted");
            return Admission::Granted;
        }

        let deficit = needed - state.tokens;
        let delay = if self.rate.is_infinite() {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(deficit / self.rate.events_per_second())
                .unwrap_or(Duration::MAX)
        };
        Admission::RetryAfter(delay)
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    fn try_acquire_n(&self, n: u64) -> bool {
        if n == 0 {
            return true;
        }
        if n > self.burst {
            return false;
        }
        matches!(self.attempt(n), Admission::Granted)
    }

    async fn wait_n(&self, ctx: &WaitContext, n: u64) -> Result<()> {
        wait_for_admission(ctx, n, self.burst, || self.attempt(n)).await
    }

    fn limit(&self) -> Rate {
        self.rate
    }

    fn burst(&self) -> u64 {
        self.burst
    }
}
