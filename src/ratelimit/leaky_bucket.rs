//! Leaky bucket limiter.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::clock::{default_clock, duration_nanos, Clock};
use super::context::WaitContext;
use super::limiter::{wait_for_admission, Admission, Rate, RateLimiter};
use crate::error::{RatekeeperError, Result};

/// Default drain period.
pub const DEFAULT_LEAK_PERIOD: Duration = Duration::from_secs(1);

/// Configuration for a [`LeakyBucketLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeakyBucketConfig {
    /// Level at which the bucket refuses new events
    pub peak: u64,
    /// Units drained per period
    pub velocity: u64,
    /// Drain period
    pub period: Duration,
}

impl LeakyBucketConfig {
    /// A bucket draining `velocity` units per second.
    pub fn new(peak: u64, velocity: u64) -> Self {
        Self {
            peak,
            velocity,
            period: DEFAULT_LEAK_PERIOD,
        }
    }
}

#[derive(Debug)]
struct LeakState {
    level: u64,
    last_leak: Duration,
}

/// A bucket whose level rises by one per admitted event and drains by
/// `velocity` every full `period`.
///
/// Draining happens in whole periods only. The leak timestamp moves forward
/// by exactly the periods drained, so time left over from a partial period
/// still counts towards the next leak.
pub struct LeakyBucketLimiter {
    config: LeakyBucketConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<LeakState>,
}

impl LeakyBucketLimiter {
    /// Create an empty bucket on the system clock.
    pub fn new(config: LeakyBucketConfig) -> Result<Self> {
        Self::with_clock(config, default_clock())
    }

    /// Create an empty bucket on the given clock.
    pub fn with_clock(config: LeakyBucketConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.peak == 0 {
            return Err(RatekeeperError::Config(
                "leaky bucket peak must be greater than zero".to_string(),
            ));
        }
        if config.velocity == 0 {
            return Err(RatekeeperError::Config(
                "leaky bucket velocity must be greater than zero".to_string(),
            ));
        }
        if config.period.is_zero() {
            return Err(RatekeeperError::Config(
                "leaky bucket period must be greater than zero".to_string(),
            ));
        }

        debug!(
            peak = config.peak,
            velocity = config.velocity,
            period = ?config.period,
            "Creating leaky bucket limiter"
        );

        let now = clock.now();
        Ok(Self {
            config,
            clock,
            state: Mutex::new(LeakState {
                level: 0,
                last_leak: now,
            }),
        })
    }

    /// The current level, after draining.
    pub fn level(&self) -> u64 {
        let mut state = self.state.lock();
        self.leak(&mut state, self.clock.now());
        state.level
    }

    fn leak(&self, state: &mut LeakState, now: Duration) {
        let period = duration_nanos(self.config.period);
        let elapsed = duration_nanos(now.saturating_sub(state.last_leak));
        let periods = elapsed / period;
        if periods == 0 {
            return;
        }

        state.level = state
            .level
            .saturating_sub(periods.saturating_mul(self.config.velocity));
        state.last_leak += Duration::from_nanos(periods * period);
    }

    fn attempt(&self, n: u64) -> Admission {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.leak(&mut state, now);

        if state.level + n <= self.config.peak {
            state.level += n;
            trace!(n = n, level = state.level, "Leaky bucket admitted");
            return Admission::Granted;
        }

        let excess = state.level + n - self.config.peak;
        let periods = excess.div_ceil(self.config.velocity);
        let period = duration_nanos(self.config.period);
        let next_leak = duration_nanos(state.last_leak).saturating_add(periods.saturating_mul(period));
        Admission::RetryAfter(Duration::from_nanos(
            next_leak.saturating_sub(duration_nanos(now)),
        ))
    }
}

#[async_trait]
impl RateLimiter for LeakyBucketLimiter {
    fn try_acquire_n(&self, n: u64) -> bool {
        if n == 0 {
            return true;
        }
        if n > self.config.peak {
            return false;
        }
        matches!(self.attempt(n), Admission::Granted)
    }

    async fn wait_n(&self, ctx: &WaitContext, n: u64) -> Result<()> {
        wait_for_admission(ctx, n, self.config.peak, || self.attempt(n)).await
    }

    fn limit(&self) -> Rate {
        Rate::per(self.config.velocity, self.config.period)
    }

    fn burst(&self) -> u64 {
        self.config.peak
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    fn bucket(peak: u64, velocity: u64) -> (LeakyBucketLimiter, ManualClock) {
        let clock = ManualClock::new();
        let limiter = LeakyBucketLimiter::with_clock(
            LeakyBucketConfig::new(peak, velocity),
            Arc::new(clock.clone()),
        )
        .unwrap();
        (limiter, clock)
    }

    #[test]
    fn test_rejects_invalid_config() {
        for config in [
            LeakyBucketConfig::new(0, 1),
            LeakyBucketConfig::new(1, 0),
            LeakyBucketConfig {
                peak: 1,
                velocity: 1,
                period: Duration::ZERO,
            },
        ] {
            let result = LeakyBucketLimiter::new(config);
            assert!(matches!(result, Err(RatekeeperError::Config(_))));
        }
    }

    #[test]
    fn test_peak_then_drain() {
        let (limiter, clock) = bucket(5, 1);

        for i in 0..5 {
            assert!(limiter.try_acquire(), "Request {} should be admitted", i);
        }
        assert!(!limiter.try_acquire());

        clock.advance(Duration::from_secs(3));
        for i in 0..3 {
            assert!(limiter.try_acquire(), "Request {} after drain should be admitted", i);
        }
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_partial_period_progress_is_kept() {
        let (limiter, clock) = bucket(2, 1);
        assert!(limiter.try_acquire_n(2));

        // 1.5s drains one unit and leaves half a period banked.
        clock.advance(Duration::from_millis(1500));
        assert_eq!(limiter.level(), 1);

        // Another half second completes the second period.
        clock.advance(Duration::from_millis(500));
        assert_eq!(limiter.level(), 0);
    }

    #[test]
    fn test_level_floors_at_zero() {
        let (limiter, clock) = bucket(3, 2);
        assert!(limiter.try_acquire());

        clock.advance(Duration::from_secs(100));
        assert_eq!(limiter.level(), 0);
        assert!(limiter.try_acquire_n(3));
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_oversized_request_is_refused() {
        let (limiter, _clock) = bucket(3, 1);
        assert!(!limiter.try_acquire_n(4));
        assert_eq!(limiter.level(), 0);
    }

    #[test]
    fn test_limit_and_burst() {
        let (limiter, _clock) = bucket(5, 2);
        assert_eq!(limiter.limit(), Rate::per_second(2.0));
        assert_eq!(limiter.burst(), 5);
    }

    #[test]
    fn test_concurrent_callers_admit_exactly_peak() {
        let (limiter, _clock) = bucket(40, 1);
        let admitted = std::sync::atomic::AtomicU64::new(0);

        std::thread::scope(|s| {
            for _ in 0..10 {
                s.spawn(|| {
                    for _ in 0..10 {
                        if limiter.try_acquire() {
                            admitted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.into_inner(), 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_drained() {
        let limiter = LeakyBucketLimiter::new(LeakyBucketConfig::new(2, 1)).unwrap();
        let ctx = WaitContext::background();

        limiter.wait_n(&ctx, 2).await.unwrap();
        let started = tokio::time::Instant::now();
        limiter.wait(&ctx).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(limiter.level(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_unsatisfiable() {
        let limiter = LeakyBucketLimiter::new(LeakyBucketConfig::new(2, 1)).unwrap();
        let result = limiter.wait_n(&WaitContext::background(), 3).await;
        assert!(matches!(result, Err(RatekeeperError::Unsatisfiable { .. })));
    }
}
