//! Fixed window counter.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::clock::{default_clock, Clock};
use super::context::WaitContext;
use super::limiter::{wait_for_admission, Admission, Rate, RateLimiter};
use crate::error::{RatekeeperError, Result};

/// Configuration for a [`FixedWindowLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedWindowConfig {
    /// Events admitted per window
    pub limit: u64,
    /// Window length
    pub window: Duration,
}

#[derive(Debug)]
struct WindowState {
    count: u64,
    window_start: Duration,
}

/// A counter that admits up to `limit` events per window and starts a new
/// window on the first call made more than `window` after the current one
/// began.
///
/// Windows are not aligned to a grid: each one starts at the call that
/// reset it. Up to `2 × limit` events can pass in less than one window when
/// a burst at the end of one window is followed by a burst right after the
/// reset.
pub struct FixedWindowLimiter {
    config: FixedWindowConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<WindowState>,
}

impl FixedWindowLimiter {
    /// Create a limiter on the system clock.
    pub fn new(config: FixedWindowConfig) -> Result<Self> {
        Self::with_clock(config, default_clock())
    }

    /// Create a limiter on the given clock.
    pub fn with_clock(config: FixedWindowConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.window.is_zero() {
            return Err(RatekeeperError::Config(
                "fixed window length must be greater than zero".to_string(),
            ));
        }

        debug!(limit = config.limit, window = ?config.window, "Creating fixed window limiter");

        let now = clock.now();
        Ok(Self {
            config,
            clock,
            state: Mutex::new(WindowState {
                count: 0,
                window_start: now,
            }),
        })
    }

    /// Events counted in the current window.
    pub fn current_count(&self) -> u64 {
        let mut state = self.state.lock();
        self.maybe_reset_window(&mut state, self.clock.now());
        state.count
    }

    /// Events still admissible in the current window.
    pub fn remaining(&self) -> u64 {
        self.config.limit.saturating_sub(self.current_count())
    }

    /// The window length.
    pub fn window(&self) -> Duration {
        self.config.window
    }

    /// Time until the current window can be reset.
    pub fn duration_until_reset(&self) -> Duration {
        let state = self.state.lock();
        let elapsed = self.clock.now().saturating_sub(state.window_start);
        self.config.window.saturating_sub(elapsed)
    }

    fn maybe_reset_window(&self, state: &mut WindowState, now: Duration) {
        if now.saturating_sub(state.window_start) > self.config.window {
            trace!(previous_count = state.count, "Starting new fixed window");
            state.count = 0;
            state.window_start = now;
        }
    }

    fn attempt(&self, n: u64) -> Admission {
        let now = self.clock.now();
        let mut state = self.state.lock();
        self.maybe_reset_window(&mut state, now);

        if state.count + n <= self.config.limit {
            state.count += n;
            trace!(n = n, count = state.count, "Fixed window admitted");
            return Admission::Granted;
        }

        // The reset needs strictly more than a full window to have passed.
        let reset_at = state.window_start + self.config.window + Duration::from_nanos(1);
        Admission::RetryAfter(reset_at.saturating_sub(now))
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    fn try_acquire_n(&self, n: u64) -> bool {
        if n == 0 {
            return true;
        }
        if n > self.config.limit {
            return false;
        }
        matches!(self.attempt(n), Admission::Granted)
    }

    async fn wait_n(&self, ctx: &WaitContext, n: u64) -> Result<()> {
        wait_for_admission(ctx, n, self.config.limit, || self.attempt(n)).await
    }

    fn limit(&self) -> Rate {
        Rate::per(self.config.limit, self.config.window)
    }

    fn burst(&self) -> u64 {
        self.config.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    fn window(limit: u64, window: Duration) -> (FixedWindowLimiter, ManualClock) {
        let clock = ManualClock::new();
        let limiter = FixedWindowLimiter::with_clock(
            FixedWindowConfig { limit, window },
            Arc::new(clock.clone()),
        )
        .unwrap();
        (limiter, clock)
    }

    #[test]
    fn test_rejects_zero_window() {
        let result = FixedWindowLimiter::new(FixedWindowConfig {
            limit: 1,
            window: Duration::ZERO,
        });
        assert!(matches!(result, Err(RatekeeperError::Config(_))));
    }

    #[test]
    fn test_increment_within_limit() {
        let (limiter, _clock) = window(10, Duration::from_secs(1));

        assert!(limiter.try_acquire());
        assert_eq!(limiter.current_count(), 1);
        assert_eq!(limiter.remaining(), 9);
    }

    #[test]
    fn test_increment_exceeds_limit() {
        let (limiter, _clock) = window(5, Duration::from_secs(1));

        for _ in 0..5 {
            assert!(limiter.try_acquire());
        }

        // The 6th request should be rejected
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.current_count(), 5);
    }

    #[test]
    fn test_multi_unit_acquire() {
        let (limiter, _clock) = window(10, Duration::from_secs(1));

        assert!(limiter.try_acquire_n(8));
        assert!(!limiter.try_acquire_n(3));
        assert!(limiter.try_acquire_n(2));
        assert_eq!(limiter.remaining(), 0);
    }

    #[test]
    fn test_window_resets_only_after_full_window() {
        let (limiter, clock) = window(1, Duration::from_secs(1));
        assert!(limiter.try_acquire());

        clock.advance(Duration::from_secs(1));
        assert!(!limiter.try_acquire(), "exactly one window is not enough");

        clock.advance(Duration::from_millis(1));
        assert!(limiter.try_acquire());
    }

    #[test]
    fn test_boundary_burst_admits_twice_the_limit() {
        let (limiter, clock) = window(3, Duration::from_secs(1));

        // Burst at the tail end of the first window.
        clock.set(Duration::from_millis(950));
        for i in 0..3 {
            assert!(limiter.try_acquire(), "Tail request {} should be admitted", i);
        }
        assert!(!limiter.try_acquire());

        // And again right after the reset, 100ms later.
        clock.set(Duration::from_millis(1050));
        for i in 0..3 {
            assert!(limiter.try_acquire(), "Head request {} should be admitted", i);
        }
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_zero_limit_admits_nothing() {
        let (limiter, clock) = window(0, Duration::from_secs(1));
        assert!(!limiter.try_acquire());
        clock.advance(Duration::from_secs(5));
        assert!(!limiter.try_acquire());
        assert!(limiter.try_acquire_n(0));
    }

    #[test]
    fn test_duration_until_reset() {
        let (limiter, clock) = window(1, Duration::from_secs(10));
        clock.advance(Duration::from_secs(4));
        assert_eq!(limiter.duration_until_reset(), Duration::from_secs(6));
    }

    #[test]
    fn test_concurrent_callers_admit_exactly_limit() {
        let (limiter, _clock) = window(30, Duration::from_secs(60));
        let admitted = std::sync::atomic::AtomicU64::new(0);

        std::thread::scope(|s| {
            for _ in 0..6 {
                s.spawn(|| {
                    for _ in 0..25 {
                        if limiter.try_acquire() {
                            admitted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.into_inner(), 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_next_window() {
        let limiter = FixedWindowLimiter::new(FixedWindowConfig {
            limit: 2,
            window: Duration::from_secs(1),
        })
        .unwrap();
        let ctx = WaitContext::background();

        limiter.wait_n(&ctx, 2).await.unwrap();
        let started = tokio::time::Instant::now();
        limiter.wait(&ctx).await.unwrap();

        assert!(started.elapsed() > Duration::from_secs(1));
        assert_eq!(limiter.current_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_with_zero_limit_is_unsatisfiable() {
        let limiter = FixedWindowLimiter::new(FixedWindowConfig {
            limit: 0,
            window: Duration::from_secs(1),
        })
        .unwrap();

        let result = limiter.wait(&WaitContext::background()).await;
        assert!(matches!(
            result,
            Err(RatekeeperError::Unsatisfiable { requested: 1, burst: 0 })
        ));
    }
}
