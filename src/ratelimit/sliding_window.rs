//! Sliding window approximated by sub-window counters.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::clock::{default_clock, duration_nanos, Clock};
use super::context::WaitContext;
use super::limiter::{wait_for_admission, Admission, Rate, RateLimiter};
use crate::error::{RatekeeperError, Result};

/// Configuration for a [`SlidingWindowLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingWindowConfig {
    /// Events admitted per trailing window
    pub limit: u64,
    /// Trailing window length
    pub window: Duration,
    /// Counting granularity; must divide `window` evenly
    pub sub_window: Duration,
}

/// A trailing-window limiter that counts events per sub-window.
///
/// The trailing window is the current sub-window plus the preceding
/// `window / sub_window - 1` ones. Counters that fall out of it are dropped
/// during the scan each call makes, so at most `window / sub_window` entries
/// are ever kept.
pub struct SlidingWindowLimiter {
    limit: u64,
    window: u64,
    sub_window: u64,
    sub_windows: u64,
    clock: Arc<dyn Clock>,
    counters: Mutex<HashMap<u64, u64>>,
}

impl SlidingWindowLimiter {
    /// Create a limiter on the system clock.
    pub fn new(config: SlidingWindowConfig) -> Result<Self> {
        Self::with_clock(config, default_clock())
    }

    /// Create a limiter on the given clock.
    pub fn with_clock(config: SlidingWindowConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.limit == 0 {
            return Err(RatekeeperError::Config(
                "sliding window limit must be greater than zero".to_string(),
            ));
        }
        let window = duration_nanos(config.window);
        let sub_window = duration_nanos(config.sub_window);
        if window == 0 || sub_window == 0 {
            return Err(RatekeeperError::Config(
                "sliding window and sub-window must be greater than zero".to_string(),
            ));
        }
        if window % sub_window != 0 {
            return Err(RatekeeperError::Config(format!(
                "window {:?} cannot be split into whole sub-windows of {:?}",
                config.window, config.sub_window
            )));
        }

        debug!(
            limit = config.limit,
            window = ?config.window,
            sub_window = ?config.sub_window,
            "Creating sliding window limiter"
        );

        Ok(Self {
            limit: config.limit,
            window,
            sub_window,
            sub_windows: window / sub_window,
            clock,
            counters: Mutex::new(HashMap::new()),
        })
    }

    /// Number of sub-window counters currently held.
    pub fn counter_count(&self) -> usize {
        self.counters.lock().len()
    }

    /// Events counted in the trailing window.
    pub fn current_count(&self) -> u64 {
        let now = duration_nanos(self.clock.now());
        let mut counters = self.counters.lock();
        self.scan(&mut counters, now).1
    }

    /// Drop expired counters and sum the rest.
    ///
    /// Returns the current sub-window key and the trailing count.
    fn scan(&self, counters: &mut HashMap<u64, u64>, now: u64) -> (u64, u64) {
        let current = now / self.sub_window * self.sub_window;
        let start = current.saturating_sub(self.sub_window * (self.sub_windows - 1));

        let mut count = 0;
        counters.retain(|&key, &mut events| {
            if key < start {
                return false;
            }
            count += events;
            true
        });
        (current, count)
    }

    fn attempt(&self, n: u64) -> Admission {
        let now = duration_nanos(self.clock.now());
        let mut counters = self.counters.lock();
        let (current, count) = self.scan(&mut counters, now);

        if count + n <= self.limit {
            *counters.entry(current).or_insert(0) += n;
            trace!(n = n, count = count + n, "Sliding window admitted");
            return Admission::Granted;
        }

        // Expire the oldest sub-windows until enough room is freed.
        let mut keys: Vec<(u64, u64)> = counters.iter().map(|(&k, &v)| (k, v)).collect();
        keys.sort_unstable();

        let needed = count + n - self.limit;
        let mut freed = 0;
        for (key, events) in keys {
            freed += events;
            if freed >= needed {
                let expires_at = key + self.window;
                return Admission::RetryAfter(Duration::from_nanos(expires_at.saturating_sub(now)));
            }
        }
        Admission::RetryAfter(Duration::from_nanos(self.sub_window))
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    fn try_acquire_n(&self, n: u64) -> bool {
        if n == 0 {
            return true;
        }
        if n > self.limit {
            return false;
        }
        matches!(self.attempt(n), Admission::Granted)
    }

    async fn wait_n(&self, ctx: &WaitContext, n: u64) -> Result<()> {
        wait_for_admission(ctx, n, self.limit, || self.attempt(n)).await
    }

    fn limit(&self) -> Rate {
        Rate::per(self.limit, Duration::from_nanos(self.window))
    }

    fn burst(&self) -> u64 {
        self.limit
    }
}
