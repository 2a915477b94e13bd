//! Multi-tier sliding window sharing one set of sub-window counters.
//!
//! A sliding log enforces several (limit, window) tiers at once, for example
//! "10 per second and 100 per minute". All tiers count into the same
//! sub-window map; a tier only differs in how far back it looks.

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

/// One (limit, window) tier of a [`SlidingLogLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlidingLogStrategy {
    /// Events admitted per trailing window
    pub limit: u64,
    /// Trailing window length
    pub window: Duration,
}

impl SlidingLogStrategy {
    /// Create a tier admitting `limit` events per `window`.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self { limit, window }
    }
}

/// A validated tier with its window expressed in sub-windows.
#[derive(Debug, Clone, Copy)]
struct Tier {
    limit: u64,
    window: u64,
    sub_windows: u64,
}

impl Tier {
    fn violation(&self) -> RatekeeperError {
        RatekeeperError::QuotaExceeded {
            limit: self.limit,
            window: Duration::from_nanos(self.window),
        }
    }
}

/// Result of one pass over the counters.
struct Scan {
    current: u64,
    starts: Vec<u64>,
    counts: Vec<u64>,
}

/// A sliding window limiter enforcing several tiers over one counter map.
///
/// Tiers are ordered from the widest window to the narrowest, and a wider
/// window must always carry a strictly larger limit: a narrower tier with a
/// limit at least as large as a wider one could never be the binding
/// constraint, so such a configuration is refused at construction.
pub struct SlidingLogLimiter {
    tiers: Vec<Tier>,
    sub_window: u64,
    clock: Arc<dyn Clock>,
    counters: Mutex<HashMap<u64, u64>>,
}

impl SlidingLogLimiter {
    /// Create a limiter on the system clock.
    pub fn new(sub_window: Duration, strategies: Vec<SlidingLogStrategy>) -> Result<Self> {
        Self::with_clock(sub_window, strategies, default_clock())
    }

    /// Create a limiter on the given clock.
    pub fn with_clock(
        sub_window: Duration,
        mut strategies: Vec<SlidingLogStrategy>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if strategies.is_empty() {
            return Err(RatekeeperError::Config(
                "sliding log needs at least one strategy".to_string(),
            ));
        }
        let sub_window_nanos = duration_nanos(sub_window);
        if sub_window_nanos == 0 {
            return Err(RatekeeperError::Config(
                "sliding log sub-window must be greater than zero".to_string(),
            ));
        }

        strategies.sort_by(|a, b| b.window.cmp(&a.window).then(b.limit.cmp(&a.limit)));

        let mut tiers: Vec<Tier> = Vec::with_capacity(strategies.len());
        for strategy in &strategies {
            let window = duration_nanos(strategy.window);
            if strategy.limit == 0 || window == 0 {
                return Err(RatekeeperError::Config(format!(
                    "sliding log strategy needs a positive limit and window, got limit = {} window = {:?}",
                    strategy.limit, strategy.window
                )));
            }
            if let Some(wider) = tiers.last() {
                if strategy.limit >= wider.limit {
                    return Err(RatekeeperError::Config(format!(
                        "strategy with window {:?} must have a smaller limit than {} (got {})",
                        strategy.window, wider.limit, strategy.limit
                    )));
                }
            }
            if window % sub_window_nanos != 0 {
                return Err(RatekeeperError::Config(format!(
                    "window {:?} cannot be split into whole sub-windows of {:?}",
                    strategy.window, sub_window
                )));
            }
            tiers.push(Tier {
                limit: strategy.limit,
                window,
                sub_windows: window / sub_window_nanos,
            });
        }

        debug!(
            tiers = tiers.len(),
            sub_window = ?sub_window,
            "Creating sliding log limiter"
        );

        Ok(Self {
            tiers,
            sub_window: sub_window_nanos,
            clock,
            counters: Mutex::new(HashMap::new()),
        })
    }

    /// The configured tiers, widest window first.
    pub fn strategies(&self) -> Vec<SlidingLogStrategy> {
        self.tiers
            .iter()
            .map(|tier| SlidingLogStrategy::new(tier.limit, Duration::from_nanos(tier.window)))
            .collect()
    }

    /// Number of sub-window counters currently held.
    pub fn counter_count(&self) -> usize {
        self.counters.lock().len()
    }

    /// Take a single unit of quota, naming the violated tier on refusal.
    pub fn acquire(&self) -> Result<()> {
        self.acquire_n(1)
    }

    /// Take `n` units of quota, naming the violated tier on refusal.
    ///
    /// When several tiers would be exceeded the widest one is reported; a
    /// request larger than every tier allows reports the narrowest one.
    /// Nothing is recorded on refusal.
    pub fn acquire_n(&self, n: u64) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        if n > self.burst() {
            if let Some(narrowest) = self.tiers.last() {
                debug!(n = n, limit = narrowest.limit, "Sliding log request exceeds every tier");
                return Err(narrowest.violation());
            }
        }
        let now = duration_nanos(self.clock.now());
        let mut counters = self.counters.lock();
        let scan = self.scan(&mut counters, now);

        if let Some(index) = self.violated(&scan, n) {
            debug!(
                limit = self.tiers[index].limit,
                window = ?Duration::from_nanos(self.tiers[index].window),
                "Sliding log strategy violated"
            );
            return Err(self.tiers[index].violation());
        }

        *counters.entry(scan.current).or_insert(0) += n;
        trace!(n = n, "Sliding log admitted");
        Ok(())
    }

    /// One pass over the counters: drop entries older than the widest tier
    /// and add every other entry into each tier whose window it falls in.
    fn scan(&self, counters: &mut HashMap<u64, u64>, now: u64) -> Scan {
        let current = now / self.sub_window * self.sub_window;
        let starts: Vec<u64> = self
            .tiers
            .iter()
            .map(|tier| current.saturating_sub(self.sub_window * (tier.sub_windows - 1)))
            .collect();

        let mut counts = vec![0u64; self.tiers.len()];
        counters.retain(|&key, &mut events| {
            if key < starts[0] {
                return false;
            }
            for (count, &start) in counts.iter_mut().zip(&starts) {
                if key >= start {
                    *count += events;
                }
            }
            true
        });

        Scan {
            current,
            starts,
            counts,
        }
    }

    fn violated(&self, scan: &Scan, n: u64) -> Option<usize> {
        self.tiers
            .iter()
            .zip(&scan.counts)
            .position(|(tier, &count)| count.saturating_add(n) > tier.limit)
    }

    fn attempt(&self, n: u64) -> Admission {
        let now = duration_nanos(self.clock.now());
        let mut counters = self.counters.lock();
        let scan = self.scan(&mut counters, now);

        if self.violated(&scan, n).is_none() {
            *counters.entry(scan.current).or_insert(0) += n;
            trace!(n = n, "Sliding log admitted");
            return Admission::Granted;
        }

        let mut keys: Vec<(u64, u64)> = counters.iter().map(|(&k, &v)| (k, v)).collect();
        keys.sort_unstable();

        // Every violated tier has to shed enough of its oldest sub-windows.
        let mut delay = 0;
        for (index, tier) in self.tiers.iter().enumerate() {
            let count = scan.counts[index];
            let total = count.saturating_add(n);
            if total <= tier.limit {
                continue;
            }
            let needed = total - tier.limit;
            let mut freed = 0;
            let mut expires_at = scan.current + self.sub_window;
            for &(key, events) in keys.iter().filter(|(key, _)| *key >= scan.starts[index]) {
                freed += events;
                if freed >= needed {
                    expires_at = key + tier.window;
                    break;
                }
            }
            delay = delay.max(expires_at.saturating_sub(now));
        }
        Admission::RetryAfter(Duration::from_nanos(delay))
    }
}

#[async_trait]
impl RateLimiter for SlidingLogLimiter {
    fn try_acquire_n(&self, n: u64) -> bool {
        self.acquire_n(n).is_ok()
    }

    async fn wait_n(&self, ctx: &WaitContext, n: u64) -> Result<()> {
        wait_for_admission(ctx, n, self.burst(), || self.attempt(n)).await
    }

    /// The slowest sustained rate among the tiers.
    fn limit(&self) -> Rate {
        self.tiers
            .iter()
            .map(|tier| Rate::per(tier.limit, Duration::from_nanos(tier.window)))
            .min()
            .unwrap_or(Rate::INF)
    }

    /// The narrowest tier carries the smallest limit.
    fn burst(&self) -> u64 {
        self.tiers.last().map_or(0, |tier| tier.limit)
    }
}
