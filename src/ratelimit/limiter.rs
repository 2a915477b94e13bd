//! The rate limiter capability shared by every algorithm.

use async_trait::async_trait;
use std::cmp::Ordering;
use std::fmt;
use std::time::Duration;
use tracing::trace;

use super::context::WaitContext;
use crate::error::{RatekeeperError, Result};

/// Shortest pause between two admission attempts of a waiting caller.
pub(crate) const MIN_RETRY_DELAY: Duration = Duration::from_millis(1);

/// A maximum sustained event frequency, in events per second.
///
/// Rates are totally ordered so limiters can be ranked by restrictiveness:
/// a smaller rate is more restrictive.
#[derive(Debug, Clone, Copy)]
pub struct Rate(f64);

impl Rate {
    /// No limit at all.
    pub const INF: Rate = Rate(f64::INFINITY);

    /// `events` per second.
    pub fn per_second(events: f64) -> Self {
        Rate(events)
    }

    /// `events` spread over `duration`.
    pub fn per(events: u64, duration: Duration) -> Self {
        if duration.is_zero() {
            return Self::INF;
        }
        Rate(events as f64 / duration.as_secs_f64())
    }

    /// One event every `interval`.
    pub fn every(interval: Duration) -> Self {
        Self::per(1, interval)
    }

    /// Events per second as a float.
    pub fn events_per_second(&self) -> f64 {
        self.0
    }

    /// Whether the rate is unbounded.
    pub fn is_infinite(&self) -> bool {
        self.0.is_infinite()
    }
}

impl PartialEq for Rate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Rate {}

impl PartialOrd for Rate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Rate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/s", self.0)
    }
}

/// Admission control for a stream of concurrent callers.
///
/// Implemented by every single-algorithm limiter and by [`MultiLimiter`],
/// which lets composites nest through `Arc<dyn RateLimiter>`.
///
/// [`MultiLimiter`]: super::MultiLimiter
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Try to take `n` units of quota without blocking.
    ///
    /// Either all `n` units are taken or none are.
    fn try_acquire_n(&self, n: u64) -> bool;

    /// Try to take a single unit of quota without blocking.
    fn try_acquire(&self) -> bool {
        self.try_acquire_n(1)
    }

    /// Block until `n` units of quota are taken or `ctx` is done.
    async fn wait_n(&self, ctx: &WaitContext, n: u64) -> Result<()>;

    /// Block until a single unit of quota is taken or `ctx` is done.
    async fn wait(&self, ctx: &WaitContext) -> Result<()> {
        self.wait_n(ctx, 1).await
    }

    /// The maximum sustained rate this limiter allows.
    fn limit(&self) -> Rate;

    /// The largest amount that can ever be admitted at once.
    fn burst(&self) -> u64;
}

/// Outcome of one admission attempt made on behalf of a waiting caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Quota was taken.
    Granted,
    /// Nothing was taken; quota may be available after this long.
    RetryAfter(Duration),
}

/// Shared wait loop for limiters that can tell how long a refused caller
/// should sleep before trying again.
///
/// `attempt` runs under the limiter's lock and must either take the quota or
/// leave the state untouched. The loop never sleeps less than
/// [`MIN_RETRY_DELAY`] and gives up early when the deadline is out of reach.
pub(crate) async fn wait_for_admission<F>(
    ctx: &WaitContext,
    n: u64,
    burst: u64,
    mut attempt: F,
) -> Result<()>
where
    F: FnMut() -> Admission + Send,
{
    if n > burst {
        return Err(RatekeeperError::Unsatisfiable { requested: n, burst });
    }

    loop {
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let delay = match attempt() {
            Admission::Granted => return Ok(()),
            Admission::RetryAfter(delay) => delay.max(MIN_RETRY_DELAY),
        };

        ctx.ensure_reachable(delay)?;
        trace!(n = n, delay = ?delay, "Waiting for quota");
        ctx.sleep(delay).await?;
    }
}
