//! Token bucket refilled by a background ticker.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, trace, warn};

use super::context::WaitContext;
use super::limiter::{Rate, RateLimiter};
use crate::error::{RatekeeperError, Result};

/// Configuration for a [`Throttle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleConfig {
    /// Bucket depth; also the initial token count
    pub max: u64,
    /// Tokens added on every tick
    pub refill: u64,
    /// Time between ticks
    pub interval: Duration,
}

/// State shared with the ticker task.
struct ThrottleState {
    max: u64,
    refill: u64,
    tokens: Mutex<u64>,
    refilled: Notify,
}

impl ThrottleState {
    /// Take `n` tokens, or report how many are available.
    fn take(&self, n: u64) -> std::result::Result<(), u64> {
        let mut tokens = self.tokens.lock();
        if *tokens < n {
            return Err(*tokens);
        }
        *tokens -= n;
        trace!(n = n, remaining = *tokens, "Throttle admitted");
        Ok(())
    }

    fn tick(&self) {
        {
            let mut tokens = self.tokens.lock();
            *tokens = tokens.saturating_add(self.refill).min(self.max);
        }
        self.refilled.notify_waiters();
    }
}

/// A token bucket whose tokens are added by a timer rather than by callers.
///
/// Every `interval` a background task adds `refill` tokens, capped at `max`.
/// The task is spawned on the first admission call, exactly once even when
/// many callers race on that first call, and runs until the owner context
/// handed to [`Throttle::new`] is done or the throttle is dropped.
///
/// The ticker is spawned on the ambient tokio runtime. Calls made outside a
/// runtime still consume tokens, but nothing refills them until a call is
/// made from inside one.
pub struct Throttle {
    config: ThrottleConfig,
    state: Arc<ThrottleState>,
    owner: WaitContext,
    started: AtomicBool,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl Throttle {
    /// Create a full throttle whose ticker lives as long as `owner`.
    pub fn new(config: ThrottleConfig, owner: WaitContext) -> Result<Self> {
        if config.max == 0 {
            return Err(RatekeeperError::Config(
                "throttle max must be greater than zero".to_string(),
            ));
        }
        if config.refill == 0 {
            return Err(RatekeeperError::Config(
                "throttle refill must be greater than zero".to_string(),
            ));
        }
        if config.interval.is_zero() {
            return Err(RatekeeperError::Config(
                "throttle interval must be greater than zero".to_string(),
            ));
        }

        debug!(
            max = config.max,
            refill = config.refill,
            interval = ?config.interval,
            "Creating throttle"
        );

        Ok(Self {
            config,
            state: Arc::new(ThrottleState {
                max: config.max,
                refill: config.refill,
                tokens: Mutex::new(config.max),
                refilled: Notify::new(),
            }),
            owner,
            started: AtomicBool::new(false),
            ticker: Mutex::new(None),
        })
    }

    /// Tokens currently in the bucket.
    pub fn tokens(&self) -> u64 {
        *self.state.tokens.lock()
    }

    /// Whether the refill ticker has been started and is still running.
    pub fn is_refilling(&self) -> bool {
        self.ticker
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Run `effector` if a token is available.
    ///
    /// Fails with [`RatekeeperError::QuotaExceeded`] when the bucket is empty
    /// and with the context's error when `ctx` is already done; the effector
    /// is not run in either case.
    pub async fn call<F, Fut, T>(&self, ctx: &WaitContext, effector: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        if !self.try_acquire() {
            return Err(RatekeeperError::QuotaExceeded {
                limit: self.config.max,
                window: self.config.interval,
            });
        }
        Ok(effector().await)
    }

    /// Spawn the refill ticker unless it is already running.
    fn ensure_started(&self) {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let handle = runtime.spawn(run_ticker(
                    Arc::downgrade(&self.state),
                    self.owner.clone(),
                    self.config.interval,
                ));
                *self.ticker.lock() = Some(handle);
                debug!(interval = ?self.config.interval, "Started throttle refill ticker");
            }
            Err(_) => {
                self.started.store(false, Ordering::Release);
                warn!("No tokio runtime available, throttle refill ticker not started");
            }
        }
    }

    /// Lower bound on the time until `n` tokens can be available.
    fn min_wait(&self, n: u64, available: u64) -> Duration {
        let ticks = (n - available).div_ceil(self.config.refill);
        let whole_intervals = u32::try_from(ticks.saturating_sub(1)).unwrap_or(u32::MAX);
        self.config.interval.saturating_mul(whole_intervals)
    }
}

impl Drop for Throttle {
    fn drop(&mut self) {
        if let Some(handle) = self.ticker.get_mut().take() {
            handle.abort();
        }
    }
}

async fn run_ticker(state: Weak<ThrottleState>, owner: WaitContext, interval: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let done = owner.done();
    tokio::pin!(done);

    loop {
        tokio::select! {
            _ = &mut done => {
                debug!("Owner context done, stopping throttle refill ticker");
                return;
            }
            _ = ticker.tick() => {
                let Some(state) = state.upgrade() else {
                    return;
                };
                state.tick();
            }
        }
    }
}

#[async_trait]
impl RateLimiter for Throttle {
    fn try_acquire_n(&self, n: u64) -> bool {
        if n == 0 {
            return true;
        }
        self.ensure_started();
        self.state.take(n).is_ok()
    }

    async fn wait_n(&self, ctx: &WaitContext, n: u64) -> Result<()> {
        if n > self.config.max {
            return Err(RatekeeperError::Unsatisfiable {
                requested: n,
                burst: self.config.max,
            });
        }
        self.ensure_started();

        loop {
            if let Some(err) = ctx.err() {
                return Err(err);
            }

            // Register for the next refill before looking at the tokens so a
            // tick landing in between is not missed.
            let refilled = self.state.refilled.notified();
            tokio::pin!(refilled);
            refilled.as_mut().enable();

            let available = match self.state.take(n) {
                Ok(()) => return Ok(()),
                Err(available) => available,
            };

            // Nothing will refill the bucket once the owner is done.
            if let Some(err) = self.owner.err() {
                debug!("Throttle owner context is done, refusing to wait");
                return Err(err);
            }
            ctx.ensure_reachable(self.min_wait(n, available))?;

            tokio::select! {
                _ = &mut refilled => {}
                err = ctx.done() => return Err(err),
                err = self.owner.done() => return Err(err),
            }
        }
    }

    fn limit(&self) -> Rate {
        Rate::per(self.config.refill, self.config.interval)
    }

    fn burst(&self) -> u64 {
        self.config.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttle(max: u64, refill: u64, interval: Duration) -> Throttle {
        Throttle::new(
            ThrottleConfig {
                max,
                refill,
                interval,
            },
            WaitContext::background(),
        )
        .unwrap()
    }

    #[test]
    fn test_rejects_invalid_config() {
        let configs = [
            ThrottleConfig { max: 0, refill: 1, interval: Duration::from_secs(1) },
            ThrottleConfig { max: 1, refill: 0, interval: Duration::from_secs(1) },
            ThrottleConfig { max: 1, refill: 1, interval: Duration::ZERO },
        ];
        for config in configs {
            let result = Throttle::new(config, WaitContext::background());
            assert!(matches!(result, Err(RatekeeperError::Config(_))), "{:?}", config);
        }
    }

    #[test]
    fn test_limit_is_refill_per_interval() {
        let limiter = throttle(10, 2, Duration::from_secs(1));
        assert_eq!(limiter.limit(), Rate::per_second(2.0));
        assert_eq!(limiter.burst(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_calls_per_interval() {
        let limiter = throttle(10, 10, Duration::from_secs(1));

        let admitted = (0..100).filter(|_| limiter.try_acquire()).count();
        assert_eq!(admitted, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_on_tick() {
        let limiter = throttle(1, 1, Duration::from_secs(1));

        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert!(limiter.is_refilling());

        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert!(limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_variable_refill_is_capped() {
        let limiter = throttle(4, 2, Duration::from_millis(500));

        assert!(limiter.try_acquire_n(4));
        assert!(!limiter.try_acquire());

        tokio::time::sleep(Duration::from_millis(501)).await;
        let admitted = (0..3).filter(|_| limiter.try_acquire()).count();
        assert_eq!(admitted, 2);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(limiter.tokens(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticker_starts_exactly_once() {
        let limiter = throttle(10, 1, Duration::from_secs(1));
        let runtime = tokio::runtime::Handle::current();

        // The current-thread runtime cannot run any task while the scope
        // blocks it, so every thread races on the first-call start.
        let admitted = std::sync::atomic::AtomicU64::new(0);
        std::thread::scope(|s| {
            for _ in 0..32 {
                s.spawn(|| {
                    let _guard = runtime.enter();
                    if limiter.try_acquire() {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                });
            }
        });
        assert_eq!(admitted.into_inner(), 10);
        assert_eq!(limiter.tokens(), 0);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(limiter.tokens(), 1, "a second ticker would have added twice");
    }

    #[tokio::test(start_paused = true)]
    async fn test_owner_cancel_stops_ticker() {
        let (owner, cancel) = WaitContext::with_cancel();
        let limiter = Throttle::new(
            ThrottleConfig {
                max: 2,
                refill: 1,
                interval: Duration::from_secs(1),
            },
            owner,
        )
        .unwrap();

        assert!(limiter.try_acquire_n(2));
        cancel.cancel();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(limiter.tokens(), 0);
        assert!(!limiter.is_refilling());

        let result = limiter.wait(&WaitContext::background()).await;
        assert!(matches!(result, Err(RatekeeperError::Canceled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_next_tick() {
        let limiter = throttle(1, 1, Duration::from_secs(1));
        let ctx = WaitContext::background();

        limiter.wait(&ctx).await.unwrap();
        let started = Instant::now();
        limiter.wait(&ctx).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(999));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_deadline() {
        let limiter = throttle(2, 1, Duration::from_secs(1));
        assert!(limiter.try_acquire_n(2));

        // Two ticks are needed, which can't happen within half a second.
        let ctx = WaitContext::background().with_timeout(Duration::from_millis(500));
        let started = Instant::now();
        let result = limiter.wait_n(&ctx, 2).await;
        assert!(matches!(result, Err(RatekeeperError::DeadlineExceeded)));
        assert_eq!(started.elapsed(), Duration::ZERO);

        // One tick might arrive in time, so this wait runs into the deadline.
        let result = limiter.wait(&ctx).await;
        assert!(matches!(result, Err(RatekeeperError::DeadlineExceeded)));
        assert_eq!(limiter.tokens(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_cancelled() {
        let limiter = throttle(1, 1, Duration::from_secs(3600));
        assert!(limiter.try_acquire());

        let (ctx, cancel) = WaitContext::with_cancel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let result = limiter.wait(&ctx).await;
        assert!(matches!(result, Err(RatekeeperError::Canceled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_runs_effector_while_tokens_last() {
        let limiter = throttle(1, 1, Duration::from_secs(1));
        let ctx = WaitContext::background();

        let first = limiter.call(&ctx, || async { "call 1" }).await;
        assert_eq!(first.unwrap(), "call 1");

        let second = limiter.call(&ctx, || async { "call 2" }).await;
        assert!(matches!(
            second,
            Err(RatekeeperError::QuotaExceeded { limit: 1, .. })
        ));

        let (cancelled, cancel) = WaitContext::with_cancel();
        cancel.cancel();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let third = limiter.call(&cancelled, || async { "call 3" }).await;
        assert!(matches!(third, Err(RatekeeperError::Canceled)));
    }
}
