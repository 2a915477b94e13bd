//! Composite limiter enforcing several limiters at once.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace};

use super::context::WaitContext;
use super::limiter::{Rate, RateLimiter};
use crate::error::{RatekeeperError, Result};

/// A limiter that admits only what every member admits.
///
/// Members are sorted by [`RateLimiter::limit`] at construction so the most
/// restrictive one comes first; [`limit`](RateLimiter::limit) then simply
/// reports the first member's rate. A `MultiLimiter` is itself a
/// [`RateLimiter`], so composites nest.
///
/// Waiting is sequential: each member is waited on in order and charged for
/// the request, so the total wait is the sum of the members' waits.
///
/// `try_acquire` asks members in order and stops at the first refusal.
/// Members asked before the refusal have already been charged and are not
/// refunded.
pub struct MultiLimiter {
    limiters: Vec<Arc<dyn RateLimiter>>,
}

impl MultiLimiter {
    /// Combine `limiters`, most restrictive first.
    pub fn new(mut limiters: Vec<Arc<dyn RateLimiter>>) -> Result<Self> {
        if limiters.is_empty() {
            return Err(RatekeeperError::Config(
                "multi limiter needs at least one member".to_string(),
            ));
        }

        limiters.sort_by_key(|limiter| limiter.limit());

        debug!(
            members = limiters.len(),
            limit = %limiters[0].limit(),
            "Creating multi limiter"
        );

        Ok(Self { limiters })
    }

    /// The members, most restrictive first.
    pub fn members(&self) -> &[Arc<dyn RateLimiter>] {
        &self.limiters
    }
}

#[async_trait]
impl RateLimiter for MultiLimiter {
    fn try_acquire_n(&self, n: u64) -> bool {
        for (index, limiter) in self.limiters.iter().enumerate() {
            if !limiter.try_acquire_n(n) {
                trace!(member = index, n = n, "Multi limiter member refused");
                return false;
            }
        }
        true
    }

    async fn wait_n(&self, ctx: &WaitContext, n: u64) -> Result<()> {
        let burst = self.burst();
        if n > burst {
            return Err(RatekeeperError::Unsatisfiable { requested: n, burst });
        }

        for limiter in &self.limiters {
            limiter.wait_n(ctx, n).await?;
        }
        Ok(())
    }

    fn limit(&self) -> Rate {
        self.limiters[0].limit()
    }

    /// The smallest member burst; anything larger is refused by some member.
    fn burst(&self) -> u64 {
        self.limiters
            .iter()
            .map(|limiter| limiter.burst())
            .min()
            .unwrap_or(0)
    }
}
