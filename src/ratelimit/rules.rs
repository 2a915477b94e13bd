//! Declarative limiter descriptions.
//!
//! This module handles loading limiter trees from YAML and building them into
//! live limiters. Durations are given as integer milliseconds, and composites
//! nest through the `multi` kind.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::context::WaitContext;
use super::fixed_window::{FixedWindowConfig, FixedWindowLimiter};
use super::leaky_bucket::{LeakyBucketConfig, LeakyBucketLimiter};
use super::limiter::{Rate, RateLimiter};
use super::multi::MultiLimiter;
use super::sliding_log::{SlidingLogLimiter, SlidingLogStrategy};
use super::sliding_window::{SlidingWindowConfig, SlidingWindowLimiter};
use super::throttle::{Throttle, ThrottleConfig};
use super::token_bucket::{TokenBucketConfig, TokenBucketLimiter};
use crate::error::{RatekeeperError, Result};

/// Description of a limiter, possibly composite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LimiterSpec {
    /// Token bucket refilled lazily: `events` tokens every `per_ms`
    TokenBucket {
        burst: u64,
        events: u64,
        #[serde(default = "default_per_ms")]
        per_ms: u64,
    },
    /// Token bucket refilled by a background ticker
    Throttle {
        max: u64,
        refill: u64,
        interval_ms: u64,
    },
    /// Leaky bucket draining `velocity` units every `period_ms`
    LeakyBucket {
        peak: u64,
        velocity: u64,
        #[serde(default = "default_per_ms")]
        period_ms: u64,
    },
    /// Fixed window counter
    FixedWindow { limit: u64, window_ms: u64 },
    /// Sliding window over sub-window counters
    SlidingWindow {
        limit: u64,
        window_ms: u64,
        sub_window_ms: u64,
    },
    /// Multi-tier sliding window
    SlidingLog {
        sub_window_ms: u64,
        strategies: Vec<StrategySpec>,
    },
    /// All members must admit
    Multi { members: Vec<LimiterSpec> },
}

/// One tier of a `sliding_log` description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategySpec {
    pub limit: u64,
    pub window_ms: u64,
}

fn default_per_ms() -> u64 {
    1000
}

impl LimiterSpec {
    /// Load a description from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter description");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a description from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            RatekeeperError::Config(format!("Failed to parse limiter description: {}", e))
        })
    }

    /// Build the described limiter.
    ///
    /// Throttles spawn their refill ticker under `owner`; every other kind
    /// ignores it.
    pub fn build(&self, owner: &WaitContext) -> Result<Arc<dyn RateLimiter>> {
        let limiter: Arc<dyn RateLimiter> = match self {
            LimiterSpec::TokenBucket {
                burst,
                events,
                per_ms,
            } => Arc::new(TokenBucketLimiter::new(TokenBucketConfig {
                burst: *burst,
                rate: Rate::per(*events, millis(*per_ms)),
            })?),
            LimiterSpec::Throttle {
                max,
                refill,
                interval_ms,
            } => Arc::new(Throttle::new(
                ThrottleConfig {
                    max: *max,
                    refill: *refill,
                    interval: millis(*interval_ms),
                },
                owner.clone(),
            )?),
            LimiterSpec::LeakyBucket {
                peak,
                velocity,
                period_ms,
            } => Arc::new(LeakyBucketLimiter::new(LeakyBucketConfig {
                peak: *peak,
                velocity: *velocity,
                period: millis(*period_ms),
            })?),
            LimiterSpec::FixedWindow { limit, window_ms } => {
                Arc::new(FixedWindowLimiter::new(FixedWindowConfig {
                    limit: *limit,
                    window: millis(*window_ms),
                })?)
            }
            LimiterSpec::SlidingWindow {
                limit,
                window_ms,
                sub_window_ms,
            } => Arc::new(SlidingWindowLimiter::new(SlidingWindowConfig {
                limit: *limit,
                window: millis(*window_ms),
                sub_window: millis(*sub_window_ms),
            })?),
            LimiterSpec::SlidingLog {
                sub_window_ms,
                strategies,
            } => Arc::new(SlidingLogLimiter::new(
                millis(*sub_window_ms),
                strategies
                    .iter()
                    .map(|s| SlidingLogStrategy::new(s.limit, millis(s.window_ms)))
                    .collect(),
            )?),
            LimiterSpec::Multi { members } => {
                let members = members
                    .iter()
                    .map(|member| member.build(owner))
                    .collect::<Result<Vec<_>>>()?;
                Arc::new(MultiLimiter::new(members)?)
            }
        };
        Ok(limiter)
    }
}

fn millis(ms: u64) -> Duration {
    Duration::from_millis(ms)
}
