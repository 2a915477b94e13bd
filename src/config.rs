//! Configuration management for Ratekeeper.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{RatekeeperError, Result};
use crate::ratelimit::LimiterSpec;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "RATEKEEPER";

/// Main configuration for the Ratekeeper demo driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatekeeperConfig {
    /// Load generator settings
    #[serde(default)]
    pub demo: DemoConfig,

    /// The limiter every worker goes through
    #[serde(default = "default_limiter")]
    pub limiter: LimiterSpec,
}

impl Default for RatekeeperConfig {
    fn default() -> Self {
        Self {
            demo: DemoConfig::default(),
            limiter: default_limiter(),
        }
    }
}

/// How workers ask for admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdmissionMode {
    /// Block until admitted
    #[default]
    Wait,
    /// Give up immediately when refused
    Try,
}

/// Load generator configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemoConfig {
    /// Number of concurrent workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Requests issued by each worker
    #[serde(default = "default_requests_per_worker")]
    pub requests_per_worker: usize,

    /// How workers ask for admission
    #[serde(default)]
    pub mode: AdmissionMode,

    /// Per-request wait timeout in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            requests_per_worker: default_requests_per_worker(),
            mode: AdmissionMode::default(),
            timeout_ms: None,
        }
    }
}

fn default_workers() -> usize {
    20
}

fn default_requests_per_worker() -> usize {
    1
}

/// Two requests per second with no burst, capped at ten per minute.
fn default_limiter() -> LimiterSpec {
    LimiterSpec::Multi {
        members: vec![
            LimiterSpec::TokenBucket {
                burst: 1,
                events: 2,
                per_ms: 1000,
            },
            LimiterSpec::TokenBucket {
                burst: 10,
                events: 10,
                per_ms: 60_000,
            },
        ],
    }
}

impl RatekeeperConfig {
    /// Load configuration from a file, with `RATEKEEPER__*` environment
    /// variables taking precedence (e.g. `RATEKEEPER__DEMO__WORKERS=8`).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(RatekeeperError::Config(format!(
                "configuration file {} not found",
                path.display()
            )));
        }

        config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| RatekeeperError::Config(e.to_string()))
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| RatekeeperError::Config(e.to_string()))
    }
}
