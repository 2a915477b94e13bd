//! Error types for Ratekeeper.

use std::time::Duration;
use thiserror::Error;

/// Main error type for Ratekeeper operations.
#[derive(Error, Debug)]
pub enum RatekeeperError {
    /// Invalid limiter or application configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A specific (limit, window) constraint was violated
    #[error("Quota exceeded: limit = {limit} within window = {window:?}")]
    QuotaExceeded { limit: u64, window: Duration },

    /// The caller's context was cancelled while waiting
    #[error("Wait canceled")]
    Canceled,

    /// The caller's deadline passed, or cannot be met by the required wait
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// The request can never be admitted because it exceeds the maximum burst
    #[error("Requested {requested} exceeds maximum burst of {burst}")]
    Unsatisfiable { requested: u64, burst: u64 },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Ratekeeper operations.
pub type Result<T> = std::result::Result<T, RatekeeperError>;
