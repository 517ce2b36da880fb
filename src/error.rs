//! Error types for Windmill.

use thiserror::Error;

use crate::context::ContextError;

/// Main error type for Windmill operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WindmillError {
    /// The event limit must be at least one
    #[error("Invalid limit: max events must be greater than zero")]
    InvalidLimit,

    /// The window interval must be long enough to split into segments
    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    /// A sliding window needs at least two segments
    #[error("Invalid segments: need at least 2 segments, got {0}")]
    InvalidSegments(usize),

    /// The limiter has no capacity left in the current window
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// The caller used the API in a way that can never succeed
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    /// The caller's context was cancelled or reached its deadline
    #[error(transparent)]
    Context(#[from] ContextError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(String),
}

impl WindmillError {
    /// Whether this error only means "try again later".
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, WindmillError::RateLimitExceeded)
    }
}

impl From<std::io::Error> for WindmillError {
    fn from(err: std::io::Error) -> Self {
        WindmillError::Io(err.to_string())
    }
}

/// Result type alias for Windmill operations.
pub type Result<T> = std::result::Result<T, WindmillError>;
