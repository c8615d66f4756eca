//! Error types for the memory cache
//!
//! Provides unified error handling using thiserror.

use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the memory cache.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// An argument or option was outside its accepted range
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The cache was disposed before the operation was attempted
    #[error("Cache has been disposed")]
    ObjectDisposed,

    /// A value reached a code path that does not know how to handle it
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The background runtime could not be started
    #[error("Executor error: {0}")]
    Executor(String),
}

impl CacheError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        CacheError::InvalidArgument(message.into())
    }
}

// == Result Type Alias ==
/// Convenience Result type for the memory cache.
pub type Result<T> = std::result::Result<T, CacheError>;
