//! Error types for the cache subsystem
//!
//! Cache-layer failures (`RemoteUnavailable`, `Serialization`) are absorbed by the
//! stores and the manager and surface only as misses and error counters. The
//! source-of-truth failures (`QueryExecution`) and caller mistakes
//! (`Configuration`) are returned to the caller.

use thiserror::Error;

/// Unified error type for the cache subsystem.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The remote tier could not be reached or answered with an error
    #[error("Remote cache unavailable: {0}")]
    RemoteUnavailable(String),

    /// A remote operation did not finish within the configured timeout
    #[error("Remote cache operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: &'static str, timeout_ms: u64 },

    /// A value could not be encoded or decoded
    #[error("Serialization failed for key '{key}': {message}")]
    Serialization { key: String, message: String },

    /// A warmup loader failed after exhausting its retries
    #[error("Warmup loader '{task}' failed after {attempts} attempt(s): {message}")]
    LoaderFailure {
        task: String,
        attempts: u32,
        message: String,
    },

    /// The external query executor failed; the original error is kept intact
    #[error(transparent)]
    QueryExecution(anyhow::Error),

    /// Invalid configuration or an unknown name supplied at call time
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl CacheError {
    /// Shorthand for a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Whether the error is a transient cache-tier condition that callers absorb
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RemoteUnavailable(_) | Self::Timeout { .. })
    }
}

/// Convenience Result type for the cache subsystem.
pub type Result<T> = std::result::Result<T, CacheError>;
