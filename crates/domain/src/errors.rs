//! Error types used throughout the library

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures raised by the caching layer itself
///
/// Never produced by a wrapped computation; those surface unchanged as
/// [`CallError::Computation`].
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum CacheError {
    /// Arguments could not be turned into a fingerprint
    #[error("Unfingerprintable arguments: {0}")]
    Unfingerprintable(String),

    /// A custom key function produced nothing usable
    #[error("Invalid cache key: {0}")]
    InvalidCacheKey(String),

    /// Options, settings or backend wiring are invalid
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The networked backend failed or is unreachable
    #[error("Backend error: {0}")]
    Backend(String),

    /// A value could not be encoded or decoded for the backend
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CacheError {
    /// Conflicting key-function and ignore-field options
    pub fn configuration_conflict() -> Self {
        Self::Configuration(
            "a custom key function and ignore_fields cannot be combined".to_string(),
        )
    }

    /// `true` for backend failures
    pub fn is_backend(&self) -> bool {
        matches!(self, Self::Backend(_))
    }

    /// `true` for invalid options or wiring
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

/// Result type alias for cache operations
pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Outcome of a memoized call that did not produce a value
///
/// `E` is the wrapped computation's own error type, passed through
/// untouched.
#[derive(Error, Debug)]
pub enum CallError<E> {
    /// The caching layer failed before or after computing
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The wrapped computation returned an error; nothing was cached
    #[error("Computation failed: {0}")]
    Computation(E),
}

impl<E> CallError<E> {
    /// `true` when the wrapped computation failed
    pub fn is_computation(&self) -> bool {
        matches!(self, Self::Computation(_))
    }

    /// The computation's error, if that is what failed
    pub fn into_computation(self) -> Option<E> {
        match self {
            Self::Computation(err) => Some(err),
            Self::Cache(_) => None,
        }
    }

    /// The cache error, if the caching layer failed
    pub fn cache_error(&self) -> Option<&CacheError> {
        match self {
            Self::Cache(err) => Some(err),
            Self::Computation(_) => None,
        }
    }
}

impl<E: Display> CallError<E> {
    /// Flatten into a string for logging
    pub fn describe(&self) -> String {
        self.to_string()
    }
}
