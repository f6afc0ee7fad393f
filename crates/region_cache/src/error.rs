// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error types for region cache operations.

use std::borrow::Cow;
use std::time::Duration;

use thiserror::Error;

/// Any error surfaced by a region strategy, the backing store or the region facade.
///
/// A generation that changed underneath an operation is not an error: strategies resolve
/// it internally by retrying reads and abandoning writes.
///
/// # Thread safety
///
/// This type is thread-safe.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// An argument was rejected before any store call was made.
    ///
    /// Such errors are never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(Cow<'static, str>),

    /// The region configuration cannot be used to build the requested strategy.
    #[error("invalid configuration: {0}")]
    Configuration(Cow<'static, str>),

    /// A lock could not be acquired before the retry budget ran out.
    #[error("failed to lock {keys} key(s) after {attempts} attempt(s) in {elapsed:?}")]
    LockAcquisition {
        /// Number of keys the caller tried to lock together.
        keys: usize,
        /// Number of attempts that were made.
        attempts: u32,
        /// Time spent trying.
        elapsed: Duration,
    },

    /// The strategy structurally cannot perform the operation.
    #[error("the {strategy} strategy does not support {operation}")]
    Unsupported {
        /// Name of the strategy that rejected the call.
        strategy: &'static str,
        /// Name of the rejected operation.
        operation: &'static str,
    },

    /// The backing store failed to execute a command.
    #[error("backing store failure: {0}")]
    Store(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A value could not be encoded or decoded.
    #[error("serialization failure: {0}")]
    Serialization(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Creates an [`Error::InvalidArgument`].
    pub fn invalid_argument(message: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Creates an [`Error::Configuration`].
    pub fn configuration(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Configuration(message.into())
    }

    /// Wraps a backing-store failure.
    pub fn store(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Store(error.into())
    }

    /// Wraps a codec failure.
    pub fn serialization(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Serialization(error.into())
    }

    /// Returns `true` for [`Error::LockAcquisition`].
    #[must_use]
    pub fn is_lock_acquisition(&self) -> bool {
        matches!(self, Self::LockAcquisition { .. })
    }
}

/// A specialized [`Result`](std::result::Result) for region cache operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    #[test]
    fn thread_safe_type() {
        assert_impl_all!(Error: Send, Sync);
    }

    #[test]
    fn lock_acquisition_reports_diagnostics() {
        let error = Error::LockAcquisition {
            keys: 2,
            attempts: 4,
            elapsed: Duration::from_millis(250),
        };

        let message = error.to_string();
        assert!(message.contains("2 key(s)"), "{message}");
        assert!(message.contains("4 attempt(s)"), "{message}");
        assert!(error.is_lock_acquisition());
    }

    #[test]
    fn store_error_keeps_source() {
        let error = Error::store("connection reset");

        let source = std::error::Error::source(&error).expect("source should be kept");
        assert_eq!(source.to_string(), "connection reset");
    }

    #[test]
    fn unsupported_names_strategy_and_operation() {
        let error = Error::Unsupported {
            strategy: "fast",
            operation: "clear",
        };

        assert_eq!(error.to_string(), "the fast strategy does not support clear");
    }
}
