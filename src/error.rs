//! Error types for the pool.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Result type for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed source error from a factory callback.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by [`crate::Pool`] operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The pool has been closed; `borrow`/`add_object` reject outright.
    #[error("pool is closed")]
    Closed,

    /// Non-blocking borrow found no idle instance and the pool is at
    /// `max_total` capacity.
    #[error("pool exhausted: {active} active, max_total={max_total}")]
    Exhausted {
        /// Instances currently allocated to callers.
        active: usize,
        /// Configured capacity (`-1` encodes unlimited; never appears here).
        max_total: i64,
    },

    /// A blocking borrow waited the full `max_wait` without receiving an
    /// instance.
    #[error("timed out after {waited:?} waiting for an instance")]
    Timeout {
        /// How long the caller waited before giving up.
        waited: Duration,
    },

    /// `Factory::make` failed.
    #[error("factory failed to create an instance: {0}")]
    Create(#[source] BoxError),

    /// Activation failed on a freshly created or newly allocated instance
    /// (destroyed immediately afterward).
    #[error("instance failed activation: {0}")]
    UnableToActivate(#[source] BoxError),

    /// `Factory::validate` rejected an instance (on create, on borrow, or
    /// during an idle evictor sweep); no source error is carried since
    /// `validate` reports only a bool.
    #[error("instance failed validation")]
    UnableToValidate,

    /// Pool configuration failed `PoolConfig::validate`.
    #[error("invalid pool configuration: {0}")]
    Configuration(String),

    /// Caller misused the API: returned/invalidated a value this pool does
    /// not recognize, or returned an instance twice.
    #[error("pool misuse: {0}")]
    Misuse(String),
}

impl Error {
    /// Whether a caller could plausibly retry the operation and succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::Timeout { .. })
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn misuse(message: impl Into<String>) -> Self {
        Self::Misuse(message.into())
    }
}

/// Receives errors that the pool has chosen to swallow rather than
/// propagate (§7: destroy/passivate failures are "swallowed and reported to
/// a pluggable swallowed-exception listener").
///
/// The default listener logs via `tracing::warn!`.
pub trait SwallowedExceptionListener: Send + Sync + 'static {
    /// Called with the operation name (`"destroy"`, `"passivate"`, ...) and
    /// the error that was swallowed.
    fn on_swallowed_exception(&self, operation: &str, error: &BoxError);
}

/// Default listener: logs at `warn` level via `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSwallowedExceptionListener;

impl SwallowedExceptionListener for TracingSwallowedExceptionListener {
    fn on_swallowed_exception(&self, operation: &str, error: &BoxError) {
        tracing::warn!(operation, %error, "swallowed exception from factory callback");
    }
}
