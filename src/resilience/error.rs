use crate::Error as CrateError;
use snafu::Snafu;

/// Errors returned by the resilience primitives.
///
/// Admission failures (`CircuitOpen`, `RateLimitTimeout`, `ConcurrencyLimitTimeout`,
/// `Closed`, `Cancelled`, `DeadlineExceeded`) mean the wrapped operation never ran.
/// They are not bugs in the operation and should not be reported as such.
#[derive(Debug, Snafu)]
pub enum ResilienceError {
    /// The circuit breaker refused to run the operation.
    #[snafu(display("circuit breaker is open"))]
    CircuitOpen,

    /// The deadline passed before the rate limiter issued a token.
    #[snafu(display("rate limit wait timed out before a token was available"))]
    RateLimitTimeout,

    /// The deadline passed before a concurrency slot became free.
    #[snafu(display("concurrency limit wait timed out before a slot was available"))]
    ConcurrencyLimitTimeout,

    /// The primitive was closed before or while waiting.
    #[snafu(display("{} is closed", resource))]
    Closed { resource: &'static str },

    /// Every retry attempt failed; `source` is the error of the last attempt.
    #[snafu(display("retries exhausted after {} attempt(s): {}", attempts, source))]
    RetryExhausted { attempts: usize, source: CrateError },

    /// The caller's cancellation token fired.
    #[snafu(display("operation cancelled"))]
    Cancelled,

    /// The caller's deadline passed.
    #[snafu(display("deadline exceeded"))]
    DeadlineExceeded,

    /// A primitive was constructed with values it cannot honor.
    #[snafu(display("invalid configuration: {}", details))]
    InvalidConfig { details: String },

    /// The wrapped operation ran and returned its own error.
    #[snafu(display("{}", source))]
    Operation { source: CrateError },
}

impl ResilienceError {
    /// Wraps an operation's error. A `ResilienceError` coming from a nested
    /// primitive is passed through as-is instead of being wrapped again.
    pub(crate) fn operation(error: impl Into<CrateError>) -> Self {
        match error.into().downcast::<ResilienceError>() {
            Ok(nested) => *nested,
            Err(source) => ResilienceError::Operation { source },
        }
    }

    pub(crate) fn invalid_config(details: impl Into<String>) -> Self {
        ResilienceError::InvalidConfig {
            details: details.into(),
        }
    }

    /// Returns `true` when the wrapped operation was never invoked.
    pub const fn is_admission_failure(&self) -> bool {
        matches!(
            self,
            ResilienceError::CircuitOpen
                | ResilienceError::RateLimitTimeout
                | ResilienceError::ConcurrencyLimitTimeout
                | ResilienceError::Closed { .. }
                | ResilienceError::Cancelled
                | ResilienceError::DeadlineExceeded
        )
    }

    pub const fn is_circuit_open(&self) -> bool {
        matches!(self, ResilienceError::CircuitOpen)
    }

    pub const fn is_closed(&self) -> bool {
        matches!(self, ResilienceError::Closed { .. })
    }

    /// Borrows the operation's own error, if this error carries one.
    pub fn operation_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            ResilienceError::Operation { source }
            | ResilienceError::RetryExhausted { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }

    /// Unwraps the operation's own error, if this error carries one.
    pub fn into_operation_error(self) -> Option<CrateError> {
        match self {
            ResilienceError::Operation { source }
            | ResilienceError::RetryExhausted { source, .. } => Some(source),
            _ => None,
        }
    }
}
