//! Admission-control primitives and their shared vocabulary.
//!
//! Each primitive wraps a caller-supplied async operation and either runs it or
//! refuses with a [`ResilienceError`] explaining why it never ran:
//!
//! | Primitive | Refuses with |
//! |-----------|--------------|
//! | [`CircuitBreaker`] | `CircuitOpen` |
//! | [`RateLimiter`] | `RateLimitTimeout`, `Cancelled`, `Closed` |
//! | [`ConcurrencyLimiter`] | `ConcurrencyLimitTimeout`, `Cancelled`, `Closed` |
//! | [`with_backoff`] | `RetryExhausted`, `Cancelled`, `DeadlineExceeded` |
//!
//! None of them depends on another; they compose by nesting closures.

mod cancel;
mod circuit_breaker;
mod concurrency;
pub mod config;
mod error;
mod internal_event;
mod rate_limiter;
pub mod retries;
pub mod service;

pub use cancel::{CancelReason, Cancellation};
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use concurrency::ConcurrencyLimiter;
pub use config::ResilienceConfig;
pub use error::ResilienceError;
pub use rate_limiter::RateLimiter;
pub use retries::{ExponentialBackoff, RetryPolicy, with_backoff};
pub use service::{CircuitBreakerLayer, CircuitBreakerService};
