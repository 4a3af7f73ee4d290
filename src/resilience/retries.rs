use std::{future::Future, time::Duration};

use bon::Builder;
use tokio::time::sleep;

use super::{
    CancelReason, Cancellation, ResilienceError,
    internal_event::{RetryAttempt, RetryAttemptData},
};

/// Exponential backoff configuration for [`with_backoff`].
///
/// The delay before retry `k` (the `k + 1`th attempt) is
/// `min(initial_delay * multiplier^(k - 1), max_delay)`, then stretched by a random
/// amount of up to `jitter_factor` of itself. Jitter only ever lengthens a delay.
///
/// | Parameter | Default |
/// |-----------|---------|
/// | `max_attempts` | 3 |
/// | `initial_delay` | 100ms |
/// | `max_delay` | 10s |
/// | `multiplier` | 2.0 |
/// | `jitter_factor` | 0.1 |
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use resilience_kit::resilience::RetryPolicy;
///
/// let policy = RetryPolicy::builder()
///     .max_attempts(5)
///     .initial_delay(Duration::from_millis(50))
///     .jitter_factor(0.0)
///     .build();
///
/// assert_eq!(policy.backoff(1), Duration::from_millis(50));
/// assert_eq!(policy.backoff(3), Duration::from_millis(200));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Builder)]
pub struct RetryPolicy {
    /// Total attempts including the first. Values below 1 mean one attempt.
    #[builder(default = 3)]
    pub(super) max_attempts: usize,

    #[builder(default = Duration::from_millis(100))]
    pub(super) initial_delay: Duration,

    /// Upper bound for a single delay before jitter.
    #[builder(default = Duration::from_secs(10))]
    pub(super) max_delay: Duration,

    #[builder(default = 2.0)]
    pub(super) multiplier: f64,

    /// Maximum extra delay as a fraction of the computed delay.
    #[builder(default = 0.1)]
    pub(super) jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Constant `delay` between attempts, no jitter.
    pub fn fixed(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Doubling delays starting at `initial_delay`, capped at
    /// `initial_delay * 2^max_attempts`, with 10% jitter.
    pub fn exponential(max_attempts: usize, initial_delay: Duration) -> Self {
        let exponent = u32::try_from(max_attempts).unwrap_or(u32::MAX).min(31);
        Self {
            max_attempts,
            initial_delay,
            max_delay: initial_delay.saturating_mul(1 << exponent),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn jitter_factor(&self) -> f64 {
        self.jitter_factor
    }

    /// Rejects negative or non-finite multipliers and jitter factors.
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if !self.multiplier.is_finite() || self.multiplier < 0.0 {
            return Err(ResilienceError::invalid_config(format!(
                "retry multiplier must be a non-negative number, got {}",
                self.multiplier
            )));
        }
        if !self.jitter_factor.is_finite() || self.jitter_factor < 0.0 {
            return Err(ResilienceError::invalid_config(format!(
                "retry jitter_factor must be a non-negative number, got {}",
                self.jitter_factor
            )));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry - 1).unwrap_or(i32::MAX);
        let nanos = self.initial_delay.as_nanos() as f64 * self.multiplier.powi(exponent);

        // NaN and infinities fall through to the cap.
        if nanos < self.max_delay.as_nanos() as f64 {
            Duration::from_nanos(nanos as u64)
        } else {
            self.max_delay
        }
    }

    fn jittered_backoff(&self, retry: u32) -> Duration {
        let base = self.backoff(retry);
        if self.jitter_factor == 0.0 || base.is_zero() {
            return base;
        }
        let extra = base.as_nanos() as f64 * self.jitter_factor * rand::random::<f64>();
        base.saturating_add(Duration::from_nanos(extra as u64))
    }

    /// The un-jittered delays between attempts, one per retry.
    pub fn delays(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            policy: *self,
            retry: 0,
        }
    }
}

/// Iterator over the capped exponential delays of a [`RetryPolicy`].
///
/// Yields `max_attempts - 1` values; the last attempt is never followed by a delay.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    policy: RetryPolicy,
    retry: u32,
}

impl ExponentialBackoff {
    /// Restarts the sequence from the first retry.
    pub fn reset(&mut self) {
        self.retry = 0;
    }
}

impl Iterator for ExponentialBackoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        let retries = self.policy.max_attempts.saturating_sub(1);
        if self.retry as usize >= retries {
            return None;
        }
        self.retry += 1;
        Some(self.policy.backoff(self.retry))
    }
}

/// Runs `operation` up to `policy.max_attempts` times, sleeping with exponential
/// backoff between failed attempts.
///
/// Returns the first successful value. When every attempt fails the result is
/// [`ResilienceError::RetryExhausted`] carrying the last attempt's error; earlier
/// errors are dropped. Cancellation is checked before each attempt and raced
/// against every delay; it yields [`ResilienceError::Cancelled`] or
/// [`ResilienceError::DeadlineExceeded`]. A running attempt is not interrupted.
pub async fn with_backoff<F, Fut, T, E>(
    cancel: &Cancellation,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, ResilienceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Into<crate::Error>,
{
    policy.validate()?;

    let max_attempts = policy.max_attempts.max(1);
    let event = RetryAttempt::register();
    let mut attempt = 1;

    loop {
        if let Some(reason) = cancel.check() {
            return Err(cancel_error(reason));
        }

        let error: crate::Error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error.into(),
        };

        if attempt >= max_attempts {
            warn!(
                message = "Retries exhausted.",
                attempts = max_attempts,
                %error,
            );
            return Err(ResilienceError::RetryExhausted {
                attempts: max_attempts,
                source: error,
            });
        }

        let delay = policy.jittered_backoff(u32::try_from(attempt).unwrap_or(u32::MAX));
        event.emit(RetryAttemptData {
            attempt: attempt + 1,
            max_attempts,
            delay,
        });
        debug!(message = "Attempt failed.", attempt, %error);

        tokio::select! {
            biased;
            reason = cancel.done() => return Err(cancel_error(reason)),
            _ = sleep(delay) => {}
        }
        attempt += 1;
    }
}

fn cancel_error(reason: CancelReason) -> ResilienceError {
    match reason {
        CancelReason::Cancelled => ResilienceError::Cancelled,
        CancelReason::DeadlineExceeded => ResilienceError::DeadlineExceeded,
    }
}
