use std::{env, str::FromStr, time::Duration};

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::{CircuitBreaker, ConcurrencyLimiter, RateLimiter, ResilienceError, RetryPolicy};

/// Process-wide defaults for the resilience primitives.
///
/// Every section and field is optional when deserializing; missing values fall back
/// to the defaults below.
///
/// | Section | Field | Default |
/// |---------|-------|---------|
/// | `circuit_breaker` | `threshold` | 5 |
/// | `circuit_breaker` | `open_duration_ms` | 30000 |
/// | `rate_limiter` | `interval_ms` | 1000 |
/// | `rate_limiter` | `batch_size` | 10 |
/// | `concurrency` | `max_concurrent` | 10 |
/// | `retry` | `max_attempts` | 3 |
/// | `retry` | `initial_delay_ms` | 100 |
/// | `retry` | `max_delay_ms` | 10000 |
/// | `retry` | `multiplier` | 2.0 |
/// | `retry` | `jitter_factor` | 0.1 |
///
/// # Example
///
/// ```rust
/// use resilience_kit::resilience::ResilienceConfig;
///
/// let config = ResilienceConfig::from_json_str(
///     r#"{ "circuit_breaker": { "threshold": 2 }, "retry": { "max_attempts": 5 } }"#,
/// )
/// .unwrap();
///
/// assert_eq!(config.circuit_breaker.threshold, 2);
/// assert_eq!(config.retry_policy().max_attempts(), 5);
/// ```
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ResilienceConfig {
    pub circuit_breaker: CircuitBreakerSettings,
    pub rate_limiter: RateLimiterSettings,
    pub concurrency: ConcurrencySettings,
    pub retry: RetrySettings,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerSettings {
    pub threshold: u64,
    /// Zero disables the cool-down.
    pub open_duration_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            threshold: 5,
            open_duration_ms: 30_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimiterSettings {
    pub interval_ms: u64,
    pub batch_size: usize,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self {
            interval_ms: 1_000,
            batch_size: 10,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ConcurrencySettings {
    pub max_concurrent: usize,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self { max_concurrent: 10 }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            initial_delay_ms: policy.initial_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            multiplier: policy.multiplier,
            jitter_factor: policy.jitter_factor,
        }
    }
}

impl ResilienceConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ResilienceError> {
        serde_json::from_str(json).map_err(|error| {
            ResilienceError::invalid_config(format!("malformed resilience config: {error}"))
        })
    }

    /// Loads a `.env` file if one exists, then reads overrides from the environment.
    ///
    /// Recognized variables: `RESILIENCE_CB_THRESHOLD`, `RESILIENCE_CB_OPEN_DURATION_MS`,
    /// `RESILIENCE_RL_INTERVAL_MS`, `RESILIENCE_RL_BATCH_SIZE`,
    /// `RESILIENCE_MAX_CONCURRENT`, `RESILIENCE_RETRY_MAX_ATTEMPTS`,
    /// `RESILIENCE_RETRY_INITIAL_DELAY_MS`, `RESILIENCE_RETRY_MAX_DELAY_MS`,
    /// `RESILIENCE_RETRY_MULTIPLIER` and `RESILIENCE_RETRY_JITTER_FACTOR`.
    pub fn from_env() -> Result<Self, ResilienceError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(message = "Loaded environment file.", path = %path.display());
        }
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ResilienceError> {
        let mut config = Self::default();
        let cb = &mut config.circuit_breaker;
        override_with(&lookup, "RESILIENCE_CB_THRESHOLD", &mut cb.threshold)?;
        override_with(&lookup, "RESILIENCE_CB_OPEN_DURATION_MS", &mut cb.open_duration_ms)?;

        let rl = &mut config.rate_limiter;
        override_with(&lookup, "RESILIENCE_RL_INTERVAL_MS", &mut rl.interval_ms)?;
        override_with(&lookup, "RESILIENCE_RL_BATCH_SIZE", &mut rl.batch_size)?;

        override_with(
            &lookup,
            "RESILIENCE_MAX_CONCURRENT",
            &mut config.concurrency.max_concurrent,
        )?;

        let retry = &mut config.retry;
        override_with(&lookup, "RESILIENCE_RETRY_MAX_ATTEMPTS", &mut retry.max_attempts)?;
        override_with(&lookup, "RESILIENCE_RETRY_INITIAL_DELAY_MS", &mut retry.initial_delay_ms)?;
        override_with(&lookup, "RESILIENCE_RETRY_MAX_DELAY_MS", &mut retry.max_delay_ms)?;
        override_with(&lookup, "RESILIENCE_RETRY_MULTIPLIER", &mut retry.multiplier)?;
        override_with(&lookup, "RESILIENCE_RETRY_JITTER_FACTOR", &mut retry.jitter_factor)?;

        Ok(config)
    }

    pub fn circuit_breaker(&self) -> CircuitBreaker {
        CircuitBreaker::new(
            self.circuit_breaker.threshold,
            Duration::from_millis(self.circuit_breaker.open_duration_ms),
        )
    }

    /// Must be called from within a tokio runtime.
    pub fn rate_limiter(&self) -> Result<RateLimiter, ResilienceError> {
        RateLimiter::new(
            Duration::from_millis(self.rate_limiter.interval_ms),
            self.rate_limiter.batch_size,
        )
    }

    /// Like [`ResilienceConfig::rate_limiter`], stopped when `parent` is cancelled.
    pub fn rate_limiter_with_parent(
        &self,
        parent: &CancellationToken,
    ) -> Result<RateLimiter, ResilienceError> {
        RateLimiter::with_parent(
            parent,
            Duration::from_millis(self.rate_limiter.interval_ms),
            self.rate_limiter.batch_size,
        )
    }

    pub fn concurrency_limiter(&self) -> Result<ConcurrencyLimiter, ResilienceError> {
        ConcurrencyLimiter::new(self.concurrency.max_concurrent)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(self.retry.max_attempts)
            .initial_delay(Duration::from_millis(self.retry.initial_delay_ms))
            .max_delay(Duration::from_millis(self.retry.max_delay_ms))
            .multiplier(self.retry.multiplier)
            .jitter_factor(self.retry.jitter_factor)
            .build()
    }
}

fn override_with<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> Result<(), ResilienceError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(());
    };
    *target = raw.trim().parse().map_err(|error: T::Err| {
        ResilienceError::invalid_config(format!("{key}={raw:?}: {error}"))
    })?;
    Ok(())
}
