use std::time::Duration;

use metrics::{Counter, Histogram, counter, histogram};

#[derive(Clone, Copy, Debug)]
pub(crate) struct RefillData {
    pub issued: u64,
    pub discarded: u64,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct RetryAttemptData {
    pub attempt: usize,
    pub max_attempts: usize,
    pub delay: Duration,
}

registered_event! {
    CircuitBreakerTripped => {
        tripped: Counter = counter!("circuit_breaker_tripped_total"),
    }

    fn emit(&self, failures: u64) {
        self.tripped.increment(1);
        warn!(
            target: "resilience::circuit_breaker",
            failures,
            "Circuit breaker opened."
        );
    }
}

registered_event! {
    CircuitBreakerRejected => {
        rejected: Counter = counter!("circuit_breaker_rejected_total"),
    }

    fn emit(&self, failures: u64) {
        self.rejected.increment(1);
        debug!(
            target: "resilience::circuit_breaker",
            failures,
            "Rejected call while circuit is open."
        );
    }
}

registered_event! {
    RateLimiterRefill => {
        issued: Counter = counter!("rate_limiter_tokens_issued_total"),
        // Tokens dropped because the bucket was already full. Expected while idle.
        discarded: Counter = counter!("rate_limiter_tokens_discarded_total"),
    }

    fn emit(&self, data: RefillData) {
        self.issued.increment(data.issued);
        self.discarded.increment(data.discarded);
        trace!(
            target: "resilience::rate_limiter",
            issued = data.issued,
            discarded = data.discarded,
            "Bucket refilled."
        );
    }
}

registered_event! {
    ConcurrencyLimiterInFlight => {
        in_flight: Histogram = histogram!("concurrency_limiter_in_flight"),
    }

    fn emit(&self, in_flight: u64) {
        self.in_flight.record(in_flight as f64);
        trace!(target: "resilience::concurrency", in_flight, "In-flight updated.");
    }
}

registered_event! {
    RetryAttempt => {
        retries: Counter = counter!("retry_attempts_total"),
        backoff: Histogram = histogram!("retry_backoff_seconds"),
    }

    fn emit(&self, data: RetryAttemptData) {
        self.retries.increment(1);
        self.backoff.record(data.delay);
        debug!(
            target: "resilience::retry",
            attempt = data.attempt,
            max_attempts = data.max_attempts,
            delay_ms = %data.delay.as_millis(),
            "Retrying operation after backoff."
        );
    }
}
