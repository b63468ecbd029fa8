//! Per-endpoint backoff tracking.
//!
//! Each replica carries an [`EndpointState`] that decides whether it may be
//! tried right now. A failure pushes `retry_after` into the future using
//! exponential growth clamped to `[min_backoff, max_backoff]`; a success makes
//! the endpoint immediately available again.

use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Default lower bound for an endpoint backoff.
pub const DEFAULT_MIN_BACKOFF: Duration = Duration::from_secs(30);

/// Default upper bound for an endpoint backoff.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(600);

/// Exponent cap; `2^31` multiples of any sane `min_backoff` exceed `max_backoff`.
const MAX_EXPONENT: u32 = 31;

/// Exponential backoff policy for failed endpoints.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    /// Fraction of the computed interval (0.0-1.0) randomised around it.
    /// `0.0` disables jitter and makes the interval a pure function of the
    /// failure count.
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min_backoff: DEFAULT_MIN_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            jitter_factor: 0.0,
        }
    }
}

impl BackoffPolicy {
    #[must_use]
    pub fn new(min_backoff: Duration, max_backoff: Duration) -> Self {
        Self { min_backoff, max_backoff, jitter_factor: 0.0 }
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    /// Returns the backoff interval after `failures` consecutive failures.
    ///
    /// `min_backoff * 2^(failures-1)`, jittered, then clamped to
    /// `[min_backoff, max_backoff]`. Zero failures yields zero.
    #[must_use]
    pub fn interval(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let exponent = (failures - 1).min(MAX_EXPONENT);
        let base = self.min_backoff.saturating_mul(1u32 << exponent).min(self.max_backoff);

        let jittered = if self.jitter_factor > 0.0 {
            let range = base.as_secs_f64() * self.jitter_factor;
            let offset = rand::rng().random_range(0.0..=range) - range / 2.0;
            Duration::from_secs_f64((base.as_secs_f64() + offset).max(0.0))
        } else {
            base
        };

        jittered.clamp(self.min_backoff, self.max_backoff.max(self.min_backoff))
    }
}

/// Health and backoff state of one endpoint.
///
/// After every transition `consecutive_failures == 0` holds exactly when
/// `retry_after <= now`. Once a backoff expires the endpoint becomes available
/// again while keeping its failure count, so a further failure escalates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointState {
    retry_after: Instant,
    consecutive_failures: u32,
}

impl EndpointState {
    /// Creates a healthy state, available from `now`.
    #[must_use]
    pub fn new(now: Instant) -> Self {
        Self { retry_after: now, consecutive_failures: 0 }
    }

    #[must_use]
    pub fn is_available(&self, now: Instant) -> bool {
        now >= self.retry_after
    }

    #[must_use]
    pub fn retry_after(&self) -> Instant {
        self.retry_after
    }

    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Applies the outcome of one request.
    pub fn record_result(&mut self, success: bool, now: Instant, policy: &BackoffPolicy) {
        if success {
            self.consecutive_failures = 0;
            self.retry_after = now;
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.retry_after = now + policy.interval(self.consecutive_failures);
        }
    }
}
