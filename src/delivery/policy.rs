//! Immutable retry policy
//!
//! `delay(n) = min(max_delay, base_delay * factor^(n-1))` is the wait after a
//! failed attempt `n` before attempt `n + 1`. Attempt numbering starts at 1
//! and `max_retries` bounds the total number of attempts.

use std::time::Duration;
use thiserror::Error;

/// Retry policy construction errors
#[derive(Debug, Error, PartialEq)]
pub enum PolicyError {
    #[error("max_retries must be at least 1")]
    ZeroRetries,
    #[error("base delay must be greater than 0")]
    ZeroBaseDelay,
    #[error("max delay {max:?} is below base delay {base:?}")]
    MaxBelowBase { base: Duration, max: Duration },
    #[error("exponential factor must be finite and >= 1.0, got {0}")]
    InvalidFactor(f64),
}

/// How a delivery is retried
///
/// The default treats 401, 403 and 404 as terminal: those are auth and
/// unknown-device rejections that no backoff can fix. This departs from plain
/// retry-on-any-non-2xx, which [`RetryPolicy::uniform`] (or an empty
/// `retry.terminal_statuses` list in configuration) restores.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    factor: f64,
    terminal_statuses: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            factor: 2.0,
            terminal_statuses: vec![401, 403, 404],
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        factor: f64,
    ) -> Result<Self, PolicyError> {
        if max_retries == 0 {
            return Err(PolicyError::ZeroRetries);
        }
        if base_delay.is_zero() {
            return Err(PolicyError::ZeroBaseDelay);
        }
        if max_delay < base_delay {
            return Err(PolicyError::MaxBelowBase {
                base: base_delay,
                max: max_delay,
            });
        }
        if !factor.is_finite() || factor < 1.0 {
            return Err(PolicyError::InvalidFactor(factor));
        }

        Ok(Self {
            max_retries,
            base_delay,
            max_delay,
            factor,
            terminal_statuses: RetryPolicy::default().terminal_statuses,
        })
    }

    /// Replace the statuses that end a delivery without retrying.
    /// An empty list retries every non-2xx response.
    /// Default timing, retrying every non-2xx status until exhaustion
    pub fn uniform() -> Self {
        Self::default().with_terminal_statuses(Vec::new())
    }

    pub fn with_terminal_statuses(mut self, statuses: Vec<u16>) -> Self {
        self.terminal_statuses = statuses;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn terminal_statuses(&self) -> &[u16] {
        &self.terminal_statuses
    }

    pub fn is_terminal_status(&self, status: u16) -> bool {
        self.terminal_statuses.contains(&status)
    }

    /// True once `attempt` has used up the attempt budget
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_retries
    }

    /// Wait after failed attempt `attempt` (1-based) before the next one
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.max(1) - 1).unwrap_or(i32::MAX);
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        // Overflow to infinity is absorbed by the cap
        let delay_ms = (base_ms * self.factor.powi(exponent)).min(max_ms);
        Duration::from_millis(delay_ms.round() as u64)
    }
}
