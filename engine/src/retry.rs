//! Retry policy with exponential backoff.
//!
//! A failed execution is retried only when it carries a retry hint. The delay
//! before retry `n` (0-based) is the hint when positive, otherwise
//! `base_delay * 2^n` capped at `max_delay`. No jitter is applied.

use std::time::Duration;

use membrane_core::RawEnvelope;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0 before the first retry).
    #[must_use]
    pub fn delay_for(&self, attempt: u32, retry_after: Duration) -> Duration {
        if retry_after > Duration::ZERO {
            return retry_after;
        }
        let factor = 2_u32.saturating_pow(attempt);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Parse `retry-after-ms` (milliseconds, float) or `retry-after` (seconds).
///
/// Values outside `(0, 60s)` are ignored.
#[must_use]
pub fn parse_retry_after(envelope: &RawEnvelope) -> Option<Duration> {
    let in_range = |d: Duration| d > Duration::ZERO && d < Duration::from_secs(60);

    if let Some(value) = envelope.header("retry-after-ms")
        && let Ok(ms) = value.trim().parse::<f64>()
        && ms.is_finite()
        && ms > 0.0
        && let Some(duration) = Duration::try_from_secs_f64(ms / 1000.0)
            .ok()
            .filter(|d| in_range(*d))
    {
        return Some(duration);
    }

    if let Some(value) = envelope.header("retry-after")
        && let Ok(secs) = value.trim().parse::<u64>()
    {
        let duration = Duration::from_secs(secs);
        if in_range(duration) {
            return Some(duration);
        }
    }

    None
}

/// Statuses worth retrying: request timeout, rate limiting and server errors.
#[must_use]
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}
