//! Retry policy with exponential backoff.

use std::time::Duration;

use wp_batch_common::TransportConfig;

/// Retry policy for REST requests.
///
/// 429 and 5xx responses back off exponentially; timeouts and connection
/// failures wait a fixed shorter delay. `Retry-After` is never consulted
/// because the server does not reliably send it.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first request.
    pub max_retries: u32,
    /// Initial backoff delay.
    pub base_delay: Duration,
    /// Maximum backoff delay.
    pub max_delay: Duration,
    /// Delay after a timeout or connection failure.
    pub timeout_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            timeout_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Build a policy from the transport configuration.
    #[must_use]
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_secs(config.backoff_base_secs),
            max_delay: Duration::from_secs(config.backoff_cap_secs),
            timeout_delay: Duration::from_secs(config.timeout_retry_secs),
        }
    }

    /// Backoff before retry number `attempt` (0-indexed):
    /// `min(2^attempt * base, cap)`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Check if we should retry after the given number of retries.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}
