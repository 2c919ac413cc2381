//! Retry logic with exponential backoff.
//!
//! Decides whether a failed chunk attempt is retried and how long to wait.

use crate::config::RetryConfig;
use crate::error::UploadError;
use std::time::Duration;

/// Retry strategy configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts is `max_retries + 1`
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
        }
    }
}

impl RetryPolicy {
    /// Whether another attempt is allowed after `failed_attempts` failures
    pub fn should_retry(&self, error: &UploadError, failed_attempts: u32) -> bool {
        // Never retry client-side or otherwise permanent failures
        if !error.recoverable {
            return false;
        }

        failed_attempts <= self.max_retries
    }

    /// Delay before retry number `retry` (1-based):
    /// `min(base * multiplier^(retry-1), max)`
    pub fn calculate_backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let factor = self.backoff_multiplier.powi(exponent);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}
