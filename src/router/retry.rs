//! Retry policy for upstream calls

use crate::config::RetryConfig;
use crate::provider::ProviderError;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff with proportional jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts per provider, including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Fraction of the delay randomised in either direction
    pub jitter: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// Whether to try the same provider again after `attempt` (1-based) failed
    pub fn should_retry(&self, error: &ProviderError, attempt: u32) -> bool {
        attempt < self.max_attempts && error.is_transient()
    }

    /// Un-jittered delay before retry number `retry` (0-based)
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(31));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Delay before retry number `retry`, jittered and capped at `max_backoff`
    pub fn delay_for_attempt(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = 1.0 + rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64(factor).min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
