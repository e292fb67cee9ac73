//! Handler retry policy shared by all bus implementations

use config::BusRetryConfig;
use rand::Rng;
use std::time::Duration;

/// Exponential backoff schedule with optional jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first delivery
    pub max_retries: u32,
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: bool,
}

impl RetryPolicy {
    /// Build from the bus retry config section.
    pub fn from_config(config: &BusRetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial: Duration::from_millis(config.initial_delay_ms),
            max: Duration::from_millis(config.max_delay_ms),
            factor: config.factor,
            jitter: config.jitter,
        }
    }

    /// Delay before retry number `attempt` (1-based). Jitter spreads the
    /// delay across ±25% so synchronized consumers do not stampede.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.factor.powi(attempt.saturating_sub(1) as i32);
        let base = self.initial.as_millis() as f64 * exp;
        let capped = base.min(self.max.as_millis() as f64);

        let millis = if self.jitter {
            let spread = capped * 0.25;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_millis(millis as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&BusRetryConfig::default())
    }
}
