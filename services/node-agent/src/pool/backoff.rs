//! Backoff between failed provisioning attempts.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base: Duration,

    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// No delay at all; for tests.
    pub fn none() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// Delay before retrying after `failures` consecutive failures. Zero
    /// failures means no delay.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let exp = (failures - 1).min(31) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exp);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}
